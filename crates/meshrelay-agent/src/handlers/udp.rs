// ============================================
// File: crates/meshrelay-agent/src/handlers/udp.rs
// ============================================
//! # UDP Association Handlers
//!
//! ## Creation Reason
//! Relays UDP as sealed datagrams over an association that is set up
//! once per ingress flow, with the same key exchange streams use.
//!
//! ## Main Functionality
//! - `RelayDispatcher::open_udp`: ingress open (remote or local exit)
//! - `UDP_*` frame handlers for transit and exit
//! - Exit socket receive loop
//! - `UdpAssociationHandle`: the caller's send / receive end
//!
//! ## Datagram Path
//! ```text
//! handle.send_to(d, T) ─seal─► UDP_DATAGRAM{T} ─► ... ─► exit: open ─► socket.send_to(T)
//! handle.recv_from()  ◄─open─ UDP_DATAGRAM{S} ◄─ ... ◄─ exit: seal ◄─ socket.recv_from() = S
//! ```
//!
//! ## ⚠️ Important Note for Next Developer
//! - Datagrams are best effort end to end: every queue on the path uses
//!   `try_send` and drops on overflow
//! - The open carries the caller's hint, not a fixed destination. Every
//!   hop routes it with the hint; without one, a hop owning any exit
//!   prefix accepts it and the others follow the default route.
//! - A datagram that would not fit one frame is dropped, not split
//!
//! ## Last Modified
//! v0.1.0 - Initial UDP association handlers

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

use meshrelay_common::{AgentId, RequestId};
use meshrelay_core::crypto::{respond, InitiatorHandshake, SEAL_OVERHEAD};
use meshrelay_core::protocol::{
    CloseReason, ErrorCode, Payload, RawFrame, TargetAddr, UdpClose, UdpDatagram, UdpOpen,
    UdpOpenAck, UdpOpenErr,
};
use meshrelay_transport::DatagramSocket;

use crate::error::{AgentError, Result};
use crate::handlers::dispatcher::RelayDispatcher;
use crate::services::slots::REPLY_BIT;
use crate::services::stream::{Leg, Side};
use crate::services::udp::{NewAssociation, PendingUdpOpen};
use crate::services::{AssociationEntry, AssociationRole, ReceivedDatagram, Route};

/// Receive buffer of an exit socket; the largest UDP payload.
const UDP_RECV_BUFFER: usize = 65_535;

// ============================================
// UdpAssociationHandle
// ============================================

/// Caller's end of a UDP association.
///
/// Dropping the handle releases the association.
pub struct UdpAssociationHandle {
    dispatcher: Arc<RelayDispatcher>,
    entry: Arc<AssociationEntry>,
    inbound: mpsc::Receiver<ReceivedDatagram>,
    bound_addr: SocketAddr,
}

impl UdpAssociationHandle {
    /// End-to-end id.
    #[must_use]
    pub fn request_id(&self) -> RequestId {
        self.entry.request_id()
    }

    /// Local address of the exit's UDP socket.
    #[must_use]
    pub const fn bound_addr(&self) -> SocketAddr {
        self.bound_addr
    }

    /// Sends `payload` to `target` from the exit's socket.
    ///
    /// Returns once the datagram is queued; delivery is not confirmed.
    ///
    /// # Errors
    /// - `ShuttingDown` after the association was closed
    /// - `ResourceLimit` if the datagram does not fit one frame
    pub async fn send_to(&self, payload: &[u8], target: &TargetAddr) -> Result<()> {
        if self.entry.cancel_token().is_cancelled() {
            return Err(AgentError::ShuttingDown);
        }
        self.entry.touch();

        if self.entry.role() == AssociationRole::LocalExit {
            let socket = self.entry.socket().ok_or(AgentError::ShuttingDown)?;
            socket.send_to(payload, target).await?;
            return Ok(());
        }

        self.dispatcher.check_datagram_size(target, payload.len())?;
        let sealed = self.entry.seal(payload)?;
        let Some((peer, wire_id)) = self.entry.wire_to(Side::Downstream) else {
            return Err(AgentError::internal("ingress association without next hop"));
        };
        let datagram = UdpDatagram {
            target: target.clone(),
            sealed: Bytes::from(sealed),
        };
        if !self.dispatcher.try_send_to(peer, datagram.to_frame(wire_id)) {
            trace!(request_id = %self.entry.request_id(), "Datagram dropped, peer queue full");
        }
        Ok(())
    }

    /// Next datagram from the exit, or `None` once the association closed.
    pub async fn recv_from(&mut self) -> Option<ReceivedDatagram> {
        let datagram = self.inbound.recv().await?;
        self.entry.touch();
        Some(datagram)
    }

    /// Releases the association and tells the exit.
    pub async fn close(self) {
        self.dispatcher
            .close_association(&self.entry, CloseReason::Normal, None)
            .await;
    }
}

impl Drop for UdpAssociationHandle {
    fn drop(&mut self) {
        // The watcher task finishes the release.
        self.entry.cancel_token().cancel();
    }
}

impl std::fmt::Debug for UdpAssociationHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UdpAssociationHandle")
            .field("entry", &self.entry)
            .field("bound_addr", &self.bound_addr)
            .finish_non_exhaustive()
    }
}

// ============================================
// Ingress Open
// ============================================

impl RelayDispatcher {
    /// Opens a UDP association.
    ///
    /// `hint` travels with the open and steers it at every hop: a literal
    /// IP uses longest-prefix match, anything else the default route.
    /// Without a hint the association exits at the first agent that owns
    /// any exit prefix.
    ///
    /// # Errors
    /// - `NoRoute` if no route serves the hint
    /// - `ResourceLimit` at the association limit
    /// - `OpenRejected` / `OpenTimeout` as for streams
    pub async fn open_udp(
        self: &Arc<Self>,
        hint: Option<TargetAddr>,
    ) -> Result<UdpAssociationHandle> {
        self.ensure_running()?;
        let route = self.association_route(hint.as_ref()).ok_or_else(|| {
            AgentError::no_route(hint.as_ref().map_or_else(|| "default".to_string(), ToString::to_string))
        })?;
        let request_id = RequestId::generate();
        let (tx, rx) = mpsc::channel(self.settings.stream_buffer_frames);

        let (entry, bound_addr) = if route.is_local() {
            self.open_local_udp(request_id, tx).await?
        } else {
            self.open_remote_udp(request_id, route.next_hop, hint, tx).await?
        };

        self.spawn_association_watcher(&entry);
        Ok(UdpAssociationHandle {
            dispatcher: Arc::clone(self),
            entry,
            inbound: rx,
            bound_addr,
        })
    }

    /// Route an association open takes at this hop.
    fn association_route(&self, hint: Option<&TargetAddr>) -> Option<Route> {
        match hint {
            Some(target) => self.routes.lookup_target(target),
            None => self
                .routes
                .local_routes()
                .into_iter()
                .next()
                .or_else(|| self.routes.lookup_default()),
        }
    }

    async fn open_local_udp(
        self: &Arc<Self>,
        request_id: RequestId,
        tx: mpsc::Sender<ReceivedDatagram>,
    ) -> Result<(Arc<AssociationEntry>, SocketAddr)> {
        let entry = self.associations.allocate(NewAssociation {
            request_id,
            role: AssociationRole::LocalExit,
            upstream: None,
            downstream: None,
        })?;
        let socket = match self.dialer.bind_udp().await {
            Ok(socket) => socket,
            Err(e) => {
                self.associations.remove(entry.id());
                return Err(e.into());
            }
        };
        let bound_addr = socket.local_addr()?;
        entry.set_inbound(tx);
        entry.set_socket(Arc::clone(&socket));
        entry.mark_open();
        debug!(request_id = %request_id, bound_addr = %bound_addr, "Association exits locally");

        let this = Arc::clone(self);
        let local = Arc::clone(&entry);
        tokio::spawn(async move { this.run_socket_loop(local, socket).await });
        Ok((entry, bound_addr))
    }

    async fn open_remote_udp(
        self: &Arc<Self>,
        request_id: RequestId,
        next_hop: AgentId,
        hint: Option<TargetAddr>,
        tx: mpsc::Sender<ReceivedDatagram>,
    ) -> Result<(Arc<AssociationEntry>, SocketAddr)> {
        let peer = self
            .peers
            .get(&next_hop)
            .ok_or(AgentError::PeerNotFound(next_hop))?;
        let entry = self.associations.allocate(NewAssociation {
            request_id,
            role: AssociationRole::Ingress,
            upstream: None,
            downstream: Some(next_hop),
        })?;
        entry.set_inbound(tx);

        let handshake = InitiatorHandshake::new(request_id);
        let open = UdpOpen {
            request_id,
            initiator_pub: handshake.public_key(),
            hint,
        };
        let (reply_tx, reply_rx) = oneshot::channel();
        entry.set_pending(PendingUdpOpen {
            handshake,
            reply: reply_tx,
        });
        debug!(
            request_id = %request_id,
            next_hop = %next_hop,
            association_id = entry.id(),
            "Opening UDP association"
        );

        if let Err(e) = peer.send(open.to_frame(entry.id())).await {
            self.associations.remove(entry.id());
            return Err(e);
        }

        match tokio::time::timeout(self.settings.open_timeout, reply_rx).await {
            Ok(Ok(Ok(bound_addr))) => Ok((entry, bound_addr)),
            Ok(Ok(Err(e))) => Err(e),
            Ok(Err(_)) => Err(AgentError::StreamReset {
                code: ErrorCode::Cancelled,
            }),
            Err(_) => {
                self.close_association(&entry, CloseReason::Timeout, None)
                    .await;
                Err(AgentError::OpenTimeout)
            }
        }
    }

    /// Closes the association once its handle is dropped.
    fn spawn_association_watcher(self: &Arc<Self>, entry: &Arc<AssociationEntry>) {
        let this = Arc::clone(self);
        let entry = Arc::clone(entry);
        tokio::spawn(async move {
            entry.cancel_token().cancelled().await;
            if this.associations.get(entry.id()).is_some() {
                this.close_association(&entry, CloseReason::Normal, None)
                    .await;
            }
        });
    }

    /// Largest plaintext that fits one `UDP_DATAGRAM` toward `target`.
    pub(crate) fn check_datagram_size(&self, target: &TargetAddr, len: usize) -> Result<()> {
        let limit = self
            .settings
            .max_frame_payload
            .saturating_sub(target.encoded_len() + SEAL_OVERHEAD);
        if len > limit {
            return Err(AgentError::ResourceLimit {
                resource: "datagram size",
                limit,
            });
        }
        Ok(())
    }

    // ========================================
    // UDP_OPEN
    // ========================================

    pub(crate) async fn handle_udp_open(self: &Arc<Self>, from: AgentId, frame: RawFrame) {
        let wire_id = frame.stream_id;
        if wire_id == 0 || wire_id & REPLY_BIT != 0 {
            warn!(peer = %from, stream_id = wire_id, "UDP_OPEN with invalid id");
            return;
        }
        let open = match UdpOpen::from_bytes(frame.payload.clone()) {
            Ok(open) => open,
            Err(e) => {
                warn!(peer = %from, error = %e, "Malformed UDP_OPEN");
                return;
            }
        };

        // Split horizon as for streams.
        let next_hop = match self.association_route(open.hint.as_ref()) {
            Some(route) if route.is_local() => None,
            Some(route) if route.next_hop != from && self.peers.get(&route.next_hop).is_some() => {
                Some(route.next_hop)
            }
            _ => {
                let wanted = open
                    .hint
                    .as_ref()
                    .map_or_else(|| "default".to_string(), ToString::to_string);
                debug!(
                    peer = %from,
                    request_id = %open.request_id,
                    hint = %wanted,
                    "No route for association"
                );
                let err = UdpOpenErr {
                    request_id: open.request_id,
                    code: ErrorCode::NoRoute,
                    message: format!("no route to {wanted}"),
                };
                self.send_to(from, err.to_frame(wire_id | REPLY_BIT)).await;
                return;
            }
        };

        let role = if next_hop.is_some() {
            AssociationRole::Transit
        } else {
            AssociationRole::Exit
        };
        let entry = match self.associations.allocate(NewAssociation {
            request_id: open.request_id,
            role,
            upstream: Some(Leg {
                peer: from,
                id: wire_id,
            }),
            downstream: next_hop,
        }) {
            Ok(entry) => entry,
            Err(e) => {
                let err = UdpOpenErr {
                    request_id: open.request_id,
                    code: e.error_code(),
                    message: e.to_string(),
                };
                self.send_to(from, err.to_frame(wire_id | REPLY_BIT)).await;
                return;
            }
        };

        match next_hop {
            Some(next) => {
                debug!(
                    request_id = %open.request_id,
                    from = %from,
                    to = %next,
                    "Relaying UDP open"
                );
                if !self.send_to(next, frame.with_stream_id(entry.id())).await {
                    self.associations.remove(entry.id());
                    let err = UdpOpenErr {
                        request_id: open.request_id,
                        code: ErrorCode::PeerLost,
                        message: "next hop unavailable".into(),
                    };
                    self.send_to(from, err.to_frame(wire_id | REPLY_BIT)).await;
                }
            }
            None => {
                let this = Arc::clone(self);
                tokio::spawn(async move { this.run_exit_udp_open(entry, open).await });
            }
        }
    }

    async fn run_exit_udp_open(self: Arc<Self>, entry: Arc<AssociationEntry>, open: UdpOpen) {
        let Some((upstream, reply_id)) = entry.wire_to(Side::Upstream) else {
            return;
        };
        let fail = |code: ErrorCode, message: String| UdpOpenErr {
            request_id: open.request_id,
            code,
            message,
        };

        let socket = match self.dialer.bind_udp().await {
            Ok(socket) => socket,
            Err(e) => {
                let err = AgentError::from(e);
                warn!(request_id = %open.request_id, error = %err, "Exit UDP bind failed");
                self.associations.remove(entry.id());
                let reply = fail(err.error_code(), err.to_string());
                self.send_to(upstream, reply.to_frame(reply_id)).await;
                return;
            }
        };
        let bound_addr = match socket.local_addr() {
            Ok(addr) => addr,
            Err(e) => {
                self.associations.remove(entry.id());
                let reply = fail(ErrorCode::General, e.to_string());
                self.send_to(upstream, reply.to_frame(reply_id)).await;
                return;
            }
        };
        let (cipher, responder_pub) = match respond(open.request_id, &open.initiator_pub) {
            Ok(pair) => pair,
            Err(e) => {
                warn!(request_id = %open.request_id, error = %e, "Association key exchange failed");
                self.associations.remove(entry.id());
                let reply = fail(ErrorCode::Protocol, "key exchange failed".into());
                self.send_to(upstream, reply.to_frame(reply_id)).await;
                return;
            }
        };

        if self.associations.get(entry.id()).is_none() {
            // Closed while binding.
            return;
        }
        let (sealer, opener) = cipher.split();
        entry.set_cipher(sealer, opener);
        entry.set_socket(Arc::clone(&socket));
        entry.mark_open();

        let ack = UdpOpenAck {
            request_id: open.request_id,
            bound_addr: bound_addr.into(),
            responder_pub,
        };
        if !self.send_to(upstream, ack.to_frame(reply_id)).await {
            self.close_association(&entry, CloseReason::PeerLost, Some(Side::Upstream))
                .await;
            return;
        }
        debug!(
            request_id = %open.request_id,
            bound_addr = %bound_addr,
            "Association exit bound"
        );
        self.run_socket_loop(entry, socket).await;
    }

    /// Reads the exit socket until the association is released and
    /// delivers each datagram toward the ingress.
    async fn run_socket_loop(
        self: Arc<Self>,
        entry: Arc<AssociationEntry>,
        socket: Arc<dyn DatagramSocket>,
    ) {
        let mut buf = vec![0u8; UDP_RECV_BUFFER];
        loop {
            let received = tokio::select! {
                () = entry.cancel_token().cancelled() => return,
                received = socket.recv_from(&mut buf) => received,
            };
            let (n, from) = match received {
                Ok(received) => received,
                Err(e) => {
                    debug!(request_id = %entry.request_id(), error = %e, "Exit socket failed");
                    self.close_association(&entry, CloseReason::Error, None).await;
                    return;
                }
            };
            entry.touch();
            let source = TargetAddr::from(from);

            if entry.role() == AssociationRole::LocalExit {
                if let Some(inbound) = entry.inbound() {
                    let datagram = ReceivedDatagram {
                        payload: Bytes::copy_from_slice(&buf[..n]),
                        from: source,
                    };
                    if inbound.try_send(datagram).is_err() {
                        trace!(request_id = %entry.request_id(), "Inbound queue full, datagram dropped");
                    }
                }
                continue;
            }

            if self.check_datagram_size(&source, n).is_err() {
                trace!(request_id = %entry.request_id(), len = n, "Datagram too large to relay");
                continue;
            }
            let sealed = match entry.seal(&buf[..n]) {
                Ok(sealed) => sealed,
                Err(e) => {
                    warn!(request_id = %entry.request_id(), error = %e, "Seal failed");
                    self.close_association(&entry, CloseReason::Error, None).await;
                    return;
                }
            };
            let Some((peer, wire_id)) = entry.wire_to(Side::Upstream) else {
                return;
            };
            let datagram = UdpDatagram {
                target: source,
                sealed: Bytes::from(sealed),
            };
            if !self.try_send_to(peer, datagram.to_frame(wire_id)) {
                trace!(request_id = %entry.request_id(), "Peer queue full, datagram dropped");
            }
        }
    }

    // ========================================
    // UDP_OPEN_ACK / UDP_OPEN_ERR
    // ========================================

    pub(crate) async fn handle_udp_open_ack(self: &Arc<Self>, from: AgentId, frame: RawFrame) {
        let Some((entry, Side::Downstream)) = self.associations.resolve(from, frame.stream_id)
        else {
            return;
        };
        if entry.is_open() {
            return;
        }

        match entry.role() {
            AssociationRole::Transit => {
                entry.mark_open();
                if let Some((peer, wire_id)) = entry.wire_to(Side::Upstream) {
                    if !self.send_to(peer, frame.with_stream_id(wire_id)).await {
                        self.close_association(&entry, CloseReason::PeerLost, Some(Side::Upstream))
                            .await;
                    }
                }
            }
            AssociationRole::Ingress => {
                let Some(pending) = entry.take_pending() else {
                    return;
                };
                let ack = match UdpOpenAck::from_bytes(frame.payload) {
                    Ok(ack) if ack.request_id == entry.request_id() => ack,
                    Ok(_) | Err(_) => {
                        let _ = pending.reply.send(Err(AgentError::protocol("bad udp open ack")));
                        self.close_association(&entry, CloseReason::Error, None).await;
                        return;
                    }
                };
                match pending.handshake.complete(&ack.responder_pub) {
                    Ok(cipher) => {
                        let (sealer, opener) = cipher.split();
                        entry.set_cipher(sealer, opener);
                        entry.mark_open();
                        let bound_addr = ack
                            .bound_addr
                            .socket_addr()
                            .unwrap_or_else(|| SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0));
                        if pending.reply.send(Ok(bound_addr)).is_err() {
                            self.close_association(&entry, CloseReason::Normal, None).await;
                        }
                    }
                    Err(e) => {
                        let _ = pending.reply.send(Err(e.into()));
                        self.close_association(&entry, CloseReason::Error, None).await;
                    }
                }
            }
            AssociationRole::Exit | AssociationRole::LocalExit => {}
        }
    }

    pub(crate) async fn handle_udp_open_err(self: &Arc<Self>, from: AgentId, frame: RawFrame) {
        let Some((entry, Side::Downstream)) = self.associations.resolve(from, frame.stream_id)
        else {
            return;
        };
        if entry.is_open() {
            return;
        }
        self.associations.remove(entry.id());

        match entry.role() {
            AssociationRole::Transit => {
                if let Some((peer, wire_id)) = entry.wire_to(Side::Upstream) {
                    self.send_to(peer, frame.with_stream_id(wire_id)).await;
                }
            }
            AssociationRole::Ingress => {
                let err = match UdpOpenErr::from_bytes(frame.payload) {
                    Ok(err) => AgentError::OpenRejected {
                        code: err.code,
                        message: err.message,
                    },
                    Err(e) => e.into(),
                };
                debug!(request_id = %entry.request_id(), error = %err, "UDP open rejected");
                if let Some(pending) = entry.take_pending() {
                    let _ = pending.reply.send(Err(err));
                }
            }
            AssociationRole::Exit | AssociationRole::LocalExit => {}
        }
    }

    // ========================================
    // UDP_DATAGRAM
    // ========================================

    pub(crate) async fn handle_udp_datagram(self: &Arc<Self>, from: AgentId, frame: RawFrame) {
        let Some((entry, side)) = self.associations.resolve(from, frame.stream_id) else {
            trace!(peer = %from, stream_id = frame.stream_id, "Datagram for unknown association");
            return;
        };
        if !entry.is_open() {
            return;
        }
        entry.touch();

        if entry.role() == AssociationRole::Transit {
            if let Some((peer, wire_id)) = entry.wire_to(side.opposite()) {
                if !self.try_send_to(peer, frame.with_stream_id(wire_id)) {
                    trace!(request_id = %entry.request_id(), "Transit datagram dropped");
                }
            }
            return;
        }

        let datagram = match UdpDatagram::from_bytes(frame.payload) {
            Ok(datagram) => datagram,
            Err(e) => {
                warn!(peer = %from, error = %e, "Malformed UDP_DATAGRAM");
                return;
            }
        };
        let plaintext = match entry.open(&datagram.sealed) {
            Ok(plaintext) => plaintext,
            Err(e) => {
                warn!(
                    request_id = %entry.request_id(),
                    error = %e,
                    "Datagram failed to decrypt, closing association"
                );
                self.close_association(&entry, CloseReason::Error, None).await;
                return;
            }
        };

        match entry.role() {
            AssociationRole::Exit => {
                let Some(socket) = entry.socket() else {
                    return;
                };
                if let Err(e) = socket.send_to(&plaintext, &datagram.target).await {
                    debug!(
                        request_id = %entry.request_id(),
                        target = %datagram.target,
                        error = %e,
                        "Exit send failed"
                    );
                }
            }
            AssociationRole::Ingress => {
                if let Some(inbound) = entry.inbound() {
                    let received = ReceivedDatagram {
                        payload: Bytes::from(plaintext),
                        from: datagram.target,
                    };
                    if inbound.try_send(received).is_err() {
                        trace!(request_id = %entry.request_id(), "Inbound queue full, datagram dropped");
                    }
                }
            }
            AssociationRole::Transit | AssociationRole::LocalExit => {}
        }
    }

    // ========================================
    // UDP_CLOSE
    // ========================================

    pub(crate) async fn handle_udp_close(self: &Arc<Self>, from: AgentId, frame: RawFrame) {
        let Some((entry, side)) = self.associations.resolve(from, frame.stream_id) else {
            return;
        };
        let reason = UdpClose::from_bytes(frame.payload.clone())
            .map_or(CloseReason::Error, |close| close.reason);
        debug!(
            request_id = %entry.request_id(),
            reason = %reason,
            "Association closed by peer"
        );
        self.close_association(&entry, reason, Some(side)).await;
    }

    /// Releases `entry` and sends `UDP_CLOSE` on every leg but `skip`.
    pub(crate) async fn close_association(
        &self,
        entry: &Arc<AssociationEntry>,
        reason: CloseReason,
        skip: Option<Side>,
    ) {
        if self.associations.remove(entry.id()).is_none() {
            return;
        }
        if let Some(pending) = entry.take_pending() {
            let err = match reason {
                CloseReason::Timeout => AgentError::OpenTimeout,
                CloseReason::PeerLost => AgentError::StreamReset {
                    code: ErrorCode::PeerLost,
                },
                CloseReason::Normal | CloseReason::Error => AgentError::StreamReset {
                    code: ErrorCode::Cancelled,
                },
            };
            let _ = pending.reply.send(Err(err));
        }

        let close = UdpClose { reason };
        for side in [Side::Upstream, Side::Downstream] {
            if Some(side) == skip {
                continue;
            }
            if let Some((peer, wire_id)) = entry.wire_to(side) {
                self.send_to(peer, close.to_frame(wire_id)).await;
            }
        }
    }
}

// ============================================
// Tests
// ============================================
