// ============================================
// File: crates/meshrelay-agent/src/handlers/stream.rs
// ============================================
//! # Stream Handlers
//!
//! ## Creation Reason
//! Everything that moves a virtual TCP stream through its lifecycle at
//! one hop: opening it from the ingress API, relaying it as transit,
//! dialing it as exit, and pumping bytes between the session cipher and
//! the local endpoint.
//!
//! ## Main Functionality
//! - `RelayDispatcher::open_stream`: ingress open with key exchange
//! - `STREAM_*` frame handlers
//! - Endpoint pumps (reader: endpoint → seal → peer; writer: peer → open
//!   → endpoint)
//! - `StreamHandle`: the caller's `AsyncRead + AsyncWrite` end
//!
//! ## Endpoint Data Path
//! ```text
//!   StreamHandle ═ duplex ═ reader pump ─seal─► STREAM_DATA ─► peer queue
//!                         ╚ writer pump ◄─open─ [stream buffer] ◄─ dispatcher
//! ```
//!
//! ## Flow Control
//! Each endpoint grants its peer a window of `stream_buffer_frames`
//! `STREAM_DATA` frames with `STREAM_WINDOW`, and grants more as the
//! writer pump drains its buffer. The reader pump spends one credit per
//! frame, `FIN_WRITE` included. The dispatcher therefore feeds the
//! stream buffer with `try_send`; a full buffer means the far endpoint
//! overran its window and only that stream is reset.
//!
//! ## ⚠️ Important Note for Next Developer
//! - Transit hops never construct a cipher; payloads pass untouched
//! - An empty `STREAM_DATA` carries flags only and is never decrypted
//! - Both endpoints send `STREAM_CLOSE` when their stream reaches
//!   `Closed`; the second one finds nothing and is ignored
//!
//! ## Last Modified
//! v0.1.0 - Initial stream handlers

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream, ReadBuf};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

use meshrelay_common::{AgentId, RequestId};
use meshrelay_core::crypto::{respond, InitiatorHandshake, Opener, Sealer, SessionCipher};
use meshrelay_core::protocol::{
    ErrorCode, Flags, Frame, FrameType, Payload, RawFrame, StreamOpen, StreamOpenAck,
    StreamOpenErr, StreamReset, StreamWindow, TargetAddr,
};

use crate::error::{AgentError, Result};
use crate::handlers::dispatcher::RelayDispatcher;
use crate::services::slots::REPLY_BIT;
use crate::services::stream::{
    InboundData, Leg, NewStream, PendingOpen, Side, StreamEntry, StreamEvent, StreamRole,
    StreamState,
};

/// Capacity of the in-process pipe behind a `StreamHandle`.
const HANDLE_PIPE_CAPACITY: usize = 64 * 1024;

// ============================================
// StreamHandle
// ============================================

/// Caller's end of an opened stream.
///
/// Bytes written are relayed to the destination; bytes read came from
/// it. Shutting down the write half sends `FIN_WRITE`; dropping the
/// handle finishes both directions.
#[derive(Debug)]
pub struct StreamHandle {
    io: DuplexStream,
    request_id: RequestId,
    bound_addr: SocketAddr,
}

impl StreamHandle {
    fn new(io: DuplexStream, request_id: RequestId, bound_addr: SocketAddr) -> Self {
        Self {
            io,
            request_id,
            bound_addr,
        }
    }

    /// End-to-end id of the stream.
    #[must_use]
    pub const fn request_id(&self) -> RequestId {
        self.request_id
    }

    /// Local address of the exit's outbound connection.
    #[must_use]
    pub const fn bound_addr(&self) -> SocketAddr {
        self.bound_addr
    }
}

impl AsyncRead for StreamHandle {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_read(cx, buf)
    }
}

impl AsyncWrite for StreamHandle {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.io).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_shutdown(cx)
    }
}

fn unspecified() -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)
}

// ============================================
// Ingress Open
// ============================================

impl RelayDispatcher {
    /// Opens a stream to `target` through the mesh.
    ///
    /// # Errors
    /// - `NoRoute` if no route covers the target
    /// - `ResourceLimit` at the stream limit
    /// - `OpenRejected` with the exit's or a transit's error code
    /// - `OpenTimeout` if no answer arrives within `open_timeout`
    pub async fn open_stream(self: &Arc<Self>, target: TargetAddr) -> Result<StreamHandle> {
        self.ensure_running()?;
        let route = self
            .routes
            .lookup_target(&target)
            .ok_or_else(|| AgentError::no_route(&target))?;
        let request_id = RequestId::generate();

        if route.is_local() {
            return self.open_local_stream(target, request_id).await;
        }

        let peer = self
            .peers
            .get(&route.next_hop)
            .ok_or(AgentError::PeerNotFound(route.next_hop))?;
        let entry = self.streams.allocate(NewStream {
            request_id,
            role: StreamRole::Ingress,
            upstream: None,
            downstream: Some(peer.id()),
        })?;

        let (app, agent_io) = tokio::io::duplex(HANDLE_PIPE_CAPACITY);
        let handshake = InitiatorHandshake::new(request_id);
        let open = StreamOpen {
            request_id,
            target: target.clone(),
            initiator_pub: handshake.public_key(),
        };
        let (reply_tx, reply_rx) = oneshot::channel();
        entry.set_pending(PendingOpen {
            handshake,
            io: agent_io,
            reply: reply_tx,
        });

        debug!(
            request_id = %request_id,
            target = %target,
            next_hop = %peer.id(),
            stream_id = entry.id(),
            "Opening stream"
        );

        if let Err(e) = peer.send(open.to_frame(entry.id())).await {
            self.streams.remove(entry.id());
            return Err(e);
        }

        match tokio::time::timeout(self.settings.open_timeout, reply_rx).await {
            Ok(Ok(Ok(bound_addr))) => Ok(StreamHandle::new(app, request_id, bound_addr)),
            Ok(Ok(Err(e))) => Err(e),
            Ok(Err(_)) => Err(AgentError::StreamReset {
                code: ErrorCode::Cancelled,
            }),
            Err(_) => {
                self.reset_stream(&entry, ErrorCode::Timeout, None).await;
                Err(AgentError::OpenTimeout)
            }
        }
    }

    /// Dials `target` from this agent without crossing the mesh.
    async fn open_local_stream(
        self: &Arc<Self>,
        target: TargetAddr,
        request_id: RequestId,
    ) -> Result<StreamHandle> {
        let entry = self.streams.allocate(NewStream {
            request_id,
            role: StreamRole::LocalExit,
            upstream: None,
            downstream: None,
        })?;

        let dialed = tokio::select! {
            () = entry.cancel_token().cancelled() => Err(AgentError::ShuttingDown),
            result = self.dialer.connect(&target, self.settings.connect_timeout) => {
                result.map_err(AgentError::from)
            }
        };
        let dialed = match dialed {
            Ok(dialed) => dialed,
            Err(e) => {
                self.streams.remove(entry.id());
                return Err(e);
            }
        };
        entry.apply(StreamEvent::Ack);
        debug!(request_id = %request_id, target = %target, "Stream exits locally");

        let (app, mut agent_io) = tokio::io::duplex(HANDLE_PIPE_CAPACITY);
        let mut remote = dialed.stream;
        let this = Arc::clone(self);
        let cancel = entry.cancel_token().clone();
        let shutdown = self.shutdown_token().clone();
        tokio::spawn(async move {
            tokio::select! {
                () = cancel.cancelled() => {}
                () = shutdown.cancelled() => {}
                result = tokio::io::copy_bidirectional(&mut agent_io, &mut remote) => {
                    if let Ok((up, down)) = result {
                        trace!(request_id = %request_id, up, down, "Local stream finished");
                    }
                }
            }
            entry.apply(StreamEvent::Close);
            this.streams.remove(entry.id());
        });

        Ok(StreamHandle::new(app, request_id, dialed.bound_addr))
    }

    // ========================================
    // STREAM_OPEN
    // ========================================

    pub(crate) async fn handle_stream_open(self: &Arc<Self>, from: AgentId, frame: RawFrame) {
        let wire_id = frame.stream_id;
        if wire_id == 0 || wire_id & REPLY_BIT != 0 {
            warn!(peer = %from, stream_id = wire_id, "STREAM_OPEN with invalid stream id");
            return;
        }
        let open = match StreamOpen::from_bytes(frame.payload.clone()) {
            Ok(open) => open,
            Err(e) => {
                warn!(peer = %from, error = %e, "Malformed STREAM_OPEN");
                return;
            }
        };
        let reject = |code: ErrorCode, message: String| StreamOpenErr {
            request_id: open.request_id,
            code,
            message,
        };

        // Split horizon: never route an open back where it came from.
        let next_hop = match self.routes.lookup_target(&open.target) {
            Some(route) if route.is_local() => None,
            Some(route) if route.next_hop != from && self.peers.get(&route.next_hop).is_some() => {
                Some(route.next_hop)
            }
            _ => {
                debug!(
                    peer = %from,
                    request_id = %open.request_id,
                    target = %open.target,
                    "No route for stream"
                );
                let err = reject(ErrorCode::NoRoute, format!("no route to {}", open.target));
                self.send_to(from, err.to_frame(wire_id | REPLY_BIT)).await;
                return;
            }
        };

        let role = if next_hop.is_some() {
            StreamRole::Transit
        } else {
            StreamRole::Exit
        };
        let entry = match self.streams.allocate(NewStream {
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
                debug!(peer = %from, request_id = %open.request_id, error = %e, "Stream refused");
                let err = reject(e.error_code(), e.to_string());
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
                    stream_id = entry.id(),
                    "Relaying stream open"
                );
                if !self.send_to(next, frame.with_stream_id(entry.id())).await {
                    self.streams.remove(entry.id());
                    let err = reject(ErrorCode::PeerLost, "next hop unavailable".into());
                    self.send_to(from, err.to_frame(wire_id | REPLY_BIT)).await;
                }
            }
            None => {
                let this = Arc::clone(self);
                tokio::spawn(async move { this.run_exit_open(entry, open).await });
            }
        }
    }

    /// Dials the destination and answers the open.
    async fn run_exit_open(self: Arc<Self>, entry: Arc<StreamEntry>, open: StreamOpen) {
        let Some((upstream, reply_id)) = entry.wire_to(Side::Upstream) else {
            return;
        };

        let dialed = tokio::select! {
            () = entry.cancel_token().cancelled() => return,
            result = self.dialer.connect(&open.target, self.settings.connect_timeout) => result,
        };

        let dialed = match dialed {
            Ok(dialed) => dialed,
            Err(e) => {
                let err = AgentError::from(e);
                debug!(
                    request_id = %open.request_id,
                    target = %open.target,
                    error = %err,
                    "Exit dial failed"
                );
                self.streams.remove(entry.id());
                let reply = StreamOpenErr {
                    request_id: open.request_id,
                    code: err.error_code(),
                    message: err.to_string(),
                };
                self.send_to(upstream, reply.to_frame(reply_id)).await;
                return;
            }
        };

        let (cipher, responder_pub) = match respond(open.request_id, &open.initiator_pub) {
            Ok(pair) => pair,
            Err(e) => {
                warn!(request_id = %open.request_id, error = %e, "Stream key exchange failed");
                self.streams.remove(entry.id());
                let reply = StreamOpenErr {
                    request_id: open.request_id,
                    code: ErrorCode::Protocol,
                    message: "key exchange failed".into(),
                };
                self.send_to(upstream, reply.to_frame(reply_id)).await;
                return;
            }
        };

        if entry.apply(StreamEvent::Ack).is_none() {
            // Reset while dialing.
            return;
        }

        let ack = StreamOpenAck {
            request_id: open.request_id,
            bound_addr: dialed.bound_addr.into(),
            responder_pub,
        };
        if !self.send_to(upstream, ack.to_frame(reply_id)).await {
            self.reset_stream(&entry, ErrorCode::PeerLost, Some(Side::Upstream))
                .await;
            return;
        }
        debug!(
            request_id = %open.request_id,
            target = %open.target,
            bound_addr = %dialed.bound_addr,
            "Stream exit connected"
        );
        self.spawn_endpoint(&entry, dialed.stream, cipher);
    }

    // ========================================
    // STREAM_OPEN_ACK / STREAM_OPEN_ERR
    // ========================================

    pub(crate) async fn handle_stream_open_ack(self: &Arc<Self>, from: AgentId, frame: RawFrame) {
        let Some((entry, Side::Downstream)) = self.streams.resolve(from, frame.stream_id) else {
            trace!(peer = %from, stream_id = frame.stream_id, "Ack for unknown stream");
            return;
        };

        match entry.role() {
            StreamRole::Transit => {
                if entry.apply(StreamEvent::Ack).is_none() {
                    return;
                }
                if let Some((peer, wire_id)) = entry.wire_to(Side::Upstream) {
                    if !self.send_to(peer, frame.with_stream_id(wire_id)).await {
                        self.reset_stream(&entry, ErrorCode::PeerLost, Some(Side::Upstream))
                            .await;
                    }
                }
            }
            StreamRole::Ingress => self.complete_ingress_open(&entry, frame).await,
            StreamRole::Exit | StreamRole::LocalExit => {}
        }
    }

    async fn complete_ingress_open(self: &Arc<Self>, entry: &Arc<StreamEntry>, frame: RawFrame) {
        let Some(pending) = entry.take_pending() else {
            return;
        };
        let ack = match StreamOpenAck::from_bytes(frame.payload) {
            Ok(ack) if ack.request_id == entry.request_id() => ack,
            Ok(_) | Err(_) => {
                warn!(request_id = %entry.request_id(), "Malformed or mismatched STREAM_OPEN_ACK");
                let _ = pending.reply.send(Err(AgentError::protocol("bad open ack")));
                self.reset_stream(entry, ErrorCode::Protocol, None).await;
                return;
            }
        };
        let cipher = match pending.handshake.complete(&ack.responder_pub) {
            Ok(cipher) => cipher,
            Err(e) => {
                let _ = pending.reply.send(Err(e.into()));
                self.reset_stream(entry, ErrorCode::Protocol, None).await;
                return;
            }
        };
        if entry.apply(StreamEvent::Ack).is_none() {
            return;
        }

        let bound_addr = ack.bound_addr.socket_addr().unwrap_or_else(unspecified);
        self.spawn_endpoint(entry, pending.io, cipher);
        if pending.reply.send(Ok(bound_addr)).is_err() {
            // Caller gave up.
            self.reset_stream(entry, ErrorCode::Cancelled, None).await;
            return;
        }
        debug!(
            request_id = %entry.request_id(),
            stream_id = entry.id(),
            bound_addr = %bound_addr,
            "Stream open"
        );
    }

    pub(crate) async fn handle_stream_open_err(self: &Arc<Self>, from: AgentId, frame: RawFrame) {
        let Some((entry, Side::Downstream)) = self.streams.resolve(from, frame.stream_id) else {
            return;
        };
        if entry.state() != StreamState::Opening {
            return;
        }
        entry.apply(StreamEvent::Reset);
        self.streams.remove(entry.id());

        match entry.role() {
            StreamRole::Transit => {
                if let Some((peer, wire_id)) = entry.wire_to(Side::Upstream) {
                    self.send_to(peer, frame.with_stream_id(wire_id)).await;
                }
            }
            StreamRole::Ingress => {
                let err = match StreamOpenErr::from_bytes(frame.payload) {
                    Ok(err) => AgentError::OpenRejected {
                        code: err.code,
                        message: err.message,
                    },
                    Err(e) => e.into(),
                };
                debug!(request_id = %entry.request_id(), error = %err, "Stream open rejected");
                if let Some(pending) = entry.take_pending() {
                    let _ = pending.reply.send(Err(err));
                }
            }
            StreamRole::Exit | StreamRole::LocalExit => {}
        }
    }

    // ========================================
    // STREAM_DATA
    // ========================================

    pub(crate) async fn handle_stream_data(self: &Arc<Self>, from: AgentId, frame: RawFrame) {
        let Some((entry, side)) = self.streams.resolve(from, frame.stream_id) else {
            trace!(peer = %from, stream_id = frame.stream_id, "Data for unknown stream");
            return;
        };
        entry.touch();
        let fin = frame.flags.contains(Flags::FIN_WRITE);

        if entry.role() == StreamRole::Transit {
            let Some((peer, wire_id)) = entry.wire_to(side.opposite()) else {
                return;
            };
            if let Err(e) = self.relay_to(peer, frame.with_stream_id(wire_id)).await {
                self.relay_failed(&entry, side.opposite(), &e).await;
                return;
            }
            if fin {
                let event = match side {
                    Side::Upstream => StreamEvent::LocalFin,
                    Side::Downstream => StreamEvent::RemoteFin,
                };
                entry.apply(event);
            }
            return;
        }

        if !entry.state().is_established() {
            debug!(
                stream_id = entry.id(),
                state = %entry.state(),
                "Data outside an established stream"
            );
            return;
        }
        if frame.flags.contains(Flags::FIN_READ) {
            entry.read_cancel_token().cancel();
        }

        if !frame.payload.is_empty() || fin {
            let Some(endpoint) = entry.endpoint() else {
                return;
            };
            let data = InboundData {
                sealed: frame.payload,
                flags: frame.flags,
            };
            match endpoint.try_send(data) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    warn!(
                        request_id = %entry.request_id(),
                        stream_id = entry.id(),
                        "Peer overran the stream window, resetting"
                    );
                    self.reset_stream(&entry, ErrorCode::Protocol, None).await;
                    return;
                }
                Err(TrySendError::Closed(_)) => return,
            }
        }

        if fin {
            self.advance(&entry, StreamEvent::RemoteFin).await;
        }
    }

    /// Resets `entry` after a frame could not be queued toward `side`.
    ///
    /// A congested neighbor still gets a best-effort `STREAM_RESET` so
    /// the rest of the path learns about it.
    async fn relay_failed(&self, entry: &Arc<StreamEntry>, side: Side, err: &AgentError) {
        let code = err.error_code();
        let live = !entry.state().is_terminal();
        debug!(
            request_id = %entry.request_id(),
            stream_id = entry.id(),
            error = %err,
            "Relay failed, resetting stream"
        );
        self.reset_stream(entry, code, Some(side)).await;
        if live && matches!(err, AgentError::PeerCongested(_)) {
            if let Some((peer, wire_id)) = entry.wire_to(side) {
                self.try_send_to(peer, StreamReset { code }.to_frame(wire_id));
            }
        }
    }

    // ========================================
    // STREAM_WINDOW
    // ========================================

    pub(crate) async fn handle_stream_window(self: &Arc<Self>, from: AgentId, frame: RawFrame) {
        let Some((entry, side)) = self.streams.resolve(from, frame.stream_id) else {
            trace!(peer = %from, stream_id = frame.stream_id, "Window for unknown stream");
            return;
        };

        if entry.role() == StreamRole::Transit {
            let Some((peer, wire_id)) = entry.wire_to(side.opposite()) else {
                return;
            };
            if let Err(e) = self.relay_to(peer, frame.with_stream_id(wire_id)).await {
                self.relay_failed(&entry, side.opposite(), &e).await;
            }
            return;
        }

        match StreamWindow::from_bytes(frame.payload) {
            Ok(window) => {
                trace!(stream_id = entry.id(), credit = window.credit, "Send window granted");
                entry.grant_send_credit(window.credit);
            }
            Err(e) => {
                warn!(peer = %from, stream_id = entry.id(), error = %e, "Malformed STREAM_WINDOW");
                self.reset_stream(&entry, ErrorCode::Protocol, None).await;
            }
        }
    }

    /// Applies a FIN at an endpoint and closes the stream once both
    /// directions finished.
    async fn advance(&self, entry: &Arc<StreamEntry>, event: StreamEvent) {
        if entry.apply(event) != Some(StreamState::Closed) {
            return;
        }
        if let Some((peer, wire_id)) = entry.wire_to(entry.endpoint_side()) {
            self.send_to(peer, Frame::empty(FrameType::StreamClose, wire_id))
                .await;
        }
        self.streams.remove(entry.id());
        entry.close_endpoint();
        debug!(
            request_id = %entry.request_id(),
            stream_id = entry.id(),
            "Stream closed"
        );
    }

    // ========================================
    // STREAM_CLOSE / STREAM_RESET
    // ========================================

    pub(crate) async fn handle_stream_close(self: &Arc<Self>, from: AgentId, frame: RawFrame) {
        let Some((entry, side)) = self.streams.resolve(from, frame.stream_id) else {
            return;
        };
        entry.apply(StreamEvent::Close);
        self.streams.remove(entry.id());

        if entry.role() == StreamRole::Transit {
            if let Some((peer, wire_id)) = entry.wire_to(side.opposite()) {
                self.send_to(peer, frame.with_stream_id(wire_id)).await;
            }
        } else {
            // Writer drains what is queued, then shuts the endpoint down.
            entry.read_cancel_token().cancel();
            entry.close_endpoint();
        }
        debug!(request_id = %entry.request_id(), stream_id = entry.id(), "Stream closed by peer");
    }

    pub(crate) async fn handle_stream_reset(self: &Arc<Self>, from: AgentId, frame: RawFrame) {
        let Some((entry, side)) = self.streams.resolve(from, frame.stream_id) else {
            return;
        };
        let code = StreamReset::from_bytes(frame.payload.clone())
            .map_or(ErrorCode::General, |reset| reset.code);
        debug!(
            request_id = %entry.request_id(),
            stream_id = entry.id(),
            code = %code,
            "Stream reset by peer"
        );
        self.reset_stream(&entry, code, Some(side)).await;
    }

    /// Resets `entry`: cancels its tasks, drops it from the table, fails
    /// a pending open and sends `STREAM_RESET` on every leg but `skip`.
    pub(crate) async fn reset_stream(
        &self,
        entry: &Arc<StreamEntry>,
        code: ErrorCode,
        skip: Option<Side>,
    ) {
        entry.apply(StreamEvent::Reset);
        entry.cancel_token().cancel();
        entry.close_endpoint();
        if self.streams.remove(entry.id()).is_none() {
            return;
        }
        if let Some(pending) = entry.take_pending() {
            let _ = pending.reply.send(Err(AgentError::StreamReset { code }));
        }

        let reset = StreamReset { code };
        for side in [Side::Upstream, Side::Downstream] {
            if Some(side) == skip {
                continue;
            }
            if let Some((peer, wire_id)) = entry.wire_to(side) {
                self.send_to(peer, reset.to_frame(wire_id)).await;
            }
        }
    }

    // ========================================
    // Endpoint Pumps
    // ========================================

    /// Starts the reader and writer pumps between `io` and the mesh.
    fn spawn_endpoint<S>(self: &Arc<Self>, entry: &Arc<StreamEntry>, io: S, cipher: SessionCipher)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (sealer, opener) = cipher.split();
        let (tx, rx) = mpsc::channel(self.settings.stream_buffer_frames);
        entry.set_endpoint(tx);

        let (reader, writer) = tokio::io::split(io);
        tokio::spawn(Arc::clone(self).run_reader(Arc::clone(entry), reader, sealer));
        tokio::spawn(Arc::clone(self).run_writer(Arc::clone(entry), writer, rx, opener));
    }

    /// Endpoint → seal → `STREAM_DATA`.
    async fn run_reader<R>(self: Arc<Self>, entry: Arc<StreamEntry>, mut reader: R, mut sealer: Sealer)
    where
        R: AsyncRead + Unpin + Send,
    {
        let Some((peer, wire_id)) = entry.wire_to(entry.endpoint_side()) else {
            return;
        };
        let mut buf = vec![0u8; self.settings.chunk_size()];
        let mut has_credit = false;

        loop {
            // Credit first so nothing read sits here while the peer is full.
            if !has_credit {
                has_credit = tokio::select! {
                    () = entry.read_cancel_token().cancelled() => break,
                    granted = entry.acquire_send_credit() => granted,
                };
                if !has_credit {
                    return;
                }
            }
            let read = tokio::select! {
                () = entry.read_cancel_token().cancelled() => break,
                read = reader.read(&mut buf) => read,
            };
            let n = match read {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    debug!(request_id = %entry.request_id(), error = %e, "Endpoint read failed");
                    self.reset_stream(&entry, ErrorCode::General, None).await;
                    return;
                }
            };
            let sealed = match sealer.seal(&buf[..n]) {
                Ok(sealed) => sealed,
                Err(e) => {
                    warn!(request_id = %entry.request_id(), error = %e, "Seal failed");
                    self.reset_stream(&entry, ErrorCode::General, None).await;
                    return;
                }
            };
            entry.touch();
            let frame = Frame::new(FrameType::StreamData, wire_id, Bytes::from(sealed));
            has_credit = false;
            if let Err(e) = self.relay_to(peer, frame).await {
                self.relay_failed(&entry, entry.endpoint_side(), &e).await;
                return;
            }
        }

        if entry.cancel_token().is_cancelled() || entry.state().is_terminal() {
            return;
        }
        if !has_credit {
            let granted = tokio::select! {
                () = entry.cancel_token().cancelled() => false,
                granted = entry.acquire_send_credit() => granted,
            };
            if !granted {
                return;
            }
        }
        let fin = Frame::empty(FrameType::StreamData, wire_id).with_flags(Flags::FIN_WRITE);
        match self.relay_to(peer, fin).await {
            Ok(()) => {
                trace!(request_id = %entry.request_id(), "Sent FIN_WRITE");
                self.advance(&entry, StreamEvent::LocalFin).await;
            }
            Err(e) => self.relay_failed(&entry, entry.endpoint_side(), &e).await,
        }
    }

    /// Stream buffer → open → endpoint.
    async fn run_writer<W>(
        self: Arc<Self>,
        entry: Arc<StreamEntry>,
        mut writer: W,
        mut rx: mpsc::Receiver<InboundData>,
        mut opener: Opener,
    ) where
        W: AsyncWrite + Unpin + Send,
    {
        let cancel = entry.cancel_token().clone();
        let window = u32::try_from(self.settings.stream_buffer_frames).unwrap_or(u32::MAX);
        let refill_at = (window / 2).max(1);
        let mut consumed = 0u32;
        let mut endpoint_gone = false;

        self.send_window(&entry, window).await;

        loop {
            let data = tokio::select! {
                () = cancel.cancelled() => return,
                data = rx.recv() => data,
            };
            let Some(data) = data else {
                break;
            };
            let fin = data.flags.contains(Flags::FIN_WRITE);

            if !data.sealed.is_empty() {
                let plaintext = match opener.open(&data.sealed) {
                    Ok(plaintext) => plaintext,
                    Err(e) => {
                        warn!(
                            request_id = %entry.request_id(),
                            stream_id = entry.id(),
                            error = %e,
                            "Stream payload failed to decrypt"
                        );
                        self.reset_stream(&entry, ErrorCode::DecryptFailed, None).await;
                        return;
                    }
                };
                if !endpoint_gone {
                    let written = tokio::select! {
                        () = cancel.cancelled() => return,
                        written = writer.write_all(&plaintext) => written,
                    };
                    if written.is_err() {
                        // Endpoint stopped reading; tell the far end.
                        endpoint_gone = true;
                        self.send_fin_read(&entry).await;
                    }
                }
            }

            if fin {
                let _ = writer.shutdown().await;
                continue;
            }

            // The buffer slot is free again; hand it back to the sender.
            consumed += 1;
            if consumed >= refill_at {
                self.send_window(&entry, consumed).await;
                consumed = 0;
            }
        }

        let _ = writer.shutdown().await;
    }

    async fn send_window(&self, entry: &Arc<StreamEntry>, credit: u32) {
        if let Some((peer, wire_id)) = entry.wire_to(entry.endpoint_side()) {
            self.send_to(peer, StreamWindow { credit }.to_frame(wire_id))
                .await;
        }
    }

    async fn send_fin_read(&self, entry: &Arc<StreamEntry>) {
        if let Some((peer, wire_id)) = entry.wire_to(entry.endpoint_side()) {
            let frame = Frame::empty(FrameType::StreamData, wire_id).with_flags(Flags::FIN_READ);
            self.send_to(peer, frame).await;
        }
    }
}

// ============================================
// Tests
// ============================================

#[cfg(test)]
mod tests {
    use super::*;
    use meshrelay_transport::{DialOutcome, MockDialer};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio_util::sync::CancellationToken;

    use crate::config::RelaySettings;
    use crate::services::{PeerHandle, PeerRegistry, Route, RouteTable};

    fn exit_dispatcher(dialer: Arc<MockDialer>) -> Arc<RelayDispatcher> {
        let id = AgentId::generate();
        let routes = Arc::new(RouteTable::new(id));
        routes
            .add_route(Route::local("0.0.0.0/0".parse().unwrap(), id))
            .unwrap();
        RelayDispatcher::new(
            id,
            RelaySettings::default(),
            routes,
            Arc::new(PeerRegistry::new()),
            dialer,
            CancellationToken::new(),
        )
    }

    fn attach(d: &RelayDispatcher, id: AgentId) -> mpsc::Receiver<RawFrame> {
        let (tx, rx) = mpsc::channel(64);
        d.peers()
            .insert(Arc::new(PeerHandle::new(
                id,
                "test",
                "mem://test",
                tx,
                CancellationToken::new(),
            )))
            .unwrap();
        rx
    }

    fn open_frame(stream_id: u64, handshake: &InitiatorHandshake) -> RawFrame {
        StreamOpen {
            request_id: handshake.request_id(),
            target: "1.2.3.4:80".parse().unwrap(),
            initiator_pub: handshake.public_key(),
        }
        .to_frame(stream_id)
        .into()
    }

    fn window_frame(stream_id: u64, credit: u32) -> RawFrame {
        StreamWindow { credit }.to_frame(stream_id).into()
    }

    async fn expect_window(rx: &mut mpsc::Receiver<RawFrame>) -> u32 {
        let frame = rx.recv().await.unwrap();
        assert_eq!(frame.type_byte, FrameType::StreamWindow.as_byte());
        StreamWindow::from_bytes(frame.payload).unwrap().credit
    }

    #[tokio::test]
    async fn test_exit_open_ack_and_data() {
        let dialer = Arc::new(MockDialer::new());
        let d = exit_dispatcher(Arc::clone(&dialer));
        let peer = AgentId::generate();
        let mut rx = attach(&d, peer);

        let handshake = InitiatorHandshake::new(RequestId::new(7));
        d.handle_frame(peer, open_frame(5, &handshake)).await;

        let ack_frame = rx.recv().await.unwrap();
        assert_eq!(ack_frame.type_byte, FrameType::StreamOpenAck.as_byte());
        assert_eq!(ack_frame.stream_id, 5 | REPLY_BIT);
        let ack = StreamOpenAck::from_bytes(ack_frame.payload).unwrap();
        assert_eq!(ack.request_id, RequestId::new(7));

        let mut accepted = dialer.next_accepted().await.unwrap();
        assert_eq!(accepted.target, "1.2.3.4:80".parse().unwrap());

        let cipher = handshake.complete(&ack.responder_pub).unwrap();
        let (mut sealer, mut opener) = cipher.split();
        assert_eq!(expect_window(&mut rx).await, 64);

        // Ingress → destination.
        let sealed = sealer.seal(b"GET /").unwrap();
        d.handle_frame(peer, Frame::new(FrameType::StreamData, 5, sealed).into())
            .await;
        let mut buf = [0u8; 5];
        accepted.remote.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"GET /");

        // Destination → ingress, once the exit may send.
        accepted.remote.write_all(b"200 OK").await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());
        d.handle_frame(peer, window_frame(5, 1)).await;
        let data = rx.recv().await.unwrap();
        assert_eq!(data.type_byte, FrameType::StreamData.as_byte());
        assert_eq!(opener.open(&data.payload).unwrap(), b"200 OK");
        assert_eq!(d.streams().len(), 1);
    }

    #[tokio::test]
    async fn test_exit_dial_refused() {
        let dialer = Arc::new(MockDialer::new());
        dialer.push_outcome(DialOutcome::Refuse);
        let d = exit_dispatcher(Arc::clone(&dialer));
        let peer = AgentId::generate();
        let mut rx = attach(&d, peer);

        let handshake = InitiatorHandshake::new(RequestId::new(9));
        d.handle_frame(peer, open_frame(3, &handshake)).await;

        let frame = rx.recv().await.unwrap();
        assert_eq!(frame.type_byte, FrameType::StreamOpenErr.as_byte());
        let err = StreamOpenErr::from_bytes(frame.payload).unwrap();
        assert_eq!(err.code, ErrorCode::Refused);
        assert_eq!(err.request_id, RequestId::new(9));
        assert!(d.streams().is_empty());
    }

    #[tokio::test]
    async fn test_no_route_and_split_horizon() {
        let id = AgentId::generate();
        let peer = AgentId::generate();
        let routes = Arc::new(RouteTable::new(id));
        routes
            .add_route(Route::learned(
                "0.0.0.0/0".parse().unwrap(),
                peer,
                1,
                peer,
                vec![peer],
                std::time::Duration::from_secs(60),
                std::time::Instant::now(),
            ))
            .unwrap();
        let d = RelayDispatcher::new(
            id,
            RelaySettings::default(),
            routes,
            Arc::new(PeerRegistry::new()),
            Arc::new(MockDialer::new()),
            CancellationToken::new(),
        );
        let mut rx = attach(&d, peer);

        let handshake = InitiatorHandshake::new(RequestId::new(1));
        d.handle_frame(peer, open_frame(1, &handshake)).await;

        let frame = rx.recv().await.unwrap();
        let err = StreamOpenErr::from_bytes(frame.payload).unwrap();
        assert_eq!(err.code, ErrorCode::NoRoute);
        assert!(d.streams().is_empty());
    }

    #[tokio::test]
    async fn test_tampered_data_resets_stream() {
        let dialer = Arc::new(MockDialer::new());
        let d = exit_dispatcher(Arc::clone(&dialer));
        let peer = AgentId::generate();
        let mut rx = attach(&d, peer);

        let handshake = InitiatorHandshake::new(RequestId::new(11));
        d.handle_frame(peer, open_frame(8, &handshake)).await;
        let ack = StreamOpenAck::from_bytes(rx.recv().await.unwrap().payload).unwrap();
        let _accepted = dialer.next_accepted().await.unwrap();
        let (mut sealer, _) = handshake.complete(&ack.responder_pub).unwrap().split();
        expect_window(&mut rx).await;

        let mut sealed = sealer.seal(b"payload").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;
        d.handle_frame(peer, Frame::new(FrameType::StreamData, 8, sealed).into())
            .await;

        let reset = rx.recv().await.unwrap();
        assert_eq!(reset.type_byte, FrameType::StreamReset.as_byte());
        assert_eq!(
            StreamReset::from_bytes(reset.payload).unwrap().code,
            ErrorCode::DecryptFailed
        );
        assert!(d.streams().is_empty());
    }

    #[tokio::test]
    async fn test_window_overrun_resets_only_that_stream() {
        let dialer = Arc::new(MockDialer::new());
        let id = AgentId::generate();
        let routes = Arc::new(RouteTable::new(id));
        routes
            .add_route(Route::local("0.0.0.0/0".parse().unwrap(), id))
            .unwrap();
        let settings = RelaySettings {
            stream_buffer_frames: 2,
            ..RelaySettings::default()
        };
        let d = RelayDispatcher::new(
            id,
            settings,
            routes,
            Arc::new(PeerRegistry::new()),
            Arc::clone(&dialer) as Arc<dyn meshrelay_transport::Dialer>,
            CancellationToken::new(),
        );
        let peer = AgentId::generate();
        let mut rx = attach(&d, peer);

        // Stream 5: destination never reads.
        let stuck = InitiatorHandshake::new(RequestId::new(1));
        d.handle_frame(peer, open_frame(5, &stuck)).await;
        let ack = StreamOpenAck::from_bytes(rx.recv().await.unwrap().payload).unwrap();
        let _stuck_remote = dialer.next_accepted().await.unwrap();
        let (mut stuck_sealer, _) = stuck.complete(&ack.responder_pub).unwrap().split();
        assert_eq!(expect_window(&mut rx).await, 2);

        // Stream 7: healthy.
        let healthy = InitiatorHandshake::new(RequestId::new(2));
        d.handle_frame(peer, open_frame(7, &healthy)).await;
        let ack = StreamOpenAck::from_bytes(rx.recv().await.unwrap().payload).unwrap();
        let mut healthy_remote = dialer.next_accepted().await.unwrap();
        let (mut healthy_sealer, _) = healthy.complete(&ack.responder_pub).unwrap().split();
        assert_eq!(expect_window(&mut rx).await, 2);

        // Far more than the pipe and window hold; none of this may block.
        let big = vec![0x5au8; 32 * 1024];
        let flood = async {
            for _ in 0..8 {
                let sealed = stuck_sealer.seal(&big).unwrap();
                d.handle_frame(peer, Frame::new(FrameType::StreamData, 5, sealed).into())
                    .await;
            }
        };
        tokio::time::timeout(std::time::Duration::from_secs(1), flood)
            .await
            .unwrap();

        let mut reset = rx.recv().await.unwrap();
        while reset.type_byte == FrameType::StreamWindow.as_byte() {
            reset = rx.recv().await.unwrap();
        }
        assert_eq!(reset.type_byte, FrameType::StreamReset.as_byte());
        assert_eq!(reset.stream_id, 5 | REPLY_BIT);
        assert_eq!(
            StreamReset::from_bytes(reset.payload).unwrap().code,
            ErrorCode::Protocol
        );

        let sealed = healthy_sealer.seal(b"still here").unwrap();
        d.handle_frame(peer, Frame::new(FrameType::StreamData, 7, sealed).into())
            .await;
        let mut buf = [0u8; 10];
        tokio::time::timeout(
            std::time::Duration::from_secs(1),
            healthy_remote.remote.read_exact(&mut buf),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(&buf, b"still here");
        assert_eq!(d.streams().len(), 1);
        assert_eq!(d.peers().len(), 1);
    }

    #[tokio::test]
    async fn test_transit_gives_up_on_congested_next_hop() {
        let id = AgentId::generate();
        let (up, down) = (AgentId::generate(), AgentId::generate());
        let routes = Arc::new(RouteTable::new(id));
        routes
            .add_route(Route::learned(
                "0.0.0.0/0".parse().unwrap(),
                down,
                1,
                down,
                vec![down],
                std::time::Duration::from_secs(60),
                std::time::Instant::now(),
            ))
            .unwrap();
        let settings = RelaySettings {
            write_timeout: std::time::Duration::from_millis(100),
            ..RelaySettings::default()
        };
        let d = RelayDispatcher::new(
            id,
            settings,
            routes,
            Arc::new(PeerRegistry::new()),
            Arc::new(MockDialer::new()),
            CancellationToken::new(),
        );
        let mut rx_up = attach(&d, up);
        let (tx_down, _rx_down) = mpsc::channel(1);
        d.peers()
            .insert(Arc::new(PeerHandle::new(
                down,
                "slow",
                "mem://slow",
                tx_down,
                CancellationToken::new(),
            )))
            .unwrap();

        // The open fills the next hop's queue; nobody drains it.
        let handshake = InitiatorHandshake::new(RequestId::new(3));
        d.handle_frame(up, open_frame(9, &handshake)).await;
        assert_eq!(d.streams().len(), 1);

        let data = Frame::new(FrameType::StreamData, 9, Bytes::from_static(b"sealed"));
        tokio::time::timeout(
            std::time::Duration::from_secs(1),
            d.handle_frame(up, data.into()),
        )
        .await
        .unwrap();

        let reset = rx_up.recv().await.unwrap();
        assert_eq!(reset.type_byte, FrameType::StreamReset.as_byte());
        assert_eq!(reset.stream_id, 9 | REPLY_BIT);
        assert_eq!(
            StreamReset::from_bytes(reset.payload).unwrap().code,
            ErrorCode::Timeout
        );
        assert!(d.streams().is_empty());
        assert_eq!(d.peers().len(), 2);
    }

    #[tokio::test]
    async fn test_transit_relays_window_grants() {
        let id = AgentId::generate();
        let (up, down) = (AgentId::generate(), AgentId::generate());
        let routes = Arc::new(RouteTable::new(id));
        routes
            .add_route(Route::learned(
                "0.0.0.0/0".parse().unwrap(),
                down,
                1,
                down,
                vec![down],
                std::time::Duration::from_secs(60),
                std::time::Instant::now(),
            ))
            .unwrap();
        let d = RelayDispatcher::new(
            id,
            RelaySettings::default(),
            routes,
            Arc::new(PeerRegistry::new()),
            Arc::new(MockDialer::new()),
            CancellationToken::new(),
        );
        let mut rx_up = attach(&d, up);
        let mut rx_down = attach(&d, down);

        let handshake = InitiatorHandshake::new(RequestId::new(4));
        d.handle_frame(up, open_frame(11, &handshake)).await;
        let open = rx_down.recv().await.unwrap();
        let local_id = open.stream_id;

        d.handle_frame(up, window_frame(11, 8)).await;
        let forwarded = rx_down.recv().await.unwrap();
        assert_eq!(forwarded.type_byte, FrameType::StreamWindow.as_byte());
        assert_eq!(forwarded.stream_id, local_id);

        d.handle_frame(down, window_frame(local_id | REPLY_BIT, 16)).await;
        let back = rx_up.recv().await.unwrap();
        assert_eq!(back.stream_id, 11 | REPLY_BIT);
        assert_eq!(StreamWindow::from_bytes(back.payload).unwrap().credit, 16);
    }

    #[tokio::test]
    async fn test_local_exit_stream() {
        let dialer = Arc::new(MockDialer::new());
        let d = exit_dispatcher(Arc::clone(&dialer));

        let mut handle = d.open_stream("1.2.3.4:80".parse().unwrap()).await.unwrap();
        assert_eq!(d.streams().len(), 1);
        let mut accepted = dialer.next_accepted().await.unwrap();

        handle.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        accepted.remote.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        accepted.remote.write_all(b"pong").await.unwrap();
        handle.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");
    }

    #[tokio::test]
    async fn test_open_without_route() {
        let id = AgentId::generate();
        let d = RelayDispatcher::new(
            id,
            RelaySettings::default(),
            Arc::new(RouteTable::new(id)),
            Arc::new(PeerRegistry::new()),
            Arc::new(MockDialer::new()),
            CancellationToken::new(),
        );
        let err = d
            .open_stream("1.2.3.4:80".parse().unwrap())
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), ErrorCode::NoRoute);
    }
}
