// ============================================
// File: crates/meshrelay-agent/src/handlers/dispatcher.rs
// ============================================
//! # Relay Dispatcher
//!
//! ## Creation Reason
//! The orchestration point of an agent: every frame read from any peer
//! link enters here and is routed to the stream, association or routing
//! handler.
//!
//! ## Main Functionality
//! - `RelayDispatcher::handle_frame`: classify and dispatch one frame
//! - Route advertisement ingestion and fan-out
//! - `advertise_now`: push own exit routes to every neighbor
//! - `peer_lost`: tear down everything that crossed a lost link
//! - `sweep`: expire routes, time out streams and associations
//!
//! ## Dispatch Table
//! ```text
//! ┌──────────────────────┬──────────────────────────────────────────┐
//! │ Frame                │ Handler                                  │
//! ├──────────────────────┼──────────────────────────────────────────┤
//! │ STREAM_OPEN          │ route lookup → transit / exit / no-route │
//! │ STREAM_OPEN_ACK/ERR  │ forward upstream or complete ingress     │
//! │ STREAM_DATA          │ forward verbatim or feed local endpoint  │
//! │ STREAM_WINDOW        │ forward verbatim or grant send credit    │
//! │ STREAM_CLOSE/RESET   │ forward to other leg, drop entry         │
//! │ ROUTE_ADVERTISE      │ flooder → table → re-flood               │
//! │ UDP_*                │ association handlers                     │
//! │ KEEPALIVE            │ liveness only                            │
//! │ unknown type         │ forwarded if it names a transit stream   │
//! └──────────────────────┴──────────────────────────────────────────┘
//! ```
//!
//! ## ⚠️ Important Note for Next Developer
//! - Handlers run on the peer's reader task and must never wait on one
//!   stream's progress: endpoint buffers are fed with `try_send` inside
//!   the window the endpoint granted, and queueing toward another peer
//!   waits at most `write_timeout`. Anything that dials or waits on a
//!   socket is spawned.
//! - Nothing reachable from here may panic on peer input
//!
//! ## Last Modified
//! v0.1.0 - Initial relay dispatcher

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use meshrelay_common::AgentId;
use meshrelay_core::protocol::{
    FrameCodec, FrameType, Payload, RawFrame, RouteAdvertise, CONTROL_STREAM_ID,
};
use meshrelay_transport::Dialer;

use crate::config::RelaySettings;
use crate::error::{AgentError, Result};
use crate::services::stream::Side;
use crate::services::{
    AssociationTable, FloodDecision, PeerRegistry, Route, RouteFlooder, RouteTable, StreamRole,
    StreamTable,
};

// ============================================
// AgentStats
// ============================================

/// Counts exposed to the control plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AgentStats {
    /// Attached neighbors.
    pub peers: usize,
    /// Stored routes.
    pub routes: usize,
    /// Distinct prefixes.
    pub prefixes: usize,
    /// Live streams.
    pub streams: usize,
    /// Live UDP associations.
    pub associations: usize,
}

// ============================================
// RelayDispatcher
// ============================================

/// Shared relay state and frame handling.
///
/// # Thread Safety
/// Every method may be called concurrently from any peer's reader task.
pub struct RelayDispatcher {
    pub(crate) local_id: AgentId,
    pub(crate) settings: RelaySettings,
    pub(crate) codec: FrameCodec,
    pub(crate) routes: Arc<RouteTable>,
    pub(crate) flooder: RouteFlooder,
    pub(crate) streams: StreamTable,
    pub(crate) associations: AssociationTable,
    pub(crate) peers: Arc<PeerRegistry>,
    pub(crate) dialer: Arc<dyn Dialer>,
    advertise_trigger: Arc<Notify>,
    shutdown: CancellationToken,
}

impl RelayDispatcher {
    /// Creates a dispatcher with empty stream and association tables.
    #[must_use]
    pub fn new(
        local_id: AgentId,
        settings: RelaySettings,
        routes: Arc<RouteTable>,
        peers: Arc<PeerRegistry>,
        dialer: Arc<dyn Dialer>,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        let flooder = RouteFlooder::new(
            local_id,
            Arc::clone(&routes),
            settings.max_hops,
            settings.route_ttl,
        );
        Arc::new(Self {
            local_id,
            codec: FrameCodec::new(settings.max_frame_payload),
            streams: StreamTable::new(settings.max_streams_total, settings.max_streams_per_peer),
            associations: AssociationTable::new(settings.max_associations),
            settings,
            routes,
            flooder,
            peers,
            dialer,
            advertise_trigger: Arc::new(Notify::new()),
            shutdown,
        })
    }

    /// This agent's id.
    #[must_use]
    pub const fn local_id(&self) -> AgentId {
        self.local_id
    }

    /// Runtime settings.
    #[must_use]
    pub const fn settings(&self) -> &RelaySettings {
        &self.settings
    }

    /// Frame codec for peer links.
    #[must_use]
    pub const fn codec(&self) -> FrameCodec {
        self.codec
    }

    /// Route table.
    #[must_use]
    pub fn routes(&self) -> &Arc<RouteTable> {
        &self.routes
    }

    /// Neighbor registry.
    #[must_use]
    pub fn peers(&self) -> &Arc<PeerRegistry> {
        &self.peers
    }

    /// Stream table.
    #[must_use]
    pub const fn streams(&self) -> &StreamTable {
        &self.streams
    }

    /// Association table.
    #[must_use]
    pub const fn associations(&self) -> &AssociationTable {
        &self.associations
    }

    /// Cancelled when the agent shuts down.
    #[must_use]
    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    /// Wakes the advertiser task.
    pub fn trigger_advertise(&self) {
        self.advertise_trigger.notify_one();
    }

    /// Waits for [`trigger_advertise`](Self::trigger_advertise).
    pub async fn advertise_requested(&self) {
        self.advertise_trigger.notified().await;
    }

    /// Current counts.
    #[must_use]
    pub fn stats(&self) -> AgentStats {
        AgentStats {
            peers: self.peers.len(),
            routes: self.routes.route_count(),
            prefixes: self.routes.prefix_count(),
            streams: self.streams.len(),
            associations: self.associations.len(),
        }
    }

    // ========================================
    // Frame Dispatch
    // ========================================

    /// Handles one frame received from neighbor `from`.
    pub async fn handle_frame(self: &Arc<Self>, from: AgentId, frame: RawFrame) {
        let frame_type = match frame.frame_type() {
            Ok(frame_type) => frame_type,
            Err(_) => {
                self.forward_unknown(from, frame).await;
                return;
            }
        };
        trace!(
            peer = %from,
            frame_type = %frame_type,
            stream_id = frame.stream_id,
            len = frame.payload.len(),
            "Frame received"
        );

        match frame_type {
            FrameType::StreamOpen => self.handle_stream_open(from, frame).await,
            FrameType::StreamOpenAck => self.handle_stream_open_ack(from, frame).await,
            FrameType::StreamOpenErr => self.handle_stream_open_err(from, frame).await,
            FrameType::StreamData => self.handle_stream_data(from, frame).await,
            FrameType::StreamClose => self.handle_stream_close(from, frame).await,
            FrameType::StreamReset => self.handle_stream_reset(from, frame).await,
            FrameType::StreamWindow => self.handle_stream_window(from, frame).await,
            FrameType::RouteAdvertise => self.handle_route_advertise(from, frame),
            FrameType::UdpOpen => self.handle_udp_open(from, frame).await,
            FrameType::UdpOpenAck => self.handle_udp_open_ack(from, frame).await,
            FrameType::UdpOpenErr => self.handle_udp_open_err(from, frame).await,
            FrameType::UdpDatagram => self.handle_udp_datagram(from, frame).await,
            FrameType::UdpClose => self.handle_udp_close(from, frame).await,
            FrameType::Keepalive => {}
            FrameType::PeerHello => {
                debug!(peer = %from, "Ignoring repeated PEER_HELLO");
            }
        }
    }

    /// Relays a frame of unknown type along a transit stream, else drops it.
    async fn forward_unknown(&self, from: AgentId, frame: RawFrame) {
        let relay = self
            .streams
            .resolve(from, frame.stream_id)
            .filter(|(entry, _)| entry.role() == StreamRole::Transit);

        match relay {
            Some((entry, side)) => {
                if let Some((peer, wire_id)) = entry.wire_to(side.opposite()) {
                    self.send_to(peer, frame.with_stream_id(wire_id)).await;
                }
            }
            None => debug!(
                peer = %from,
                type_byte = frame.type_byte,
                stream_id = frame.stream_id,
                "Dropping frame of unknown type"
            ),
        }
    }

    /// Queues `frame` for `peer`, waiting at most `write_timeout` for room.
    ///
    /// # Errors
    /// - `PeerNotFound` if the peer is detached
    /// - `PeerCongested` if its queue stayed full
    pub(crate) async fn relay_to(&self, peer: AgentId, frame: impl Into<RawFrame>) -> Result<()> {
        let handle = self.peers.get(&peer).ok_or(AgentError::PeerNotFound(peer))?;
        handle.send_timeout(frame, self.settings.write_timeout).await
    }

    /// Like [`relay_to`](Self::relay_to); logs and returns `false` on failure.
    pub(crate) async fn send_to(&self, peer: AgentId, frame: impl Into<RawFrame>) -> bool {
        match self.relay_to(peer, frame).await {
            Ok(()) => true,
            Err(AgentError::PeerNotFound(_)) => {
                trace!(peer = %peer, "Send to detached peer dropped");
                false
            }
            Err(e) => {
                debug!(peer = %peer, error = %e, "Send failed");
                false
            }
        }
    }

    /// Queues `frame` for `peer` only if there is room.
    pub(crate) fn try_send_to(&self, peer: AgentId, frame: impl Into<RawFrame>) -> bool {
        self.peers
            .get(&peer)
            .is_some_and(|handle| handle.try_send(frame))
    }

    // ========================================
    // Routing
    // ========================================

    fn handle_route_advertise(&self, from: AgentId, frame: RawFrame) {
        let adv = match RouteAdvertise::from_bytes(frame.payload) {
            Ok(adv) => adv,
            Err(e) => {
                warn!(peer = %from, error = %e, "Malformed ROUTE_ADVERTISE");
                return;
            }
        };

        match self.flooder.receive(from, &adv) {
            Ok(FloodDecision::Accepted { update, forward }) => {
                if update.changed() {
                    debug!(
                        peer = %from,
                        prefix = %adv.prefix,
                        origin = %adv.origin,
                        metric = adv.metric + 1,
                        update = ?update,
                        "Route learned"
                    );
                }
                if let Some(forward) = forward {
                    self.flood(&forward, Some(from));
                }
            }
            Ok(FloodDecision::Dropped(reason)) => {
                trace!(peer = %from, prefix = %adv.prefix, reason = ?reason, "Advertisement dropped");
            }
            Err(e) => warn!(peer = %from, error = %e, "Advertisement rejected"),
        }
    }

    /// Sends `adv` to every neighbor except `exclude`; returns the count.
    fn flood(&self, adv: &RouteAdvertise, exclude: Option<AgentId>) -> usize {
        let frame = adv.to_frame(CONTROL_STREAM_ID);
        let targets = match exclude {
            Some(peer) => self.peers.all_except(peer),
            None => self.peers.all(),
        };
        let mut sent = 0;
        for peer in targets {
            if peer.try_send(frame.clone()) {
                sent += 1;
            } else {
                warn!(peer = %peer.id(), prefix = %adv.prefix, "Peer queue full, advertisement dropped");
            }
        }
        sent
    }

    /// Advertises every local exit route to every neighbor.
    ///
    /// Returns the number of frames queued.
    pub fn advertise_now(&self) -> usize {
        let ads = self.flooder.originate();
        let sent: usize = ads.iter().map(|adv| self.flood(adv, None)).sum();
        if sent > 0 {
            debug!(prefixes = ads.len(), frames = sent, "Advertised local routes");
        }
        sent
    }

    /// Snapshot of the route table.
    #[must_use]
    pub fn route_snapshot(&self) -> Vec<Route> {
        self.routes.snapshot()
    }

    // ========================================
    // Lifecycle
    // ========================================

    /// Tears down every stream and association that used `peer`, and
    /// withdraws the routes learned through it.
    pub async fn peer_lost(self: &Arc<Self>, peer: AgentId) {
        use meshrelay_core::protocol::{CloseReason, ErrorCode};

        let streams = self.streams.streams_via(peer);
        let associations = self.associations.associations_via(peer);

        for entry in &streams {
            let lost_side = if entry.downstream() == Some(peer) {
                Side::Downstream
            } else {
                Side::Upstream
            };
            self.reset_stream(entry, ErrorCode::PeerLost, Some(lost_side))
                .await;
        }
        for entry in &associations {
            let lost_side = if entry.downstream() == Some(peer) {
                Side::Downstream
            } else {
                Side::Upstream
            };
            self.close_association(entry, CloseReason::PeerLost, Some(lost_side))
                .await;
        }
        let withdrawn = self.routes.remove_routes_via(peer);

        info!(
            peer = %peer,
            streams = streams.len(),
            associations = associations.len(),
            routes = withdrawn.len(),
            "Peer lost, state released"
        );
    }

    /// Expires routes and times out streams and associations.
    pub async fn sweep(self: &Arc<Self>, now: Instant) {
        use meshrelay_core::protocol::CloseReason;

        let expired = self.routes.remove_expired(now);

        let stale_streams = self.streams.stale(
            now,
            self.settings.open_timeout,
            self.settings.idle_timeout,
        );
        for (entry, code) in &stale_streams {
            debug!(
                stream_id = entry.id(),
                request_id = %entry.request_id(),
                code = %code,
                "Stream timed out"
            );
            self.reset_stream(entry, *code, None).await;
        }

        let stale_associations = self.associations.stale(
            now,
            self.settings.open_timeout,
            self.settings.udp_idle_timeout,
        );
        for entry in &stale_associations {
            self.close_association(entry, CloseReason::Timeout, None).await;
        }

        if !expired.is_empty() || !stale_streams.is_empty() || !stale_associations.is_empty() {
            debug!(
                routes = expired.len(),
                streams = stale_streams.len(),
                associations = stale_associations.len(),
                "Sweep complete"
            );
        }
    }

    /// Resets every stream and closes every association.
    pub async fn close_all(self: &Arc<Self>) {
        use meshrelay_core::protocol::{CloseReason, ErrorCode};

        for entry in self.streams.all() {
            self.reset_stream(&entry, ErrorCode::Cancelled, None).await;
        }
        for entry in self.associations.all() {
            self.close_association(&entry, CloseReason::Normal, None).await;
        }
    }

    /// Checks that the agent still accepts work.
    ///
    /// # Errors
    /// `ShuttingDown` once shutdown started.
    pub(crate) fn ensure_running(&self) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Err(AgentError::ShuttingDown);
        }
        Ok(())
    }
}

impl std::fmt::Debug for RelayDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayDispatcher")
            .field("local_id", &self.local_id)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

// ============================================
// Tests
// ============================================

#[cfg(test)]
mod tests {
    use super::*;
    use meshrelay_core::protocol::Frame;
    use meshrelay_transport::MockDialer;
    use tokio::sync::mpsc;

    use crate::services::PeerHandle;

    fn dispatcher(id: AgentId) -> Arc<RelayDispatcher> {
        RelayDispatcher::new(
            id,
            RelaySettings::default(),
            Arc::new(RouteTable::new(id)),
            Arc::new(PeerRegistry::new()),
            Arc::new(MockDialer::new()),
            CancellationToken::new(),
        )
    }

    fn attach(d: &RelayDispatcher, id: AgentId) -> mpsc::Receiver<RawFrame> {
        let (tx, rx) = mpsc::channel(16);
        d.peers
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

    #[tokio::test]
    async fn test_advertise_and_reflood_excludes_sender() {
        let me = AgentId::generate();
        let d = dispatcher(me);
        let (a, b) = (AgentId::generate(), AgentId::generate());
        let mut rx_a = attach(&d, a);
        let mut rx_b = attach(&d, b);

        let adv = RouteAdvertise {
            origin: a,
            metric: 0,
            prefix: "10.0.0.0/8".parse().unwrap(),
            seen_by: vec![a],
        };
        d.handle_frame(a, adv.to_frame(CONTROL_STREAM_ID).into()).await;

        let forwarded = rx_b.try_recv().unwrap();
        let forwarded = RouteAdvertise::from_bytes(forwarded.payload).unwrap();
        assert_eq!(forwarded.metric, 1);
        assert_eq!(forwarded.seen_by, vec![a, me]);
        assert!(rx_a.try_recv().is_err());
        assert_eq!(d.stats().routes, 1);
    }

    #[tokio::test]
    async fn test_advertise_now_sends_local_routes() {
        let me = AgentId::generate();
        let d = dispatcher(me);
        d.routes
            .add_route(Route::local("0.0.0.0/0".parse().unwrap(), me))
            .unwrap();
        let mut rx = attach(&d, AgentId::generate());

        assert_eq!(d.advertise_now(), 1);
        let frame = rx.try_recv().unwrap();
        assert_eq!(frame.type_byte, FrameType::RouteAdvertise.as_byte());
        assert_eq!(frame.stream_id, CONTROL_STREAM_ID);
    }

    #[tokio::test]
    async fn test_unknown_type_without_stream_is_dropped() {
        let d = dispatcher(AgentId::generate());
        let peer = AgentId::generate();
        let mut rx = attach(&d, peer);
        let frame = RawFrame {
            type_byte: 0x7E,
            flags: meshrelay_core::protocol::Flags::NONE,
            stream_id: 42,
            payload: bytes::Bytes::from_static(b"future"),
        };
        d.handle_frame(peer, frame).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_malformed_advertisement_is_ignored() {
        let d = dispatcher(AgentId::generate());
        let peer = AgentId::generate();
        let _rx = attach(&d, peer);
        d.handle_frame(
            peer,
            Frame::new(FrameType::RouteAdvertise, 0, &b"junk"[..]).into(),
        )
        .await;
        assert_eq!(d.stats().routes, 0);
    }

    #[tokio::test]
    async fn test_peer_lost_withdraws_routes() {
        let me = AgentId::generate();
        let d = dispatcher(me);
        let peer = AgentId::generate();
        let _rx = attach(&d, peer);
        let adv = RouteAdvertise {
            origin: peer,
            metric: 0,
            prefix: "10.0.0.0/8".parse().unwrap(),
            seen_by: vec![peer],
        };
        d.handle_frame(peer, adv.to_frame(CONTROL_STREAM_ID).into()).await;
        assert_eq!(d.stats().routes, 1);

        d.peer_lost(peer).await;
        assert_eq!(d.stats().routes, 0);
    }
}
