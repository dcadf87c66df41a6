// ============================================
// File: crates/meshrelay-agent/src/services/stream.rs
// ============================================
//! # Stream Table
//!
//! ## Creation Reason
//! Holds the per-hop state of every virtual TCP stream this agent takes
//! part in, whether as ingress, transit or exit.
//!
//! ## Main Functionality
//! - `StreamState` + `StreamEvent`: the lifecycle as a pure transition
//!   function
//! - `StreamEntry`: one stream at this hop (legs, state, cancellation,
//!   endpoint buffer sender)
//! - `StreamTable`: slot-allocated ids, wire-id resolution, admission
//!   limits, timeout sweep
//!
//! ## Legs and Wire Ids
//! ```text
//!        upstream leg                      downstream leg
//!   U ───────────────────►  this hop  ───────────────────► D
//!   frames from U carry U's id u       frames to D carry our id s
//!   frames to U carry u | REPLY        frames from D carry s | REPLY
//! ```
//! Ingress entries have no upstream leg, exit entries no downstream leg.
//!
//! ## State Machine
//! ```text
//! Opening ──Ack──► Open ──LocalFin──► HalfClosedLocal ──RemoteFin──► Closed
//!                       └─RemoteFin─► HalfClosedRemote ──LocalFin──► Closed
//! any non-terminal ──Close──► Closed
//! any non-terminal ──Reset──► Reset
//! ```
//! At a transit hop "local" is the ingress-facing direction.
//!
//! ## ⚠️ Important Note for Next Developer
//! - The dispatcher is the only mutator of entries; pumps only read
//! - Removing an entry does not stop its pumps; cancel the token for that
//! - Send credit only ever comes from the far endpoint's `STREAM_WINDOW`;
//!   an endpoint never sends more `STREAM_DATA` frames than it was granted
//!
//! ## Last Modified
//! v0.1.0 - Initial stream table

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tokio::io::DuplexStream;
use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use meshrelay_common::time::AtomicInstant;
use meshrelay_common::{AgentId, RequestId};
use meshrelay_core::crypto::InitiatorHandshake;
use meshrelay_core::protocol::{ErrorCode, Flags};

use crate::error::{AgentError, Result};
use crate::services::slots::{SlotTable, REPLY_BIT};

/// Upper bound on outstanding send credit per stream.
pub const MAX_SEND_CREDIT: usize = 1 << 16;

// ============================================
// StreamState
// ============================================

/// Stream lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Open request sent or received, no ack yet.
    Opening,
    /// Both directions carry data.
    Open,
    /// Local side sent `FIN_WRITE`.
    HalfClosedLocal,
    /// Remote side sent `FIN_WRITE`.
    HalfClosedRemote,
    /// Both sides finished.
    Closed,
    /// Torn down abruptly.
    Reset,
}

/// Input to [`StreamState::apply`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEvent {
    /// `STREAM_OPEN_ACK` seen.
    Ack,
    /// Local direction finished writing.
    LocalFin,
    /// Remote direction finished writing.
    RemoteFin,
    /// `STREAM_CLOSE`.
    Close,
    /// `STREAM_RESET` or a local failure.
    Reset,
}

impl StreamState {
    /// Returns `true` for `Closed` and `Reset`.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Reset)
    }

    /// Returns `true` while data may still flow in some direction.
    #[must_use]
    pub const fn is_established(self) -> bool {
        matches!(
            self,
            Self::Open | Self::HalfClosedLocal | Self::HalfClosedRemote
        )
    }

    /// Next state, or `None` if `event` is not valid here.
    #[must_use]
    pub const fn apply(self, event: StreamEvent) -> Option<Self> {
        use StreamEvent as E;
        match (self, event) {
            (Self::Closed | Self::Reset, _) => None,
            (_, E::Reset) => Some(Self::Reset),
            (_, E::Close) => Some(Self::Closed),
            (Self::Opening, E::Ack) => Some(Self::Open),
            (Self::Open, E::LocalFin) => Some(Self::HalfClosedLocal),
            (Self::Open, E::RemoteFin) => Some(Self::HalfClosedRemote),
            (Self::HalfClosedLocal, E::RemoteFin) | (Self::HalfClosedRemote, E::LocalFin) => {
                Some(Self::Closed)
            }
            (Self::HalfClosedLocal, E::LocalFin) => Some(Self::HalfClosedLocal),
            (Self::HalfClosedRemote, E::RemoteFin) => Some(Self::HalfClosedRemote),
            _ => None,
        }
    }
}

impl std::fmt::Display for StreamState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Opening => "opening",
            Self::Open => "open",
            Self::HalfClosedLocal => "half-closed-local",
            Self::HalfClosedRemote => "half-closed-remote",
            Self::Closed => "closed",
            Self::Reset => "reset",
        };
        f.write_str(name)
    }
}

// ============================================
// Entry Types
// ============================================

/// Part this hop plays in a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamRole {
    /// Opened through the ingress API, relays to a neighbor.
    Ingress,
    /// Relays between two neighbors without the key.
    Transit,
    /// Dialed the destination for a neighbor.
    Exit,
    /// Opened and dialed here; never crosses a link.
    LocalExit,
}

/// Neighbor-side binding of an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Leg {
    /// Neighbor.
    pub peer: AgentId,
    /// Stream id the neighbor allocated.
    pub id: u64,
}

/// Which leg a frame arrived on or leaves through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// Toward the ingress.
    Upstream,
    /// Toward the exit.
    Downstream,
}

impl Side {
    /// The other leg.
    #[must_use]
    pub const fn opposite(self) -> Self {
        match self {
            Self::Upstream => Self::Downstream,
            Self::Downstream => Self::Upstream,
        }
    }
}

/// One `STREAM_DATA` payload queued toward the local endpoint.
#[derive(Debug, Clone)]
pub struct InboundData {
    /// Sealed payload; empty for flag-only frames.
    pub sealed: Bytes,
    /// Frame flags.
    pub flags: Flags,
}

/// Ingress-side state held until the open is answered.
pub struct PendingOpen {
    /// Key exchange in progress.
    pub handshake: InitiatorHandshake,
    /// Agent end of the caller's pipe.
    pub io: DuplexStream,
    /// Wakes the caller with the exit's bound address or the failure.
    pub reply: oneshot::Sender<Result<SocketAddr>>,
}

impl std::fmt::Debug for PendingOpen {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingOpen")
            .field("request_id", &self.handshake.request_id())
            .finish_non_exhaustive()
    }
}

/// Parameters of a new entry.
#[derive(Debug, Clone, Copy)]
pub struct NewStream {
    /// End-to-end id.
    pub request_id: RequestId,
    /// Part this hop plays.
    pub role: StreamRole,
    /// Neighbor the open came from.
    pub upstream: Option<Leg>,
    /// Neighbor the open goes to.
    pub downstream: Option<AgentId>,
}

// ============================================
// StreamEntry
// ============================================

/// One stream at this hop.
pub struct StreamEntry {
    id: u64,
    request_id: RequestId,
    role: StreamRole,
    upstream: Option<Leg>,
    downstream: Option<AgentId>,
    state: Mutex<StreamState>,
    cancel: CancellationToken,
    read_cancel: CancellationToken,
    last_activity: AtomicInstant,
    created_at: Instant,
    endpoint: Mutex<Option<mpsc::Sender<InboundData>>>,
    send_credit: Semaphore,
    pending: Mutex<Option<PendingOpen>>,
}

impl StreamEntry {
    fn new(id: u64, params: NewStream) -> Self {
        let cancel = CancellationToken::new();
        Self {
            id,
            request_id: params.request_id,
            role: params.role,
            upstream: params.upstream,
            downstream: params.downstream,
            state: Mutex::new(StreamState::Opening),
            read_cancel: cancel.child_token(),
            cancel,
            last_activity: AtomicInstant::now(),
            created_at: Instant::now(),
            endpoint: Mutex::new(None),
            send_credit: Semaphore::new(0),
            pending: Mutex::new(None),
        }
    }

    /// Hop-local id.
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// End-to-end id.
    #[must_use]
    pub const fn request_id(&self) -> RequestId {
        self.request_id
    }

    /// Part this hop plays.
    #[must_use]
    pub const fn role(&self) -> StreamRole {
        self.role
    }

    /// Neighbor toward the ingress.
    #[must_use]
    pub const fn upstream(&self) -> Option<Leg> {
        self.upstream
    }

    /// Neighbor toward the exit.
    #[must_use]
    pub const fn downstream(&self) -> Option<AgentId> {
        self.downstream
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> StreamState {
        *self.state.lock()
    }

    /// Applies `event`; returns the new state, or `None` (state kept)
    /// when the event is invalid in the current state.
    pub fn apply(&self, event: StreamEvent) -> Option<StreamState> {
        let mut state = self.state.lock();
        let next = state.apply(event)?;
        if next != *state {
            debug!(
                stream_id = self.id,
                request_id = %self.request_id,
                from = %*state,
                to = %next,
                "Stream state changed"
            );
        }
        *state = next;
        Some(next)
    }

    /// Cancelled on reset or teardown; stops every task of the stream.
    #[must_use]
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Cancelled when the far end stops reading; stops the local reader.
    #[must_use]
    pub fn read_cancel_token(&self) -> &CancellationToken {
        &self.read_cancel
    }

    /// Records traffic.
    pub fn touch(&self) {
        self.last_activity.touch();
    }

    /// Time since the last traffic.
    #[must_use]
    pub fn idle_for(&self, now: Instant) -> Duration {
        self.last_activity.idle_for(now)
    }

    /// Peer and wire id for a frame leaving through `side`.
    #[must_use]
    pub fn wire_to(&self, side: Side) -> Option<(AgentId, u64)> {
        match side {
            Side::Upstream => self.upstream.map(|leg| (leg.peer, leg.id | REPLY_BIT)),
            Side::Downstream => self.downstream.map(|peer| (peer, self.id)),
        }
    }

    /// Leg an endpoint sends through: the only one it has.
    #[must_use]
    pub fn endpoint_side(&self) -> Side {
        if self.downstream.is_some() {
            Side::Downstream
        } else {
            Side::Upstream
        }
    }

    /// Installs the endpoint buffer sender.
    pub fn set_endpoint(&self, sender: mpsc::Sender<InboundData>) {
        *self.endpoint.lock() = Some(sender);
    }

    /// Endpoint buffer sender, if the endpoint is running.
    #[must_use]
    pub fn endpoint(&self) -> Option<mpsc::Sender<InboundData>> {
        self.endpoint.lock().clone()
    }

    /// Drops the sender so the writer drains and finishes.
    pub fn close_endpoint(&self) {
        self.endpoint.lock().take();
    }

    /// Adds `credit` frames to what this endpoint may send.
    pub fn grant_send_credit(&self, credit: u32) {
        let available = self.send_credit.available_permits();
        let room = MAX_SEND_CREDIT.saturating_sub(available);
        let credit = usize::try_from(credit).unwrap_or(usize::MAX).min(room);
        if credit > 0 {
            self.send_credit.add_permits(credit);
        }
    }

    /// Waits for and consumes one frame of send credit.
    pub async fn acquire_send_credit(&self) -> bool {
        match self.send_credit.acquire().await {
            Ok(permit) => {
                permit.forget();
                true
            }
            Err(_) => false,
        }
    }

    /// Frames this endpoint may send right now.
    #[must_use]
    pub fn send_credit(&self) -> usize {
        self.send_credit.available_permits()
    }

    /// Stores ingress open state.
    pub fn set_pending(&self, pending: PendingOpen) {
        *self.pending.lock() = Some(pending);
    }

    /// Takes ingress open state.
    pub fn take_pending(&self) -> Option<PendingOpen> {
        self.pending.lock().take()
    }
}

impl std::fmt::Debug for StreamEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamEntry")
            .field("id", &self.id)
            .field("request_id", &self.request_id)
            .field("role", &self.role)
            .field("state", &self.state())
            .field("upstream", &self.upstream)
            .field("downstream", &self.downstream)
            .finish_non_exhaustive()
    }
}

// ============================================
// StreamTable
// ============================================

/// All streams at this agent.
pub struct StreamTable {
    slots: RwLock<SlotTable<Arc<StreamEntry>>>,
    remote: DashMap<Leg, u64>,
    per_peer: DashMap<AgentId, usize>,
    max_total: usize,
    max_per_peer: usize,
}

impl StreamTable {
    /// Creates an empty table with admission limits.
    #[must_use]
    pub fn new(max_total: usize, max_per_peer: usize) -> Self {
        Self {
            slots: RwLock::new(SlotTable::new()),
            remote: DashMap::new(),
            per_peer: DashMap::new(),
            max_total,
            max_per_peer,
        }
    }

    /// Admits a new stream.
    ///
    /// # Errors
    /// - `ResourceLimit` when the total or the upstream peer's limit is hit
    /// - `Protocol` when the upstream leg id is already in use
    pub fn allocate(&self, params: NewStream) -> Result<Arc<StreamEntry>> {
        let mut slots = self.slots.write();

        if slots.len() >= self.max_total {
            return Err(AgentError::ResourceLimit {
                resource: "streams",
                limit: self.max_total,
            });
        }
        if let Some(leg) = params.upstream {
            let used = self.per_peer.get(&leg.peer).map_or(0, |c| *c);
            if used >= self.max_per_peer {
                return Err(AgentError::ResourceLimit {
                    resource: "streams per peer",
                    limit: self.max_per_peer,
                });
            }
            if self.remote.contains_key(&leg) {
                return Err(AgentError::protocol(format!(
                    "stream id {} from {} already open",
                    leg.id, leg.peer
                )));
            }
        }

        let mut created = None;
        slots
            .insert_with(|id| {
                let entry = Arc::new(StreamEntry::new(id, params));
                created = Some(Arc::clone(&entry));
                entry
            })
            .ok_or(AgentError::ResourceLimit {
                resource: "stream ids",
                limit: u32::MAX as usize,
            })?;
        let entry = created.ok_or_else(|| AgentError::internal("slot insert produced no entry"))?;

        if let Some(leg) = params.upstream {
            self.remote.insert(leg, entry.id());
            *self.per_peer.entry(leg.peer).or_insert(0) += 1;
        }

        debug!(
            stream_id = entry.id(),
            request_id = %entry.request_id(),
            role = ?entry.role(),
            "Stream allocated"
        );
        Ok(entry)
    }

    /// Entry for a hop-local id.
    #[must_use]
    pub fn get(&self, id: u64) -> Option<Arc<StreamEntry>> {
        self.slots.read().get(id).cloned()
    }

    /// Entry and arrival side for a frame from `from` carrying `wire_id`.
    #[must_use]
    pub fn resolve(&self, from: AgentId, wire_id: u64) -> Option<(Arc<StreamEntry>, Side)> {
        if wire_id & REPLY_BIT != 0 {
            let entry = self.get(wire_id & !REPLY_BIT)?;
            return (entry.downstream() == Some(from)).then_some((entry, Side::Downstream));
        }
        let id = *self.remote.get(&Leg {
            peer: from,
            id: wire_id,
        })?;
        self.get(id).map(|entry| (entry, Side::Upstream))
    }

    /// Removes an entry and its leg bindings.
    pub fn remove(&self, id: u64) -> Option<Arc<StreamEntry>> {
        let entry = self.slots.write().remove(id)?;
        if let Some(leg) = entry.upstream() {
            self.remote.remove(&leg);
            let emptied = self.per_peer.get_mut(&leg.peer).is_some_and(|mut count| {
                *count = count.saturating_sub(1);
                *count == 0
            });
            if emptied {
                self.per_peer.remove_if(&leg.peer, |_, count| *count == 0);
            }
        }
        debug!(
            stream_id = id,
            request_id = %entry.request_id(),
            state = %entry.state(),
            "Stream removed"
        );
        Some(entry)
    }

    /// Every live entry.
    #[must_use]
    pub fn all(&self) -> Vec<Arc<StreamEntry>> {
        self.slots.read().values().cloned().collect()
    }

    /// Entries with a leg to `peer`.
    #[must_use]
    pub fn streams_via(&self, peer: AgentId) -> Vec<Arc<StreamEntry>> {
        self.slots
            .read()
            .values()
            .filter(|e| e.downstream() == Some(peer) || e.upstream().is_some_and(|l| l.peer == peer))
            .cloned()
            .collect()
    }

    /// Entries past their open or idle deadline, with the reset code.
    ///
    /// Local-exit streams are bounded by their sockets and never idle out.
    #[must_use]
    pub fn stale(
        &self,
        now: Instant,
        open_timeout: Duration,
        idle_timeout: Duration,
    ) -> Vec<(Arc<StreamEntry>, ErrorCode)> {
        self.slots
            .read()
            .values()
            .filter_map(|entry| {
                let state = entry.state();
                if state == StreamState::Opening
                    && now.saturating_duration_since(entry.created_at) > open_timeout
                {
                    Some((Arc::clone(entry), ErrorCode::Timeout))
                } else if state != StreamState::Opening
                    && entry.role() != StreamRole::LocalExit
                    && entry.idle_for(now) > idle_timeout
                {
                    Some((Arc::clone(entry), ErrorCode::IdleTimeout))
                } else {
                    None
                }
            })
            .collect()
    }

    /// Live streams.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.read().len()
    }

    /// Returns `true` when no stream is live.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Streams opened by `peer`.
    #[must_use]
    pub fn count_from(&self, peer: AgentId) -> usize {
        self.per_peer.get(&peer).map_or(0, |c| *c)
    }
}

impl std::fmt::Debug for StreamTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamTable")
            .field("streams", &self.len())
            .field("max_total", &self.max_total)
            .field("max_per_peer", &self.max_per_peer)
            .finish_non_exhaustive()
    }
}

// ============================================
// Tests
// ============================================

#[cfg(test)]
mod tests {
    use super::*;

    fn transit(from: AgentId, id: u64, to: AgentId) -> NewStream {
        NewStream {
            request_id: RequestId::new(7),
            role: StreamRole::Transit,
            upstream: Some(Leg { peer: from, id }),
            downstream: Some(to),
        }
    }

    #[test]
    fn test_full_lifecycle() {
        let s = StreamState::Opening;
        let s = s.apply(StreamEvent::Ack).unwrap();
        assert_eq!(s, StreamState::Open);
        let s = s.apply(StreamEvent::LocalFin).unwrap();
        assert_eq!(s, StreamState::HalfClosedLocal);
        let s = s.apply(StreamEvent::RemoteFin).unwrap();
        assert_eq!(s, StreamState::Closed);
        assert!(s.is_terminal());
    }

    #[test]
    fn test_remote_fin_first() {
        let s = StreamState::Open.apply(StreamEvent::RemoteFin).unwrap();
        assert_eq!(s, StreamState::HalfClosedRemote);
        assert_eq!(s.apply(StreamEvent::RemoteFin), Some(s));
        assert_eq!(s.apply(StreamEvent::LocalFin), Some(StreamState::Closed));
    }

    #[test]
    fn test_reset_from_any_live_state() {
        for state in [
            StreamState::Opening,
            StreamState::Open,
            StreamState::HalfClosedLocal,
            StreamState::HalfClosedRemote,
        ] {
            assert_eq!(state.apply(StreamEvent::Reset), Some(StreamState::Reset));
        }
        assert_eq!(StreamState::Closed.apply(StreamEvent::Reset), None);
        assert_eq!(StreamState::Reset.apply(StreamEvent::Close), None);
    }

    #[test]
    fn test_invalid_transitions() {
        assert_eq!(StreamState::Opening.apply(StreamEvent::LocalFin), None);
        assert_eq!(StreamState::Opening.apply(StreamEvent::RemoteFin), None);
        assert_eq!(StreamState::Open.apply(StreamEvent::Ack), None);
    }

    #[test]
    fn test_resolve_both_directions() {
        let table = StreamTable::new(10, 10);
        let (u, d) = (AgentId::generate(), AgentId::generate());
        let entry = table.allocate(transit(u, 5, d)).unwrap();

        let (found, side) = table.resolve(u, 5).unwrap();
        assert_eq!(found.id(), entry.id());
        assert_eq!(side, Side::Upstream);

        let (found, side) = table.resolve(d, entry.id() | REPLY_BIT).unwrap();
        assert_eq!(found.id(), entry.id());
        assert_eq!(side, Side::Downstream);

        // Reply from the wrong neighbor is not ours.
        assert!(table.resolve(u, entry.id() | REPLY_BIT).is_none());

        assert_eq!(entry.wire_to(Side::Upstream), Some((u, 5 | REPLY_BIT)));
        assert_eq!(entry.wire_to(Side::Downstream), Some((d, entry.id())));
    }

    #[tokio::test]
    async fn test_send_credit_is_granted_and_capped() {
        let table = StreamTable::new(10, 10);
        let (u, d) = (AgentId::generate(), AgentId::generate());
        let entry = table.allocate(transit(u, 1, d)).unwrap();
        assert_eq!(entry.send_credit(), 0);

        entry.grant_send_credit(2);
        assert!(entry.acquire_send_credit().await);
        assert!(entry.acquire_send_credit().await);
        assert_eq!(entry.send_credit(), 0);

        let blocked =
            tokio::time::timeout(Duration::from_millis(50), entry.acquire_send_credit()).await;
        assert!(blocked.is_err());

        entry.grant_send_credit(u32::MAX);
        assert_eq!(entry.send_credit(), MAX_SEND_CREDIT);
    }

    #[test]
    fn test_total_limit() {
        let table = StreamTable::new(1, 10);
        let (u, d) = (AgentId::generate(), AgentId::generate());
        table.allocate(transit(u, 1, d)).unwrap();
        let err = table.allocate(transit(u, 2, d)).unwrap_err();
        assert_eq!(err.error_code(), ErrorCode::ResourceLimit);
    }

    #[test]
    fn test_per_peer_limit_counts_upstream() {
        let table = StreamTable::new(10, 1);
        let (u, v, d) = (AgentId::generate(), AgentId::generate(), AgentId::generate());
        let first = table.allocate(transit(u, 1, d)).unwrap();
        assert!(table.allocate(transit(u, 2, d)).is_err());
        assert!(table.allocate(transit(v, 1, d)).is_ok());

        table.remove(first.id()).unwrap();
        assert_eq!(table.count_from(u), 0);
        assert!(table.allocate(transit(u, 3, d)).is_ok());
    }

    #[test]
    fn test_duplicate_upstream_id_rejected() {
        let table = StreamTable::new(10, 10);
        let (u, d) = (AgentId::generate(), AgentId::generate());
        table.allocate(transit(u, 1, d)).unwrap();
        assert!(matches!(
            table.allocate(transit(u, 1, d)),
            Err(AgentError::Protocol { .. })
        ));
    }

    #[test]
    fn test_remove_clears_bindings() {
        let table = StreamTable::new(10, 10);
        let (u, d) = (AgentId::generate(), AgentId::generate());
        let entry = table.allocate(transit(u, 9, d)).unwrap();
        table.remove(entry.id()).unwrap();

        assert!(table.resolve(u, 9).is_none());
        assert!(table.get(entry.id()).is_none());
        assert!(table.is_empty());
    }

    #[test]
    fn test_streams_via_and_stale() {
        let table = StreamTable::new(10, 10);
        let (u, d, other) = (AgentId::generate(), AgentId::generate(), AgentId::generate());
        let entry = table.allocate(transit(u, 1, d)).unwrap();

        assert_eq!(table.streams_via(u).len(), 1);
        assert_eq!(table.streams_via(d).len(), 1);
        assert!(table.streams_via(other).is_empty());

        let later = Instant::now() + Duration::from_secs(5);
        let stale = table.stale(later, Duration::from_secs(1), Duration::from_secs(60));
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].1, ErrorCode::Timeout);

        entry.apply(StreamEvent::Ack);
        let stale = table.stale(later, Duration::from_secs(1), Duration::from_secs(2));
        assert_eq!(stale[0].1, ErrorCode::IdleTimeout);
    }
}
