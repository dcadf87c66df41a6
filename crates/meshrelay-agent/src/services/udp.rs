// ============================================
// File: crates/meshrelay-agent/src/services/udp.rs
// ============================================
//! # UDP Association Table
//!
//! ## Creation Reason
//! Connectionless counterpart of the stream table. An association is one
//! client UDP session relayed to one exit socket; every datagram carries
//! its own destination.
//!
//! ## Main Functionality
//! - `AssociationEntry`: legs, session halves, exit socket, inbound queue
//! - `AssociationTable`: slot-allocated ids, wire-id resolution, the
//!   `max_associations` limit, idle sweep
//!
//! ## ⚠️ Important Note for Next Developer
//! - Wire ids follow the same reply-bit scheme as streams, in a separate
//!   id space (UDP frame types never address a stream)
//! - Nothing here blocks; full queues drop datagrams
//!
//! ## Last Modified
//! v0.1.0 - Initial association table

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use meshrelay_common::time::AtomicInstant;
use meshrelay_common::{AgentId, RequestId};
use meshrelay_core::crypto::{InitiatorHandshake, Opener, Sealer};
use meshrelay_core::protocol::TargetAddr;
use meshrelay_transport::DatagramSocket;

use crate::error::{AgentError, Result};
use crate::services::slots::{SlotTable, REPLY_BIT};
use crate::services::stream::{Leg, Side};

/// Part this hop plays in an association.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssociationRole {
    /// Opened through the ingress API.
    Ingress,
    /// Relays sealed datagrams between two neighbors.
    Transit,
    /// Owns the outbound socket for a neighbor.
    Exit,
    /// Ingress and socket on this agent.
    LocalExit,
}

/// Datagram delivered to an ingress handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedDatagram {
    /// Plaintext.
    pub payload: Bytes,
    /// Address the exit received it from.
    pub from: TargetAddr,
}

/// Ingress-side state held until the open is answered.
pub struct PendingUdpOpen {
    /// Key exchange in progress.
    pub handshake: InitiatorHandshake,
    /// Wakes the caller with the exit socket address or the failure.
    pub reply: oneshot::Sender<Result<SocketAddr>>,
}

/// Parameters of a new association.
#[derive(Debug, Clone, Copy)]
pub struct NewAssociation {
    /// End-to-end id.
    pub request_id: RequestId,
    /// Part this hop plays.
    pub role: AssociationRole,
    /// Neighbor the open came from.
    pub upstream: Option<Leg>,
    /// Neighbor the open goes to.
    pub downstream: Option<AgentId>,
}

// ============================================
// AssociationEntry
// ============================================

/// One association at this hop.
pub struct AssociationEntry {
    id: u64,
    request_id: RequestId,
    role: AssociationRole,
    upstream: Option<Leg>,
    downstream: Option<AgentId>,
    open: Mutex<bool>,
    cancel: CancellationToken,
    last_activity: AtomicInstant,
    created_at: Instant,
    sealer: Mutex<Option<Sealer>>,
    opener: Mutex<Option<Opener>>,
    socket: Mutex<Option<Arc<dyn DatagramSocket>>>,
    inbound: Mutex<Option<mpsc::Sender<ReceivedDatagram>>>,
    pending: Mutex<Option<PendingUdpOpen>>,
}

impl AssociationEntry {
    fn new(id: u64, params: NewAssociation) -> Self {
        Self {
            id,
            request_id: params.request_id,
            role: params.role,
            upstream: params.upstream,
            downstream: params.downstream,
            open: Mutex::new(false),
            cancel: CancellationToken::new(),
            last_activity: AtomicInstant::now(),
            created_at: Instant::now(),
            sealer: Mutex::new(None),
            opener: Mutex::new(None),
            socket: Mutex::new(None),
            inbound: Mutex::new(None),
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
    pub const fn role(&self) -> AssociationRole {
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

    /// Returns `true` once acked.
    #[must_use]
    pub fn is_open(&self) -> bool {
        *self.open.lock()
    }

    /// Marks the association acked.
    pub fn mark_open(&self) {
        *self.open.lock() = true;
    }

    /// Stops every task of the association.
    #[must_use]
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Records traffic.
    pub fn touch(&self) {
        self.last_activity.touch();
    }

    /// Peer and wire id for a frame leaving through `side`.
    #[must_use]
    pub fn wire_to(&self, side: Side) -> Option<(AgentId, u64)> {
        match side {
            Side::Upstream => self.upstream.map(|leg| (leg.peer, leg.id | REPLY_BIT)),
            Side::Downstream => self.downstream.map(|peer| (peer, self.id)),
        }
    }

    /// Installs the session halves.
    pub fn set_cipher(&self, sealer: Sealer, opener: Opener) {
        *self.sealer.lock() = Some(sealer);
        *self.opener.lock() = Some(opener);
    }

    /// Seals with the send half.
    ///
    /// # Errors
    /// `Protocol` before the handshake finished, or a crypto error.
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut guard = self.sealer.lock();
        let sealer = guard
            .as_mut()
            .ok_or_else(|| AgentError::protocol("association has no session yet"))?;
        Ok(sealer.seal(plaintext)?)
    }

    /// Opens with the receive half.
    ///
    /// # Errors
    /// `Protocol` before the handshake finished, or a crypto error.
    pub fn open(&self, sealed: &[u8]) -> Result<Vec<u8>> {
        let mut guard = self.opener.lock();
        let opener = guard
            .as_mut()
            .ok_or_else(|| AgentError::protocol("association has no session yet"))?;
        Ok(opener.open(sealed)?)
    }

    /// Installs the exit socket.
    pub fn set_socket(&self, socket: Arc<dyn DatagramSocket>) {
        *self.socket.lock() = Some(socket);
    }

    /// Exit socket.
    #[must_use]
    pub fn socket(&self) -> Option<Arc<dyn DatagramSocket>> {
        self.socket.lock().clone()
    }

    /// Installs the ingress delivery queue.
    pub fn set_inbound(&self, sender: mpsc::Sender<ReceivedDatagram>) {
        *self.inbound.lock() = Some(sender);
    }

    /// Ingress delivery queue.
    #[must_use]
    pub fn inbound(&self) -> Option<mpsc::Sender<ReceivedDatagram>> {
        self.inbound.lock().clone()
    }

    /// Stores ingress open state.
    pub fn set_pending(&self, pending: PendingUdpOpen) {
        *self.pending.lock() = Some(pending);
    }

    /// Takes ingress open state.
    pub fn take_pending(&self) -> Option<PendingUdpOpen> {
        self.pending.lock().take()
    }

    /// Drops queues and socket references.
    pub fn release(&self) {
        self.cancel.cancel();
        self.inbound.lock().take();
        self.socket.lock().take();
    }
}

impl std::fmt::Debug for AssociationEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AssociationEntry")
            .field("id", &self.id)
            .field("request_id", &self.request_id)
            .field("role", &self.role)
            .field("open", &self.is_open())
            .finish_non_exhaustive()
    }
}

// ============================================
// AssociationTable
// ============================================

/// All UDP associations at this agent.
pub struct AssociationTable {
    slots: RwLock<SlotTable<Arc<AssociationEntry>>>,
    remote: DashMap<Leg, u64>,
    max_associations: usize,
}

impl AssociationTable {
    /// Creates an empty table.
    #[must_use]
    pub fn new(max_associations: usize) -> Self {
        Self {
            slots: RwLock::new(SlotTable::new()),
            remote: DashMap::new(),
            max_associations,
        }
    }

    /// Admits a new association.
    ///
    /// # Errors
    /// `ResourceLimit` at `max_associations`; `Protocol` for a reused
    /// upstream id.
    pub fn allocate(&self, params: NewAssociation) -> Result<Arc<AssociationEntry>> {
        let mut slots = self.slots.write();
        if slots.len() >= self.max_associations {
            return Err(AgentError::ResourceLimit {
                resource: "udp associations",
                limit: self.max_associations,
            });
        }
        if let Some(leg) = params.upstream {
            if self.remote.contains_key(&leg) {
                return Err(AgentError::protocol(format!(
                    "association id {} from {} already open",
                    leg.id, leg.peer
                )));
            }
        }

        let mut created = None;
        slots
            .insert_with(|id| {
                let entry = Arc::new(AssociationEntry::new(id, params));
                created = Some(Arc::clone(&entry));
                entry
            })
            .ok_or(AgentError::ResourceLimit {
                resource: "association ids",
                limit: u32::MAX as usize,
            })?;
        let entry = created.ok_or_else(|| AgentError::internal("slot insert produced no entry"))?;

        if let Some(leg) = params.upstream {
            self.remote.insert(leg, entry.id());
        }
        debug!(
            association_id = entry.id(),
            request_id = %entry.request_id(),
            role = ?entry.role(),
            "Association allocated"
        );
        Ok(entry)
    }

    /// Entry for a hop-local id.
    #[must_use]
    pub fn get(&self, id: u64) -> Option<Arc<AssociationEntry>> {
        self.slots.read().get(id).cloned()
    }

    /// Entry and arrival side for a frame from `from` carrying `wire_id`.
    #[must_use]
    pub fn resolve(&self, from: AgentId, wire_id: u64) -> Option<(Arc<AssociationEntry>, Side)> {
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

    /// Removes an entry and releases its resources.
    pub fn remove(&self, id: u64) -> Option<Arc<AssociationEntry>> {
        let entry = self.slots.write().remove(id)?;
        if let Some(leg) = entry.upstream() {
            self.remote.remove(&leg);
        }
        entry.release();
        debug!(
            association_id = id,
            request_id = %entry.request_id(),
            "Association removed"
        );
        Some(entry)
    }

    /// Every live entry.
    #[must_use]
    pub fn all(&self) -> Vec<Arc<AssociationEntry>> {
        self.slots.read().values().cloned().collect()
    }

    /// Entries with a leg to `peer`.
    #[must_use]
    pub fn associations_via(&self, peer: AgentId) -> Vec<Arc<AssociationEntry>> {
        self.slots
            .read()
            .values()
            .filter(|e| e.downstream() == Some(peer) || e.upstream().is_some_and(|l| l.peer == peer))
            .cloned()
            .collect()
    }

    /// Entries unanswered past `open_timeout` or idle past `idle_timeout`.
    #[must_use]
    pub fn stale(
        &self,
        now: Instant,
        open_timeout: Duration,
        idle_timeout: Duration,
    ) -> Vec<Arc<AssociationEntry>> {
        self.slots
            .read()
            .values()
            .filter(|entry| {
                if entry.is_open() {
                    entry.last_activity.idle_for(now) > idle_timeout
                } else {
                    now.saturating_duration_since(entry.created_at) > open_timeout
                }
            })
            .cloned()
            .collect()
    }

    /// Live associations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.read().len()
    }

    /// Returns `true` when none are live.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for AssociationTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AssociationTable")
            .field("associations", &self.len())
            .field("max_associations", &self.max_associations)
            .finish_non_exhaustive()
    }
}

// ============================================
// Tests
// ============================================
