// ============================================
// File: crates/meshrelay-agent/src/services/peers.rs
// ============================================
//! # Peer Registry
//!
//! ## Creation Reason
//! Tracks every directly connected agent and owns the bounded outbound
//! queue in front of each peer link.
//!
//! ## Main Functionality
//! - `PeerHandle`: outbound queue, cancellation, liveness, counters
//! - `PeerRegistry`: concurrent `AgentId → PeerHandle` map
//!
//! ## Frame Flow
//! ```text
//!  dispatcher / pumps ──send()──► [bounded queue] ──writer task──► PeerLink
//!  PeerLink ──reader task──► dispatcher.handle_frame()
//! ```
//!
//! ## ⚠️ Important Note for Next Developer
//! - `send` waits for queue space; that wait is the backpressure between
//!   a fast sender and a slow link
//! - `try_send` is for traffic that may be dropped (UDP, keepalives)
//!
//! ## Last Modified
//! v0.1.0 - Initial peer registry

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use meshrelay_common::time::AtomicInstant;
use meshrelay_common::AgentId;
use meshrelay_core::protocol::RawFrame;

use crate::error::{AgentError, Result};

// ============================================
// PeerStats
// ============================================

/// Per-peer frame counters.
#[derive(Debug, Default)]
pub struct PeerStats {
    /// Frames received.
    pub frames_in: AtomicU64,
    /// Frames queued for sending.
    pub frames_out: AtomicU64,
    /// Frames dropped because the queue was full.
    pub frames_dropped: AtomicU64,
}

/// Point-in-time copy of [`PeerStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerStatsSnapshot {
    /// Frames received.
    pub frames_in: u64,
    /// Frames queued for sending.
    pub frames_out: u64,
    /// Frames dropped.
    pub frames_dropped: u64,
}

impl PeerStats {
    /// Snapshot of the counters.
    #[must_use]
    pub fn snapshot(&self) -> PeerStatsSnapshot {
        PeerStatsSnapshot {
            frames_in: self.frames_in.load(Ordering::Relaxed),
            frames_out: self.frames_out.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
        }
    }
}

// ============================================
// PeerHandle
// ============================================

/// One attached neighbor.
pub struct PeerHandle {
    id: AgentId,
    name: String,
    label: String,
    outbound: mpsc::Sender<RawFrame>,
    cancel: CancellationToken,
    last_seen: AtomicInstant,
    connected_at: Instant,
    stats: PeerStats,
}

impl PeerHandle {
    /// Creates a handle feeding `outbound`.
    #[must_use]
    pub fn new(
        id: AgentId,
        name: impl Into<String>,
        label: impl Into<String>,
        outbound: mpsc::Sender<RawFrame>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            label: label.into(),
            outbound,
            cancel,
            last_seen: AtomicInstant::now(),
            connected_at: Instant::now(),
            stats: PeerStats::default(),
        }
    }

    /// Neighbor id.
    #[must_use]
    pub const fn id(&self) -> AgentId {
        self.id
    }

    /// Name from the neighbor's hello.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Link description.
    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Cancelled when the link goes away.
    #[must_use]
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Counters.
    #[must_use]
    pub fn stats(&self) -> &PeerStats {
        &self.stats
    }

    /// Time since connect.
    #[must_use]
    pub fn uptime(&self) -> Duration {
        self.connected_at.elapsed()
    }

    /// Records inbound traffic.
    pub fn mark_seen(&self) {
        self.last_seen.touch();
        self.stats.frames_in.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns `true` if nothing arrived for `timeout`.
    #[must_use]
    pub fn is_silent(&self, timeout: Duration) -> bool {
        self.last_seen.is_idle(timeout)
    }

    /// Queues a frame, waiting for space.
    ///
    /// # Errors
    /// `PeerNotFound` once the link is gone.
    pub async fn send(&self, frame: impl Into<RawFrame>) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(AgentError::PeerNotFound(self.id));
        }
        self.outbound
            .send(frame.into())
            .await
            .map_err(|_| AgentError::PeerNotFound(self.id))?;
        self.stats.frames_out.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Queues a frame, waiting at most `timeout` for space.
    ///
    /// # Errors
    /// - `PeerNotFound` once the link is gone
    /// - `PeerCongested` if the queue stayed full
    pub async fn send_timeout(&self, frame: impl Into<RawFrame>, timeout: Duration) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(AgentError::PeerNotFound(self.id));
        }
        match self.outbound.send_timeout(frame.into(), timeout).await {
            Ok(()) => {
                self.stats.frames_out.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(SendTimeoutError::Timeout(_)) => {
                self.stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
                Err(AgentError::PeerCongested(self.id))
            }
            Err(SendTimeoutError::Closed(_)) => Err(AgentError::PeerNotFound(self.id)),
        }
    }

    /// Queues a frame if there is space; returns `false` if dropped.
    pub fn try_send(&self, frame: impl Into<RawFrame>) -> bool {
        if self.outbound.try_send(frame.into()).is_ok() {
            self.stats.frames_out.fetch_add(1, Ordering::Relaxed);
            true
        } else {
            self.stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
            false
        }
    }
}

impl std::fmt::Debug for PeerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerHandle")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("label", &self.label)
            .finish_non_exhaustive()
    }
}

// ============================================
// PeerRegistry
// ============================================

/// All attached neighbors.
#[derive(Debug, Default)]
pub struct PeerRegistry {
    peers: DashMap<AgentId, Arc<PeerHandle>>,
}

impl PeerRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a neighbor.
    ///
    /// # Errors
    /// `PeerExists` if the id is already attached.
    pub fn insert(&self, handle: Arc<PeerHandle>) -> Result<()> {
        use dashmap::mapref::entry::Entry;
        match self.peers.entry(handle.id()) {
            Entry::Occupied(_) => Err(AgentError::PeerExists(handle.id())),
            Entry::Vacant(slot) => {
                info!(peer = %handle.id(), name = %handle.name(), link = %handle.label(), "Peer attached");
                slot.insert(handle);
                Ok(())
            }
        }
    }

    /// Handle for `id`.
    #[must_use]
    pub fn get(&self, id: &AgentId) -> Option<Arc<PeerHandle>> {
        self.peers.get(id).map(|h| Arc::clone(&h))
    }

    /// Removes `handle` if it is still the registered one for its id.
    pub fn remove(&self, handle: &Arc<PeerHandle>) -> bool {
        let removed = self
            .peers
            .remove_if(&handle.id(), |_, current| Arc::ptr_eq(current, handle))
            .is_some();
        if removed {
            debug!(peer = %handle.id(), "Peer removed from registry");
        }
        removed
    }

    /// Every handle.
    #[must_use]
    pub fn all(&self) -> Vec<Arc<PeerHandle>> {
        self.peers.iter().map(|h| Arc::clone(h.value())).collect()
    }

    /// Every handle except `exclude`.
    #[must_use]
    pub fn all_except(&self, exclude: AgentId) -> Vec<Arc<PeerHandle>> {
        self.peers
            .iter()
            .filter(|h| *h.key() != exclude)
            .map(|h| Arc::clone(h.value()))
            .collect()
    }

    /// Handles silent for longer than `timeout`.
    #[must_use]
    pub fn silent(&self, timeout: Duration) -> Vec<Arc<PeerHandle>> {
        self.peers
            .iter()
            .filter(|h| h.is_silent(timeout))
            .map(|h| Arc::clone(h.value()))
            .collect()
    }

    /// Attached neighbor ids.
    #[must_use]
    pub fn ids(&self) -> Vec<AgentId> {
        self.peers.iter().map(|h| *h.key()).collect()
    }

    /// Number of attached neighbors.
    #[must_use]
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    /// Returns `true` with no neighbors.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

// ============================================
// Tests
// ============================================
