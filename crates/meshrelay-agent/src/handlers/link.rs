// ============================================
// File: crates/meshrelay-agent/src/handlers/link.rs
// ============================================
//! # Peer Link Lifecycle
//!
//! ## Creation Reason
//! Turns a connected `PeerLink` into an attached neighbor: identifies
//! the other side, runs its frame pumps and liveness timer, and releases
//! everything that crossed it once it goes away.
//!
//! ## Main Functionality
//! - `RelayDispatcher::attach_link`: `PEER_HELLO` exchange and registration
//! - Writer task: outbound queue → codec → link
//! - Reader task: link → codec → dispatcher
//! - Keepalive task: `KEEPALIVE` every interval, silence detection
//!
//! ## Link Lifecycle
//! ```text
//!  connect/accept
//!       │
//!       ▼
//!  PEER_HELLO ⇄ PEER_HELLO ──(timeout / bad version / duplicate)──► close
//!       │
//!       ▼
//!  registered ──► table dump sent
//!       │
//!       ▼
//!  reader ends (EOF, error, silence, shutdown)
//!       │
//!       ▼
//!  unregister → reset streams → close associations → withdraw routes
//! ```
//!
//! ## ⚠️ Important Note for Next Developer
//! - `PEER_HELLO` must be the first frame in both directions
//! - A second link to an already attached agent is refused; the first
//!   one stays
//! - The peer cancel token is a child of the agent shutdown token
//! - One undecodable frame is dropped, not the link; the link layer
//!   already delimits frames so the next one is unaffected
//!
//! ## Last Modified
//! v0.1.0 - Initial link lifecycle

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use meshrelay_common::AgentId;
use meshrelay_core::protocol::{
    Frame, FrameType, Payload, PeerHello, RawFrame, CONTROL_STREAM_ID, PROTOCOL_VERSION,
};
use meshrelay_transport::PeerLink;

use crate::error::{AgentError, Result};
use crate::handlers::dispatcher::RelayDispatcher;
use crate::services::PeerHandle;

impl RelayDispatcher {
    /// Attaches a connected link and starts its tasks.
    ///
    /// Returns the neighbor's handle; its cancel token fires once the
    /// link is gone.
    ///
    /// # Errors
    /// - `PeerHandshake` on timeout, malformed hello, version mismatch or
    ///   a hello carrying this agent's own id
    /// - `PeerExists` if the neighbor is already attached
    ///
    /// The link is closed on every error.
    pub async fn attach_link(self: &Arc<Self>, link: Arc<dyn PeerLink>) -> Result<Arc<PeerHandle>> {
        self.ensure_running()?;
        let hello = match self.exchange_hello(link.as_ref()).await {
            Ok(hello) => hello,
            Err(e) => {
                let _ = link.close().await;
                return Err(e);
            }
        };

        let (tx, rx) = mpsc::channel(self.settings.peer_queue_frames);
        let handle = Arc::new(PeerHandle::new(
            hello.agent_id,
            hello.name,
            link.remote_label(),
            tx,
            self.shutdown_token().child_token(),
        ));
        if let Err(e) = self.peers.insert(Arc::clone(&handle)) {
            warn!(peer = %hello.agent_id, link = %link.remote_label(), "Duplicate link refused");
            let _ = link.close().await;
            return Err(e);
        }

        tokio::spawn(Arc::clone(self).run_link_writer(Arc::clone(&handle), Arc::clone(&link), rx));
        tokio::spawn(Arc::clone(self).run_link_keepalive(Arc::clone(&handle)));
        tokio::spawn(Arc::clone(self).run_link_reader(Arc::clone(&handle), link));

        let sent = self.send_table_dump(&handle);
        debug!(peer = %handle.id(), adverts = sent, "Sent route table to new peer");
        Ok(handle)
    }

    async fn exchange_hello(&self, link: &dyn PeerLink) -> Result<PeerHello> {
        let ours = PeerHello::new(self.local_id, self.settings.display_name.clone());
        let bytes = self
            .codec
            .to_bytes(&RawFrame::from(ours.to_frame(CONTROL_STREAM_ID)))?;
        link.send(bytes).await?;

        let received = tokio::time::timeout(self.settings.handshake_timeout, link.recv())
            .await
            .map_err(|_| AgentError::PeerHandshake {
                reason: "timed out waiting for PEER_HELLO".into(),
            })??;
        let Some(mut bytes) = received else {
            return Err(AgentError::PeerHandshake {
                reason: "link closed before PEER_HELLO".into(),
            });
        };

        let frame = self.codec.decode_raw(&mut bytes)?;
        if frame.frame_type().ok() != Some(FrameType::PeerHello) {
            return Err(AgentError::PeerHandshake {
                reason: format!("expected PEER_HELLO, got type 0x{:02x}", frame.type_byte),
            });
        }
        let theirs = PeerHello::from_bytes(frame.payload).map_err(|e| AgentError::PeerHandshake {
            reason: format!("malformed PEER_HELLO: {e}"),
        })?;

        if theirs.version != PROTOCOL_VERSION {
            return Err(AgentError::PeerHandshake {
                reason: format!(
                    "protocol version {} not supported (expected {})",
                    theirs.version, PROTOCOL_VERSION
                ),
            });
        }
        if theirs.agent_id == self.local_id {
            return Err(AgentError::PeerHandshake {
                reason: "peer presented this agent's own id".into(),
            });
        }
        Ok(theirs)
    }

    /// Queues own exits and best learned routes for `peer`.
    fn send_table_dump(&self, peer: &PeerHandle) -> usize {
        self.flooder
            .table_dump()
            .iter()
            .filter(|adv| !adv.seen_by.contains(&peer.id()))
            .filter(|adv| peer.try_send(adv.to_frame(CONTROL_STREAM_ID)))
            .count()
    }

    // ========================================
    // Link Tasks
    // ========================================

    async fn run_link_writer(
        self: Arc<Self>,
        peer: Arc<PeerHandle>,
        link: Arc<dyn PeerLink>,
        mut rx: mpsc::Receiver<RawFrame>,
    ) {
        let cancel = peer.cancel_token().clone();
        loop {
            let frame = tokio::select! {
                () = cancel.cancelled() => break,
                frame = rx.recv() => frame,
            };
            let Some(frame) = frame else {
                break;
            };
            let bytes = match self.codec.to_bytes(&frame) {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!(peer = %peer.id(), error = %e, "Dropping unencodable frame");
                    continue;
                }
            };
            if let Err(e) = link.send(bytes).await {
                debug!(peer = %peer.id(), error = %e, "Link write failed");
                cancel.cancel();
                break;
            }
        }
        debug!(peer = %peer.id(), "Link writer exiting");
    }

    async fn run_link_reader(self: Arc<Self>, peer: Arc<PeerHandle>, link: Arc<dyn PeerLink>) {
        let id: AgentId = peer.id();
        let cancel = peer.cancel_token().clone();

        loop {
            let received = tokio::select! {
                () = cancel.cancelled() => break,
                received = link.recv() => received,
            };
            let mut bytes = match received {
                Ok(Some(bytes)) => bytes,
                Ok(None) => {
                    debug!(peer = %id, "Link closed by peer");
                    break;
                }
                Err(e) => {
                    debug!(peer = %id, error = %e, "Link read failed");
                    break;
                }
            };
            peer.mark_seen();
            let frame = match self.codec.decode_raw(&mut bytes) {
                Ok(frame) => frame,
                Err(e) => {
                    warn!(peer = %id, error = %e, len = bytes.len(), "Undecodable frame dropped");
                    continue;
                }
            };
            self.handle_frame(id, frame).await;
        }

        cancel.cancel();
        if self.peers.remove(&peer) {
            self.peer_lost(id).await;
        }
        let _ = link.close().await;
        info!(
            peer = %id,
            name = %peer.name(),
            uptime_secs = peer.uptime().as_secs(),
            "Peer detached"
        );
    }

    async fn run_link_keepalive(self: Arc<Self>, peer: Arc<PeerHandle>) {
        let cancel = peer.cancel_token().clone();
        let mut ticker = tokio::time::interval(self.settings.keepalive_interval);
        ticker.tick().await;

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if peer.is_silent(self.settings.peer_timeout) {
                        warn!(
                            peer = %peer.id(),
                            timeout_secs = self.settings.peer_timeout.as_secs(),
                            "Peer silent, declaring link lost"
                        );
                        cancel.cancel();
                        break;
                    }
                    peer.try_send(Frame::empty(FrameType::Keepalive, CONTROL_STREAM_ID));
                }
            }
        }
    }
}

// ============================================
// Tests
// ============================================
