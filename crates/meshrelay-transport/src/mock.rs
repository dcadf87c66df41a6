// ============================================
// File: crates/meshrelay-transport/src/mock.rs
// ============================================
//! # Mock Dialer
//!
//! ## Creation Reason
//! Scripted `Dialer` for exit-side tests: decide per dial whether the
//! target accepts, refuses or hangs, and get hold of the far end of
//! every accepted connection.
//!
//! ## Main Functionality
//! - `DialOutcome` script consumed one entry per `connect`
//! - Accepted connections are `tokio::io::duplex` pairs; the test
//!   receives the remote end through `next_accepted`
//! - `bind_udp` hands out `MemorySocket`s, also observable by the test
//!
//! ## Usage in Tests
//! ```ignore
//! let dialer = Arc::new(MockDialer::new());
//! dialer.push_outcome(DialOutcome::Refuse);
//! // ... agent dials, gets ConnectionRefused ...
//! let conn = dialer.next_accepted().await.unwrap();  // later accepts
//! ```
//!
//! ## ⚠️ Important Note for Next Developer
//! - Test support only; do not use in production
//! - With an empty script every dial is accepted
//!
//! ## Last Modified
//! v0.1.0 - Initial mock dialer

use std::collections::VecDeque;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU16, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::DuplexStream;
use tokio::sync::mpsc;

use meshrelay_core::protocol::TargetAddr;

use crate::error::{Result, TransportError};
use crate::memory::MemorySocket;
use crate::traits::{DatagramSocket, DialedStream, Dialer};

// ============================================
// Constants
// ============================================

/// Buffer size of accepted duplex pipes.
const DUPLEX_BUFFER_SIZE: usize = 64 * 1024;

/// Address reported as the exit's outbound address.
const MOCK_EXIT_IP: Ipv4Addr = Ipv4Addr::new(192, 0, 2, 1);

// ============================================
// DialOutcome
// ============================================

/// What the next dial does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialOutcome {
    /// Connect succeeds.
    Accept,
    /// `ConnectionRefused`.
    Refuse,
    /// `Unreachable`.
    Unreachable,
    /// Waits out the dial timeout, then `Timeout`.
    Hang,
}

/// Far end of an accepted mock connection.
#[derive(Debug)]
pub struct AcceptedStream {
    /// Target the agent dialed
    pub target: TargetAddr,
    /// Remote end of the pipe; plays the destination server
    pub remote: DuplexStream,
}

// ============================================
// MockDialer
// ============================================

/// Scripted dialer.
pub struct MockDialer {
    script: Mutex<VecDeque<DialOutcome>>,
    dials: AtomicUsize,
    next_port: AtomicU16,
    accepted_tx: mpsc::UnboundedSender<AcceptedStream>,
    accepted_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<AcceptedStream>>,
    sockets_tx: mpsc::UnboundedSender<Arc<MemorySocket>>,
    sockets_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Arc<MemorySocket>>>,
}

impl MockDialer {
    /// Creates a dialer that accepts everything.
    #[must_use]
    pub fn new() -> Self {
        let (accepted_tx, accepted_rx) = mpsc::unbounded_channel();
        let (sockets_tx, sockets_rx) = mpsc::unbounded_channel();
        Self {
            script: Mutex::new(VecDeque::new()),
            dials: AtomicUsize::new(0),
            next_port: AtomicU16::new(40000),
            accepted_tx,
            accepted_rx: tokio::sync::Mutex::new(accepted_rx),
            sockets_tx,
            sockets_rx: tokio::sync::Mutex::new(sockets_rx),
        }
    }

    /// Appends an outcome for a future dial.
    pub fn push_outcome(&self, outcome: DialOutcome) {
        self.script.lock().push_back(outcome);
    }

    /// Number of `connect` calls so far.
    #[must_use]
    pub fn dial_count(&self) -> usize {
        self.dials.load(Ordering::Relaxed)
    }

    /// Waits for the next accepted connection.
    pub async fn next_accepted(&self) -> Option<AcceptedStream> {
        self.accepted_rx.lock().await.recv().await
    }

    /// Waits for the next socket handed out by `bind_udp`.
    pub async fn next_socket(&self) -> Option<Arc<MemorySocket>> {
        self.sockets_rx.lock().await.recv().await
    }

    fn next_addr(&self) -> SocketAddr {
        let port = self.next_port.fetch_add(1, Ordering::Relaxed);
        SocketAddr::new(IpAddr::V4(MOCK_EXIT_IP), port)
    }
}

impl Default for MockDialer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Dialer for MockDialer {
    async fn connect(&self, target: &TargetAddr, timeout: Duration) -> Result<DialedStream> {
        self.dials.fetch_add(1, Ordering::Relaxed);
        let outcome = self
            .script
            .lock()
            .pop_front()
            .unwrap_or(DialOutcome::Accept);

        match outcome {
            DialOutcome::Accept => {
                let (local, remote) = tokio::io::duplex(DUPLEX_BUFFER_SIZE);
                let _ = self.accepted_tx.send(AcceptedStream {
                    target: target.clone(),
                    remote,
                });
                Ok(DialedStream {
                    stream: Box::new(local),
                    bound_addr: self.next_addr(),
                })
            }
            DialOutcome::Refuse => Err(TransportError::ConnectionRefused {
                target: target.to_string(),
            }),
            DialOutcome::Unreachable => Err(TransportError::Unreachable {
                target: target.to_string(),
                reason: "scripted".into(),
            }),
            DialOutcome::Hang => {
                tokio::time::sleep(timeout).await;
                Err(TransportError::timeout(format!("connect to {target}")))
            }
        }
    }

    async fn bind_udp(&self) -> Result<Arc<dyn DatagramSocket>> {
        let socket = Arc::new(MemorySocket::new(self.next_addr()));
        let _ = self.sockets_tx.send(Arc::clone(&socket));
        Ok(socket)
    }
}

impl std::fmt::Debug for MockDialer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockDialer")
            .field("dials", &self.dial_count())
            .field("scripted", &self.script.lock().len())
            .finish_non_exhaustive()
    }
}

// ============================================
// Tests
// ============================================

#[cfg(test)]
mod tests {
    use super::*;
    use meshrelay_core::protocol::ErrorCode;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn target() -> TargetAddr {
        "1.2.3.4:80".parse().unwrap()
    }

    #[tokio::test]
    async fn test_accept_hands_out_remote_end() {
        let dialer = MockDialer::new();
        let mut dialed = dialer.connect(&target(), Duration::from_secs(1)).await.unwrap();
        let mut accepted = dialer.next_accepted().await.unwrap();

        assert_eq!(accepted.target, target());
        dialed.stream.write_all(b"hi").await.unwrap();
        let mut buf = [0u8; 2];
        accepted.remote.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi");
        assert_eq!(dialer.dial_count(), 1);
    }

    #[tokio::test]
    async fn test_script_consumed_in_order() {
        let dialer = MockDialer::new();
        dialer.push_outcome(DialOutcome::Refuse);
        dialer.push_outcome(DialOutcome::Unreachable);

        let err = dialer.connect(&target(), Duration::from_secs(1)).await.unwrap_err();
        assert_eq!(err.error_code(), ErrorCode::Refused);
        let err = dialer.connect(&target(), Duration::from_secs(1)).await.unwrap_err();
        assert_eq!(err.error_code(), ErrorCode::Unreachable);
        assert!(dialer.connect(&target(), Duration::from_secs(1)).await.is_ok());
    }

    #[tokio::test]
    async fn test_hang_times_out() {
        let dialer = MockDialer::new();
        dialer.push_outcome(DialOutcome::Hang);
        let err = dialer
            .connect(&target(), Duration::from_millis(20))
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), ErrorCode::Timeout);
    }

    #[tokio::test]
    async fn test_bind_udp_observable() {
        let dialer = MockDialer::new();
        let socket = dialer.bind_udp().await.unwrap();
        let observed = dialer.next_socket().await.unwrap();
        assert_eq!(socket.local_addr().unwrap(), observed.local_addr().unwrap());
    }
}
