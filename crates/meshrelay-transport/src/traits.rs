// ============================================
// File: crates/meshrelay-transport/src/traits.rs
// ============================================
//! # Collaborator Traits
//!
//! ## Creation Reason
//! The relay core never touches sockets directly. It talks to three
//! narrow interfaces so the same dispatcher runs over TCP in production
//! and over in-memory pipes in tests.
//!
//! ## Main Functionality
//! - `PeerLink`: ordered, reliable, framed channel to one neighbor agent
//! - `Dialer`: outbound TCP connect and UDP bind at the exit
//! - `DatagramSocket`: bound UDP socket owned by one association
//! - `BoxedStream`: type-erased bidirectional byte stream
//!
//! ## Trait Relationships
//! ```text
//!  RelayDispatcher
//!     │ send(frame) / recv() -> frame
//!     ├──────────────► dyn PeerLink       (TcpPeerLink, MemoryLink, FaultyLink)
//!     │ connect(target) / bind_udp()
//!     └──────────────► dyn Dialer         (TcpDialer, MockDialer, FaultyDialer)
//!                         │
//!                         ├─► BoxedStream      (TcpStream, DuplexStream)
//!                         └─► dyn DatagramSocket (UdpDatagramSocket, MemorySocket)
//! ```
//!
//! ## ⚠️ Important Note for Next Developer
//! - `PeerLink` MUST deliver frames in the order they were sent; the
//!   end-to-end replay watermark depends on it
//! - One `send` carries exactly one encoded frame, one `recv` returns
//!   exactly one encoded frame
//! - Implementations must be Send + Sync
//!
//! ## Last Modified
//! v0.1.0 - Initial trait definitions

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite};

use meshrelay_core::protocol::TargetAddr;

use crate::error::Result;

// ============================================
// Byte Streams
// ============================================

/// Bidirectional byte stream usable behind a `Box`.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> AsyncStream for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// Type-erased byte stream.
pub type BoxedStream = Box<dyn AsyncStream>;

/// Result of a successful outbound dial.
pub struct DialedStream {
    /// Connected stream
    pub stream: BoxedStream,
    /// Local address of the outbound socket
    pub bound_addr: SocketAddr,
}

impl std::fmt::Debug for DialedStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DialedStream")
            .field("bound_addr", &self.bound_addr)
            .finish_non_exhaustive()
    }
}

// ============================================
// PeerLink Trait
// ============================================

/// Framed, ordered, reliable channel to one neighbor agent.
///
/// # Example
/// ```ignore
/// async fn pump(link: &dyn PeerLink) -> Result<()> {
///     while let Some(frame) = link.recv().await? {
///         link.send(frame).await?;
///     }
///     Ok(())
/// }
/// ```
#[async_trait]
pub trait PeerLink: Send + Sync {
    /// Sends one encoded frame.
    ///
    /// # Errors
    /// `LinkClosed` after close, or the underlying write error.
    async fn send(&self, frame: Bytes) -> Result<()>;

    /// Receives one encoded frame; `Ok(None)` on orderly end of stream.
    ///
    /// Only one task may call `recv` at a time.
    ///
    /// # Errors
    /// Read or framing errors from the underlying transport.
    async fn recv(&self) -> Result<Option<Bytes>>;

    /// Closes the link. Pending and later `recv` calls return `Ok(None)`.
    ///
    /// # Errors
    /// Returns error if the underlying shutdown fails.
    async fn close(&self) -> Result<()>;

    /// Returns `true` until the link is closed.
    fn is_active(&self) -> bool;

    /// Human-readable remote description for logs.
    fn remote_label(&self) -> String;
}

// ============================================
// DatagramSocket Trait
// ============================================

/// A bound UDP socket owned by one association at the exit.
#[async_trait]
pub trait DatagramSocket: Send + Sync {
    /// Sends one datagram, resolving domain targets first.
    ///
    /// # Errors
    /// Resolution or send failure.
    async fn send_to(&self, payload: &[u8], target: &TargetAddr) -> Result<usize>;

    /// Receives one datagram.
    ///
    /// # Errors
    /// Receive failure or `ShuttingDown`.
    async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr)>;

    /// Local bound address.
    ///
    /// # Errors
    /// Returns error if the address cannot be determined.
    fn local_addr(&self) -> Result<SocketAddr>;
}

// ============================================
// Dialer Trait
// ============================================

/// Outbound connectivity used by the exit agent.
#[async_trait]
pub trait Dialer: Send + Sync {
    /// Opens a TCP connection to `target` within `timeout`.
    ///
    /// # Errors
    /// `ConnectionRefused`, `Unreachable`, `ResolveFailed` or `Timeout`.
    async fn connect(&self, target: &TargetAddr, timeout: Duration) -> Result<DialedStream>;

    /// Binds a fresh UDP socket for an association.
    ///
    /// # Errors
    /// `BindFailed` or an I/O error.
    async fn bind_udp(&self) -> Result<std::sync::Arc<dyn DatagramSocket>>;
}
