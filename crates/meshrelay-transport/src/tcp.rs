// ============================================
// File: crates/meshrelay-transport/src/tcp.rs
// ============================================
//! # TCP Peer Link
//!
//! ## Creation Reason
//! Default `PeerLink` over a plain TCP connection between two agents.
//! TLS or other session establishment is layered outside the agent.
//!
//! ## Main Functionality
//! - `TcpPeerLink::connect`: dial a neighbor with a timeout
//! - `TcpPeerLink::new`: wrap an accepted connection
//! - Frame reassembly using the core frame codec header
//!
//! ## Read Path
//! ```text
//! socket ──read──► BytesMut buffer
//!                     │ FrameCodec::check_complete
//!                     ├── None      → read more
//!                     └── Some(len) → split_to(len) → one frame
//! ```
//!
//! ## ⚠️ Important Note for Next Developer
//! - An oversized header is a fatal framing error for the link: the
//!   stream cannot be resynchronised after it
//! - TCP_NODELAY is set; frames are already batched by the writer task
//!
//! ## Last Modified
//! v0.1.0 - Initial TCP link

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex};
use tracing::{debug, trace};

use meshrelay_core::error::CoreError;
use meshrelay_core::protocol::FrameCodec;

use crate::error::{Result, TransportError};
use crate::traits::PeerLink;

/// Initial read buffer capacity.
const READ_BUFFER_SIZE: usize = 32 * 1024;

// ============================================
// TcpPeerLink
// ============================================

/// `PeerLink` over one TCP connection.
pub struct TcpPeerLink {
    reader: Mutex<(OwnedReadHalf, BytesMut)>,
    writer: Mutex<OwnedWriteHalf>,
    codec: FrameCodec,
    remote: SocketAddr,
    active: AtomicBool,
    closed: watch::Sender<bool>,
}

impl TcpPeerLink {
    /// Wraps an established connection.
    ///
    /// # Errors
    /// Returns error if the peer address cannot be read.
    pub fn new(stream: TcpStream, codec: FrameCodec) -> Result<Self> {
        let remote = stream
            .peer_addr()
            .map_err(|e| TransportError::io("reading peer address", e))?;
        stream
            .set_nodelay(true)
            .map_err(|e| TransportError::io("setting TCP_NODELAY", e))?;
        let (read_half, write_half) = stream.into_split();
        let (closed, _) = watch::channel(false);

        debug!(remote = %remote, "TCP peer link established");

        Ok(Self {
            reader: Mutex::new((read_half, BytesMut::with_capacity(READ_BUFFER_SIZE))),
            writer: Mutex::new(write_half),
            codec,
            remote,
            active: AtomicBool::new(true),
            closed,
        })
    }

    /// Connects to a neighbor agent.
    ///
    /// # Errors
    /// Dial errors classified by [`TransportError::from_connect`].
    pub async fn connect(addr: SocketAddr, codec: FrameCodec, timeout: Duration) -> Result<Self> {
        let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| TransportError::timeout(format!("connect to peer {addr}")))?
            .map_err(|e| TransportError::from_connect(addr.to_string(), e))?;
        Self::new(stream, codec)
    }

    /// Remote socket address.
    #[must_use]
    pub const fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    async fn read_frame(&self) -> Result<Option<Bytes>> {
        let mut guard = self.reader.lock().await;
        let (socket, buf) = &mut *guard;

        loop {
            if let Some(len) = self.codec.check_complete(buf)? {
                let frame = buf.split_to(len).freeze();
                trace!(remote = %self.remote, len, "Frame received");
                return Ok(Some(frame));
            }

            let n = socket
                .read_buf(buf)
                .await
                .map_err(|e| TransportError::ReceiveFailed {
                    link: self.remote.to_string(),
                    reason: e.to_string(),
                })?;

            if n == 0 {
                if buf.is_empty() {
                    return Ok(None);
                }
                return Err(CoreError::Truncated {
                    expected: buf.len() + 1,
                    actual: buf.len(),
                }
                .into());
            }
        }
    }
}

#[async_trait]
impl PeerLink for TcpPeerLink {
    async fn send(&self, frame: Bytes) -> Result<()> {
        if !self.is_active() {
            return Err(TransportError::LinkClosed);
        }
        let mut writer = self.writer.lock().await;
        writer
            .write_all(&frame)
            .await
            .map_err(|e| TransportError::SendFailed {
                link: self.remote.to_string(),
                reason: e.to_string(),
            })?;
        trace!(remote = %self.remote, len = frame.len(), "Frame sent");
        Ok(())
    }

    async fn recv(&self) -> Result<Option<Bytes>> {
        let mut closed = self.closed.subscribe();
        if *closed.borrow() {
            return Ok(None);
        }
        tokio::select! {
            result = self.read_frame() => result,
            _ = closed.changed() => Ok(None),
        }
    }

    async fn close(&self) -> Result<()> {
        if !self.active.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        self.closed.send_replace(true);
        let mut writer = self.writer.lock().await;
        // Peer may already be gone.
        let _ = writer.shutdown().await;
        debug!(remote = %self.remote, "TCP peer link closed");
        Ok(())
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    fn remote_label(&self) -> String {
        format!("tcp://{}", self.remote)
    }
}

impl std::fmt::Debug for TcpPeerLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpPeerLink")
            .field("remote", &self.remote)
            .field("active", &self.is_active())
            .finish_non_exhaustive()
    }
}

// ============================================
// Tests
// ============================================

#[cfg(test)]
mod tests {
    use super::*;
    use meshrelay_core::protocol::{Frame, FrameType, RawFrame};
    use tokio::net::TcpListener;

    async fn linked_pair() -> (TcpPeerLink, TcpPeerLink) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let codec = FrameCodec::default();

        let (client, accepted) = tokio::join!(
            TcpPeerLink::connect(addr, codec, Duration::from_secs(2)),
            listener.accept()
        );
        let server = TcpPeerLink::new(accepted.unwrap().0, codec).unwrap();
        (client.unwrap(), server)
    }

    fn encoded(frame: Frame) -> Bytes {
        FrameCodec::default().to_bytes(&RawFrame::from(frame)).unwrap()
    }

    #[tokio::test]
    async fn test_frames_cross_link_in_order() {
        let (client, server) = linked_pair().await;

        let first = encoded(Frame::new(FrameType::StreamData, 3, &b"one"[..]));
        let second = encoded(Frame::empty(FrameType::Keepalive, 0));
        client.send(first.clone()).await.unwrap();
        client.send(second.clone()).await.unwrap();

        assert_eq!(server.recv().await.unwrap(), Some(first));
        assert_eq!(server.recv().await.unwrap(), Some(second));
    }

    #[tokio::test]
    async fn test_remote_close_is_end_of_stream() {
        let (client, server) = linked_pair().await;
        client.close().await.unwrap();

        assert!(!client.is_active());
        assert!(matches!(client.send(Bytes::new()).await, Err(TransportError::LinkClosed)));
        assert_eq!(server.recv().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(
            TcpPeerLink::connect(addr, FrameCodec::default(), Duration::from_secs(2)),
            listener.accept()
        );
        let server = TcpPeerLink::new(accepted.unwrap().0, FrameCodec::new(8)).unwrap();

        let big = encoded(Frame::new(FrameType::StreamData, 1, vec![0u8; 64]));
        client.unwrap().send(big).await.unwrap();
        assert!(matches!(
            server.recv().await,
            Err(TransportError::Framing(CoreError::PayloadTooLarge { .. }))
        ));
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = TcpPeerLink::connect(addr, FrameCodec::default(), Duration::from_secs(2))
            .await
            .unwrap_err();
        assert!(err.is_dial_error());
    }
}
