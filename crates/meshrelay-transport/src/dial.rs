// ============================================
// File: crates/meshrelay-transport/src/dial.rs
// ============================================
//! # Outbound Dialer
//!
//! ## Creation Reason
//! Default `Dialer` used by exit agents: real TCP connects and UDP
//! socket binds on the host network.
//!
//! ## Main Functionality
//! - `resolve`: `TargetAddr` → `SocketAddr` (domains via the system resolver)
//! - `TcpDialer::connect`: timeout-bounded connect with error classification
//! - `TcpDialer::bind_udp`: dual-stack UDP socket per association
//!
//! ## Last Modified
//! v0.1.0 - Initial dialer

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tracing::debug;

use meshrelay_core::protocol::{Host, TargetAddr};

use crate::error::{Result, TransportError};
use crate::traits::{DatagramSocket, DialedStream, Dialer};
use crate::udp::UdpDatagramSocket;

// ============================================
// Resolution
// ============================================

/// Resolves a target to one socket address.
///
/// IP targets resolve without I/O. Domain targets take the first
/// address the system resolver returns.
///
/// # Errors
/// `ResolveFailed` if the lookup fails or yields nothing.
pub async fn resolve(target: &TargetAddr) -> Result<SocketAddr> {
    match &target.host {
        Host::Ip(ip) => Ok(SocketAddr::new(*ip, target.port)),
        Host::Domain(name) => {
            let mut addrs = tokio::net::lookup_host((name.as_str(), target.port))
                .await
                .map_err(|e| TransportError::ResolveFailed {
                    host: name.clone(),
                    reason: e.to_string(),
                })?;
            addrs.next().ok_or_else(|| TransportError::ResolveFailed {
                host: name.clone(),
                reason: "no addresses".into(),
            })
        }
    }
}

// ============================================
// TcpDialer
// ============================================

/// Dials the host network directly.
#[derive(Debug, Clone, Default)]
pub struct TcpDialer {
    udp_bind: Option<SocketAddr>,
}

impl TcpDialer {
    /// Creates a dialer with dual-stack UDP binds.
    #[must_use]
    pub const fn new() -> Self {
        Self { udp_bind: None }
    }

    /// Pins UDP association sockets to a local address.
    #[must_use]
    pub const fn with_udp_bind(mut self, addr: SocketAddr) -> Self {
        self.udp_bind = Some(addr);
        self
    }
}

#[async_trait]
impl Dialer for TcpDialer {
    async fn connect(&self, target: &TargetAddr, timeout: Duration) -> Result<DialedStream> {
        let dial = async {
            let addr = resolve(target).await?;
            TcpStream::connect(addr)
                .await
                .map_err(|e| TransportError::from_connect(target.to_string(), e))
        };

        let stream = tokio::time::timeout(timeout, dial)
            .await
            .map_err(|_| TransportError::timeout(format!("connect to {target}")))??;

        stream
            .set_nodelay(true)
            .map_err(|e| TransportError::io("setting TCP_NODELAY", e))?;
        let bound_addr = stream
            .local_addr()
            .map_err(|e| TransportError::io("reading local address", e))?;

        debug!(target = %target, bound = %bound_addr, "Outbound connection established");

        Ok(DialedStream {
            stream: Box::new(stream),
            bound_addr,
        })
    }

    async fn bind_udp(&self) -> Result<Arc<dyn DatagramSocket>> {
        let socket = match self.udp_bind {
            Some(addr) => UdpDatagramSocket::bind(addr)?,
            None => UdpDatagramSocket::bind_dual_stack()?,
        };
        Ok(Arc::new(socket))
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
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_resolve_ip_without_lookup() {
        let target: TargetAddr = "10.1.2.3:80".parse().unwrap();
        assert_eq!(resolve(&target).await.unwrap(), "10.1.2.3:80".parse().unwrap());
    }

    #[tokio::test]
    async fn test_resolve_localhost_domain() {
        let target = TargetAddr::domain("localhost", 8080).unwrap();
        let addr = resolve(&target).await.unwrap();
        assert!(addr.ip().is_loopback());
        assert_eq!(addr.port(), 8080);
    }

    #[tokio::test]
    async fn test_connect_and_exchange() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target = TargetAddr::from(listener.local_addr().unwrap());

        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4];
            sock.read_exact(&mut buf).await.unwrap();
            sock.write_all(&buf).await.unwrap();
        });

        let mut dialed = TcpDialer::new()
            .connect(&target, Duration::from_secs(2))
            .await
            .unwrap();
        assert!(dialed.bound_addr.ip().is_loopback());

        dialed.stream.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        dialed.stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_refused_maps_to_code() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target = TargetAddr::from(listener.local_addr().unwrap());
        drop(listener);

        let err = TcpDialer::new()
            .connect(&target, Duration::from_secs(2))
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), ErrorCode::Refused);
    }
}
