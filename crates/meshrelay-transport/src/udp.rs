// ============================================
// File: crates/meshrelay-transport/src/udp.rs
// ============================================
//! # UDP Datagram Socket
//!
//! ## Creation Reason
//! Socket owned by one UDP association at the exit agent. Wraps a Tokio
//! UDP socket created through socket2 so it can be bound dual-stack.
//!
//! ## Main Functionality
//! - `UdpDatagramSocket::bind`: bind to a given address
//! - `UdpDatagramSocket::bind_dual_stack`: `[::]:0` accepting IPv4 too,
//!   falling back to `0.0.0.0:0` on hosts without IPv6
//! - Address family mapping between the socket and targets
//!
//! ## ⚠️ Important Note for Next Developer
//! - UDP is connectionless; nothing here retries
//! - Maximum UDP payload is ~65507 bytes
//!
//! ## Last Modified
//! v0.1.0 - Initial UDP datagram socket

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tracing::{debug, trace};

use meshrelay_core::protocol::TargetAddr;

use crate::dial::resolve;
use crate::error::{Result, TransportError};
use crate::traits::DatagramSocket;

// ============================================
// UdpDatagramSocket
// ============================================

/// Association-owned UDP socket.
pub struct UdpDatagramSocket {
    socket: UdpSocket,
    local_addr: SocketAddr,
    dual_stack: bool,
    shutdown: AtomicBool,
}

impl UdpDatagramSocket {
    /// Binds to `addr`.
    ///
    /// # Errors
    /// - `AddressInUse`: if the port is taken
    /// - `BindFailed`: any other bind failure
    pub fn bind(addr: SocketAddr) -> Result<Self> {
        Self::bind_with(addr, false)
    }

    /// Binds `[::]:0` with IPv4 mapping enabled, or `0.0.0.0:0` if the
    /// host has no IPv6.
    ///
    /// # Errors
    /// Returns error if neither bind succeeds.
    pub fn bind_dual_stack() -> Result<Self> {
        let v6 = SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0);
        match Self::bind_with(v6, true) {
            Ok(socket) => Ok(socket),
            Err(e) => {
                debug!(error = %e, "Dual-stack UDP bind failed, using IPv4 only");
                Self::bind(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0))
            }
        }
    }

    fn bind_with(addr: SocketAddr, dual_stack: bool) -> Result<Self> {
        let domain = if addr.is_ipv4() {
            Domain::IPV4
        } else {
            Domain::IPV6
        };

        let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))
            .map_err(|e| TransportError::io("creating UDP socket", e))?;
        if dual_stack {
            socket
                .set_only_v6(false)
                .map_err(|e| TransportError::io("clearing IPV6_V6ONLY", e))?;
        }
        socket
            .set_nonblocking(true)
            .map_err(|e| TransportError::io("setting non-blocking", e))?;
        socket.bind(&addr.into()).map_err(|e| {
            if e.kind() == std::io::ErrorKind::AddrInUse {
                TransportError::AddressInUse { addr }
            } else {
                TransportError::bind_failed(addr, e.to_string())
            }
        })?;

        let std_socket: std::net::UdpSocket = socket.into();
        let socket = UdpSocket::from_std(std_socket)
            .map_err(|e| TransportError::io("converting to Tokio socket", e))?;
        let local_addr = socket
            .local_addr()
            .map_err(|e| TransportError::io("getting local address", e))?;

        debug!(local = %local_addr, dual_stack, "UDP association socket bound");

        Ok(Self {
            socket,
            local_addr,
            dual_stack,
            shutdown: AtomicBool::new(false),
        })
    }

    /// Marks the socket shut down; later calls fail with `ShuttingDown`.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
    }

    /// Returns `true` after [`shutdown`](Self::shutdown).
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    fn outbound_addr(&self, dest: SocketAddr) -> Result<SocketAddr> {
        match (self.local_addr.is_ipv4(), dest) {
            (true, SocketAddr::V4(_)) => Ok(dest),
            (true, SocketAddr::V6(v6)) => match v6.ip().to_ipv4_mapped() {
                Some(v4) => Ok(SocketAddr::new(IpAddr::V4(v4), v6.port())),
                None => Err(TransportError::Unreachable {
                    target: dest.to_string(),
                    reason: "IPv6 target on IPv4-only socket".into(),
                }),
            },
            (false, SocketAddr::V4(v4)) if self.dual_stack => Ok(SocketAddr::new(
                IpAddr::V6(v4.ip().to_ipv6_mapped()),
                v4.port(),
            )),
            (false, _) => Ok(dest),
        }
    }
}

/// Turns `::ffff:a.b.c.d` back into an IPv4 address.
fn canonical(addr: SocketAddr) -> SocketAddr {
    match addr {
        SocketAddr::V6(v6) => match v6.ip().to_ipv4_mapped() {
            Some(v4) => SocketAddr::new(IpAddr::V4(v4), v6.port()),
            None => addr,
        },
        SocketAddr::V4(_) => addr,
    }
}

#[async_trait]
impl DatagramSocket for UdpDatagramSocket {
    async fn send_to(&self, payload: &[u8], target: &TargetAddr) -> Result<usize> {
        if self.is_shutdown() {
            return Err(TransportError::ShuttingDown);
        }
        let dest = self.outbound_addr(resolve(target).await?)?;
        let len = self
            .socket
            .send_to(payload, dest)
            .await
            .map_err(|e| TransportError::SendFailed {
                link: dest.to_string(),
                reason: e.to_string(),
            })?;
        trace!(dest = %dest, len, "Datagram sent");
        Ok(len)
    }

    async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr)> {
        if self.is_shutdown() {
            return Err(TransportError::ShuttingDown);
        }
        let (len, from) = self
            .socket
            .recv_from(buf)
            .await
            .map_err(|e| TransportError::ReceiveFailed {
                link: self.local_addr.to_string(),
                reason: e.to_string(),
            })?;
        trace!(from = %from, len, "Datagram received");
        Ok((len, canonical(from)))
    }

    fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.local_addr)
    }
}

impl std::fmt::Debug for UdpDatagramSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UdpDatagramSocket")
            .field("local_addr", &self.local_addr)
            .field("dual_stack", &self.dual_stack)
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}

// ============================================
// Tests
// ============================================
