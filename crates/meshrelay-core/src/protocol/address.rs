// ============================================
// File: crates/meshrelay-core/src/protocol/address.rs
// ============================================
//! # Target Addresses
//!
//! ## Creation Reason
//! Stream opens, acks and UDP datagrams all name a host and port. The
//! host may be an IPv4/IPv6 literal or a domain that only the exit
//! resolves.
//!
//! ## Wire Format
//! ```text
//! ┌──────────┬──────────────────────────────┬──────────┐
//! │ atyp (1) │ address                      │ port (2) │
//! ├──────────┼──────────────────────────────┼──────────┤
//! │ 0x01     │ IPv4 (4)                     │          │
//! │ 0x04     │ IPv6 (16)                    │          │
//! │ 0x03     │ len (1) + domain (1..=255)   │          │
//! └──────────┴──────────────────────────────┴──────────┘
//! ```
//!
//! ## ⚠️ Important Note for Next Developer
//! - atyp values match SOCKS5 so the ingress collaborator can pass
//!   addresses through without re-encoding
//!
//! ## Last Modified
//! v0.1.0 - Initial address encoding

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::str::FromStr;

use bytes::{Buf, BufMut, BytesMut};

use crate::error::{CoreError, Result};

/// IPv4 address type byte.
pub const ATYP_IPV4: u8 = 0x01;
/// Domain name address type byte.
pub const ATYP_DOMAIN: u8 = 0x03;
/// IPv6 address type byte.
pub const ATYP_IPV6: u8 = 0x04;

/// Longest domain name that fits the one-byte length prefix.
pub const MAX_DOMAIN_LEN: usize = 255;

// ============================================
// Host / TargetAddr
// ============================================

/// Host part of a target address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Host {
    /// IP literal.
    Ip(IpAddr),
    /// Domain name, resolved at the exit.
    Domain(String),
}

/// Host and port of a stream destination or datagram peer.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TargetAddr {
    /// Host.
    pub host: Host,
    /// Port.
    pub port: u16,
}

impl TargetAddr {
    /// IP target.
    #[must_use]
    pub const fn ip(ip: IpAddr, port: u16) -> Self {
        Self {
            host: Host::Ip(ip),
            port,
        }
    }

    /// Domain target.
    ///
    /// # Errors
    /// Rejects empty, overlong or non-ASCII names.
    pub fn domain(name: impl Into<String>, port: u16) -> Result<Self> {
        let name = name.into();
        validate_domain(name.as_bytes())?;
        Ok(Self {
            host: Host::Domain(name),
            port,
        })
    }

    /// IP of the host, if it is a literal.
    #[must_use]
    pub fn ip_addr(&self) -> Option<IpAddr> {
        match &self.host {
            Host::Ip(ip) => Some(*ip),
            Host::Domain(_) => None,
        }
    }

    /// Socket address, if the host is a literal.
    #[must_use]
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        self.ip_addr().map(|ip| SocketAddr::new(ip, self.port))
    }

    /// Number of bytes `encode` will append.
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        let host = match &self.host {
            Host::Ip(IpAddr::V4(_)) => 4,
            Host::Ip(IpAddr::V6(_)) => 16,
            Host::Domain(name) => 1 + name.len(),
        };
        1 + host + 2
    }

    /// Appends the wire encoding.
    pub fn encode(&self, buf: &mut BytesMut) {
        match &self.host {
            Host::Ip(IpAddr::V4(v4)) => {
                buf.put_u8(ATYP_IPV4);
                buf.put_slice(&v4.octets());
            }
            Host::Ip(IpAddr::V6(v6)) => {
                buf.put_u8(ATYP_IPV6);
                buf.put_slice(&v6.octets());
            }
            Host::Domain(name) => {
                buf.put_u8(ATYP_DOMAIN);
                // Length was validated at construction.
                #[allow(clippy::cast_possible_truncation)]
                buf.put_u8(name.len() as u8);
                buf.put_slice(name.as_bytes());
            }
        }
        buf.put_u16(self.port);
    }

    /// Reads an address from the front of `buf`.
    ///
    /// # Errors
    /// Returns `InvalidAddress` on unknown atyp, truncation or a bad name.
    pub fn decode(buf: &mut impl Buf) -> Result<Self> {
        if !buf.has_remaining() {
            return Err(CoreError::invalid_address("missing address type"));
        }
        let host = match buf.get_u8() {
            ATYP_IPV4 => {
                need(buf.remaining(), 4, "ipv4")?;
                let mut octets = [0u8; 4];
                buf.copy_to_slice(&mut octets);
                Host::Ip(IpAddr::V4(Ipv4Addr::from(octets)))
            }
            ATYP_IPV6 => {
                need(buf.remaining(), 16, "ipv6")?;
                let mut octets = [0u8; 16];
                buf.copy_to_slice(&mut octets);
                Host::Ip(IpAddr::V6(Ipv6Addr::from(octets)))
            }
            ATYP_DOMAIN => {
                need(buf.remaining(), 1, "domain length")?;
                let len = usize::from(buf.get_u8());
                need(buf.remaining(), len, "domain")?;
                let mut raw = vec![0u8; len];
                buf.copy_to_slice(&mut raw);
                validate_domain(&raw)?;
                let name = String::from_utf8(raw)
                    .map_err(|_| CoreError::invalid_address("domain is not ascii"))?;
                Host::Domain(name)
            }
            other => {
                return Err(CoreError::invalid_address(format!(
                    "unknown address type 0x{other:02x}"
                )))
            }
        };
        need(buf.remaining(), 2, "port")?;
        let port = buf.get_u16();
        Ok(Self { host, port })
    }
}

fn need(remaining: usize, len: usize, what: &str) -> Result<()> {
    if remaining < len {
        return Err(CoreError::invalid_address(format!("truncated {what}")));
    }
    Ok(())
}

fn validate_domain(name: &[u8]) -> Result<()> {
    if name.is_empty() || name.len() > MAX_DOMAIN_LEN {
        return Err(CoreError::invalid_address(format!(
            "domain length {} not in 1..={MAX_DOMAIN_LEN}",
            name.len()
        )));
    }
    if !name.iter().all(|b| b.is_ascii_graphic()) {
        return Err(CoreError::invalid_address("domain contains invalid characters"));
    }
    Ok(())
}

impl From<SocketAddr> for TargetAddr {
    fn from(addr: SocketAddr) -> Self {
        Self::ip(addr.ip(), addr.port())
    }
}

impl fmt::Display for TargetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.host {
            Host::Ip(IpAddr::V6(v6)) => write!(f, "[{v6}]:{}", self.port),
            Host::Ip(ip) => write!(f, "{ip}:{}", self.port),
            Host::Domain(name) => write!(f, "{name}:{}", self.port),
        }
    }
}

impl FromStr for TargetAddr {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        if let Ok(addr) = s.parse::<SocketAddr>() {
            return Ok(addr.into());
        }
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| CoreError::invalid_address(format!("missing port in '{s}'")))?;
        let port: u16 = port
            .parse()
            .map_err(|_| CoreError::invalid_address(format!("bad port in '{s}'")))?;
        Self::domain(host, port)
    }
}

// ============================================
// Tests
// ============================================

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(addr: &TargetAddr) -> TargetAddr {
        let mut buf = BytesMut::new();
        addr.encode(&mut buf);
        assert_eq!(buf.len(), addr.encoded_len());
        let mut bytes = buf.freeze();
        let decoded = TargetAddr::decode(&mut bytes).unwrap();
        assert!(bytes.is_empty());
        decoded
    }

    #[test]
    fn test_ipv4_layout() {
        let addr: TargetAddr = "1.2.3.4:80".parse().unwrap();
        let mut buf = BytesMut::new();
        addr.encode(&mut buf);
        assert_eq!(&buf[..], &[0x01, 1, 2, 3, 4, 0x00, 0x50]);
    }

    #[test]
    fn test_all_forms_roundtrip() {
        for s in ["1.2.3.4:80", "[2001:db8::1]:443", "example.com:8080"] {
            let addr: TargetAddr = s.parse().unwrap();
            assert_eq!(roundtrip(&addr), addr);
            assert_eq!(addr.to_string(), s);
        }
    }

    #[test]
    fn test_domain_validation() {
        assert!(TargetAddr::domain("", 1).is_err());
        assert!(TargetAddr::domain("a".repeat(256), 1).is_err());
        assert!(TargetAddr::domain("bad host", 1).is_err());
        assert!(TargetAddr::domain("a".repeat(255), 1).is_ok());
        assert!("example.com".parse::<TargetAddr>().is_err());
        assert!("example.com:http".parse::<TargetAddr>().is_err());
    }

    #[test]
    fn test_decode_rejects_garbage() {
        let cases: [&[u8]; 5] = [
            &[],
            &[0x09, 0, 0],
            &[0x01, 1, 2],
            &[0x03, 5, b'a', b'b'],
            &[0x01, 1, 2, 3, 4, 0],
        ];
        for case in cases {
            let mut bytes = bytes::Bytes::copy_from_slice(case);
            assert!(matches!(
                TargetAddr::decode(&mut bytes),
                Err(CoreError::InvalidAddress { .. })
            ));
        }
    }

    #[test]
    fn test_socket_addr_view() {
        let addr: TargetAddr = "10.0.0.1:22".parse().unwrap();
        assert_eq!(addr.socket_addr(), Some("10.0.0.1:22".parse().unwrap()));
        let named = TargetAddr::domain("host.internal", 22).unwrap();
        assert_eq!(named.socket_addr(), None);
    }
}
