// ============================================
// File: crates/meshrelay-common/src/types.rs
// ============================================
//! # Core Type Definitions
//!
//! ## Creation Reason
//! Identifiers and address types that cross crate boundaries and appear
//! on the wire.
//!
//! ## Main Functionality
//! - `AgentId`: 128-bit random identity of a mesh participant
//! - `RequestId`: end-to-end identifier of one stream or UDP association
//! - `Cidr`: normalized IPv4/IPv6 prefix with containment test
//!
//! ## Identifier Scopes
//! ```text
//!   Ingress ──────── Transit ──────── Exit
//!      │  stream_id=5   │  stream_id=9   │     hop-local, rewritten
//!      │◄──────────── request_id ──────►│     stable end-to-end
//!      │◄─────────── AgentId(s) ────────►│     seen_by / origin
//! ```
//!
//! ## ⚠️ Important Note for Next Developer
//! - `AgentId` equality is bitwise and ids are never reused
//! - `Cidr::new` always clears host bits; two spellings of the same
//!   prefix compare equal and hash identically
//!
//! ## Last Modified
//! v0.1.0 - Initial type definitions

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::error::{CommonError, Result};

// ============================================
// Constants
// ============================================

/// Size of an `AgentId` in bytes.
pub const AGENT_ID_SIZE: usize = 16;

// ============================================
// AgentId
// ============================================

/// Identity of one mesh agent.
///
/// # Wire Format
/// ```text
/// ┌────────────────────────────────────┐
/// │        Agent ID (16 bytes)         │
/// └────────────────────────────────────┘
/// ```
///
/// # Example
/// ```
/// use meshrelay_common::types::AgentId;
///
/// let id = AgentId::generate();
/// let parsed: AgentId = id.to_string().parse().unwrap();
/// assert_eq!(id, parsed);
/// ```
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AgentId([u8; AGENT_ID_SIZE]);

impl AgentId {
    /// Generates a fresh random identity from the OS RNG.
    #[must_use]
    pub fn generate() -> Self {
        let mut id = [0u8; AGENT_ID_SIZE];
        OsRng.fill_bytes(&mut id);
        Self(id)
    }

    /// Wraps raw bytes.
    #[must_use]
    pub const fn from_array(bytes: [u8; AGENT_ID_SIZE]) -> Self {
        Self(bytes)
    }

    /// Creates an id from a slice of exactly 16 bytes.
    ///
    /// # Errors
    /// Returns `InvalidLength` for any other length.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let array: [u8; AGENT_ID_SIZE] = bytes
            .try_into()
            .map_err(|_| CommonError::invalid_length(AGENT_ID_SIZE, bytes.len()))?;
        Ok(Self(array))
    }

    /// Returns the raw bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; AGENT_ID_SIZE] {
        &self.0
    }

    /// First four bytes in hex, for compact log lines.
    #[must_use]
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl fmt::Debug for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AgentId({}..)", self.short())
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl FromStr for AgentId {
    type Err = CommonError;

    fn from_str(s: &str) -> Result<Self> {
        let bytes = hex::decode(s.trim())?;
        Self::from_slice(&bytes)
    }
}

impl Serialize for AgentId {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        if serializer.is_human_readable() {
            serializer.serialize_str(&self.to_string())
        } else {
            serializer.serialize_bytes(&self.0)
        }
    }
}

impl<'de> Deserialize<'de> for AgentId {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        if deserializer.is_human_readable() {
            let s = String::deserialize(deserializer)?;
            s.parse().map_err(serde::de::Error::custom)
        } else {
            let bytes = <Vec<u8>>::deserialize(deserializer)?;
            Self::from_slice(&bytes).map_err(serde::de::Error::custom)
        }
    }
}

// ============================================
// RequestId
// ============================================

/// End-to-end identifier of a stream or UDP association.
///
/// Chosen once by the ingress and carried unchanged through every hop.
/// It salts the session key derivation, so two streams between the same
/// ingress and exit never share a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(u64);

impl RequestId {
    /// Wraps a raw value.
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Draws a random non-zero id.
    #[must_use]
    pub fn generate() -> Self {
        loop {
            let value = OsRng.next_u64();
            if value != 0 {
                return Self(value);
            }
        }
    }

    /// Returns the raw value.
    #[must_use]
    pub const fn get(&self) -> u64 {
        self.0
    }

    /// Big-endian encoding used in the KDF salt and on the wire.
    #[must_use]
    pub const fn to_be_bytes(&self) -> [u8; 8] {
        self.0.to_be_bytes()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl From<u64> for RequestId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

// ============================================
// Cidr
// ============================================

/// An IPv4 or IPv6 network prefix with host bits cleared.
///
/// # Example
/// ```
/// use meshrelay_common::types::Cidr;
///
/// let net: Cidr = "10.1.2.3/16".parse().unwrap();
/// assert_eq!(net.to_string(), "10.1.0.0/16");
/// assert!(net.contains("10.1.200.7".parse().unwrap()));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Cidr {
    network: IpAddr,
    prefix_len: u8,
}

impl Cidr {
    /// Creates a prefix, masking off host bits.
    ///
    /// # Errors
    /// Returns `OutOfRange` if `prefix_len` exceeds the address width.
    pub fn new(addr: IpAddr, prefix_len: u8) -> Result<Self> {
        let max = max_prefix_len(&addr);
        if prefix_len > max {
            return Err(CommonError::out_of_range(prefix_len, 0, max));
        }
        Ok(Self {
            network: mask(addr, prefix_len),
            prefix_len,
        })
    }

    /// Single-host prefix (`/32` or `/128`).
    #[must_use]
    pub fn host(addr: IpAddr) -> Self {
        Self {
            network: addr,
            prefix_len: max_prefix_len(&addr),
        }
    }

    /// The IPv4 default route `0.0.0.0/0`.
    #[must_use]
    pub const fn default_v4() -> Self {
        Self {
            network: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            prefix_len: 0,
        }
    }

    /// The IPv6 default route `::/0`.
    #[must_use]
    pub const fn default_v6() -> Self {
        Self {
            network: IpAddr::V6(Ipv6Addr::UNSPECIFIED),
            prefix_len: 0,
        }
    }

    /// Network address.
    #[must_use]
    pub const fn network(&self) -> IpAddr {
        self.network
    }

    /// Prefix length in bits.
    #[must_use]
    pub const fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    /// Returns `true` for IPv4 prefixes.
    #[must_use]
    pub const fn is_ipv4(&self) -> bool {
        self.network.is_ipv4()
    }

    /// Returns `true` if `ip` falls inside this prefix. Addresses of the
    /// other family never match.
    #[must_use]
    pub fn contains(&self, ip: IpAddr) -> bool {
        if ip.is_ipv4() != self.network.is_ipv4() {
            return false;
        }
        mask(ip, self.prefix_len) == self.network
    }
}

/// Width of the address family in bits.
#[must_use]
pub const fn max_prefix_len(addr: &IpAddr) -> u8 {
    match addr {
        IpAddr::V4(_) => 32,
        IpAddr::V6(_) => 128,
    }
}

/// Clears every bit of `addr` past `prefix_len`.
fn mask(addr: IpAddr, prefix_len: u8) -> IpAddr {
    match addr {
        IpAddr::V4(v4) => {
            let bits = u32::from(v4);
            let masked = if prefix_len == 0 {
                0
            } else {
                bits & (!0u32 << (32 - u32::from(prefix_len.min(32))))
            };
            IpAddr::V4(Ipv4Addr::from(masked))
        }
        IpAddr::V6(v6) => {
            let bits = u128::from(v6);
            let masked = if prefix_len == 0 {
                0
            } else {
                bits & (!0u128 << (128 - u32::from(prefix_len.min(128))))
            };
            IpAddr::V6(Ipv6Addr::from(masked))
        }
    }
}

impl fmt::Display for Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix_len)
    }
}

impl FromStr for Cidr {
    type Err = CommonError;

    /// Accepts `addr/len`, or a bare address meaning a single host.
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        match s.split_once('/') {
            Some((addr, len)) => {
                let addr: IpAddr = addr
                    .parse()
                    .map_err(|_| CommonError::invalid_input("cidr", format!("bad address in '{s}'")))?;
                let len: u8 = len
                    .parse()
                    .map_err(|_| CommonError::invalid_input("cidr", format!("bad prefix length in '{s}'")))?;
                Self::new(addr, len)
            }
            None => {
                let addr: IpAddr = s
                    .parse()
                    .map_err(|_| CommonError::invalid_input("cidr", format!("bad address '{s}'")))?;
                Ok(Self::host(addr))
            }
        }
    }
}

impl Serialize for Cidr {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Cidr {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

// ============================================
// Tests
// ============================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agent_id_generate_unique() {
        assert_ne!(AgentId::generate(), AgentId::generate());
    }

    #[test]
    fn test_agent_id_text_form() {
        let id = AgentId::from_array([0xab; AGENT_ID_SIZE]);
        assert_eq!(id.to_string(), "ab".repeat(16));
        assert_eq!(id.short(), "abababab");
        assert_eq!(format!("{id:?}"), "AgentId(abababab..)");
        assert_eq!(id.to_string().parse::<AgentId>().unwrap(), id);
    }

    #[test]
    fn test_agent_id_rejects_wrong_length() {
        assert!(AgentId::from_slice(&[1, 2, 3]).is_err());
        assert!("abcd".parse::<AgentId>().is_err());
    }

    #[test]
    fn test_agent_id_json() {
        let id = AgentId::generate();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{id}\""));
        let back: AgentId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn test_request_id() {
        assert_ne!(RequestId::generate().get(), 0);
        let rid = RequestId::new(7);
        assert_eq!(rid.to_be_bytes(), [0, 0, 0, 0, 0, 0, 0, 7]);
        assert_eq!(rid.to_string(), "0000000000000007");
    }

    #[test]
    fn test_cidr_normalizes_host_bits() {
        let a: Cidr = "10.1.2.3/8".parse().unwrap();
        let b: Cidr = "10.0.0.0/8".parse().unwrap();
        assert_eq!(a, b);
        assert_eq!(a.network(), IpAddr::V4(Ipv4Addr::new(10, 0, 0, 0)));
    }

    #[test]
    fn test_cidr_contains() {
        let net: Cidr = "10.1.0.0/16".parse().unwrap();
        assert!(net.contains("10.1.2.3".parse().unwrap()));
        assert!(!net.contains("10.2.0.1".parse().unwrap()));
        assert!(!net.contains("::1".parse().unwrap()));

        assert!(Cidr::default_v4().contains("8.8.8.8".parse().unwrap()));
        assert!(!Cidr::default_v4().contains("2001:db8::1".parse().unwrap()));
        assert!(Cidr::default_v6().contains("2001:db8::1".parse().unwrap()));
    }

    #[test]
    fn test_cidr_ipv6() {
        let net: Cidr = "2001:db8:ffff::1/32".parse().unwrap();
        assert_eq!(net.to_string(), "2001:db8::/32");
        assert!(net.contains("2001:db8:1::9".parse().unwrap()));
    }

    #[test]
    fn test_cidr_bare_address_is_host_route() {
        let net: Cidr = "1.2.3.4".parse().unwrap();
        assert_eq!(net.prefix_len(), 32);
        assert!(net.contains("1.2.3.4".parse().unwrap()));
        assert!(!net.contains("1.2.3.5".parse().unwrap()));
    }

    #[test]
    fn test_cidr_rejects_bad_input() {
        assert!("10.0.0.0/33".parse::<Cidr>().is_err());
        assert!("::/129".parse::<Cidr>().is_err());
        assert!("nonsense/8".parse::<Cidr>().is_err());
        assert!("10.0.0.0/x".parse::<Cidr>().is_err());
    }
}
