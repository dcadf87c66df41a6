// ============================================
// File: crates/meshrelay-core/src/protocol/messages.rs
// ============================================
//! # Frame Payloads
//!
//! ## Creation Reason
//! Typed views of the payloads carried by control frames. The codec only
//! deals in bytes; handlers parse payloads with the [`Payload`] trait.
//!
//! ## Main Functionality
//! - Stream control: `StreamOpen`, `StreamOpenAck`, `StreamOpenErr`, `StreamReset`,
//!   `StreamWindow`
//! - Routing: `RouteAdvertise`
//! - UDP: `UdpOpen`, `UdpOpenAck`, `UdpOpenErr`, `UdpDatagram`, `UdpClose`
//! - Link: `PeerHello`
//! - `ErrorCode` / `CloseReason` wire enums
//!
//! ## Payload Layouts (Big Endian)
//! | Frame | Payload |
//! |-------|---------|
//! | STREAM_OPEN | request_id(8) target initiator_pub(32) |
//! | STREAM_OPEN_ACK | request_id(8) bound_addr responder_pub(32) |
//! | STREAM_OPEN_ERR | request_id(8) code(2) len(2) message |
//! | STREAM_RESET | code(2) |
//! | STREAM_WINDOW | credit(4) |
//! | ROUTE_ADVERTISE | origin(16) metric(4) cidr count(1) seen_by(16*n) |
//! | UDP_OPEN | request_id(8) initiator_pub(32) [hint target] |
//! | UDP_OPEN_ACK | request_id(8) bound_addr responder_pub(32) |
//! | UDP_OPEN_ERR | request_id(8) code(2) len(2) message |
//! | UDP_DATAGRAM | target sealed_datagram |
//! | UDP_CLOSE | reason(1) |
//! | PEER_HELLO | agent_id(16) version(1) len(1) name |
//!
//! ## ⚠️ Important Note for Next Developer
//! - `from_bytes` rejects trailing garbage; keep layouts exact
//! - STREAM_DATA has no typed payload: it is a sealed AEAD message
//!
//! ## Last Modified
//! v0.1.0 - Initial payload definitions

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use bytes::{Buf, BufMut, Bytes, BytesMut};

use meshrelay_common::types::{AgentId, Cidr, RequestId, AGENT_ID_SIZE};

use crate::crypto::X25519_PUBLIC_KEY_SIZE;
use crate::error::{CoreError, Result};
use crate::protocol::address::TargetAddr;
use crate::protocol::frame::{Frame, FrameType};

// ============================================
// Constants
// ============================================

/// Link protocol version announced in `PEER_HELLO`.
pub const PROTOCOL_VERSION: u8 = 0x01;

/// Upper bound on the `seen_by` list of one advertisement.
pub const MAX_SEEN_BY: usize = 64;

/// Longest error message kept when encoding `*_OPEN_ERR`.
pub const MAX_ERROR_MESSAGE_LEN: usize = 512;

/// Longest display name in `PEER_HELLO`.
pub const MAX_PEER_NAME_LEN: usize = 64;

// ============================================
// Payload Trait
// ============================================

/// A typed frame payload.
pub trait Payload: Sized {
    /// Frame type that carries this payload.
    const FRAME_TYPE: FrameType;

    /// Appends the payload encoding.
    fn encode_into(&self, buf: &mut BytesMut);

    /// Parses the payload from the front of `buf`.
    ///
    /// # Errors
    /// Returns a malformed-payload or address error.
    fn decode_from(buf: &mut Bytes) -> Result<Self>;

    /// Encodes into a standalone buffer.
    fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.encode_into(&mut buf);
        buf.freeze()
    }

    /// Parses a whole payload, rejecting trailing bytes.
    ///
    /// # Errors
    /// Returns a malformed-payload or address error.
    fn from_bytes(mut bytes: Bytes) -> Result<Self> {
        let value = Self::decode_from(&mut bytes)?;
        if bytes.has_remaining() {
            return Err(CoreError::malformed(format!(
                "{} trailing bytes after {}",
                bytes.remaining(),
                Self::FRAME_TYPE
            )));
        }
        Ok(value)
    }

    /// Wraps the payload in a frame for `stream_id`.
    fn to_frame(&self, stream_id: u64) -> Frame {
        Frame::new(Self::FRAME_TYPE, stream_id, self.to_bytes())
    }
}

// ============================================
// ErrorCode
// ============================================

/// Reason carried by `*_OPEN_ERR` and `STREAM_RESET`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ErrorCode {
    /// Unclassified failure.
    General = 1,
    /// No route matches the destination.
    NoRoute = 2,
    /// Target refused the connection.
    Refused = 3,
    /// Target network or host unreachable.
    Unreachable = 4,
    /// Dial or open timed out.
    Timeout = 5,
    /// A stream/association limit was hit.
    ResourceLimit = 6,
    /// Peer violated the frame protocol.
    Protocol = 7,
    /// AEAD authentication or nonce check failed.
    DecryptFailed = 8,
    /// The link toward the other end went away.
    PeerLost = 9,
    /// Local side cancelled the stream.
    Cancelled = 10,
    /// No traffic within the idle timeout.
    IdleTimeout = 11,
}

impl ErrorCode {
    /// Parses a wire value; unknown values read as `General`.
    #[must_use]
    pub const fn from_u16(value: u16) -> Self {
        match value {
            2 => Self::NoRoute,
            3 => Self::Refused,
            4 => Self::Unreachable,
            5 => Self::Timeout,
            6 => Self::ResourceLimit,
            7 => Self::Protocol,
            8 => Self::DecryptFailed,
            9 => Self::PeerLost,
            10 => Self::Cancelled,
            11 => Self::IdleTimeout,
            _ => Self::General,
        }
    }

    /// Wire value.
    #[must_use]
    pub const fn as_u16(&self) -> u16 {
        *self as u16
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::General => "general",
            Self::NoRoute => "no-route",
            Self::Refused => "refused",
            Self::Unreachable => "unreachable",
            Self::Timeout => "timeout",
            Self::ResourceLimit => "resource-limit",
            Self::Protocol => "protocol",
            Self::DecryptFailed => "decrypt-failed",
            Self::PeerLost => "peer-lost",
            Self::Cancelled => "cancelled",
            Self::IdleTimeout => "idle-timeout",
        };
        f.write_str(name)
    }
}

// ============================================
// CloseReason
// ============================================

/// Reason carried by `UDP_CLOSE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CloseReason {
    /// Closed by the owner.
    Normal = 0,
    /// Idle timeout expired.
    Timeout = 1,
    /// Link toward the other end was lost.
    PeerLost = 2,
    /// Closed because of an error.
    Error = 3,
}

impl CloseReason {
    /// Parses a wire value; unknown values read as `Error`.
    #[must_use]
    pub const fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Normal,
            1 => Self::Timeout,
            2 => Self::PeerLost,
            _ => Self::Error,
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Normal => "normal",
            Self::Timeout => "timeout",
            Self::PeerLost => "peer-lost",
            Self::Error => "error",
        };
        f.write_str(name)
    }
}

// ============================================
// Field Helpers
// ============================================

fn need(buf: &Bytes, len: usize, what: &str) -> Result<()> {
    if buf.remaining() < len {
        return Err(CoreError::malformed(format!(
            "truncated {what}: need {len} bytes, have {}",
            buf.remaining()
        )));
    }
    Ok(())
}

fn get_request_id(buf: &mut Bytes) -> Result<RequestId> {
    need(buf, 8, "request_id")?;
    Ok(RequestId::new(buf.get_u64()))
}

fn get_public_key(buf: &mut Bytes) -> Result<[u8; X25519_PUBLIC_KEY_SIZE]> {
    need(buf, X25519_PUBLIC_KEY_SIZE, "public key")?;
    let mut key = [0u8; X25519_PUBLIC_KEY_SIZE];
    buf.copy_to_slice(&mut key);
    Ok(key)
}

fn get_agent_id(buf: &mut Bytes) -> Result<AgentId> {
    need(buf, AGENT_ID_SIZE, "agent id")?;
    let mut id = [0u8; AGENT_ID_SIZE];
    buf.copy_to_slice(&mut id);
    Ok(AgentId::from_array(id))
}

fn put_message(buf: &mut BytesMut, message: &str) {
    let mut end = message.len().min(MAX_ERROR_MESSAGE_LEN);
    while !message.is_char_boundary(end) {
        end -= 1;
    }
    #[allow(clippy::cast_possible_truncation)]
    buf.put_u16(end as u16);
    buf.put_slice(&message.as_bytes()[..end]);
}

fn get_message(buf: &mut Bytes) -> Result<String> {
    need(buf, 2, "message length")?;
    let len = usize::from(buf.get_u16());
    need(buf, len, "message")?;
    let raw = buf.split_to(len);
    Ok(String::from_utf8_lossy(&raw).into_owned())
}

fn put_cidr(buf: &mut BytesMut, cidr: &Cidr) {
    match cidr.network() {
        IpAddr::V4(v4) => {
            buf.put_u8(4);
            buf.put_slice(&v4.octets());
        }
        IpAddr::V6(v6) => {
            buf.put_u8(6);
            buf.put_slice(&v6.octets());
        }
    }
    buf.put_u8(cidr.prefix_len());
}

fn get_cidr(buf: &mut Bytes) -> Result<Cidr> {
    need(buf, 1, "prefix family")?;
    let addr = match buf.get_u8() {
        4 => {
            need(buf, 4, "ipv4 prefix")?;
            let mut octets = [0u8; 4];
            buf.copy_to_slice(&mut octets);
            IpAddr::V4(Ipv4Addr::from(octets))
        }
        6 => {
            need(buf, 16, "ipv6 prefix")?;
            let mut octets = [0u8; 16];
            buf.copy_to_slice(&mut octets);
            IpAddr::V6(Ipv6Addr::from(octets))
        }
        other => return Err(CoreError::malformed(format!("unknown prefix family {other}"))),
    };
    need(buf, 1, "prefix length")?;
    let cidr = Cidr::new(addr, buf.get_u8())?;
    if cidr.network() != addr {
        return Err(CoreError::malformed(format!("prefix {addr} has host bits set")));
    }
    Ok(cidr)
}

// ============================================
// Stream Payloads
// ============================================

/// `STREAM_OPEN`: ingress asks for a stream to `target`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamOpen {
    /// End-to-end request id.
    pub request_id: RequestId,
    /// Destination the exit should dial.
    pub target: TargetAddr,
    /// Ingress ephemeral X25519 public key.
    pub initiator_pub: [u8; X25519_PUBLIC_KEY_SIZE],
}

impl Payload for StreamOpen {
    const FRAME_TYPE: FrameType = FrameType::StreamOpen;

    fn encode_into(&self, buf: &mut BytesMut) {
        buf.put_u64(self.request_id.get());
        self.target.encode(buf);
        buf.put_slice(&self.initiator_pub);
    }

    fn decode_from(buf: &mut Bytes) -> Result<Self> {
        let request_id = get_request_id(buf)?;
        let target = TargetAddr::decode(buf)?;
        let initiator_pub = get_public_key(buf)?;
        Ok(Self {
            request_id,
            target,
            initiator_pub,
        })
    }
}

/// `STREAM_OPEN_ACK`: exit dialed the target and completed its half of
/// the key agreement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamOpenAck {
    /// End-to-end request id.
    pub request_id: RequestId,
    /// Local address of the exit's outbound socket.
    pub bound_addr: TargetAddr,
    /// Exit ephemeral X25519 public key.
    pub responder_pub: [u8; X25519_PUBLIC_KEY_SIZE],
}

impl Payload for StreamOpenAck {
    const FRAME_TYPE: FrameType = FrameType::StreamOpenAck;

    fn encode_into(&self, buf: &mut BytesMut) {
        buf.put_u64(self.request_id.get());
        self.bound_addr.encode(buf);
        buf.put_slice(&self.responder_pub);
    }

    fn decode_from(buf: &mut Bytes) -> Result<Self> {
        let request_id = get_request_id(buf)?;
        let bound_addr = TargetAddr::decode(buf)?;
        let responder_pub = get_public_key(buf)?;
        Ok(Self {
            request_id,
            bound_addr,
            responder_pub,
        })
    }
}

/// `STREAM_OPEN_ERR`: the open failed somewhere along the path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamOpenErr {
    /// End-to-end request id.
    pub request_id: RequestId,
    /// Failure class.
    pub code: ErrorCode,
    /// Human-readable detail.
    pub message: String,
}

impl Payload for StreamOpenErr {
    const FRAME_TYPE: FrameType = FrameType::StreamOpenErr;

    fn encode_into(&self, buf: &mut BytesMut) {
        buf.put_u64(self.request_id.get());
        buf.put_u16(self.code.as_u16());
        put_message(buf, &self.message);
    }

    fn decode_from(buf: &mut Bytes) -> Result<Self> {
        let request_id = get_request_id(buf)?;
        need(buf, 2, "error code")?;
        let code = ErrorCode::from_u16(buf.get_u16());
        let message = get_message(buf)?;
        Ok(Self {
            request_id,
            code,
            message,
        })
    }
}

/// `STREAM_RESET`: immediate teardown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamReset {
    /// Why the stream was reset.
    pub code: ErrorCode,
}

impl Payload for StreamReset {
    const FRAME_TYPE: FrameType = FrameType::StreamReset;

    fn encode_into(&self, buf: &mut BytesMut) {
        buf.put_u16(self.code.as_u16());
    }

    fn decode_from(buf: &mut Bytes) -> Result<Self> {
        need(buf, 2, "reset code")?;
        Ok(Self {
            code: ErrorCode::from_u16(buf.get_u16()),
        })
    }
}

/// `STREAM_WINDOW`: the sender can take `credit` more `STREAM_DATA`
/// frames on this stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamWindow {
    /// Additional frames granted.
    pub credit: u32,
}

impl Payload for StreamWindow {
    const FRAME_TYPE: FrameType = FrameType::StreamWindow;

    fn encode_into(&self, buf: &mut BytesMut) {
        buf.put_u32(self.credit);
    }

    fn decode_from(buf: &mut Bytes) -> Result<Self> {
        need(buf, 4, "window credit")?;
        Ok(Self {
            credit: buf.get_u32(),
        })
    }
}

// ============================================
// RouteAdvertise
// ============================================

/// `ROUTE_ADVERTISE`: one prefix reachable via the sender.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteAdvertise {
    /// Exit agent that owns the prefix.
    pub origin: AgentId,
    /// Hop count from the origin as seen by the sender.
    pub metric: u32,
    /// Advertised prefix.
    pub prefix: Cidr,
    /// Agents that already forwarded this advertisement, origin first.
    pub seen_by: Vec<AgentId>,
}

impl Payload for RouteAdvertise {
    const FRAME_TYPE: FrameType = FrameType::RouteAdvertise;

    fn encode_into(&self, buf: &mut BytesMut) {
        buf.put_slice(self.origin.as_bytes());
        buf.put_u32(self.metric);
        put_cidr(buf, &self.prefix);
        let count = self.seen_by.len().min(MAX_SEEN_BY);
        #[allow(clippy::cast_possible_truncation)]
        buf.put_u8(count as u8);
        for id in &self.seen_by[..count] {
            buf.put_slice(id.as_bytes());
        }
    }

    fn decode_from(buf: &mut Bytes) -> Result<Self> {
        let origin = get_agent_id(buf)?;
        need(buf, 4, "metric")?;
        let metric = buf.get_u32();
        let prefix = get_cidr(buf)?;
        need(buf, 1, "seen_by count")?;
        let count = usize::from(buf.get_u8());
        if count > MAX_SEEN_BY {
            return Err(CoreError::malformed(format!(
                "seen_by has {count} entries, max {MAX_SEEN_BY}"
            )));
        }
        let mut seen_by = Vec::with_capacity(count);
        for _ in 0..count {
            seen_by.push(get_agent_id(buf)?);
        }
        Ok(Self {
            origin,
            metric,
            prefix,
            seen_by,
        })
    }
}

// ============================================
// UDP Payloads
// ============================================

/// `UDP_OPEN`: ingress asks for a UDP association.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdpOpen {
    /// End-to-end request id.
    pub request_id: RequestId,
    /// Ingress ephemeral X25519 public key.
    pub initiator_pub: [u8; X25519_PUBLIC_KEY_SIZE],
    /// First destination the ingress expects to use; routes the open.
    /// Encoded only when present.
    pub hint: Option<TargetAddr>,
}

impl Payload for UdpOpen {
    const FRAME_TYPE: FrameType = FrameType::UdpOpen;

    fn encode_into(&self, buf: &mut BytesMut) {
        buf.put_u64(self.request_id.get());
        buf.put_slice(&self.initiator_pub);
        if let Some(hint) = &self.hint {
            hint.encode(buf);
        }
    }

    fn decode_from(buf: &mut Bytes) -> Result<Self> {
        let request_id = get_request_id(buf)?;
        let initiator_pub = get_public_key(buf)?;
        let hint = if buf.has_remaining() {
            Some(TargetAddr::decode(buf)?)
        } else {
            None
        };
        Ok(Self {
            request_id,
            initiator_pub,
            hint,
        })
    }
}

/// `UDP_OPEN_ACK`: exit bound a socket for the association.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdpOpenAck {
    /// End-to-end request id.
    pub request_id: RequestId,
    /// Local address of the exit's UDP socket.
    pub bound_addr: TargetAddr,
    /// Exit ephemeral X25519 public key.
    pub responder_pub: [u8; X25519_PUBLIC_KEY_SIZE],
}

impl Payload for UdpOpenAck {
    const FRAME_TYPE: FrameType = FrameType::UdpOpenAck;

    fn encode_into(&self, buf: &mut BytesMut) {
        buf.put_u64(self.request_id.get());
        self.bound_addr.encode(buf);
        buf.put_slice(&self.responder_pub);
    }

    fn decode_from(buf: &mut Bytes) -> Result<Self> {
        Ok(Self {
            request_id: get_request_id(buf)?,
            bound_addr: TargetAddr::decode(buf)?,
            responder_pub: get_public_key(buf)?,
        })
    }
}

/// `UDP_OPEN_ERR`: the association could not be opened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdpOpenErr {
    /// End-to-end request id.
    pub request_id: RequestId,
    /// Failure class.
    pub code: ErrorCode,
    /// Human-readable detail.
    pub message: String,
}

impl Payload for UdpOpenErr {
    const FRAME_TYPE: FrameType = FrameType::UdpOpenErr;

    fn encode_into(&self, buf: &mut BytesMut) {
        buf.put_u64(self.request_id.get());
        buf.put_u16(self.code.as_u16());
        put_message(buf, &self.message);
    }

    fn decode_from(buf: &mut Bytes) -> Result<Self> {
        let request_id = get_request_id(buf)?;
        need(buf, 2, "error code")?;
        let code = ErrorCode::from_u16(buf.get_u16());
        Ok(Self {
            request_id,
            code,
            message: get_message(buf)?,
        })
    }
}

/// `UDP_DATAGRAM`: one sealed datagram and its remote address.
///
/// Toward the exit `target` is the destination; toward the ingress it is
/// the source the reply came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdpDatagram {
    /// Remote endpoint.
    pub target: TargetAddr,
    /// Sealed datagram (nonce, ciphertext, tag).
    pub sealed: Bytes,
}

impl Payload for UdpDatagram {
    const FRAME_TYPE: FrameType = FrameType::UdpDatagram;

    fn encode_into(&self, buf: &mut BytesMut) {
        self.target.encode(buf);
        buf.put_slice(&self.sealed);
    }

    fn decode_from(buf: &mut Bytes) -> Result<Self> {
        let target = TargetAddr::decode(buf)?;
        let sealed = buf.split_to(buf.remaining());
        Ok(Self { target, sealed })
    }
}

/// `UDP_CLOSE`: association released.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UdpClose {
    /// Why it was released.
    pub reason: CloseReason,
}

impl Payload for UdpClose {
    const FRAME_TYPE: FrameType = FrameType::UdpClose;

    fn encode_into(&self, buf: &mut BytesMut) {
        buf.put_u8(self.reason as u8);
    }

    fn decode_from(buf: &mut Bytes) -> Result<Self> {
        need(buf, 1, "close reason")?;
        Ok(Self {
            reason: CloseReason::from_u8(buf.get_u8()),
        })
    }
}

// ============================================
// PeerHello
// ============================================

/// `PEER_HELLO`: first frame on a link, names the sender.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerHello {
    /// Sender identity.
    pub agent_id: AgentId,
    /// Sender link protocol version.
    pub version: u8,
    /// Optional display name.
    pub name: String,
}

impl PeerHello {
    /// Hello for the current protocol version.
    #[must_use]
    pub fn new(agent_id: AgentId, name: impl Into<String>) -> Self {
        Self {
            agent_id,
            version: PROTOCOL_VERSION,
            name: name.into(),
        }
    }
}

impl Payload for PeerHello {
    const FRAME_TYPE: FrameType = FrameType::PeerHello;

    fn encode_into(&self, buf: &mut BytesMut) {
        buf.put_slice(self.agent_id.as_bytes());
        buf.put_u8(self.version);
        let mut end = self.name.len().min(MAX_PEER_NAME_LEN);
        while !self.name.is_char_boundary(end) {
            end -= 1;
        }
        #[allow(clippy::cast_possible_truncation)]
        buf.put_u8(end as u8);
        buf.put_slice(&self.name.as_bytes()[..end]);
    }

    fn decode_from(buf: &mut Bytes) -> Result<Self> {
        let agent_id = get_agent_id(buf)?;
        need(buf, 2, "version and name length")?;
        let version = buf.get_u8();
        let len = usize::from(buf.get_u8());
        need(buf, len, "name")?;
        let raw = buf.split_to(len);
        Ok(Self {
            agent_id,
            version,
            name: String::from_utf8_lossy(&raw).into_owned(),
        })
    }
}

// ============================================
// Tests
// ============================================
