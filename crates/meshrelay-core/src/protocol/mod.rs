// ============================================
// File: crates/meshrelay-core/src/protocol/mod.rs
// ============================================
//! # Protocol Module
//!
//! ## Creation Reason
//! The wire protocol spoken between directly connected agents.
//!
//! ### Submodules
//! - [`frame`]: Frame types, flags, `Frame` / `RawFrame`
//! - [`codec`]: 14-byte header encoding and decoding
//! - [`address`]: Target address encoding (IPv4, IPv6, domain)
//! - [`messages`]: Typed control payloads
//!
//! ## Protocol Overview
//! ```text
//! Ingress            Transit              Exit
//!    │ STREAM_OPEN(id=5)  │ STREAM_OPEN(id=9)  │
//!    ├───────────────────►├───────────────────►│ dial target
//!    │ STREAM_OPEN_ACK    │ STREAM_OPEN_ACK    │
//!    │◄───────────────────┤◄───────────────────┤
//!    │ STREAM_DATA (ciphertext, relayed verbatim)
//!    │◄══════════════════►│◄══════════════════►│
//! ```
//!
//! ## ⚠️ Important Note for Next Developer
//! - All multi-byte integers are big-endian
//! - Stream ids are hop-local; only `request_id` survives end-to-end
//!
//! ## Last Modified
//! v0.1.0 - Initial protocol definitions

pub mod address;
pub mod codec;
pub mod frame;
pub mod messages;

// Re-export primary types
pub use address::{Host, TargetAddr};
pub use codec::{Codec, FrameCodec};
pub use frame::{
    Flags, Frame, FrameHeader, FrameType, RawFrame, CONTROL_STREAM_ID,
    DEFAULT_MAX_PAYLOAD_SIZE, FRAME_HEADER_SIZE,
};
pub use messages::{
    CloseReason, ErrorCode, Payload, PeerHello, RouteAdvertise, StreamOpen, StreamOpenAck,
    StreamOpenErr, StreamReset, StreamWindow, UdpClose, UdpDatagram, UdpOpen, UdpOpenAck,
    UdpOpenErr, PROTOCOL_VERSION,
};
