// ============================================
// File: crates/meshrelay-core/src/lib.rs
// ============================================
//! # MeshRelay Core - Wire Protocol & Session Crypto
//!
//! ## Creation Reason
//! Everything an agent needs to talk to another agent at the byte level:
//! the link frame codec, control payloads, and the end-to-end crypto
//! session layer used between the ingress and exit of a stream.
//!
//! ## Main Functionality
//!
//! ### Protocol Module ([`protocol`])
//! - `FrameCodec`: 14-byte header framing with a payload ceiling
//! - `TargetAddr`: SOCKS-style IPv4 / IPv6 / domain address encoding
//! - Control payloads: stream open/ack/err/reset, route advertise,
//!   UDP association messages, peer hello
//!
//! ### Crypto Module ([`crypto`])
//! - X25519 ephemeral key agreement per stream
//! - HKDF-SHA256 session key derivation bound to the request id
//! - ChaCha20-Poly1305 with direction-split nonces and a stale-counter
//!   watermark
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                meshrelay-agent                      │
//! │                    │                                │
//! │         ┌──────────┴──────────┐                     │
//! │         ▼                     ▼                     │
//! │   meshrelay-core ◄──── meshrelay-transport          │
//! │   You are here                │                     │
//! │         │                     │                     │
//! │         └──────────┬──────────┘                     │
//! │                    ▼                                │
//! │             meshrelay-common                        │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! ## ⚠️ Important Note for Next Developer
//! - ALL cryptographic code uses RustCrypto implementations
//! - Transit agents only use [`protocol`]; they never hold session keys
//! - Wire layout changes MUST bump `PROTOCOL_VERSION`
//!
//! ## Last Modified
//! v0.1.0 - Initial implementation

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod crypto;
pub mod error;
pub mod protocol;

// Re-export commonly used items
pub use crypto::{respond, InitiatorHandshake, Opener, Sealer, SessionCipher, SessionKey};
pub use error::{CoreError, Result};
pub use protocol::{
    Flags, Frame, FrameCodec, FrameType, RawFrame, TargetAddr, PROTOCOL_VERSION,
};
