// ============================================
// File: crates/meshrelay-core/src/crypto/mod.rs
// ============================================
//! # Crypto Session Layer
//!
//! ## Creation Reason
//! End-to-end encryption between the ingress and exit of one stream or
//! UDP association. Transit agents never construct anything from this
//! module; they relay sealed bytes verbatim.
//!
//! ### Submodules
//! - [`keys`]: `EphemeralKeyPair` (X25519) and `SessionKey`
//! - [`kdf`]: HKDF-SHA256 session key derivation
//! - [`handshake`]: initiator/responder key agreement
//! - [`cipher`]: ChaCha20-Poly1305 with direction-split nonces
//!
//! ## Cryptographic Design
//! ```text
//! Ingress (initiator)                         Exit (responder)
//!   eph_i ──── STREAM_OPEN{request_id, pub_i} ────►
//!                                                eph_r, shared = X25519(eph_r, pub_i)
//!   ◄──── STREAM_OPEN_ACK{request_id, pub_r} ─────
//!   shared = X25519(eph_i, pub_r)
//!
//!   key = HKDF-SHA256(ikm = shared,
//!                     salt = request_id(8) ‖ pub_i(32) ‖ pub_r(32),
//!                     info = KDF_INFO)
//!
//!   message = nonce(12) ‖ ChaCha20-Poly1305(key, nonce, plaintext) ‖ tag(16)
//!   nonce[0] bit 7: 0 = initiator→responder, 1 = responder→initiator
//! ```
//!
//! ## ⚠️ Important Note for Next Developer
//! - ALL implementations use RustCrypto crates; NEVER roll primitives
//! - Ephemeral secrets and raw shared secrets are zeroized as soon as
//!   the session key exists
//! - No re-keying: a stream that exhausts its nonce counter must be reset
//!
//! ## Last Modified
//! v0.1.0 - Initial crypto session layer

pub mod cipher;
pub mod handshake;
pub mod kdf;
pub mod keys;

// Re-export primary types at module level
pub use cipher::{Opener, Role, Sealer, SessionCipher};
pub use handshake::{respond, InitiatorHandshake};
pub use keys::{EphemeralKeyPair, SessionKey};

// ============================================
// Constants
// ============================================

/// Size of X25519 public key in bytes.
pub const X25519_PUBLIC_KEY_SIZE: usize = 32;

/// Size of ChaCha20-Poly1305 key in bytes.
pub const CHACHA20_KEY_SIZE: usize = 32;

/// Size of ChaCha20-Poly1305 nonce in bytes.
pub const CHACHA20_NONCE_SIZE: usize = 12;

/// Size of Poly1305 authentication tag in bytes.
pub const POLY1305_TAG_SIZE: usize = 16;

/// Bytes added to every sealed message.
pub const SEAL_OVERHEAD: usize = CHACHA20_NONCE_SIZE + POLY1305_TAG_SIZE;

/// HKDF info string; bump the suffix with any change to the derivation.
pub const KDF_INFO: &[u8] = b"meshrelay/e2e-session/v1";
