// ============================================
// File: crates/meshrelay-core/src/crypto/keys.rs
// ============================================
//! # Key Types
//!
//! ## Creation Reason
//! Key material for the end-to-end session layer with zeroize-on-drop
//! and constant-time comparisons.
//!
//! ## Main Functionality
//! - `EphemeralKeyPair`: single-use X25519 key pair
//! - `SessionKey`: derived 32-byte ChaCha20-Poly1305 key
//!
//! ## Key Lifecycle
//! ```text
//! EphemeralKeyPair::generate()      fresh per stream / association
//!         │ exchange(peer_pub)      consumes the secret
//!         ▼
//! Zeroizing<[u8; 32]> shared        dropped right after derivation
//!         │ kdf::derive_session_key
//!         ▼
//! SessionKey                        lives as long as the stream
//! ```
//!
//! ## ⚠️ Important Note for Next Developer
//! - Low-order peer keys produce an all-zero shared secret; `exchange`
//!   rejects them as well as an all-zero peer public key
//! - Key material NEVER goes into logs or error messages
//!
//! ## Last Modified
//! v0.1.0 - Initial key type definitions

use std::fmt;

use rand::rngs::OsRng;
use subtle::ConstantTimeEq;
use x25519_dalek::{EphemeralSecret, PublicKey};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use super::{CHACHA20_KEY_SIZE, X25519_PUBLIC_KEY_SIZE};
use crate::error::{CoreError, Result};

/// Constant-time all-zero check.
#[must_use]
pub fn is_all_zero(bytes: &[u8; 32]) -> bool {
    bool::from(bytes[..].ct_eq(&[0u8; 32][..]))
}

// ============================================
// EphemeralKeyPair (X25519)
// ============================================

/// Single-use X25519 key pair.
///
/// # Example
/// ```
/// use meshrelay_core::crypto::EphemeralKeyPair;
///
/// let alice = EphemeralKeyPair::generate();
/// let bob = EphemeralKeyPair::generate();
/// let (alice_pub, bob_pub) = (alice.public_key_bytes(), bob.public_key_bytes());
///
/// let a = alice.exchange(&bob_pub).unwrap();
/// let b = bob.exchange(&alice_pub).unwrap();
/// assert_eq!(*a, *b);
/// ```
pub struct EphemeralKeyPair {
    secret: EphemeralSecret,
    public: PublicKey,
}

impl EphemeralKeyPair {
    /// Generates a key pair from the OS RNG.
    #[must_use]
    pub fn generate() -> Self {
        let secret = EphemeralSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Public key bytes.
    #[must_use]
    pub fn public_key_bytes(&self) -> [u8; X25519_PUBLIC_KEY_SIZE] {
        self.public.to_bytes()
    }

    /// Computes the X25519 shared secret, consuming the private key.
    ///
    /// # Errors
    /// `KeyExchange` if the peer key is all zeros or the resulting secret
    /// is all zeros (low-order point).
    pub fn exchange(
        self,
        peer_public: &[u8; X25519_PUBLIC_KEY_SIZE],
    ) -> Result<Zeroizing<[u8; 32]>> {
        if is_all_zero(peer_public) {
            return Err(CoreError::key_exchange("peer public key is all zeros"));
        }

        let shared = self.secret.diffie_hellman(&PublicKey::from(*peer_public));
        let bytes = Zeroizing::new(shared.to_bytes());
        if !shared.was_contributory() || is_all_zero(&bytes) {
            return Err(CoreError::key_exchange("shared secret is all zeros"));
        }
        Ok(bytes)
    }
}

impl fmt::Debug for EphemeralKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EphemeralKeyPair")
            .field("public", &hex_prefix(self.public.as_bytes()))
            .finish_non_exhaustive()
    }
}

fn hex_prefix(bytes: &[u8; 32]) -> String {
    format!(
        "{:02x}{:02x}{:02x}{:02x}...",
        bytes[0], bytes[1], bytes[2], bytes[3]
    )
}

// ============================================
// SessionKey
// ============================================

/// Symmetric key shared by the two ends of one stream.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SessionKey([u8; CHACHA20_KEY_SIZE]);

impl SessionKey {
    /// Wraps raw key bytes.
    #[must_use]
    pub fn from_bytes(bytes: [u8; CHACHA20_KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Raw key bytes. Do not log or persist.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; CHACHA20_KEY_SIZE] {
        &self.0
    }
}

impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionKey([REDACTED])")
    }
}

impl PartialEq for SessionKey {
    fn eq(&self, other: &Self) -> bool {
        bool::from(self.0[..].ct_eq(&other.0[..]))
    }
}

impl Eq for SessionKey {}

// ============================================
// Tests
// ============================================
