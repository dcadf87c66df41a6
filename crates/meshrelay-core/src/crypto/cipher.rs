// ============================================
// File: crates/meshrelay-core/src/crypto/cipher.rs
// ============================================
//! # Session Cipher
//!
//! ## Creation Reason
//! Seals and opens end-to-end payloads of one stream or association
//! with ChaCha20-Poly1305. Each direction has its own nonce space so
//! the two ends can never reuse a nonce under the shared key.
//!
//! ## Sealed Message Format
//! ```text
//! ┌───────────────────────┬──────────────────────┬──────────────┐
//! │ nonce (12 bytes)      │ ciphertext (N bytes) │ tag (16)     │
//! └───────────────────────┴──────────────────────┴──────────────┘
//!
//! nonce:
//!   byte 0     bit 7 = direction (0 initiator→responder, 1 reverse)
//!              bits 0..6 reserved, zero
//!   bytes 1..4 reserved, zero
//!   bytes 4..12 counter (u64, big-endian)
//!
//! AAD = request_id (8 bytes, big-endian)
//! ```
//!
//! ## Receive Policy
//! The opener keeps a watermark: the lowest counter it still accepts.
//! Counters below it are rejected as stale, gaps above it are accepted
//! and move the watermark past them. The watermark only advances after
//! a message authenticates.
//!
//! ## ⚠️ Important Note for Next Developer
//! - Links carrying sealed traffic MUST preserve order; the watermark
//!   turns reordering into loss
//! - A `Sealer` refuses to seal once its counter would wrap
//!
//! ## Last Modified
//! v0.1.0 - Initial session cipher

use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};

use meshrelay_common::types::RequestId;

use super::{SessionKey, CHACHA20_NONCE_SIZE, SEAL_OVERHEAD};
use crate::error::{CoreError, Result};

/// Direction bit in nonce byte 0 for responder→initiator traffic.
pub const NONCE_DIRECTION_BIT: u8 = 0x80;

// ============================================
// Role
// ============================================

/// Which end of the handshake this cipher belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Sent the open request (ingress).
    Initiator,
    /// Answered the open request (exit).
    Responder,
}

impl Role {
    /// Direction byte for messages this role sends.
    #[must_use]
    pub const fn send_direction(self) -> u8 {
        match self {
            Self::Initiator => 0,
            Self::Responder => NONCE_DIRECTION_BIT,
        }
    }

    /// The other end.
    #[must_use]
    pub const fn peer(self) -> Self {
        match self {
            Self::Initiator => Self::Responder,
            Self::Responder => Self::Initiator,
        }
    }
}

fn make_nonce(direction: u8, counter: u64) -> [u8; CHACHA20_NONCE_SIZE] {
    let mut nonce = [0u8; CHACHA20_NONCE_SIZE];
    nonce[0] = direction;
    nonce[4..].copy_from_slice(&counter.to_be_bytes());
    nonce
}

// ============================================
// Sealer
// ============================================

/// Sending half of a session cipher.
#[derive(Debug)]
pub struct Sealer {
    key: SessionKey,
    aad: [u8; 8],
    direction: u8,
    counter: u64,
}

impl Sealer {
    /// Encrypts `plaintext` under the next nonce.
    ///
    /// # Errors
    /// - `NonceExhausted` when the counter space is used up
    /// - `Encryption` if the AEAD rejects the input
    pub fn seal(&mut self, plaintext: &[u8]) -> Result<Vec<u8>> {
        if self.counter == u64::MAX {
            return Err(CoreError::NonceExhausted);
        }
        let nonce = make_nonce(self.direction, self.counter);

        let cipher = ChaCha20Poly1305::new_from_slice(self.key.as_bytes()).map_err(|_| {
            CoreError::Encryption {
                context: "Failed to create cipher".into(),
            }
        })?;
        let ciphertext = cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: plaintext,
                    aad: &self.aad,
                },
            )
            .map_err(|_| CoreError::Encryption {
                context: "ChaCha20-Poly1305 encryption failed".into(),
            })?;

        self.counter += 1;

        let mut out = Vec::with_capacity(CHACHA20_NONCE_SIZE + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    /// Counter of the next message.
    #[must_use]
    pub const fn next_counter(&self) -> u64 {
        self.counter
    }
}

// ============================================
// Opener
// ============================================

/// Receiving half of a session cipher.
#[derive(Debug)]
pub struct Opener {
    key: SessionKey,
    aad: [u8; 8],
    direction: u8,
    expected: u64,
}

impl Opener {
    /// Authenticates and decrypts one sealed message.
    ///
    /// # Errors
    /// - `MalformedPayload` if shorter than nonce plus tag or reserved
    ///   nonce bits are set
    /// - `Decryption` on wrong direction or failed authentication
    /// - `ReplayDetected` if the counter is below the watermark
    pub fn open(&mut self, sealed: &[u8]) -> Result<Vec<u8>> {
        if sealed.len() < SEAL_OVERHEAD {
            return Err(CoreError::malformed(format!(
                "sealed message of {} bytes is shorter than {SEAL_OVERHEAD}",
                sealed.len()
            )));
        }
        let (nonce, ciphertext) = sealed.split_at(CHACHA20_NONCE_SIZE);

        if nonce[0] & NONCE_DIRECTION_BIT != self.direction {
            return Err(CoreError::Decryption);
        }
        if nonce[0] & !NONCE_DIRECTION_BIT != 0 || nonce[1..4] != [0, 0, 0] {
            return Err(CoreError::malformed("reserved nonce bits set"));
        }

        let mut counter_bytes = [0u8; 8];
        counter_bytes.copy_from_slice(&nonce[4..]);
        let counter = u64::from_be_bytes(counter_bytes);
        if counter < self.expected {
            return Err(CoreError::replay(counter, self.expected));
        }
        if counter == u64::MAX {
            return Err(CoreError::NonceExhausted);
        }

        let cipher = ChaCha20Poly1305::new_from_slice(self.key.as_bytes())
            .map_err(|_| CoreError::Decryption)?;
        let plaintext = cipher
            .decrypt(
                Nonce::from_slice(nonce),
                Payload {
                    msg: ciphertext,
                    aad: &self.aad,
                },
            )
            .map_err(|_| CoreError::Decryption)?;

        self.expected = counter + 1;
        Ok(plaintext)
    }

    /// Lowest counter still accepted.
    #[must_use]
    pub const fn watermark(&self) -> u64 {
        self.expected
    }
}

// ============================================
// SessionCipher
// ============================================

/// Both halves of an established session.
///
/// Split it when the sending and receiving paths live in different
/// tasks.
#[derive(Debug)]
pub struct SessionCipher {
    role: Role,
    sealer: Sealer,
    opener: Opener,
}

impl SessionCipher {
    /// Builds the cipher for `role` from a derived key.
    #[must_use]
    pub fn new(key: SessionKey, request_id: RequestId, role: Role) -> Self {
        let aad = request_id.to_be_bytes();
        Self {
            role,
            sealer: Sealer {
                key: key.clone(),
                aad,
                direction: role.send_direction(),
                counter: 0,
            },
            opener: Opener {
                key,
                aad,
                direction: role.peer().send_direction(),
                expected: 0,
            },
        }
    }

    /// Role this cipher was built for.
    #[must_use]
    pub const fn role(&self) -> Role {
        self.role
    }

    /// See [`Sealer::seal`].
    ///
    /// # Errors
    /// Propagates sealing errors.
    pub fn seal(&mut self, plaintext: &[u8]) -> Result<Vec<u8>> {
        self.sealer.seal(plaintext)
    }

    /// See [`Opener::open`].
    ///
    /// # Errors
    /// Propagates opening errors.
    pub fn open(&mut self, sealed: &[u8]) -> Result<Vec<u8>> {
        self.opener.open(sealed)
    }

    /// Splits into independently owned halves.
    #[must_use]
    pub fn split(self) -> (Sealer, Opener) {
        (self.sealer, self.opener)
    }
}

// ============================================
// Tests
// ============================================
