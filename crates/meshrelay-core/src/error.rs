// ============================================
// File: crates/meshrelay-core/src/error.rs
// ============================================
//! # Core Error Types
//!
//! ## Creation Reason
//! Errors raised by the frame codec, payload parsers and the crypto
//! session layer.
//!
//! ## Error Categories
//! 1. **Framing**: `ShortHeader`, `PayloadTooLarge`, `UnknownType`
//! 2. **Payload**: malformed fields, bad address encodings
//! 3. **Crypto**: key exchange, derivation, AEAD failures, stale nonces
//!
//! ## ⚠️ Important Note for Next Developer
//! - Every variant here is recoverable and local to one frame or stream;
//!   none of them may tear down a peer link
//! - NEVER include key material in error messages
//!
//! ## Last Modified
//! v0.1.0 - Initial error definitions

use thiserror::Error;

use meshrelay_common::error::CommonError;

// ============================================
// Result Type Alias
// ============================================

/// Result type for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;

// ============================================
// CoreError
// ============================================

/// Core error types for framing and cryptographic operations.
#[derive(Error, Debug)]
pub enum CoreError {
    // ========================================
    // Framing Errors
    // ========================================

    /// Fewer than a full header's worth of bytes were available.
    #[error("Short frame header: need {expected} bytes, got {actual}")]
    ShortHeader {
        /// Header size
        expected: usize,
        /// Bytes available
        actual: usize,
    },

    /// Declared payload length exceeds the configured maximum.
    #[error("Frame payload too large: max {max} bytes, declared {actual}")]
    PayloadTooLarge {
        /// Configured maximum payload size
        max: usize,
        /// Length declared by the header
        actual: usize,
    },

    /// Type byte does not name a known frame type.
    #[error("Unknown frame type: 0x{0:02x}")]
    UnknownType(u8),

    /// Header was valid but the payload bytes are not all there yet.
    #[error("Truncated frame: payload needs {expected} bytes, got {actual}")]
    Truncated {
        /// Declared payload length
        expected: usize,
        /// Bytes available
        actual: usize,
    },

    // ========================================
    // Payload Errors
    // ========================================

    /// Payload is malformed.
    #[error("Malformed payload: {reason}")]
    MalformedPayload {
        /// What is wrong with it
        reason: String,
    },

    /// Target address encoding is invalid.
    #[error("Invalid address encoding: {reason}")]
    InvalidAddress {
        /// What is wrong with it
        reason: String,
    },

    // ========================================
    // Cryptographic Errors
    // ========================================

    /// Key exchange rejected the peer key or produced a degenerate secret.
    #[error("Key exchange failed: {reason}")]
    KeyExchange {
        /// Why key exchange failed
        reason: String,
    },

    /// Key derivation failed.
    #[error("Key derivation failed: {reason}")]
    KeyDerivation {
        /// Why derivation failed
        reason: String,
    },

    /// Encryption failed.
    #[error("Encryption failed: {context}")]
    Encryption {
        /// What was being encrypted
        context: String,
    },

    /// Authentication tag mismatch or wrong nonce direction.
    #[error("Decryption failed: authentication error")]
    Decryption,

    /// Received nonce counter is below the expected watermark.
    #[error("Stale nonce: counter {received} below expected {expected}")]
    ReplayDetected {
        /// Counter value received
        received: u64,
        /// Lowest counter still acceptable
        expected: u64,
    },

    /// A direction's nonce counter is used up.
    #[error("Nonce space exhausted")]
    NonceExhausted,

    // ========================================
    // Wrapped Errors
    // ========================================

    /// Error from common crate.
    #[error(transparent)]
    Common(#[from] CommonError),
}

impl CoreError {
    /// Creates a `MalformedPayload` error.
    pub fn malformed(reason: impl Into<String>) -> Self {
        Self::MalformedPayload {
            reason: reason.into(),
        }
    }

    /// Creates an `InvalidAddress` error.
    pub fn invalid_address(reason: impl Into<String>) -> Self {
        Self::InvalidAddress {
            reason: reason.into(),
        }
    }

    /// Creates a `KeyExchange` error.
    pub fn key_exchange(reason: impl Into<String>) -> Self {
        Self::KeyExchange {
            reason: reason.into(),
        }
    }

    /// Creates a `ReplayDetected` error.
    #[must_use]
    pub const fn replay(received: u64, expected: u64) -> Self {
        Self::ReplayDetected { received, expected }
    }

    /// Returns `true` for bad bytes from the wire: framing, payload and
    /// address errors.
    #[must_use]
    pub const fn is_malformed(&self) -> bool {
        matches!(
            self,
            Self::ShortHeader { .. }
                | Self::PayloadTooLarge { .. }
                | Self::UnknownType(_)
                | Self::Truncated { .. }
                | Self::MalformedPayload { .. }
                | Self::InvalidAddress { .. }
        )
    }

    /// Returns `true` for errors of the crypto session layer.
    #[must_use]
    pub const fn is_crypto_error(&self) -> bool {
        matches!(
            self,
            Self::KeyExchange { .. }
                | Self::KeyDerivation { .. }
                | Self::Encryption { .. }
                | Self::Decryption
                | Self::ReplayDetected { .. }
                | Self::NonceExhausted
        )
    }

    /// Returns `true` if the error implies tampering or desync.
    #[must_use]
    pub const fn is_suspicious(&self) -> bool {
        matches!(
            self,
            Self::Decryption | Self::ReplayDetected { .. } | Self::KeyExchange { .. }
        )
    }
}

// ============================================
// Tests
// ============================================
