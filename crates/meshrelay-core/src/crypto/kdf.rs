// ============================================
// File: crates/meshrelay-core/src/crypto/kdf.rs
// ============================================
//! # Key Derivation
//!
//! ## Main Functionality
//! - `derive_session_key`: HKDF-SHA256 over the X25519 shared secret,
//!   salted with the request id and both ephemeral public keys
//!
//! ## Salt Layout
//! ```text
//! ┌──────────────┬──────────────────┬──────────────────┐
//! │ request_id   │ initiator_pub    │ responder_pub    │
//! │ 8 bytes (BE) │ 32 bytes         │ 32 bytes         │
//! └──────────────┴──────────────────┴──────────────────┘
//! ```
//!
//! ## ⚠️ Important Note for Next Developer
//! - Argument order matters: both ends MUST pass initiator first
//! - Changing the salt layout or `KDF_INFO` breaks interop with every
//!   deployed agent
//!
//! ## Last Modified
//! v0.1.0 - Initial KDF

use hkdf::Hkdf;
use sha2::Sha256;
use tracing::trace;
use zeroize::Zeroize;

use meshrelay_common::types::RequestId;

use super::{CHACHA20_KEY_SIZE, KDF_INFO, X25519_PUBLIC_KEY_SIZE};
use crate::crypto::SessionKey;
use crate::error::{CoreError, Result};

/// Salt length: request id plus two public keys.
pub const KDF_SALT_SIZE: usize = 8 + X25519_PUBLIC_KEY_SIZE * 2;

// ============================================
// Key Derivation
// ============================================

/// Derives the session key for one stream or association.
///
/// # Arguments
/// * `shared_secret` - 32-byte X25519 output
/// * `request_id` - id carried by the open request
/// * `initiator_public` - ingress ephemeral public key
/// * `responder_public` - exit ephemeral public key
///
/// # Errors
/// `KeyDerivation` if HKDF rejects the output length.
pub fn derive_session_key(
    shared_secret: &[u8; 32],
    request_id: RequestId,
    initiator_public: &[u8; X25519_PUBLIC_KEY_SIZE],
    responder_public: &[u8; X25519_PUBLIC_KEY_SIZE],
) -> Result<SessionKey> {
    let mut salt = [0u8; KDF_SALT_SIZE];
    salt[..8].copy_from_slice(&request_id.to_be_bytes());
    salt[8..8 + X25519_PUBLIC_KEY_SIZE].copy_from_slice(initiator_public);
    salt[8 + X25519_PUBLIC_KEY_SIZE..].copy_from_slice(responder_public);

    let hk = Hkdf::<Sha256>::new(Some(&salt), shared_secret);
    let mut okm = [0u8; CHACHA20_KEY_SIZE];
    hk.expand(KDF_INFO, &mut okm)
        .map_err(|_| CoreError::KeyDerivation {
            reason: "HKDF expand failed".into(),
        })?;

    let key = SessionKey::from_bytes(okm);
    okm.zeroize();

    trace!(request_id = %request_id, "Session key derived");
    Ok(key)
}

// ============================================
// Tests
// ============================================

#[cfg(test)]
mod tests {
    use super::*;

    const SHARED: [u8; 32] = [0x11; 32];
    const PUB_I: [u8; 32] = [0x22; 32];
    const PUB_R: [u8; 32] = [0x33; 32];

    #[test]
    fn test_derive_deterministic() {
        let rid = RequestId::new(7);
        let a = derive_session_key(&SHARED, rid, &PUB_I, &PUB_R).unwrap();
        let b = derive_session_key(&SHARED, rid, &PUB_I, &PUB_R).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_request_id_binds_key() {
        let a = derive_session_key(&SHARED, RequestId::new(1), &PUB_I, &PUB_R).unwrap();
        let b = derive_session_key(&SHARED, RequestId::new(2), &PUB_I, &PUB_R).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_public_key_order_matters() {
        let rid = RequestId::new(9);
        let a = derive_session_key(&SHARED, rid, &PUB_I, &PUB_R).unwrap();
        let b = derive_session_key(&SHARED, rid, &PUB_R, &PUB_I).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_shared_secret_binds_key() {
        let rid = RequestId::new(9);
        let a = derive_session_key(&SHARED, rid, &PUB_I, &PUB_R).unwrap();
        let b = derive_session_key(&[0x12; 32], rid, &PUB_I, &PUB_R).unwrap();
        assert_ne!(a, b);
    }
}
