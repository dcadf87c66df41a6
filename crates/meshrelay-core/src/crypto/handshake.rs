// ============================================
// File: crates/meshrelay-core/src/crypto/handshake.rs
// ============================================
//! # Session Handshake
//!
//! ## Main Functionality
//! - `InitiatorHandshake`: ingress side, holds the ephemeral secret
//!   until the exit's public key arrives in the open ack
//! - `respond`: exit side, one step from the initiator's public key to
//!   a ready cipher plus the public key to send back
//!
//! ## Flow
//! ```text
//! let hs = InitiatorHandshake::new(rid);        // pub_i → STREAM_OPEN
//! let (exit_cipher, pub_r) = respond(rid, &pub_i)?;  // pub_r → ACK
//! let ingress_cipher = hs.complete(&pub_r)?;
//! ```
//!
//! ## Last Modified
//! v0.1.0 - Initial handshake

use meshrelay_common::types::RequestId;
use tracing::debug;

use super::kdf::derive_session_key;
use super::{EphemeralKeyPair, Role, SessionCipher, X25519_PUBLIC_KEY_SIZE};
use crate::error::Result;

/// Pending initiator state for one open request.
#[derive(Debug)]
pub struct InitiatorHandshake {
    request_id: RequestId,
    keypair: EphemeralKeyPair,
    public: [u8; X25519_PUBLIC_KEY_SIZE],
}

impl InitiatorHandshake {
    /// Generates a fresh ephemeral key for `request_id`.
    #[must_use]
    pub fn new(request_id: RequestId) -> Self {
        let keypair = EphemeralKeyPair::generate();
        let public = keypair.public_key_bytes();
        Self {
            request_id,
            keypair,
            public,
        }
    }

    /// Request id this handshake is bound to.
    #[must_use]
    pub const fn request_id(&self) -> RequestId {
        self.request_id
    }

    /// Public key to carry in the open request.
    #[must_use]
    pub const fn public_key(&self) -> [u8; X25519_PUBLIC_KEY_SIZE] {
        self.public
    }

    /// Finishes the exchange with the responder's public key.
    ///
    /// # Errors
    /// `KeyExchange` on a degenerate responder key.
    pub fn complete(self, responder_public: &[u8; X25519_PUBLIC_KEY_SIZE]) -> Result<SessionCipher> {
        let shared = self.keypair.exchange(responder_public)?;
        let key = derive_session_key(&shared, self.request_id, &self.public, responder_public)?;
        debug!(request_id = %self.request_id, "Initiator session established");
        Ok(SessionCipher::new(key, self.request_id, Role::Initiator))
    }
}

/// Answers an open request.
///
/// Returns the responder cipher and the public key for the ack.
///
/// # Errors
/// `KeyExchange` on a degenerate initiator key.
pub fn respond(
    request_id: RequestId,
    initiator_public: &[u8; X25519_PUBLIC_KEY_SIZE],
) -> Result<(SessionCipher, [u8; X25519_PUBLIC_KEY_SIZE])> {
    let keypair = EphemeralKeyPair::generate();
    let public = keypair.public_key_bytes();
    let shared = keypair.exchange(initiator_public)?;
    let key = derive_session_key(&shared, request_id, initiator_public, &public)?;
    debug!(request_id = %request_id, "Responder session established");
    Ok((SessionCipher::new(key, request_id, Role::Responder), public))
}

// ============================================
// Tests
// ============================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CoreError;

    #[test]
    fn test_handshake_end_to_end() {
        let rid = RequestId::new(0xdead_beef);
        let hs = InitiatorHandshake::new(rid);
        assert_eq!(hs.request_id(), rid);

        let (mut exit, responder_pub) = respond(rid, &hs.public_key()).unwrap();
        let mut ingress = hs.complete(&responder_pub).unwrap();

        assert_eq!(ingress.role(), Role::Initiator);
        assert_eq!(exit.role(), Role::Responder);

        let sealed = ingress.seal(b"hello exit").unwrap();
        assert_eq!(exit.open(&sealed).unwrap(), b"hello exit");
        let sealed = exit.seal(b"hello ingress").unwrap();
        assert_eq!(ingress.open(&sealed).unwrap(), b"hello ingress");
    }

    #[test]
    fn test_each_handshake_fresh_keys() {
        let rid = RequestId::new(1);
        let a = InitiatorHandshake::new(rid);
        let b = InitiatorHandshake::new(rid);
        assert_ne!(a.public_key(), b.public_key());
    }

    #[test]
    fn test_mismatched_request_id_fails() {
        let hs = InitiatorHandshake::new(RequestId::new(1));
        let (mut exit, responder_pub) = respond(RequestId::new(2), &hs.public_key()).unwrap();
        let mut ingress = hs.complete(&responder_pub).unwrap();

        let sealed = ingress.seal(b"x").unwrap();
        assert!(matches!(exit.open(&sealed), Err(CoreError::Decryption)));
    }

    #[test]
    fn test_zero_keys_rejected() {
        assert!(respond(RequestId::new(1), &[0u8; 32]).is_err());
        let hs = InitiatorHandshake::new(RequestId::new(1));
        assert!(matches!(
            hs.complete(&[0u8; 32]),
            Err(CoreError::KeyExchange { .. })
        ));
    }
}
