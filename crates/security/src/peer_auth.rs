//! Ed25519 peer authentication via an HMAC challenge (spec §4.4).

use std::collections::HashMap;
use std::sync::RwLock;

use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use hmac::{Hmac, Mac};
use hyperforge_common::now_ms;
use sha2::Sha256;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("invalid public key encoding")]
    InvalidPublicKey,
    #[error("invalid signature encoding")]
    InvalidSignature,
    #[error("signature does not verify against the issued challenge")]
    VerificationFailed,
}

#[derive(Debug, Clone)]
pub struct AuthenticatedPeer {
    pub peer_id: String,
    pub pubkey_hex: String,
    pub authenticated_at: u64,
}

/// Server-side authenticator. Owns the shared secret used to issue
/// challenges and the record of successfully authenticated peers.
pub struct PeerAuthenticator {
    secret: Vec<u8>,
    authenticated: RwLock<HashMap<String, AuthenticatedPeer>>,
}

impl PeerAuthenticator {
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self {
            secret: secret.into(),
            authenticated: RwLock::new(HashMap::new()),
        }
    }

    /// `challenge = HMAC-SHA256(secret, peer_id ‖ ts)`. Returns the
    /// challenge bytes (hex) alongside the timestamp used, so the caller
    /// can round-trip it back into `authenticate`.
    pub fn issue_challenge(&self, peer_id: &str) -> (String, u64) {
        let ts = now_ms();
        (self.challenge_for(peer_id, ts), ts)
    }

    fn challenge_for(&self, peer_id: &str, ts: u64) -> String {
        let mut mac =
            Hmac::<Sha256>::new_from_slice(&self.secret).expect("HMAC accepts any key length");
        mac.update(peer_id.as_bytes());
        mac.update(&ts.to_be_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Verifies that `signature` is a valid Ed25519 signature by `pubkey`
    /// over the challenge previously issued for `(peer_id, ts)`, then
    /// records the peer as authenticated.
    pub fn authenticate(
        &self,
        peer_id: &str,
        pubkey_hex: &str,
        ts: u64,
        signature_hex: &str,
    ) -> Result<AuthenticatedPeer, AuthError> {
        let expected_challenge = self.challenge_for(peer_id, ts);
        let pubkey_bytes: [u8; 32] = hex::decode(pubkey_hex)
            .map_err(|_| AuthError::InvalidPublicKey)?
            .try_into()
            .map_err(|_| AuthError::InvalidPublicKey)?;
        let verifying_key =
            VerifyingKey::from_bytes(&pubkey_bytes).map_err(|_| AuthError::InvalidPublicKey)?;
        let sig_bytes: [u8; 64] = hex::decode(signature_hex)
            .map_err(|_| AuthError::InvalidSignature)?
            .try_into()
            .map_err(|_| AuthError::InvalidSignature)?;
        let signature = Signature::from_bytes(&sig_bytes);

        verifying_key
            .verify(expected_challenge.as_bytes(), &signature)
            .map_err(|_| AuthError::VerificationFailed)?;

        let record = AuthenticatedPeer {
            peer_id: peer_id.to_string(),
            pubkey_hex: pubkey_hex.to_string(),
            authenticated_at: now_ms(),
        };
        self.authenticated
            .write()
            .unwrap()
            .insert(peer_id.to_string(), record.clone());
        Ok(record)
    }

    pub fn is_authenticated(&self, peer_id: &str) -> bool {
        self.authenticated.read().unwrap().contains_key(peer_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::{Signer, SigningKey};
    use rand::rngs::OsRng;

    #[test]
    fn full_challenge_response_round_trip() {
        let auth = PeerAuthenticator::new(b"shared-secret".to_vec());
        let signing_key = SigningKey::generate(&mut OsRng);
        let pubkey_hex = hex::encode(signing_key.verifying_key().to_bytes());

        let (challenge, ts) = auth.issue_challenge("peer-1");
        let signature = signing_key.sign(challenge.as_bytes());
        let sig_hex = hex::encode(signature.to_bytes());

        assert!(!auth.is_authenticated("peer-1"));
        let record = auth
            .authenticate("peer-1", &pubkey_hex, ts, &sig_hex)
            .unwrap();
        assert_eq!(record.peer_id, "peer-1");
        assert!(auth.is_authenticated("peer-1"));
    }

    #[test]
    fn wrong_key_fails_verification() {
        let auth = PeerAuthenticator::new(b"shared-secret".to_vec());
        let real_key = SigningKey::generate(&mut OsRng);
        let other_key = SigningKey::generate(&mut OsRng);
        let (challenge, ts) = auth.issue_challenge("peer-1");
        let signature = real_key.sign(challenge.as_bytes());

        let wrong_pubkey_hex = hex::encode(other_key.verifying_key().to_bytes());
        let result = auth.authenticate(
            "peer-1",
            &wrong_pubkey_hex,
            ts,
            &hex::encode(signature.to_bytes()),
        );
        assert!(result.is_err());
        assert!(!auth.is_authenticated("peer-1"));
    }
}
