//! AES-256-GCM payload encryption and HMAC-SHA256 discovery-key derivation
//! (spec §4.4).

use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use thiserror::Error;

pub const KEY_LEN: usize = 32;
pub const IV_LEN: usize = 12;
pub const TAG_LEN: usize = 16;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("key must be {KEY_LEN} bytes, got {0}")]
    InvalidKeyLength(usize),
    #[error("invalid hex encoding: {0}")]
    InvalidHex(#[from] hex::FromHexError),
    #[error("decryption failed: authentication tag mismatch or corrupted ciphertext")]
    DecryptionFailed,
}

/// Hex-encoded ciphertext, IV, and auth tag, ready for transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedPayload {
    pub ciphertext_hex: String,
    pub iv_hex: String,
    pub tag_hex: String,
}

fn load_key(key: &[u8]) -> Result<Key<Aes256Gcm>, CryptoError> {
    if key.len() != KEY_LEN {
        return Err(CryptoError::InvalidKeyLength(key.len()));
    }
    Ok(*Key::<Aes256Gcm>::from_slice(key))
}

/// Encrypts `plaintext` under `key` (32 bytes) with a fresh random 12-byte
/// IV. AES-GCM appends its 16-byte tag to the ciphertext; we split it back
/// out so the wire format carries ciphertext/iv/tag separately.
pub fn encrypt_payload(key: &[u8], plaintext: &[u8]) -> Result<EncryptedPayload, CryptoError> {
    let key = load_key(key)?;
    let cipher = Aes256Gcm::new(&key);
    let mut iv_bytes = [0u8; IV_LEN];
    OsRng.fill_bytes(&mut iv_bytes);
    let nonce = Nonce::from_slice(&iv_bytes);
    let mut out = cipher
        .encrypt(nonce, plaintext)
        .map_err(|_| CryptoError::DecryptionFailed)?;
    let tag = out.split_off(out.len() - TAG_LEN);
    Ok(EncryptedPayload {
        ciphertext_hex: hex::encode(out),
        iv_hex: hex::encode(iv_bytes),
        tag_hex: hex::encode(tag),
    })
}

/// Decrypts an [`EncryptedPayload`] under `key`. Fails explicitly on an
/// incorrect key or a tampered ciphertext/tag.
pub fn decrypt_payload(key: &[u8], payload: &EncryptedPayload) -> Result<Vec<u8>, CryptoError> {
    let key = load_key(key)?;
    let cipher = Aes256Gcm::new(&key);
    let iv = hex::decode(&payload.iv_hex)?;
    let mut ciphertext = hex::decode(&payload.ciphertext_hex)?;
    let tag = hex::decode(&payload.tag_hex)?;
    ciphertext.extend_from_slice(&tag);
    let nonce = Nonce::from_slice(&iv);
    cipher
        .decrypt(nonce, ciphertext.as_ref())
        .map_err(|_| CryptoError::DecryptionFailed)
}

/// `HMAC-SHA256(secret, "discovery:" + store_name)` — used to verify a
/// peer is authorised to talk about a store before replication opens.
pub fn derive_discovery_key(store_name: &str, secret: &[u8]) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret).expect("HMAC accepts any key length");
    mac.update(b"discovery:");
    mac.update(store_name.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> [u8; KEY_LEN] {
        [7u8; KEY_LEN]
    }

    #[test]
    fn round_trips() {
        let payload = encrypt_payload(&key(), b"hello hypercore").unwrap();
        let plain = decrypt_payload(&key(), &payload).unwrap();
        assert_eq!(plain, b"hello hypercore");
    }

    #[test]
    fn wrong_key_fails_explicitly() {
        let payload = encrypt_payload(&key(), b"hello").unwrap();
        let other_key = [9u8; KEY_LEN];
        assert!(decrypt_payload(&other_key, &payload).is_err());
    }

    #[test]
    fn tampered_ciphertext_fails_explicitly() {
        let mut payload = encrypt_payload(&key(), b"hello").unwrap();
        let mut bytes = hex::decode(&payload.ciphertext_hex).unwrap();
        bytes[0] ^= 0xFF;
        payload.ciphertext_hex = hex::encode(bytes);
        assert!(decrypt_payload(&key(), &payload).is_err());
    }

    #[test]
    fn tampered_tag_fails_explicitly() {
        let mut payload = encrypt_payload(&key(), b"hello").unwrap();
        let mut bytes = hex::decode(&payload.tag_hex).unwrap();
        bytes[0] ^= 0xFF;
        payload.tag_hex = hex::encode(bytes);
        assert!(decrypt_payload(&key(), &payload).is_err());
    }

    #[test]
    fn discovery_key_is_deterministic_and_namespaced() {
        let secret = b"shared-secret";
        let a = derive_discovery_key("store-a", secret);
        let b = derive_discovery_key("store-a", secret);
        let c = derive_discovery_key("store-b", secret);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
