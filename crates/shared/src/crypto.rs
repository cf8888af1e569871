//! Sealed payloads for the companion channel.
//!
//! The desktop app encrypts sensitive responses with a key derived from the
//! user id, so the relay service only ever stores and forwards opaque blobs.
//! Every client paired to the same user derives the same key and can open
//! the envelope locally.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    XChaCha20Poly1305, XNonce,
};
use rand::RngCore;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

const KDF_CONTEXT_USER_KEY: &str = "downlink 2025 companion user payload key v1";
pub const NONCE_SIZE: usize = 24;

pub type SymmetricKey = [u8; 32];

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("Encryption failed")]
    EncryptionFailed,

    #[error("Decryption failed: invalid ciphertext or wrong key")]
    DecryptionFailed,

    #[error("Malformed envelope: {0}")]
    MalformedEnvelope(String),
}

/// Wire form of a sealed response body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SealedEnvelope {
    pub e2e_encrypted: bool,
    /// Base64-encoded 24-byte nonce.
    pub nonce: String,
    /// Base64-encoded ciphertext.
    pub data: String,
}

impl SealedEnvelope {
    /// Whether a raw JSON body declares itself sealed.
    pub fn is_sealed(body: &serde_json::Value) -> bool {
        body.get("e2e_encrypted")
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }
}

// BLAKE3 KDF with domain separation. Deterministic so every client paired
// to the same user ends up with the same key.
pub fn derive_user_key(user_id: &str) -> SymmetricKey {
    let mut hasher = blake3::Hasher::new_derive_key(KDF_CONTEXT_USER_KEY);
    hasher.update(user_id.as_bytes());
    let hash = hasher.finalize();
    let mut key = [0u8; 32];
    key.copy_from_slice(&hash.as_bytes()[..32]);
    key
}

fn generate_nonce() -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut nonce);
    nonce
}

/// Seal a JSON-serializable payload for the given user.
pub fn seal<T: Serialize>(payload: &T, user_id: &str) -> Result<SealedEnvelope, CryptoError> {
    let plaintext =
        serde_json::to_vec(payload).map_err(|e| CryptoError::MalformedEnvelope(e.to_string()))?;

    let key = derive_user_key(user_id);
    let cipher = XChaCha20Poly1305::new(&key.into());
    let nonce_bytes = generate_nonce();
    let nonce = XNonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext.as_slice())
        .map_err(|_| CryptoError::EncryptionFailed)?;

    Ok(SealedEnvelope {
        e2e_encrypted: true,
        nonce: BASE64.encode(nonce_bytes),
        data: BASE64.encode(ciphertext),
    })
}

/// Open a sealed envelope with the key derived from the given user id.
pub fn open<T: DeserializeOwned>(
    envelope: &SealedEnvelope,
    user_id: &str,
) -> Result<T, CryptoError> {
    let nonce_bytes = BASE64
        .decode(&envelope.nonce)
        .map_err(|e| CryptoError::MalformedEnvelope(format!("bad nonce: {e}")))?;
    if nonce_bytes.len() != NONCE_SIZE {
        return Err(CryptoError::MalformedEnvelope(format!(
            "nonce is {} bytes, expected {}",
            nonce_bytes.len(),
            NONCE_SIZE
        )));
    }
    let ciphertext = BASE64
        .decode(&envelope.data)
        .map_err(|e| CryptoError::MalformedEnvelope(format!("bad data: {e}")))?;

    let key = derive_user_key(user_id);
    let cipher = XChaCha20Poly1305::new(&key.into());
    let nonce = XNonce::from_slice(&nonce_bytes);

    let plaintext = cipher
        .decrypt(nonce, ciphertext.as_slice())
        .map_err(|_| CryptoError::DecryptionFailed)?;

    serde_json::from_slice(&plaintext).map_err(|e| CryptoError::MalformedEnvelope(e.to_string()))
}

/// Open a raw JSON body: sealed bodies are decrypted, plain bodies are
/// deserialized as-is (the service sends plain JSON for non-sensitive data).
pub fn open_body<T: DeserializeOwned>(
    body: serde_json::Value,
    user_id: &str,
) -> Result<T, CryptoError> {
    if SealedEnvelope::is_sealed(&body) {
        let envelope: SealedEnvelope = serde_json::from_value(body)
            .map_err(|e| CryptoError::MalformedEnvelope(e.to_string()))?;
        open(&envelope, user_id)
    } else {
        serde_json::from_value(body).map_err(|e| CryptoError::MalformedEnvelope(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DisplayNameResponse;

    #[test]
    fn test_seal_open_roundtrip() {
        let payload = DisplayNameResponse {
            display_name: "Alice".to_string(),
        };

        let envelope = seal(&payload, "user-1").unwrap();
        assert!(envelope.e2e_encrypted);

        let opened: DisplayNameResponse = open(&envelope, "user-1").unwrap();
        assert_eq!(opened.display_name, "Alice");
    }

    #[test]
    fn test_wrong_user_fails() {
        let payload = serde_json::json!({"secret": true});
        let envelope = seal(&payload, "user-1").unwrap();
        let result: Result<serde_json::Value, _> = open(&envelope, "user-2");
        assert!(matches!(result, Err(CryptoError::DecryptionFailed)));
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let payload = serde_json::json!({"n": 1});
        let mut envelope = seal(&payload, "user-1").unwrap();
        let mut raw = BASE64.decode(&envelope.data).unwrap();
        let len = raw.len();
        raw[len - 1] ^= 0xFF;
        envelope.data = BASE64.encode(raw);

        let result: Result<serde_json::Value, _> = open(&envelope, "user-1");
        assert!(matches!(result, Err(CryptoError::DecryptionFailed)));
    }

    #[test]
    fn test_key_derivation_deterministic() {
        assert_eq!(derive_user_key("user-1"), derive_user_key("user-1"));
        assert_ne!(derive_user_key("user-1"), derive_user_key("user-2"));
    }

    #[test]
    fn test_open_body_plain_passthrough() {
        let body = serde_json::json!({"displayName": "Bob"});
        let resp: DisplayNameResponse = open_body(body, "user-1").unwrap();
        assert_eq!(resp.display_name, "Bob");
    }

    #[test]
    fn test_open_body_sealed() {
        let payload = DisplayNameResponse {
            display_name: "Carol".to_string(),
        };
        let envelope = seal(&payload, "user-3").unwrap();
        let body = serde_json::to_value(&envelope).unwrap();
        assert!(SealedEnvelope::is_sealed(&body));

        let resp: DisplayNameResponse = open_body(body, "user-3").unwrap();
        assert_eq!(resp.display_name, "Carol");
    }

    #[test]
    fn test_truncated_nonce_is_malformed() {
        let envelope = SealedEnvelope {
            e2e_encrypted: true,
            nonce: BASE64.encode([0u8; 8]),
            data: BASE64.encode([0u8; 32]),
        };
        let result: Result<serde_json::Value, _> = open(&envelope, "user-1");
        assert!(matches!(result, Err(CryptoError::MalformedEnvelope(_))));
    }
}
