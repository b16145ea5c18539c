//! At-rest encryption for payload columns.
//!
//! Every payload stored by the Local Store is AES-256-GCM ciphertext with
//! the 12-byte nonce prepended. The key is injected at store
//! initialization; until then the store fails closed.

use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{AeadCore, Aes256Gcm, Key, Nonce};

use crate::error::{Error, Result};

/// Length of the AES-256 key in bytes
pub const KEY_SIZE: usize = 32;
/// Length of the GCM nonce in bytes
pub const NONCE_SIZE: usize = 12;

/// Payload cipher wrapping AES-256-GCM with a prepended random nonce.
pub struct PayloadCipher {
    cipher: Aes256Gcm,
}

impl PayloadCipher {
    /// Build a cipher from raw key material.
    pub fn new(key_bytes: &[u8]) -> Result<Self> {
        if key_bytes.len() != KEY_SIZE {
            return Err(Error::Encryption(format!(
                "key must be {KEY_SIZE} bytes, got {}",
                key_bytes.len()
            )));
        }
        let key = Key::<Aes256Gcm>::from_slice(key_bytes);
        Ok(Self {
            cipher: Aes256Gcm::new(key),
        })
    }

    /// Encrypt a serialized payload; output is `nonce || ciphertext`.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext)
            .map_err(|e| Error::Encryption(format!("encrypt failed: {e}")))?;

        let mut out = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    /// Decrypt `nonce || ciphertext` back to the serialized payload.
    ///
    /// A failure here means the row is unreadable and must be quarantined,
    /// not that the whole store is unusable.
    pub fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>> {
        if data.len() < NONCE_SIZE {
            return Err(Error::Encryption(
                "ciphertext shorter than nonce".to_string(),
            ));
        }
        let (nonce_bytes, ciphertext) = data.split_at(NONCE_SIZE);
        let nonce = Nonce::from_slice(nonce_bytes);
        self.cipher
            .decrypt(nonce, ciphertext)
            .map_err(|e| Error::Encryption(format!("decrypt failed: {e}")))
    }

    /// Encrypt a JSON payload value.
    pub fn encrypt_json(&self, value: &serde_json::Value) -> Result<Vec<u8>> {
        let plaintext = serde_json::to_vec(value)?;
        self.encrypt(&plaintext)
    }

    /// Decrypt back to a JSON payload value.
    pub fn decrypt_json(&self, data: &[u8]) -> Result<serde_json::Value> {
        let plaintext = self.decrypt(data)?;
        serde_json::from_slice(&plaintext)
            .map_err(|e| Error::Encryption(format!("decrypted payload is not JSON: {e}")))
    }
}

impl std::fmt::Debug for PayloadCipher {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("PayloadCipher")
            .field("key", &"[REDACTED]")
            .finish()
    }
}
