// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC
//! Envelope crypto (C2): symmetric encryption of OAuth blobs at rest.
//!
//! ChaCha20-Poly1305 with a fresh random 12-byte nonce per call, the same
//! AEAD idiom the pack's OAuth-state-dump encryption uses. Stored form is
//! `{ciphertext, iv}` as two separate fields rather than one opaque blob, so
//! the KV hash stays introspectable.

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use rand::RngCore;

use crate::error::RelayError;

#[derive(Clone)]
pub struct EnvelopeCipher {
    cipher: ChaCha20Poly1305,
}

/// Encrypted form of a byte string, stored as two hex-encoded hash fields.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub ciphertext: String,
    pub iv: String,
}

impl EnvelopeCipher {
    pub fn new(key_bytes: [u8; 32]) -> Self {
        let key = Key::from_slice(&key_bytes);
        Self {
            cipher: ChaCha20Poly1305::new(key),
        }
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Envelope, RelayError> {
        let mut nonce_bytes = [0u8; 12];
        rand::rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);
        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext)
            .map_err(|e| RelayError::Crypto(format!("encrypt failed: {e}")))?;
        Ok(Envelope {
            ciphertext: hex::encode(ciphertext),
            iv: hex::encode(nonce),
        })
    }

    pub fn encrypt_str(&self, plaintext: &str) -> Result<Envelope, RelayError> {
        self.encrypt(plaintext.as_bytes())
    }

    pub fn decrypt(&self, envelope: &Envelope) -> Result<Vec<u8>, RelayError> {
        let ciphertext = hex::decode(&envelope.ciphertext)
            .map_err(|e| RelayError::Crypto(format!("bad ciphertext encoding: {e}")))?;
        let iv = hex::decode(&envelope.iv)
            .map_err(|e| RelayError::Crypto(format!("bad iv encoding: {e}")))?;
        if iv.len() != 12 {
            return Err(RelayError::Crypto("iv must be 12 bytes".into()));
        }
        let nonce = Nonce::from_slice(&iv);
        self.cipher
            .decrypt(nonce, ciphertext.as_slice())
            .map_err(|e| RelayError::Crypto(format!("decrypt failed (wrong key?): {e}")))
    }

    pub fn decrypt_string(&self, envelope: &Envelope) -> Result<String, RelayError> {
        let bytes = self.decrypt(envelope)?;
        String::from_utf8(bytes).map_err(|e| RelayError::Crypto(format!("decrypted bytes not utf-8: {e}")))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn test_cipher() -> EnvelopeCipher {
        EnvelopeCipher::new([7u8; 32])
    }

    #[test]
    fn round_trip() {
        let cipher = test_cipher();
        let envelope = cipher.encrypt_str("sk-ant-oat01-secret").unwrap();
        let plain = cipher.decrypt_string(&envelope).unwrap();
        assert_eq!(plain, "sk-ant-oat01-secret");
    }

    #[test]
    fn wrong_key_errors_not_garbage() {
        let cipher = test_cipher();
        let envelope = cipher.encrypt_str("hello").unwrap();
        let other = EnvelopeCipher::new([9u8; 32]);
        assert!(other.decrypt_string(&envelope).is_err());
    }

    #[test]
    fn nonce_differs_per_call() {
        let cipher = test_cipher();
        let a = cipher.encrypt_str("same").unwrap();
        let b = cipher.encrypt_str("same").unwrap();
        assert_ne!(a.iv, b.iv);
        assert_ne!(a.ciphertext, b.ciphertext);
    }
}
