//! Symmetric Session Keys
//!
//! AES-256-GCM with a fresh 96-bit IV per message. Output layout is
//! `iv (12) || ciphertext || tag (16)`.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;

use super::CryptoError;

/// Session key length in bytes
pub const KEY_LEN: usize = 32;

/// IV length in bytes
pub const IV_LEN: usize = 12;

const TAG_LEN: usize = 16;

/// Symmetric key shared by exactly two peers
#[derive(Clone, PartialEq, Eq)]
pub struct SessionKey([u8; KEY_LEN]);

impl SessionKey {
    /// Fresh random key
    pub fn generate() -> Self {
        let mut key = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut key);
        Self(key)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let key: [u8; KEY_LEN] = bytes
            .try_into()
            .map_err(|_| CryptoError::InvalidCiphertext)?;
        Ok(Self(key))
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    fn cipher(&self) -> Aes256Gcm {
        Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.0))
    }

    /// Encrypt `plaintext`, binding `aad` into the tag
    pub fn encrypt(&self, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let mut iv = [0u8; IV_LEN];
        OsRng.fill_bytes(&mut iv);

        let sealed = self
            .cipher()
            .encrypt(
                Nonce::from_slice(&iv),
                Payload {
                    msg: plaintext,
                    aad,
                },
            )
            .map_err(|_| CryptoError::InvalidCiphertext)?;

        let mut out = Vec::with_capacity(IV_LEN + sealed.len());
        out.extend_from_slice(&iv);
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    /// Split the IV off `payload` and decrypt the rest
    pub fn decrypt(&self, payload: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if payload.len() < IV_LEN + TAG_LEN {
            return Err(CryptoError::InvalidCiphertext);
        }
        let (iv, sealed) = payload.split_at(IV_LEN);

        self.cipher()
            .decrypt(Nonce::from_slice(iv), Payload { msg: sealed, aad })
            .map_err(|_| CryptoError::DecryptionFailed)
    }
}

impl std::fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SessionKey(..)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encrypt_decrypt() {
        let key = SessionKey::generate();
        let payload = key.encrypt(b"hello bob", b"bob").unwrap();

        assert_eq!(payload.len(), IV_LEN + 9 + TAG_LEN);
        assert_eq!(key.decrypt(&payload, b"bob").unwrap(), b"hello bob");
    }

    #[test]
    fn test_fresh_iv_per_message() {
        let key = SessionKey::generate();
        let a = key.encrypt(b"same", b"").unwrap();
        let b = key.encrypt(b"same", b"").unwrap();
        assert_ne!(&a[..IV_LEN], &b[..IV_LEN]);
        assert_ne!(a, b);
    }

    #[test]
    fn test_wrong_key_or_aad_fails() {
        let key = SessionKey::generate();
        let other = SessionKey::generate();
        let payload = key.encrypt(b"secret", b"bob").unwrap();

        assert_eq!(
            other.decrypt(&payload, b"bob"),
            Err(CryptoError::DecryptionFailed)
        );
        assert_eq!(
            key.decrypt(&payload, b"carol"),
            Err(CryptoError::DecryptionFailed)
        );
        assert_eq!(
            key.decrypt(&payload[..10], b"bob"),
            Err(CryptoError::InvalidCiphertext)
        );
    }
}
