//! Kyber Session Key Wrapping
//!
//! Each client holds one Kyber1024 key pair for its whole session. A peer
//! wraps a fresh [`SessionKey`] for it by encapsulating against the public
//! key, stretching the KEM secret with HKDF-SHA256, and sealing the session
//! key (plus the wrapper's username) under the result with AES-256-GCM.
//!
//! Wrapped layout: `kem_ciphertext (1568) || iv (12) || sealed`.

use hkdf::Hkdf;
use pqcrypto_kyber::kyber1024::{self, Ciphertext, PublicKey, SecretKey};
use pqcrypto_traits::kem::{Ciphertext as _, PublicKey as _, SharedSecret as _};
use sha2::Sha256;

use super::session::{SessionKey, KEY_LEN};
use super::CryptoError;

const WRAP_INFO: &[u8] = b"whiteboard-relay session key wrap v1";
const WRAP_AAD: &[u8] = b"SESSION_KEY";

/// Client key pair; only the public half ever leaves the process
pub struct KeyPair {
    public_key: PublicKey,
    secret_key: SecretKey,
}

impl KeyPair {
    /// Generate a new Kyber key pair
    pub fn generate() -> Self {
        let (public_key, secret_key) = kyber1024::keypair();
        Self {
            public_key,
            secret_key,
        }
    }

    /// Public key bytes for the `PublicKey` announcement
    pub fn public_key_bytes(&self) -> Vec<u8> {
        self.public_key.as_bytes().to_vec()
    }

    /// Recover the session key and the username of the peer that wrapped it
    pub fn unwrap_session_key(&self, wrapped: &[u8]) -> Result<(String, SessionKey), CryptoError> {
        let kem_len = kyber1024::ciphertext_bytes();
        if wrapped.len() <= kem_len {
            return Err(CryptoError::InvalidCiphertext);
        }
        let (kem_bytes, sealed) = wrapped.split_at(kem_len);

        let ciphertext =
            Ciphertext::from_bytes(kem_bytes).map_err(|_| CryptoError::InvalidCiphertext)?;
        let shared_secret = kyber1024::decapsulate(&ciphertext, &self.secret_key);
        let kek = derive_wrapping_key(shared_secret.as_bytes())?;

        let plaintext = kek.decrypt(sealed, WRAP_AAD)?;
        if plaintext.len() < KEY_LEN {
            return Err(CryptoError::InvalidCiphertext);
        }
        let (key, sender) = plaintext.split_at(KEY_LEN);
        let sender = String::from_utf8(sender.to_vec()).map_err(|_| CryptoError::InvalidCiphertext)?;

        Ok((sender, SessionKey::from_bytes(key)?))
    }
}

impl Default for KeyPair {
    fn default() -> Self {
        Self::generate()
    }
}

/// Wrap `key` for the owner of `peer_public_key`, tagging it with the
/// wrapper's own username
pub fn wrap_session_key(
    peer_public_key: &[u8],
    key: &SessionKey,
    sender: &str,
) -> Result<Vec<u8>, CryptoError> {
    let public_key =
        PublicKey::from_bytes(peer_public_key).map_err(|_| CryptoError::InvalidPublicKey)?;
    let (shared_secret, ciphertext) = kyber1024::encapsulate(&public_key);
    let kek = derive_wrapping_key(shared_secret.as_bytes())?;

    let mut plaintext = Vec::with_capacity(KEY_LEN + sender.len());
    plaintext.extend_from_slice(key.as_bytes());
    plaintext.extend_from_slice(sender.as_bytes());
    let sealed = kek.encrypt(&plaintext, WRAP_AAD)?;

    let mut wrapped = Vec::with_capacity(ciphertext.as_bytes().len() + sealed.len());
    wrapped.extend_from_slice(ciphertext.as_bytes());
    wrapped.extend_from_slice(&sealed);
    Ok(wrapped)
}

fn derive_wrapping_key(shared_secret: &[u8]) -> Result<SessionKey, CryptoError> {
    let hk = Hkdf::<Sha256>::new(None, shared_secret);
    let mut okm = [0u8; KEY_LEN];
    hk.expand(WRAP_INFO, &mut okm)
        .map_err(|_| CryptoError::KeyDerivationFailed)?;
    SessionKey::from_bytes(&okm)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wrap_unwrap() {
        let bob = KeyPair::generate();
        let key = SessionKey::generate();

        let wrapped = wrap_session_key(&bob.public_key_bytes(), &key, "alice").unwrap();
        let (sender, unwrapped) = bob.unwrap_session_key(&wrapped).unwrap();

        assert_eq!(sender, "alice");
        assert_eq!(unwrapped, key);
    }

    #[test]
    fn test_only_recipient_can_unwrap() {
        let bob = KeyPair::generate();
        let carol = KeyPair::generate();
        let key = SessionKey::generate();

        let wrapped = wrap_session_key(&bob.public_key_bytes(), &key, "alice").unwrap();
        assert_eq!(
            carol.unwrap_session_key(&wrapped).unwrap_err(),
            CryptoError::DecryptionFailed
        );
    }

    #[test]
    fn test_tampered_wrap_rejected() {
        let bob = KeyPair::generate();
        let key = SessionKey::generate();

        let mut wrapped = wrap_session_key(&bob.public_key_bytes(), &key, "alice").unwrap();
        let last = wrapped.len() - 1;
        wrapped[last] ^= 0x01;
        assert!(bob.unwrap_session_key(&wrapped).is_err());
        assert_eq!(
            bob.unwrap_session_key(&[0u8; 16]).unwrap_err(),
            CryptoError::InvalidCiphertext
        );
    }

    #[test]
    fn test_invalid_public_key() {
        let key = SessionKey::generate();
        assert_eq!(
            wrap_session_key(&[1, 2, 3], &key, "alice").unwrap_err(),
            CryptoError::InvalidPublicKey
        );
    }
}
