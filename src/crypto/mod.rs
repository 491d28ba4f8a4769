//! End-to-End Chat Cryptography
//!
//! Kyber1024 wraps per-peer session keys; AES-256-GCM under those keys
//! protects chat payloads. The relay only ever sees public keys, wrapped
//! keys and ciphertext.

pub mod kyber;
pub mod peers;
pub mod session;

pub use kyber::KeyPair;
pub use peers::PeerKeyTable;
pub use session::SessionKey;

use thiserror::Error;

/// Errors that can occur in the crypto layer
#[derive(Error, Debug, PartialEq, Eq)]
pub enum CryptoError {
    #[error("Invalid public key length")]
    InvalidPublicKey,
    #[error("Invalid ciphertext")]
    InvalidCiphertext,
    #[error("Decryption failed")]
    DecryptionFailed,
    #[error("Key derivation failed")]
    KeyDerivationFailed,
}
