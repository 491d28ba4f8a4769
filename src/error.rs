//! Relay error types

use std::io;

use crate::crypto::CryptoError;
use crate::frame::FrameError;
use crate::protocol::DecodeError;
use crate::uploads::UploadError;

/// Relay result type
pub type Result<T> = std::result::Result<T, RelayError>;

/// Errors surfaced by the relay server and client sessions
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Malformed frame: {0}")]
    MalformedFrame(#[from] DecodeError),

    #[error("Unsupported file type: {0}")]
    UnsupportedFileType(String),

    #[error("Peer unreachable: {0}")]
    PeerUnreachable(String),

    #[error("No session key for {0}")]
    NoSessionKey(String),

    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    #[error("Handshake timed out")]
    HandshakeTimeout,

    #[error("Username is not valid UTF-8")]
    InvalidUsername,

    #[error("Username is empty")]
    EmptyUsername,

    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Upload error: {0}")]
    Upload(UploadError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl From<UploadError> for RelayError {
    fn from(e: UploadError) -> Self {
        match e {
            UploadError::UnsupportedFileType(name) => RelayError::UnsupportedFileType(name),
            other => RelayError::Upload(other),
        }
    }
}
