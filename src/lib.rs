//! Whiteboard Relay - Shared Whiteboard Session Library
//!
//! This library provides the wire protocol, the password-gated relay
//! server, the client session actor, and an optional post-quantum
//! end-to-end layer for encrypted chat between whiteboard clients.

pub mod client;
pub mod config;
pub mod crypto;
pub mod error;
pub mod frame;
pub mod protocol;
pub mod relay;
pub mod roster;
pub mod secure;
pub mod uploads;

pub use client::{ClientSession, ReceivedFile, SessionHandler, SessionOptions, SessionSender};
pub use config::{ClientConfig, RelayConfig};
pub use error::{RelayError, Result};
pub use protocol::{Message, ShapeKind};
pub use relay::{RelayServer, ShutdownHandle};
pub use secure::SecureSession;
