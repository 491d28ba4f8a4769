//! Configuration
//!
//! Configuration structures for the relay server and the client.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::frame::DEFAULT_MAX_FRAME_SIZE;
use crate::uploads::{FileFilter, DEFAULT_ALLOWED_EXTENSIONS};

/// Default relay port
pub const DEFAULT_PORT: u16 = 9999;

/// Default port for relays serving encrypted clients
pub const DEFAULT_SECURE_PORT: u16 = 12345;

/// Relay server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Shared session secret every client must present
    #[serde(default = "default_password")]
    pub password: String,
    #[serde(default = "default_handshake_timeout_secs")]
    pub handshake_timeout_secs: u64,
    #[serde(default = "default_write_timeout_secs")]
    pub write_timeout_secs: u64,
    #[serde(default = "default_outbound_queue_capacity")]
    pub outbound_queue_capacity: usize,
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,
    /// When set, the relay also keeps a copy of every accepted upload
    #[serde(default)]
    pub uploads_dir: Option<PathBuf>,
    #[serde(default = "default_allowed_extensions")]
    pub allowed_extensions: Vec<String>,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_password() -> String {
    "pass123".to_string()
}

fn default_handshake_timeout_secs() -> u64 {
    10
}

fn default_write_timeout_secs() -> u64 {
    5
}

fn default_outbound_queue_capacity() -> usize {
    256
}

fn default_max_frame_size() -> usize {
    DEFAULT_MAX_FRAME_SIZE
}

fn default_allowed_extensions() -> Vec<String> {
    DEFAULT_ALLOWED_EXTENSIONS
        .iter()
        .map(|ext| ext.to_string())
        .collect()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: DEFAULT_PORT,
            password: default_password(),
            handshake_timeout_secs: 10,
            write_timeout_secs: 5,
            outbound_queue_capacity: 256,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            uploads_dir: None,
            allowed_extensions: default_allowed_extensions(),
            log_level: default_log_level(),
        }
    }
}

impl RelayConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::IoError(e.to_string()))?;
        toml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs)
    }

    pub fn file_filter(&self) -> FileFilter {
        FileFilter::new(&self.allowed_extensions)
    }
}

/// Client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    #[serde(default = "default_host")]
    pub server_host: String,
    /// Falls back to the default port for the chosen mode
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default = "default_username")]
    pub username: String,
    #[serde(default)]
    pub password: Option<String>,
    /// Enable the end-to-end encrypted chat layer
    #[serde(default)]
    pub secure: bool,
    #[serde(default = "default_uploads_dir")]
    pub uploads_dir: Option<PathBuf>,
    #[serde(default = "default_allowed_extensions")]
    pub allowed_extensions: Vec<String>,
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_username() -> String {
    "User".to_string()
}

fn default_uploads_dir() -> Option<PathBuf> {
    Some(PathBuf::from("uploads"))
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_host: default_host(),
            port: None,
            username: default_username(),
            password: None,
            secure: false,
            uploads_dir: default_uploads_dir(),
            allowed_extensions: default_allowed_extensions(),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            log_level: default_log_level(),
        }
    }
}

impl ClientConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::IoError(e.to_string()))?;
        toml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    pub fn effective_port(&self) -> u16 {
        match (self.port, self.secure) {
            (Some(port), _) => port,
            (None, true) => DEFAULT_SECURE_PORT,
            (None, false) => DEFAULT_PORT,
        }
    }

    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server_host, self.effective_port())
    }

    pub fn file_filter(&self) -> FileFilter {
        FileFilter::new(&self.allowed_extensions)
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),
    #[error("Parse error: {0}")]
    ParseError(String),
}
