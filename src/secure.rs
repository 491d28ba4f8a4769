//! Encrypted Chat Session
//!
//! A [`ClientSession`] with an end-to-end layer in front of the
//! application's handler. Key exchange messages are consumed here; chat
//! addressed to this client is decrypted before the application sees it.
//! Drawing, plain chat, files and presence pass straight through.

use std::sync::Arc;

use log::{debug, info, warn};
use parking_lot::Mutex;
use tokio::net::ToSocketAddrs;

use crate::client::{ClientSession, ReceivedFile, SessionHandler, SessionOptions, SessionSender};
use crate::crypto::kyber::wrap_session_key;
use crate::crypto::{KeyPair, PeerKeyTable, SessionKey};
use crate::error::{RelayError, Result};
use crate::protocol::{Message, ShapeKind};

/// Intercepting handler holding this client's key material
struct SecureLayer {
    username: String,
    keypair: KeyPair,
    peers: Mutex<PeerKeyTable>,
    sender: SessionSender,
    app: Arc<dyn SessionHandler>,
}

impl SecureLayer {
    fn encrypt_for(&self, peer: &str, text: &str) -> Result<Message> {
        let key = self
            .peers
            .lock()
            .get(peer)
            .cloned()
            .ok_or_else(|| RelayError::NoSessionKey(peer.to_string()))?;
        let ciphertext = key.encrypt(text.as_bytes(), peer.as_bytes())?;
        Ok(Message::EncryptedChat {
            target: peer.to_string(),
            ciphertext,
        })
    }

    /// The relay does not say who sent an encrypted chat; the peer key that
    /// authenticates the ciphertext does
    fn trial_decrypt(&self, ciphertext: &[u8]) -> Option<(String, Vec<u8>)> {
        let peers = self.peers.lock();
        let found = peers.iter().find_map(|(peer, key)| {
            key.decrypt(ciphertext, self.username.as_bytes())
                .ok()
                .map(|plaintext| (peer.to_string(), plaintext))
        });
        found
    }
}

impl SessionHandler for SecureLayer {
    fn on_draw(&self, x1: u16, y1: u16, x2: u16, y2: u16) {
        self.app.on_draw(x1, y1, x2, y2);
    }

    fn on_shape(&self, kind: ShapeKind, x1: u16, y1: u16, x2: u16, y2: u16) {
        self.app.on_shape(kind, x1, y1, x2, y2);
    }

    fn on_text(&self, x: u16, y: u16, body: &str) {
        self.app.on_text(x, y, body);
    }

    fn on_chat(&self, body: &str) {
        self.app.on_chat(body);
    }

    fn on_file(&self, file: &ReceivedFile) {
        self.app.on_file(file);
    }

    fn on_user_list(&self, names: &[String]) {
        self.app.on_user_list(names);
    }

    fn on_public_key(&self, username: &str, key_bytes: &[u8]) {
        if username == self.username {
            return;
        }

        let key = SessionKey::generate();
        let wrapped = match wrap_session_key(key_bytes, &key, &self.username) {
            Ok(wrapped) => wrapped,
            Err(e) => {
                warn!("Ignoring public key from {}: {}", username, e);
                self.app.on_notice(&e.into());
                return;
            }
        };
        self.peers.lock().insert_initiated(username, key);
        debug!("Sending session key to {}", username);

        let reply = Message::SessionKey {
            username: username.to_string(),
            wrapped_key: wrapped,
        };
        if let Err(e) = self.sender.send(&reply) {
            debug!("Could not send session key to {}: {}", username, e);
        }
    }

    fn on_session_key(&self, username: &str, wrapped_key: &[u8]) {
        if username != self.username {
            return;
        }

        match self.keypair.unwrap_session_key(wrapped_key) {
            Ok((peer, _)) if peer == self.username => {}
            Ok((peer, key)) => {
                if self.peers.lock().accept_remote(&peer, key) {
                    info!("Session key established with {}", peer);
                } else {
                    debug!("Kept our own session key for {}", peer);
                }
            }
            Err(e) => {
                warn!("Could not unwrap session key: {}", e);
                self.app.on_notice(&e.into());
            }
        }
    }

    fn on_encrypted_chat(&self, target: &str, ciphertext: &[u8]) {
        if target != self.username {
            return;
        }

        match self.trial_decrypt(ciphertext) {
            Some((sender, plaintext)) => {
                let text = String::from_utf8_lossy(&plaintext);
                self.app.on_secure_chat(&sender, &text);
            }
            None => {
                warn!("Dropping encrypted chat: no matching session key");
                self.app
                    .on_notice(&RelayError::NoSessionKey("unknown sender".into()));
            }
        }
    }

    fn on_notice(&self, notice: &RelayError) {
        self.app.on_notice(notice);
    }

    fn on_closed(&self, reason: &RelayError) {
        self.app.on_closed(reason);
    }
}

/// Client session with end-to-end encrypted chat
pub struct SecureSession {
    session: ClientSession,
    layer: Arc<SecureLayer>,
}

impl SecureSession {
    /// Handshake, announce our public key, then start receiving
    pub async fn connect(
        addr: impl ToSocketAddrs,
        password: &str,
        username: &str,
        options: SessionOptions,
        handler: Arc<dyn SessionHandler>,
    ) -> Result<Self> {
        let pending = ClientSession::handshake(addr, password, username, options.max_frame_size)
            .await?
            .with_options(options);

        let layer = Arc::new(SecureLayer {
            username: username.to_string(),
            keypair: KeyPair::generate(),
            peers: Mutex::new(PeerKeyTable::new(username)),
            sender: pending.sender(),
            app: handler,
        });

        pending.sender().send(&Message::PublicKey {
            username: username.to_string(),
            key_bytes: layer.keypair.public_key_bytes(),
        })?;
        info!("Announced public key for {}", username);

        let session = pending.start(layer.clone());
        Ok(Self { session, layer })
    }

    pub fn session(&self) -> &ClientSession {
        &self.session
    }

    pub fn username(&self) -> &str {
        self.session.username()
    }

    /// Unencrypted traffic: drawing, plain chat, files
    pub fn send(&self, message: &Message) -> Result<()> {
        self.session.send(message)
    }

    /// Encrypt `text` for `peer`
    pub fn send_encrypted(&self, peer: &str, text: &str) -> Result<()> {
        let message = self.layer.encrypt_for(peer, text)?;
        self.session.send(&message)
    }

    /// Encrypt `text` once per peer with an established key. Returns the
    /// number of peers it was sent to.
    pub fn send_encrypted_to_all(&self, text: &str) -> Result<usize> {
        let peers = self.peers();
        for peer in &peers {
            self.send_encrypted(peer, text)?;
        }
        Ok(peers.len())
    }

    /// Peers with an established session key
    pub fn peers(&self) -> Vec<String> {
        self.layer.peers.lock().peers()
    }

    pub fn has_key_for(&self, peer: &str) -> bool {
        self.layer.peers.lock().contains(peer)
    }

    pub fn disconnect(&self) {
        self.session.disconnect();
    }

    pub async fn closed(&self) {
        self.session.closed().await;
    }
}
