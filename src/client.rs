//! Client Session
//!
//! One connection to the relay as seen from a client: the password
//! handshake, a writer task fed through [`SessionSender`], and a receive
//! loop that decodes frames and hands them to a [`SessionHandler`].

use std::path::PathBuf;
use std::sync::Arc;

use log::{debug, info, warn};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::config::ClientConfig;
use crate::error::{RelayError, Result};
use crate::frame::{read_frame, write_frame, FrameError, DEFAULT_MAX_FRAME_SIZE};
use crate::protocol::{Message, ShapeKind};
use crate::relay::HANDSHAKE_REJECT;
use crate::uploads::{FileFilter, UploadStore};

const MAX_HANDSHAKE_FRAME: usize = 4 * 1024;

/// A file received from another client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedFile {
    pub uploader: String,
    pub filename: String,
    pub content: Vec<u8>,
    /// Where the file was written, if an upload store is attached
    pub saved_to: Option<PathBuf>,
}

/// Callbacks for everything the receive loop observes. All methods default
/// to doing nothing; callbacks run on the receive task and must not block.
pub trait SessionHandler: Send + Sync + 'static {
    fn on_draw(&self, _x1: u16, _y1: u16, _x2: u16, _y2: u16) {}

    fn on_shape(&self, _kind: ShapeKind, _x1: u16, _y1: u16, _x2: u16, _y2: u16) {}

    fn on_text(&self, _x: u16, _y: u16, _body: &str) {}

    fn on_chat(&self, _body: &str) {}

    /// Decrypted chat from the encrypted layer
    fn on_secure_chat(&self, sender: &str, text: &str) {
        self.on_chat(&format!("{}: {}", sender, text));
    }

    fn on_file(&self, _file: &ReceivedFile) {}

    fn on_user_list(&self, _names: &[String]) {}

    fn on_public_key(&self, _username: &str, _key_bytes: &[u8]) {}

    fn on_session_key(&self, _username: &str, _wrapped_key: &[u8]) {}

    fn on_encrypted_chat(&self, _target: &str, _ciphertext: &[u8]) {}

    /// Non-fatal problems: undecodable frames, rejected files, missing keys
    fn on_notice(&self, _notice: &RelayError) {}

    /// Fires exactly once, when the receive loop ends
    fn on_closed(&self, _reason: &RelayError) {}
}

/// Receive-side options
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub max_frame_size: usize,
    pub filter: FileFilter,
    pub uploads: Option<UploadStore>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            filter: FileFilter::default(),
            uploads: None,
        }
    }
}

impl SessionOptions {
    pub fn from_config(config: &ClientConfig) -> Self {
        let filter = config.file_filter();
        Self {
            max_frame_size: config.max_frame_size,
            uploads: config
                .uploads_dir
                .as_ref()
                .map(|dir| UploadStore::new(dir.clone(), filter.clone())),
            filter,
        }
    }
}

enum Outgoing {
    Frame(Vec<u8>),
    Close,
}

/// Queues frames for the session's writer task
#[derive(Clone)]
pub struct SessionSender {
    tx: mpsc::UnboundedSender<Outgoing>,
}

impl SessionSender {
    /// Encode and queue a message
    pub fn send(&self, message: &Message) -> Result<()> {
        self.send_raw(message.encode())
    }

    /// Queue a pre-encoded frame payload
    pub fn send_raw(&self, payload: Vec<u8>) -> Result<()> {
        self.tx
            .send(Outgoing::Frame(payload))
            .map_err(|_| RelayError::ConnectionLost("writer stopped".into()))
    }

    fn close(&self) {
        let _ = self.tx.send(Outgoing::Close);
    }
}

/// Authenticated connection whose receive loop has not started yet
pub struct PendingSession {
    username: String,
    reader: OwnedReadHalf,
    sender: SessionSender,
    writer_task: JoinHandle<()>,
    options: SessionOptions,
}

impl PendingSession {
    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn sender(&self) -> SessionSender {
        self.sender.clone()
    }

    pub fn with_options(mut self, options: SessionOptions) -> Self {
        self.options = options;
        self
    }

    /// Spawn the receive loop
    pub fn start(self, handler: Arc<dyn SessionHandler>) -> ClientSession {
        let (closed_tx, closed_rx) = watch::channel(false);
        let receive_task = tokio::spawn(receive_loop(
            self.reader,
            handler,
            self.options,
            self.sender.clone(),
            closed_tx,
        ));

        ClientSession {
            username: self.username,
            sender: self.sender,
            closed_rx,
            receive_task,
            writer_task: self.writer_task,
        }
    }
}

/// Running client session
pub struct ClientSession {
    username: String,
    sender: SessionSender,
    closed_rx: watch::Receiver<bool>,
    receive_task: JoinHandle<()>,
    writer_task: JoinHandle<()>,
}

impl ClientSession {
    /// Connect, authenticate and announce `username`.
    ///
    /// Password and username go out as length-prefixed frames, a deliberate
    /// departure from the older bare-bytes handshake.
    pub async fn handshake(
        addr: impl ToSocketAddrs,
        password: &str,
        username: &str,
        max_frame_size: usize,
    ) -> Result<PendingSession> {
        if username.is_empty() {
            return Err(RelayError::EmptyUsername);
        }
        let mut stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;

        write_frame(&mut stream, password.as_bytes()).await?;
        let response = read_frame(&mut stream, MAX_HANDSHAKE_FRAME).await?;
        if let Some((&HANDSHAKE_REJECT, reason)) = response.split_first() {
            let reason = String::from_utf8_lossy(reason).into_owned();
            warn!("Relay rejected the handshake: {}", reason);
            return Err(RelayError::AuthenticationFailed(reason));
        }
        write_frame(&mut stream, username.as_bytes()).await?;
        info!("Joined {} as {}", stream.peer_addr()?, username);

        let (reader, writer) = stream.into_split();
        let (tx, rx) = mpsc::unbounded_channel();
        let writer_task = tokio::spawn(writer_loop(writer, rx));

        Ok(PendingSession {
            username: username.to_string(),
            reader,
            sender: SessionSender { tx },
            writer_task,
            options: SessionOptions {
                max_frame_size,
                ..SessionOptions::default()
            },
        })
    }

    /// Handshake and start the receive loop in one step
    pub async fn connect(
        addr: impl ToSocketAddrs,
        password: &str,
        username: &str,
        options: SessionOptions,
        handler: Arc<dyn SessionHandler>,
    ) -> Result<Self> {
        let pending = Self::handshake(addr, password, username, options.max_frame_size).await?;
        Ok(pending.with_options(options).start(handler))
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn sender(&self) -> SessionSender {
        self.sender.clone()
    }

    pub fn send(&self, message: &Message) -> Result<()> {
        self.sender.send(message)
    }

    /// Shut the socket down. The relay answers by closing its side, which
    /// ends the receive loop.
    pub fn disconnect(&self) {
        debug!("{} disconnecting", self.username);
        self.sender.close();
    }

    pub fn is_closed(&self) -> bool {
        *self.closed_rx.borrow()
    }

    /// Wait for the receive loop to finish
    pub async fn closed(&self) {
        let mut rx = self.closed_rx.clone();
        let _ = rx.wait_for(|closed| *closed).await;
    }
}

impl Drop for ClientSession {
    fn drop(&mut self) {
        self.receive_task.abort();
        self.writer_task.abort();
    }
}

async fn writer_loop(mut writer: OwnedWriteHalf, mut rx: mpsc::UnboundedReceiver<Outgoing>) {
    while let Some(outgoing) = rx.recv().await {
        match outgoing {
            Outgoing::Frame(payload) => {
                if let Err(e) = write_frame(&mut writer, &payload).await {
                    warn!("Send failed: {}", e);
                    break;
                }
            }
            Outgoing::Close => break,
        }
    }
    let _ = writer.shutdown().await;
}

async fn receive_loop(
    mut reader: OwnedReadHalf,
    handler: Arc<dyn SessionHandler>,
    options: SessionOptions,
    sender: SessionSender,
    closed_tx: watch::Sender<bool>,
) {
    let reason = loop {
        match read_frame(&mut reader, options.max_frame_size).await {
            Ok(payload) if payload.is_empty() => continue,
            Ok(payload) => match Message::decode(&payload) {
                Ok(message) => dispatch(handler.as_ref(), &options, message),
                Err(e) => handler.on_notice(&RelayError::MalformedFrame(e)),
            },
            Err(FrameError::ConnectionClosed) => break "relay closed the connection".to_string(),
            Err(e) => break e.to_string(),
        }
    };

    info!("Session ended: {}", reason);
    sender.close();
    handler.on_closed(&RelayError::ConnectionLost(reason));
    closed_tx.send_replace(true);
}

fn dispatch(handler: &dyn SessionHandler, options: &SessionOptions, message: Message) {
    debug!("Received {} frame", message.kind());
    match message {
        Message::Draw { x1, y1, x2, y2 } => handler.on_draw(x1, y1, x2, y2),
        Message::Shape {
            kind,
            x1,
            y1,
            x2,
            y2,
        } => handler.on_shape(kind, x1, y1, x2, y2),
        Message::Text { x, y, body } => handler.on_text(x, y, &body),
        Message::Chat { body } => handler.on_chat(&body),
        Message::File {
            uploader,
            filename,
            content,
        } => {
            if let Err(e) = options.filter.check(&filename) {
                handler.on_notice(&e.into());
                return;
            }
            let saved_to = match &options.uploads {
                Some(store) => match store.store(&filename, &content) {
                    Ok(path) => Some(path),
                    Err(e) => {
                        handler.on_notice(&e.into());
                        None
                    }
                },
                None => None,
            };
            handler.on_file(&ReceivedFile {
                uploader,
                filename,
                content,
                saved_to,
            });
        }
        Message::UserList { names } => handler.on_user_list(&names),
        Message::PublicKey {
            username,
            key_bytes,
        } => handler.on_public_key(&username, &key_bytes),
        Message::SessionKey {
            username,
            wrapped_key,
        } => handler.on_session_key(&username, &wrapped_key),
        Message::EncryptedChat { target, ciphertext } => {
            handler.on_encrypted_chat(&target, &ciphertext)
        }
    }
}
