//! Relay Server
//!
//! Accepts TCP connections, gates them on the shared session secret, and
//! fans every frame an authenticated client sends out to all the others.
//!
//! Per connection: `Connecting -> AwaitingPassword -> AwaitingUsername ->
//! Active -> Closed`. Each connection runs as a task inside the server's
//! `JoinSet`, with a second writer task draining its bounded outbound
//! queue, so a stalled peer only ever stalls itself.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio::time::timeout;
use uuid::Uuid;

use crate::config::RelayConfig;
use crate::error::{RelayError, Result};
use crate::frame::{read_frame, write_frame, FrameError};
use crate::protocol::{is_file_frame, Message};
use crate::roster::{ConnectionId, Outbound, Roster};
use crate::uploads::{FileFilter, UploadStore};

/// Handshake acknowledgement
pub const HANDSHAKE_OK: &[u8] = b"OK";

/// First byte of a handshake rejection; the rest is the reason
pub const HANDSHAKE_REJECT: u8 = b'X';

/// Handshake payloads are short strings
const MAX_HANDSHAKE_FRAME: usize = 4 * 1024;

/// Connection lifecycle, as seen by the relay
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPhase {
    Connecting,
    AwaitingPassword,
    AwaitingUsername,
    Active,
    Closed,
}

impl fmt::Display for ConnectionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionPhase::Connecting => "connecting",
            ConnectionPhase::AwaitingPassword => "awaiting-password",
            ConnectionPhase::AwaitingUsername => "awaiting-username",
            ConnectionPhase::Active => "active",
            ConnectionPhase::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Per-connection bookkeeping used for phase tracking and log lines
struct ConnectionLog {
    addr: SocketAddr,
    phase: ConnectionPhase,
}

impl ConnectionLog {
    fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            phase: ConnectionPhase::Connecting,
        }
    }

    fn advance(&mut self, next: ConnectionPhase) {
        debug!("{}: {} -> {}", self.addr, self.phase, next);
        self.phase = next;
    }
}

/// State shared by every connection task
struct Shared {
    password: String,
    roster: Arc<Roster>,
    filter: FileFilter,
    uploads: Option<UploadStore>,
    handshake_timeout: Duration,
    write_timeout: Duration,
    queue_capacity: usize,
    max_frame_size: usize,
}

/// Stops a running [`RelayServer`]
#[derive(Clone)]
pub struct ShutdownHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.tx.send_replace(true);
        info!("Relay shutdown initiated");
    }
}

/// Relay server bound to a listening socket
pub struct RelayServer {
    listener: TcpListener,
    addr: SocketAddr,
    shared: Arc<Shared>,
    shutdown_tx: Arc<watch::Sender<bool>>,
}

impl RelayServer {
    /// Bind the listener described by `config`
    pub async fn bind(config: RelayConfig) -> Result<Self> {
        let listener = TcpListener::bind(config.listen_addr()).await?;
        let addr = listener.local_addr()?;

        let filter = config.file_filter();
        let uploads = config
            .uploads_dir
            .as_ref()
            .map(|dir| UploadStore::new(dir.clone(), filter.clone()));

        let shared = Arc::new(Shared {
            password: config.password.clone(),
            roster: Arc::new(Roster::new()),
            filter,
            uploads,
            handshake_timeout: config.handshake_timeout(),
            write_timeout: config.write_timeout(),
            queue_capacity: config.outbound_queue_capacity.max(1),
            max_frame_size: config.max_frame_size,
        });

        let (shutdown_tx, _) = watch::channel(false);
        info!("Relay listening on {}", addr);

        Ok(Self {
            listener,
            addr,
            shared,
            shutdown_tx: Arc::new(shutdown_tx),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn roster(&self) -> Arc<Roster> {
        self.shared.roster.clone()
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            tx: self.shutdown_tx.clone(),
        }
    }

    /// Accept connections until shut down, then wait for every connection
    /// task to finish
    pub async fn run(self) -> Result<()> {
        let mut connections = JoinSet::new();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, peer_addr)) => {
                            debug!("New connection from {}", peer_addr);
                            connections.spawn(handle_connection(
                                stream,
                                peer_addr,
                                self.shared.clone(),
                                self.shutdown_tx.subscribe(),
                            ));
                        }
                        Err(e) => {
                            error!("Accept failed: {}", e);
                        }
                    }
                }
                Some(finished) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(e) = finished {
                        error!("Connection task failed: {}", e);
                    }
                }
                _ = stopping(&mut shutdown_rx) => {
                    break;
                }
            }
        }

        drop(self.listener);
        info!("Draining {} connection(s)", connections.len());
        while let Some(finished) = connections.join_next().await {
            if let Err(e) = finished {
                error!("Connection task failed: {}", e);
            }
        }
        info!("Relay stopped");
        Ok(())
    }
}

/// Handle a single client connection
async fn handle_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    shared: Arc<Shared>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut conn = ConnectionLog::new(peer_addr);
    let (mut reader, mut writer) = stream.into_split();

    let outcome = tokio::select! {
        result = timeout(
            shared.handshake_timeout,
            handshake(&mut reader, &mut writer, &shared, &mut conn),
        ) => result.unwrap_or(Err(RelayError::HandshakeTimeout)),
        _ = stopping(&mut shutdown_rx) => Err(RelayError::ConnectionLost("relay shutting down".into())),
    };

    let username = match outcome {
        Ok(username) => username,
        Err(e) => {
            warn!("{}: handshake failed: {}", peer_addr, e);
            let _ = writer.shutdown().await;
            conn.advance(ConnectionPhase::Closed);
            return;
        }
    };

    let id: ConnectionId = Uuid::new_v4();
    let (tx, rx) = mpsc::channel(shared.queue_capacity);
    let mut writer_task = tokio::spawn(writer_loop(writer, rx, shared.write_timeout));
    let mut writer_done = false;

    // The roster now owns the only sender; dropping it ends the writer.
    let mut removal = shared.roster.join(id, username.clone(), tx);
    conn.advance(ConnectionPhase::Active);

    loop {
        tokio::select! {
            frame = read_frame(&mut reader, shared.max_frame_size) => {
                match frame {
                    Ok(payload) => route(&shared, id, &username, payload),
                    Err(FrameError::ConnectionClosed) => {
                        debug!("{} closed the connection", username);
                        break;
                    }
                    Err(e) => {
                        warn!("Read error from {}: {}", username, e);
                        break;
                    }
                }
            }
            _ = &mut writer_task => {
                writer_done = true;
                debug!("Writer for {} finished", username);
                break;
            }
            _ = &mut removal => {
                // Evicted: stop reading and drop the socket without waiting
                // on a stalled write
                info!("Closing evicted connection {} ({})", username, peer_addr);
                writer_task.abort();
                break;
            }
            _ = stopping(&mut shutdown_rx) => {
                debug!("Closing {} for shutdown", username);
                break;
            }
        }
    }

    shared.roster.leave(id);
    if !writer_done {
        let _ = writer_task.await;
    }
    conn.advance(ConnectionPhase::Closed);
    info!("{} disconnected ({})", username, peer_addr);
}

/// Resolves once shutdown has been requested, including a request made
/// before this receiver was first polled
async fn stopping(shutdown_rx: &mut watch::Receiver<bool>) {
    let _ = shutdown_rx.wait_for(|stop| *stop).await;
}

/// Password then username, each in its own frame.
///
/// Both strings are length-prefixed like every other frame. Older clients
/// wrote them as bare bytes; this is a deliberate wire change so that the
/// relay never has to guess where the password ends.
async fn handshake(
    reader: &mut OwnedReadHalf,
    writer: &mut OwnedWriteHalf,
    shared: &Shared,
    conn: &mut ConnectionLog,
) -> Result<String> {
    conn.advance(ConnectionPhase::AwaitingPassword);
    let password = read_frame(reader, MAX_HANDSHAKE_FRAME).await?;

    if password != shared.password.as_bytes() {
        let mut reject = vec![HANDSHAKE_REJECT];
        reject.extend_from_slice(b"Wrong password");
        write_frame(writer, &reject).await?;
        return Err(RelayError::AuthenticationFailed("wrong password".into()));
    }
    write_frame(writer, HANDSHAKE_OK).await?;

    conn.advance(ConnectionPhase::AwaitingUsername);
    let raw = read_frame(reader, MAX_HANDSHAKE_FRAME).await?;
    let username = String::from_utf8(raw).map_err(|_| RelayError::InvalidUsername)?;
    // An empty name cannot be told apart from an empty roster in a user list
    if username.is_empty() {
        return Err(RelayError::EmptyUsername);
    }
    Ok(username)
}

/// Drain the outbound queue onto the socket. A write that cannot complete
/// within `write_timeout` ends the connection.
async fn writer_loop(mut writer: OwnedWriteHalf, mut rx: mpsc::Receiver<Outbound>, write_timeout: Duration) {
    while let Some(payload) = rx.recv().await {
        match timeout(write_timeout, write_frame(&mut writer, &payload)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!("Write failed: {}", e);
                break;
            }
            Err(_) => {
                warn!("Write timed out after {:?}", write_timeout);
                break;
            }
        }
    }
    let _ = writer.shutdown().await;
}

/// Forward one frame from an active connection
fn route(shared: &Shared, sender: ConnectionId, username: &str, payload: Vec<u8>) {
    if payload.is_empty() {
        debug!("Dropping empty frame from {}", username);
        return;
    }
    if !shared.roster.contains(sender) {
        debug!("Dropping frame from {}: no longer on the board", username);
        return;
    }

    if !is_file_frame(&payload) {
        shared.roster.broadcast(&payload, sender);
        return;
    }

    match Message::decode(&payload) {
        Ok(Message::File {
            filename, content, ..
        }) => {
            if !shared.filter.is_allowed(&filename) {
                warn!(
                    "Dropping upload from {}: {}",
                    username,
                    RelayError::UnsupportedFileType(filename)
                );
                return;
            }

            // The relay, not the sender, decides who uploaded the file.
            let stamped = Message::File {
                uploader: username.to_string(),
                filename,
                content,
            };
            let encoded = stamped.encode();
            // Receivers enforce the same limit, so an oversized frame would
            // disconnect every one of them
            if encoded.len() > shared.max_frame_size {
                warn!(
                    "Dropping upload from {}: {}",
                    username,
                    FrameError::TooLarge {
                        len: encoded.len(),
                        max: shared.max_frame_size,
                    }
                );
                return;
            }

            if let (Some(store), Message::File { filename, content, .. }) = (&shared.uploads, &stamped) {
                if let Err(e) = store.store(filename, content) {
                    warn!("Could not store {} from {}: {}", filename, username, e);
                }
            }
            shared.roster.broadcast(&encoded, sender);
        }
        Ok(_) => {
            shared.roster.broadcast(&payload, sender);
        }
        Err(e) => {
            warn!("Dropping frame from {}: {}", username, RelayError::MalformedFrame(e));
        }
    }
}
