//! End-to-end scenarios over a real loopback relay

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};

use whiteboard_relay::client::{ReceivedFile, SessionHandler, SessionOptions};
use whiteboard_relay::crypto::{KeyPair, SessionKey};
use whiteboard_relay::uploads::{FileFilter, UploadStore};
use whiteboard_relay::{
    ClientSession, Message, RelayConfig, RelayError, RelayServer, SecureSession, ShutdownHandle,
};

#[derive(Debug, Clone, PartialEq)]
enum Event {
    UserList(Vec<String>),
    Draw(u16, u16, u16, u16),
    Chat(String),
    File(ReceivedFile),
    SessionKey(String, Vec<u8>),
    EncryptedChat(String, Vec<u8>),
    Closed,
}

struct Channel(mpsc::UnboundedSender<Event>);

impl SessionHandler for Channel {
    fn on_draw(&self, x1: u16, y1: u16, x2: u16, y2: u16) {
        let _ = self.0.send(Event::Draw(x1, y1, x2, y2));
    }

    fn on_chat(&self, body: &str) {
        let _ = self.0.send(Event::Chat(body.to_string()));
    }

    fn on_file(&self, file: &ReceivedFile) {
        let _ = self.0.send(Event::File(file.clone()));
    }

    fn on_user_list(&self, names: &[String]) {
        let _ = self.0.send(Event::UserList(names.to_vec()));
    }

    fn on_session_key(&self, username: &str, wrapped_key: &[u8]) {
        let _ = self.0.send(Event::SessionKey(username.to_string(), wrapped_key.to_vec()));
    }

    fn on_encrypted_chat(&self, target: &str, ciphertext: &[u8]) {
        let _ = self.0.send(Event::EncryptedChat(target.to_string(), ciphertext.to_vec()));
    }

    fn on_closed(&self, _reason: &RelayError) {
        let _ = self.0.send(Event::Closed);
    }
}

struct TestRelay {
    addr: SocketAddr,
    shutdown: ShutdownHandle,
    task: JoinHandle<whiteboard_relay::Result<()>>,
}

impl TestRelay {
    async fn start(config: RelayConfig) -> Self {
        let server = RelayServer::bind(RelayConfig { port: 0, ..config }).await.unwrap();
        let addr = server.local_addr();
        let shutdown = server.shutdown_handle();
        let task = tokio::spawn(server.run());
        Self {
            addr,
            shutdown,
            task,
        }
    }

    async fn stop(self) {
        self.shutdown.shutdown();
        timeout(Duration::from_secs(5), self.task)
            .await
            .expect("relay did not stop")
            .unwrap()
            .unwrap();
    }
}

async fn join(
    addr: SocketAddr,
    username: &str,
    options: SessionOptions,
) -> (ClientSession, mpsc::UnboundedReceiver<Event>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let session = ClientSession::connect(addr, "pass123", username, options, Arc::new(Channel(tx)))
        .await
        .unwrap();
    (session, rx)
}

async fn join_secure(addr: SocketAddr, username: &str) -> (SecureSession, mpsc::UnboundedReceiver<Event>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let session = SecureSession::connect(
        addr,
        "pass123",
        username,
        SessionOptions::default(),
        Arc::new(Channel(tx)),
    )
    .await
    .unwrap();
    (session, rx)
}

async fn next_event(rx: &mut mpsc::UnboundedReceiver<Event>) -> Event {
    timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for an event")
        .expect("event channel closed")
}

/// Skip events until one matches
async fn next_matching(
    rx: &mut mpsc::UnboundedReceiver<Event>,
    wanted: impl Fn(&Event) -> bool,
) -> Event {
    loop {
        let event = next_event(rx).await;
        if wanted(&event) {
            return event;
        }
    }
}

async fn next_user_list(rx: &mut mpsc::UnboundedReceiver<Event>) -> Vec<String> {
    match next_matching(rx, |e| matches!(e, Event::UserList(_))).await {
        Event::UserList(names) => names,
        _ => unreachable!(),
    }
}

async fn assert_quiet(rx: &mut mpsc::UnboundedReceiver<Event>) {
    if let Ok(Some(event)) = timeout(Duration::from_millis(200), rx.recv()).await {
        panic!("unexpected event: {:?}", event);
    }
}

fn names(list: &[&str]) -> Vec<String> {
    list.iter().map(|n| n.to_string()).collect()
}

#[tokio::test]
async fn test_draw_reaches_others_but_not_sender() {
    let relay = TestRelay::start(RelayConfig::default()).await;

    let (alice, mut alice_rx) = join(relay.addr, "alice", SessionOptions::default()).await;
    assert_eq!(next_user_list(&mut alice_rx).await, names(&["alice"]));

    let (_bob, mut bob_rx) = join(relay.addr, "bob", SessionOptions::default()).await;
    assert_eq!(next_user_list(&mut alice_rx).await, names(&["alice", "bob"]));
    assert_eq!(next_user_list(&mut bob_rx).await, names(&["alice", "bob"]));

    alice
        .send(&Message::Draw {
            x1: 10,
            y1: 10,
            x2: 50,
            y2: 50,
        })
        .unwrap();
    assert_eq!(next_event(&mut bob_rx).await, Event::Draw(10, 10, 50, 50));
    assert_quiet(&mut alice_rx).await;

    alice.disconnect();
    assert_eq!(next_user_list(&mut bob_rx).await, names(&["bob"]));
    timeout(Duration::from_secs(5), alice.closed()).await.unwrap();
    assert_eq!(next_event(&mut alice_rx).await, Event::Closed);

    relay.stop().await;
}

#[tokio::test]
async fn test_user_list_tracks_active_connections() {
    let relay = TestRelay::start(RelayConfig::default()).await;

    // Each join is confirmed before the next one starts so the order is fixed
    let (_alice, mut alice_rx) = join(relay.addr, "alice", SessionOptions::default()).await;
    assert_eq!(next_user_list(&mut alice_rx).await, names(&["alice"]));
    let (bob, _bob_rx) = join(relay.addr, "bob", SessionOptions::default()).await;
    assert_eq!(next_user_list(&mut alice_rx).await, names(&["alice", "bob"]));
    let (_carol, _carol_rx) = join(relay.addr, "carol", SessionOptions::default()).await;
    assert_eq!(next_user_list(&mut alice_rx).await, names(&["alice", "bob", "carol"]));

    bob.disconnect();
    assert_eq!(next_user_list(&mut alice_rx).await, names(&["alice", "carol"]));

    let (_dave, _dave_rx) = join(relay.addr, "dave", SessionOptions::default()).await;
    assert_eq!(next_user_list(&mut alice_rx).await, names(&["alice", "carol", "dave"]));

    relay.stop().await;
}

#[tokio::test]
async fn test_wrong_password_never_joins() {
    let relay = TestRelay::start(RelayConfig::default()).await;
    let (_alice, mut alice_rx) = join(relay.addr, "alice", SessionOptions::default()).await;
    assert_eq!(next_user_list(&mut alice_rx).await, names(&["alice"]));

    let rejected = ClientSession::handshake(relay.addr, "letmein", "mallory", 1024).await;
    assert!(matches!(rejected, Err(RelayError::AuthenticationFailed(_))));

    let (_bob, _bob_rx) = join(relay.addr, "bob", SessionOptions::default()).await;
    assert_eq!(next_user_list(&mut alice_rx).await, names(&["alice", "bob"]));

    relay.stop().await;
}

#[tokio::test]
async fn test_disallowed_upload_is_neither_stored_nor_forwarded() {
    let relay_dir = tempfile::tempdir().unwrap();
    let bob_dir = tempfile::tempdir().unwrap();
    let relay = TestRelay::start(RelayConfig {
        uploads_dir: Some(relay_dir.path().to_path_buf()),
        ..RelayConfig::default()
    })
    .await;

    let (alice, mut alice_rx) = join(relay.addr, "alice", SessionOptions::default()).await;
    next_user_list(&mut alice_rx).await;
    let bob_options = SessionOptions {
        uploads: Some(UploadStore::new(bob_dir.path(), FileFilter::default())),
        ..SessionOptions::default()
    };
    let (_bob, mut bob_rx) = join(relay.addr, "bob", bob_options).await;
    next_user_list(&mut bob_rx).await;

    alice
        .send(&Message::File {
            uploader: "alice".to_string(),
            filename: "notes.exe".to_string(),
            content: b"MZ".to_vec(),
        })
        .unwrap();
    alice
        .send(&Message::File {
            uploader: "someone-else".to_string(),
            filename: "notes.txt".to_string(),
            content: b"minutes|of|the|meeting".to_vec(),
        })
        .unwrap();

    match next_event(&mut bob_rx).await {
        Event::File(file) => {
            assert_eq!(file.uploader, "alice");
            assert_eq!(file.filename, "notes.txt");
            assert_eq!(file.content, b"minutes|of|the|meeting");
            assert_eq!(file.saved_to, Some(bob_dir.path().join("notes.txt")));
        }
        other => panic!("Wrong event: {:?}", other),
    }

    assert!(!relay_dir.path().join("notes.exe").exists());
    assert!(relay_dir.path().join("notes.txt").exists());
    assert!(!bob_dir.path().join("notes.exe").exists());

    relay.stop().await;
}

#[tokio::test]
async fn test_encrypted_chat_is_private_to_its_target() {
    let relay = TestRelay::start(RelayConfig::default()).await;

    // Carol runs a plain client and sees every frame the relay fans out
    let (_carol, mut carol_rx) = join(relay.addr, "carol", SessionOptions::default()).await;
    assert_eq!(next_user_list(&mut carol_rx).await, names(&["carol"]));
    let (alice, _alice_rx) = join_secure(relay.addr, "alice").await;
    assert_eq!(next_user_list(&mut carol_rx).await, names(&["carol", "alice"]));
    let (bob, mut bob_rx) = join_secure(relay.addr, "bob").await;

    timeout(Duration::from_secs(10), async {
        while !(alice.has_key_for("bob") && bob.has_key_for("alice")) {
            sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("key exchange did not complete");

    let secret = "meet at the usual place";
    alice.send_encrypted("bob", secret).unwrap();

    let received = next_matching(&mut bob_rx, |e| matches!(e, Event::Chat(_))).await;
    assert_eq!(received, Event::Chat(format!("alice: {}", secret)));

    // Carol saw the wrapped key addressed to bob but cannot unwrap it
    let wrapped = match next_matching(&mut carol_rx, |e| {
        matches!(e, Event::SessionKey(target, _) if target == "bob")
    })
    .await
    {
        Event::SessionKey(_, wrapped) => wrapped,
        _ => unreachable!(),
    };
    assert!(KeyPair::generate().unwrap_session_key(&wrapped).is_err());

    // ...nor read the chat itself
    let ciphertext = match next_matching(&mut carol_rx, |e| matches!(e, Event::EncryptedChat(..))).await {
        Event::EncryptedChat(target, ciphertext) => {
            assert_eq!(target, "bob");
            ciphertext
        }
        _ => unreachable!(),
    };
    assert!(!ciphertext
        .windows(secret.len())
        .any(|window| window == secret.as_bytes()));
    assert!(SessionKey::generate().decrypt(&ciphertext, b"bob").is_err());

    relay.stop().await;
}
