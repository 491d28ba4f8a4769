//! Whiteboard Client - Main Entry Point
//!
//! Line-oriented terminal client: drawing commands, chat, file sharing and,
//! in secure mode, end-to-end encrypted chat.

use anyhow::{Context, Result};
use chrono::Local;
use clap::Parser;
use log::info;
use parking_lot::Mutex;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};

use whiteboard_relay::client::{ReceivedFile, SessionHandler, SessionOptions};
use whiteboard_relay::{ClientConfig, ClientSession, Message, RelayError, SecureSession, ShapeKind};

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(name = "whiteboard-client")]
#[command(about = "Whiteboard Client - shared drawing, chat and files")]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config/client.toml")]
    config: PathBuf,

    /// Server host
    #[arg(long)]
    host: Option<String>,

    /// Server port
    #[arg(short, long)]
    port: Option<u16>,

    /// Username
    #[arg(short, long)]
    username: Option<String>,

    /// Session password (prompted for when absent)
    #[arg(long)]
    password: Option<String>,

    /// Enable end-to-end encrypted chat
    #[arg(long)]
    secure: bool,

    /// Log level (defaults to the config file's value)
    #[arg(long)]
    log_level: Option<String>,
}

/// A parsed input line
#[derive(Debug, Clone, PartialEq)]
enum Command {
    Send(Message),
    File(PathBuf),
    Who,
    To { peer: String, text: String },
    Peers,
    Help,
    Quit,
    Chat(String),
}

const USAGE: &str = "\
  /draw x1 y1 x2 y2    - Draw a line segment
  /rect x1 y1 x2 y2    - Draw a rectangle
  /circle x1 y1 x2 y2  - Draw a circle
  /text x y words...   - Place text on the board
  /file <path>         - Share a file
  /who                 - Show who is online
  /to <peer> <text>    - Encrypted message to one peer (secure mode)
  /peers               - Peers with an established key (secure mode)
  /quit                - Exit client
  anything else        - Chat";

fn parse_coords<const N: usize>(args: &[&str], usage: &str) -> Result<[u16; N], String> {
    if args.len() != N {
        return Err(format!("Usage: {}", usage));
    }
    let mut coords = [0u16; N];
    for (slot, arg) in coords.iter_mut().zip(args) {
        *slot = arg
            .parse()
            .map_err(|_| format!("Not a coordinate: {}", arg))?;
    }
    Ok(coords)
}

fn parse_command(line: &str) -> Result<Option<Command>, String> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    if !line.starts_with('/') {
        return Ok(Some(Command::Chat(line.to_string())));
    }

    let parts: Vec<&str> = line.split_whitespace().collect();
    let args = &parts[1..];
    let command = match parts[0].to_lowercase().as_str() {
        "/draw" => {
            let [x1, y1, x2, y2] = parse_coords::<4>(args, "/draw x1 y1 x2 y2")?;
            Command::Send(Message::Draw { x1, y1, x2, y2 })
        }
        "/rect" | "/circle" => {
            let kind = if parts[0].eq_ignore_ascii_case("/rect") {
                ShapeKind::Rect
            } else {
                ShapeKind::Circle
            };
            let [x1, y1, x2, y2] = parse_coords::<4>(args, "/rect|/circle x1 y1 x2 y2")?;
            Command::Send(Message::Shape {
                kind,
                x1,
                y1,
                x2,
                y2,
            })
        }
        "/text" => {
            if args.len() < 3 {
                return Err("Usage: /text x y words...".to_string());
            }
            let [x, y] = parse_coords::<2>(&args[..2], "/text x y words...")?;
            Command::Send(Message::Text {
                x,
                y,
                body: args[2..].join(" "),
            })
        }
        "/file" => {
            let path = line["/file".len()..].trim();
            if path.is_empty() {
                return Err("Usage: /file <path>".to_string());
            }
            Command::File(PathBuf::from(path))
        }
        "/to" => {
            if args.len() < 2 {
                return Err("Usage: /to <peer> <text>".to_string());
            }
            Command::To {
                peer: args[0].to_string(),
                text: args[1..].join(" "),
            }
        }
        "/who" => Command::Who,
        "/peers" => Command::Peers,
        "/help" => Command::Help,
        "/quit" | "/exit" => Command::Quit,
        other => return Err(format!("Unknown command: {}. Type /help for commands.", other)),
    };
    Ok(Some(command))
}

fn timestamp() -> String {
    Local::now().format("%H:%M:%S").to_string()
}

fn prompt() {
    print!("> ");
    let _ = io::stdout().flush();
}

/// Prints every board event with a local timestamp
#[derive(Default)]
struct TerminalHandler {
    online: Mutex<Vec<String>>,
}

impl TerminalHandler {
    fn show(&self, line: String) {
        println!("\r[{}] {}", timestamp(), line);
        prompt();
    }
}

impl SessionHandler for TerminalHandler {
    fn on_draw(&self, x1: u16, y1: u16, x2: u16, y2: u16) {
        self.show(format!("✏️  line ({}, {}) -> ({}, {})", x1, y1, x2, y2));
    }

    fn on_shape(&self, kind: ShapeKind, x1: u16, y1: u16, x2: u16, y2: u16) {
        let name = match kind {
            ShapeKind::Rect => "rectangle",
            ShapeKind::Circle => "circle",
        };
        self.show(format!("🔷 {} ({}, {}) -> ({}, {})", name, x1, y1, x2, y2));
    }

    fn on_text(&self, x: u16, y: u16, body: &str) {
        self.show(format!("🔤 text at ({}, {}): {}", x, y, body));
    }

    fn on_chat(&self, body: &str) {
        self.show(format!("💬 {}", body));
    }

    fn on_secure_chat(&self, sender: &str, text: &str) {
        self.show(format!("🔐 {}: {}", sender, text));
    }

    fn on_file(&self, file: &ReceivedFile) {
        let location = match &file.saved_to {
            Some(path) => format!(" -> {}", path.display()),
            None => String::new(),
        };
        self.show(format!(
            "📎 {} uploaded {} ({} bytes){}",
            file.uploader,
            file.filename,
            file.content.len(),
            location
        ));
    }

    fn on_user_list(&self, names: &[String]) {
        *self.online.lock() = names.to_vec();
        self.show(format!("👥 Online: {}", names.join(", ")));
    }

    fn on_notice(&self, notice: &RelayError) {
        self.show(format!("⚠️  {}", notice));
    }

    fn on_closed(&self, reason: &RelayError) {
        println!("\r[{}] 🔴 {}", timestamp(), reason);
    }
}

/// Plain or end-to-end encrypted session
enum Session {
    Plain(ClientSession),
    Secure(SecureSession),
}

impl Session {
    fn send(&self, message: &Message) -> whiteboard_relay::Result<()> {
        match self {
            Session::Plain(session) => session.send(message),
            Session::Secure(session) => session.send(message),
        }
    }

    fn disconnect(&self) {
        match self {
            Session::Plain(session) => session.disconnect(),
            Session::Secure(session) => session.disconnect(),
        }
    }

    async fn closed(&self) {
        match self {
            Session::Plain(session) => session.closed().await,
            Session::Secure(session) => session.closed().await,
        }
    }
}

/// What the input loop does after a command
#[derive(Debug, PartialEq)]
enum Flow {
    Continue,
    Quit,
}

/// Carry out one command. Errors mean the session can no longer send.
async fn run_command(
    session: &Session,
    handler: &TerminalHandler,
    username: &str,
    command: Command,
) -> whiteboard_relay::Result<Flow> {
    match command {
        Command::Send(message) => session.send(&message)?,
        Command::File(path) => match tokio::fs::read(&path).await {
            Ok(content) => {
                session.send(&Message::file(username.to_string(), &path, content))?;
                println!("📤 Sent {}", path.display());
            }
            Err(e) => println!("❌ Could not read {}: {}", path.display(), e),
        },
        Command::Who => {
            println!("👥 Online: {}", handler.online.lock().join(", "));
        }
        Command::Chat(text) => match session {
            Session::Secure(secure) => {
                if secure.send_encrypted_to_all(&text)? == 0 {
                    println!("🔐 No peers with a session key yet");
                }
            }
            Session::Plain(_) => session.send(&Message::Chat {
                body: format!("{}: {}", username, text),
            })?,
        },
        Command::To { peer, text } => match session {
            Session::Secure(secure) => {
                if let Err(e) = secure.send_encrypted(&peer, &text) {
                    println!("❌ {}", e);
                }
            }
            Session::Plain(_) => println!("/to needs --secure"),
        },
        Command::Peers => match session {
            Session::Secure(secure) => println!("🔐 Keys: {}", secure.peers().join(", ")),
            Session::Plain(_) => println!("/peers needs --secure"),
        },
        Command::Help => println!("{}", USAGE),
        Command::Quit => return Ok(Flow::Quit),
    }
    Ok(Flow::Continue)
}

fn read_password() -> Result<String> {
    print!("Session password: ");
    io::stdout().flush()?;
    let mut line = String::new();
    io::stdin().read_line(&mut line)?;
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration
    let config_found = args.config.exists();
    let mut config = if config_found {
        ClientConfig::from_file(&args.config)
            .with_context(|| format!("loading {}", args.config.display()))?
    } else {
        ClientConfig::default()
    };

    if let Some(host) = args.host {
        config.server_host = host;
    }
    if let Some(port) = args.port {
        config.port = Some(port);
    }
    if let Some(username) = args.username {
        config.username = username;
    }
    if let Some(password) = args.password {
        config.password = Some(password);
    }
    if args.secure {
        config.secure = true;
    }
    if let Some(level) = args.log_level {
        config.log_level = level;
    }

    // Initialize logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&config.log_level))
        .init();

    if !config_found {
        info!("Config file not found, using defaults");
    }

    let username = config.username.clone();
    let password = match config.password.clone() {
        Some(password) => password,
        None => read_password()?,
    };

    println!("🖍️  Whiteboard Client");
    println!("================================");
    println!("Username: {}", username);
    println!("Server: {}", config.server_addr());
    println!("Mode: {}", if config.secure { "encrypted chat" } else { "plain" });

    let handler = Arc::new(TerminalHandler::default());
    let options = SessionOptions::from_config(&config);
    if let Some(store) = &options.uploads {
        println!("Uploads: {}", store.root().display());
    }
    println!();
    let session = if config.secure {
        Session::Secure(
            SecureSession::connect(config.server_addr(), &password, &username, options, handler.clone())
                .await?,
        )
    } else {
        Session::Plain(
            ClientSession::connect(config.server_addr(), &password, &username, options, handler.clone())
                .await?,
        )
    };
    println!("✅ Connected as {}", username);
    println!();
    println!("💬 Interactive Commands:");
    println!("{}", USAGE);
    println!();
    prompt();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = session.closed() => break,
        };
        let Some(line) = line else {
            session.disconnect();
            break;
        };

        let command = match parse_command(&line) {
            Ok(Some(command)) => command,
            Ok(None) => {
                prompt();
                continue;
            }
            Err(usage) => {
                println!("{}", usage);
                prompt();
                continue;
            }
        };

        match run_command(&session, &handler, &username, command).await {
            Ok(Flow::Continue) => {}
            Ok(Flow::Quit) => {
                println!("👋 Goodbye!");
                session.disconnect();
                break;
            }
            Err(e) => {
                // The relay went away; the receive loop reports why
                println!("❌ {}", e);
                break;
            }
        }
        prompt();
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use whiteboard_relay::{RelayConfig, RelayServer};

    #[tokio::test]
    async fn test_send_after_relay_stops_ends_the_loop_without_panicking() {
        let server = RelayServer::bind(RelayConfig {
            port: 0,
            ..RelayConfig::default()
        })
        .await
        .unwrap();
        let addr = server.local_addr();
        let shutdown = server.shutdown_handle();
        let relay = tokio::spawn(server.run());

        let handler = Arc::new(TerminalHandler::default());
        let session = Session::Plain(
            ClientSession::connect(addr, "pass123", "alice", SessionOptions::default(), handler.clone())
                .await
                .unwrap(),
        );

        shutdown.shutdown();
        relay.await.unwrap().unwrap();
        tokio::time::timeout(Duration::from_secs(5), session.closed())
            .await
            .unwrap();

        // The writer may still be unwinding right after the close
        let outcome = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let command = Command::Chat("still there?".to_string());
                match run_command(&session, &handler, "alice", command).await {
                    Ok(_) => tokio::time::sleep(Duration::from_millis(20)).await,
                    Err(e) => return e,
                }
            }
        })
        .await
        .unwrap();
        assert!(matches!(outcome, RelayError::ConnectionLost(_)));
    }

    #[tokio::test]
    async fn test_quit_is_reported_to_the_loop() {
        let server = RelayServer::bind(RelayConfig {
            port: 0,
            ..RelayConfig::default()
        })
        .await
        .unwrap();
        let addr = server.local_addr();
        let shutdown = server.shutdown_handle();
        let relay = tokio::spawn(server.run());

        let handler = Arc::new(TerminalHandler::default());
        let session = Session::Plain(
            ClientSession::connect(addr, "pass123", "bob", SessionOptions::default(), handler.clone())
                .await
                .unwrap(),
        );
        assert_eq!(
            run_command(&session, &handler, "bob", Command::Quit).await.unwrap(),
            Flow::Quit
        );
        assert_eq!(
            run_command(&session, &handler, "bob", Command::Help).await.unwrap(),
            Flow::Continue
        );

        session.disconnect();
        shutdown.shutdown();
        relay.await.unwrap().unwrap();
    }

    #[test]
    fn test_parse_drawing_commands() {
        assert_eq!(
            parse_command("/draw 1 2 3 4").unwrap(),
            Some(Command::Send(Message::Draw {
                x1: 1,
                y1: 2,
                x2: 3,
                y2: 4
            }))
        );
        assert_eq!(
            parse_command("/CIRCLE 5 5 9 9").unwrap(),
            Some(Command::Send(Message::Shape {
                kind: ShapeKind::Circle,
                x1: 5,
                y1: 5,
                x2: 9,
                y2: 9
            }))
        );
        assert_eq!(
            parse_command("/text 10 20 hello  board").unwrap(),
            Some(Command::Send(Message::Text {
                x: 10,
                y: 20,
                body: "hello board".to_string()
            }))
        );
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert!(parse_command("/draw 1 2 3").is_err());
        assert!(parse_command("/rect 1 2 3 70000").is_err());
        assert!(parse_command("/to bob").is_err());
        assert!(parse_command("/frobnicate").is_err());
    }

    #[test]
    fn test_parse_chat_and_misc() {
        assert_eq!(parse_command("   ").unwrap(), None);
        assert_eq!(
            parse_command("hello there").unwrap(),
            Some(Command::Chat("hello there".to_string()))
        );
        assert_eq!(
            parse_command("/file my notes.txt").unwrap(),
            Some(Command::File(PathBuf::from("my notes.txt")))
        );
        assert_eq!(
            parse_command("/to bob meet at noon").unwrap(),
            Some(Command::To {
                peer: "bob".to_string(),
                text: "meet at noon".to_string()
            })
        );
        assert_eq!(parse_command("/quit").unwrap(), Some(Command::Quit));
    }
}
