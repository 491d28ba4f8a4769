//! Whiteboard Relay Server - Main Entry Point
//!
//! Password-gated TCP relay for shared whiteboard sessions.

use anyhow::{Context, Result};
use clap::Parser;
use log::info;
use std::path::PathBuf;

use whiteboard_relay::{RelayConfig, RelayServer};

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(name = "whiteboard-server")]
#[command(about = "Whiteboard Relay Server - shared drawing, chat and files")]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config/server.toml")]
    config: PathBuf,

    /// Override host to bind to
    #[arg(long)]
    host: Option<String>,

    /// Override listening port
    #[arg(short, long)]
    port: Option<u16>,

    /// Override the session password
    #[arg(long)]
    password: Option<String>,

    /// Keep a copy of every accepted upload in this directory
    #[arg(long)]
    uploads_dir: Option<PathBuf>,

    /// Log level (defaults to the config file's value)
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration
    let config_found = args.config.exists();
    let mut config = if config_found {
        RelayConfig::from_file(&args.config)
            .with_context(|| format!("loading {}", args.config.display()))?
    } else {
        RelayConfig::default()
    };

    if let Some(host) = args.host {
        config.host = host;
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(password) = args.password {
        config.password = password;
    }
    if let Some(dir) = args.uploads_dir {
        config.uploads_dir = Some(dir);
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

    let server = RelayServer::bind(config).await?;
    let shutdown = server.shutdown_handle();
    let relay = tokio::spawn(server.run());

    tokio::signal::ctrl_c().await?;
    info!("Received Ctrl-C");
    shutdown.shutdown();

    relay.await??;
    Ok(())
}
