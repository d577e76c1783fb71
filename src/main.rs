//! wsgate: WebSocket chat gateway
//!
//! Accepts browser WebSocket clients, assigns each a session, and hands
//! user messages to a processing pipeline. Replies addressed by session id
//! are routed back to the originating client.
//!
//! The binary wires the gateway to an in-process bus with a small echo
//! agent, which makes it usable standalone and as a protocol test target.
//!
//! Usage:
//!   wsgate                                     # 127.0.0.1:8765, everyone allowed
//!   wsgate --port 9000                         # Custom port
//!   wsgate --allow-from 127.0.0.1              # Only admit local clients
//!   wsgate --config channel.json               # Load settings from JSON

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use wsg_protocol::{InboundMessage, OutboundMessage};
use wsg_server::{ChannelConfig, MessageBus, WebSocketChannel};

#[derive(Parser, Debug)]
#[command(name = "wsgate", about = "wsgate: WebSocket chat gateway")]
struct Cli {
    /// JSON channel config file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Hostname to bind to (overrides the config file)
    #[arg(long)]
    host: Option<String>,

    /// Port to listen on, 0 for OS-assigned (overrides the config file)
    #[arg(long)]
    port: Option<u16>,

    /// Remote IP allowed to connect; repeat for several (overrides the config file)
    #[arg(long = "allow-from", value_name = "IP")]
    allow_from: Vec<String>,

    /// Enable verbose logging
    #[arg(long)]
    verbose: bool,

    /// Write logs to a file (defaults to ~/.wsgate/logs/wsgate.log if no path given)
    #[arg(long, default_missing_value = "DEFAULT", num_args = 0..=1)]
    log_file: Option<String>,
}

impl Cli {
    fn channel_config(&self) -> Result<ChannelConfig, wsg_server::ConfigError> {
        let mut config = match &self.config {
            Some(path) => ChannelConfig::from_json_file(path)?,
            None => ChannelConfig::default(),
        };
        if let Some(host) = &self.host {
            config.host = host.clone();
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if !self.allow_from.is_empty() {
            config.allow_from = self.allow_from.clone();
        }
        Ok(config)
    }
}

fn init_tracing(cli: &Cli) {
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    let Some(log_file_arg) = &cli.log_file else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
        return;
    };

    let log_path = if log_file_arg == "DEFAULT" {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".into());
        PathBuf::from(home).join(".wsgate/logs/wsgate.log")
    } else {
        PathBuf::from(log_file_arg)
    };

    if let Some(parent) = log_path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }

    let file = match std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
    {
        Ok(file) => file,
        Err(e) => {
            eprintln!("Failed to open log file {}: {e}", log_path.display());
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::sync::Mutex::new(file))
        .with_ansi(false)
        .init();

    eprintln!("Logging to {}", log_path.display());
}

/// Answers every message with its own content.
async fn run_echo_agent(
    mut inbound: mpsc::Receiver<InboundMessage>,
    replies: mpsc::Sender<OutboundMessage>,
) {
    while let Some(message) = inbound.recv().await {
        let mut reply = message.reply(message.content.clone());
        if let Some(id) = message.metadata.get("message_id").and_then(|v| v.as_str()) {
            reply = reply.with_reply_to(id);
        }
        if replies.send(reply).await.is_err() {
            break;
        }
    }
    info!("Echo agent stopped");
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(&cli);

    let config = match cli.channel_config() {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {e}");
            std::process::exit(1);
        }
    };

    let (bus, receivers) = MessageBus::default_pair();
    let agent = tokio::spawn(run_echo_agent(receivers.inbound, bus.outbound_sender()));

    let mut channel = match WebSocketChannel::new(config, Arc::new(bus)) {
        Ok(channel) => channel,
        Err(e) => {
            error!("Invalid configuration: {e}");
            std::process::exit(1);
        }
    };

    let addr = match channel.start().await {
        Ok(Some(addr)) => addr,
        Ok(None) => return,
        Err(e) => {
            error!("Failed to start WebSocket gateway: {e}");
            std::process::exit(1);
        }
    };
    let pump = channel.serve_outbound(receivers.outbound);

    println!();
    println!("  wsgate listening on ws://{addr}");
    if !channel.config().allow_from.is_empty() {
        println!("  Allowed clients: {}", channel.config().allow_from.join(", "));
    }
    println!();
    println!("  Press Ctrl+C to stop.");
    println!();

    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for Ctrl+C: {e}");
    }

    println!();
    println!("  Shutting down...");
    channel.stop().await;
    let _ = pump.await;
    agent.abort();

    println!("  Server stopped.");
}
