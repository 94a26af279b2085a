//! Broadcast Hub Server
//!
//! WebSocket fan-out server. Every message a connected peer sends is relayed
//! to all registered peers; consumers that cannot keep up are disconnected
//! instead of stalling the rest.

mod client;
mod config;
mod hub;
mod server;
mod transport;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::signal;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use config::HubConfig;
use server::{ServerConfig, WebSocketServer, DEFAULT_WS_PATH};

/// Broadcast Hub Server
///
/// Relays every message to every connected WebSocket client
#[derive(Parser, Debug)]
#[command(name = "broadcast-hub")]
#[command(version, about, long_about = None)]
struct Args {
    /// Port to listen on
    #[arg(short, long, default_value_t = 8080)]
    port: u16,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Bind address
    #[arg(long, default_value = "127.0.0.1")]
    bind: String,

    /// Path that accepts WebSocket upgrades
    #[arg(long, default_value = DEFAULT_WS_PATH)]
    path: String,

    /// Hub settings file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Outbound queue capacity per connection
    #[arg(long)]
    queue_capacity: Option<usize>,

    /// Largest inbound frame in bytes
    #[arg(long)]
    max_frame_size: Option<usize>,

    /// Seconds a silent peer is tolerated before it is dropped
    #[arg(long)]
    liveness_secs: Option<u64>,

    /// Seconds between pings (defaults to 9/10 of the liveness window)
    #[arg(long)]
    ping_secs: Option<u64>,

    /// Seconds a single outbound write may take
    #[arg(long)]
    write_wait_secs: Option<u64>,
}

impl Args {
    /// Settings file first, then command-line overrides
    ///
    /// A new liveness window re-derives the ping interval unless the file or
    /// `--ping-secs` set one explicitly.
    fn hub_config(&self) -> anyhow::Result<HubConfig> {
        let mut config = match &self.config {
            Some(path) => HubConfig::load(path)?,
            None => HubConfig::default(),
        };
        if let Some(secs) = self.liveness_secs {
            config = config.with_liveness_window(Duration::from_secs(secs));
        }
        if let Some(secs) = self.ping_secs {
            config = config.with_ping_interval(Duration::from_secs(secs));
        }
        if let Some(secs) = self.write_wait_secs {
            config = config.with_write_wait(Duration::from_secs(secs));
        }
        if let Some(capacity) = self.queue_capacity {
            config = config.with_queue_capacity(capacity);
        }
        if let Some(size) = self.max_frame_size {
            config = config.with_max_frame_size(size);
        }
        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging; RUST_LOG wins over --verbose
    let default_level = if args.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();

    info!("Broadcast Hub v{}", env!("CARGO_PKG_VERSION"));

    let hub_config = args.hub_config()?;
    info!(
        "Liveness window {:?}, ping every {:?}, write wait {:?}, queue capacity {}, max frame {} bytes",
        hub_config.liveness_window,
        hub_config.ping_interval,
        hub_config.write_wait,
        hub_config.queue_capacity,
        hub_config.max_frame_size
    );

    // Create server configuration
    let config = ServerConfig::new(args.bind, args.port).with_path(args.path);

    // Create and start the WebSocket server
    let server = Arc::new(WebSocketServer::new(config, hub_config));
    let server_handle = Arc::clone(&server);

    // Spawn shutdown signal handler
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Initiating graceful shutdown...");
        server_handle.shutdown();
    });

    // Run the server
    server.run().await?;

    info!("Server shutdown complete");
    Ok(())
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT (Ctrl+C)");
        }
        _ = terminate => {
            info!("Received SIGTERM");
        }
    }
}
