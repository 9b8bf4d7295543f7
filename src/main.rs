//! Residency proxy edge.
//!
//! Forwards every request to the configured upstream. When the upstream
//! answers with a redirect signal, the request is replayed against the
//! signalled target and the client only ever sees that target's response.
//!
//! ```text
//! client ──▶ edge ──▶ upstream ──(451 + X-Accel-Redirect)──┐
//!   ▲                                                      │
//!   └──────────── target response ◀── replay ◀─────────────┘
//! ```

use std::path::PathBuf;

use clap::Parser;
use tokio::net::TcpListener;

use residency_proxy::config::{load_config, watcher::ConfigWatcher, ProxyConfig};
use residency_proxy::lifecycle::{signals, Shutdown};
use residency_proxy::observability::{logging, metrics};
use residency_proxy::HttpServer;

#[derive(Debug, Parser)]
#[command(name = "residency-proxy", version, about = "Residency-aware reverse proxy")]
struct Cli {
    /// TOML configuration file; watched for redirect setting changes.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override `listener.bind_address`.
    #[arg(long)]
    bind: Option<String>,

    /// Override `upstream.address`.
    #[arg(long)]
    upstream: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => load_config(path)?,
        None => ProxyConfig::default(),
    };
    if let Some(bind) = cli.bind {
        config.listener.bind_address = bind;
    }
    if let Some(upstream) = cli.upstream {
        config.upstream.address = upstream;
    }

    logging::init_logging(&config.observability);
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        config = ?cli.config,
        "residency-proxy starting"
    );
    tracing::info!(
        bind_address = %config.listener.bind_address,
        upstream = %config.upstream.address,
        redirect_header = %config.redirect.header_name,
        buffer_status_range = ?config.redirect.buffer_status_range,
        "Configuration loaded"
    );

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr)?,
            Err(e) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                error = %e,
                "Failed to parse metrics address"
            ),
        }
    }

    // Keep the watcher handle alive for the lifetime of the server.
    let (_watcher, updates) = match &cli.config {
        Some(path) => {
            let (watcher, updates) = ConfigWatcher::new(path);
            (Some(watcher.run()?), Some(updates))
        }
        None => (None, None),
    };

    let listener = TcpListener::bind(&config.listener.bind_address).await?;
    tracing::info!(address = %listener.local_addr()?, "Listening for connections");

    let shutdown = Shutdown::new();
    tokio::spawn(signals::watch_signals(shutdown.clone()));

    let server = HttpServer::new(config)?;
    server.run(listener, updates, shutdown.subscribe()).await?;

    tracing::info!("Shutdown complete");
    Ok(())
}
