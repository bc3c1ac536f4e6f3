//! Outray CLI - expose a local service through the Outray relay
//!
//! Keeps the tunnel open with automatic reconnection until Ctrl+C.

use anyhow::{Context, Result};
use clap::Parser;
use outray_client::{TunnelClient, TunnelConfig, TunnelProtocol, DEFAULT_SERVER_URL};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    " (",
    env!("GIT_HASH"),
    ", built ",
    env!("BUILD_TIME"),
    ")"
);

/// Outray - Tunnel your local services through the Outray relay
#[derive(Parser, Debug)]
#[command(name = "outray")]
#[command(about = "Outray - Tunnel your local services through the Outray relay")]
#[command(version = VERSION)]
#[command(long_about = r#"
Open a tunnel to a local HTTP, TCP or UDP service. The client reconnects
automatically if the connection to the relay drops.

EXAMPLES:
  # Expose a local web server on port 3000
  outray http --port 3000 --subdomain myapp

  # Expose a local PostgreSQL instance
  outray tcp --port 5432

  # Expose a local DNS server
  outray udp --port 53 --remote-port 5353

ENVIRONMENT VARIABLES:
  OUTRAY_API_KEY     API key used to authenticate with the relay
  OUTRAY_SERVER_URL  Relay WebSocket URL
"#)]
struct Cli {
    /// Tunnel protocol (http, tcp, udp)
    #[arg(default_value = "http")]
    protocol: TunnelProtocol,

    /// Local port to expose
    #[arg(short, long)]
    port: Option<u16>,

    /// Host of the local service
    #[arg(long, default_value = "localhost")]
    local_host: String,

    /// API key
    #[arg(long, env = "OUTRAY_API_KEY", hide_env_values = true)]
    api_key: String,

    /// Relay WebSocket URL
    #[arg(long, env = "OUTRAY_SERVER_URL", default_value = DEFAULT_SERVER_URL)]
    server_url: String,

    /// Requested subdomain (HTTP tunnels)
    #[arg(long)]
    subdomain: Option<String>,

    /// Custom domain (HTTP tunnels)
    #[arg(long)]
    custom_domain: Option<String>,

    /// Requested public port (TCP/UDP tunnels)
    #[arg(long)]
    remote_port: Option<u16>,

    /// Take over the subdomain if another client holds it
    #[arg(long)]
    force_takeover: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

/// Setup logging; RUST_LOG takes precedence over --verbose
fn setup_logging(verbose: bool) {
    let log_level = if verbose { "debug" } else { "info" };

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();
}

fn build_config(cli: Cli) -> Result<TunnelConfig> {
    let mut builder = TunnelConfig::builder()
        .server_url(cli.server_url)
        .api_key(cli.api_key)
        .protocol(cli.protocol)
        .local_host(cli.local_host)
        .force_takeover(cli.force_takeover)
        .on_open(|url| info!("Tunnel ready: {}", url))
        .on_error(|err| warn!("Tunnel error: {}", err));

    if let Some(port) = cli.port {
        builder = builder.local_port(port);
    }
    if let Some(port) = cli.remote_port {
        builder = builder.remote_port(port);
    }
    if let Some(subdomain) = cli.subdomain {
        builder = builder.subdomain(subdomain);
    }
    if let Some(domain) = cli.custom_domain {
        builder = builder.custom_domain(domain);
    }

    builder.build().context("Invalid tunnel configuration")
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose);

    info!("Outray {} starting...", VERSION);

    let config = build_config(cli)?;
    match config.local_target() {
        Some(target) => info!("Forwarding {} traffic to {}", config.protocol, target),
        None => warn!("No local port given; HTTP requests will not be answered"),
    }

    let client = TunnelClient::new(config);
    let cancel = CancellationToken::new();

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    tokio::select! {
        _ = &mut ctrl_c => {
            info!("Received Ctrl+C, shutting down...");
            cancel.cancel();
        }
        result = client.connect(cancel.clone()) => {
            if let Err(e) = result {
                error!("Tunnel stopped: {:#}", e);
                return Err(e.into());
            }
        }
    }

    client.close().await;
    info!("Outray stopped");
    Ok(())
}
