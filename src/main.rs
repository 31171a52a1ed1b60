//! Chat Relay Server
//!
//! Run with: cargo run --bin chat-relay
//!
//! # Configuration
//!
//! Environment variables (a `.env` file is read if present):
//! - `REDIS_URI`: Bus address, `host:port`, `redis://...` or `memory://` (required)
//! - `PORT`: Port to listen on (default: 8080)
//! - `CHAT_RELAY_HOST`: Host to bind to (default: 0.0.0.0)
//! - `CHAT_RELAY_CONFIG`: Path to a TOML config file
//! - `CHAT_RELAY_LOG_FORMAT`: `pretty` or `json`
//! - `RUST_LOG`: Log filter (default: from config, `info`)

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use chat_relay::api::{serve, AppState};
use chat_relay::config::{generate_default_config, Config, LoggingConfig};
use chat_relay::relay::RelayHub;

/// How long startup waits for the first bus subscription before serving anyway
const SUBSCRIBE_WAIT: Duration = Duration::from_secs(5);

#[derive(Parser)]
#[command(name = "chat-relay")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Horizontally-scalable WebSocket chat relay")]
struct Args {
    /// Path to a TOML config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Print a default config file and exit
    #[arg(long)]
    print_config: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    if args.print_config {
        print!("{}", generate_default_config());
        return Ok(());
    }

    let config = Config::resolve(args.config.as_deref()).context("Failed to load configuration")?;
    init_tracing(&config.logging);

    tracing::info!("Starting chat relay v{}", env!("CARGO_PKG_VERSION"));
    config.validate()?;

    let uri = config.bus.uri.as_deref().unwrap_or_default();
    let bus = chat_relay::bus::connect(uri)
        .await
        .with_context(|| format!("Failed to connect to bus at {}", uri))?;

    let hub = RelayHub::new(bus, config.hub_config());
    let pump = hub.start();

    if tokio::time::timeout(SUBSCRIBE_WAIT, hub.wait_subscribed())
        .await
        .is_err()
    {
        tracing::warn!("Bus subscription not ready yet, serving anyway");
    }

    let state = AppState::new(hub, config.server.clone());
    serve(state, &config.server).await?;

    pump.await.context("Relay pump panicked")?;
    tracing::info!("Chat relay stopped");

    Ok(())
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        format!("chat_relay={},tower_http=info", logging.level).into()
    });

    let registry = tracing_subscriber::registry().with(filter);
    if logging.is_json() {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}
