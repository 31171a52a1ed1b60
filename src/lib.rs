//! # Chat Relay
//!
//! Horizontally-scalable WebSocket chat relay. Clients connect to any one of
//! N stateless instances; every message sent by any client is broadcast to
//! every client on every instance, and a shared connection count is kept in
//! the bus across instances.
//!
//! ## Modules
//!
//! - [`bus`]: shared pub/sub and atomic counters (Redis or in-process)
//! - [`relay`]: sessions, the per-instance hub, the connection counter
//! - [`api`]: HTTP surface (`/health`, `/stats`, `/ws`) with Axum
//! - [`config`]: TOML + environment configuration
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use chat_relay::api::{serve, AppState};
//! use chat_relay::relay::RelayHub;
//! use chat_relay::{bus, Config};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut config = Config::from_env()?;
//!     config.bus.uri.get_or_insert_with(|| "memory://".to_string());
//!     config.validate()?;
//!
//!     let bus = bus::connect(config.bus.uri.as_deref().unwrap_or_default()).await?;
//!     let hub = RelayHub::new(bus, config.hub_config());
//!     let _pump = hub.start();
//!
//!     serve(AppState::new(hub, config.server.clone()), &config.server).await?;
//!     Ok(())
//! }
//! ```

pub mod api;
pub mod bus;
pub mod config;
pub mod relay;

pub use api::{build_router, serve, AppState, ServerError};

pub use bus::{Bus, BusError, BusMessage, FailurePolicy, MemoryBus, RedisBus};

pub use relay::{
    websocket_handler, BroadcastMessage, HubConfig, HubError, HubStats, RelayHub, SessionState,
};

pub use config::{BusConfig, Config, ConfigError, LoggingConfig, RelayConfig, ServerConfig};
