//! Chat Relay HTTP Surface
//!
//! HTTP layer for the relay, built with Axum.
//!
//! # Endpoints
//!
//! - `GET /health` - `{"status": "ok", "port": "<port>"}`
//! - `GET /stats` - connection counts seen by this instance
//! - `GET /ws` - WebSocket upgrade; begins a chat session
//!
//! # Example
//!
//! ```rust,ignore
//! use chat_relay::api::{serve, AppState};
//! use chat_relay::relay::{HubConfig, RelayHub};
//! use chat_relay::{bus, Config};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::from_env()?;
//!     let bus = bus::connect("memory://").await?;
//!     let hub = RelayHub::new(bus, config.hub_config());
//!     hub.start();
//!
//!     serve(AppState::new(hub, config.server.clone()), &config.server).await?;
//!     Ok(())
//! }
//! ```

pub mod dto;
pub mod error;
pub mod routes;
pub mod state;

pub use error::{ServerError, ServerResult};
pub use state::AppState;

use axum::{routing::get, Router};
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::config::ServerConfig;
use crate::relay::websocket_handler;

/// Build the router with all routes and middleware
pub fn build_router(state: AppState) -> Router {
    let shared_state = Arc::new(state);

    Router::new()
        .route("/health", get(routes::health::health))
        .route("/stats", get(routes::stats::stats))
        .route("/ws", get(websocket_handler))
        .layer(TraceLayer::new_for_http())
        // Browser clients connect from any origin
        .layer(CorsLayer::permissive())
        .with_state(shared_state)
}

/// Bind the configured address and serve until Ctrl+C/SIGTERM.
///
/// On shutdown every open session is closed so its count is released
/// before the process exits.
pub async fn serve(state: AppState, config: &ServerConfig) -> ServerResult<()> {
    let addr = config.addr();
    let listener = TcpListener::bind(&addr).await?;

    tracing::info!("Chat relay listening on {}", addr);

    let hub = Arc::clone(&state.hub);
    serve_with_shutdown(listener, state, async move {
        shutdown_signal().await;
        hub.shutdown().await;
    })
    .await?;

    tracing::info!("Chat relay shut down gracefully");
    Ok(())
}

/// Serve on an already bound listener until `shutdown` completes
pub async fn serve_with_shutdown<F>(
    listener: TcpListener,
    state: AppState,
    shutdown: F,
) -> ServerResult<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let router = build_router(state);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| ServerError::Internal(format!("Server error: {}", e)))
}

/// Wait for shutdown signal
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received, starting graceful shutdown");
}
