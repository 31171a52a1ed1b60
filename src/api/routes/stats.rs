//! Stats Route
//!
//! - GET /stats - connection counts as seen by this instance

use axum::{extract::State, Json};
use std::sync::Arc;

use crate::api::dto::StatsResponse;
use crate::api::state::AppState;

/// GET /stats
pub async fn stats(State(state): State<Arc<AppState>>) -> Json<StatsResponse> {
    let hub_stats = state.hub.stats().await;

    Json(StatsResponse {
        local_connections: hub_stats.local_connections,
        total_connections: hub_stats.total_connections,
        subscribed: state.hub.is_subscribed(),
        uptime_seconds: state.uptime_seconds(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}
