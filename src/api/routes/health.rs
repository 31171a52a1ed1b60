//! Health Route
//!
//! - GET /health - `{"status": "ok", "port": "<port>"}`

use axum::{extract::State, Json};
use std::sync::Arc;

use crate::api::dto::HealthResponse;
use crate::api::state::AppState;

/// GET /health
pub async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        port: state.config.port.to_string(),
    })
}
