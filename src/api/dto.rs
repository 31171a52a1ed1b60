//! Response types for the HTTP endpoints

use serde::Serialize;

/// `GET /health` body: `{"status": "ok", "port": "8080"}`
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub port: String,
}

/// `GET /stats` body
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsResponse {
    /// Sessions open on this instance
    pub local_connections: usize,
    /// Last known total across all instances
    pub total_connections: i64,
    /// Whether the relay holds a live bus subscription
    pub subscribed: bool,
    pub uptime_seconds: u64,
    pub version: String,
}
