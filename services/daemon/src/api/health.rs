//! Health check endpoint.

use axum::{extract::State, response::IntoResponse, routing::get, Json, Router};
use chrono::Utc;
use serde::Serialize;

use crate::state::AppState;

/// Health check response.
#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct HealthResponse {
    /// Service status.
    pub status: String,

    /// Service name.
    pub service: String,

    /// Service version.
    pub version: String,

    /// Name of the cluster node answering.
    pub node: String,

    /// Current timestamp (ISO 8601).
    pub timestamp: String,
}

pub fn routes() -> Router<AppState> {
    Router::new().route("/healthz", get(healthz))
}

/// Liveness probe. Does not check the cluster store.
async fn healthz(State(state): State<AppState>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        service: "fleetd".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        node: state.node_name().to_string(),
        timestamp: Utc::now().to_rfc3339(),
    })
}
