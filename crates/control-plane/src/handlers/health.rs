//! Health check endpoints.

use std::collections::HashMap;

use axum::{extract::State, http::StatusCode, Json};
use serde::{Deserialize, Serialize};

use crate::state::AppState;

/// Health check response.
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthCheckResponse {
    /// Health status ("ok" or "unhealthy")
    pub status: String,
}

/// Detailed health check response for the API.
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiHealthResponse {
    /// Overall health status
    pub status: String,

    /// Archive backend and its connectivity
    #[serde(skip_serializing_if = "Option::is_none")]
    pub archive: Option<String>,

    /// NATS status
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nats: Option<String>,

    /// Compute launcher in use
    pub launcher: String,

    /// In-memory runs per state
    pub runs: HashMap<String, usize>,

    /// Server uptime in seconds
    pub uptime_seconds: u64,

    /// Server version
    pub version: String,
}

/// Basic health check endpoint.
///
/// `GET /health`
pub async fn health_check() -> Json<HealthCheckResponse> {
    Json(HealthCheckResponse {
        status: "ok".to_string(),
    })
}

/// Detailed API health check endpoint.
///
/// `GET /api/health`
///
/// Returns `503 Service Unavailable` when the archive cannot be reached.
pub async fn api_health(State(state): State<AppState>) -> (StatusCode, Json<ApiHealthResponse>) {
    let archive = match state.coordinator.archive() {
        Some(archive) => {
            let healthy = archive.healthy().await;
            Some((archive.kind(), healthy))
        }
        None => None,
    };
    let healthy = archive.map_or(true, |(_, healthy)| healthy);

    let runs = state
        .coordinator
        .state_counts()
        .await
        .into_iter()
        .map(|(state, count)| (state.to_string(), count))
        .collect();

    let response = ApiHealthResponse {
        status: if healthy { "ok" } else { "unhealthy" }.to_string(),
        archive: Some(match archive {
            Some((kind, true)) => format!("{kind}: connected"),
            Some((kind, false)) => format!("{kind}: disconnected"),
            None => "not_configured".to_string(),
        }),
        nats: Some(if state.has_nats() {
            "connected".to_string()
        } else {
            "not_configured".to_string()
        }),
        launcher: state.coordinator.launcher_kind().to_string(),
        runs,
        uptime_seconds: state.uptime_seconds(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    };

    let status_code = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status_code, Json(response))
}
