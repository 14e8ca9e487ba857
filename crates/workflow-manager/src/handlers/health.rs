//! Health check endpoints.

use axum::{extract::State, http::StatusCode, Json};
use serde::{Deserialize, Serialize};

use crate::db::pool::health_check as db_health_check;
use crate::state::AppState;
use crate::supervisor::SupervisorStatus;

/// Liveness response.
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthCheckResponse {
    pub status: String,
}

/// Readiness response with per-component detail.
#[derive(Debug, Serialize)]
pub struct ApiHealthResponse {
    /// "ok" or "unhealthy"
    pub status: String,

    /// "connected", "disconnected" or "in_memory"
    pub database: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub nats: Option<String>,

    pub supervisor: SupervisorStatus,

    pub uptime_seconds: u64,

    pub version: String,
}

/// `GET /health`
///
/// Answers as long as the process is serving requests.
pub async fn health_check() -> Json<HealthCheckResponse> {
    Json(HealthCheckResponse {
        status: "ok".to_string(),
    })
}

/// `GET /api/health`
///
/// Returns `503 Service Unavailable` when the database does not answer or
/// the timeout supervisor has stopped.
pub async fn api_health(State(state): State<AppState>) -> (StatusCode, Json<ApiHealthResponse>) {
    let (db_healthy, database) = match &state.db {
        Some(pool) if db_health_check(pool).await => (true, "connected"),
        Some(_) => (false, "disconnected"),
        None => (true, "in_memory"),
    };

    let supervisor = state.supervisor_status();
    let healthy = db_healthy && supervisor != SupervisorStatus::Stopped;

    let status_code = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    let response = ApiHealthResponse {
        status: if healthy { "ok" } else { "unhealthy" }.to_string(),
        database: database.to_string(),
        nats: state.nats_state(),
        supervisor,
        uptime_seconds: state.uptime_seconds(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    };

    (status_code, Json(response))
}
