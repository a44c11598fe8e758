//! Health, liveness and readiness probes.

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde_json::json;

use super::AppState;
use crate::network::HealthState;

/// Lifecycle state plus live connection counts. Always `200`; the `state`
/// field tells a draining server apart from a healthy one.
pub async fn health_handler(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "state": state.shutdown.health_state().as_str(),
        "connections": state.registry.count(),
        "open_sessions": state.shutdown.open_connections(),
        "uptime_secs": state.start_time.elapsed().as_secs(),
    }))
}

pub async fn liveness_handler() -> StatusCode {
    StatusCode::OK
}

/// `200` only while `Ready`.
pub async fn readiness_handler(State(state): State<AppState>) -> StatusCode {
    if state.shutdown.health_state() == HealthState::Ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}
