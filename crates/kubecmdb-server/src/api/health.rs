//! Health Check Endpoints
//!
//! Liveness and readiness probe handlers for Kubernetes.

use super::state::AppState;
use axum::{extract::State, http::StatusCode};

/// Liveness probe; the process answering is enough.
#[tracing::instrument(skip_all)]
pub async fn health_check() -> &'static str {
    "OK"
}

/// Readiness probe endpoint. Returns OK once the first tick has assigned clusters.
#[tracing::instrument(skip(state))]
pub async fn readiness_check(State(state): State<AppState>) -> Result<&'static str, StatusCode> {
    if state.synchronizer.is_ready() {
        Ok("READY")
    } else {
        Err(StatusCode::SERVICE_UNAVAILABLE)
    }
}
