//! HTTP API Module
//!
//! Probe and introspection endpoints:
//! - `health`: liveness and readiness probes
//! - `metrics`: Prometheus exposition
//! - `workers`: running workers and the current shard

mod health;
mod metrics;
mod state;
mod workers;

pub use state::AppState;

use axum::{routing::get, Router};

/// Create the API router with all endpoints
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health_check))
        .route("/ready", get(health::readiness_check))
        .route("/metrics", get(metrics::get_metrics))
        .route("/workers", get(workers::get_workers))
        .with_state(state)
}
