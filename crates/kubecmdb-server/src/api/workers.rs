//! Worker and shard introspection

use super::AppState;
use crate::synchronizer::SyncStatus;
use axum::{extract::State, Json};

/// GET /workers - running workers, last tick and the shard this replica owns.
#[tracing::instrument(skip(state))]
pub async fn get_workers(State(state): State<AppState>) -> Json<SyncStatus> {
    Json(state.synchronizer.status().await)
}
