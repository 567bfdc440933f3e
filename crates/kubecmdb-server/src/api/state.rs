//! Application State
//!
//! Shared state passed to all API handlers.

use crate::observability::MetricsState;
use crate::synchronizer::Synchronizer;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub synchronizer: Arc<Synchronizer>,
    /// `None` when the Prometheus recorder could not be installed.
    pub metrics_state: Option<Arc<MetricsState>>,
}

impl AppState {
    pub fn new(synchronizer: Arc<Synchronizer>, metrics_state: Option<Arc<MetricsState>>) -> Self {
        Self {
            synchronizer,
            metrics_state,
        }
    }
}
