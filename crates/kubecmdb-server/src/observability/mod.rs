//! Observability Module
//!
//! - `metrics`: Prometheus metrics for ownership, workers, full syncs and events
//! - `events`: Structured lifecycle events with consistent fields
//! - `tracing`: Log subscriber and optional OTLP trace export
//! - `supervision`: Restart policies and tracking for supervised workers

pub mod events;
pub mod metrics;
pub mod supervision;
pub mod tracing;

pub use metrics::{init_metrics, MetricsState};
pub use supervision::{RestartPolicy, RestartTracker};
pub use tracing::{init_tracing, shutdown_tracing, TracingConfig};
