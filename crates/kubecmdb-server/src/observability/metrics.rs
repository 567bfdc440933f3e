//! Prometheus Metrics
//!
//! Metrics tracked:
//! - `kubecmdb_owned_clusters` - gauge of clusters assigned to this replica
//! - `kubecmdb_workers` - gauge of running workers by pool
//! - `kubecmdb_full_sync_duration_seconds` - histogram of domain sync times
//! - `kubecmdb_domain_sync_total` - counter of domain syncs by outcome
//! - `kubecmdb_records_written_total` - counter of CMDB writes by collection and op
//! - `kubecmdb_events_total` - counter of handled broker events by kind and outcome
//! - `kubecmdb_events_republished_total` - counter of republished events
//! - `kubecmdb_events_dropped_total` - counter of events dropped at the republish ceiling

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use std::time::Duration;

/// Handle used by the `/metrics` endpoint to render the registry.
#[derive(Clone)]
pub struct MetricsState {
    pub prometheus_handle: PrometheusHandle,
}

/// Install the global Prometheus recorder and describe all metrics.
pub fn init_metrics() -> Result<MetricsState, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    describe_metrics();
    Ok(MetricsState {
        prometheus_handle: handle,
    })
}

fn describe_metrics() {
    describe_gauge!(
        "kubecmdb_owned_clusters",
        "Number of clusters assigned to this replica"
    );
    describe_gauge!("kubecmdb_workers", "Number of running workers by pool");

    describe_histogram!(
        "kubecmdb_full_sync_duration_seconds",
        "Duration of one resource domain full sync in seconds"
    );
    describe_counter!(
        "kubecmdb_domain_sync_total",
        "Total number of resource domain syncs by outcome"
    );
    describe_counter!(
        "kubecmdb_records_written_total",
        "Total number of CMDB records written"
    );

    describe_counter!(
        "kubecmdb_events_total",
        "Total number of broker events handled"
    );
    describe_counter!(
        "kubecmdb_events_republished_total",
        "Total number of events republished after a handler error"
    );
    describe_counter!(
        "kubecmdb_events_dropped_total",
        "Total number of events dropped at the republish ceiling"
    );
}

pub fn set_owned_clusters(count: usize) {
    gauge!("kubecmdb_owned_clusters").set(count as f64);
}

pub fn set_workers(pool: &str, count: usize) {
    gauge!("kubecmdb_workers", "pool" => pool.to_string()).set(count as f64);
}

/// Record one domain sync and how long it took
pub fn record_domain_sync(domain: &str, outcome: &str, duration: Duration) {
    histogram!(
        "kubecmdb_full_sync_duration_seconds",
        "domain" => domain.to_string()
    )
    .record(duration.as_secs_f64());
    counter!(
        "kubecmdb_domain_sync_total",
        "domain" => domain.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

pub fn record_writes(collection: &str, op: &str, count: usize) {
    counter!(
        "kubecmdb_records_written_total",
        "collection" => collection.to_string(),
        "op" => op.to_string()
    )
    .increment(count as u64);
}

pub fn record_event(kind: &str, outcome: &str) {
    counter!(
        "kubecmdb_events_total",
        "kind" => kind.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

pub fn record_republished(kind: &str) {
    counter!("kubecmdb_events_republished_total", "kind" => kind.to_string()).increment(1);
}

pub fn record_dropped(kind: &str) {
    counter!("kubecmdb_events_dropped_total", "kind" => kind.to_string()).increment(1);
}
