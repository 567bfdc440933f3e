//! Structured Events
//!
//! One function per lifecycle event so field names stay consistent across
//! the synchronizer.
//!
//! Event types:
//! - `cluster_assigned` / `cluster_released` - shard ownership changes
//! - `full_sync_finished` - one cluster's full sync pass completed
//! - `event_republished` / `event_dropped` - failed broker event handling
//! - `worker_started` / `worker_stopped` - supervised worker lifecycle
//! - `worker_restarting` / `worker_exhausted` - worker failure handling

use tracing::{error, info, warn};

pub fn cluster_assigned(cluster_id: &str, ordinal: usize, replicas: usize) {
    info!(
        event_type = "cluster_assigned",
        cluster_id = %cluster_id,
        ordinal = ordinal,
        replicas = replicas,
        "Cluster assigned to this replica"
    );
}

pub fn cluster_released(cluster_id: &str, ordinal: usize, replicas: usize) {
    info!(
        event_type = "cluster_released",
        cluster_id = %cluster_id,
        ordinal = ordinal,
        replicas = replicas,
        "Cluster released by this replica"
    );
}

/// Emit a full sync finished event
pub fn full_sync_finished(cluster_id: &str, failed_domains: usize, duration_ms: u64) {
    if failed_domains == 0 {
        info!(
            event_type = "full_sync_finished",
            cluster_id = %cluster_id,
            failed_domains = failed_domains,
            duration_ms = duration_ms,
            "Full sync finished"
        );
    } else {
        warn!(
            event_type = "full_sync_finished",
            cluster_id = %cluster_id,
            failed_domains = failed_domains,
            duration_ms = duration_ms,
            "Full sync finished with failed domains"
        );
    }
}

pub fn event_republished(cluster_id: &str, kind: &str, name: &str, attempt: i32, error: &str) {
    warn!(
        event_type = "event_republished",
        cluster_id = %cluster_id,
        kind = %kind,
        name = %name,
        republish = attempt,
        error = %error,
        "Event handling failed, republished"
    );
}

pub fn event_dropped(cluster_id: &str, kind: &str, name: &str, attempts: i32, error: &str) {
    error!(
        event_type = "event_dropped",
        cluster_id = %cluster_id,
        kind = %kind,
        name = %name,
        republish = attempts,
        error = %error,
        "Event dropped after reaching the republish ceiling"
    );
}

pub fn worker_started(worker_id: &str, pool: &str) {
    info!(
        event_type = "worker_started",
        worker_id = %worker_id,
        pool = %pool,
        "Worker started"
    );
}

pub fn worker_stopped(worker_id: &str, pool: &str, reason: &str) {
    info!(
        event_type = "worker_stopped",
        worker_id = %worker_id,
        pool = %pool,
        reason = %reason,
        "Worker stopped"
    );
}

/// Emit a worker restarting event
pub fn worker_restarting(worker_id: &str, error: &str, backoff_ms: u64) {
    warn!(
        event_type = "worker_restarting",
        worker_id = %worker_id,
        error = %error,
        backoff_ms = backoff_ms,
        "Worker failed, restarting"
    );
}

pub fn worker_exhausted(worker_id: &str, error: &str, restarts: usize) {
    error!(
        event_type = "worker_exhausted",
        worker_id = %worker_id,
        error = %error,
        restarts = restarts,
        "Worker restart limit reached, leaving it stopped"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_functions_dont_panic() {
        cluster_assigned("BCS-K8S-40001", 0, 2);
        cluster_released("BCS-K8S-40001", 0, 3);
        full_sync_finished("BCS-K8S-40001", 0, 1200);
        full_sync_finished("BCS-K8S-40001", 2, 1200);
        event_republished("BCS-K8S-40001", "Pod", "web-0", 1, "not found");
        event_dropped("BCS-K8S-40001", "Pod", "web-0", 11, "not found");
        worker_started("events/BCS-K8S-40001", "events");
        worker_stopped("events/BCS-K8S-40001", "events", "cancelled");
        worker_restarting("events/BCS-K8S-40001", "consumer closed", 200);
        worker_exhausted("events/BCS-K8S-40001", "consumer closed", 5);
    }
}
