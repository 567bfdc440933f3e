//! EventDispatcher
//!
//! Turns one broker message into at most one CMDB write:
//!
//! ```text
//! received → routed (resourceType, event) → handled ─┬─ ok
//!                                                    ├─ err → republished (republish + 1)
//!                                                    ├─ err → dropped (ceiling reached)
//!                                                    └─ err → lost (republish failed)
//! ```
//!
//! The consumer acknowledges the delivery after `handle` returns, so the
//! republish-or-drop decision is the last thing that happens to a message on
//! this replica.

mod handlers;

use crate::cache::ClusterCache;
use crate::config::SyncSettings;
use crate::engine::ReconciliationEngine;
use crate::error::{Result, SyncError};
use crate::observability::{events, metrics};
use crate::topology::{ChannelTopology, EventMessage, MessageHandler};
use async_trait::async_trait;
use kubecmdb_core::headers::HEADER_REPUBLISH;
use kubecmdb_core::{EventHeaders, HeaderValue};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument, warn};

/// Retry limits applied by the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchPolicy {
    /// Highest `republish` value a message may be republished with.
    pub max_republish: i32,
    pub delete_attempts: u32,
    pub delete_delay: Duration,
}

impl From<&SyncSettings> for DispatchPolicy {
    fn from(settings: &SyncSettings) -> Self {
        Self {
            max_republish: settings.max_republish,
            delete_attempts: settings.delete_retry_attempts.max(1),
            delete_delay: settings.delete_retry_delay(),
        }
    }
}

impl Default for DispatchPolicy {
    fn default() -> Self {
        Self::from(&SyncSettings::default())
    }
}

/// What became of a failed message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    Republished(i32),
    Dropped,
    /// The republish itself failed; only a full sync repairs the record.
    Lost,
}

pub struct EventDispatcher {
    engine: ReconciliationEngine,
    clusters: Arc<ClusterCache>,
    topology: ChannelTopology,
    policy: DispatchPolicy,
}

impl EventDispatcher {
    pub fn new(
        engine: ReconciliationEngine,
        clusters: Arc<ClusterCache>,
        topology: ChannelTopology,
        policy: DispatchPolicy,
    ) -> Self {
        Self {
            engine,
            clusters,
            topology,
            policy,
        }
    }

    /// Republish a failed message with its counter bumped, or drop it once
    /// the counter would pass the ceiling.
    async fn retry_or_drop(
        &self,
        message: &EventMessage,
        headers: &EventHeaders,
        error: &SyncError,
    ) -> FailureOutcome {
        let kind: &'static str = headers.resource_type.into();
        let current = headers.republish_count();
        let attempt = current.saturating_add(1);
        let reason = error.to_string();

        if attempt > self.policy.max_republish {
            events::event_dropped(&headers.cluster_id, kind, &headers.resource_name, current, &reason);
            metrics::record_dropped(kind);
            return FailureOutcome::Dropped;
        }

        let mut republished = message.clone();
        republished
            .headers
            .insert(HEADER_REPUBLISH.into(), HeaderValue::Int(i64::from(attempt)));
        match self.topology.publish(&republished).await {
            Ok(()) => {
                events::event_republished(&headers.cluster_id, kind, &headers.resource_name, attempt, &reason);
                metrics::record_republished(kind);
                FailureOutcome::Republished(attempt)
            }
            Err(e) => {
                warn!(
                    cluster_id = %headers.cluster_id,
                    kind = kind,
                    name = %headers.resource_name,
                    error = %e,
                    "Republish failed, event lost"
                );
                metrics::record_dropped(kind);
                FailureOutcome::Lost
            }
        }
    }

    /// Handle a decoded message, returning what happened to it on failure.
    pub async fn process(&self, message: &EventMessage) -> Result<(), FailureOutcome> {
        let headers = match EventHeaders::from_map(&message.headers) {
            Ok(headers) => headers,
            Err(e) => {
                warn!(routing_key = %message.routing_key, error = %e, "Dropping malformed message");
                metrics::record_event("unknown", "malformed");
                return Err(FailureOutcome::Dropped);
            }
        };
        let kind: &'static str = headers.resource_type.into();

        match self.route(&headers, &message.body).await {
            Ok(()) => {
                metrics::record_event(kind, "ok");
                Ok(())
            }
            Err(e @ (SyncError::Malformed(_) | SyncError::Body(_))) => {
                warn!(
                    cluster_id = %headers.cluster_id,
                    kind = kind,
                    name = %headers.resource_name,
                    error = %e,
                    "Dropping message with undecodable body"
                );
                metrics::record_event(kind, "malformed");
                Err(FailureOutcome::Dropped)
            }
            Err(e) => {
                metrics::record_event(kind, "error");
                debug!(error_kind = e.kind(), invariant = e.is_invariant_violation(), "Handler failed");
                Err(self.retry_or_drop(message, &headers, &e).await)
            }
        }
    }
}

#[async_trait]
impl MessageHandler for EventDispatcher {
    #[instrument(skip_all, fields(routing_key = %message.routing_key))]
    async fn handle(&self, message: &EventMessage) {
        let _ = self.process(message).await;
    }
}
