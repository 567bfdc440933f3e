//! Synchronizer loop
//!
//! On start and then on every full-sync interval:
//!
//! 1. list the owned-cluster candidates from the registry
//! 2. read the replica count and recompute this replica's shard
//! 3. stop event workers for released clusters, start them for added ones
//! 4. start one `full-sync/<cluster>` pass per owned cluster
//!
//! A failed registry or replica lookup skips the tick and keeps the current
//! workers running.

use crate::cache::ClusterCache;
use crate::directory::{DirectoryResolver, GetShardStats, Reassign, ReplicaSource, ShardCoordinator, ShardStats};
use crate::dispatch::EventDispatcher;
use crate::engine::ReconciliationEngine;
use crate::error::SupervisorError;
use crate::observability::metrics;
use crate::supervisor::{Worker, WorkerSupervisor};
use crate::topology::ChannelTopology;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kameo::actor::ActorRef;
use kubecmdb_core::ClusterRecord;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const EVENT_POOL: &str = "events";
pub const FULL_SYNC_POOL: &str = "full-sync";

/// Consumes one cluster's queue through the dispatcher.
pub struct EventWorker {
    topology: ChannelTopology,
    dispatcher: Arc<EventDispatcher>,
}

impl EventWorker {
    pub fn new(topology: ChannelTopology, dispatcher: Arc<EventDispatcher>) -> Self {
        Self {
            topology,
            dispatcher,
        }
    }
}

#[async_trait]
impl Worker for EventWorker {
    type Param = ();

    async fn run(&self, cluster_id: &str, _param: (), cancel: CancellationToken) -> anyhow::Result<()> {
        self.topology
            .start_consumer(cluster_id, self.dispatcher.as_ref(), cancel)
            .await?;
        Ok(())
    }
}

/// Runs one full-sync pass for a cluster and exits.
pub struct FullSyncWorker {
    engine: ReconciliationEngine,
    clusters: Arc<ClusterCache>,
}

impl FullSyncWorker {
    pub fn new(engine: ReconciliationEngine, clusters: Arc<ClusterCache>) -> Self {
        Self { engine, clusters }
    }
}

#[async_trait]
impl Worker for FullSyncWorker {
    type Param = ClusterRecord;

    async fn run(&self, _id: &str, record: ClusterRecord, cancel: CancellationToken) -> anyhow::Result<()> {
        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = self.engine.sync_full(&record, Some(&self.clusters)) => {}
        }
        Ok(())
    }
}

pub fn full_sync_id(cluster_id: &str) -> String {
    format!("{FULL_SYNC_POOL}/{cluster_id}")
}

/// Snapshot served by `GET /workers`.
#[derive(Debug, Clone, Serialize)]
pub struct SyncStatus {
    pub ready: bool,
    pub last_tick: Option<DateTime<Utc>>,
    pub event_workers: Vec<String>,
    pub full_sync_workers: Vec<String>,
    pub shard: Option<ShardStats>,
}

pub struct Synchronizer {
    resolver: DirectoryResolver,
    replicas: ReplicaSource,
    coordinator: ActorRef<ShardCoordinator>,
    clusters: Arc<ClusterCache>,
    events: WorkerSupervisor<EventWorker>,
    full_sync: WorkerSupervisor<FullSyncWorker>,
    interval: Duration,
    ready: AtomicBool,
    last_tick: RwLock<Option<DateTime<Utc>>>,
}

impl Synchronizer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        resolver: DirectoryResolver,
        replicas: ReplicaSource,
        coordinator: ActorRef<ShardCoordinator>,
        clusters: Arc<ClusterCache>,
        events: WorkerSupervisor<EventWorker>,
        full_sync: WorkerSupervisor<FullSyncWorker>,
        interval: Duration,
    ) -> Self {
        Self {
            resolver,
            replicas,
            coordinator,
            clusters,
            events,
            full_sync,
            interval,
            ready: AtomicBool::new(false),
            last_tick: RwLock::new(None),
        }
    }

    /// True once the first tick has completed.
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    pub async fn status(&self) -> SyncStatus {
        SyncStatus {
            ready: self.is_ready(),
            last_tick: *self.last_tick.read().await,
            event_workers: self.events.list().await,
            full_sync_workers: self.full_sync.list().await,
            shard: self.coordinator.ask(GetShardStats).send().await.ok(),
        }
    }

    /// Tick immediately, then every interval, until cancelled.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Synchronizer loop stopping");
                    return;
                }
                _ = interval.tick() => {
                    let span = info_span!("tick", tick_id = %Uuid::new_v4());
                    self.tick().instrument(span).await;
                }
            }
        }
    }

    /// One reconciliation round of the directory against the running workers.
    pub async fn tick(&self) {
        let owned = match self.resolver.list_owned_clusters().await {
            Ok(owned) => owned,
            Err(e) => {
                warn!(error = %e, "Cluster registry unavailable, skipping tick");
                return;
            }
        };
        let replica_count = match self.replicas.count().await {
            Ok(count) => count,
            Err(e) => {
                warn!(error = %e, "Replica count unavailable, skipping tick");
                return;
            }
        };
        self.clusters.refresh_records(&owned).await;

        let delta = match self
            .coordinator
            .ask(Reassign {
                clusters: owned.iter().map(|r| r.cluster_id.clone()).collect(),
                replica_count,
            })
            .send()
            .await
        {
            Ok(delta) => delta,
            Err(e) => {
                warn!(error = %e, "Shard coordinator unavailable, skipping tick");
                return;
            }
        };

        for cluster_id in &delta.removed {
            self.events.stop(cluster_id).await;
            self.full_sync.stop(&full_sync_id(cluster_id)).await;
            self.clusters.invalidate(cluster_id).await;
        }

        let records: HashMap<&str, &ClusterRecord> =
            owned.iter().map(|r| (r.cluster_id.as_str(), r)).collect();
        for cluster_id in &delta.assigned {
            // Also revives consumers whose restart budget ran out.
            match self.events.start(cluster_id, ()).await {
                Ok(()) | Err(SupervisorError::AlreadyRunning(_)) => {}
                Err(e) => warn!(cluster_id = %cluster_id, error = %e, "Event worker not started"),
            }

            let Some(record) = records.get(cluster_id.as_str()) else {
                continue;
            };
            match self.full_sync.start(&full_sync_id(cluster_id), (*record).clone()).await {
                Ok(()) => {}
                Err(SupervisorError::AlreadyRunning(_)) => {
                    debug!(cluster_id = %cluster_id, "Previous full sync still running");
                }
                Err(e) => warn!(cluster_id = %cluster_id, error = %e, "Full sync not started"),
            }
        }

        metrics::set_owned_clusters(delta.assigned.len());
        *self.last_tick.write().await = Some(Utc::now());
        self.ready.store(true, Ordering::SeqCst);
        info!(
            owned = delta.assigned.len(),
            added = delta.added.len(),
            removed = delta.removed.len(),
            replicas = replica_count,
            "Tick finished"
        );
    }

    pub async fn shutdown(&self) {
        self.events.shutdown().await;
        self.full_sync.shutdown().await;
    }
}
