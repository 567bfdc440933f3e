//! ReconciliationEngine
//!
//! Full, idempotent resync of one cluster. Domains run as an explicit stage
//! pipeline so that the records pods and workloads link to already exist:
//!
//! ```text
//! cluster record
//!        ↓
//! namespaces ║ nodes        (concurrently)
//!        ↓
//! workloads (all five kinds)
//!        ↓
//! pods
//! ```
//!
//! A failed domain is logged and counted; later stages still run and the
//! next tick retries. Only a failed cluster record stops the pass, since
//! every child record links to its ID.

mod domains;
pub mod links;
pub mod plan;
pub mod project;

pub use links::{find_one, resolve_pod_links, IndexedLinks, LinkSource, LiveLinks};
pub use plan::{plan_domain, DomainPlan};

use crate::cache::{ClusterCache, ResolvedCluster};
use crate::clients::{ClusterStateSource, CmdbStore};
use crate::error::Result;
use crate::observability::{events, metrics};
use futures::future::join_all;
use kubecmdb_core::{ClusterRecord, CmdbRecord, Collection};
use std::sync::Arc;
use std::time::Instant;
use strum::{Display, IntoStaticStr};
use tracing::{instrument, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum Domain {
    Cluster,
    Namespaces,
    Nodes,
    Workloads,
    Pods,
}

/// Stages after the cluster record; domains in one stage run concurrently.
pub const STAGES: [&[Domain]; 3] = [
    &[Domain::Namespaces, Domain::Nodes],
    &[Domain::Workloads],
    &[Domain::Pods],
];

/// Writes performed by one domain sync.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DomainOutcome {
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
    /// Fingerprints matched by several records and left alone.
    pub conflicts: usize,
    /// Live objects not written, e.g. unscheduled pods or missing links.
    pub skipped: usize,
}

impl DomainOutcome {
    pub fn writes(&self) -> usize {
        self.created + self.updated + self.deleted
    }

    fn merge(&mut self, other: DomainOutcome) {
        self.created += other.created;
        self.updated += other.updated;
        self.deleted += other.deleted;
        self.conflicts += other.conflicts;
        self.skipped += other.skipped;
    }
}

/// Result of one cluster's full sync, in execution order.
#[derive(Debug, Default)]
pub struct SyncReport {
    pub cluster_id: String,
    pub domains: Vec<(Domain, Result<DomainOutcome>)>,
}

impl SyncReport {
    pub fn failed_domains(&self) -> usize {
        self.domains.iter().filter(|(_, r)| r.is_err()).count()
    }

    pub fn order(&self) -> Vec<Domain> {
        self.domains.iter().map(|(d, _)| *d).collect()
    }

    pub fn outcome(&self, domain: Domain) -> Option<&DomainOutcome> {
        self.domains
            .iter()
            .find(|(d, _)| *d == domain)
            .and_then(|(_, r)| r.as_ref().ok())
    }
}

#[derive(Clone)]
pub struct ReconciliationEngine {
    store: CmdbStore,
    state: Arc<dyn ClusterStateSource>,
}

impl ReconciliationEngine {
    pub fn new(store: CmdbStore, state: Arc<dyn ClusterStateSource>) -> Self {
        Self { store, state }
    }

    pub fn store(&self) -> &CmdbStore {
        &self.store
    }

    pub fn state(&self) -> &Arc<dyn ClusterStateSource> {
        &self.state
    }

    /// Run every domain for one cluster.
    #[instrument(skip_all, fields(cluster_id = %record.cluster_id))]
    pub async fn sync_full(&self, record: &ClusterRecord, cache: Option<&ClusterCache>) -> SyncReport {
        let started = Instant::now();
        let mut report = SyncReport {
            cluster_id: record.cluster_id.clone(),
            domains: Vec::new(),
        };

        let cluster_started = Instant::now();
        let cluster = match self.sync_cluster(record).await {
            Ok(cluster) => {
                record_domain(Domain::Cluster, true, cluster_started);
                report.domains.push((Domain::Cluster, Ok(DomainOutcome::default())));
                cluster
            }
            Err(e) => {
                record_domain(Domain::Cluster, false, cluster_started);
                warn!(error = %e, "Cluster record sync failed, skipping remaining domains");
                report.domains.push((Domain::Cluster, Err(e)));
                events::full_sync_finished(&record.cluster_id, 1, elapsed_ms(started));
                return report;
            }
        };
        if let Some(cache) = cache {
            cache.insert(cluster.clone()).await;
        }

        for stage in STAGES {
            let results = join_all(stage.iter().map(|domain| self.run_domain(*domain, &cluster))).await;
            for (domain, result) in stage.iter().zip(results) {
                if let Err(e) = &result {
                    warn!(domain = %domain, error = %e, error_kind = e.kind(), "Domain sync failed");
                }
                report.domains.push((*domain, result));
            }
        }

        events::full_sync_finished(&record.cluster_id, report.failed_domains(), elapsed_ms(started));
        report
    }

    async fn run_domain(&self, domain: Domain, cluster: &ResolvedCluster) -> Result<DomainOutcome> {
        let started = Instant::now();
        let result = match domain {
            Domain::Cluster => Ok(DomainOutcome::default()),
            Domain::Namespaces => self.sync_namespaces(cluster).await,
            Domain::Nodes => self.sync_nodes(cluster).await,
            Domain::Workloads => self.sync_workloads(cluster).await,
            Domain::Pods => self.sync_pods(cluster).await,
        };
        record_domain(domain, result.is_ok(), started);
        result
    }

    /// Apply a plan: stale and replaced records go first, then creates and
    /// updates.
    async fn apply<R: CmdbRecord>(
        &self,
        collection: Collection,
        biz_id: i64,
        plan: DomainPlan<R>,
    ) -> Result<DomainOutcome> {
        for conflict in &plan.conflicts {
            warn!(collection = %collection, error = %conflict, "Skipping conflicting records");
        }
        let outcome = DomainOutcome {
            created: plan.creates.len(),
            updated: plan.updates.len(),
            deleted: plan.deletes.len(),
            conflicts: plan.conflicts.len(),
            skipped: 0,
        };

        self.store.delete(collection, biz_id, &plan.deletes).await?;
        self.store.create(collection, biz_id, &plan.creates).await?;
        for (id, diff) in &plan.updates {
            self.store.update(collection, biz_id, *id, diff).await?;
        }
        Ok(outcome)
    }
}

fn record_domain(domain: Domain, ok: bool, started: Instant) {
    let outcome = if ok { "ok" } else { "error" };
    metrics::record_domain_sync(domain.into(), outcome, started.elapsed());
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

