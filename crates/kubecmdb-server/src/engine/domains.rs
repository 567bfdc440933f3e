//! Per-domain full sync
//!
//! Each domain lists the live objects and the CMDB records of one cluster,
//! plans the difference and applies it. Live objects that cannot be
//! projected (missing links, no node yet) are skipped, and their CMDB
//! records are kept out of the plan so a transient gap never deletes them.

use super::links::{resolve_pod_links, IndexedLinks};
use super::plan::plan_domain;
use super::project::{node_name, project_cluster, project_namespace, project_node, project_pod, project_workload};
use super::{DomainOutcome, ReconciliationEngine};
use crate::cache::ResolvedCluster;
use crate::error::{Result, SyncError};
use kube::ResourceExt;
use kubecmdb_core::{
    decide_update, ClusterRecord, CmdbCluster, CmdbNamespace, CmdbNode, CmdbPod, CmdbRecord,
    CmdbWorkload, Collection, Fingerprint, PropertyFilter, ReconciliationDecision, WorkloadKind,
};
use std::collections::{HashMap, HashSet};
use strum::IntoEnumIterator;
use tracing::{debug, warn};

fn never<R>(_: &R, _: &R) -> bool {
    false
}

fn cluster_scope(cluster: &ResolvedCluster) -> PropertyFilter {
    PropertyFilter::all().equal("cluster_uid", cluster.id())
}

fn without_skipped<R: CmdbRecord>(existing: Vec<R>, skipped: &HashSet<Fingerprint>) -> Vec<R> {
    if skipped.is_empty() {
        return existing;
    }
    existing
        .into_iter()
        .filter(|r| !skipped.contains(&r.fingerprint()))
        .collect()
}

impl ReconciliationEngine {
    /// Make sure the CMDB cluster record exists and is current.
    pub async fn sync_cluster(&self, record: &ClusterRecord) -> Result<ResolvedCluster> {
        let biz_id = record.biz_id();
        let desired = project_cluster(record);
        let fingerprint = desired.fingerprint();
        let existing: Vec<CmdbCluster> = self
            .store
            .find(Collection::Cluster, biz_id, &CmdbCluster::uid_filter(&record.cluster_id))
            .await?;

        let cmdb = match decide_update(&fingerprint, &existing, desired.clone(), never)? {
            ReconciliationDecision::Create(created) => {
                let ids = self.store.create(Collection::Cluster, biz_id, &[created.clone()]).await?;
                let id = ids.first().copied().ok_or_else(|| SyncError::NotFound(fingerprint.to_string()))?;
                debug!(cmdb_id = id, "Created cluster record");
                CmdbCluster { id, ..created }
            }
            ReconciliationDecision::Update { id, diff } => {
                self.store.update(Collection::Cluster, biz_id, id, &diff).await?;
                CmdbCluster { id, ..desired }
            }
            _ => existing.into_iter().next().unwrap_or(desired),
        };

        Ok(ResolvedCluster {
            record: record.clone(),
            cmdb,
        })
    }

    pub async fn sync_namespaces(&self, cluster: &ResolvedCluster) -> Result<DomainOutcome> {
        let live = self.state.namespaces(cluster.id()).await?;
        let desired = live.iter().map(|ns| project_namespace(ns, cluster)).collect();
        let existing: Vec<CmdbNamespace> = self
            .store
            .find(Collection::Namespace, cluster.biz_id(), &cluster_scope(cluster))
            .await?;

        let plan = plan_domain(existing, desired, never);
        self.apply(Collection::Namespace, cluster.biz_id(), plan).await
    }

    pub async fn sync_nodes(&self, cluster: &ResolvedCluster) -> Result<DomainOutcome> {
        let live = self.state.nodes(cluster.id()).await?;
        let desired = live.iter().map(|node| project_node(node, cluster)).collect();
        let existing: Vec<CmdbNode> = self
            .store
            .find(Collection::Node, cluster.biz_id(), &cluster_scope(cluster))
            .await?;

        let plan = plan_domain(existing, desired, never);
        self.apply(Collection::Node, cluster.biz_id(), plan).await
    }

    /// Sync all five workload kinds. A failing kind does not stop the
    /// others; the domain reports the last failure.
    pub async fn sync_workloads(&self, cluster: &ResolvedCluster) -> Result<DomainOutcome> {
        let namespaces: Vec<CmdbNamespace> = self
            .store
            .find(Collection::Namespace, cluster.biz_id(), &cluster_scope(cluster))
            .await?;
        let namespace_ids: HashMap<String, i64> =
            namespaces.into_iter().map(|ns| (ns.name, ns.id)).collect();

        let mut total = DomainOutcome::default();
        let mut failure = None;
        for kind in WorkloadKind::iter() {
            match self.sync_workload_kind(cluster, kind, &namespace_ids).await {
                Ok(outcome) => total.merge(outcome),
                Err(e) => {
                    warn!(kind = %kind, error = %e, "Workload kind sync failed");
                    failure = Some(e);
                }
            }
        }

        match failure {
            Some(e) => Err(e),
            None => Ok(total),
        }
    }

    async fn sync_workload_kind(
        &self,
        cluster: &ResolvedCluster,
        kind: WorkloadKind,
        namespace_ids: &HashMap<String, i64>,
    ) -> Result<DomainOutcome> {
        let collection = Collection::Workload(kind);
        let live = self.state.workloads(cluster.id(), kind).await?;

        let mut skipped = HashSet::new();
        let mut desired = Vec::with_capacity(live.len());
        for obj in &live {
            let namespace = obj.namespace().unwrap_or_default();
            match namespace_ids.get(&namespace) {
                Some(ns_id) => desired.push(project_workload(kind, obj, cluster, *ns_id)),
                None => {
                    debug!(kind = %kind, namespace = %namespace, name = %obj.name_any(), "Namespace record missing, skipping workload");
                    skipped.insert(Fingerprint::namespaced(cluster.id(), namespace, obj.name_any()));
                }
            }
        }

        let existing: Vec<CmdbWorkload> = self
            .store
            .find(collection, cluster.biz_id(), &cluster_scope(cluster))
            .await?;
        let plan = plan_domain(without_skipped(existing, &skipped), desired, never);
        let mut outcome = self.apply(collection, cluster.biz_id(), plan).await?;
        outcome.skipped = skipped.len();
        Ok(outcome)
    }

    pub async fn sync_pods(&self, cluster: &ResolvedCluster) -> Result<DomainOutcome> {
        let links = self.pod_link_index(cluster).await?;
        let live = self.state.pods(cluster.id()).await?;

        let mut skipped = HashSet::new();
        let mut desired = Vec::with_capacity(live.len());
        for pod in &live {
            let fingerprint = Fingerprint::namespaced(
                cluster.id(),
                pod.namespace().unwrap_or_default(),
                pod.name_any(),
            );
            if node_name(pod).is_none() {
                skipped.insert(fingerprint);
                continue;
            }
            match resolve_pod_links(pod, cluster, &links).await {
                Ok(pod_links) => desired.push(project_pod(pod, cluster, pod_links)),
                Err(e) => {
                    debug!(pod = %fingerprint, error = %e, error_kind = e.kind(), "Skipping pod");
                    skipped.insert(fingerprint);
                }
            }
        }

        let existing: Vec<CmdbPod> = self
            .store
            .find(Collection::Pod, cluster.biz_id(), &cluster_scope(cluster))
            .await?;
        let plan = plan_domain(
            without_skipped(existing, &skipped),
            desired,
            |stored: &CmdbPod, live: &CmdbPod| stored.identity_changed(live),
        );
        let mut outcome = self.apply(Collection::Pod, cluster.biz_id(), plan).await?;
        outcome.skipped = skipped.len();
        Ok(outcome)
    }

    async fn pod_link_index(&self, cluster: &ResolvedCluster) -> Result<IndexedLinks> {
        let scope = cluster_scope(cluster);
        let biz_id = cluster.biz_id();
        let namespaces: Vec<CmdbNamespace> = self.store.find(Collection::Namespace, biz_id, &scope).await?;
        let nodes: Vec<CmdbNode> = self.store.find(Collection::Node, biz_id, &scope).await?;
        let replica_sets = self.state.replica_sets(cluster.id()).await?;

        let mut links = IndexedLinks::default()
            .with_namespaces(namespaces)
            .with_nodes(nodes)
            .with_replica_sets(replica_sets);
        for kind in WorkloadKind::iter() {
            match self.store.find(Collection::Workload(kind), biz_id, &scope).await {
                Ok(records) => links.add_workloads(kind, records),
                // Pods of this kind surface as missing links and are skipped.
                Err(e) => warn!(kind = %kind, error = %e, "Workload index unavailable"),
            }
        }
        Ok(links)
    }
}

#[cfg(test)]
mod tests {
    use super::super::project::fixtures::*;
    use super::super::Domain;
    use super::*;
    use crate::cache::ClusterCache;
    use crate::clients::memory::{ClusterObjects, MemoryClusterState, MemoryCmdb, MemoryRegistry};
    use crate::clients::{ClusterStateSource, CmdbStore};
    use kubecmdb_core::attribution::CREATOR_LABEL;
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use std::time::Duration;

    const CLUSTER: &str = "BCS-K8S-40001";

    fn record() -> ClusterRecord {
        ClusterRecord {
            business_id: "7".into(),
            cluster_name: "game-prod".into(),
            creator: "carol".into(),
            ..ClusterRecord::new(CLUSTER)
        }
    }

    fn objects() -> ClusterObjects {
        ClusterObjects {
            namespaces: vec![namespace("ns-a", &[(CREATOR_LABEL, "alice")])],
            nodes: vec![node("node-1")],
            pods: vec![
                pod(
                    "ns-a",
                    "web-7d9-x1",
                    Some(owner("ReplicaSet", "web-7d9")),
                    Some("node-1"),
                    &["containerd://aaa"],
                ),
                pod("ns-a", "pending", Some(owner("ReplicaSet", "web-7d9")), None, &[]),
            ],
            workloads: BTreeMap::from([(
                WorkloadKind::Deployment,
                vec![workload(WorkloadKind::Deployment, "ns-a", "web", &[])],
            )]),
            replica_sets: vec![replica_set("ns-a", "web-7d9", "web")],
        }
    }

    async fn setup() -> (ReconciliationEngine, Arc<MemoryCmdb>, Arc<MemoryClusterState>) {
        let cmdb = Arc::new(MemoryCmdb::new());
        let state = Arc::new(MemoryClusterState::new());
        state.set_cluster(CLUSTER, objects()).await;
        let engine = ReconciliationEngine::new(
            CmdbStore::new(cmdb.clone(), 100),
            state.clone() as Arc<dyn ClusterStateSource>,
        );
        (engine, cmdb, state)
    }

    #[tokio::test]
    async fn test_full_sync_runs_stages_in_order() {
        let (engine, cmdb, _state) = setup().await;

        let report = engine.sync_full(&record(), None).await;
        assert_eq!(report.failed_domains(), 0);
        assert_eq!(
            report.order(),
            vec![
                Domain::Cluster,
                Domain::Namespaces,
                Domain::Nodes,
                Domain::Workloads,
                Domain::Pods
            ]
        );

        assert_eq!(cmdb.count(Collection::Cluster).await, 1);
        assert_eq!(cmdb.count(Collection::Namespace).await, 1);
        assert_eq!(cmdb.count(Collection::Node).await, 1);
        assert_eq!(cmdb.count(Collection::Workload(WorkloadKind::Deployment)).await, 1);
        assert_eq!(cmdb.count(Collection::Pod).await, 1);
        assert_eq!(report.outcome(Domain::Pods).map(|o| o.skipped), Some(1));

        let workload_id = cmdb.records(Collection::Workload(WorkloadKind::Deployment)).await[0]["id"]
            .as_i64()
            .unwrap();
        let pod = &cmdb.records(Collection::Pod).await[0];
        assert_eq!(pod["ref"]["kind"], "deployment");
        assert_eq!(pod["ref"]["id"].as_i64(), Some(workload_id));
        assert_eq!(pod["operator"], serde_json::json!(["alice"]));
    }

    #[tokio::test]
    async fn test_second_pass_writes_nothing() {
        let (engine, cmdb, _state) = setup().await;
        engine.sync_full(&record(), None).await;
        let writes = cmdb.write_count();

        let report = engine.sync_full(&record(), None).await;
        assert_eq!(report.failed_domains(), 0);
        assert_eq!(cmdb.write_count(), writes);
    }

    #[tokio::test]
    async fn test_recreated_pod_is_replaced() {
        let (engine, cmdb, state) = setup().await;
        engine.sync_full(&record(), None).await;
        let old_id = cmdb.records(Collection::Pod).await[0]["id"].as_i64();

        state
            .update_cluster(CLUSTER, |objects| {
                objects.pods = vec![pod(
                    "ns-a",
                    "web-7d9-x1",
                    Some(owner("ReplicaSet", "web-7d9")),
                    Some("node-1"),
                    &["containerd://bbb"],
                )];
            })
            .await;
        let report = engine.sync_full(&record(), None).await;

        let outcome = report.outcome(Domain::Pods).copied().unwrap();
        assert_eq!((outcome.created, outcome.deleted), (1, 1));
        let pods = cmdb.records(Collection::Pod).await;
        assert_eq!(pods.len(), 1);
        assert_ne!(pods[0]["id"].as_i64(), old_id);
        assert_eq!(pods[0]["containers"][0]["container_uid"], "containerd://bbb");
    }

    #[tokio::test]
    async fn test_removed_objects_are_deleted() {
        let (engine, cmdb, state) = setup().await;
        engine.sync_full(&record(), None).await;

        state
            .update_cluster(CLUSTER, |objects| {
                objects.nodes.clear();
                objects.pods.clear();
            })
            .await;
        engine.sync_full(&record(), None).await;

        assert_eq!(cmdb.count(Collection::Node).await, 0);
        assert_eq!(cmdb.count(Collection::Pod).await, 0);
        assert_eq!(cmdb.count(Collection::Namespace).await, 1);
    }

    #[tokio::test]
    async fn test_pod_with_missing_link_keeps_its_record() {
        let (engine, cmdb, state) = setup().await;
        engine.sync_full(&record(), None).await;

        // ReplicaSet gone from the listing while the pod still runs.
        state
            .update_cluster(CLUSTER, |objects| objects.replica_sets.clear())
            .await;
        let report = engine.sync_full(&record(), None).await;

        assert_eq!(report.outcome(Domain::Pods).map(|o| o.deleted), Some(0));
        assert_eq!(cmdb.count(Collection::Pod).await, 1);
    }

    #[tokio::test]
    async fn test_failed_domain_does_not_stop_later_stages() {
        let (engine, cmdb, _state) = setup().await;
        cmdb.fail_collection(Collection::Workload(WorkloadKind::StatefulSet), true)
            .await;

        let report = engine.sync_full(&record(), None).await;
        assert_eq!(report.failed_domains(), 1);
        assert!(report
            .domains
            .iter()
            .any(|(d, r)| *d == Domain::Workloads && r.is_err()));
        // Deployments still synced, so the pod links up.
        assert_eq!(cmdb.count(Collection::Workload(WorkloadKind::Deployment)).await, 1);
        assert_eq!(cmdb.count(Collection::Pod).await, 1);
    }

    #[tokio::test]
    async fn test_cluster_failure_aborts_pass() {
        let (engine, cmdb, _state) = setup().await;
        cmdb.fail_collection(Collection::Cluster, true).await;

        let report = engine.sync_full(&record(), None).await;
        assert_eq!(report.order(), vec![Domain::Cluster]);
        assert_eq!(report.failed_domains(), 1);
        assert_eq!(cmdb.count(Collection::Namespace).await, 0);
    }

    #[tokio::test]
    async fn test_cluster_record_is_updated_and_cached() {
        let (engine, cmdb, _state) = setup().await;
        engine.sync_full(&record(), None).await;

        let renamed = ClusterRecord {
            cluster_name: "game-prod-2".into(),
            ..record()
        };
        let cache = ClusterCache::new(
            Arc::new(MemoryRegistry::new(vec![renamed.clone()])),
            engine.store().clone(),
            Duration::from_secs(60),
        );
        engine.sync_full(&renamed, Some(&cache)).await;

        let clusters = cmdb.records(Collection::Cluster).await;
        assert_eq!(clusters.len(), 1);
        assert_eq!(clusters[0]["name"], "game-prod-2");
        let cached = cache.get(CLUSTER).await.unwrap();
        assert_eq!(cached.cmdb.name, "game-prod-2");
        assert_eq!(Some(cached.cmdb_id()), clusters[0]["id"].as_i64());
    }
}
