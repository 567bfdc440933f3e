//! Per-kind handlers
//!
//! Updates project the object in the message body and create or diff the
//! record found under its fingerprint. Deletes only need the headers.

use super::EventDispatcher;
use crate::cache::ResolvedCluster;
use crate::engine::project::{node_name, project_namespace, project_node, project_pod, project_workload};
use crate::engine::{find_one, resolve_pod_links, LiveLinks};
use crate::error::{Result, SyncError};
use k8s_openapi::api::core::v1::{Event, Namespace, Node, Pod};
use kube::api::DynamicObject;
use kubecmdb_core::{
    decide_delete, decide_update, CmdbNamespace, CoreError, CmdbNode, CmdbPod, CmdbRecord, CmdbWorkload,
    Collection, EventHeaders, EventKind, Fingerprint, ReconciliationDecision, ResourceKind,
    WorkloadKind,
};
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};

/// Event reason marking a crash-looping pod.
const REASON_BACKOFF: &str = "BackOff";

fn never<R>(_: &R, _: &R) -> bool {
    false
}

fn decode<T: DeserializeOwned>(body: &[u8]) -> Result<T> {
    Ok(serde_json::from_slice(body)?)
}

impl EventDispatcher {
    pub(super) async fn route(&self, headers: &EventHeaders, body: &[u8]) -> Result<()> {
        let cluster = self.clusters.get(&headers.cluster_id).await?;
        debug!(
            cluster_id = %headers.cluster_id,
            kind = %headers.resource_type,
            event = %headers.event,
            namespace = %headers.namespace,
            name = %headers.resource_name,
            republish = headers.republish_count(),
            "Routing event"
        );

        match (headers.resource_type, headers.event) {
            (ResourceKind::Event, EventKind::Update) => self.handle_event(&cluster, body).await,
            (ResourceKind::Event, EventKind::Delete) => Ok(()),
            (ResourceKind::Namespace, EventKind::Update) => self.update_namespace(&cluster, body).await,
            (ResourceKind::Node, EventKind::Update) => self.update_node(&cluster, body).await,
            (ResourceKind::Pod, EventKind::Update) => self.update_pod(&cluster, body).await,
            (kind, EventKind::Update) => match kind.as_workload() {
                Some(workload) => self.update_workload(&cluster, workload, body).await,
                None => Err(CoreError::NotAWorkload(kind.to_string()).into()),
            },
            (kind, EventKind::Delete) => self.delete(&cluster, kind, headers).await,
        }
    }

    async fn update_namespace(&self, cluster: &ResolvedCluster, body: &[u8]) -> Result<()> {
        let ns: Namespace = decode(body)?;
        let desired = project_namespace(&ns, cluster);
        self.upsert(cluster, Collection::Namespace, desired, never).await
    }

    async fn update_node(&self, cluster: &ResolvedCluster, body: &[u8]) -> Result<()> {
        let node: Node = decode(body)?;
        let desired = project_node(&node, cluster);
        self.upsert(cluster, Collection::Node, desired, never).await
    }

    async fn update_workload(
        &self,
        cluster: &ResolvedCluster,
        kind: WorkloadKind,
        body: &[u8],
    ) -> Result<()> {
        let obj: DynamicObject = decode(body)?;
        let name = obj.metadata.name.as_deref().unwrap_or_default();
        let namespace = obj.metadata.namespace.clone().unwrap_or_default();
        Fingerprint::require_namespaced(cluster.id(), kind, &namespace, name)?;
        let ns: CmdbNamespace = find_one(
            self.engine.store(),
            Collection::Namespace,
            cluster.biz_id(),
            &Fingerprint::cluster_scoped(cluster.id(), &namespace),
        )
        .await?
        .ok_or_else(|| SyncError::MissingLink {
            what: "namespace",
            key: format!("{}/{namespace}", cluster.id()),
        })?;

        let desired = project_workload(kind, &obj, cluster, ns.id);
        self.upsert(cluster, Collection::Workload(kind), desired, never).await
    }

    async fn update_pod(&self, cluster: &ResolvedCluster, body: &[u8]) -> Result<()> {
        let pod: Pod = decode(body)?;
        Fingerprint::require_namespaced(
            cluster.id(),
            ResourceKind::Pod,
            pod.metadata.namespace.as_deref().unwrap_or_default(),
            pod.metadata.name.as_deref().unwrap_or_default(),
        )?;
        if node_name(&pod).is_none() {
            debug!(cluster_id = %cluster.id(), "Pod not scheduled yet, skipping");
            return Ok(());
        }

        let links = LiveLinks {
            store: self.engine.store(),
            state: self.engine.state(),
            cluster,
        };
        let pod_links = resolve_pod_links(&pod, cluster, &links).await?;
        let desired = project_pod(&pod, cluster, pod_links);
        self.upsert(cluster, Collection::Pod, desired, |stored: &CmdbPod, live: &CmdbPod| {
            stored.identity_changed(live)
        })
        .await
    }

    /// `BackOff` events on a pod delete its record; everything else is ignored.
    async fn handle_event(&self, cluster: &ResolvedCluster, body: &[u8]) -> Result<()> {
        let event: Event = decode(body)?;
        let involved = &event.involved_object;
        if event.reason.as_deref() != Some(REASON_BACKOFF) || involved.kind.as_deref() != Some("Pod") {
            return Ok(());
        }

        let fingerprint = Fingerprint::require_namespaced(
            cluster.id(),
            ResourceKind::Pod,
            involved.namespace.as_deref().unwrap_or_default(),
            involved.name.as_deref().unwrap_or_default(),
        )?;
        info!(pod = %fingerprint, "Pod in BackOff, deleting record");
        self.delete_record::<CmdbPod>(cluster, Collection::Pod, &fingerprint)
            .await
    }

    async fn delete(
        &self,
        cluster: &ResolvedCluster,
        kind: ResourceKind,
        headers: &EventHeaders,
    ) -> Result<()> {
        let namespaced = || {
            Fingerprint::require_namespaced(cluster.id(), kind, &headers.namespace, &headers.resource_name)
        };
        let cluster_scoped = Fingerprint::cluster_scoped(cluster.id(), &headers.resource_name);
        match kind {
            ResourceKind::Pod => {
                self.delete_record::<CmdbPod>(cluster, Collection::Pod, &namespaced()?)
                    .await
            }
            ResourceKind::Namespace => {
                self.delete_record::<CmdbNamespace>(cluster, Collection::Namespace, &cluster_scoped)
                    .await
            }
            ResourceKind::Node => {
                self.delete_record::<CmdbNode>(cluster, Collection::Node, &cluster_scoped)
                    .await
            }
            ResourceKind::Event => Ok(()),
            ResourceKind::Deployment
            | ResourceKind::StatefulSet
            | ResourceKind::DaemonSet
            | ResourceKind::GameDeployment
            | ResourceKind::GameStatefulSet => {
                let workload = WorkloadKind::try_from(kind)?;
                self.delete_record::<CmdbWorkload>(cluster, Collection::Workload(workload), &namespaced()?)
                    .await
            }
        }
    }

    async fn delete_record<R: CmdbRecord>(
        &self,
        cluster: &ResolvedCluster,
        collection: Collection,
        fingerprint: &Fingerprint,
    ) -> Result<()> {
        let existing: Vec<R> = self
            .engine
            .store()
            .find(collection, cluster.biz_id(), &fingerprint.to_filter())
            .await?;
        let decision = decide_delete(fingerprint, &existing)?;
        self.apply(cluster, collection, decision).await
    }

    async fn upsert<R, F>(
        &self,
        cluster: &ResolvedCluster,
        collection: Collection,
        desired: R,
        replace: F,
    ) -> Result<()>
    where
        R: CmdbRecord,
        F: Fn(&R, &R) -> bool,
    {
        let fingerprint = desired.fingerprint();
        let existing: Vec<R> = self
            .engine
            .store()
            .find(collection, cluster.biz_id(), &fingerprint.to_filter())
            .await?;
        let decision = decide_update(&fingerprint, &existing, desired, replace)?;
        self.apply(cluster, collection, decision).await
    }

    async fn apply<R: CmdbRecord>(
        &self,
        cluster: &ResolvedCluster,
        collection: Collection,
        decision: ReconciliationDecision<R>,
    ) -> Result<()> {
        let store = self.engine.store();
        let biz_id = cluster.biz_id();
        match decision {
            ReconciliationDecision::None => Ok(()),
            ReconciliationDecision::Create(record) => {
                store.create(collection, biz_id, &[record]).await?;
                Ok(())
            }
            ReconciliationDecision::Update { id, diff } => {
                store.update(collection, biz_id, id, &diff).await?;
                Ok(())
            }
            ReconciliationDecision::Delete { id } => self.delete_with_retry(collection, biz_id, id).await,
            ReconciliationDecision::Replace { id, record } => {
                self.delete_with_retry(collection, biz_id, id).await?;
                store.create(collection, biz_id, &[record]).await?;
                Ok(())
            }
        }
    }

    /// Delete one record, retrying a few times with a fixed delay.
    async fn delete_with_retry(&self, collection: Collection, biz_id: i64, id: i64) -> Result<()> {
        let attempts = self.policy.delete_attempts;
        let mut attempt = 1;
        loop {
            match self.engine.store().delete(collection, biz_id, &[id]).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt < attempts => {
                    warn!(collection = %collection, id, attempt, error = %e, "Delete failed, retrying");
                    attempt += 1;
                    tokio::time::sleep(self.policy.delete_delay).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}
