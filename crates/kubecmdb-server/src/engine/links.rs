//! Resolution of the CMDB records a pod record links to
//!
//! A pod record points at its namespace, node and workload records and
//! carries an operator attribution. The full sync resolves these from
//! indexes built once per pass; the event path looks each one up on demand.
//! Both go through `resolve_pod_links`.

use super::project::{node_name, pod_owner, replica_set_owner, OwnerLink, PodLinks};
use crate::cache::ResolvedCluster;
use crate::clients::{ClusterStateSource, CmdbStore};
use crate::error::{Result, SyncError};
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::ReplicaSet;
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use kubecmdb_core::attribution::resolve_operator;
use kubecmdb_core::{
    CmdbNamespace, CmdbNode, CmdbRecord, CmdbWorkload, Collection, Fingerprint, WorkloadKind,
    WorkloadRef,
};
use std::collections::HashMap;
use std::sync::Arc;

#[async_trait]
pub trait LinkSource: Send + Sync {
    async fn namespace(&self, name: &str) -> Result<Option<CmdbNamespace>>;

    async fn node_id(&self, name: &str) -> Result<Option<i64>>;

    async fn workload(
        &self,
        kind: WorkloadKind,
        namespace: &str,
        name: &str,
    ) -> Result<Option<CmdbWorkload>>;

    async fn replica_set(&self, namespace: &str, name: &str) -> Result<Option<ReplicaSet>>;
}

fn missing(what: &'static str, key: String) -> SyncError {
    SyncError::MissingLink { what, key }
}

/// Resolve every link of a scheduled pod.
pub async fn resolve_pod_links(
    pod: &Pod,
    cluster: &ResolvedCluster,
    links: &dyn LinkSource,
) -> Result<PodLinks> {
    let namespace = pod.namespace().unwrap_or_default();
    let ns = links
        .namespace(&namespace)
        .await?
        .ok_or_else(|| missing("namespace", format!("{}/{namespace}", cluster.id())))?;

    let node = node_name(pod).unwrap_or_default();
    let node_id = links
        .node_id(node)
        .await?
        .ok_or_else(|| missing("node", format!("{}/{node}", cluster.id())))?;

    let owner = match pod_owner(pod)? {
        OwnerLink::Standalone => None,
        OwnerLink::Workload(kind, name) => Some((kind, name)),
        OwnerLink::ReplicaSet(rs_name) => {
            let rs = links
                .replica_set(&namespace, &rs_name)
                .await?
                .ok_or_else(|| missing("replicaset", format!("{namespace}/{rs_name}")))?;
            Some((WorkloadKind::Deployment, replica_set_owner(&rs)?))
        }
    };

    let workload = match &owner {
        Some((kind, name)) => Some(links.workload(*kind, &namespace, name).await?.ok_or_else(
            || missing("workload", format!("{}/{namespace}/{kind}/{name}", cluster.id())),
        )?),
        None => None,
    };

    let operator = resolve_operator(
        workload.as_ref().map(|w| &w.labels),
        Some(&ns.labels),
        &cluster.record,
    );
    let workload_ref = match (owner, &workload) {
        (Some((kind, name)), Some(record)) => WorkloadRef {
            kind: kind.ref_kind().to_string(),
            name,
            id: record.id,
        },
        _ => WorkloadRef::default(),
    };

    Ok(PodLinks {
        namespace_id: ns.id,
        node_id,
        workload: workload_ref,
        operator,
    })
}

/// Links indexed up front for a whole full-sync pass.
#[derive(Debug, Default)]
pub struct IndexedLinks {
    pub namespaces: HashMap<String, CmdbNamespace>,
    pub nodes: HashMap<String, i64>,
    pub workloads: HashMap<(WorkloadKind, String, String), CmdbWorkload>,
    pub replica_sets: HashMap<(String, String), ReplicaSet>,
}

impl IndexedLinks {
    pub fn with_namespaces(mut self, records: Vec<CmdbNamespace>) -> Self {
        self.namespaces = records.into_iter().map(|r| (r.name.clone(), r)).collect();
        self
    }

    pub fn with_nodes(mut self, records: Vec<CmdbNode>) -> Self {
        self.nodes = records.into_iter().map(|r| (r.name, r.id)).collect();
        self
    }

    pub fn add_workloads(&mut self, kind: WorkloadKind, records: Vec<CmdbWorkload>) {
        self.workloads.extend(
            records
                .into_iter()
                .map(|r| ((kind, r.namespace.clone(), r.name.clone()), r)),
        );
    }

    pub fn with_replica_sets(mut self, sets: Vec<ReplicaSet>) -> Self {
        self.replica_sets = sets
            .into_iter()
            .map(|rs| ((rs.namespace().unwrap_or_default(), rs.name_any()), rs))
            .collect();
        self
    }
}

#[async_trait]
impl LinkSource for IndexedLinks {
    async fn namespace(&self, name: &str) -> Result<Option<CmdbNamespace>> {
        Ok(self.namespaces.get(name).cloned())
    }

    async fn node_id(&self, name: &str) -> Result<Option<i64>> {
        Ok(self.nodes.get(name).copied())
    }

    async fn workload(
        &self,
        kind: WorkloadKind,
        namespace: &str,
        name: &str,
    ) -> Result<Option<CmdbWorkload>> {
        Ok(self
            .workloads
            .get(&(kind, namespace.to_string(), name.to_string()))
            .cloned())
    }

    async fn replica_set(&self, namespace: &str, name: &str) -> Result<Option<ReplicaSet>> {
        Ok(self
            .replica_sets
            .get(&(namespace.to_string(), name.to_string()))
            .cloned())
    }
}

/// Links looked up one at a time, for single events.
pub struct LiveLinks<'a> {
    pub store: &'a CmdbStore,
    pub state: &'a Arc<dyn ClusterStateSource>,
    pub cluster: &'a ResolvedCluster,
}

impl LiveLinks<'_> {
    async fn one<R: CmdbRecord>(&self, collection: Collection, fp: Fingerprint) -> Result<Option<R>> {
        find_one(self.store, collection, self.cluster.biz_id(), &fp).await
    }
}

/// The single record matching `fp`, if any; several is an invariant violation.
pub async fn find_one<R: CmdbRecord>(
    store: &CmdbStore,
    collection: Collection,
    biz_id: i64,
    fp: &Fingerprint,
) -> Result<Option<R>> {
    let mut found: Vec<R> = store.find(collection, biz_id, &fp.to_filter()).await?;
    match found.len() {
        0 => Ok(None),
        1 => Ok(found.pop()),
        count => Err(SyncError::Duplicate {
            fingerprint: fp.to_string(),
            count,
        }),
    }
}

#[async_trait]
impl LinkSource for LiveLinks<'_> {
    async fn namespace(&self, name: &str) -> Result<Option<CmdbNamespace>> {
        self.one(
            Collection::Namespace,
            Fingerprint::cluster_scoped(self.cluster.id(), name),
        )
        .await
    }

    async fn node_id(&self, name: &str) -> Result<Option<i64>> {
        let node: Option<CmdbNode> = self
            .one(
                Collection::Node,
                Fingerprint::cluster_scoped(self.cluster.id(), name),
            )
            .await?;
        Ok(node.map(|n| n.id))
    }

    async fn workload(
        &self,
        kind: WorkloadKind,
        namespace: &str,
        name: &str,
    ) -> Result<Option<CmdbWorkload>> {
        self.one(
            Collection::Workload(kind),
            Fingerprint::namespaced(self.cluster.id(), namespace, name),
        )
        .await
    }

    async fn replica_set(&self, namespace: &str, name: &str) -> Result<Option<ReplicaSet>> {
        Ok(self
            .state
            .replica_set(self.cluster.id(), namespace, name)
            .await?)
    }
}

#[cfg(test)]
mod tests {
    use super::super::project::fixtures::*;
    use super::*;
    use kubecmdb_core::attribution::CREATOR_LABEL;
    use kubecmdb_core::{ClusterRecord, CmdbCluster, Labels};

    fn cluster_with_creator(creator: &str) -> ResolvedCluster {
        ResolvedCluster {
            record: ClusterRecord {
                creator: creator.into(),
                ..ClusterRecord::new("BCS-K8S-40001")
            },
            cmdb: CmdbCluster {
                id: 1,
                uid: "BCS-K8S-40001".into(),
                ..CmdbCluster::default()
            },
        }
    }

    fn indexed(ns_labels: &[(&str, &str)], workload_labels: &[(&str, &str)]) -> IndexedLinks {
        let labels = |pairs: &[(&str, &str)]| -> Labels {
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect()
        };
        let mut links = IndexedLinks::default()
            .with_namespaces(vec![CmdbNamespace {
                id: 10,
                cluster_uid: "BCS-K8S-40001".into(),
                name: "ns-a".into(),
                labels: labels(ns_labels),
                ..CmdbNamespace::default()
            }])
            .with_nodes(vec![CmdbNode {
                id: 20,
                cluster_uid: "BCS-K8S-40001".into(),
                name: "node-1".into(),
                ..CmdbNode::default()
            }])
            .with_replica_sets(vec![replica_set("ns-a", "web-7d9", "web")]);
        links.add_workloads(
            WorkloadKind::Deployment,
            vec![CmdbWorkload {
                id: 30,
                cluster_uid: "BCS-K8S-40001".into(),
                namespace: "ns-a".into(),
                name: "web".into(),
                labels: labels(workload_labels),
                ..CmdbWorkload::default()
            }],
        );
        links
    }

    #[tokio::test]
    async fn test_replica_set_hop_and_namespace_operator() {
        let links = indexed(&[(CREATOR_LABEL, "alice")], &[]);
        let pod = pod(
            "ns-a",
            "web-7d9-x1",
            Some(owner("ReplicaSet", "web-7d9")),
            Some("node-1"),
            &["containerd://aaa"],
        );

        let linked = resolve_pod_links(&pod, &cluster_with_creator("carol"), &links)
            .await
            .unwrap();
        assert_eq!(linked.namespace_id, 10);
        assert_eq!(linked.node_id, 20);
        assert_eq!(linked.workload.kind, "deployment");
        assert_eq!(linked.workload.name, "web");
        assert_eq!(linked.workload.id, 30);
        assert_eq!(linked.operator, vec!["alice".to_string()]);
    }

    #[tokio::test]
    async fn test_operator_falls_back_to_cluster_creator() {
        let links = indexed(&[], &[]);
        let pod = pod("ns-a", "web-7d9-x1", Some(owner("ReplicaSet", "web-7d9")), Some("node-1"), &[]);

        let linked = resolve_pod_links(&pod, &cluster_with_creator("carol"), &links)
            .await
            .unwrap();
        assert_eq!(linked.operator, vec!["carol".to_string()]);

        let links = indexed(&[], &[]);
        let resolved_none = resolve_pod_links(&pod, &cluster_with_creator(""), &links)
            .await
            .unwrap();
        assert!(resolved_none.operator.is_empty());
    }

    #[tokio::test]
    async fn test_missing_links() {
        let links = indexed(&[], &[]);

        let on_unknown_node = pod("ns-a", "p", None, Some("node-9"), &[]);
        assert!(matches!(
            resolve_pod_links(&on_unknown_node, &cluster_with_creator(""), &links).await,
            Err(SyncError::MissingLink { what: "node", .. })
        ));

        let unknown_rs = pod("ns-a", "p", Some(owner("ReplicaSet", "nope")), Some("node-1"), &[]);
        assert!(matches!(
            resolve_pod_links(&unknown_rs, &cluster_with_creator(""), &links).await,
            Err(SyncError::MissingLink { what: "replicaset", .. })
        ));

        let unknown_workload = pod("ns-a", "p", Some(owner("StatefulSet", "db")), Some("node-1"), &[]);
        assert!(matches!(
            resolve_pod_links(&unknown_workload, &cluster_with_creator(""), &links).await,
            Err(SyncError::MissingLink { what: "workload", .. })
        ));
    }
}
