//! Typed CMDB records
//!
//! Query results are decoded into one struct per collection so that field
//! mismatches surface as decode errors instead of surprises deep inside the
//! reconciliation code.

use crate::filter::PropertyFilter;
use crate::fingerprint::Fingerprint;
use crate::kind::WorkloadKind;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt::{self, Debug};

pub type Labels = BTreeMap<String, String>;

/// CMDB collection a record lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Collection {
    Cluster,
    Namespace,
    Node,
    Pod,
    Workload(WorkloadKind),
}

impl Collection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cluster => "cluster",
            Self::Namespace => "namespace",
            Self::Node => "node",
            Self::Pod => "pods",
            Self::Workload(kind) => kind.ref_kind(),
        }
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fields that belong to the record's identity in CMDB and never appear in
/// an update diff.
pub const IMMUTABLE_FIELDS: &[&str] = &["id", "bk_biz_id"];

/// A record stored in one of the CMDB kube collections.
pub trait CmdbRecord: Serialize + DeserializeOwned + Clone + Debug + Send + Sync + 'static {
    fn id(&self) -> i64;

    fn fingerprint(&self) -> Fingerprint;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct CmdbCluster {
    #[serde(default)]
    pub id: i64,
    #[serde(default)]
    pub bk_biz_id: i64,
    pub uid: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, rename = "type")]
    pub cluster_type: String,
    #[serde(default)]
    pub scheduling_engine: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub bk_project_id: String,
    #[serde(default)]
    pub version: String,
}

impl CmdbCluster {
    /// Cluster records are keyed by `uid` rather than `cluster_uid`.
    pub fn uid_filter(uid: &str) -> PropertyFilter {
        PropertyFilter::all().equal("uid", uid)
    }
}

impl CmdbRecord for CmdbCluster {
    fn id(&self) -> i64 {
        self.id
    }

    fn fingerprint(&self) -> Fingerprint {
        Fingerprint::cluster_scoped(&self.uid, &self.uid)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct CmdbNamespace {
    #[serde(default)]
    pub id: i64,
    #[serde(default)]
    pub bk_biz_id: i64,
    #[serde(default)]
    pub bk_cluster_id: i64,
    pub cluster_uid: String,
    pub name: String,
    #[serde(default)]
    pub labels: Labels,
    #[serde(default)]
    pub resource_quotas: Vec<Value>,
}

impl CmdbRecord for CmdbNamespace {
    fn id(&self) -> i64 {
        self.id
    }

    fn fingerprint(&self) -> Fingerprint {
        Fingerprint::cluster_scoped(&self.cluster_uid, &self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct CmdbNode {
    #[serde(default)]
    pub id: i64,
    #[serde(default)]
    pub bk_biz_id: i64,
    #[serde(default)]
    pub bk_cluster_id: i64,
    pub cluster_uid: String,
    pub name: String,
    #[serde(default)]
    pub roles: String,
    #[serde(default)]
    pub labels: Labels,
    /// Taint key to `value:effect`.
    #[serde(default)]
    pub taints: Labels,
    #[serde(default)]
    pub unschedulable: bool,
    #[serde(default)]
    pub internal_ip: Vec<String>,
    #[serde(default)]
    pub external_ip: Vec<String>,
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub runtime_component: String,
    #[serde(default)]
    pub kube_proxy_mode: String,
    #[serde(default)]
    pub pod_cidr: String,
}

impl CmdbRecord for CmdbNode {
    fn id(&self) -> i64 {
        self.id
    }

    fn fingerprint(&self) -> Fingerprint {
        Fingerprint::cluster_scoped(&self.cluster_uid, &self.name)
    }
}

/// Record shape shared by all five workload collections.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct CmdbWorkload {
    #[serde(default)]
    pub id: i64,
    #[serde(default)]
    pub bk_biz_id: i64,
    #[serde(default)]
    pub bk_cluster_id: i64,
    pub cluster_uid: String,
    #[serde(default)]
    pub bk_namespace_id: i64,
    pub namespace: String,
    pub name: String,
    #[serde(default)]
    pub labels: Labels,
    #[serde(default)]
    pub selector: Value,
    #[serde(default)]
    pub replicas: i64,
    #[serde(default)]
    pub strategy_type: String,
    #[serde(default)]
    pub min_ready_seconds: i64,
}

impl CmdbRecord for CmdbWorkload {
    fn id(&self) -> i64 {
        self.id
    }

    fn fingerprint(&self) -> Fingerprint {
        Fingerprint::namespaced(&self.cluster_uid, &self.namespace, &self.name)
    }
}

/// Workload a pod belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct WorkloadRef {
    pub kind: String,
    pub name: String,
    #[serde(default)]
    pub id: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct CmdbContainer {
    pub name: String,
    #[serde(default)]
    pub image: String,
    /// Runtime container ID, e.g. `containerd://4f1c…`.
    #[serde(default)]
    pub container_uid: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct CmdbPod {
    #[serde(default)]
    pub id: i64,
    #[serde(default)]
    pub bk_biz_id: i64,
    #[serde(default)]
    pub bk_cluster_id: i64,
    pub cluster_uid: String,
    #[serde(default)]
    pub bk_namespace_id: i64,
    pub namespace: String,
    pub name: String,
    #[serde(default, rename = "ref")]
    pub workload_ref: WorkloadRef,
    #[serde(default)]
    pub bk_node_id: i64,
    #[serde(default)]
    pub node_name: String,
    #[serde(default)]
    pub labels: Labels,
    #[serde(default)]
    pub ip: String,
    #[serde(default)]
    pub ips: Vec<String>,
    #[serde(default)]
    pub containers: Vec<CmdbContainer>,
    #[serde(default)]
    pub operator: Vec<String>,
}

impl CmdbPod {
    /// Non-empty runtime container IDs, sorted.
    pub fn container_ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self
            .containers
            .iter()
            .map(|c| c.container_uid.as_str())
            .filter(|id| !id.is_empty())
            .collect();
        ids.sort_unstable();
        ids
    }

    /// True when both records carry container IDs and they differ, which
    /// means the pod was recreated under the same name.
    pub fn identity_changed(&self, live: &CmdbPod) -> bool {
        let stored = self.container_ids();
        let current = live.container_ids();
        !stored.is_empty() && !current.is_empty() && stored != current
    }
}

impl CmdbRecord for CmdbPod {
    fn id(&self) -> i64 {
        self.id
    }

    fn fingerprint(&self) -> Fingerprint {
        Fingerprint::namespaced(&self.cluster_uid, &self.namespace, &self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn pod_with(ids: &[&str]) -> CmdbPod {
        CmdbPod {
            cluster_uid: "BCS-K8S-1".into(),
            namespace: "ns-a".into(),
            name: "p1".into(),
            containers: ids
                .iter()
                .enumerate()
                .map(|(i, id)| CmdbContainer {
                    name: format!("c{i}"),
                    image: "nginx".into(),
                    container_uid: (*id).into(),
                })
                .collect(),
            ..Default::default()
        }
    }

    #[test]
    fn test_collection_names() {
        assert_eq!(Collection::Pod.as_str(), "pods");
        assert_eq!(Collection::Namespace.as_str(), "namespace");
        assert_eq!(
            Collection::Workload(WorkloadKind::GameStatefulSet).to_string(),
            "gameStatefulSet"
        );
    }

    #[test]
    fn test_pod_decodes_ref_field() {
        let pod: CmdbPod = serde_json::from_value(json!({
            "id": 3,
            "cluster_uid": "BCS-K8S-1",
            "namespace": "ns-a",
            "name": "p1",
            "ref": {"kind": "deployment", "name": "d1", "id": 9}
        }))
        .unwrap();
        assert_eq!(pod.workload_ref.id, 9);
        assert!(pod.containers.is_empty());
        assert_eq!(pod.fingerprint(), Fingerprint::namespaced("BCS-K8S-1", "ns-a", "p1"));
    }

    #[test]
    fn test_identity_changed() {
        let stored = pod_with(&["containerd://aaa"]);
        assert!(stored.identity_changed(&pod_with(&["containerd://bbb"])));
        assert!(!stored.identity_changed(&pod_with(&["containerd://aaa"])));
        // Pending pods have no container statuses yet.
        assert!(!stored.identity_changed(&pod_with(&[])));
        assert!(!pod_with(&[]).identity_changed(&stored));
    }

    #[test]
    fn test_decode_rejects_missing_identity() {
        let result = serde_json::from_value::<CmdbNode>(json!({"id": 1, "name": "n1"}));
        assert!(result.is_err());
    }
}
