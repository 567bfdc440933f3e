//! Projection of live Kubernetes objects onto CMDB records
//!
//! The projected record carries every field the synchronizer owns; `id`
//! stays 0 and is filled in by CMDB on create. Link IDs (cluster,
//! namespace, node, workload) are passed in by the caller, which knows
//! where to look them up.

use crate::cache::ResolvedCluster;
use crate::error::SyncError;
use k8s_openapi::api::apps::v1::ReplicaSet;
use k8s_openapi::api::core::v1::{Namespace, Node, Pod};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::DynamicObject;
use kube::ResourceExt;
use kubecmdb_core::{
    ClusterRecord, CmdbCluster, CmdbContainer, CmdbNamespace, CmdbNode, CmdbPod, CmdbWorkload,
    Labels, WorkloadKind, WorkloadRef,
};
use serde_json::Value;
use std::collections::BTreeMap;

const NODE_ROLE_PREFIX: &str = "node-role.kubernetes.io/";

pub fn project_cluster(record: &ClusterRecord) -> CmdbCluster {
    CmdbCluster {
        id: 0,
        bk_biz_id: record.biz_id(),
        uid: record.cluster_id.clone(),
        name: record.cluster_name.clone(),
        cluster_type: record.cluster_type.clone(),
        scheduling_engine: record.engine_type.clone(),
        status: record.status.clone(),
        bk_project_id: record.project_id.clone(),
        version: record.version.clone(),
    }
}

pub fn project_namespace(ns: &Namespace, cluster: &ResolvedCluster) -> CmdbNamespace {
    CmdbNamespace {
        id: 0,
        bk_biz_id: cluster.biz_id(),
        bk_cluster_id: cluster.cmdb_id(),
        cluster_uid: cluster.id().to_string(),
        name: ns.name_any(),
        labels: ns.labels().clone(),
        resource_quotas: Vec::new(),
    }
}

pub fn project_node(node: &Node, cluster: &ResolvedCluster) -> CmdbNode {
    let labels = node.labels().clone();
    let mut roles: Vec<&str> = labels
        .keys()
        .filter_map(|key| key.strip_prefix(NODE_ROLE_PREFIX))
        .filter(|role| !role.is_empty())
        .collect();
    roles.sort_unstable();

    let spec = node.spec.as_ref();
    let taints: Labels = spec
        .and_then(|s| s.taints.as_ref())
        .map(|taints| {
            taints
                .iter()
                .map(|t| {
                    let value = t.value.clone().unwrap_or_default();
                    (t.key.clone(), format!("{value}:{}", t.effect))
                })
                .collect()
        })
        .unwrap_or_default();

    let status = node.status.as_ref();
    let addresses = status.and_then(|s| s.addresses.as_ref());
    let address_of = |kind: &str| -> Vec<String> {
        addresses
            .map(|list| {
                list.iter()
                    .filter(|a| a.type_ == kind)
                    .map(|a| a.address.clone())
                    .collect()
            })
            .unwrap_or_default()
    };

    CmdbNode {
        id: 0,
        bk_biz_id: cluster.biz_id(),
        bk_cluster_id: cluster.cmdb_id(),
        cluster_uid: cluster.id().to_string(),
        name: node.name_any(),
        roles: roles.join(","),
        taints,
        unschedulable: spec.and_then(|s| s.unschedulable).unwrap_or(false),
        internal_ip: address_of("InternalIP"),
        external_ip: address_of("ExternalIP"),
        hostname: address_of("Hostname").into_iter().next().unwrap_or_default(),
        runtime_component: status
            .and_then(|s| s.node_info.as_ref())
            .map(|info| info.container_runtime_version.clone())
            .unwrap_or_default(),
        kube_proxy_mode: String::new(),
        pod_cidr: spec.and_then(|s| s.pod_cidr.clone()).unwrap_or_default(),
        labels,
    }
}

pub fn project_workload(
    kind: WorkloadKind,
    obj: &DynamicObject,
    cluster: &ResolvedCluster,
    namespace_id: i64,
) -> CmdbWorkload {
    let spec = obj.data.get("spec").cloned().unwrap_or(Value::Null);
    let strategy_key = match kind {
        WorkloadKind::Deployment | WorkloadKind::GameDeployment => "strategy",
        WorkloadKind::StatefulSet | WorkloadKind::DaemonSet | WorkloadKind::GameStatefulSet => {
            "updateStrategy"
        }
    };

    CmdbWorkload {
        id: 0,
        bk_biz_id: cluster.biz_id(),
        bk_cluster_id: cluster.cmdb_id(),
        cluster_uid: cluster.id().to_string(),
        bk_namespace_id: namespace_id,
        namespace: obj.namespace().unwrap_or_default(),
        name: obj.name_any(),
        labels: obj.labels().clone(),
        selector: spec.get("selector").cloned().unwrap_or(Value::Null),
        replicas: spec.get("replicas").and_then(Value::as_i64).unwrap_or(0),
        strategy_type: spec
            .get(strategy_key)
            .and_then(|s| s.get("type"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        min_ready_seconds: spec
            .get("minReadySeconds")
            .and_then(Value::as_i64)
            .unwrap_or(0),
    }
}

/// CMDB links a pod record points at.
#[derive(Debug, Clone, Default)]
pub struct PodLinks {
    pub namespace_id: i64,
    pub node_id: i64,
    pub workload: WorkloadRef,
    pub operator: Vec<String>,
}

pub fn project_pod(pod: &Pod, cluster: &ResolvedCluster, links: PodLinks) -> CmdbPod {
    let spec = pod.spec.as_ref();
    let status = pod.status.as_ref();

    let runtime_ids: BTreeMap<&str, &str> = status
        .and_then(|s| s.container_statuses.as_ref())
        .map(|statuses| {
            statuses
                .iter()
                .filter_map(|cs| Some((cs.name.as_str(), cs.container_id.as_deref()?)))
                .collect()
        })
        .unwrap_or_default();

    let containers = spec
        .map(|s| {
            s.containers
                .iter()
                .map(|c| CmdbContainer {
                    name: c.name.clone(),
                    image: c.image.clone().unwrap_or_default(),
                    container_uid: runtime_ids
                        .get(c.name.as_str())
                        .map(|id| id.to_string())
                        .unwrap_or_default(),
                })
                .collect()
        })
        .unwrap_or_default();

    CmdbPod {
        id: 0,
        bk_biz_id: cluster.biz_id(),
        bk_cluster_id: cluster.cmdb_id(),
        cluster_uid: cluster.id().to_string(),
        bk_namespace_id: links.namespace_id,
        namespace: pod.namespace().unwrap_or_default(),
        name: pod.name_any(),
        workload_ref: links.workload,
        bk_node_id: links.node_id,
        node_name: node_name(pod).unwrap_or_default().to_string(),
        labels: pod.labels().clone(),
        ip: status.and_then(|s| s.pod_ip.clone()).unwrap_or_default(),
        ips: status
            .and_then(|s| s.pod_ips.as_ref())
            .map(|ips| ips.iter().map(|ip| ip.ip.clone()).collect())
            .unwrap_or_default(),
        containers,
        operator: links.operator,
    }
}

/// Node the pod is scheduled on; `None` while pending scheduling.
pub fn node_name(pod: &Pod) -> Option<&str> {
    pod.spec
        .as_ref()
        .and_then(|s| s.node_name.as_deref())
        .filter(|name| !name.is_empty())
}

/// First step of resolving the workload a pod belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OwnerLink {
    Workload(WorkloadKind, String),
    /// Owned by a ReplicaSet; one more hop reaches the Deployment.
    ReplicaSet(String),
    /// No controller owner at all.
    Standalone,
}

fn controller(owners: &[OwnerReference]) -> Option<&OwnerReference> {
    owners
        .iter()
        .find(|o| o.controller == Some(true))
        .or_else(|| owners.first())
}

pub fn pod_owner(pod: &Pod) -> Result<OwnerLink, SyncError> {
    let Some(owner) = controller(pod.owner_references()) else {
        return Ok(OwnerLink::Standalone);
    };
    if owner.kind == "ReplicaSet" {
        return Ok(OwnerLink::ReplicaSet(owner.name.clone()));
    }
    WorkloadKind::from_owner_kind(&owner.kind)
        .map(|kind| OwnerLink::Workload(kind, owner.name.clone()))
        .ok_or_else(|| SyncError::UnsupportedOwner {
            pod: pod.name_any(),
            kind: owner.kind.clone(),
        })
}

/// Deployment owning a ReplicaSet.
pub fn replica_set_owner(rs: &ReplicaSet) -> Result<String, SyncError> {
    match controller(rs.owner_references()) {
        Some(owner) if owner.kind == "Deployment" => Ok(owner.name.clone()),
        Some(owner) => Err(SyncError::UnsupportedOwner {
            pod: rs.name_any(),
            kind: format!("ReplicaSet owned by {}", owner.kind),
        }),
        None => Err(SyncError::UnsupportedOwner {
            pod: rs.name_any(),
            kind: "ReplicaSet".into(),
        }),
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    //! Object builders shared by the engine and dispatcher tests.

    use super::*;
    use k8s_openapi::api::core::v1::{
        Container, ContainerStatus, NodeAddress, NodeSpec, NodeStatus, PodIP, PodSpec, PodStatus,
        Taint,
    };
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use kube::api::{ApiResource, GroupVersionKind};

    pub fn meta(namespace: Option<&str>, name: &str, labels: &[(&str, &str)]) -> ObjectMeta {
        ObjectMeta {
            name: Some(name.to_string()),
            namespace: namespace.map(str::to_string),
            labels: Some(
                labels
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            ),
            ..ObjectMeta::default()
        }
    }

    pub fn owner(kind: &str, name: &str) -> OwnerReference {
        OwnerReference {
            api_version: "apps/v1".into(),
            kind: kind.into(),
            name: name.into(),
            uid: format!("uid-{name}"),
            controller: Some(true),
            block_owner_deletion: None,
        }
    }

    pub fn namespace(name: &str, labels: &[(&str, &str)]) -> Namespace {
        Namespace {
            metadata: meta(None, name, labels),
            ..Namespace::default()
        }
    }

    pub fn node(name: &str) -> Node {
        Node {
            metadata: meta(None, name, &[("node-role.kubernetes.io/worker", "")]),
            spec: Some(NodeSpec {
                pod_cidr: Some("10.0.1.0/24".into()),
                taints: Some(vec![Taint {
                    key: "dedicated".into(),
                    value: Some("game".into()),
                    effect: "NoSchedule".into(),
                    time_added: None,
                }]),
                ..NodeSpec::default()
            }),
            status: Some(NodeStatus {
                addresses: Some(vec![
                    NodeAddress {
                        type_: "InternalIP".into(),
                        address: "10.0.0.5".into(),
                    },
                    NodeAddress {
                        type_: "Hostname".into(),
                        address: name.into(),
                    },
                ]),
                ..NodeStatus::default()
            }),
        }
    }

    pub fn workload(
        kind: WorkloadKind,
        namespace: &str,
        name: &str,
        labels: &[(&str, &str)],
    ) -> DynamicObject {
        let (group, version) = kind
            .api_version()
            .split_once('/')
            .unwrap_or(("", "v1"));
        let gvk = GroupVersionKind::gvk(group, version, &kind.to_string());
        let ar = ApiResource::from_gvk_with_plural(&gvk, kind.plural());
        let mut obj = DynamicObject::new(name, &ar)
            .within(namespace)
            .data(serde_json::json!({
                "spec": {
                    "replicas": 2,
                    "selector": {"matchLabels": {"app": name}},
                    "strategy": {"type": "RollingUpdate"},
                    "updateStrategy": {"type": "RollingUpdate"}
                }
            }));
        obj.metadata.labels = Some(
            labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        );
        obj
    }

    pub fn replica_set(namespace: &str, name: &str, deployment: &str) -> ReplicaSet {
        let mut metadata = meta(Some(namespace), name, &[]);
        metadata.owner_references = Some(vec![owner("Deployment", deployment)]);
        ReplicaSet {
            metadata,
            ..ReplicaSet::default()
        }
    }

    /// A running pod with one container per runtime ID.
    pub fn pod(
        namespace: &str,
        name: &str,
        owner_ref: Option<OwnerReference>,
        node: Option<&str>,
        container_ids: &[&str],
    ) -> Pod {
        let mut metadata = meta(Some(namespace), name, &[("app", name)]);
        metadata.owner_references = owner_ref.map(|o| vec![o]);
        Pod {
            metadata,
            spec: Some(PodSpec {
                node_name: node.map(str::to_string),
                containers: container_ids
                    .iter()
                    .enumerate()
                    .map(|(i, _)| Container {
                        name: format!("c{i}"),
                        image: Some("nginx:1.27".into()),
                        ..Container::default()
                    })
                    .collect(),
                ..PodSpec::default()
            }),
            status: Some(PodStatus {
                pod_ip: Some("172.16.0.9".into()),
                pod_ips: Some(vec![PodIP {
                    ip: "172.16.0.9".into(),
                }]),
                container_statuses: Some(
                    container_ids
                        .iter()
                        .enumerate()
                        .map(|(i, id)| ContainerStatus {
                            name: format!("c{i}"),
                            container_id: Some(id.to_string()),
                            ..ContainerStatus::default()
                        })
                        .collect(),
                ),
                ..PodStatus::default()
            }),
        }
    }
}
