//! Collaborator Clients
//!
//! The synchronizer talks to three external systems besides the broker:
//! - `ClusterRegistry`: lists every known cluster (`registry`, over HTTP)
//! - `CmdbClient`: the system of record being kept in sync (`cmdb`, over HTTP),
//!   wrapped by the typed `CmdbStore`
//! - `ClusterStateSource`: live Kubernetes state per cluster (`kube_state`,
//!   through the cluster-manager API gateway)
//!
//! `memory` holds in-process implementations of all three.

pub mod cmdb;
pub mod kube_state;
pub mod memory;
pub mod registry;
pub mod store;

pub use cmdb::HttpCmdbClient;
pub use kube_state::GatewayClusterState;
pub use registry::HttpClusterRegistry;
pub use store::CmdbStore;

use crate::error::{CmdbError, RegistryError, StorageError};
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::ReplicaSet;
use k8s_openapi::api::core::v1::{Namespace, Node, Pod};
use kube::api::DynamicObject;
use kubecmdb_core::{ClusterRecord, Collection, FieldMap, PropertyFilter, WorkloadKind};
use serde_json::Value;

/// Source of cluster identities.
#[async_trait]
pub trait ClusterRegistry: Send + Sync {
    async fn list_clusters(&self) -> Result<Vec<ClusterRecord>, RegistryError>;
}

/// Untyped CMDB access; see `CmdbStore` for the typed view.
#[async_trait]
pub trait CmdbClient: Send + Sync {
    async fn query(
        &self,
        collection: Collection,
        biz_id: i64,
        filter: &PropertyFilter,
    ) -> Result<Vec<Value>, CmdbError>;

    /// Create records, returning their assigned IDs in order.
    async fn create(
        &self,
        collection: Collection,
        biz_id: i64,
        records: Vec<FieldMap>,
    ) -> Result<Vec<i64>, CmdbError>;

    async fn update(
        &self,
        collection: Collection,
        biz_id: i64,
        ids: &[i64],
        fields: &FieldMap,
    ) -> Result<(), CmdbError>;

    async fn delete(&self, collection: Collection, biz_id: i64, ids: &[i64])
        -> Result<(), CmdbError>;
}

/// Live state of the clusters this replica owns.
#[async_trait]
pub trait ClusterStateSource: Send + Sync {
    async fn namespaces(&self, cluster_id: &str) -> Result<Vec<Namespace>, StorageError>;

    async fn nodes(&self, cluster_id: &str) -> Result<Vec<Node>, StorageError>;

    async fn pods(&self, cluster_id: &str) -> Result<Vec<Pod>, StorageError>;

    async fn workloads(
        &self,
        cluster_id: &str,
        kind: WorkloadKind,
    ) -> Result<Vec<DynamicObject>, StorageError>;

    async fn replica_sets(&self, cluster_id: &str) -> Result<Vec<ReplicaSet>, StorageError>;

    async fn replica_set(
        &self,
        cluster_id: &str,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ReplicaSet>, StorageError>;
}
