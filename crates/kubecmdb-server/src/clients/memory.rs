//! In-process collaborators
//!
//! Used by tests and local dry runs. `MemoryCmdb` evaluates property filters
//! the same way the real CMDB does and counts every write so tests can
//! assert that a pass was idempotent.

use super::{ClusterRegistry, ClusterStateSource, CmdbClient};
use crate::error::{CmdbError, RegistryError, StorageError};
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::ReplicaSet;
use k8s_openapi::api::core::v1::{Namespace, Node, Pod};
use kube::api::DynamicObject;
use kube::ResourceExt;
use kubecmdb_core::{ClusterRecord, Collection, FieldMap, PropertyFilter, WorkloadKind};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use tokio::sync::Mutex;

#[derive(Default)]
pub struct MemoryRegistry {
    clusters: Mutex<Vec<ClusterRecord>>,
    unavailable: Mutex<bool>,
}

impl MemoryRegistry {
    pub fn new(clusters: Vec<ClusterRecord>) -> Self {
        Self {
            clusters: Mutex::new(clusters),
            unavailable: Mutex::new(false),
        }
    }

    pub async fn set_clusters(&self, clusters: Vec<ClusterRecord>) {
        *self.clusters.lock().await = clusters;
    }

    pub async fn set_unavailable(&self, unavailable: bool) {
        *self.unavailable.lock().await = unavailable;
    }
}

#[async_trait]
impl ClusterRegistry for MemoryRegistry {
    async fn list_clusters(&self) -> Result<Vec<ClusterRecord>, RegistryError> {
        if *self.unavailable.lock().await {
            return Err(RegistryError::Request("registry unavailable".into()));
        }
        Ok(self.clusters.lock().await.clone())
    }
}

/// CMDB kept in memory, one map of records per collection.
pub struct MemoryCmdb {
    collections: Mutex<HashMap<Collection, BTreeMap<i64, Value>>>,
    next_id: AtomicI64,
    writes: AtomicUsize,
    failing: Mutex<HashSet<Collection>>,
    delete_calls: AtomicUsize,
    failing_deletes: AtomicUsize,
}

impl Default for MemoryCmdb {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCmdb {
    pub fn new() -> Self {
        Self {
            collections: Mutex::new(HashMap::new()),
            next_id: AtomicI64::new(1),
            writes: AtomicUsize::new(0),
            failing: Mutex::new(HashSet::new()),
            delete_calls: AtomicUsize::new(0),
            failing_deletes: AtomicUsize::new(0),
        }
    }

    /// Store a raw record as-is, assigning an ID when it has none.
    pub async fn insert_raw(&self, collection: Collection, mut record: Value) -> i64 {
        let id = match record.get("id").and_then(Value::as_i64) {
            Some(id) if id > 0 => id,
            _ => {
                let id = self.next_id.fetch_add(1, Ordering::SeqCst);
                if let Value::Object(map) = &mut record {
                    map.insert("id".into(), Value::from(id));
                }
                id
            }
        };
        self.collections
            .lock()
            .await
            .entry(collection)
            .or_default()
            .insert(id, record);
        id
    }

    /// Insert any serializable record; returns its new ID.
    pub async fn seed<T: serde::Serialize>(&self, collection: Collection, record: &T) -> i64 {
        let mut value = serde_json::to_value(record).unwrap_or(Value::Null);
        if let Value::Object(map) = &mut value {
            map.remove("id");
        }
        self.insert_raw(collection, value).await
    }

    pub async fn records(&self, collection: Collection) -> Vec<Value> {
        self.collections
            .lock()
            .await
            .get(&collection)
            .map(|records| records.values().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn count(&self, collection: Collection) -> usize {
        self.collections
            .lock()
            .await
            .get(&collection)
            .map_or(0, BTreeMap::len)
    }

    /// Number of create/update/delete calls served so far.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Make every request against `collection` fail until cleared.
    pub async fn fail_collection(&self, collection: Collection, failing: bool) {
        let mut set = self.failing.lock().await;
        if failing {
            set.insert(collection);
        } else {
            set.remove(&collection);
        }
    }

    /// Fail the next `count` delete calls; queries keep working.
    pub fn fail_next_deletes(&self, count: usize) {
        self.failing_deletes.store(count, Ordering::SeqCst);
    }

    /// Number of delete calls received, including failed ones.
    pub fn delete_calls(&self) -> usize {
        self.delete_calls.load(Ordering::SeqCst)
    }

    async fn check(&self, collection: Collection) -> Result<(), CmdbError> {
        if self.failing.lock().await.contains(&collection) {
            return Err(CmdbError::Request {
                collection: collection.to_string(),
                message: "injected failure".into(),
            });
        }
        Ok(())
    }
}

fn biz_matches(record: &Value, biz_id: i64) -> bool {
    biz_id == 0
        || record
            .get("bk_biz_id")
            .and_then(Value::as_i64)
            .map_or(true, |biz| biz == biz_id)
}

#[async_trait]
impl CmdbClient for MemoryCmdb {
    async fn query(
        &self,
        collection: Collection,
        biz_id: i64,
        filter: &PropertyFilter,
    ) -> Result<Vec<Value>, CmdbError> {
        self.check(collection).await?;
        Ok(self
            .collections
            .lock()
            .await
            .get(&collection)
            .map(|records| {
                records
                    .values()
                    .filter(|r| biz_matches(r, biz_id) && filter.matches(r))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn create(
        &self,
        collection: Collection,
        _biz_id: i64,
        records: Vec<FieldMap>,
    ) -> Result<Vec<i64>, CmdbError> {
        self.check(collection).await?;
        self.writes.fetch_add(1, Ordering::SeqCst);
        let mut ids = Vec::with_capacity(records.len());
        for mut record in records {
            record.remove("id");
            ids.push(self.insert_raw(collection, Value::Object(record)).await);
        }
        Ok(ids)
    }

    async fn update(
        &self,
        collection: Collection,
        _biz_id: i64,
        ids: &[i64],
        fields: &FieldMap,
    ) -> Result<(), CmdbError> {
        self.check(collection).await?;
        self.writes.fetch_add(1, Ordering::SeqCst);
        let mut collections = self.collections.lock().await;
        let records = collections.entry(collection).or_default();
        for id in ids {
            if let Some(Value::Object(record)) = records.get_mut(id) {
                for (key, value) in fields {
                    record.insert(key.clone(), value.clone());
                }
            }
        }
        Ok(())
    }

    async fn delete(
        &self,
        collection: Collection,
        _biz_id: i64,
        ids: &[i64],
    ) -> Result<(), CmdbError> {
        self.check(collection).await?;
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        let injected = self
            .failing_deletes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(CmdbError::Request {
                collection: collection.to_string(),
                message: "injected delete failure".into(),
            });
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        let mut collections = self.collections.lock().await;
        if let Some(records) = collections.get_mut(&collection) {
            for id in ids {
                records.remove(id);
            }
        }
        Ok(())
    }
}

/// Live objects of one cluster.
#[derive(Debug, Clone, Default)]
pub struct ClusterObjects {
    pub namespaces: Vec<Namespace>,
    pub nodes: Vec<Node>,
    pub pods: Vec<Pod>,
    pub workloads: BTreeMap<WorkloadKind, Vec<DynamicObject>>,
    pub replica_sets: Vec<ReplicaSet>,
}

#[derive(Default)]
pub struct MemoryClusterState {
    clusters: Mutex<HashMap<String, ClusterObjects>>,
}

impl MemoryClusterState {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_cluster(&self, cluster_id: &str, objects: ClusterObjects) {
        self.clusters
            .lock()
            .await
            .insert(cluster_id.to_string(), objects);
    }

    /// Mutate one cluster's objects in place.
    pub async fn update_cluster<F>(&self, cluster_id: &str, f: F)
    where
        F: FnOnce(&mut ClusterObjects),
    {
        let mut clusters = self.clusters.lock().await;
        f(clusters.entry(cluster_id.to_string()).or_default());
    }

    async fn with_cluster<T, F>(&self, cluster_id: &str, f: F) -> Result<T, StorageError>
    where
        F: FnOnce(&ClusterObjects) -> T,
    {
        self.clusters
            .lock()
            .await
            .get(cluster_id)
            .map(f)
            .ok_or_else(|| StorageError::UnknownCluster(cluster_id.to_string()))
    }
}

#[async_trait]
impl ClusterStateSource for MemoryClusterState {
    async fn namespaces(&self, cluster_id: &str) -> Result<Vec<Namespace>, StorageError> {
        self.with_cluster(cluster_id, |c| c.namespaces.clone()).await
    }

    async fn nodes(&self, cluster_id: &str) -> Result<Vec<Node>, StorageError> {
        self.with_cluster(cluster_id, |c| c.nodes.clone()).await
    }

    async fn pods(&self, cluster_id: &str) -> Result<Vec<Pod>, StorageError> {
        self.with_cluster(cluster_id, |c| c.pods.clone()).await
    }

    async fn workloads(
        &self,
        cluster_id: &str,
        kind: WorkloadKind,
    ) -> Result<Vec<DynamicObject>, StorageError> {
        self.with_cluster(cluster_id, |c| {
            c.workloads.get(&kind).cloned().unwrap_or_default()
        })
        .await
    }

    async fn replica_sets(&self, cluster_id: &str) -> Result<Vec<ReplicaSet>, StorageError> {
        self.with_cluster(cluster_id, |c| c.replica_sets.clone()).await
    }

    async fn replica_set(
        &self,
        cluster_id: &str,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ReplicaSet>, StorageError> {
        self.with_cluster(cluster_id, |c| {
            c.replica_sets
                .iter()
                .find(|rs| rs.namespace().as_deref() == Some(namespace) && rs.name_any() == name)
                .cloned()
        })
        .await
    }
}
