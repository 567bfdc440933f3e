//! Short-TTL read-through cache of resolved clusters
//!
//! Every event handler needs the registry record of its cluster (business
//! ID, creator) and the CMDB cluster record (numeric ID linking child
//! records). Both change rarely, so they are cached per cluster ID and
//! shared by all consumer tasks.

use crate::clients::{ClusterRegistry, CmdbStore};
use crate::error::{Result, SyncError};
use kubecmdb_core::{ClusterRecord, CmdbCluster, Collection};
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

/// Map whose entries expire `ttl` after insertion.
pub struct TtlCache<K, V> {
    ttl: Duration,
    entries: Mutex<HashMap<K, (Instant, V)>>,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash,
    V: Clone,
{
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub async fn get(&self, key: &K) -> Option<V> {
        let mut entries = self.entries.lock().await;
        match entries.get(key) {
            Some((inserted, value)) if inserted.elapsed() < self.ttl => Some(value.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    pub async fn insert(&self, key: K, value: V) {
        self.entries
            .lock()
            .await
            .insert(key, (Instant::now(), value));
    }

    pub async fn invalidate(&self, key: &K) {
        self.entries.lock().await.remove(key);
    }
}

/// A cluster's registry record joined with its CMDB record.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedCluster {
    pub record: ClusterRecord,
    pub cmdb: CmdbCluster,
}

impl ResolvedCluster {
    pub fn id(&self) -> &str {
        &self.record.cluster_id
    }

    pub fn biz_id(&self) -> i64 {
        self.record.biz_id()
    }

    /// CMDB ID of the cluster record.
    pub fn cmdb_id(&self) -> i64 {
        self.cmdb.id
    }
}

pub struct ClusterCache {
    registry: Arc<dyn ClusterRegistry>,
    store: CmdbStore,
    records: RwLock<HashMap<String, ClusterRecord>>,
    resolved: TtlCache<String, ResolvedCluster>,
}

impl ClusterCache {
    pub fn new(registry: Arc<dyn ClusterRegistry>, store: CmdbStore, ttl: Duration) -> Self {
        Self {
            registry,
            store,
            records: RwLock::new(HashMap::new()),
            resolved: TtlCache::new(ttl),
        }
    }

    /// Replace the known registry records with this tick's listing.
    pub async fn refresh_records(&self, records: &[ClusterRecord]) {
        let mut known = self.records.write().await;
        known.clear();
        known.extend(records.iter().map(|r| (r.cluster_id.clone(), r.clone())));
    }

    pub async fn insert(&self, resolved: ResolvedCluster) {
        self.resolved
            .insert(resolved.record.cluster_id.clone(), resolved)
            .await;
    }

    pub async fn invalidate(&self, cluster_id: &str) {
        self.resolved.invalidate(&cluster_id.to_string()).await;
    }

    /// Resolve a cluster, reading through to the registry and CMDB on a miss.
    pub async fn get(&self, cluster_id: &str) -> Result<ResolvedCluster> {
        let key = cluster_id.to_string();
        if let Some(hit) = self.resolved.get(&key).await {
            return Ok(hit);
        }

        let record = self.registry_record(cluster_id).await?;
        let mut found: Vec<CmdbCluster> = self
            .store
            .find(
                Collection::Cluster,
                record.biz_id(),
                &CmdbCluster::uid_filter(cluster_id),
            )
            .await?;
        let cmdb = match found.len() {
            0 => {
                return Err(SyncError::MissingLink {
                    what: "cluster",
                    key,
                })
            }
            1 => found.remove(0),
            count => {
                return Err(SyncError::Duplicate {
                    fingerprint: key,
                    count,
                })
            }
        };

        debug!(cluster_id = %cluster_id, cmdb_id = cmdb.id, "Resolved cluster");
        let resolved = ResolvedCluster { record, cmdb };
        self.resolved.insert(key, resolved.clone()).await;
        Ok(resolved)
    }

    async fn registry_record(&self, cluster_id: &str) -> Result<ClusterRecord> {
        if let Some(record) = self.records.read().await.get(cluster_id) {
            return Ok(record.clone());
        }
        let listed = self.registry.list_clusters().await?;
        let record = listed
            .iter()
            .find(|r| r.cluster_id == cluster_id)
            .cloned()
            .ok_or_else(|| SyncError::UnknownCluster(cluster_id.to_string()))?;
        self.refresh_records(&listed).await;
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::memory::{MemoryCmdb, MemoryRegistry};

    fn cluster(id: &str) -> ClusterRecord {
        ClusterRecord {
            business_id: "7".into(),
            ..ClusterRecord::new(id)
        }
    }

    fn cmdb_cluster(uid: &str) -> CmdbCluster {
        CmdbCluster {
            bk_biz_id: 7,
            uid: uid.into(),
            name: uid.into(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_ttl_expiry() {
        let cache = TtlCache::new(Duration::from_millis(20));
        cache.insert("a", 1).await;
        assert_eq!(cache.get(&"a").await, Some(1));
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(cache.get(&"a").await, None);
    }

    #[tokio::test]
    async fn test_resolves_and_caches() {
        let registry = Arc::new(MemoryRegistry::new(vec![cluster("BCS-K8S-40001")]));
        let cmdb = Arc::new(MemoryCmdb::new());
        let id = cmdb
            .seed(Collection::Cluster, &cmdb_cluster("BCS-K8S-40001"))
            .await;
        let cache = ClusterCache::new(
            registry.clone(),
            CmdbStore::new(cmdb.clone(), 100),
            Duration::from_secs(60),
        );

        let resolved = cache.get("BCS-K8S-40001").await.unwrap();
        assert_eq!(resolved.cmdb_id(), id);
        assert_eq!(resolved.biz_id(), 7);

        // Served from cache even after the registry goes away.
        registry.set_unavailable(true).await;
        cmdb.fail_collection(Collection::Cluster, true).await;
        assert!(cache.get("BCS-K8S-40001").await.is_ok());
    }

    #[tokio::test]
    async fn test_unknown_and_unlinked_clusters() {
        let registry = Arc::new(MemoryRegistry::new(vec![cluster("BCS-K8S-40001")]));
        let cache = ClusterCache::new(
            registry,
            CmdbStore::new(Arc::new(MemoryCmdb::new()), 100),
            Duration::from_secs(60),
        );

        assert!(matches!(
            cache.get("BCS-K8S-49999").await,
            Err(SyncError::UnknownCluster(_))
        ));
        assert!(matches!(
            cache.get("BCS-K8S-40001").await,
            Err(SyncError::MissingLink { what: "cluster", .. })
        ));
    }
}
