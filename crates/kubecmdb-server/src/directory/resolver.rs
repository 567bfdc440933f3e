//! DirectoryResolver
//!
//! Turns the registry's cluster list into the stable, sorted list every
//! replica partitions.

use crate::clients::ClusterRegistry;
use crate::error::RegistryError;
use kubecmdb_core::{ClusterId, ClusterRecord};
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::debug;

pub struct DirectoryResolver {
    registry: Arc<dyn ClusterRegistry>,
    allow: HashSet<ClusterId>,
    deny: HashSet<ClusterId>,
}

impl DirectoryResolver {
    pub fn new(registry: Arc<dyn ClusterRegistry>, allow: &[String], deny: &[String]) -> Self {
        Self {
            registry,
            allow: allow.iter().cloned().collect(),
            deny: deny.iter().cloned().collect(),
        }
    }

    /// Fetch, filter, de-duplicate and sort the registry's clusters.
    ///
    /// Registry failures surface unchanged; the caller skips the tick.
    pub async fn list_owned_clusters(&self) -> Result<Vec<ClusterRecord>, RegistryError> {
        let listed = self.registry.list_clusters().await?;
        let total = listed.len();
        let clusters = resolve(listed, &self.allow, &self.deny);
        debug!(total, kept = clusters.len(), "Resolved cluster directory");
        Ok(clusters)
    }
}

/// Filter, de-duplicate and sort raw registry records.
pub fn resolve(
    listed: Vec<ClusterRecord>,
    allow: &HashSet<ClusterId>,
    deny: &HashSet<ClusterId>,
) -> Vec<ClusterRecord> {
    let mut clusters: Vec<ClusterRecord> = Vec::new();
    let mut index: HashMap<ClusterId, usize> = HashMap::new();

    for record in listed {
        if !allow.is_empty() && !allow.contains(&record.cluster_id) {
            continue;
        }
        if deny.contains(&record.cluster_id) || record.is_virtual() {
            continue;
        }
        match index.get(&record.cluster_id) {
            // A shared report replaces a non-shared one in place.
            Some(&pos) => {
                if record.is_shared && !clusters[pos].is_shared {
                    clusters[pos] = record;
                }
            }
            None => {
                index.insert(record.cluster_id.clone(), clusters.len());
                clusters.push(record);
            }
        }
    }

    clusters.sort_by(|a, b| compare_ids(&a.cluster_id, &b.cluster_id));
    clusters
}

/// Order by numeric suffix; IDs without one sort after, by string.
fn compare_ids(a: &str, b: &str) -> Ordering {
    let key = |id: &str| kubecmdb_core::cluster::numeric_suffix(id);
    match (key(a), key(b)) {
        (Some(x), Some(y)) => x.cmp(&y).then_with(|| a.cmp(b)),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => a.cmp(b),
    }
}
