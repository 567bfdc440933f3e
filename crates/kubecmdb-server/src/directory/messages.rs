//! ShardCoordinator Message Types

use kameo::Reply;
use kubecmdb_core::ClusterId;
use serde::{Deserialize, Serialize};

/// Recompute this replica's slice from the tick's sorted cluster list.
#[derive(Debug, Clone)]
pub struct Reassign {
    pub clusters: Vec<ClusterId>,
    pub replica_count: usize,
}

/// Assignment after a `Reassign`, with the change against the previous one.
#[derive(Debug, Clone, Default, PartialEq, Eq, Reply)]
pub struct ShardDelta {
    pub assigned: Vec<ClusterId>,
    pub added: Vec<ClusterId>,
    pub removed: Vec<ClusterId>,
}

impl ShardDelta {
    pub fn is_unchanged(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct GetShardStats;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, Reply)]
pub struct ShardStats {
    pub ordinal: usize,
    pub replica_count: usize,
    /// Clusters in the directory at the last reassignment.
    pub cluster_count: usize,
    pub owned: Vec<ClusterId>,
    pub rebalances: u64,
}
