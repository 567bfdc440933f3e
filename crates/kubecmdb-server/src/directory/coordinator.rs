//! ShardCoordinator Actor
//!
//! Owns this replica's current cluster assignment. Each tick sends the
//! freshly resolved directory; the reply says which clusters were gained
//! and which were lost so the synchronizer starts and stops exactly those
//! workers.

use super::messages::{GetShardStats, Reassign, ShardDelta, ShardStats};
use super::partition;
use crate::observability::{events, metrics};
use kameo::{
    message::{Context, Message},
    Actor,
};
use kubecmdb_core::ClusterId;
use std::collections::HashSet;
use tracing::{debug, info};

#[derive(Actor)]
pub struct ShardCoordinator {
    ordinal: usize,
    replica_count: usize,
    cluster_count: usize,
    assigned: Vec<ClusterId>,
    rebalances: u64,
}

impl ShardCoordinator {
    pub fn new(ordinal: usize) -> Self {
        info!(ordinal, "Initializing ShardCoordinator");
        Self {
            ordinal,
            replica_count: 0,
            cluster_count: 0,
            assigned: Vec::new(),
            rebalances: 0,
        }
    }

    fn reassign(&mut self, clusters: &[ClusterId], replica_count: usize) -> ShardDelta {
        let assigned = partition::assign(clusters, replica_count, self.ordinal).to_vec();

        let previous: HashSet<&ClusterId> = self.assigned.iter().collect();
        let current: HashSet<&ClusterId> = assigned.iter().collect();
        let added: Vec<ClusterId> = assigned
            .iter()
            .filter(|id| !previous.contains(id))
            .cloned()
            .collect();
        let removed: Vec<ClusterId> = self
            .assigned
            .iter()
            .filter(|id| !current.contains(id))
            .cloned()
            .collect();

        for id in &added {
            events::cluster_assigned(id, self.ordinal, replica_count);
        }
        for id in &removed {
            events::cluster_released(id, self.ordinal, replica_count);
        }

        if self.replica_count != replica_count && self.replica_count != 0 {
            info!(
                previous = self.replica_count,
                new = replica_count,
                "Replica count changed"
            );
        }
        if !added.is_empty() || !removed.is_empty() {
            self.rebalances += 1;
        }

        self.replica_count = replica_count;
        self.cluster_count = clusters.len();
        self.assigned = assigned.clone();
        metrics::set_owned_clusters(assigned.len());

        ShardDelta {
            assigned,
            added,
            removed,
        }
    }
}

impl Message<Reassign> for ShardCoordinator {
    type Reply = ShardDelta;

    async fn handle(&mut self, msg: Reassign, _ctx: &mut Context<Self, Self::Reply>) -> Self::Reply {
        let delta = self.reassign(&msg.clusters, msg.replica_count);
        debug!(
            owned = delta.assigned.len(),
            added = delta.added.len(),
            removed = delta.removed.len(),
            "Shard reassigned"
        );
        delta
    }
}

impl Message<GetShardStats> for ShardCoordinator {
    type Reply = ShardStats;

    async fn handle(
        &mut self,
        _msg: GetShardStats,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        ShardStats {
            ordinal: self.ordinal,
            replica_count: self.replica_count,
            cluster_count: self.cluster_count,
            owned: self.assigned.clone(),
            rebalances: self.rebalances,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kameo::prelude::*;

    fn clusters(n: usize) -> Vec<ClusterId> {
        (1..=n).map(|i| format!("BCS-K8S-{}", 40000 + i)).collect()
    }

    #[test]
    fn test_rebalance_two_to_three_replicas() {
        let list = clusters(6);
        let mut replica0 = ShardCoordinator::new(0);
        let mut replica1 = ShardCoordinator::new(1);
        let mut replica2 = ShardCoordinator::new(2);

        assert_eq!(replica0.reassign(&list, 2).assigned, list[0..3]);
        assert_eq!(replica1.reassign(&list, 2).assigned, list[3..6]);
        assert!(replica2.reassign(&list, 2).assigned.is_empty());

        let d0 = replica0.reassign(&list, 3);
        let d1 = replica1.reassign(&list, 3);
        let d2 = replica2.reassign(&list, 3);

        assert_eq!(d0.removed, vec![list[2].clone()]);
        assert!(d0.added.is_empty());
        assert_eq!(d1.added, vec![list[2].clone()]);
        assert_eq!(d1.removed, vec![list[4].clone(), list[5].clone()]);
        assert_eq!(d2.added, list[4..6]);

        // Each cluster is owned by exactly one replica after the rebalance.
        let mut owned: Vec<ClusterId> = [d0.assigned, d1.assigned, d2.assigned].concat();
        owned.sort();
        let mut expected = list.clone();
        expected.sort();
        assert_eq!(owned, expected);
    }

    #[test]
    fn test_unchanged_assignment_has_empty_delta() {
        let list = clusters(4);
        let mut coordinator = ShardCoordinator::new(0);
        coordinator.reassign(&list, 2);
        let delta = coordinator.reassign(&list, 2);
        assert!(delta.is_unchanged());
        assert_eq!(coordinator.rebalances, 1);
    }

    #[tokio::test]
    async fn test_actor_messages() {
        let actor_ref = ShardCoordinator::spawn(ShardCoordinator::new(1));

        let delta = actor_ref
            .ask(Reassign {
                clusters: clusters(4),
                replica_count: 2,
            })
            .send()
            .await
            .unwrap();
        assert_eq!(delta.added.len(), 2);

        let stats = actor_ref.ask(GetShardStats).send().await.unwrap();
        assert_eq!(stats.ordinal, 1);
        assert_eq!(stats.replica_count, 2);
        assert_eq!(stats.cluster_count, 4);
        assert_eq!(stats.owned, clusters(4)[2..4]);
    }
}
