//! Cluster Directory and Sharding
//!
//! Decides which clusters this replica owns.
//!
//! ```text
//! ClusterRegistry.list_clusters()
//!        ↓
//! DirectoryResolver   allow/deny/virtual filtering, dedupe, numeric sort
//!        ↓
//! partition::assign   contiguous slice for (ordinal, replicas)
//!        ↓
//! ShardCoordinator    keeps the current assignment, answers the delta
//! ```
//!
//! Every replica computes the same sorted list from the same registry
//! response, so the slices cover all clusters without overlap and without
//! any coordination between replicas.

mod coordinator;
mod messages;
pub mod partition;
pub mod replicas;
mod resolver;

pub use coordinator::ShardCoordinator;
pub use messages::{GetShardStats, Reassign, ShardDelta, ShardStats};
pub use replicas::{ordinal_from_hostname, ReplicaSource};
pub use resolver::DirectoryResolver;
