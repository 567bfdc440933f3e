//! kubecmdb Server Library
//!
//! Keeps CMDB records of namespaces, nodes, workloads and pods consistent
//! with the live state of every Kubernetes cluster this replica owns, by
//! combining a periodic full resync with per-cluster broker event streams.

pub mod api;
pub mod cache;
pub mod clients;
pub mod config;
pub mod directory;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod observability;
pub mod supervisor;
pub mod synchronizer;
pub mod topology;
pub mod version;
