//! Core shared types for kubecmdb
//!
//! This crate contains the data model shared by the synchronizer: cluster
//! records from the registry, resource kinds carried on broker messages,
//! CMDB property filters and the typed CMDB records the engine reconciles.
//! Nothing in here performs I/O.

pub mod attribution;
pub mod cluster;
pub mod decision;
pub mod error;
pub mod filter;
pub mod fingerprint;
pub mod headers;
pub mod kind;
pub mod records;

pub use cluster::{ClusterId, ClusterRecord};
pub use decision::{
    create_payload, decide_delete, decide_update, diff_fields, diff_records, FieldMap,
    ReconciliationDecision,
};
pub use error::{CoreError, DecisionError};
pub use filter::{Condition, Operator, PropertyFilter, Rule};
pub use fingerprint::Fingerprint;
pub use headers::{EventHeaders, HeaderMap, HeaderValue};
pub use kind::{EventKind, ResourceKind, WorkloadKind};
pub use records::{
    CmdbCluster, CmdbContainer, CmdbNamespace, CmdbNode, CmdbPod, CmdbRecord, CmdbWorkload,
    Collection, Labels, WorkloadRef,
};
