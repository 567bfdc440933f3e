//! Error types for the synchronizer

use kubecmdb_core::{CoreError, DecisionError};
use thiserror::Error;

/// Errors from the CMDB collaborator.
#[derive(Debug, Error)]
pub enum CmdbError {
    #[error("CMDB request to `{collection}` failed: {message}")]
    Request { collection: String, message: String },

    #[error("CMDB rejected request to `{collection}` (code {code}): {message}")]
    Rejected {
        collection: String,
        code: i64,
        message: String,
    },

    #[error("failed to decode `{collection}` record: {source}")]
    Decode {
        collection: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Errors from the cluster registry collaborator.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("cluster registry request failed: {0}")]
    Request(String),

    #[error("cluster registry rejected request (code {code}): {message}")]
    Rejected { code: i64, message: String },
}

/// Errors reading live cluster state.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("cannot build client for cluster {cluster}: {message}")]
    ClusterClient { cluster: String, message: String },

    #[error("cluster {0} is not known to the state source")]
    UnknownCluster(String),
}

/// Errors from the message broker.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("AMQP error: {0}")]
    Amqp(#[from] lapin::Error),

    #[error("consumer for queue {0} closed")]
    ConsumerClosed(String),

    #[error("queue {0} already has an exclusive consumer")]
    QueueLocked(String),

    #[error("broker connection is closed")]
    Closed,
}

/// Configuration errors; fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SupervisorError {
    #[error("worker {0} is already running")]
    AlreadyRunning(String),

    #[error("supervisor is shutting down")]
    ShuttingDown,
}

/// Error surfaced by a reconciliation step.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("malformed message: {0}")]
    Malformed(#[from] CoreError),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("{count} CMDB records match {fingerprint}, expected at most one")]
    Duplicate { fingerprint: String, count: usize },

    #[error("pod {pod} is owned by unsupported kind {kind}")]
    UnsupportedOwner { pod: String, kind: String },

    #[error("missing {what} record for {key}")]
    MissingLink { what: &'static str, key: String },

    #[error("cluster {0} is not registered")]
    UnknownCluster(String),

    #[error(transparent)]
    Cmdb(#[from] CmdbError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error("failed to decode resource body: {0}")]
    Body(#[from] serde_json::Error),
}

impl From<DecisionError> for SyncError {
    fn from(err: DecisionError) -> Self {
        match err {
            DecisionError::NotFound(key) => Self::NotFound(key),
            DecisionError::Duplicate { fingerprint, count } => Self::Duplicate { fingerprint, count },
        }
    }
}

impl SyncError {
    /// Data invariant violations, as opposed to transient infrastructure errors.
    pub fn is_invariant_violation(&self) -> bool {
        matches!(
            self,
            Self::Duplicate { .. } | Self::UnsupportedOwner { .. } | Self::MissingLink { .. }
        )
    }

    /// Short label used in metrics and structured logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Malformed(_) => "malformed",
            Self::NotFound(_) => "not_found",
            Self::Duplicate { .. } => "duplicate",
            Self::UnsupportedOwner { .. } => "unsupported_owner",
            Self::MissingLink { .. } => "missing_link",
            Self::UnknownCluster(_) => "unknown_cluster",
            Self::Cmdb(_) => "cmdb",
            Self::Registry(_) => "registry",
            Self::Storage(_) => "storage",
            Self::Broker(_) => "broker",
            Self::Body(_) => "body",
        }
    }
}

pub type Result<T, E = SyncError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decision_errors_map_to_sync_errors() {
        let err: SyncError = DecisionError::Duplicate {
            fingerprint: "c/ns/p".into(),
            count: 3,
        }
        .into();
        assert!(err.is_invariant_violation());
        assert_eq!(err.kind(), "duplicate");

        let err: SyncError = DecisionError::NotFound("c/ns/p".into()).into();
        assert!(!err.is_invariant_violation());
        assert_eq!(err.to_string(), "not found: c/ns/p");
    }
}
