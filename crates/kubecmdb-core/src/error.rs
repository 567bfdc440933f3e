//! Errors raised while decoding shared data

use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CoreError {
    #[error("missing message header `{0}`")]
    MissingHeader(&'static str),

    #[error("invalid value for header `{header}`: {value}")]
    InvalidHeader { header: &'static str, value: String },

    #[error("unknown resource kind `{0}`")]
    UnknownKind(String),

    #[error("`{0}` is not a workload kind")]
    NotAWorkload(String),

    #[error("{kind} `{name}` has no namespace")]
    MissingNamespace { kind: String, name: String },
}

/// Fingerprint lookup outcomes that cannot be reconciled.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DecisionError {
    #[error("no CMDB record matches {0}")]
    NotFound(String),

    #[error("{count} CMDB records match {fingerprint}, expected at most one")]
    Duplicate { fingerprint: String, count: usize },
}
