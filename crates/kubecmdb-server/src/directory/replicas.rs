//! Replica identity
//!
//! The replica count comes either from configuration or from the
//! `.spec.replicas` of the StatefulSet the daemon runs in, read on every
//! tick so scaling the StatefulSet rebalances the fleet. The ordinal is the
//! trailing number of the pod's host name (`kubecmdb-2` is ordinal 2).

use crate::config::ReplicaConfig;
use crate::error::{ConfigError, StorageError};
use k8s_openapi::api::apps::v1::StatefulSet;
use kube::{Api, Client};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

pub enum ReplicaSource {
    /// Fixed count, adjustable at runtime through the shared handle.
    Static(Arc<AtomicUsize>),
    StatefulSet { api: Api<StatefulSet>, name: String },
}

impl ReplicaSource {
    pub fn fixed(count: usize) -> Self {
        Self::Static(Arc::new(AtomicUsize::new(count)))
    }

    /// Build the source described by `config`, connecting to the in-cluster
    /// API server when a StatefulSet is named.
    pub async fn from_config(config: &ReplicaConfig) -> Result<Self, StorageError> {
        match &config.statefulset {
            Some(sts) => {
                let client = Client::try_default().await?;
                Ok(Self::StatefulSet {
                    api: Api::namespaced(client, &sts.namespace),
                    name: sts.name.clone(),
                })
            }
            None => Ok(Self::fixed(config.count)),
        }
    }

    pub async fn count(&self) -> Result<usize, StorageError> {
        match self {
            Self::Static(count) => Ok(count.load(Ordering::SeqCst)),
            Self::StatefulSet { api, name } => {
                let sts = api.get(name).await?;
                let replicas = sts.spec.and_then(|s| s.replicas).unwrap_or(1);
                Ok(usize::try_from(replicas).unwrap_or(0))
            }
        }
    }
}

/// Ordinal encoded as the trailing `-<n>` of a host name.
pub fn ordinal_from_hostname(hostname: &str) -> Option<usize> {
    let (_, suffix) = hostname.trim().rsplit_once('-')?;
    suffix.parse().ok()
}

/// This replica's ordinal: explicit configuration first, then the host name.
pub fn resolve_ordinal(config: &ReplicaConfig) -> Result<usize, ConfigError> {
    if let Some(ordinal) = config.ordinal {
        return Ok(ordinal);
    }
    match config.hostname.as_deref() {
        Some(hostname) => ordinal_from_hostname(hostname).ok_or_else(|| {
            ConfigError::Invalid(format!(
                "host name {hostname} does not end in a replica ordinal"
            ))
        }),
        None if config.count <= 1 && config.statefulset.is_none() => Ok(0),
        None => Err(ConfigError::Invalid(
            "replica ordinal is unset and HOSTNAME is unavailable".into(),
        )),
    }
}
