//! Live cluster state through the API gateway
//!
//! The gateway proxies the Kubernetes API of every registered cluster at
//! `<gateway>/clusters/<cluster_id>`. One `kube::Client` is built per
//! cluster on first use and cached for the life of the process.

use super::ClusterStateSource;
use crate::config::GatewayConfig;
use crate::error::StorageError;
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::ReplicaSet;
use k8s_openapi::api::core::v1::{Namespace, Node, Pod};
use kube::api::{Api, ApiResource, DynamicObject, GroupVersionKind, ListParams};
use kube::Client;
use kubecmdb_core::WorkloadKind;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::fmt::Debug;
use tokio::sync::RwLock;
use tracing::debug;

const LIST_PAGE_SIZE: u32 = 500;

pub struct GatewayClusterState {
    config: GatewayConfig,
    clients: RwLock<HashMap<String, Client>>,
}

impl GatewayClusterState {
    pub fn new(config: GatewayConfig) -> Self {
        Self {
            config,
            clients: RwLock::new(HashMap::new()),
        }
    }

    async fn client(&self, cluster_id: &str) -> Result<Client, StorageError> {
        if let Some(client) = self.clients.read().await.get(cluster_id) {
            return Ok(client.clone());
        }

        let mut clients = self.clients.write().await;
        if let Some(client) = clients.get(cluster_id) {
            return Ok(client.clone());
        }
        let client = self.build_client(cluster_id)?;
        clients.insert(cluster_id.to_string(), client.clone());
        debug!(cluster_id = %cluster_id, "Built gateway client");
        Ok(client)
    }

    fn build_client(&self, cluster_id: &str) -> Result<Client, StorageError> {
        let url = format!(
            "{}/clusters/{cluster_id}",
            self.config.endpoint.trim_end_matches('/')
        );
        let uri = url.parse().map_err(|e| StorageError::ClusterClient {
            cluster: cluster_id.to_string(),
            message: format!("invalid gateway url {url}: {e}"),
        })?;

        let mut config = kube::Config::new(uri);
        if !self.config.token.is_empty() {
            config.auth_info.token = Some(self.config.token.clone().into());
        }
        config.accept_invalid_certs = self.config.insecure_skip_verify;

        Ok(Client::try_from(config)?)
    }
}

fn workload_resource(kind: WorkloadKind) -> ApiResource {
    let (group, version) = kind
        .api_version()
        .split_once('/')
        .unwrap_or(("", kind.api_version()));
    let gvk = GroupVersionKind::gvk(group, version, &kind.to_string());
    ApiResource::from_gvk_with_plural(&gvk, kind.plural())
}

/// List every object, following continue tokens.
async fn list_all<K>(api: &Api<K>) -> Result<Vec<K>, StorageError>
where
    K: Clone + DeserializeOwned + Debug,
{
    let mut items = Vec::new();
    let mut params = ListParams::default().limit(LIST_PAGE_SIZE);
    loop {
        let page = api.list(&params).await?;
        items.extend(page.items);
        match page.metadata.continue_ {
            Some(token) if !token.is_empty() => params = params.continue_token(&token),
            _ => break,
        }
    }
    Ok(items)
}

#[async_trait]
impl ClusterStateSource for GatewayClusterState {
    async fn namespaces(&self, cluster_id: &str) -> Result<Vec<Namespace>, StorageError> {
        list_all(&Api::all(self.client(cluster_id).await?)).await
    }

    async fn nodes(&self, cluster_id: &str) -> Result<Vec<Node>, StorageError> {
        list_all(&Api::all(self.client(cluster_id).await?)).await
    }

    async fn pods(&self, cluster_id: &str) -> Result<Vec<Pod>, StorageError> {
        list_all(&Api::all(self.client(cluster_id).await?)).await
    }

    async fn workloads(
        &self,
        cluster_id: &str,
        kind: WorkloadKind,
    ) -> Result<Vec<DynamicObject>, StorageError> {
        let client = self.client(cluster_id).await?;
        let api = Api::<DynamicObject>::all_with(client, &workload_resource(kind));
        list_all(&api).await
    }

    async fn replica_sets(&self, cluster_id: &str) -> Result<Vec<ReplicaSet>, StorageError> {
        list_all(&Api::all(self.client(cluster_id).await?)).await
    }

    async fn replica_set(
        &self,
        cluster_id: &str,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ReplicaSet>, StorageError> {
        let api: Api<ReplicaSet> = Api::namespaced(self.client(cluster_id).await?, namespace);
        Ok(api.get_opt(name).await?)
    }
}
