//! HTTP client for the cluster manager's cluster list

use super::ClusterRegistry;
use crate::config::RegistryConfig;
use crate::error::RegistryError;
use async_trait::async_trait;
use kubecmdb_core::ClusterRecord;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
struct ListClustersResponse {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: String,
    #[serde(default)]
    data: Vec<ClusterRecord>,
}

#[derive(Clone)]
pub struct HttpClusterRegistry {
    url: String,
    token: String,
    client: reqwest::Client,
}

impl HttpClusterRegistry {
    pub fn new(config: &RegistryConfig) -> Result<Self, RegistryError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| RegistryError::Request(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            url: format!(
                "{}/clustermanager/v1/cluster",
                config.endpoint.trim_end_matches('/')
            ),
            token: config.token.clone(),
            client,
        })
    }
}

#[async_trait]
impl ClusterRegistry for HttpClusterRegistry {
    async fn list_clusters(&self) -> Result<Vec<ClusterRecord>, RegistryError> {
        let mut request = self.client.get(&self.url);
        if !self.token.is_empty() {
            request = request.bearer_auth(&self.token);
        }
        let response = request
            .send()
            .await
            .map_err(|e| RegistryError::Request(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RegistryError::Request(format!(
                "list clusters returned {status}: {body}"
            )));
        }

        let body: ListClustersResponse = response
            .json()
            .await
            .map_err(|e| RegistryError::Request(format!("invalid cluster list: {e}")))?;
        if body.code != 0 {
            return Err(RegistryError::Rejected {
                code: body.code,
                message: body.message,
            });
        }
        debug!(count = body.data.len(), "Listed clusters from registry");
        Ok(body.data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderMap;
    use axum::routing::get;
    use axum::{Json, Router};
    use serde_json::json;

    async fn spawn_server(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn test_list_clusters_sends_token() {
        let app = Router::new().route(
            "/clustermanager/v1/cluster",
            get(|headers: HeaderMap| async move {
                let authorized = headers
                    .get("authorization")
                    .and_then(|v| v.to_str().ok())
                    == Some("Bearer secret");
                if !authorized {
                    return Json(json!({"code": 401, "message": "unauthorized", "data": []}));
                }
                Json(json!({
                    "code": 0,
                    "message": "ok",
                    "data": [
                        {"clusterID": "BCS-K8S-40001", "clusterType": "single", "isShared": false, "status": "RUNNING"},
                        {"clusterID": "BCS-K8S-40002", "clusterType": "virtual", "status": "RUNNING"}
                    ]
                }))
            }),
        );
        let endpoint = spawn_server(app).await;

        let registry = HttpClusterRegistry::new(&RegistryConfig {
            endpoint: endpoint.clone(),
            token: "secret".into(),
        })
        .unwrap();
        let clusters = registry.list_clusters().await.unwrap();
        assert_eq!(clusters.len(), 2);
        assert!(clusters[1].is_virtual());

        let anonymous = HttpClusterRegistry::new(&RegistryConfig {
            endpoint,
            token: String::new(),
        })
        .unwrap();
        assert!(matches!(
            anonymous.list_clusters().await,
            Err(RegistryError::Rejected { code: 401, .. })
        ));
    }
}
