//! HTTP client for the CMDB kube collections
//!
//! Every endpoint answers with the envelope
//! `{"result": bool, "code": int, "message": str, "data": ...}`; a false
//! `result` or non-zero `code` is a rejection even on HTTP 200.

use super::CmdbClient;
use crate::config::CmdbConfig;
use crate::error::CmdbError;
use async_trait::async_trait;
use kubecmdb_core::{Collection, FieldMap, PropertyFilter};
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::debug;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const AUTH_HEADER: &str = "X-Bkapi-Authorization";

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    #[serde(default)]
    result: bool,
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: String,
    data: Option<T>,
}

#[derive(Debug, Deserialize)]
struct QueryData {
    #[serde(default)]
    info: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct CreateData {
    #[serde(default)]
    ids: Vec<i64>,
}

#[derive(Debug, Serialize)]
struct Page {
    start: usize,
    limit: usize,
}

#[derive(Clone)]
pub struct HttpCmdbClient {
    base_url: String,
    client: reqwest::Client,
    auth: String,
    page_size: usize,
}

impl HttpCmdbClient {
    pub fn new(config: &CmdbConfig) -> Result<Self, CmdbError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| CmdbError::Request {
                collection: String::new(),
                message: format!("failed to build HTTP client: {e}"),
            })?;
        let auth = json!({
            "bk_app_code": config.app_code,
            "bk_app_secret": config.app_secret,
            "bk_username": config.username,
        })
        .to_string();
        Ok(Self {
            base_url: config.endpoint.trim_end_matches('/').to_string(),
            client,
            auth,
            page_size: config.page_size.max(1),
        })
    }

    fn url(&self, action: &str, collection: Collection) -> String {
        format!("{}/api/v3/{action}/kube/{collection}", self.base_url)
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: Method,
        action: &str,
        collection: Collection,
        body: &Value,
    ) -> Result<Option<T>, CmdbError> {
        let request_error = |message: String| CmdbError::Request {
            collection: collection.to_string(),
            message,
        };

        let response = self
            .client
            .request(method, self.url(action, collection))
            .header(AUTH_HEADER, &self.auth)
            .json(body)
            .send()
            .await
            .map_err(|e| request_error(e.to_string()))?;

        let status = response.status();
        let bytes = response
            .bytes()
            .await
            .map_err(|e| request_error(format!("failed reading response body: {e}")))?;
        if !status.is_success() {
            return Err(request_error(format!(
                "{action} returned {status}: {}",
                String::from_utf8_lossy(&bytes)
            )));
        }

        let envelope: Envelope<T> =
            serde_json::from_slice(&bytes).map_err(|source| CmdbError::Decode {
                collection: collection.to_string(),
                source,
            })?;
        if !envelope.result || envelope.code != 0 {
            return Err(CmdbError::Rejected {
                collection: collection.to_string(),
                code: envelope.code,
                message: envelope.message,
            });
        }
        Ok(envelope.data)
    }
}

#[async_trait]
impl CmdbClient for HttpCmdbClient {
    async fn query(
        &self,
        collection: Collection,
        biz_id: i64,
        filter: &PropertyFilter,
    ) -> Result<Vec<Value>, CmdbError> {
        let mut records = Vec::new();
        let mut start = 0;
        loop {
            let page = Page {
                start,
                limit: self.page_size,
            };
            let body = json!({ "bk_biz_id": biz_id, "filter": filter, "page": page });
            let page = self
                .call::<QueryData>(Method::POST, "findmany", collection, &body)
                .await?
                .map(|data| data.info)
                .unwrap_or_default();
            let fetched = page.len();
            records.extend(page);
            if fetched < self.page_size {
                break;
            }
            start += fetched;
        }
        debug!(collection = %collection, biz_id, count = records.len(), "Queried CMDB");
        Ok(records)
    }

    async fn create(
        &self,
        collection: Collection,
        biz_id: i64,
        records: Vec<FieldMap>,
    ) -> Result<Vec<i64>, CmdbError> {
        let body = json!({ "bk_biz_id": biz_id, "data": records });
        Ok(self
            .call::<CreateData>(Method::POST, "createmany", collection, &body)
            .await?
            .map(|data| data.ids)
            .unwrap_or_default())
    }

    async fn update(
        &self,
        collection: Collection,
        biz_id: i64,
        ids: &[i64],
        fields: &FieldMap,
    ) -> Result<(), CmdbError> {
        let body = json!({ "bk_biz_id": biz_id, "ids": ids, "data": fields });
        self.call::<Value>(Method::PUT, "updatemany", collection, &body)
            .await?;
        Ok(())
    }

    async fn delete(
        &self,
        collection: Collection,
        biz_id: i64,
        ids: &[i64],
    ) -> Result<(), CmdbError> {
        let body = json!({ "bk_biz_id": biz_id, "ids": ids });
        self.call::<Value>(Method::DELETE, "deletemany", collection, &body)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::post;
    use axum::{Json, Router};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    async fn spawn_server(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        format!("http://{addr}")
    }

    fn client(endpoint: String, page_size: usize) -> HttpCmdbClient {
        HttpCmdbClient::new(&CmdbConfig {
            endpoint,
            page_size,
            ..CmdbConfig::default()
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_query_follows_pages() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let app = Router::new().route(
            "/api/v3/findmany/kube/pods",
            post(move |Json(body): Json<Value>| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    let start = body["page"]["start"].as_u64().unwrap_or(0);
                    let info: Vec<Value> = (start..3.min(start + 2))
                        .map(|i| json!({"id": i + 1}))
                        .collect();
                    Json(json!({"result": true, "code": 0, "message": "", "data": {"info": info}}))
                }
            }),
        );
        let cmdb = client(spawn_server(app).await, 2);

        let records = cmdb
            .query(Collection::Pod, 3, &PropertyFilter::all())
            .await
            .unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_envelope_rejection() {
        let app = Router::new().route(
            "/api/v3/createmany/kube/node",
            post(|| async {
                Json(json!({"result": false, "code": 1199014, "message": "duplicated", "data": null}))
            }),
        );
        let cmdb = client(spawn_server(app).await, 10);

        let result = cmdb.create(Collection::Node, 3, vec![FieldMap::new()]).await;
        assert!(matches!(
            result,
            Err(CmdbError::Rejected { code: 1199014, .. })
        ));
    }
}
