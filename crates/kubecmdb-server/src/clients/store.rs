//! Typed CMDB access
//!
//! Decodes query results into the per-collection record structs and splits
//! bulk writes into CMDB-sized chunks.

use super::CmdbClient;
use crate::error::CmdbError;
use crate::observability::metrics;
use kubecmdb_core::decision::create_payload;
use kubecmdb_core::{CmdbRecord, Collection, FieldMap, PropertyFilter};
use std::sync::Arc;
use tracing::debug;

#[derive(Clone)]
pub struct CmdbStore {
    client: Arc<dyn CmdbClient>,
    batch_size: usize,
}

impl CmdbStore {
    pub fn new(client: Arc<dyn CmdbClient>, batch_size: usize) -> Self {
        Self {
            client,
            batch_size: batch_size.max(1),
        }
    }

    /// Query and decode records.
    pub async fn find<R: CmdbRecord>(
        &self,
        collection: Collection,
        biz_id: i64,
        filter: &PropertyFilter,
    ) -> Result<Vec<R>, CmdbError> {
        let raw = self.client.query(collection, biz_id, filter).await?;
        raw.into_iter()
            .map(|value| {
                serde_json::from_value(value).map_err(|source| CmdbError::Decode {
                    collection: collection.to_string(),
                    source,
                })
            })
            .collect()
    }

    pub async fn create<R: CmdbRecord>(
        &self,
        collection: Collection,
        biz_id: i64,
        records: &[R],
    ) -> Result<Vec<i64>, CmdbError> {
        let mut ids = Vec::with_capacity(records.len());
        for chunk in records.chunks(self.batch_size) {
            let payload = chunk
                .iter()
                .map(create_payload)
                .collect::<Result<Vec<_>, _>>()
                .map_err(|source| CmdbError::Decode {
                    collection: collection.to_string(),
                    source,
                })?;
            ids.extend(self.client.create(collection, biz_id, payload).await?);
        }
        if !records.is_empty() {
            debug!(collection = %collection, count = records.len(), "Created CMDB records");
            metrics::record_writes(collection.as_str(), "create", records.len());
        }
        Ok(ids)
    }

    pub async fn update(
        &self,
        collection: Collection,
        biz_id: i64,
        id: i64,
        diff: &FieldMap,
    ) -> Result<(), CmdbError> {
        self.client.update(collection, biz_id, &[id], diff).await?;
        metrics::record_writes(collection.as_str(), "update", 1);
        Ok(())
    }

    pub async fn delete(
        &self,
        collection: Collection,
        biz_id: i64,
        ids: &[i64],
    ) -> Result<(), CmdbError> {
        for chunk in ids.chunks(self.batch_size) {
            self.client.delete(collection, biz_id, chunk).await?;
        }
        if !ids.is_empty() {
            debug!(collection = %collection, count = ids.len(), "Deleted CMDB records");
            metrics::record_writes(collection.as_str(), "delete", ids.len());
        }
        Ok(())
    }
}
