//! Cluster records as reported by the cluster registry

use serde::{Deserialize, Serialize};

/// Cluster identifier, e.g. `BCS-K8S-40001`.
pub type ClusterId = String;

/// Registry cluster type for clusters that only proxy other clusters.
pub const CLUSTER_TYPE_VIRTUAL: &str = "virtual";

/// Registry status of a healthy cluster.
pub const CLUSTER_STATUS_RUNNING: &str = "RUNNING";

/// A cluster as reported by the cluster registry.
///
/// Read-only to the synchronizer; refreshed on every full-resync tick.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterRecord {
    #[serde(rename = "clusterID")]
    pub cluster_id: ClusterId,
    #[serde(default)]
    pub cluster_name: String,
    #[serde(default)]
    pub cluster_type: String,
    #[serde(default)]
    pub is_shared: bool,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub engine_type: String,
    #[serde(default)]
    pub creator: String,
    #[serde(default)]
    pub updater: String,
    #[serde(default, rename = "projectID")]
    pub project_id: String,
    /// CMDB business the cluster's records live under.
    #[serde(default, rename = "businessID")]
    pub business_id: String,
    #[serde(default)]
    pub version: String,
}

impl ClusterRecord {
    pub fn new(cluster_id: impl Into<ClusterId>) -> Self {
        Self {
            cluster_id: cluster_id.into(),
            cluster_name: String::new(),
            cluster_type: "single".to_string(),
            is_shared: false,
            status: CLUSTER_STATUS_RUNNING.to_string(),
            engine_type: "k8s".to_string(),
            creator: String::new(),
            updater: String::new(),
            project_id: String::new(),
            business_id: String::new(),
            version: String::new(),
        }
    }

    pub fn is_virtual(&self) -> bool {
        self.cluster_type.eq_ignore_ascii_case(CLUSTER_TYPE_VIRTUAL)
    }

    pub fn is_running(&self) -> bool {
        self.status.eq_ignore_ascii_case(CLUSTER_STATUS_RUNNING)
    }

    /// Business ID as a number; unparseable IDs map to 0.
    pub fn biz_id(&self) -> i64 {
        self.business_id.trim().parse().unwrap_or(0)
    }

    /// Numeric suffix after the last `-`, used for stable ordering.
    pub fn numeric_suffix(&self) -> Option<u64> {
        numeric_suffix(&self.cluster_id)
    }
}

/// Parse the number after the last `-` in `id` (`BCS-K8S-40001` → 40001).
pub fn numeric_suffix(id: &str) -> Option<u64> {
    id.rsplit('-').next().and_then(|s| s.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numeric_suffix() {
        assert_eq!(numeric_suffix("BCS-K8S-40001"), Some(40001));
        assert_eq!(numeric_suffix("kubecmdb-2"), Some(2));
        assert_eq!(numeric_suffix("BCS-K8S-abc"), None);
        assert_eq!(numeric_suffix("12"), Some(12));
    }

    #[test]
    fn test_registry_json_shape() {
        let record: ClusterRecord = serde_json::from_value(serde_json::json!({
            "clusterID": "BCS-K8S-40001",
            "clusterType": "virtual",
            "isShared": true,
            "status": "RUNNING",
            "businessID": "100148",
            "projectID": "p1"
        }))
        .unwrap();

        assert!(record.is_virtual());
        assert!(record.is_shared);
        assert!(record.is_running());
        assert_eq!(record.biz_id(), 100148);
        assert_eq!(record.project_id, "p1");
    }
}
