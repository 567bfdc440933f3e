//! Natural keys locating a CMDB record

use crate::error::CoreError;
use crate::filter::PropertyFilter;
use std::fmt;

/// Composite natural key `(cluster_uid, namespace, name)`.
///
/// Cluster-scoped objects (nodes, namespaces themselves) leave `namespace`
/// empty. At most one live CMDB record may match a fingerprint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint {
    pub cluster_uid: String,
    pub namespace: String,
    pub name: String,
}

impl Fingerprint {
    pub fn namespaced(
        cluster_uid: impl Into<String>,
        namespace: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            cluster_uid: cluster_uid.into(),
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Key of an object that must live in a namespace.
    ///
    /// An empty namespace would widen the filter to every namespace holding
    /// a record with this name, so it is rejected.
    pub fn require_namespaced(
        cluster_uid: impl Into<String>,
        kind: impl ToString,
        namespace: &str,
        name: &str,
    ) -> Result<Self, CoreError> {
        if namespace.is_empty() {
            return Err(CoreError::MissingNamespace {
                kind: kind.to_string(),
                name: name.to_string(),
            });
        }
        Ok(Self::namespaced(cluster_uid, namespace, name))
    }

    pub fn cluster_scoped(cluster_uid: impl Into<String>, name: impl Into<String>) -> Self {
        Self::namespaced(cluster_uid, String::new(), name)
    }

    /// CMDB filter selecting records with this key.
    pub fn to_filter(&self) -> PropertyFilter {
        let filter = PropertyFilter::all().equal("cluster_uid", self.cluster_uid.as_str());
        let filter = if self.namespace.is_empty() {
            filter
        } else {
            filter.equal("namespace", self.namespace.as_str())
        };
        filter.equal("name", self.name.as_str())
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() {
            write!(f, "{}/{}", self.cluster_uid, self.name)
        } else {
            write!(f, "{}/{}/{}", self.cluster_uid, self.namespace, self.name)
        }
    }
}
