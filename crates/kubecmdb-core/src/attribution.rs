//! Operator attribution for pod records
//!
//! The person responsible for a pod is taken from the first source that
//! names one: the owning workload's labels, then the namespace labels, then
//! the cluster's creator and updater.

use crate::cluster::ClusterRecord;
use crate::records::Labels;

pub const CREATOR_LABEL: &str = "io.tencent.paas.creator";
pub const UPDATER_LABEL: &str = "io.tencent.paas.updator";

/// Operator named by a label set, creator first.
pub fn operator_from_labels(labels: &Labels) -> Option<String> {
    [CREATOR_LABEL, UPDATER_LABEL]
        .iter()
        .filter_map(|key| labels.get(*key))
        .map(|value| value.trim())
        .find(|value| !value.is_empty())
        .map(str::to_string)
}

/// Resolve the operator list stored on a pod record.
pub fn resolve_operator(
    workload_labels: Option<&Labels>,
    namespace_labels: Option<&Labels>,
    cluster: &ClusterRecord,
) -> Vec<String> {
    workload_labels
        .and_then(operator_from_labels)
        .or_else(|| namespace_labels.and_then(operator_from_labels))
        .or_else(|| non_empty(&cluster.creator))
        .or_else(|| non_empty(&cluster.updater))
        .into_iter()
        .collect()
}

fn non_empty(value: &str) -> Option<String> {
    let value = value.trim();
    (!value.is_empty()).then(|| value.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> Labels {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_workload_labels_win() {
        let cluster = ClusterRecord::new("BCS-K8S-1");
        let op = resolve_operator(
            Some(&labels(&[(CREATOR_LABEL, "bob")])),
            Some(&labels(&[(CREATOR_LABEL, "alice")])),
            &cluster,
        );
        assert_eq!(op, vec!["bob".to_string()]);
    }

    #[test]
    fn test_namespace_fallback() {
        let cluster = ClusterRecord::new("BCS-K8S-1");
        let op = resolve_operator(
            Some(&labels(&[("app", "web")])),
            Some(&labels(&[(CREATOR_LABEL, "alice")])),
            &cluster,
        );
        assert_eq!(op, vec!["alice".to_string()]);
    }

    #[test]
    fn test_updater_label_used_without_creator() {
        assert_eq!(
            operator_from_labels(&labels(&[(CREATOR_LABEL, " "), (UPDATER_LABEL, "carol")])),
            Some("carol".to_string())
        );
    }

    #[test]
    fn test_cluster_fallbacks() {
        let mut cluster = ClusterRecord::new("BCS-K8S-1");
        cluster.updater = "dave".into();
        assert_eq!(resolve_operator(None, None, &cluster), vec!["dave".to_string()]);

        cluster.creator = "erin".into();
        assert_eq!(resolve_operator(None, None, &cluster), vec!["erin".to_string()]);

        let empty = ClusterRecord::new("BCS-K8S-1");
        assert!(resolve_operator(None, Some(&Labels::new()), &empty).is_empty());
    }
}
