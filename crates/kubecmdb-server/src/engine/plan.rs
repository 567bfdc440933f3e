//! Per-domain reconciliation plan
//!
//! Groups the CMDB records of one domain by fingerprint, runs the per-record
//! decision against the projected live records, and collects the writes.
//! CMDB records with no live counterpart are deleted.

use kubecmdb_core::{decide_update, CmdbRecord, DecisionError, FieldMap, Fingerprint, ReconciliationDecision};
use std::collections::HashMap;

#[derive(Debug, Clone)]
pub struct DomainPlan<R> {
    pub creates: Vec<R>,
    pub updates: Vec<(i64, FieldMap)>,
    pub deletes: Vec<i64>,
    /// Fingerprints left untouched because several records matched.
    pub conflicts: Vec<DecisionError>,
}

impl<R> Default for DomainPlan<R> {
    fn default() -> Self {
        Self {
            creates: Vec::new(),
            updates: Vec::new(),
            deletes: Vec::new(),
            conflicts: Vec::new(),
        }
    }
}

pub fn plan_domain<R, F>(existing: Vec<R>, desired: Vec<R>, replace: F) -> DomainPlan<R>
where
    R: CmdbRecord,
    F: Fn(&R, &R) -> bool,
{
    let mut by_fingerprint: HashMap<Fingerprint, Vec<R>> = HashMap::new();
    for record in existing {
        by_fingerprint
            .entry(record.fingerprint())
            .or_default()
            .push(record);
    }

    let mut plan = DomainPlan::default();
    for record in desired {
        let fingerprint = record.fingerprint();
        let current = by_fingerprint.remove(&fingerprint).unwrap_or_default();
        match decide_update(&fingerprint, &current, record, &replace) {
            Ok(ReconciliationDecision::None) => {}
            Ok(ReconciliationDecision::Create(record)) => plan.creates.push(record),
            Ok(ReconciliationDecision::Update { id, diff }) => plan.updates.push((id, diff)),
            Ok(ReconciliationDecision::Replace { id, record }) => {
                plan.deletes.push(id);
                plan.creates.push(record);
            }
            Ok(ReconciliationDecision::Delete { id }) => plan.deletes.push(id),
            Err(err) => plan.conflicts.push(err),
        }
    }

    // Whatever is left has no live object behind it.
    let mut stale: Vec<i64> = by_fingerprint
        .into_values()
        .flatten()
        .map(|record| record.id())
        .collect();
    stale.sort_unstable();
    plan.deletes.extend(stale);
    plan
}

#[cfg(test)]
mod tests {
    use super::*;
    use kubecmdb_core::{CmdbContainer, CmdbNamespace, CmdbPod, Labels};

    fn is_noop<R>(plan: &DomainPlan<R>) -> bool {
        plan.creates.is_empty() && plan.updates.is_empty() && plan.deletes.is_empty()
    }

    fn ns(id: i64, name: &str, team: &str) -> CmdbNamespace {
        CmdbNamespace {
            id,
            bk_biz_id: 7,
            bk_cluster_id: 1,
            cluster_uid: "BCS-K8S-40001".into(),
            name: name.into(),
            labels: Labels::from([("team".to_string(), team.to_string())]),
            resource_quotas: vec![],
        }
    }

    fn never<R>(_: &R, _: &R) -> bool {
        false
    }

    #[test]
    fn test_create_update_delete() {
        let existing = vec![ns(1, "keep", "a"), ns(2, "change", "a"), ns(3, "gone", "a")];
        let desired = vec![ns(0, "keep", "a"), ns(0, "change", "b"), ns(0, "new", "a")];

        let plan = plan_domain(existing, desired, never);
        assert_eq!(plan.creates.len(), 1);
        assert_eq!(plan.creates[0].name, "new");
        assert_eq!(plan.updates.len(), 1);
        assert_eq!(plan.updates[0].0, 2);
        assert!(plan.updates[0].1.contains_key("labels"));
        assert_eq!(plan.deletes, vec![3]);
        assert!(plan.conflicts.is_empty());
    }

    #[test]
    fn test_converged_state_is_noop() {
        let existing = vec![ns(1, "a", "x"), ns(2, "b", "y")];
        let desired = vec![ns(0, "a", "x"), ns(0, "b", "y")];
        assert!(is_noop(&plan_domain(existing, desired, never)));
    }

    #[test]
    fn test_duplicate_fingerprint_is_left_alone() {
        let existing = vec![ns(1, "dup", "a"), ns(2, "dup", "a")];
        let desired = vec![ns(0, "dup", "b")];

        let plan = plan_domain(existing, desired, never);
        assert!(is_noop(&plan));
        assert!(matches!(
            plan.conflicts.as_slice(),
            [DecisionError::Duplicate { count: 2, .. }]
        ));
    }

    #[test]
    fn test_replace_predicate() {
        let pod = |id: i64, container: &str| CmdbPod {
            id,
            cluster_uid: "BCS-K8S-40001".into(),
            namespace: "ns-a".into(),
            name: "web-0".into(),
            containers: vec![CmdbContainer {
                name: "c0".into(),
                image: "nginx".into(),
                container_uid: container.into(),
            }],
            ..CmdbPod::default()
        };

        let plan = plan_domain(
            vec![pod(4, "containerd://old")],
            vec![pod(0, "containerd://new")],
            |current: &CmdbPod, live: &CmdbPod| current.identity_changed(live),
        );
        assert_eq!(plan.deletes, vec![4]);
        assert_eq!(plan.creates.len(), 1);
        assert!(plan.updates.is_empty());
    }
}
