//! Reconciliation decisions
//!
//! Compares the records matching one fingerprint with the record projected
//! from the live object and decides what to write.

use crate::error::DecisionError;
use crate::fingerprint::Fingerprint;
use crate::records::{CmdbRecord, IMMUTABLE_FIELDS};
use serde_json::{Map, Value};

pub type FieldMap = Map<String, Value>;

/// What to do with one CMDB record.
#[derive(Debug, Clone, PartialEq)]
pub enum ReconciliationDecision<R> {
    /// Already consistent.
    None,
    Create(R),
    Update { id: i64, diff: FieldMap },
    Delete { id: i64 },
    /// Delete the stale record and create a fresh one in its place.
    Replace { id: i64, record: R },
}

/// Decide how to apply an `update` event.
///
/// `replace` is consulted when exactly one record exists; returning `true`
/// forces delete-and-recreate instead of an in-place update.
pub fn decide_update<R, F>(
    fingerprint: &Fingerprint,
    existing: &[R],
    desired: R,
    replace: F,
) -> Result<ReconciliationDecision<R>, DecisionError>
where
    R: CmdbRecord,
    F: Fn(&R, &R) -> bool,
{
    match existing {
        [] => Ok(ReconciliationDecision::Create(desired)),
        [current] => {
            if replace(current, &desired) {
                return Ok(ReconciliationDecision::Replace {
                    id: current.id(),
                    record: desired,
                });
            }
            let diff = diff_records(current, &desired);
            if diff.is_empty() {
                Ok(ReconciliationDecision::None)
            } else {
                Ok(ReconciliationDecision::Update {
                    id: current.id(),
                    diff,
                })
            }
        }
        many => Err(DecisionError::Duplicate {
            fingerprint: fingerprint.to_string(),
            count: many.len(),
        }),
    }
}

/// Decide how to apply a `delete` event.
pub fn decide_delete<R: CmdbRecord>(
    fingerprint: &Fingerprint,
    existing: &[R],
) -> Result<ReconciliationDecision<R>, DecisionError> {
    match existing {
        [] => Err(DecisionError::NotFound(fingerprint.to_string())),
        [current] => Ok(ReconciliationDecision::Delete { id: current.id() }),
        many => Err(DecisionError::Duplicate {
            fingerprint: fingerprint.to_string(),
            count: many.len(),
        }),
    }
}

/// Field-level diff of two typed records, ignoring identity fields.
pub fn diff_records<R: CmdbRecord>(current: &R, desired: &R) -> FieldMap {
    match (serde_json::to_value(current), serde_json::to_value(desired)) {
        (Ok(current), Ok(Value::Object(desired))) => diff_fields(&current, &desired),
        _ => FieldMap::new(),
    }
}

/// Fields of `desired` whose value differs from `current`.
///
/// A field missing from `current` compares equal to `null`.
pub fn diff_fields(current: &Value, desired: &FieldMap) -> FieldMap {
    desired
        .iter()
        .filter(|(key, _)| !IMMUTABLE_FIELDS.contains(&key.as_str()))
        .filter(|(key, value)| current.get(key.as_str()).unwrap_or(&Value::Null) != *value)
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

/// JSON body used to create a record; the CMDB assigns the `id`.
pub fn create_payload<R: CmdbRecord>(record: &R) -> Result<FieldMap, serde_json::Error> {
    match serde_json::to_value(record)? {
        Value::Object(mut map) => {
            map.remove("id");
            Ok(map)
        }
        _ => Ok(FieldMap::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::{CmdbContainer, CmdbNamespace, CmdbPod};
    use serde_json::json;

    fn ns(id: i64, labels: &[(&str, &str)]) -> CmdbNamespace {
        CmdbNamespace {
            id,
            bk_biz_id: 2,
            bk_cluster_id: 1,
            cluster_uid: "BCS-K8S-1".into(),
            name: "ns-a".into(),
            labels: labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            resource_quotas: vec![],
        }
    }

    fn fp() -> Fingerprint {
        Fingerprint::cluster_scoped("BCS-K8S-1", "ns-a")
    }

    #[test]
    fn test_create_when_absent() {
        let decision = decide_update(&fp(), &[], ns(0, &[]), |_, _| false).unwrap();
        assert!(matches!(decision, ReconciliationDecision::Create(_)));
    }

    #[test]
    fn test_unchanged_record_is_noop() {
        let decision = decide_update(&fp(), &[ns(5, &[("a", "b")])], ns(0, &[("a", "b")]), |_, _| false)
            .unwrap();
        assert_eq!(decision, ReconciliationDecision::None);
    }

    #[test]
    fn test_changed_labels_produce_diff() {
        let decision = decide_update(&fp(), &[ns(5, &[("a", "b")])], ns(0, &[("a", "c")]), |_, _| false)
            .unwrap();
        match decision {
            ReconciliationDecision::Update { id, diff } => {
                assert_eq!(id, 5);
                assert_eq!(diff.len(), 1);
                assert_eq!(diff["labels"], json!({"a": "c"}));
            }
            other => panic!("unexpected decision {other:?}"),
        }
    }

    #[test]
    fn test_duplicates_are_rejected() {
        let err = decide_update(&fp(), &[ns(1, &[]), ns(2, &[])], ns(0, &[]), |_, _| false).unwrap_err();
        assert_eq!(
            err,
            DecisionError::Duplicate {
                fingerprint: "BCS-K8S-1/ns-a".into(),
                count: 2
            }
        );
        assert!(decide_delete(&fp(), &[ns(1, &[]), ns(2, &[])]).is_err());
    }

    #[test]
    fn test_delete_decisions() {
        assert_eq!(
            decide_delete::<CmdbNamespace>(&fp(), &[]),
            Err(DecisionError::NotFound("BCS-K8S-1/ns-a".into()))
        );
        assert_eq!(
            decide_delete(&fp(), &[ns(4, &[])]),
            Ok(ReconciliationDecision::Delete { id: 4 })
        );
    }

    #[test]
    fn test_replace_predicate_wins_over_update() {
        let stored = CmdbPod {
            id: 8,
            cluster_uid: "BCS-K8S-1".into(),
            namespace: "ns-a".into(),
            name: "p1".into(),
            containers: vec![CmdbContainer {
                name: "app".into(),
                image: "nginx".into(),
                container_uid: "containerd://old".into(),
            }],
            ..Default::default()
        };
        let mut live = stored.clone();
        live.id = 0;
        live.containers[0].container_uid = "containerd://new".into();

        let fp = stored.fingerprint();
        let decision = decide_update(&fp, &[stored], live, |s, l| s.identity_changed(l)).unwrap();
        assert!(matches!(decision, ReconciliationDecision::Replace { id: 8, .. }));
    }

    #[test]
    fn test_diff_fields_treats_missing_as_null() {
        let current = json!({"id": 1, "name": "x"});
        let mut desired = FieldMap::new();
        desired.insert("id".into(), json!(99));
        desired.insert("name".into(), json!("x"));
        desired.insert("note".into(), Value::Null);
        desired.insert("ip".into(), json!("10.0.0.1"));

        let diff = diff_fields(&current, &desired);
        assert_eq!(diff.len(), 1);
        assert_eq!(diff["ip"], json!("10.0.0.1"));
    }

    #[test]
    fn test_create_payload_drops_id() {
        let payload = create_payload(&ns(42, &[])).unwrap();
        assert!(!payload.contains_key("id"));
        assert_eq!(payload["bk_biz_id"], json!(2));
    }
}
