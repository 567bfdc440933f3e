//! CMDB property filters
//!
//! Queries against CMDB collections carry a filter of the form
//! `{"condition": "AND", "rules": [{"field", "operator", "value"}]}`.
//! The same filter can be evaluated locally against a JSON record, which the
//! in-memory CMDB used in tests relies on.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum Condition {
    #[default]
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    Equal,
    NotEqual,
    In,
    NotIn,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub field: String,
    pub operator: Operator,
    pub value: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct PropertyFilter {
    pub condition: Condition,
    pub rules: Vec<Rule>,
}

impl PropertyFilter {
    /// An `AND` filter with no rules; matches everything.
    pub fn all() -> Self {
        Self::default()
    }

    pub fn equal(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.rules.push(Rule {
            field: field.into(),
            operator: Operator::Equal,
            value: value.into(),
        });
        self
    }

    pub fn is_in<V: Into<Value>>(
        mut self,
        field: impl Into<String>,
        values: impl IntoIterator<Item = V>,
    ) -> Self {
        self.rules.push(Rule {
            field: field.into(),
            operator: Operator::In,
            value: Value::Array(values.into_iter().map(Into::into).collect()),
        });
        self
    }

    /// Evaluate the filter against a JSON record.
    ///
    /// Fields may use dotted paths (`ref.kind`). A missing field compares
    /// as `null`.
    pub fn matches(&self, record: &Value) -> bool {
        let mut results = self.rules.iter().map(|rule| rule.matches(record));
        match self.condition {
            Condition::And => results.all(|m| m),
            Condition::Or => self.rules.is_empty() || results.any(|m| m),
        }
    }
}

impl Rule {
    fn matches(&self, record: &Value) -> bool {
        let actual = lookup(record, &self.field).unwrap_or(&Value::Null);
        match self.operator {
            Operator::Equal => actual == &self.value,
            Operator::NotEqual => actual != &self.value,
            Operator::In => self
                .value
                .as_array()
                .is_some_and(|values| values.contains(actual)),
            Operator::NotIn => !self
                .value
                .as_array()
                .is_some_and(|values| values.contains(actual)),
        }
    }
}

fn lookup<'a>(record: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(record, |value, key| value.get(key))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_wire_shape() {
        let filter = PropertyFilter::all()
            .equal("cluster_uid", "BCS-K8S-1")
            .is_in("id", [1, 2]);
        assert_eq!(
            serde_json::to_value(&filter).unwrap(),
            json!({
                "condition": "AND",
                "rules": [
                    {"field": "cluster_uid", "operator": "equal", "value": "BCS-K8S-1"},
                    {"field": "id", "operator": "in", "value": [1, 2]}
                ]
            })
        );
    }

    #[test]
    fn test_matches() {
        let record = json!({"id": 7, "namespace": "ns-a", "ref": {"kind": "deployment"}});

        assert!(PropertyFilter::all().matches(&record));
        assert!(PropertyFilter::all().equal("namespace", "ns-a").matches(&record));
        assert!(!PropertyFilter::all().equal("namespace", "ns-b").matches(&record));
        assert!(PropertyFilter::all().is_in("id", [5, 7]).matches(&record));
        assert!(PropertyFilter::all()
            .equal("ref.kind", "deployment")
            .matches(&record));
        assert!(!PropertyFilter::all().equal("missing", "x").matches(&record));
    }

    #[test]
    fn test_or_condition() {
        let record = json!({"name": "a"});
        let filter = PropertyFilter {
            condition: Condition::Or,
            rules: vec![
                Rule { field: "name".into(), operator: Operator::Equal, value: json!("b") },
                Rule { field: "name".into(), operator: Operator::NotIn, value: json!(["c"]) },
            ],
        };
        assert!(filter.matches(&record));
    }
}
