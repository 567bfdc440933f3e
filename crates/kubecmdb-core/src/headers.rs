//! Broker message headers
//!
//! Every change event carries its routing metadata in message headers so
//! the headers exchange can filter on `clusterId` without looking at the
//! body.

use crate::error::CoreError;
use crate::kind::{EventKind, ResourceKind};
use std::collections::BTreeMap;

pub const HEADER_CLUSTER_ID: &str = "clusterId";
pub const HEADER_EVENT: &str = "event";
pub const HEADER_NAMESPACE: &str = "namespace";
pub const HEADER_RESOURCE_NAME: &str = "resourceName";
pub const HEADER_RESOURCE_TYPE: &str = "resourceType";
pub const HEADER_REPUBLISH: &str = "republish";

/// Transport-neutral header value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderValue {
    Str(String),
    Int(i64),
    Bool(bool),
}

impl HeaderValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            Self::Str(s) => s.parse().ok(),
            Self::Bool(_) => None,
        }
    }
}

impl From<&str> for HeaderValue {
    fn from(value: &str) -> Self {
        Self::Str(value.to_string())
    }
}

pub type HeaderMap = BTreeMap<String, HeaderValue>;

/// Decoded routing headers of a change event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventHeaders {
    pub cluster_id: String,
    pub event: EventKind,
    pub namespace: String,
    pub resource_name: String,
    pub resource_type: ResourceKind,
    /// Number of times the message has been republished; absent on first delivery.
    pub republish: Option<i32>,
}

impl EventHeaders {
    pub fn from_map(headers: &HeaderMap) -> Result<Self, CoreError> {
        let cluster_id = required_str(headers, HEADER_CLUSTER_ID)?;
        let event_raw = required_str(headers, HEADER_EVENT)?;
        let event = event_raw.parse().map_err(|_| CoreError::InvalidHeader {
            header: HEADER_EVENT,
            value: event_raw.clone(),
        })?;
        let resource_type = ResourceKind::parse(&required_str(headers, HEADER_RESOURCE_TYPE)?)?;

        let republish = match headers.get(HEADER_REPUBLISH) {
            None => None,
            Some(value) => {
                let count = value
                    .as_int()
                    .and_then(|n| i32::try_from(n).ok())
                    .ok_or_else(|| CoreError::InvalidHeader {
                        header: HEADER_REPUBLISH,
                        value: format!("{value:?}"),
                    })?;
                Some(count)
            }
        };

        Ok(Self {
            cluster_id,
            event,
            namespace: optional_str(headers, HEADER_NAMESPACE),
            resource_name: optional_str(headers, HEADER_RESOURCE_NAME),
            resource_type,
            republish,
        })
    }

    pub fn to_map(&self) -> HeaderMap {
        let mut map = HeaderMap::new();
        map.insert(HEADER_CLUSTER_ID.into(), HeaderValue::Str(self.cluster_id.clone()));
        map.insert(HEADER_EVENT.into(), HeaderValue::Str(self.event.to_string()));
        map.insert(HEADER_NAMESPACE.into(), HeaderValue::Str(self.namespace.clone()));
        map.insert(
            HEADER_RESOURCE_NAME.into(),
            HeaderValue::Str(self.resource_name.clone()),
        );
        map.insert(
            HEADER_RESOURCE_TYPE.into(),
            HeaderValue::Str(self.resource_type.to_string()),
        );
        if let Some(count) = self.republish {
            map.insert(HEADER_REPUBLISH.into(), HeaderValue::Int(i64::from(count)));
        }
        map
    }

    /// Number of times this message has already been republished.
    pub fn republish_count(&self) -> i32 {
        self.republish.unwrap_or(0)
    }
}

fn required_str(headers: &HeaderMap, name: &'static str) -> Result<String, CoreError> {
    match headers.get(name) {
        Some(HeaderValue::Str(s)) if !s.is_empty() => Ok(s.clone()),
        Some(other) => Err(CoreError::InvalidHeader {
            header: name,
            value: format!("{other:?}"),
        }),
        None => Err(CoreError::MissingHeader(name)),
    }
}

fn optional_str(headers: &HeaderMap, name: &str) -> String {
    headers
        .get(name)
        .and_then(HeaderValue::as_str)
        .unwrap_or_default()
        .to_string()
}
