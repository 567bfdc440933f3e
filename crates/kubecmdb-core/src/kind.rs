//! Resource and event kinds carried on broker messages

use crate::error::CoreError;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString, IntoStaticStr};

/// Value of the `resourceType` message header.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, EnumIter, IntoStaticStr,
)]
pub enum ResourceKind {
    Pod,
    Deployment,
    StatefulSet,
    DaemonSet,
    GameDeployment,
    GameStatefulSet,
    Namespace,
    Node,
    /// Kubernetes core `Event`; only `BackOff` events are acted upon.
    Event,
}

impl ResourceKind {
    pub fn parse(value: &str) -> Result<Self, CoreError> {
        value
            .parse()
            .map_err(|_| CoreError::UnknownKind(value.to_string()))
    }

    pub fn as_workload(self) -> Option<WorkloadKind> {
        WorkloadKind::try_from(self).ok()
    }
}

/// The five workload kinds mirrored into CMDB.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display, EnumString, EnumIter,
)]
pub enum WorkloadKind {
    Deployment,
    StatefulSet,
    DaemonSet,
    GameDeployment,
    GameStatefulSet,
}

impl WorkloadKind {
    /// API group/version the kind is served from.
    pub fn api_version(self) -> &'static str {
        match self {
            Self::Deployment | Self::StatefulSet | Self::DaemonSet => "apps/v1",
            Self::GameDeployment | Self::GameStatefulSet => "tkex.tencent.com/v1alpha1",
        }
    }

    pub fn plural(self) -> &'static str {
        match self {
            Self::Deployment => "deployments",
            Self::StatefulSet => "statefulsets",
            Self::DaemonSet => "daemonsets",
            Self::GameDeployment => "gamedeployments",
            Self::GameStatefulSet => "gamestatefulsets",
        }
    }

    /// Kind name as it appears in a pod's workload reference in CMDB.
    pub fn ref_kind(self) -> &'static str {
        match self {
            Self::Deployment => "deployment",
            Self::StatefulSet => "statefulSet",
            Self::DaemonSet => "daemonSet",
            Self::GameDeployment => "gameDeployment",
            Self::GameStatefulSet => "gameStatefulSet",
        }
    }

    /// Resolve an owner-reference kind that names a workload directly.
    pub fn from_owner_kind(kind: &str) -> Option<Self> {
        kind.parse().ok()
    }
}

impl TryFrom<ResourceKind> for WorkloadKind {
    type Error = CoreError;

    fn try_from(kind: ResourceKind) -> Result<Self, Self::Error> {
        match kind {
            ResourceKind::Deployment => Ok(Self::Deployment),
            ResourceKind::StatefulSet => Ok(Self::StatefulSet),
            ResourceKind::DaemonSet => Ok(Self::DaemonSet),
            ResourceKind::GameDeployment => Ok(Self::GameDeployment),
            ResourceKind::GameStatefulSet => Ok(Self::GameStatefulSet),
            other => Err(CoreError::NotAWorkload(other.to_string())),
        }
    }
}

/// Value of the `event` message header.
///
/// The upstream producer does not distinguish create from update, so both
/// arrive as `update`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Update,
    Delete,
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn test_resource_kind_round_trips_header_names() {
        for kind in ResourceKind::iter() {
            assert_eq!(ResourceKind::parse(&kind.to_string()), Ok(kind));
        }
        assert!(ResourceKind::parse("CronJob").is_err());
    }

    #[test]
    fn test_workload_conversion() {
        assert_eq!(
            WorkloadKind::try_from(ResourceKind::GameStatefulSet),
            Ok(WorkloadKind::GameStatefulSet)
        );
        assert!(WorkloadKind::try_from(ResourceKind::Pod).is_err());
        assert_eq!(ResourceKind::Node.as_workload(), None);
        assert_eq!(WorkloadKind::from_owner_kind("ReplicaSet"), None);
        assert_eq!(
            WorkloadKind::from_owner_kind("DaemonSet"),
            Some(WorkloadKind::DaemonSet)
        );
    }

    #[test]
    fn test_event_kind_is_lowercase() {
        assert_eq!("delete".parse::<EventKind>(), Ok(EventKind::Delete));
        assert_eq!(EventKind::Update.to_string(), "update");
        assert!("Update".parse::<EventKind>().is_err());
    }
}
