//! Supporting types shared by the provisioning CRDs

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{ObjectReference, Taint};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// API version assumed for node config references that omit one
pub const DEFAULT_NODE_CONFIG_API_VERSION: &str = "rancher.cattle.io/v1";

/// Condition status following Kubernetes conventions
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    /// Condition is true
    True,
    /// Condition is false
    False,
    /// Condition status is unknown
    #[default]
    Unknown,
}

impl std::fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::True => write!(f, "True"),
            Self::False => write!(f, "False"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Kubernetes-style condition for status reporting
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct Condition {
    /// Type of condition (e.g., Ready, Provisioned)
    #[serde(rename = "type")]
    pub type_: String,

    /// Status of the condition (True, False, Unknown)
    pub status: ConditionStatus,

    /// Machine-readable reason for the condition
    pub reason: String,

    /// Human-readable message
    pub message: String,

    /// Last time the condition transitioned
    #[serde(rename = "lastTransitionTime")]
    pub last_transition_time: DateTime<Utc>,
}

impl Condition {
    /// Create a new condition with the current timestamp
    pub fn new(
        type_: impl Into<String>,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            type_: type_.into(),
            status,
            reason: reason.into(),
            message: message.into(),
            last_transition_time: Utc::now(),
        }
    }
}

/// Insert `condition`, replacing any existing condition of the same type
///
/// The transition time is kept when the status did not change.
pub(crate) fn set_condition(conditions: &mut Vec<Condition>, mut condition: Condition) {
    if let Some(existing) = conditions.iter().find(|c| c.type_ == condition.type_) {
        if existing.status == condition.status {
            condition.last_transition_time = existing.last_transition_time;
        }
    }
    conditions.retain(|c| c.type_ != condition.type_);
    conditions.push(condition);
}

/// Host and port of a cluster's API server
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct Endpoint {
    /// Hostname or IP
    pub host: String,
    /// Port
    pub port: i32,
}

/// Node settings that are copied verbatim into every machine of a pool
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CommonNodeConfig {
    /// Kubernetes labels applied to the nodes
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,

    /// Taints applied to the nodes
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub taints: Vec<Taint>,

    /// Cloud credential used to create the machines of this pool
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cloud_credential_secret_name: Option<String>,
}

/// Rolling update policy for a node pool
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RollingUpdate {
    /// Maximum number of machines that can be unavailable during the update
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_unavailable: Option<IntOrString>,

    /// Maximum number of machines that can be created above the desired count
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_surge: Option<IntOrString>,
}

/// A homogeneous group of machines within a cluster
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NodePool {
    /// Labels, taints and credentials shared by every node in the pool
    #[serde(flatten)]
    pub common: CommonNodeConfig,

    /// Pool name, unique within the cluster
    #[serde(default)]
    pub name: String,

    /// Reference to the infrastructure config object (e.g. a DigitaloceanConfig)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_config: Option<ObjectReference>,

    /// Desired number of machines
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quantity: Option<i32>,

    /// Stop reconciling machines in this pool
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub paused: bool,

    /// Run etcd on these nodes (defaults to true)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etcd_role: Option<bool>,

    /// Run the control plane on these nodes (defaults to true)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub control_plane_role: Option<bool>,

    /// Run workloads on these nodes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_role: Option<bool>,

    /// Rolling update policy for the machine deployment
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rolling_update: Option<RollingUpdate>,
}

impl NodePool {
    /// Whether nodes in this pool carry the etcd role
    pub fn is_etcd(&self) -> bool {
        self.etcd_role.unwrap_or(true)
    }

    /// Whether nodes in this pool carry the control-plane role
    pub fn is_control_plane(&self) -> bool {
        self.control_plane_role.unwrap_or(true)
    }

    /// The node config reference, if it names both a kind and an object
    ///
    /// Pools without a complete reference produce no machines.
    pub fn complete_node_config(&self) -> Option<&ObjectReference> {
        if self.name.is_empty() {
            return None;
        }
        self.node_config.as_ref().filter(|r| {
            r.name.as_deref().is_some_and(|n| !n.is_empty())
                && r.kind.as_deref().is_some_and(|k| !k.is_empty())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reference(kind: Option<&str>, name: Option<&str>) -> ObjectReference {
        ObjectReference {
            kind: kind.map(String::from),
            name: name.map(String::from),
            ..Default::default()
        }
    }

    mod node_pool {
        use super::*;

        #[test]
        fn roles_default_to_true() {
            let pool = NodePool::default();
            assert!(pool.is_etcd());
            assert!(pool.is_control_plane());
        }

        #[test]
        fn explicit_false_disables_role() {
            let pool = NodePool {
                etcd_role: Some(false),
                control_plane_role: Some(false),
                ..Default::default()
            };
            assert!(!pool.is_etcd());
            assert!(!pool.is_control_plane());
        }

        #[test]
        fn complete_reference_requires_name_and_kind() {
            let mut pool = NodePool {
                name: "pool-a".to_string(),
                node_config: Some(reference(Some("DigitaloceanConfig"), Some("dc"))),
                ..Default::default()
            };
            assert!(pool.complete_node_config().is_some());

            pool.node_config = Some(reference(Some(""), Some("dc")));
            assert!(pool.complete_node_config().is_none());

            pool.node_config = Some(reference(Some("DigitaloceanConfig"), None));
            assert!(pool.complete_node_config().is_none());

            pool.node_config = None;
            assert!(pool.complete_node_config().is_none());
        }

        #[test]
        fn unnamed_pool_is_incomplete() {
            let pool = NodePool {
                node_config: Some(reference(Some("DigitaloceanConfig"), Some("dc"))),
                ..Default::default()
            };
            assert!(pool.complete_node_config().is_none());
        }

        #[test]
        fn yaml_uses_flat_common_fields() {
            let yaml = r#"
name: pool-a
quantity: 3
controlPlaneRole: true
etcdRole: false
labels:
  tier: frontend
cloudCredentialSecretName: do-creds
nodeConfig:
  kind: DigitaloceanConfig
  name: dc
rollingUpdate:
  maxSurge: 1
  maxUnavailable: "25%"
"#;
            let pool: NodePool = serde_yaml::from_str(yaml).expect("pool should parse");
            assert_eq!(pool.name, "pool-a");
            assert_eq!(pool.quantity, Some(3));
            assert_eq!(pool.common.labels.get("tier").map(String::as_str), Some("frontend"));
            assert_eq!(
                pool.common.cloud_credential_secret_name.as_deref(),
                Some("do-creds")
            );
            let rolling = pool.rolling_update.expect("rolling update");
            assert_eq!(rolling.max_surge, Some(IntOrString::Int(1)));
            assert_eq!(
                rolling.max_unavailable,
                Some(IntOrString::String("25%".to_string()))
            );
        }
    }

    mod conditions {
        use super::*;

        #[test]
        fn same_status_keeps_transition_time() {
            let mut conditions = Vec::new();
            let first = Condition::new("Ready", ConditionStatus::True, "Active", "");
            let stamp = first.last_transition_time;
            set_condition(&mut conditions, first);

            let mut again = Condition::new("Ready", ConditionStatus::True, "Active", "still");
            again.last_transition_time = stamp + chrono::Duration::seconds(30);
            set_condition(&mut conditions, again);

            assert_eq!(conditions.len(), 1);
            assert_eq!(conditions[0].last_transition_time, stamp);
            assert_eq!(conditions[0].message, "still");
        }

        #[test]
        fn status_change_replaces_condition() {
            let mut conditions = Vec::new();
            set_condition(
                &mut conditions,
                Condition::new("Ready", ConditionStatus::False, "Waiting", ""),
            );
            set_condition(
                &mut conditions,
                Condition::new("Ready", ConditionStatus::True, "Active", ""),
            );
            assert_eq!(conditions.len(), 1);
            assert_eq!(conditions[0].status, ConditionStatus::True);
        }
    }
}
