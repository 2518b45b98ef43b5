//! RKE control-plane and bootstrap resources (`rke.cattle.io/v1`)

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{set_condition, Condition, Endpoint};

/// Specification for an RKE control plane
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "rke.cattle.io",
    version = "v1",
    kind = "RKECluster",
    plural = "rkeclusters",
    status = "RKEClusterStatus",
    namespaced,
    printcolumn = r#"{"name":"Ready","type":"boolean","jsonPath":".status.ready"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct RKEClusterSpec {
    /// API server endpoint, defaulted to `localhost:6443`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub control_plane_endpoint: Option<Endpoint>,

    /// Cloud credential secret name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cloud_credential_secret_name: Option<String>,

    /// Kubernetes version
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kubernetes_version: Option<String>,

    /// Upgrade strategy (currently no tunables)
    #[serde(default)]
    pub upgrade_strategy: UpgradeStrategy,

    /// Name of the management cluster record this control plane belongs to
    #[serde(default)]
    pub management_cluster_name: String,
}

/// Placeholder for control plane upgrade tunables
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct UpgradeStrategy {}

/// Status for an RKE control plane
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RKEClusterStatus {
    /// Control plane is ready to serve
    #[serde(default)]
    pub ready: bool,

    /// Generation of the spec last acted on
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Conditions representing the control plane state
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl RKEClusterStatus {
    /// Mark the control plane ready and return self for chaining
    pub fn ready(mut self) -> Self {
        self.ready = true;
        self
    }

    /// Add a condition and return self for chaining
    pub fn condition(mut self, condition: Condition) -> Self {
        set_condition(&mut self.conditions, condition);
        self
    }
}

/// Specification for an RKE bootstrap template
///
/// Machines reference the template by name; it carries no settings yet.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "rke.cattle.io",
    version = "v1",
    kind = "RKEBootstrapTemplate",
    plural = "rkebootstraptemplates",
    namespaced
)]
pub struct RKEBootstrapTemplateSpec {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::types::ConditionStatus;

    #[test]
    fn empty_upgrade_strategy_serializes_as_object() {
        let spec = RKEClusterSpec {
            management_cluster_name: "c-m-1".to_string(),
            ..Default::default()
        };
        let value = serde_json::to_value(&spec).expect("serialize");
        assert_eq!(value["upgradeStrategy"], serde_json::json!({}));
        assert_eq!(value["managementClusterName"], "c-m-1");
        assert!(value.get("controlPlaneEndpoint").is_none());
    }

    #[test]
    fn ready_status_keeps_single_condition() {
        let status = RKEClusterStatus::default()
            .ready()
            .condition(Condition::new("Ready", ConditionStatus::True, "Active", ""))
            .condition(Condition::new("Ready", ConditionStatus::True, "Active", ""));
        assert!(status.ready);
        assert_eq!(status.conditions.len(), 1);
    }
}
