//! Cluster Custom Resource Definition
//!
//! A `Cluster` is the user-facing declaration of a downstream cluster. It is
//! either provisioned from node pools (`rkeConfig`) or adopted from an existing
//! kubeconfig (`importedConfig` / `clusterAPIConfig`).

use std::collections::BTreeSet;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{set_condition, Condition, NodePool};
use crate::naming;

/// Specification for a Cluster
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "rancher.cattle.io",
    version = "v1",
    kind = "Cluster",
    plural = "clusters",
    status = "ClusterStatus",
    namespaced,
    printcolumn = r#"{"name":"Ready","type":"boolean","jsonPath":".status.ready"}"#,
    printcolumn = r#"{"name":"ClusterName","type":"string","jsonPath":".status.clusterName"}"#,
    printcolumn = r#"{"name":"K8s","type":"string","jsonPath":".spec.kubernetesVersion"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpec {
    /// Kubernetes version to install on provisioned nodes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kubernetes_version: Option<String>,

    /// Cloud credential secret used by the control plane
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cloud_credential_secret_name: Option<String>,

    /// Adopt an existing cluster through a saved kubeconfig
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub imported_config: Option<ImportedConfig>,

    /// Adopt a cluster created by Cluster API
    #[serde(
        default,
        rename = "clusterAPIConfig",
        skip_serializing_if = "Option::is_none"
    )]
    pub cluster_api_config: Option<ClusterApiConfig>,

    /// Provision the cluster from node pools
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rke_config: Option<RkeConfig>,
}

/// Kubeconfig location for an imported cluster
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ImportedConfig {
    /// Secret (in the cluster's namespace) whose `value` key holds a kubeconfig
    #[serde(default)]
    pub kube_config_secret_name: String,
}

/// Reference to a Cluster API cluster
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterApiConfig {
    /// Name of the Cluster API `Cluster` in the same namespace
    pub cluster_name: String,
}

/// Node pool layout of a provisioned cluster
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RkeConfig {
    /// Machine pools
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub node_pools: Vec<NodePool>,
}

impl ClusterSpec {
    /// Validate the cluster specification
    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.rke_config.is_some() && self.is_imported() {
            return Err(crate::Error::validation(
                "rkeConfig cannot be combined with importedConfig or clusterAPIConfig",
            ));
        }

        if let Some(rke) = &self.rke_config {
            let mut seen = BTreeSet::new();
            for pool in &rke.node_pools {
                if pool.name.is_empty() {
                    continue;
                }
                if !seen.insert(pool.name.as_str()) {
                    return Err(crate::Error::validation(format!(
                        "node pool name '{}' is used more than once",
                        pool.name
                    )));
                }
            }
        }

        if let Some(capi) = &self.cluster_api_config {
            if capi.cluster_name.is_empty() {
                return Err(crate::Error::validation(
                    "clusterAPIConfig.clusterName must not be empty",
                ));
            }
        }

        Ok(())
    }

    /// The kubeconfig secret to import from, if this cluster is adopted
    ///
    /// A Cluster API reference takes precedence and implies the secret Cluster
    /// API writes for that cluster.
    pub fn imported_kubeconfig_secret(&self) -> Option<String> {
        if let Some(capi) = &self.cluster_api_config {
            return Some(naming::kubeconfig_secret_name(&capi.cluster_name));
        }
        self.imported_config
            .as_ref()
            .map(|c| c.kube_config_secret_name.clone())
    }

    /// Whether the cluster is adopted rather than provisioned
    pub fn is_imported(&self) -> bool {
        self.imported_kubeconfig_secret().is_some()
    }
}

/// Status for a Cluster
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterStatus {
    /// Name of the backing management cluster record
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_name: Option<String>,

    /// The import agent manifest was applied to the downstream cluster
    #[serde(default)]
    pub agent_deployed: bool,

    /// The cluster is ready
    #[serde(default)]
    pub ready: bool,

    /// Generation of the spec last acted on
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Conditions representing the cluster state
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl ClusterStatus {
    /// Set the management cluster name and return self for chaining
    pub fn cluster_name(mut self, name: impl Into<String>) -> Self {
        self.cluster_name = Some(name.into());
        self
    }

    /// Set the agent flag and return self for chaining
    pub fn agent_deployed(mut self, deployed: bool) -> Self {
        self.agent_deployed = deployed;
        self
    }

    /// Set the observed generation and return self for chaining
    pub fn observed_generation(mut self, generation: Option<i64>) -> Self {
        self.observed_generation = generation;
        self
    }

    /// Add a condition and return self for chaining
    pub fn condition(mut self, condition: Condition) -> Self {
        set_condition(&mut self.conditions, condition);
        self
    }

    /// The management cluster name, if one has been assigned
    pub fn management_cluster(&self) -> Option<&str> {
        self.cluster_name.as_deref().filter(|n| !n.is_empty())
    }
}

impl Cluster {
    /// The management cluster name from status, if assigned
    pub fn management_cluster(&self) -> Option<&str> {
        self.status.as_ref().and_then(|s| s.management_cluster())
    }

    /// Whether the import agent has already been applied
    pub fn agent_deployed(&self) -> bool {
        self.status.as_ref().is_some_and(|s| s.agent_deployed)
    }
}
