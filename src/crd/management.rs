//! Management API resources (`management.cattle.io/v3`)
//!
//! These are owned by the management server. The provisioner creates
//! management clusters, registration tokens, users and tokens, and reads
//! settings and dynamic schemas.

use std::borrow::Cow;
use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::core::ClusterResourceScope;
use kube::{CustomResource, Resource};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Group of the management API
pub const MANAGEMENT_GROUP: &str = "management.cattle.io";
/// Version of the management API
pub const MANAGEMENT_VERSION: &str = "v3";

/// Specification for a management cluster record
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "management.cattle.io",
    version = "v3",
    kind = "Cluster",
    plural = "clusters"
)]
#[serde(rename_all = "camelCase")]
pub struct ManagementClusterSpec {
    /// Name shown in the UI
    #[serde(default)]
    pub display_name: String,

    /// Fleet workspace the cluster is assigned to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fleet_workspace_name: Option<String>,

    /// Present when the cluster is registered through the import agent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub imported_config: Option<ManagementImportedConfig>,
}

/// Marker for imported management clusters
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct ManagementImportedConfig {}

/// Specification for a cluster registration token
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "management.cattle.io",
    version = "v3",
    kind = "ClusterRegistrationToken",
    plural = "clusterregistrationtokens",
    status = "ClusterRegistrationTokenStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterRegistrationTokenSpec {
    /// Management cluster the token registers
    pub cluster_name: String,
}

/// Status for a cluster registration token
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct ClusterRegistrationTokenStatus {
    /// Secret token value, filled in asynchronously by the management server
    #[serde(default)]
    pub token: String,
}

impl ClusterRegistrationToken {
    /// The token value, if the management server has populated it
    pub fn value(&self) -> Option<&str> {
        self.status
            .as_ref()
            .map(|s| s.token.as_str())
            .filter(|t| !t.is_empty())
    }
}

/// Specification for a dynamic schema
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "management.cattle.io",
    version = "v3",
    kind = "DynamicSchema",
    plural = "dynamicschemas"
)]
#[serde(rename_all = "camelCase")]
pub struct DynamicSchemaSpec {
    /// Declared fields, keyed by field name
    #[serde(default)]
    pub resource_fields: BTreeMap<String, serde_json::Value>,
}

/// Implements [`kube::Resource`] for a cluster-scoped management type whose
/// fields live at the top level instead of under `spec`.
macro_rules! management_resource {
    ($ty:ident, $kind:literal, $plural:literal) => {
        impl Resource for $ty {
            type DynamicType = ();
            type Scope = ClusterResourceScope;

            fn kind(_: &()) -> Cow<'_, str> {
                Cow::Borrowed($kind)
            }

            fn group(_: &()) -> Cow<'_, str> {
                Cow::Borrowed(MANAGEMENT_GROUP)
            }

            fn version(_: &()) -> Cow<'_, str> {
                Cow::Borrowed(MANAGEMENT_VERSION)
            }

            fn plural(_: &()) -> Cow<'_, str> {
                Cow::Borrowed($plural)
            }

            fn meta(&self) -> &ObjectMeta {
                &self.metadata
            }

            fn meta_mut(&mut self) -> &mut ObjectMeta {
                &mut self.metadata
            }
        }
    };
}

fn management_api_version() -> String {
    format!("{MANAGEMENT_GROUP}/{MANAGEMENT_VERSION}")
}

/// A management user
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct User {
    /// API version
    #[serde(default = "management_api_version")]
    pub api_version: String,
    /// Kind
    #[serde(default)]
    pub kind: String,
    /// Standard object metadata
    #[serde(default)]
    pub metadata: ObjectMeta,
    /// Principals this user authenticates as
    #[serde(default, rename = "principalIds", skip_serializing_if = "Vec::is_empty")]
    pub principal_ids: Vec<String>,
}

management_resource!(User, "User", "users");

impl User {
    /// Create a user with the given name, labels and principals
    pub fn new(
        name: impl Into<String>,
        labels: BTreeMap<String, String>,
        principal_ids: Vec<String>,
    ) -> Self {
        Self {
            api_version: management_api_version(),
            kind: "User".to_string(),
            metadata: ObjectMeta {
                name: Some(name.into()),
                labels: Some(labels),
                ..Default::default()
            },
            principal_ids,
        }
    }
}

/// A management API bearer token
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Token {
    /// API version
    #[serde(default = "management_api_version")]
    pub api_version: String,
    /// Kind
    #[serde(default)]
    pub kind: String,
    /// Standard object metadata
    #[serde(default)]
    pub metadata: ObjectMeta,
    /// Owning user
    #[serde(default)]
    pub user_id: String,
    /// Authentication provider that issued the token
    #[serde(default)]
    pub auth_provider: String,
    /// Token was derived from another credential rather than a login
    #[serde(default)]
    pub is_derived: bool,
    /// Token secret, cleartext or `$2:<salt>:<hash>`
    #[serde(default)]
    pub token: String,
}

management_resource!(Token, "Token", "tokens");

impl Token {
    /// Create a token with an empty secret; see [`crate::kubeconfig::token`]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            api_version: management_api_version(),
            kind: "Token".to_string(),
            metadata: ObjectMeta {
                name: Some(name.into()),
                ..Default::default()
            },
            ..Default::default()
        }
    }
}

/// A management server setting
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct Setting {
    /// API version
    #[serde(default = "management_api_version", rename = "apiVersion")]
    pub api_version: String,
    /// Kind
    #[serde(default)]
    pub kind: String,
    /// Standard object metadata
    #[serde(default)]
    pub metadata: ObjectMeta,
    /// Explicit value
    #[serde(default)]
    pub value: String,
    /// Value used when `value` is empty
    #[serde(default)]
    pub default: String,
}

management_resource!(Setting, "Setting", "settings");

impl Setting {
    /// The value in effect: `value`, or `default` when unset
    pub fn effective(&self) -> &str {
        if self.value.is_empty() {
            &self.default
        } else {
            &self.value
        }
    }
}
