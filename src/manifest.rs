//! Untyped manifests passed between the generator and the apply engine

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::GroupVersionKind;
use kube::Resource;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{Error, Result};

/// A Kubernetes object as apiVersion, kind, metadata and free-form body
///
/// Body keys (`spec`, `data`, ...) are kept in a sorted map so serializing the
/// same manifest twice yields identical bytes.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    /// API version (e.g., "cluster.x-k8s.io/v1alpha4")
    pub api_version: String,
    /// Kind of resource (e.g., "Cluster", "MachineDeployment")
    pub kind: String,
    /// Resource metadata
    pub metadata: ManifestMetadata,
    /// Everything except apiVersion, kind and metadata
    #[serde(flatten)]
    pub body: Map<String, Value>,
}

/// Metadata for a manifest
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct ManifestMetadata {
    /// Name of the resource
    pub name: String,
    /// Namespace (absent for cluster-scoped resources)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    /// Labels
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    /// Annotations
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    /// Owners the garbage collector cascades deletion from
    #[serde(
        default,
        rename = "ownerReferences",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub owner_references: Vec<OwnerReference>,
}

impl Manifest {
    /// Create an empty manifest
    pub fn new(
        api_version: impl Into<String>,
        kind: impl Into<String>,
        name: impl Into<String>,
        namespace: Option<String>,
    ) -> Self {
        Self {
            api_version: api_version.into(),
            kind: kind.into(),
            metadata: ManifestMetadata {
                name: name.into(),
                namespace,
                ..Default::default()
            },
            body: Map::new(),
        }
    }

    /// Set the spec for this manifest
    pub fn with_spec(mut self, spec: Value) -> Self {
        self.body.insert("spec".to_string(), spec);
        self
    }

    /// Convert a typed resource, taking apiVersion/kind from its type
    ///
    /// `status` is dropped; generated objects never carry one.
    pub fn from_resource<K>(resource: &K) -> Result<Self>
    where
        K: Resource<DynamicType = ()> + Serialize,
    {
        let meta = resource.meta();
        let name = meta
            .name
            .clone()
            .ok_or_else(|| Error::internal(format!("{} has no name", K::kind(&()))))?;

        let value = serde_json::to_value(resource)
            .map_err(|e| Error::serialization(format!("{}: {e}", K::kind(&()))))?;
        let mut body = match value {
            Value::Object(map) => map,
            _ => return Err(Error::serialization("resource did not serialize to an object")),
        };
        for key in ["apiVersion", "kind", "metadata", "status"] {
            body.remove(key);
        }

        Ok(Self {
            api_version: K::api_version(&()).into_owned(),
            kind: K::kind(&()).into_owned(),
            metadata: ManifestMetadata {
                name,
                namespace: meta.namespace.clone(),
                labels: meta.labels.clone().unwrap_or_default(),
                annotations: meta.annotations.clone().unwrap_or_default(),
                owner_references: meta.owner_references.clone().unwrap_or_default(),
            },
            body,
        })
    }

    /// Parse the group/version/kind of this manifest
    pub fn gvk(&self) -> GroupVersionKind {
        let (group, version) = parse_api_version(&self.api_version);
        GroupVersionKind::gvk(group, version, &self.kind)
    }

    /// Whether this manifest has the given GVK
    pub fn is(&self, gvk: &GroupVersionKind) -> bool {
        self.api_version == gvk.api_version() && self.kind == gvk.kind
    }

    /// The spec, if any
    pub fn spec(&self) -> Option<&Value> {
        self.body.get("spec")
    }

    /// Serialize the manifest to a JSON value
    pub fn to_value(&self) -> Result<Value> {
        serde_json::to_value(self).map_err(|e| Error::serialization(e.to_string()))
    }

    /// Serialize the manifest to YAML
    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).map_err(|e| Error::serialization(e.to_string()))
    }
}

/// Parse API version into group and version components
pub fn parse_api_version(api_version: &str) -> (&str, &str) {
    match api_version.rsplit_once('/') {
        Some((group, version)) => (group, version),
        // Core API (e.g., "v1")
        None => ("", api_version),
    }
}

/// Split a multi-document YAML stream into manifests
///
/// Empty documents and `List` kinds are flattened the way kubectl does.
pub fn yaml_to_manifests(input: &str) -> Result<Vec<Manifest>> {
    let mut manifests = Vec::new();
    for document in serde_yaml::Deserializer::from_str(input) {
        let value = Value::deserialize(document)
            .map_err(|e| Error::serialization(format!("invalid YAML document: {e}")))?;
        collect_manifests(value, &mut manifests)?;
    }
    Ok(manifests)
}

fn collect_manifests(value: Value, out: &mut Vec<Manifest>) -> Result<()> {
    if value.is_null() {
        return Ok(());
    }

    let is_list = value
        .get("kind")
        .and_then(Value::as_str)
        .is_some_and(|k| k.ends_with("List"));
    if is_list {
        if let Some(Value::Array(items)) = value.get("items") {
            for item in items.clone() {
                collect_manifests(item, out)?;
            }
            return Ok(());
        }
    }

    let manifest: Manifest = serde_json::from_value(value)
        .map_err(|e| Error::serialization(format!("invalid manifest: {e}")))?;
    out.push(manifest);
    Ok(())
}
