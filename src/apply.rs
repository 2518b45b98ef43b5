//! Declarative apply of labelled object sets
//!
//! An [`ObjectSet`] is every object one owner wants to exist under a set id.
//! Applying it server-side-applies each object with a label derived from the
//! set id and owner, then deletes objects of the set's prune types that still
//! carry the label but are no longer desired. Objects in the owner's namespace
//! also get an owner reference so they are garbage collected with it.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use aws_lc_rs::digest::{digest, SHA256};
use data_encoding::HEXLOWER;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::{
    Api, ApiResource, DeleteParams, DynamicObject, GroupVersionKind, ListParams, Patch,
    PatchParams,
};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::discovery::{self, Scope};
use kube::{Client, Config, Resource, ResourceExt};
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

use crate::manifest::Manifest;
use crate::{Error, Result};

/// Label tying an object to the set that applied it
pub const SET_HASH_LABEL: &str = "objectset.rio.cattle.io/hash";
/// Annotation recording the set id
pub const SET_ID_ANNOTATION: &str = "objectset.rio.cattle.io/id";
/// Annotation recording the owner's name
pub const OWNER_NAME_ANNOTATION: &str = "objectset.rio.cattle.io/owner-name";
/// Annotation recording the owner's namespace
pub const OWNER_NAMESPACE_ANNOTATION: &str = "objectset.rio.cattle.io/owner-namespace";

/// Field manager for server-side apply
pub const FIELD_MANAGER: &str = "cluster-provisioner";

/// Objects applied together under one set id and owner
#[derive(Clone, Debug, PartialEq)]
pub struct ObjectSet {
    /// Set id (e.g., "rke-cluster")
    pub set_id: String,
    /// Namespace of the owning object
    pub owner_namespace: String,
    /// Name of the owning object
    pub owner_name: String,
    /// Desired objects in apply order
    pub objects: Vec<Manifest>,
    /// Types whose stale members are deleted after apply
    pub prune_types: Vec<GroupVersionKind>,
    /// Reference stamped on objects in the owner's namespace
    pub owner: Option<OwnerReference>,
}

impl ObjectSet {
    /// Create an empty set for an owner
    pub fn new(
        set_id: impl Into<String>,
        owner_namespace: impl Into<String>,
        owner_name: impl Into<String>,
    ) -> Self {
        Self {
            set_id: set_id.into(),
            owner_namespace: owner_namespace.into(),
            owner_name: owner_name.into(),
            objects: Vec::new(),
            prune_types: Vec::new(),
            owner: None,
        }
    }

    /// Make `owner` a non-controller owner of the set's namespaced objects
    ///
    /// Owners without a uid yield no reference and the set stays unowned.
    pub fn with_owner<K>(mut self, owner: &K) -> Self
    where
        K: Resource<DynamicType = ()>,
    {
        self.owner = owner.owner_ref(&()).map(|reference| OwnerReference {
            controller: Some(false),
            block_owner_deletion: Some(false),
            ..reference
        });
        self
    }

    /// Set the desired objects
    pub fn with_objects(mut self, objects: Vec<Manifest>) -> Self {
        self.objects = objects;
        self
    }

    /// Set the prune types
    pub fn with_prune_types(mut self, prune_types: Vec<GroupVersionKind>) -> Self {
        self.prune_types = prune_types;
        self
    }

    /// Value of [`SET_HASH_LABEL`] for this set
    ///
    /// First 40 hex characters of SHA-256 over `id/namespace/name`, which
    /// keeps it within the label value limit.
    pub fn hash(&self) -> String {
        let input = format!(
            "{}/{}/{}",
            self.set_id, self.owner_namespace, self.owner_name
        );
        let hash = HEXLOWER.encode(digest(&SHA256, input.as_bytes()).as_ref());
        hash[..40].to_string()
    }

    /// Label selector matching every object of this set
    pub fn selector(&self) -> String {
        format!("{SET_HASH_LABEL}={}", self.hash())
    }

    /// The desired objects with the set label and owner annotations added
    pub fn labelled_objects(&self) -> Vec<Manifest> {
        let hash = self.hash();
        self.objects
            .iter()
            .cloned()
            .map(|mut object| {
                object
                    .metadata
                    .labels
                    .insert(SET_HASH_LABEL.to_string(), hash.clone());
                let annotations = &mut object.metadata.annotations;
                annotations.insert(SET_ID_ANNOTATION.to_string(), self.set_id.clone());
                annotations.insert(OWNER_NAME_ANNOTATION.to_string(), self.owner_name.clone());
                annotations.insert(
                    OWNER_NAMESPACE_ANNOTATION.to_string(),
                    self.owner_namespace.clone(),
                );
                if let Some(owner) = self.owned_reference(&object) {
                    object.metadata.owner_references.push(owner);
                }
                object
            })
            .collect()
    }

    /// The owner reference `object` is missing, if it lives with the owner
    ///
    /// Cross-namespace and cluster-scoped owner references are invalid, so
    /// those objects are only tracked by label.
    fn owned_reference(&self, object: &Manifest) -> Option<OwnerReference> {
        let owner = self.owner.as_ref()?;
        if object.metadata.namespace.as_deref() != Some(self.owner_namespace.as_str()) {
            return None;
        }
        let present = object
            .metadata
            .owner_references
            .iter()
            .any(|existing| existing.uid == owner.uid);
        (!present).then(|| owner.clone())
    }

    /// Whether an observed object of `gvk` is still wanted
    pub fn contains(&self, gvk: &GroupVersionKind, namespace: Option<&str>, name: &str) -> bool {
        self.objects.iter().any(|object| {
            object.is(gvk)
                && object.metadata.name == name
                && (namespace.is_none() || object.metadata.namespace.as_deref() == namespace)
        })
    }

    /// Distinct types of the desired objects, in first-seen order
    pub fn object_types(&self) -> Vec<GroupVersionKind> {
        let mut seen = BTreeSet::new();
        self.objects
            .iter()
            .map(Manifest::gvk)
            .filter(|gvk| seen.insert((gvk.group.clone(), gvk.version.clone(), gvk.kind.clone())))
            .collect()
    }
}

/// Applies object sets to a cluster
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Applier: Send + Sync {
    /// Create or update every object of the set, then prune stale ones
    async fn apply(&self, set: &ObjectSet) -> Result<()>;
}

/// Builds appliers for clusters reached through a kubeconfig
#[cfg_attr(test, automock)]
#[async_trait]
pub trait TargetApplierFactory: Send + Sync {
    /// An applier talking to the cluster described by `kubeconfig`
    async fn for_kubeconfig(&self, kubeconfig: &[u8]) -> Result<Arc<dyn Applier>>;
}

/// [`Applier`] using server-side apply and API discovery
pub struct KubeApplier {
    client: Client,
}

impl KubeApplier {
    /// Create a new KubeApplier
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn resolve(&self, gvk: &GroupVersionKind) -> Result<(ApiResource, Scope)> {
        let (ar, caps) = discovery::pinned_kind(&self.client, gvk).await?;
        Ok((ar, caps.scope))
    }

    fn api_for(
        &self,
        ar: &ApiResource,
        scope: &Scope,
        namespace: Option<&str>,
    ) -> Api<DynamicObject> {
        match (scope, namespace) {
            (Scope::Namespaced, Some(ns)) => Api::namespaced_with(self.client.clone(), ns, ar),
            (Scope::Namespaced, None) => {
                Api::namespaced_with(self.client.clone(), self.client.default_namespace(), ar)
            }
            (Scope::Cluster, _) => Api::all_with(self.client.clone(), ar),
        }
    }

    async fn apply_object(&self, manifest: &Manifest) -> Result<()> {
        let (ar, scope) = self.resolve(&manifest.gvk()).await?;
        let api = self.api_for(&ar, &scope, manifest.metadata.namespace.as_deref());

        let object: DynamicObject = serde_json::from_value(manifest.to_value()?)
            .map_err(|e| Error::serialization(e.to_string()))?;
        api.patch(
            &manifest.metadata.name,
            &PatchParams::apply(FIELD_MANAGER).force(),
            &Patch::Apply(&object),
        )
        .await?;

        debug!(
            kind = %manifest.kind,
            name = %manifest.metadata.name,
            namespace = ?manifest.metadata.namespace,
            "applied object"
        );
        Ok(())
    }

    async fn prune(&self, set: &ObjectSet, gvk: &GroupVersionKind) -> Result<()> {
        let (ar, scope) = self.resolve(gvk).await?;
        let listed = Api::<DynamicObject>::all_with(self.client.clone(), &ar)
            .list(&ListParams::default().labels(&set.selector()))
            .await?;

        for stale in listed.items {
            let name = stale.name_any();
            let namespace = stale.namespace();
            if set.contains(gvk, namespace.as_deref(), &name) {
                continue;
            }

            match self
                .api_for(&ar, &scope, namespace.as_deref())
                .delete(&name, &DeleteParams::default())
                .await
            {
                Ok(_) => {
                    info!(kind = %gvk.kind, %name, ?namespace, set = %set.set_id, "pruned object")
                }
                Err(kube::Error::Api(ae)) if ae.code == 404 => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Applier for KubeApplier {
    async fn apply(&self, set: &ObjectSet) -> Result<()> {
        for object in set.labelled_objects() {
            self.apply_object(&object).await?;
        }
        for gvk in &set.prune_types {
            self.prune(set, gvk).await?;
        }

        info!(
            set = %set.set_id,
            owner = %format!("{}/{}", set.owner_namespace, set.owner_name),
            objects = set.objects.len(),
            "object set applied"
        );
        Ok(())
    }
}

/// [`TargetApplierFactory`] building a client from kubeconfig bytes
#[derive(Default)]
pub struct KubeTargetApplierFactory;

#[async_trait]
impl TargetApplierFactory for KubeTargetApplierFactory {
    async fn for_kubeconfig(&self, kubeconfig: &[u8]) -> Result<Arc<dyn Applier>> {
        let client = client_from_kubeconfig(kubeconfig).await?;
        Ok(Arc::new(KubeApplier::new(client)))
    }
}

/// Create a kube Client from kubeconfig bytes
pub async fn client_from_kubeconfig(kubeconfig: &[u8]) -> Result<Client> {
    let text = std::str::from_utf8(kubeconfig)
        .map_err(|e| Error::kubeconfig(format!("invalid UTF-8: {e}")))?;
    let parsed = Kubeconfig::from_yaml(text)
        .map_err(|e| Error::kubeconfig(format!("invalid kubeconfig: {e}")))?;
    let config = Config::from_custom_kubeconfig(parsed, &KubeConfigOptions::default())
        .await
        .map_err(|e| Error::kubeconfig(format!("failed to build config: {e}")))?;
    Client::try_from(config).map_err(|e| Error::kubeconfig(format!("failed to create client: {e}")))
}
