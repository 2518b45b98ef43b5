//! Reverse index from node config objects to the clusters that use them
//!
//! A change to a node config (say a `DigitaloceanConfig`) must regenerate
//! every cluster whose pools reference it. The cluster reconciler records
//! each cluster's references here on every pass, and the node config watch
//! looks the changed object up to find which clusters to requeue.

use std::collections::BTreeSet;

use dashmap::DashMap;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::reflector::ObjectRef;
use kube::ResourceExt;

use crate::crd::{Cluster, DEFAULT_NODE_CONFIG_API_VERSION};

/// Group whose `*Config` kinds are node configs
pub const NODE_CONFIG_GROUP: &str = "rancher.cattle.io";

/// Namespace and name of an indexed cluster
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ClusterKey {
    /// Cluster namespace
    pub namespace: String,
    /// Cluster name
    pub name: String,
}

impl ClusterKey {
    /// Reference for requeueing the cluster in the controller
    pub fn object_ref(&self) -> ObjectRef<Cluster> {
        ObjectRef::new(&self.name).within(&self.namespace)
    }
}

/// Index key for a node config: `apiVersion/kind/namespace/name`
///
/// The namespace is always the cluster's, whatever the reference says, and
/// an empty apiVersion means `rancher.cattle.io/v1`.
pub fn infra_ref_key(reference: &ObjectReference, namespace: &str) -> String {
    let api_version = reference
        .api_version
        .as_deref()
        .filter(|v| !v.is_empty())
        .unwrap_or(DEFAULT_NODE_CONFIG_API_VERSION);
    object_key(
        api_version,
        reference.kind.as_deref().unwrap_or_default(),
        namespace,
        reference.name.as_deref().unwrap_or_default(),
    )
}

/// Index key for an observed object
pub fn object_key(api_version: &str, kind: &str, namespace: &str, name: &str) -> String {
    format!("{api_version}/{kind}/{namespace}/{name}")
}

/// Whether objects of this group and kind are node configs
pub fn is_node_config_kind(group: &str, kind: &str) -> bool {
    group == NODE_CONFIG_GROUP && kind.ends_with("Config")
}

/// Concurrent reverse index, rebuilt per cluster on every write
#[derive(Debug, Default)]
pub struct InfraRefIndex {
    by_key: DashMap<String, BTreeSet<ClusterKey>>,
    by_cluster: DashMap<ClusterKey, BTreeSet<String>>,
}

impl InfraRefIndex {
    /// Create an empty index
    pub fn new() -> Self {
        Self::default()
    }

    /// Keys a cluster should be indexed under
    ///
    /// Only clusters with an assigned management cluster and node pool
    /// configuration are indexed.
    pub fn keys_for(cluster: &Cluster) -> BTreeSet<String> {
        let (Some(_), Some(rke), Some(namespace)) = (
            cluster.management_cluster(),
            cluster.spec.rke_config.as_ref(),
            cluster.metadata.namespace.as_deref(),
        ) else {
            return BTreeSet::new();
        };

        rke.node_pools
            .iter()
            .filter_map(|pool| pool.node_config.as_ref())
            .map(|reference| infra_ref_key(reference, namespace))
            .collect()
    }

    /// Replace the entries for `cluster` with its current references
    pub fn update(&self, cluster: &Cluster) {
        let key = ClusterKey {
            namespace: cluster.namespace().unwrap_or_default(),
            name: cluster.name_any(),
        };
        let keys = Self::keys_for(cluster);
        self.replace(key, keys);
    }

    /// Drop every entry for the cluster
    pub fn remove(&self, namespace: &str, name: &str) {
        let key = ClusterKey {
            namespace: namespace.to_string(),
            name: name.to_string(),
        };
        self.replace(key, BTreeSet::new());
    }

    /// Clusters referencing the node config with this key
    pub fn lookup(&self, key: &str) -> Vec<ClusterKey> {
        self.by_key
            .get(key)
            .map(|clusters| clusters.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of distinct node configs indexed
    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    /// Whether nothing is indexed
    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }

    fn replace(&self, cluster: ClusterKey, keys: BTreeSet<String>) {
        let previous = if keys.is_empty() {
            self.by_cluster.remove(&cluster).map(|(_, v)| v)
        } else {
            self.by_cluster.insert(cluster.clone(), keys.clone())
        }
        .unwrap_or_default();

        for stale in previous.difference(&keys) {
            // remove_if avoids holding a shard guard across the emptiness check
            if let Some(mut entry) = self.by_key.get_mut(stale) {
                entry.remove(&cluster);
            }
            self.by_key.remove_if(stale, |_, clusters| clusters.is_empty());
        }

        for key in keys {
            self.by_key.entry(key).or_default().insert(cluster.clone());
        }
    }
}
