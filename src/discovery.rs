//! Discovery of installed node config kinds
//!
//! Node config kinds come from infrastructure providers and can be installed
//! after the controller starts. The cluster controller watches the kinds it
//! found at start, and [`await_node_config_change`] polls discovery so the
//! controller can be restarted with the new set.

use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;
use kube::api::ApiResource;
use kube::discovery::Discovery;
use kube::Client;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

#[cfg(test)]
use mockall::automock;

use crate::index::{is_node_config_kind, NODE_CONFIG_GROUP};
use crate::Result;

/// How often the served node config kinds are rediscovered
pub const REDISCOVERY_INTERVAL: Duration = Duration::from_secs(300);

/// Source of the node config kinds the API server serves
#[cfg_attr(test, automock)]
#[async_trait]
pub trait NodeConfigDiscovery: Send + Sync {
    /// Node config kinds currently served, at their recommended version
    async fn node_config_kinds(&self) -> Result<Vec<ApiResource>>;
}

/// [`NodeConfigDiscovery`] backed by API discovery
pub struct KubeNodeConfigDiscovery {
    client: Client,
}

impl KubeNodeConfigDiscovery {
    /// Create a new KubeNodeConfigDiscovery
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl NodeConfigDiscovery for KubeNodeConfigDiscovery {
    async fn node_config_kinds(&self) -> Result<Vec<ApiResource>> {
        let discovery = Discovery::new(self.client.clone())
            .filter(&[NODE_CONFIG_GROUP])
            .run()
            .await?;

        Ok(discovery
            .groups()
            .flat_map(|group| group.recommended_resources())
            .map(|(resource, _caps)| resource)
            .filter(|resource| is_node_config_kind(&resource.group, &resource.kind))
            .collect())
    }
}

/// `apiVersion/kind` of each resource, for order-independent comparison
pub fn kind_keys(kinds: &[ApiResource]) -> BTreeSet<String> {
    kinds
        .iter()
        .map(|resource| format!("{}/{}", resource.api_version, resource.kind))
        .collect()
}

/// Poll discovery every `every` until the served kinds differ from `known`
///
/// Returns the new set. Discovery failures are logged and retried on the next
/// tick.
pub async fn await_node_config_change(
    discovery: &dyn NodeConfigDiscovery,
    known: &[ApiResource],
    every: Duration,
) -> Vec<ApiResource> {
    let known = kind_keys(known);
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // The first tick completes immediately
    interval.tick().await;

    loop {
        interval.tick().await;
        match discovery.node_config_kinds().await {
            Ok(found) if kind_keys(&found) != known => {
                info!(count = found.len(), "node config kinds changed");
                return found;
            }
            Ok(_) => debug!("node config kinds unchanged"),
            Err(e) => warn!(error = %e, "node config discovery failed"),
        }
    }
}
