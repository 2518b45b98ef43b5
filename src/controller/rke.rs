//! RKECluster controller implementation
//!
//! Control planes are created by the cluster controller without an endpoint.
//! This controller defaults the endpoint and reports the control plane ready.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kube::api::{Api, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::{Client, ResourceExt};
use tracing::{error, info, instrument};

#[cfg(test)]
use mockall::automock;

use crate::apply::FIELD_MANAGER;
use crate::crd::{Condition, ConditionStatus, Endpoint, RKECluster, RKEClusterStatus};
use crate::{Error, Result};

/// Host a control plane endpoint defaults to
pub const DEFAULT_ENDPOINT_HOST: &str = "localhost";
/// Port a control plane endpoint defaults to
pub const DEFAULT_ENDPOINT_PORT: i32 = 6443;

/// Trait abstracting Kubernetes client operations for RKECluster
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RkeClient: Send + Sync {
    /// Persist the control plane endpoint in the spec
    async fn set_endpoint(&self, namespace: &str, name: &str, endpoint: &Endpoint) -> Result<()>;

    /// Patch the status of an RKECluster
    async fn patch_status(
        &self,
        namespace: &str,
        name: &str,
        status: &RKEClusterStatus,
    ) -> Result<()>;
}

/// Real Kubernetes client implementation
pub struct RkeClientImpl {
    client: Client,
}

impl RkeClientImpl {
    /// Create a new RkeClientImpl wrapping the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl RkeClient for RkeClientImpl {
    async fn set_endpoint(&self, namespace: &str, name: &str, endpoint: &Endpoint) -> Result<()> {
        let api: Api<RKECluster> = Api::namespaced(self.client.clone(), namespace);
        let patch = serde_json::json!({
            "spec": { "controlPlaneEndpoint": endpoint }
        });
        api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn patch_status(
        &self,
        namespace: &str,
        name: &str,
        status: &RKEClusterStatus,
    ) -> Result<()> {
        let api: Api<RKECluster> = Api::namespaced(self.client.clone(), namespace);
        let patch = serde_json::json!({ "status": status });
        api.patch_status(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}

/// Shared state for the RKECluster controller
pub struct RkeContext {
    /// Kubernetes client for API operations (trait object for testability)
    pub client: Arc<dyn RkeClient>,
}

impl RkeContext {
    /// Create a context backed by the API server
    pub fn new(client: Client) -> Self {
        Self {
            client: Arc::new(RkeClientImpl::new(client)),
        }
    }
}

/// Reconcile an RKECluster resource
///
/// An unset endpoint is defaulted first; the resulting update triggers the
/// next pass, which marks the control plane ready.
#[instrument(skip(cluster, ctx), fields(rke_cluster = %cluster.name_any()))]
pub async fn reconcile_rke(cluster: Arc<RKECluster>, ctx: Arc<RkeContext>) -> Result<Action> {
    let name = cluster.name_any();
    let namespace = cluster
        .namespace()
        .ok_or_else(|| Error::validation("RKECluster has no namespace"))?;

    if cluster.spec.control_plane_endpoint.is_none() {
        let endpoint = Endpoint {
            host: DEFAULT_ENDPOINT_HOST.to_string(),
            port: DEFAULT_ENDPOINT_PORT,
        };
        info!(host = %endpoint.host, port = endpoint.port, "defaulting control plane endpoint");
        ctx.client.set_endpoint(&namespace, &name, &endpoint).await?;
        return Ok(Action::await_change());
    }

    let current = cluster.status.clone().unwrap_or_default();
    let mut status = current
        .clone()
        .ready()
        .condition(Condition::new("Ready", ConditionStatus::True, "Active", ""));
    status.observed_generation = cluster.metadata.generation;

    if status != current {
        ctx.client.patch_status(&namespace, &name, &status).await?;
        info!("control plane ready");
    }

    Ok(Action::await_change())
}

/// Error policy for the RKECluster controller
pub fn error_policy_rke(cluster: Arc<RKECluster>, error: &Error, _ctx: Arc<RkeContext>) -> Action {
    error!(
        ?error,
        rke_cluster = %cluster.name_any(),
        "reconciliation failed"
    );
    Action::requeue(Duration::from_secs(5))
}
