//! Agent deployment for imported clusters
//!
//! An imported cluster already exists; it joins the management server by
//! running the agent manifest served at `/v3/import/<token>.yaml`. The
//! handshake has no state of its own. Each pass looks at what exists and
//! takes the next step:
//!
//! ```text
//! management cluster? ──no──> WaitingForManagedCluster
//!        │ yes
//! registration token? ──no──> create one, WaitingForToken
//!        │ yes
//! token value set?   ──no──> WaitingForTokenValue
//!        │ yes
//! kubeconfig secret? ──no──> WaitingForKubeconfig
//!        │ yes
//! fetch manifest, apply to downstream cluster ──> Deployed
//! ```

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use kube::api::{Api, ListParams, PostParams};
use kube::{Client, ResourceExt};
use tracing::{debug, info, instrument};

#[cfg(test)]
use mockall::automock;

use crate::apply::{ObjectSet, TargetApplierFactory};
use crate::crd::{
    Cluster, ClusterRegistrationToken, ClusterRegistrationTokenSpec, ManagementCluster,
};
use crate::kubeconfig::{ServerInfo, KUBECONFIG_KEY};
use crate::manifest::yaml_to_manifests;
use crate::{Error, Result};

/// Set id for objects applied to the downstream cluster
pub const AGENT_SETUP_SET_ID: &str = "cluster-agent-setup";

/// Delay before re-checking a handshake that is waiting on something
pub const HANDSHAKE_RETRY_DELAY: Duration = Duration::from_secs(2);

/// Outcome of one handshake pass
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandshakeStep {
    /// Nothing to do: the agent is deployed or the cluster has no id yet
    Idle,
    /// The management cluster record does not exist yet
    WaitingForManagedCluster,
    /// A registration token was just requested
    WaitingForToken,
    /// The registration token has no value yet
    WaitingForTokenValue,
    /// The kubeconfig secret is missing or empty
    WaitingForKubeconfig,
    /// The agent manifest was applied
    Deployed,
}

impl HandshakeStep {
    /// When to look again, if the handshake is waiting
    pub fn requeue_after(&self) -> Option<Duration> {
        match self {
            Self::WaitingForManagedCluster
            | Self::WaitingForToken
            | Self::WaitingForTokenValue
            | Self::WaitingForKubeconfig => Some(HANDSHAKE_RETRY_DELAY),
            Self::Idle | Self::Deployed => None,
        }
    }
}

/// One pass of agent deployment for an imported cluster
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Handshake: Send + Sync {
    /// Take the next step for `cluster`
    async fn run(&self, cluster: &Cluster) -> Result<HandshakeStep>;
}

/// Management-side reads and writes the handshake needs
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ManagementClient: Send + Sync {
    /// Whether the management cluster record exists
    async fn management_cluster_exists(&self, name: &str) -> Result<bool>;

    /// Registration tokens in the management cluster's namespace
    async fn registration_tokens(
        &self,
        cluster_name: &str,
    ) -> Result<Vec<ClusterRegistrationToken>>;

    /// Request a registration token for the management cluster
    async fn create_registration_token(&self, cluster_name: &str) -> Result<()>;

    /// A secret, `None` if it does not exist
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>>;
}

/// Download of the agent manifest
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ManifestFetcher: Send + Sync {
    /// GET `{server_url}/v3/import/{token}.yaml`, trusting `ca` when non-empty
    async fn fetch(&self, server_url: &str, token: &str, ca: &str) -> Result<String>;
}

/// [`ManagementClient`] talking to the API server
pub struct KubeManagementClient {
    client: Client,
}

impl KubeManagementClient {
    /// Create a new KubeManagementClient
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ManagementClient for KubeManagementClient {
    async fn management_cluster_exists(&self, name: &str) -> Result<bool> {
        let api: Api<ManagementCluster> = Api::all(self.client.clone());
        Ok(api.get_opt(name).await?.is_some())
    }

    async fn registration_tokens(
        &self,
        cluster_name: &str,
    ) -> Result<Vec<ClusterRegistrationToken>> {
        let api: Api<ClusterRegistrationToken> = Api::namespaced(self.client.clone(), cluster_name);
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn create_registration_token(&self, cluster_name: &str) -> Result<()> {
        let api: Api<ClusterRegistrationToken> = Api::namespaced(self.client.clone(), cluster_name);
        let mut token = ClusterRegistrationToken::new(
            "",
            ClusterRegistrationTokenSpec {
                cluster_name: cluster_name.to_string(),
            },
        );
        token.metadata.name = None;
        token.metadata.generate_name = Some("import-".to_string());
        token.metadata.namespace = Some(cluster_name.to_string());
        api.create(&PostParams::default(), &token).await?;
        Ok(())
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }
}

/// URL of the agent manifest for a registration token
pub fn import_url(server_url: &str, token: &str) -> String {
    format!("{}/v3/import/{token}.yaml", server_url.trim_end_matches('/'))
}

/// [`ManifestFetcher`] over HTTPS
#[derive(Default)]
pub struct HttpsManifestFetcher;

#[async_trait]
impl ManifestFetcher for HttpsManifestFetcher {
    async fn fetch(&self, server_url: &str, token: &str, ca: &str) -> Result<String> {
        let url = import_url(server_url, token);
        // The token is a credential; errors name the endpoint only
        let shown = import_url(server_url, "<token>");

        let mut builder = reqwest::Client::builder().use_rustls_tls();
        if !ca.is_empty() {
            let certs = reqwest::Certificate::from_pem_bundle(ca.as_bytes())
                .map_err(|e| Error::http(&shown, format!("invalid CA certificate: {e}")))?;
            builder = certs
                .into_iter()
                .fold(builder.tls_built_in_root_certs(false), |b, cert| {
                    b.add_root_certificate(cert)
                });
        }
        let client = builder
            .build()
            .map_err(|e| Error::http(&shown, format!("failed to build HTTP client: {e}")))?;

        let response = client
            .get(&url)
            .send()
            .await
            .map_err(|e| Error::http(&shown, e.without_url().to_string()))?;

        if !response.status().is_success() {
            return Err(Error::http(&shown, format!("unexpected status {}", response.status())));
        }

        response
            .text()
            .await
            .map_err(|e| Error::http(&shown, e.without_url().to_string()))
    }
}

/// Drives agent deployment for imported clusters
pub struct ImportHandshake {
    management: Arc<dyn ManagementClient>,
    fetcher: Arc<dyn ManifestFetcher>,
    targets: Arc<dyn TargetApplierFactory>,
    server: Arc<dyn ServerInfo>,
}

impl ImportHandshake {
    /// Create a new ImportHandshake
    pub fn new(
        management: Arc<dyn ManagementClient>,
        fetcher: Arc<dyn ManifestFetcher>,
        targets: Arc<dyn TargetApplierFactory>,
        server: Arc<dyn ServerInfo>,
    ) -> Self {
        Self {
            management,
            fetcher,
            targets,
            server,
        }
    }
}

#[async_trait]
impl Handshake for ImportHandshake {
    /// Waiting states are not errors; the caller requeues after
    /// [`HandshakeStep::requeue_after`].
    #[instrument(skip(self, cluster), fields(cluster = %cluster.name_any()))]
    async fn run(&self, cluster: &Cluster) -> Result<HandshakeStep> {
        if cluster.agent_deployed() {
            return Ok(HandshakeStep::Idle);
        }
        let (Some(management_cluster), Some(secret_name)) = (
            cluster.management_cluster(),
            cluster
                .spec
                .imported_kubeconfig_secret()
                .filter(|name| !name.is_empty()),
        ) else {
            return Ok(HandshakeStep::Idle);
        };

        if !self
            .management
            .management_cluster_exists(management_cluster)
            .await?
        {
            debug!(%management_cluster, "waiting for management cluster");
            return Ok(HandshakeStep::WaitingForManagedCluster);
        }

        let tokens = self.management.registration_tokens(management_cluster).await?;
        let Some(token) = tokens.first() else {
            self.management
                .create_registration_token(management_cluster)
                .await?;
            info!(%management_cluster, "requested registration token");
            return Ok(HandshakeStep::WaitingForToken);
        };
        let Some(token) = token.value() else {
            debug!("waiting for registration token value");
            return Ok(HandshakeStep::WaitingForTokenValue);
        };

        let namespace = cluster.namespace().unwrap_or_default();
        let secret = self.management.get_secret(&namespace, &secret_name).await?;
        let Some(data) = secret
            .and_then(|s| s.data)
            .filter(|data| !data.is_empty())
        else {
            debug!(secret = %secret_name, "waiting for kubeconfig secret");
            return Ok(HandshakeStep::WaitingForKubeconfig);
        };
        let kubeconfig = data.get(KUBECONFIG_KEY).ok_or_else(|| {
            Error::kubeconfig(format!("secret {secret_name} has no {KUBECONFIG_KEY} key"))
        })?;
        let target = self.targets.for_kubeconfig(&kubeconfig.0).await?;

        let endpoint = self.server.server_endpoint().await?;
        let body = self.fetcher.fetch(&endpoint.url, token, &endpoint.ca).await?;
        let objects = yaml_to_manifests(&body)?;

        let set = ObjectSet::new(AGENT_SETUP_SET_ID, &namespace, cluster.name_any())
            .with_objects(objects);
        let set = ObjectSet {
            prune_types: set.object_types(),
            ..set
        };
        target.apply(&set).await?;

        info!(objects = set.objects.len(), "agent deployed");
        Ok(HandshakeStep::Deployed)
    }
}
