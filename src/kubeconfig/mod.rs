//! Credentials and kubeconfigs that let downstream clusters reach the
//! management server
//!
//! Each provisioned cluster gets a service user derived from its namespace
//! and name, and a bearer token for that user. The token is bundled with the
//! server URL and CA into a kubeconfig secret named `<cluster>-kubeconfig`.
//!
//! Token lookup goes cached secret, then uncached secret, then mint. Minting
//! always deletes the user's previous token first so at most one is live.

pub mod store;
pub mod token;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use kube::ResourceExt;
use serde::Serialize;
use tracing::{debug, info, instrument};

#[cfg(test)]
use mockall::automock;

use crate::config::ManagerConfig;
use crate::crd::{Cluster, ClusterStatus, Token, User};
use crate::naming::kubeconfig_secret_name;
use crate::{Error, Result};

pub use store::{
    CredentialStore, KubeCredentialStore, KubeSettings, ServerSettings, StaticSettings,
};
pub use token::BearerToken;

/// Secret key holding the kubeconfig YAML
pub const KUBECONFIG_KEY: &str = "value";
/// Secret key holding the raw `user:token` credential
pub const TOKEN_KEY: &str = "token";
/// Secret key holding the internal CA certificate
pub const CA_CERT_KEY: &str = "tls.crt";

/// Where downstream clusters reach the management server
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ServerEndpoint {
    /// Base URL, without a trailing slash
    pub url: String,
    /// PEM bundle to trust, empty for the system trust store
    pub ca: String,
}

/// Source of the management server endpoint
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ServerInfo: Send + Sync {
    /// The URL and CA downstream clusters should use
    async fn server_endpoint(&self) -> Result<ServerEndpoint>;
}

/// Source of per-cluster kubeconfig secrets
#[cfg_attr(test, automock)]
#[async_trait]
pub trait KubeconfigProvider: Send + Sync {
    /// The kubeconfig secret to apply for `cluster`, if one should exist
    async fn kubeconfig_secret(
        &self,
        cluster: &Cluster,
        status: &ClusterStatus,
    ) -> Result<Option<Secret>>;
}

/// Issues service user tokens and builds kubeconfig secrets
pub struct Manager {
    store: Arc<dyn CredentialStore>,
    settings: Arc<dyn ServerSettings>,
    config: ManagerConfig,
}

impl Manager {
    /// Create a new Manager
    pub fn new(
        store: Arc<dyn CredentialStore>,
        settings: Arc<dyn ServerSettings>,
        config: ManagerConfig,
    ) -> Self {
        Self {
            store,
            settings,
            config,
        }
    }

    /// The `user:token` credential for a cluster, minting one if needed
    #[instrument(skip(self))]
    pub async fn get_token(&self, namespace: &str, cluster_name: &str) -> Result<String> {
        let secret_name = kubeconfig_secret_name(cluster_name);

        if let Some(token) = self
            .store
            .cached_secret(namespace, &secret_name)
            .and_then(|secret| secret_value(&secret, TOKEN_KEY))
        {
            return Ok(token);
        }

        // The cache may lag a secret written moments ago
        if let Some(token) = self
            .store
            .get_secret(namespace, &secret_name)
            .await?
            .and_then(|secret| secret_value(&secret, TOKEN_KEY))
        {
            return Ok(token);
        }

        let user = self.ensure_user(namespace, cluster_name).await?;
        self.create_user_token(&user).await
    }

    /// Make sure the service user for a cluster exists and return its name
    pub async fn ensure_user(&self, namespace: &str, cluster_name: &str) -> Result<String> {
        let principal = token::principal_id(namespace, cluster_name);
        let name = token::user_name(&principal);

        if self.store.get_user(&name).await?.is_none() {
            let user = User::new(&name, token::user_labels(&principal), vec![principal]);
            self.store.create_user(&user).await?;
            info!(user = %name, "created service user");
        }
        Ok(name)
    }

    /// Replace the user's token with a fresh one and return `user:token`
    pub async fn create_user_token(&self, user_name: &str) -> Result<String> {
        if self.store.get_token(user_name).await?.is_some() {
            self.store.delete_token(user_name).await?;
            debug!(user = %user_name, "deleted previous token");
        }

        let bearer = BearerToken::generate()?;
        let hashing = self.settings.token_hashing_enabled().await?;

        let mut token = Token::new(user_name);
        token.metadata.labels = Some(token::token_labels(user_name));
        token.user_id = user_name.to_string();
        token.auth_provider = token::LOCAL_AUTH_PROVIDER.to_string();
        token.is_derived = true;
        if hashing {
            token.token = bearer.hashed()?;
            token.metadata.annotations = Some(BTreeMap::from([(
                token::TOKEN_HASHED_ANNOTATION.to_string(),
                "true".to_string(),
            )]));
        } else {
            token.token = bearer.as_str().to_string();
        }

        self.store.create_token(&token).await?;
        info!(user = %user_name, hashed = hashing, "issued token");
        Ok(format!("{user_name}:{}", bearer.as_str()))
    }

    /// The server URL and CA downstream clusters should use
    ///
    /// When the management server runs in this cluster (a deployment with
    /// replicas, or a daemonset) agents go through its internal service and
    /// trust the internal CA. Otherwise the configured URL and CA apply.
    pub async fn get_server_url_and_ca(&self) -> Result<ServerEndpoint> {
        if self.internal_server_running().await? {
            let secret = self
                .store
                .get_secret(&self.config.system_namespace, &self.config.internal_ca_secret)
                .await?;
            let ca = secret
                .and_then(|s| secret_value(&s, CA_CERT_KEY))
                .unwrap_or_default();
            return Ok(ServerEndpoint {
                url: self.config.internal_server_url(),
                ca,
            });
        }

        Ok(ServerEndpoint {
            url: self.settings.server_url().await?,
            ca: self.settings.ca_certs().await?,
        })
    }

    async fn internal_server_running(&self) -> Result<bool> {
        let namespace = &self.config.system_namespace;
        let name = &self.config.control_plane_service;

        if let Some(replicas) = self.store.deployment_replicas(namespace, name).await? {
            if replicas != 0 {
                return Ok(true);
            }
        }
        self.store.daemonset_exists(namespace, name).await
    }

    /// The kubeconfig secret for a cluster
    ///
    /// Returns `None` when the cluster is imported from a secret with the
    /// same name, since that secret already holds the kubeconfig.
    #[instrument(skip(self, cluster, status), fields(cluster = %cluster.name_any()))]
    pub async fn get_kube_config(
        &self,
        cluster: &Cluster,
        status: &ClusterStatus,
    ) -> Result<Option<Secret>> {
        let name = cluster.name_any();
        let namespace = cluster
            .namespace()
            .ok_or_else(|| Error::validation("cluster has no namespace"))?;
        let secret_name = kubeconfig_secret_name(&name);

        if cluster.spec.imported_kubeconfig_secret().as_deref() == Some(secret_name.as_str()) {
            debug!("imported kubeconfig secret has the generated name, not generating");
            return Ok(None);
        }

        let management_cluster = status
            .management_cluster()
            .ok_or_else(|| Error::internal("management cluster name not assigned"))?;
        let endpoint = self.get_server_url_and_ca().await?;
        let token = self.get_token(&namespace, &name).await?;

        let kubeconfig = render_kubeconfig(
            &format!("{}/k8s/clusters/{management_cluster}", endpoint.url),
            &endpoint.ca,
            &token,
        )?;

        Ok(Some(Secret {
            metadata: ObjectMeta {
                name: Some(secret_name),
                namespace: Some(namespace),
                ..Default::default()
            },
            data: Some(BTreeMap::from([
                (KUBECONFIG_KEY.to_string(), ByteString(kubeconfig.into_bytes())),
                (TOKEN_KEY.to_string(), ByteString(token.into_bytes())),
            ])),
            ..Default::default()
        }))
    }
}

#[async_trait]
impl ServerInfo for Manager {
    async fn server_endpoint(&self) -> Result<ServerEndpoint> {
        self.get_server_url_and_ca().await
    }
}

#[async_trait]
impl KubeconfigProvider for Manager {
    async fn kubeconfig_secret(
        &self,
        cluster: &Cluster,
        status: &ClusterStatus,
    ) -> Result<Option<Secret>> {
        self.get_kube_config(cluster, status).await
    }
}

/// A non-empty string value from a secret's data
pub fn secret_value(secret: &Secret, key: &str) -> Option<String> {
    secret
        .data
        .as_ref()
        .and_then(|data| data.get(key))
        .and_then(|bytes| String::from_utf8(bytes.0.clone()).ok())
        .filter(|value| !value.is_empty())
}

#[derive(Serialize)]
#[serde(rename_all = "kebab-case")]
struct KubeconfigFile {
    #[serde(rename = "apiVersion")]
    api_version: &'static str,
    kind: &'static str,
    clusters: Vec<Named<KubeconfigCluster>>,
    users: Vec<Named<KubeconfigUser>>,
    contexts: Vec<Named<KubeconfigContext>>,
    current_context: &'static str,
}

#[derive(Serialize)]
struct Named<T> {
    name: &'static str,
    #[serde(flatten)]
    item: T,
}

#[derive(Serialize)]
struct KubeconfigCluster {
    cluster: ClusterEntry,
}

#[derive(Serialize)]
#[serde(rename_all = "kebab-case")]
struct ClusterEntry {
    server: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    certificate_authority_data: Option<String>,
}

#[derive(Serialize)]
struct KubeconfigUser {
    user: UserEntry,
}

#[derive(Serialize)]
struct UserEntry {
    token: String,
}

#[derive(Serialize)]
struct KubeconfigContext {
    context: ContextEntry,
}

#[derive(Serialize)]
struct ContextEntry {
    user: &'static str,
    cluster: &'static str,
}

/// Render a single-cluster kubeconfig authenticating with a bearer token
pub fn render_kubeconfig(server: &str, ca: &str, token: &str) -> Result<String> {
    let ca = ca.trim();
    let file = KubeconfigFile {
        api_version: "v1",
        kind: "Config",
        clusters: vec![Named {
            name: "cluster",
            item: KubeconfigCluster {
                cluster: ClusterEntry {
                    server: server.to_string(),
                    certificate_authority_data: (!ca.is_empty())
                        .then(|| STANDARD.encode(ca.as_bytes())),
                },
            },
        }],
        users: vec![Named {
            name: "user",
            item: KubeconfigUser {
                user: UserEntry {
                    token: token.to_string(),
                },
            },
        }],
        contexts: vec![Named {
            name: "default",
            item: KubeconfigContext {
                context: ContextEntry {
                    user: "user",
                    cluster: "cluster",
                },
            },
        }],
        current_context: "default",
    };
    serde_yaml::to_string(&file).map_err(|e| Error::kubeconfig(e.to_string()))
}
