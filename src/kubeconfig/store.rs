//! Object store access used by the credential manager

use std::sync::Arc;

use async_trait::async_trait;
use futures::{Future, StreamExt};
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment};
use k8s_openapi::api::core::v1::Secret;
use kube::api::{Api, DeleteParams, PostParams};
use kube::runtime::reflector::{self, ObjectRef, Store};
use kube::runtime::{watcher, WatchStreamExt};
use kube::Client;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use crate::config::ManagerConfig;
use crate::crd::{Setting, Token, User};
use crate::Result;

/// Setting naming whether tokens are stored hashed
pub const TOKEN_HASHING_SETTING: &str = "token-hashing";
/// Setting holding the external server URL
pub const SERVER_URL_SETTING: &str = "server-url";
/// Setting holding the CA bundle for the server URL
pub const CA_CERTS_SETTING: &str = "cacerts";

/// Reads and writes of users, tokens and secrets
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// A secret from the local cache, possibly stale or missing
    fn cached_secret(&self, namespace: &str, name: &str) -> Option<Secret>;

    /// A secret read straight from the API server
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>>;

    /// A management user
    async fn get_user(&self, name: &str) -> Result<Option<User>>;

    /// Create a management user
    async fn create_user(&self, user: &User) -> Result<()>;

    /// A management token
    async fn get_token(&self, name: &str) -> Result<Option<Token>>;

    /// Delete a management token; a missing token is not an error
    async fn delete_token(&self, name: &str) -> Result<()>;

    /// Create a management token
    async fn create_token(&self, token: &Token) -> Result<()>;

    /// Replica count of a deployment
    ///
    /// `None` when the deployment does not exist or leaves replicas unset.
    async fn deployment_replicas(&self, namespace: &str, name: &str) -> Result<Option<i32>>;

    /// Whether a daemonset exists
    async fn daemonset_exists(&self, namespace: &str, name: &str) -> Result<bool>;
}

/// Runtime settings of the management server
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ServerSettings: Send + Sync {
    /// Whether newly minted tokens are stored hashed
    async fn token_hashing_enabled(&self) -> Result<bool>;

    /// External URL of the management server
    async fn server_url(&self) -> Result<String>;

    /// CA bundle for the external URL, empty when publicly trusted
    async fn ca_certs(&self) -> Result<String>;
}

/// [`CredentialStore`] backed by the API server and a secret reflector
pub struct KubeCredentialStore {
    client: Client,
    secrets: Store<Secret>,
}

impl KubeCredentialStore {
    /// Create a new KubeCredentialStore reading cached secrets from `secrets`
    pub fn new(client: Client, secrets: Store<Secret>) -> Self {
        Self { client, secrets }
    }
}

/// Start a cluster-wide secret cache
///
/// Returns the store and the future that keeps it current; the caller spawns
/// the future.
pub fn secret_cache(client: Client) -> (Store<Secret>, impl Future<Output = ()> + Send) {
    let (reader, writer) = reflector::store();
    let api: Api<Secret> = Api::all(client);
    let driver = reflector::reflector(writer, watcher(api, watcher::Config::default()))
        .default_backoff()
        .touched_objects()
        .for_each(|event| async move {
            if let Err(e) = event {
                debug!(error = %e, "secret cache watch error");
            }
        });
    (reader, driver)
}

#[async_trait]
impl CredentialStore for KubeCredentialStore {
    fn cached_secret(&self, namespace: &str, name: &str) -> Option<Secret> {
        let key = ObjectRef::new(name).within(namespace);
        self.secrets.get(&key).map(Arc::unwrap_or_clone)
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn get_user(&self, name: &str) -> Result<Option<User>> {
        let api: Api<User> = Api::all(self.client.clone());
        Ok(api.get_opt(name).await?)
    }

    async fn create_user(&self, user: &User) -> Result<()> {
        let api: Api<User> = Api::all(self.client.clone());
        api.create(&PostParams::default(), user).await?;
        Ok(())
    }

    async fn get_token(&self, name: &str) -> Result<Option<Token>> {
        let api: Api<Token> = Api::all(self.client.clone());
        Ok(api.get_opt(name).await?)
    }

    async fn delete_token(&self, name: &str) -> Result<()> {
        let api: Api<Token> = Api::all(self.client.clone());
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn create_token(&self, token: &Token) -> Result<()> {
        let api: Api<Token> = Api::all(self.client.clone());
        api.create(&PostParams::default(), token).await?;
        Ok(())
    }

    async fn deployment_replicas(&self, namespace: &str, name: &str) -> Result<Option<i32>> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?.as_ref().and_then(replica_count))
    }

    async fn daemonset_exists(&self, namespace: &str, name: &str) -> Result<bool> {
        let api: Api<DaemonSet> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?.is_some())
    }
}

fn replica_count(deployment: &Deployment) -> Option<i32> {
    deployment.spec.as_ref()?.replicas
}

/// [`ServerSettings`] reading `Setting` objects, falling back to static config
pub struct KubeSettings {
    client: Client,
    fallback: ManagerConfig,
}

impl KubeSettings {
    /// Create a new KubeSettings
    pub fn new(client: Client, fallback: ManagerConfig) -> Self {
        Self { client, fallback }
    }

    async fn read(&self, name: &str) -> Result<Option<String>> {
        let api: Api<Setting> = Api::all(self.client.clone());
        Ok(api
            .get_opt(name)
            .await?
            .map(|setting| setting.effective().to_string())
            .filter(|value| !value.is_empty()))
    }
}

#[async_trait]
impl ServerSettings for KubeSettings {
    async fn token_hashing_enabled(&self) -> Result<bool> {
        Ok(match self.read(TOKEN_HASHING_SETTING).await? {
            Some(value) => value.eq_ignore_ascii_case("true"),
            None => self.fallback.token_hashing,
        })
    }

    async fn server_url(&self) -> Result<String> {
        Ok(self
            .read(SERVER_URL_SETTING)
            .await?
            .unwrap_or_else(|| self.fallback.server_url.clone()))
    }

    async fn ca_certs(&self) -> Result<String> {
        Ok(self
            .read(CA_CERTS_SETTING)
            .await?
            .unwrap_or_else(|| self.fallback.ca_certs.clone()))
    }
}

/// [`ServerSettings`] with fixed values
#[derive(Clone, Debug)]
pub struct StaticSettings(pub ManagerConfig);

#[async_trait]
impl ServerSettings for StaticSettings {
    async fn token_hashing_enabled(&self) -> Result<bool> {
        Ok(self.0.token_hashing)
    }

    async fn server_url(&self) -> Result<String> {
        Ok(self.0.server_url.clone())
    }

    async fn ca_certs(&self) -> Result<String> {
        Ok(self.0.ca_certs.clone())
    }
}
