//! Controller configuration from flags and environment

use std::path::PathBuf;

use clap::Parser;

use crate::{Error, Result};

/// Default namespace the management server runs in
pub const DEFAULT_SYSTEM_NAMESPACE: &str = "cattle-system";
/// Default name of the management server deployment and service
pub const DEFAULT_CONTROL_PLANE_SERVICE: &str = "rancher";
/// Default name of the secret holding the internal CA
pub const DEFAULT_INTERNAL_CA_SECRET: &str = "tls-rancher-internal-ca";

/// Controller mode arguments
#[derive(Parser, Debug, Clone)]
pub struct ControllerArgs {
    /// Namespace the management server runs in
    #[arg(long, env = "CATTLE_NAMESPACE", default_value = DEFAULT_SYSTEM_NAMESPACE)]
    pub system_namespace: String,

    /// Name of the management server deployment and service
    #[arg(long, env = "CONTROL_PLANE_SERVICE", default_value = DEFAULT_CONTROL_PLANE_SERVICE)]
    pub control_plane_service: String,

    /// Secret in the system namespace holding the internal CA (`tls.crt`)
    #[arg(long, env = "INTERNAL_CA_SECRET", default_value = DEFAULT_INTERNAL_CA_SECRET)]
    pub internal_ca_secret: String,

    /// External URL of the management server
    ///
    /// Overridden at runtime by the `server-url` setting when it is set.
    #[arg(long, env = "SERVER_URL")]
    pub server_url: Option<String>,

    /// PEM bundle agents use to trust the server URL
    ///
    /// Overridden at runtime by the `cacerts` setting when it is set.
    #[arg(long, env = "CA_FILE")]
    pub ca_file: Option<PathBuf>,

    /// Store minted tokens hashed
    ///
    /// Overridden at runtime by the `token-hashing` setting when it is set.
    #[arg(long, env = "TOKEN_HASHING")]
    pub token_hashing: bool,

    /// Kubeconfig to use instead of in-cluster or default discovery
    #[arg(long, env = "KUBECONFIG")]
    pub kubeconfig: Option<PathBuf>,
}

impl ControllerArgs {
    /// Resolve the arguments into a [`ManagerConfig`], reading the CA file
    pub async fn manager_config(&self) -> Result<ManagerConfig> {
        let ca_certs = match &self.ca_file {
            Some(path) => tokio::fs::read_to_string(path).await.map_err(|e| {
                Error::validation(format!("failed to read CA file {}: {e}", path.display()))
            })?,
            None => String::new(),
        };

        Ok(ManagerConfig {
            system_namespace: self.system_namespace.clone(),
            control_plane_service: self.control_plane_service.clone(),
            internal_ca_secret: self.internal_ca_secret.clone(),
            server_url: self.server_url.clone().unwrap_or_default(),
            ca_certs,
            token_hashing: self.token_hashing,
        })
    }
}

/// Static configuration of the credential manager
///
/// `server_url`, `ca_certs` and `token_hashing` are fallbacks for the
/// corresponding cluster settings.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ManagerConfig {
    /// Namespace the management server runs in
    pub system_namespace: String,
    /// Name of the management server deployment and service
    pub control_plane_service: String,
    /// Secret holding the internal CA
    pub internal_ca_secret: String,
    /// External server URL
    pub server_url: String,
    /// PEM bundle for the external server URL
    pub ca_certs: String,
    /// Whether tokens are stored hashed
    pub token_hashing: bool,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            system_namespace: DEFAULT_SYSTEM_NAMESPACE.to_string(),
            control_plane_service: DEFAULT_CONTROL_PLANE_SERVICE.to_string(),
            internal_ca_secret: DEFAULT_INTERNAL_CA_SECRET.to_string(),
            server_url: String::new(),
            ca_certs: String::new(),
            token_hashing: false,
        }
    }
}

impl ManagerConfig {
    /// URL of the management server inside the cluster network
    pub fn internal_server_url(&self) -> String {
        format!(
            "https://{}.{}",
            self.control_plane_service, self.system_namespace
        )
    }
}
