//! Controller implementations
//!
//! The cluster controller owns `Cluster` objects and everything generated
//! from them. The RKE controller defaults and reports on the control planes
//! it creates.

mod cluster;
mod import;
mod rke;

pub use cluster::{
    error_policy, node_config_mapper, reconcile, watch_cluster_deletions, Context,
    ContextBuilder, KubeClient, KubeClientImpl, CLUSTER_CREATE_SET_ID, CLUSTER_FINALIZER,
    CLUSTER_NAMESPACE_LABEL, CLUSTER_NAME_LABEL, RKE_CLUSTER_SET_ID,
};
pub use import::{
    import_url, Handshake, HandshakeStep, HttpsManifestFetcher, ImportHandshake,
    KubeManagementClient, ManagementClient, ManifestFetcher, AGENT_SETUP_SET_ID,
    HANDSHAKE_RETRY_DELAY,
};
pub use rke::{
    error_policy_rke, reconcile_rke, RkeClient, RkeClientImpl, RkeContext,
    DEFAULT_ENDPOINT_HOST, DEFAULT_ENDPOINT_PORT,
};
