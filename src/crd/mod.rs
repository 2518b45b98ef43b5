//! Custom Resource Definitions used by the provisioner
//!
//! [`Cluster`] is the only resource this controller owns the schema for. The
//! rest mirror resources owned by other controllers, modelled to the extent
//! the provisioner reads or writes them.

mod capi;
mod cluster;
mod management;
mod rke;
mod types;

pub use capi::{
    Bootstrap, CapiClusterSpec, Cluster as CapiCluster, MachineDeployment, MachineDeploymentSpec,
    MachineDeploymentStrategy, MachineMetadata, MachineRollingUpdate, MachineSpec,
    MachineTemplateSpec, ROLLING_UPDATE_STRATEGY,
};
pub use cluster::{
    Cluster, ClusterApiConfig, ClusterSpec, ClusterStatus, ImportedConfig, RkeConfig,
};
pub use management::{
    ClusterRegistrationToken, ClusterRegistrationTokenSpec, ClusterRegistrationTokenStatus,
    Cluster as ManagementCluster, DynamicSchema, DynamicSchemaSpec, ManagementClusterSpec,
    ManagementImportedConfig, Setting, Token, User, MANAGEMENT_GROUP, MANAGEMENT_VERSION,
};
pub use rke::{
    RKEBootstrapTemplate, RKEBootstrapTemplateSpec, RKECluster, RKEClusterSpec,
    RKEClusterStatus, UpgradeStrategy,
};
pub use types::{
    CommonNodeConfig, Condition, ConditionStatus, Endpoint, NodePool, RollingUpdate,
    DEFAULT_NODE_CONFIG_API_VERSION,
};
