//! Static registry from Rust types to wire group/version/kind
//!
//! Generated objects reference each other by apiVersion/kind. Those strings
//! are looked up here rather than spelled out at each use, and a lookup for a
//! type nobody registered is a [`Error::TypeNotRegistered`].

use std::any::TypeId;
use std::collections::HashMap;

use k8s_openapi::api::core::v1::{Namespace, Secret};
use kube::api::GroupVersionKind;
use kube::Resource;

use crate::crd::{
    CapiCluster, ManagementCluster, MachineDeployment, RKEBootstrapTemplate, RKECluster,
};
use crate::{Error, Result};

/// Type-to-GVK table
#[derive(Clone, Debug, Default)]
pub struct Scheme {
    entries: HashMap<TypeId, GroupVersionKind>,
}

impl Scheme {
    /// An empty scheme
    pub fn new() -> Self {
        Self::default()
    }

    /// The scheme with every type the provisioner generates or applies
    pub fn provisioning() -> Self {
        Self::new()
            .register::<RKECluster>()
            .register::<RKEBootstrapTemplate>()
            .register::<CapiCluster>()
            .register::<MachineDeployment>()
            .register::<ManagementCluster>()
            .register::<Namespace>()
            .register::<Secret>()
    }

    /// Register `K` under its compiled-in group/version/kind
    pub fn register<K>(mut self) -> Self
    where
        K: Resource<DynamicType = ()> + 'static,
    {
        let gvk = GroupVersionKind::gvk(&K::group(&()), &K::version(&()), &K::kind(&()));
        self.entries.insert(TypeId::of::<K>(), gvk);
        self
    }

    /// The GVK registered for `K`
    pub fn gvk<K: 'static>(&self) -> Result<&GroupVersionKind> {
        self.entries
            .get(&TypeId::of::<K>())
            .ok_or_else(Error::type_not_registered::<K>)
    }

    /// The `apiVersion` and `kind` strings registered for `K`
    pub fn api_version_and_kind<K: 'static>(&self) -> Result<(String, String)> {
        let gvk = self.gvk::<K>()?;
        Ok((gvk.api_version(), gvk.kind.clone()))
    }

    /// Check that every generated type is registered
    ///
    /// Run once at start-up so a missing registration fails the process
    /// instead of every reconcile.
    pub fn validate(&self) -> Result<()> {
        self.gvk::<RKECluster>()?;
        self.gvk::<RKEBootstrapTemplate>()?;
        self.gvk::<CapiCluster>()?;
        self.gvk::<MachineDeployment>()?;
        self.gvk::<ManagementCluster>()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provisioning_scheme_resolves_control_plane() {
        let scheme = Scheme::provisioning();
        let (api_version, kind) = scheme
            .api_version_and_kind::<RKECluster>()
            .expect("registered");
        assert_eq!(api_version, "rke.cattle.io/v1");
        assert_eq!(kind, "RKECluster");
    }

    #[test]
    fn core_types_have_bare_version() {
        let scheme = Scheme::provisioning();
        let (api_version, kind) = scheme.api_version_and_kind::<Secret>().expect("registered");
        assert_eq!(api_version, "v1");
        assert_eq!(kind, "Secret");
    }

    #[test]
    fn unregistered_type_is_fatal() {
        let err = Scheme::new()
            .gvk::<RKECluster>()
            .expect_err("empty scheme has nothing");
        assert!(matches!(err, Error::TypeNotRegistered { .. }));
        assert!(!err.is_retryable());
    }

    #[test]
    fn validate_reports_missing_registration() {
        assert!(Scheme::provisioning().validate().is_ok());
        let partial = Scheme::new().register::<RKECluster>();
        assert!(partial.validate().is_err());
    }
}
