//! Per-node-pool machine objects

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::ObjectReference;
use serde_json::{json, Value};
use tracing::debug;

use super::{Generator, MACHINE_TEMPLATE_API_VERSION};
use crate::crd::{
    Bootstrap, Cluster, MachineDeployment, MachineDeploymentSpec, MachineDeploymentStrategy,
    MachineMetadata, MachineRollingUpdate, MachineSpec, MachineTemplateSpec, NodePool,
    RKEBootstrapTemplate, RKEBootstrapTemplateSpec, DEFAULT_NODE_CONFIG_API_VERSION,
    ROLLING_UPDATE_STRATEGY,
};
use crate::manifest::Manifest;
use crate::naming;
use crate::schema;
use crate::{Error, Result};

/// Machine label marking etcd nodes
pub const ETCD_ROLE_LABEL: &str = "rke.cattle.io/etcd-role";
/// Machine label marking control plane nodes
pub const CONTROL_PLANE_ROLE_LABEL: &str = "rke.cattle.io/control-plane-role";
/// Cluster API's own control plane machine label
pub const CAPI_CONTROL_PLANE_LABEL: &str = "cluster.x-k8s.io/control-plane";
/// Machine annotation carrying the pool's node labels as JSON
pub const LABELS_ANNOTATION: &str = "rke.cattle.io/labels";
/// Machine annotation carrying the pool's node taints as JSON
pub const TAINTS_ANNOTATION: &str = "rke.cattle.io/taints";

impl Generator {
    /// Bootstrap template plus a machine template and deployment per valid pool
    pub(super) async fn machine_objects(
        &self,
        cluster: &Cluster,
        capi_cluster_name: &str,
        namespace: &str,
    ) -> Result<Vec<Manifest>> {
        let pools = cluster
            .spec
            .rke_config
            .as_ref()
            .map(|rke| rke.node_pools.as_slice())
            .unwrap_or_default();
        if pools.is_empty() {
            return Ok(Vec::new());
        }

        let cluster_name = cluster.metadata.name.as_deref().unwrap_or_default();
        let bootstrap = bootstrap_template(cluster_name, namespace);
        let bootstrap_ref = self.reference_to(&bootstrap)?;
        let mut objects = vec![Manifest::from_resource(&bootstrap)?];

        for pool in pools {
            let Some(node_config) = pool.complete_node_config() else {
                debug!(pool = %pool.name, "skipping node pool without a complete node config");
                continue;
            };

            let pool_name = naming::node_pool_name(cluster_name, &pool.name);
            let template = self
                .machine_template(&pool_name, namespace, pool, node_config)
                .await?;
            let infrastructure_ref = ObjectReference {
                api_version: Some(template.api_version.clone()),
                kind: Some(template.kind.clone()),
                namespace: Some(namespace.to_string()),
                name: Some(pool_name.clone()),
                ..Default::default()
            };
            objects.push(template);

            let deployment = machine_deployment(
                &pool_name,
                namespace,
                capi_cluster_name,
                pool,
                bootstrap_ref.clone(),
                infrastructure_ref,
            )?;
            objects.push(Manifest::from_resource(&deployment)?);
        }

        Ok(objects)
    }

    /// Machine template embedding the pool's pruned node config
    async fn machine_template(
        &self,
        pool_name: &str,
        namespace: &str,
        pool: &NodePool,
        node_config: &ObjectReference,
    ) -> Result<Manifest> {
        let api_version = node_config
            .api_version
            .as_deref()
            .filter(|v| !v.is_empty())
            .unwrap_or(DEFAULT_NODE_CONFIG_API_VERSION);
        let kind = node_config.kind.as_deref().unwrap_or_default();
        let name = node_config.name.as_deref().unwrap_or_default();

        let mut fields = self
            .node_configs
            .get(api_version, kind, namespace, name)
            .await?;
        schema::prune(kind, &mut fields, self.schemas.as_ref()).await?;

        let common = serde_json::to_value(&pool.common)
            .map_err(|e| Error::serialization(format!("node pool {}: {e}", pool.name)))?;
        fields.insert("common".to_string(), common);

        Ok(Manifest::new(
            MACHINE_TEMPLATE_API_VERSION,
            machine_template_kind(kind),
            pool_name,
            Some(namespace.to_string()),
        )
        .with_spec(json!({ "template": { "spec": Value::Object(fields) } })))
    }

    /// Reference to a generated object, typed through the scheme
    fn reference_to(&self, template: &RKEBootstrapTemplate) -> Result<ObjectReference> {
        let (api_version, kind) = self
            .scheme
            .api_version_and_kind::<RKEBootstrapTemplate>()?;
        Ok(ObjectReference {
            api_version: Some(api_version),
            kind: Some(kind),
            namespace: template.metadata.namespace.clone(),
            name: template.metadata.name.clone(),
            ..Default::default()
        })
    }
}

/// `FooConfig` becomes `FooMachineTemplate`
fn machine_template_kind(config_kind: &str) -> String {
    format!(
        "{}MachineTemplate",
        config_kind.strip_suffix("Config").unwrap_or(config_kind)
    )
}

fn bootstrap_template(cluster_name: &str, namespace: &str) -> RKEBootstrapTemplate {
    let mut template = RKEBootstrapTemplate::new(
        &naming::bootstrap_template_name(cluster_name),
        RKEBootstrapTemplateSpec {},
    );
    template.metadata.namespace = Some(namespace.to_string());
    template
}

fn machine_deployment(
    pool_name: &str,
    namespace: &str,
    capi_cluster_name: &str,
    pool: &NodePool,
    bootstrap_ref: ObjectReference,
    infrastructure_ref: ObjectReference,
) -> Result<MachineDeployment> {
    let strategy = pool.rolling_update.as_ref().map(|r| MachineDeploymentStrategy {
        type_: ROLLING_UPDATE_STRATEGY.to_string(),
        rolling_update: Some(MachineRollingUpdate {
            max_unavailable: r.max_unavailable.clone(),
            max_surge: r.max_surge.clone(),
        }),
    });

    let mut deployment = MachineDeployment::new(
        pool_name,
        MachineDeploymentSpec {
            cluster_name: capi_cluster_name.to_string(),
            replicas: pool.quantity,
            selector: None,
            template: MachineTemplateSpec {
                metadata: MachineMetadata {
                    labels: role_labels(pool),
                    annotations: node_annotations(pool)?,
                },
                spec: MachineSpec {
                    cluster_name: capi_cluster_name.to_string(),
                    bootstrap: Bootstrap {
                        config_ref: Some(bootstrap_ref),
                    },
                    infrastructure_ref,
                },
            },
            strategy,
            paused: pool.paused,
        },
    );
    deployment.metadata.namespace = Some(namespace.to_string());
    Ok(deployment)
}

/// Role labels; etcd and control-plane roles default to on
fn role_labels(pool: &NodePool) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    if pool.is_etcd() {
        labels.insert(ETCD_ROLE_LABEL.to_string(), "true".to_string());
    }
    if pool.is_control_plane() {
        labels.insert(CONTROL_PLANE_ROLE_LABEL.to_string(), "true".to_string());
        labels.insert(CAPI_CONTROL_PLANE_LABEL.to_string(), "true".to_string());
    }
    labels
}

/// Node labels and taints, JSON-encoded into machine annotations
fn node_annotations(pool: &NodePool) -> Result<BTreeMap<String, String>> {
    let mut annotations = BTreeMap::new();
    if !pool.common.labels.is_empty() {
        let encoded = serde_json::to_string(&pool.common.labels)
            .map_err(|e| Error::serialization(format!("node pool {} labels: {e}", pool.name)))?;
        annotations.insert(LABELS_ANNOTATION.to_string(), encoded);
    }
    if !pool.common.taints.is_empty() {
        let encoded = serde_json::to_string(&pool.common.taints)
            .map_err(|e| Error::serialization(format!("node pool {} taints: {e}", pool.name)))?;
        annotations.insert(TAINTS_ANNOTATION.to_string(), encoded);
    }
    Ok(annotations)
}
