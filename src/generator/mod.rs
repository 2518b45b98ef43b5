//! Object graph generation for provisioned clusters
//!
//! [`Generator::generate`] turns a [`Cluster`] with node pools into the full,
//! ordered set of objects that realize it:
//!
//! 1. the RKE control plane (`RKECluster`)
//! 2. the Cluster API `Cluster` pointing at it
//! 3. one `RKEBootstrapTemplate` shared by all pools (when there are pools)
//! 4. per valid pool, a machine template and a `MachineDeployment`
//!
//! Output depends only on the cluster, the referenced node configs and the
//! dynamic schemas, so regenerating with unchanged inputs yields identical
//! objects. Any lookup failure aborts the whole set.

mod machine;

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::api::{Api, DynamicObject, GroupVersionKind};
use kube::discovery;
use kube::{Client, ResourceExt};
use serde_json::{Map, Value};
use tracing::{debug, instrument};

#[cfg(test)]
use mockall::automock;

use crate::crd::{
    CapiCluster, CapiClusterSpec, Cluster, MachineDeployment, RKEBootstrapTemplate, RKECluster,
    RKEClusterSpec, UpgradeStrategy,
};
use crate::manifest::{parse_api_version, Manifest};
use crate::scheme::Scheme;
use crate::schema::SchemaLookup;
use crate::{Error, Result};

/// API version of generated machine templates
pub const MACHINE_TEMPLATE_API_VERSION: &str = "rke-node.cattle.io/v1";

/// Read access to node pool infrastructure configs
#[cfg_attr(test, automock)]
#[async_trait]
pub trait NodeConfigLookup: Send + Sync {
    /// Fetch a node config object and return all of its fields
    async fn get(
        &self,
        api_version: &str,
        kind: &str,
        namespace: &str,
        name: &str,
    ) -> Result<Map<String, Value>>;
}

/// [`NodeConfigLookup`] resolving arbitrary kinds through API discovery
pub struct KubeNodeConfigLookup {
    client: Client,
}

impl KubeNodeConfigLookup {
    /// Create a new KubeNodeConfigLookup
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl NodeConfigLookup for KubeNodeConfigLookup {
    async fn get(
        &self,
        api_version: &str,
        kind: &str,
        namespace: &str,
        name: &str,
    ) -> Result<Map<String, Value>> {
        let key = format!("{api_version}/{kind}/{namespace}/{name}");
        let (group, version) = parse_api_version(api_version);
        let gvk = GroupVersionKind::gvk(group, version, kind);

        let (ar, _caps) = discovery::pinned_kind(&self.client, &gvk)
            .await
            .map_err(|e| Error::node_config(&key, format!("discovery failed: {e}")))?;
        let api: Api<DynamicObject> = Api::namespaced_with(self.client.clone(), namespace, &ar);
        let object = api
            .get(name)
            .await
            .map_err(|e| Error::node_config(&key, e.to_string()))?;

        match serde_json::to_value(object) {
            Ok(Value::Object(map)) => Ok(map),
            Ok(_) => Err(Error::node_config(&key, "object is not a map")),
            Err(e) => Err(Error::node_config(&key, e.to_string())),
        }
    }
}

/// Builds the desired object set for a cluster
pub struct Generator {
    node_configs: Arc<dyn NodeConfigLookup>,
    schemas: Arc<dyn SchemaLookup>,
    scheme: Arc<Scheme>,
}

impl Generator {
    /// Create a new Generator
    pub fn new(
        node_configs: Arc<dyn NodeConfigLookup>,
        schemas: Arc<dyn SchemaLookup>,
        scheme: Arc<Scheme>,
    ) -> Self {
        Self {
            node_configs,
            schemas,
            scheme,
        }
    }

    /// Types owned by the generated set
    ///
    /// Objects of these types that carry the set's label but are no longer
    /// generated get pruned. Machine templates are left alone.
    pub fn owned_types(&self) -> Result<Vec<GroupVersionKind>> {
        Ok(vec![
            self.scheme.gvk::<CapiCluster>()?.clone(),
            self.scheme.gvk::<MachineDeployment>()?.clone(),
            self.scheme.gvk::<RKECluster>()?.clone(),
            self.scheme.gvk::<RKEBootstrapTemplate>()?.clone(),
        ])
    }

    /// Generate every object for `cluster`
    #[instrument(skip(self, cluster), fields(cluster = %cluster.name_any()))]
    pub async fn generate(&self, cluster: &Cluster) -> Result<Vec<Manifest>> {
        let namespace = cluster
            .namespace()
            .ok_or_else(|| Error::validation("cluster has no namespace"))?;

        let rke = rke_cluster(cluster, &namespace);
        let capi = self.capi_cluster(&rke)?;

        let mut objects = vec![Manifest::from_resource(&rke)?, Manifest::from_resource(&capi)?];
        objects.extend(self.machine_objects(cluster, &capi.name_any(), &namespace).await?);

        debug!(count = objects.len(), "generated cluster objects");
        Ok(objects)
    }

    /// Cluster API cluster whose infrastructure is the RKE control plane
    fn capi_cluster(&self, rke: &RKECluster) -> Result<CapiCluster> {
        let (api_version, kind) = self.scheme.api_version_and_kind::<RKECluster>()?;

        let mut capi = CapiCluster::new(
            &rke.name_any(),
            CapiClusterSpec {
                infrastructure_ref: Some(ObjectReference {
                    api_version: Some(api_version),
                    kind: Some(kind),
                    namespace: rke.namespace(),
                    name: Some(rke.name_any()),
                    ..Default::default()
                }),
            },
        );
        capi.metadata.namespace = rke.namespace();
        Ok(capi)
    }
}

/// RKE control plane projected from the cluster spec
fn rke_cluster(cluster: &Cluster, namespace: &str) -> RKECluster {
    let mut rke = RKECluster::new(
        &cluster.name_any(),
        RKEClusterSpec {
            control_plane_endpoint: None,
            cloud_credential_secret_name: cluster.spec.cloud_credential_secret_name.clone(),
            kubernetes_version: cluster.spec.kubernetes_version.clone(),
            upgrade_strategy: UpgradeStrategy::default(),
            management_cluster_name: cluster.management_cluster().unwrap_or_default().to_string(),
        },
    );
    rke.metadata.namespace = Some(namespace.to_string());
    rke
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{ClusterSpec, ClusterStatus, NodePool, RkeConfig};
    use crate::schema::MockSchemaLookup;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use serde_json::json;

    pub(super) fn sample_cluster(pools: Vec<NodePool>) -> Cluster {
        Cluster {
            metadata: ObjectMeta {
                name: Some("demo".to_string()),
                namespace: Some("ns1".to_string()),
                ..Default::default()
            },
            spec: ClusterSpec {
                kubernetes_version: Some("v1.21.4+rke2r2".to_string()),
                cloud_credential_secret_name: Some("ns1:do-creds".to_string()),
                rke_config: Some(RkeConfig { node_pools: pools }),
                ..Default::default()
            },
            status: Some(ClusterStatus::default().cluster_name("c-m-12345678")),
        }
    }

    pub(super) fn do_pool(name: &str) -> NodePool {
        NodePool {
            name: name.to_string(),
            quantity: Some(3),
            node_config: Some(ObjectReference {
                kind: Some("DigitaloceanConfig".to_string()),
                name: Some("do-small".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    pub(super) fn generator_with_config(config: Value) -> Generator {
        let mut node_configs = MockNodeConfigLookup::new();
        node_configs.expect_get().returning(move |_, _, _, _| match config.clone() {
            Value::Object(map) => Ok(map),
            _ => Ok(Map::new()),
        });
        let mut schemas = MockSchemaLookup::new();
        schemas.expect_get().returning(|_| Ok(None));
        Generator::new(
            Arc::new(node_configs),
            Arc::new(schemas),
            Arc::new(Scheme::provisioning()),
        )
    }

    /// Story: a cluster without pools still gets a control plane and CAPI cluster
    #[tokio::test]
    async fn story_control_plane_objects_come_first() {
        let generator = generator_with_config(json!({}));
        let cluster = sample_cluster(vec![]);

        let objects = generator.generate(&cluster).await.expect("generate");

        assert_eq!(objects.len(), 2);
        assert_eq!(objects[0].kind, "RKECluster");
        assert_eq!(objects[0].metadata.name, "demo");
        assert_eq!(objects[1].kind, "Cluster");
        assert_eq!(objects[1].api_version, "cluster.x-k8s.io/v1alpha4");
    }

    /// Story: the control plane is a projection of the cluster spec
    #[tokio::test]
    async fn story_control_plane_projects_cluster_fields() {
        let generator = generator_with_config(json!({}));
        let objects = generator
            .generate(&sample_cluster(vec![]))
            .await
            .expect("generate");

        let spec = objects[0].spec().expect("spec");
        assert_eq!(spec["kubernetesVersion"], "v1.21.4+rke2r2");
        assert_eq!(spec["cloudCredentialSecretName"], "ns1:do-creds");
        assert_eq!(spec["managementClusterName"], "c-m-12345678");
        assert_eq!(spec["upgradeStrategy"], json!({}));
    }

    /// Story: the CAPI cluster's infrastructure is the RKE control plane
    #[tokio::test]
    async fn story_capi_cluster_references_control_plane() {
        let generator = generator_with_config(json!({}));
        let objects = generator
            .generate(&sample_cluster(vec![]))
            .await
            .expect("generate");

        let infra = &objects[1].spec().expect("spec")["infrastructureRef"];
        assert_eq!(
            infra,
            &json!({
                "apiVersion": "rke.cattle.io/v1",
                "kind": "RKECluster",
                "namespace": "ns1",
                "name": "demo",
            })
        );
    }

    /// Story: an incomplete scheme is a fatal build problem
    #[tokio::test]
    async fn story_unregistered_control_plane_type_is_fatal() {
        let generator = Generator::new(
            Arc::new(MockNodeConfigLookup::new()),
            Arc::new(MockSchemaLookup::new()),
            Arc::new(Scheme::new()),
        );

        let err = generator
            .generate(&sample_cluster(vec![]))
            .await
            .expect_err("should fail");
        assert!(matches!(err, Error::TypeNotRegistered { .. }));
    }

    /// Story: regenerating with unchanged inputs yields byte-identical output
    #[tokio::test]
    async fn story_generation_is_idempotent() {
        let generator = generator_with_config(json!({"size": "s-2vcpu-4gb", "region": "nyc3"}));
        let mut pool = do_pool("pool-a");
        pool.common.labels.insert("tier".to_string(), "web".to_string());
        let cluster = sample_cluster(vec![pool, do_pool("pool-b")]);

        let first = generator.generate(&cluster).await.expect("generate");
        let second = generator.generate(&cluster).await.expect("generate");

        assert_eq!(
            serde_json::to_vec(&first).expect("serialize"),
            serde_json::to_vec(&second).expect("serialize")
        );
    }

    #[tokio::test]
    async fn owned_types_cover_pruned_kinds() {
        let generator = generator_with_config(json!({}));
        let kinds: Vec<_> = generator
            .owned_types()
            .expect("registered")
            .into_iter()
            .map(|gvk| gvk.kind)
            .collect();
        assert_eq!(
            kinds,
            ["Cluster", "MachineDeployment", "RKECluster", "RKEBootstrapTemplate"]
        );
    }
}
