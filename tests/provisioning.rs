//! End-to-end provisioning stories
//!
//! These tests drive the public API with in-memory collaborators: a cluster
//! is reconciled, its generated objects and kubeconfig are inspected, and an
//! imported cluster walks through the registration handshake.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ObjectReference, Secret};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use k8s_openapi::ByteString;
use kube::runtime::controller::Action;
use kube::ResourceExt;
use serde_json::{json, Map, Value};

use cluster_provisioner::apply::{Applier, ObjectSet, TargetApplierFactory};
use cluster_provisioner::config::ManagerConfig;
use cluster_provisioner::controller::{
    reconcile, Context, Handshake, HandshakeStep, ImportHandshake, KubeClient, ManagementClient,
    ManifestFetcher, CLUSTER_CREATE_SET_ID, CLUSTER_FINALIZER, RKE_CLUSTER_SET_ID,
};
use cluster_provisioner::crd::{
    Cluster, ClusterRegistrationToken, ClusterRegistrationTokenSpec,
    ClusterRegistrationTokenStatus, ClusterSpec, ClusterStatus, DynamicSchemaSpec,
    ImportedConfig, NodePool, RkeConfig, Token, User,
};
use cluster_provisioner::generator::{Generator, NodeConfigLookup};
use cluster_provisioner::index::InfraRefIndex;
use cluster_provisioner::kubeconfig::{
    secret_value, CredentialStore, Manager, StaticSettings, KUBECONFIG_KEY, TOKEN_KEY,
};
use cluster_provisioner::manifest::Manifest;
use cluster_provisioner::naming::management_cluster_name;
use cluster_provisioner::schema::SchemaLookup;
use cluster_provisioner::scheme::Scheme;
use cluster_provisioner::Result;

// =============================================================================
// In-memory collaborators
// =============================================================================

/// Node configs keyed by name
struct StaticNodeConfigs(BTreeMap<String, Value>);

#[async_trait]
impl NodeConfigLookup for StaticNodeConfigs {
    async fn get(
        &self,
        _api_version: &str,
        _kind: &str,
        _namespace: &str,
        name: &str,
    ) -> Result<Map<String, Value>> {
        match self.0.get(name) {
            Some(Value::Object(map)) => Ok(map.clone()),
            _ => Err(cluster_provisioner::Error::node_config(name, "not found")),
        }
    }
}

/// Schemas keyed by lowercase kind
struct StaticSchemas(BTreeMap<String, Vec<&'static str>>);

#[async_trait]
impl SchemaLookup for StaticSchemas {
    async fn get(&self, name: &str) -> Result<Option<DynamicSchemaSpec>> {
        Ok(self.0.get(name).map(|fields| DynamicSchemaSpec {
            resource_fields: fields.iter().map(|f| (f.to_string(), json!({}))).collect(),
        }))
    }
}

#[derive(Default)]
struct RecordingStatus(Mutex<Vec<ClusterStatus>>, Mutex<Vec<String>>);

impl RecordingStatus {
    fn finalizers(&self) -> Vec<String> {
        self.1.lock().unwrap().clone()
    }
}

#[async_trait]
impl KubeClient for RecordingStatus {
    async fn patch_status(&self, _: &str, _: &str, status: &ClusterStatus) -> Result<()> {
        self.0.lock().unwrap().push(status.clone());
        Ok(())
    }

    async fn add_finalizer(&self, _: &str, _: &str, finalizer: &str) -> Result<()> {
        self.1.lock().unwrap().push(finalizer.to_string());
        Ok(())
    }

    async fn remove_finalizer(&self, _: &str, _: &str, finalizer: &str) -> Result<()> {
        self.1.lock().unwrap().retain(|f| f != finalizer);
        Ok(())
    }
}

#[derive(Default)]
struct RecordingApplier(Mutex<Vec<ObjectSet>>);

impl RecordingApplier {
    fn set(&self, id: &str) -> Option<ObjectSet> {
        self.0
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|s| s.set_id == id)
            .cloned()
    }
}

#[async_trait]
impl Applier for RecordingApplier {
    async fn apply(&self, set: &ObjectSet) -> Result<()> {
        self.0.lock().unwrap().push(set.clone());
        Ok(())
    }
}

/// Users, tokens and secrets held in maps
#[derive(Default)]
struct MemoryCredentials {
    secrets: Mutex<BTreeMap<(String, String), Secret>>,
    users: Mutex<BTreeMap<String, User>>,
    tokens: Mutex<BTreeMap<String, Token>>,
}

#[async_trait]
impl CredentialStore for MemoryCredentials {
    fn cached_secret(&self, _: &str, _: &str) -> Option<Secret> {
        None
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>> {
        let key = (namespace.to_string(), name.to_string());
        Ok(self.secrets.lock().unwrap().get(&key).cloned())
    }

    async fn get_user(&self, name: &str) -> Result<Option<User>> {
        Ok(self.users.lock().unwrap().get(name).cloned())
    }

    async fn create_user(&self, user: &User) -> Result<()> {
        self.users.lock().unwrap().insert(user.name_any(), user.clone());
        Ok(())
    }

    async fn get_token(&self, name: &str) -> Result<Option<Token>> {
        Ok(self.tokens.lock().unwrap().get(name).cloned())
    }

    async fn delete_token(&self, name: &str) -> Result<()> {
        self.tokens.lock().unwrap().remove(name);
        Ok(())
    }

    async fn create_token(&self, token: &Token) -> Result<()> {
        self.tokens
            .lock()
            .unwrap()
            .insert(token.name_any(), token.clone());
        Ok(())
    }

    async fn deployment_replicas(&self, _: &str, _: &str) -> Result<Option<i32>> {
        Ok(None)
    }

    async fn daemonset_exists(&self, _: &str, _: &str) -> Result<bool> {
        Ok(false)
    }
}

/// Handshake that is never expected to run
struct NoHandshake;

#[async_trait]
impl Handshake for NoHandshake {
    async fn run(&self, cluster: &Cluster) -> Result<HandshakeStep> {
        panic!("handshake ran for provisioned cluster {}", cluster.name_any());
    }
}

fn manager_config() -> ManagerConfig {
    ManagerConfig {
        server_url: "https://rancher.example.com".to_string(),
        ..Default::default()
    }
}

fn demo_cluster() -> Cluster {
    let mut cluster = Cluster::new(
        "demo",
        ClusterSpec {
            kubernetes_version: Some("v1.21.4+rke2r2".to_string()),
            rke_config: Some(RkeConfig {
                node_pools: vec![NodePool {
                    name: "pool-a".to_string(),
                    quantity: Some(3),
                    etcd_role: Some(false),
                    control_plane_role: Some(true),
                    node_config: Some(ObjectReference {
                        kind: Some("DigitaloceanConfig".to_string()),
                        name: Some("do-small".to_string()),
                        ..Default::default()
                    }),
                    ..Default::default()
                }],
            }),
            ..Default::default()
        },
    );
    cluster.metadata.namespace = Some("ns1".to_string());
    cluster.metadata.uid = Some("6a0d3c9e-demo".to_string());
    cluster
}

fn provisioning_context() -> (Arc<Context>, Arc<RecordingStatus>, Arc<RecordingApplier>) {
    let scheme = Arc::new(Scheme::provisioning());
    let node_configs = StaticNodeConfigs(BTreeMap::from([(
        "do-small".to_string(),
        json!({
            "apiVersion": "rancher.cattle.io/v1",
            "kind": "DigitaloceanConfig",
            "metadata": {"name": "do-small", "namespace": "ns1"},
            "size": "s-2vcpu-4gb",
            "region": "nyc3",
        }),
    )]));
    let schemas = StaticSchemas(BTreeMap::from([(
        "digitaloceanconfig".to_string(),
        vec!["size", "region"],
    )]));

    let status = Arc::new(RecordingStatus::default());
    let applier = Arc::new(RecordingApplier::default());
    let manager = Arc::new(Manager::new(
        Arc::new(MemoryCredentials::default()),
        Arc::new(StaticSettings(manager_config())),
        manager_config(),
    ));

    let ctx = Context {
        kube: status.clone(),
        applier: applier.clone(),
        generator: Arc::new(Generator::new(
            Arc::new(node_configs),
            Arc::new(schemas),
            scheme.clone(),
        )),
        kubeconfigs: manager,
        handshake: Arc::new(NoHandshake),
        index: Arc::new(InfraRefIndex::new()),
        scheme,
    };
    (Arc::new(ctx), status, applier)
}

fn find<'a>(objects: &'a [Manifest], kind: &str, name: &str) -> &'a Manifest {
    objects
        .iter()
        .find(|o| o.kind == kind && o.metadata.name == name)
        .unwrap_or_else(|| panic!("{kind} {name} not generated"))
}

// =============================================================================
// Provisioned cluster
// =============================================================================

/// Story: demo/ns1 with one control-plane-only pool reconciles into the full
/// object graph, a management record and a kubeconfig secret
#[tokio::test]
async fn story_demo_cluster_is_provisioned() {
    let (ctx, status, applier) = provisioning_context();

    let action = reconcile(Arc::new(demo_cluster()), ctx.clone())
        .await
        .expect("reconcile");
    assert_eq!(action, Action::await_change());

    // The id is persisted and deterministic
    let id = management_cluster_name("ns1", "demo");
    let last = status.0.lock().unwrap().last().cloned().expect("status");
    assert_eq!(last.cluster_name.as_deref(), Some(id.as_str()));

    // Generated objects
    let set = applier.set(RKE_CLUSTER_SET_ID).expect("generated set");
    let objects = &set.objects;
    assert_eq!(objects.len(), 5);

    let control_plane = find(objects, "RKECluster", "demo");
    assert_eq!(
        control_plane.spec().expect("spec")["managementClusterName"],
        id.as_str()
    );
    find(objects, "Cluster", "demo");
    find(objects, "RKEBootstrapTemplate", "demo-bootstrap-template");

    let template = find(objects, "DigitaloceanMachineTemplate", "demo-nodepool-pool-a");
    assert_eq!(template.api_version, "rke-node.cattle.io/v1");
    let fields = &template.spec().expect("spec")["template"]["spec"];
    assert_eq!(fields["size"], "s-2vcpu-4gb");
    assert!(fields.get("metadata").is_none(), "schema should prune plumbing");

    let deployment = find(objects, "MachineDeployment", "demo-nodepool-pool-a");
    let spec = deployment.spec().expect("spec");
    assert_eq!(spec["replicas"], 3);
    let labels = &spec["template"]["metadata"]["labels"];
    assert_eq!(labels["rke.cattle.io/control-plane-role"], "true");
    assert_eq!(labels["cluster.x-k8s.io/control-plane"], "true");
    assert!(labels.get("rke.cattle.io/etcd-role").is_none());

    // Management record and kubeconfig
    let create = applier.set(CLUSTER_CREATE_SET_ID).expect("cluster-create set");
    let secret = find(&create.objects, "Secret", "demo-kubeconfig");
    assert_eq!(secret.metadata.namespace.as_deref(), Some("ns1"));
    let data = secret.body["data"].as_object().expect("secret data");
    assert!(data.contains_key(KUBECONFIG_KEY));
    assert!(data.contains_key(TOKEN_KEY));
}

/// Story: everything namespaced is owned by the cluster, and deleting it
/// prunes the cluster-scoped record before the finalizer is released
#[tokio::test]
async fn story_demo_cluster_is_cleaned_up() {
    let (ctx, status, applier) = provisioning_context();
    let cluster = demo_cluster();

    reconcile(Arc::new(cluster.clone()), ctx.clone())
        .await
        .expect("reconcile");
    assert_eq!(status.finalizers(), [CLUSTER_FINALIZER]);

    let generated = applier.set(RKE_CLUSTER_SET_ID).expect("generated set");
    for object in generated.labelled_objects() {
        let owners = &object.metadata.owner_references;
        assert_eq!(owners.len(), 1, "{} {}", object.kind, object.metadata.name);
        assert_eq!(owners[0].uid, "6a0d3c9e-demo");
    }
    let create = applier.set(CLUSTER_CREATE_SET_ID).expect("cluster-create set");
    let unowned: Vec<_> = create
        .labelled_objects()
        .into_iter()
        .filter(|o| o.metadata.owner_references.is_empty())
        .map(|o| o.kind)
        .collect();
    assert_eq!(unowned, ["Cluster", "Namespace"]);

    let mut deleting = cluster;
    deleting.metadata.finalizers = Some(status.finalizers());
    deleting.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
    reconcile(Arc::new(deleting), ctx.clone())
        .await
        .expect("cleanup");

    let cleanup = applier.set(CLUSTER_CREATE_SET_ID).expect("cleanup set");
    assert!(cleanup.objects.is_empty());
    assert_eq!(cleanup.prune_types.len(), 3);
    assert!(status.finalizers().is_empty());
    assert!(ctx.index.is_empty());
}

/// Story: the provisioned cluster is requeued when its node config changes
#[tokio::test]
async fn story_node_config_references_are_indexed() {
    let (ctx, _, _) = provisioning_context();

    reconcile(Arc::new(demo_cluster()), ctx.clone())
        .await
        .expect("reconcile");

    let clusters = ctx
        .index
        .lookup("rancher.cattle.io/v1/DigitaloceanConfig/ns1/do-small");
    assert_eq!(clusters.len(), 1);
    assert_eq!(clusters[0].name, "demo");
}

// =============================================================================
// Credentials
// =============================================================================

/// Story: the kubeconfig points at the cluster proxy and carries a fresh token
#[tokio::test]
async fn story_kubeconfig_secret_reaches_management_server() {
    let store = Arc::new(MemoryCredentials::default());
    let manager = Manager::new(
        store.clone(),
        Arc::new(StaticSettings(manager_config())),
        manager_config(),
    );
    let status = ClusterStatus::default().cluster_name("c-m-12345678");

    let secret = manager
        .get_kube_config(&demo_cluster(), &status)
        .await
        .expect("kubeconfig")
        .expect("secret generated");

    let kubeconfig = secret_value(&secret, KUBECONFIG_KEY).expect("value");
    assert!(kubeconfig.contains("https://rancher.example.com/k8s/clusters/c-m-12345678"));
    let token = secret_value(&secret, TOKEN_KEY).expect("token");
    let (user, _) = token.split_once(':').expect("user:token");
    assert!(user.starts_with("u-"));
    assert_eq!(store.users.lock().unwrap().len(), 1);
    assert_eq!(store.tokens.lock().unwrap().len(), 1);
}

// =============================================================================
// Imported cluster
// =============================================================================

/// Management server state that changes as the story progresses
#[derive(Default)]
struct MemoryManagement {
    cluster_exists: Mutex<bool>,
    tokens: Mutex<Vec<ClusterRegistrationToken>>,
    secrets: Mutex<BTreeMap<(String, String), Secret>>,
}

#[async_trait]
impl ManagementClient for MemoryManagement {
    async fn management_cluster_exists(&self, _: &str) -> Result<bool> {
        Ok(*self.cluster_exists.lock().unwrap())
    }

    async fn registration_tokens(&self, _: &str) -> Result<Vec<ClusterRegistrationToken>> {
        Ok(self.tokens.lock().unwrap().clone())
    }

    async fn create_registration_token(&self, cluster_name: &str) -> Result<()> {
        self.tokens.lock().unwrap().push(ClusterRegistrationToken::new(
            "import-abcde",
            ClusterRegistrationTokenSpec {
                cluster_name: cluster_name.to_string(),
            },
        ));
        Ok(())
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>> {
        let key = (namespace.to_string(), name.to_string());
        Ok(self.secrets.lock().unwrap().get(&key).cloned())
    }
}

struct StaticManifest;

#[async_trait]
impl ManifestFetcher for StaticManifest {
    async fn fetch(&self, _: &str, _: &str, _: &str) -> Result<String> {
        Ok("apiVersion: v1\nkind: Namespace\nmetadata:\n  name: cattle-system\n".to_string())
    }
}

struct SharedTarget(Arc<RecordingApplier>);

#[async_trait]
impl TargetApplierFactory for SharedTarget {
    async fn for_kubeconfig(&self, _: &[u8]) -> Result<Arc<dyn Applier>> {
        Ok(self.0.clone())
    }
}

/// Story: an imported cluster waits for each prerequisite in turn, then gets
/// the agent deployed exactly once
#[tokio::test]
async fn story_imported_cluster_registers() {
    let management = Arc::new(MemoryManagement::default());
    let downstream = Arc::new(RecordingApplier::default());
    let manager = Arc::new(Manager::new(
        Arc::new(MemoryCredentials::default()),
        Arc::new(StaticSettings(manager_config())),
        manager_config(),
    ));
    let handshake = ImportHandshake::new(
        management.clone(),
        Arc::new(StaticManifest),
        Arc::new(SharedTarget(downstream.clone())),
        manager,
    );

    let mut cluster = Cluster::new(
        "edge",
        ClusterSpec {
            imported_config: Some(ImportedConfig {
                kube_config_secret_name: "edge-import".to_string(),
            }),
            ..Default::default()
        },
    );
    cluster.metadata.namespace = Some("ns1".to_string());
    cluster.status = Some(ClusterStatus::default().cluster_name("c-m-abcdef01"));

    let step = handshake.run(&cluster).await.expect("run");
    assert_eq!(step, HandshakeStep::WaitingForManagedCluster);
    assert_eq!(step.requeue_after(), Some(Duration::from_secs(2)));
    assert!(management.tokens.lock().unwrap().is_empty());

    *management.cluster_exists.lock().unwrap() = true;
    assert_eq!(
        handshake.run(&cluster).await.expect("run"),
        HandshakeStep::WaitingForToken
    );
    assert_eq!(
        handshake.run(&cluster).await.expect("run"),
        HandshakeStep::WaitingForTokenValue
    );
    assert_eq!(management.tokens.lock().unwrap().len(), 1);

    management.tokens.lock().unwrap()[0].status = Some(ClusterRegistrationTokenStatus {
        token: "tok123".to_string(),
    });
    assert_eq!(
        handshake.run(&cluster).await.expect("run"),
        HandshakeStep::WaitingForKubeconfig
    );

    management.secrets.lock().unwrap().insert(
        ("ns1".to_string(), "edge-import".to_string()),
        Secret {
            data: Some(BTreeMap::from([(
                KUBECONFIG_KEY.to_string(),
                ByteString(b"apiVersion: v1\nkind: Config\n".to_vec()),
            )])),
            ..Default::default()
        },
    );
    assert_eq!(
        handshake.run(&cluster).await.expect("run"),
        HandshakeStep::Deployed
    );
    assert_eq!(downstream.0.lock().unwrap().len(), 1);

    cluster.status = cluster.status.map(|s| s.agent_deployed(true));
    assert_eq!(handshake.run(&cluster).await.expect("run"), HandshakeStep::Idle);
    assert_eq!(downstream.0.lock().unwrap().len(), 1);
}
