//! Cluster controller implementation
//!
//! Every pass makes sure the cluster has a management cluster record, a
//! namespace for its registration tokens and, where one applies, a kubeconfig
//! secret. Provisioned clusters then get their generated object set applied;
//! imported clusters advance the agent handshake instead.
//!
//! Namespaced objects are owned by the cluster and garbage collected with it.
//! A finalizer holds deletion until the cluster-scoped management record and
//! namespace are removed.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::api::core::v1::{Namespace, Secret};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, ApiResource, DynamicObject, GroupVersionKind, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::runtime::reflector::{self, ObjectRef, Store};
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Client, ResourceExt};
use tracing::{debug, error, info, instrument, warn};

#[cfg(test)]
use mockall::automock;

use super::import::{
    Handshake, HandshakeStep, HttpsManifestFetcher, ImportHandshake, KubeManagementClient,
};
use crate::apply::{Applier, KubeApplier, KubeTargetApplierFactory, ObjectSet, FIELD_MANAGER};
use crate::config::ManagerConfig;
use crate::crd::{
    Cluster, ClusterStatus, Condition, ConditionStatus, ManagementCluster, ManagementClusterSpec,
    ManagementImportedConfig,
};
use crate::generator::{Generator, KubeNodeConfigLookup};
use crate::index::{object_key, ClusterKey, InfraRefIndex};
use crate::kubeconfig::{KubeCredentialStore, KubeSettings, KubeconfigProvider, Manager};
use crate::manifest::Manifest;
use crate::naming::management_cluster_name;
use crate::schema::KubeSchemaLookup;
use crate::scheme::Scheme;
use crate::{Error, Result};

/// Set id of the management record, namespace and kubeconfig secret
pub const CLUSTER_CREATE_SET_ID: &str = "cluster-create";
/// Set id of the generated provisioning objects
pub const RKE_CLUSTER_SET_ID: &str = "rke-cluster";

/// Label on management clusters naming the owning cluster's namespace
pub const CLUSTER_NAMESPACE_LABEL: &str = "rancher.cattle.io/cluster-namespace";
/// Label on management clusters naming the owning cluster
pub const CLUSTER_NAME_LABEL: &str = "rancher.cattle.io/cluster-name";

/// Finalizer held until cluster-scoped objects are cleaned up
pub const CLUSTER_FINALIZER: &str = "rancher.cattle.io/cluster-cleanup";

const VALIDATION_FAILED_REASON: &str = "ValidationFailed";

/// Trait abstracting Kubernetes client operations for Cluster
#[cfg_attr(test, automock)]
#[async_trait]
pub trait KubeClient: Send + Sync {
    /// Patch the status of a Cluster
    async fn patch_status(&self, namespace: &str, name: &str, status: &ClusterStatus)
        -> Result<()>;

    /// Add a finalizer to a Cluster
    async fn add_finalizer(&self, namespace: &str, name: &str, finalizer: &str) -> Result<()>;

    /// Remove a finalizer from a Cluster; a missing cluster is not an error
    async fn remove_finalizer(&self, namespace: &str, name: &str, finalizer: &str)
        -> Result<()>;
}

/// Real Kubernetes client implementation
pub struct KubeClientImpl {
    client: Client,
}

impl KubeClientImpl {
    /// Create a new KubeClientImpl wrapping the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl KubeClient for KubeClientImpl {
    async fn patch_status(
        &self,
        namespace: &str,
        name: &str,
        status: &ClusterStatus,
    ) -> Result<()> {
        let api: Api<Cluster> = Api::namespaced(self.client.clone(), namespace);

        let status_patch = serde_json::json!({
            "status": status
        });

        api.patch_status(
            name,
            &PatchParams::apply(FIELD_MANAGER),
            &Patch::Merge(&status_patch),
        )
        .await?;

        Ok(())
    }

    async fn add_finalizer(&self, namespace: &str, name: &str, finalizer: &str) -> Result<()> {
        let api: Api<Cluster> = Api::namespaced(self.client.clone(), namespace);

        let cluster = api.get(name).await?;
        let mut finalizers = cluster.metadata.finalizers.unwrap_or_default();
        if finalizers.iter().any(|f| f == finalizer) {
            return Ok(());
        }
        finalizers.push(finalizer.to_string());

        let patch = serde_json::json!({
            "metadata": {
                "finalizers": finalizers
            }
        });
        api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;

        Ok(())
    }

    async fn remove_finalizer(
        &self,
        namespace: &str,
        name: &str,
        finalizer: &str,
    ) -> Result<()> {
        let api: Api<Cluster> = Api::namespaced(self.client.clone(), namespace);

        let Some(cluster) = api.get_opt(name).await? else {
            return Ok(());
        };
        let finalizers: Vec<String> = cluster
            .metadata
            .finalizers
            .unwrap_or_default()
            .into_iter()
            .filter(|f| f != finalizer)
            .collect();

        let patch = serde_json::json!({
            "metadata": {
                "finalizers": finalizers
            }
        });
        api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;

        Ok(())
    }
}

/// Controller context shared by every reconcile
///
/// ```ignore
/// let ctx = Context::builder(client)
///     .manager_config(config)
///     .secret_cache(secrets)
///     .index(index)
///     .build();
/// ```
pub struct Context {
    /// Status writes
    pub kube: Arc<dyn KubeClient>,
    /// Apply engine for the management cluster
    pub applier: Arc<dyn Applier>,
    /// Object graph generator
    pub generator: Arc<Generator>,
    /// Kubeconfig secrets for provisioned clusters
    pub kubeconfigs: Arc<dyn KubeconfigProvider>,
    /// Agent deployment for imported clusters
    pub handshake: Arc<dyn Handshake>,
    /// Node config to cluster reverse index
    pub index: Arc<InfraRefIndex>,
    /// Type registry
    pub scheme: Arc<Scheme>,
}

impl Context {
    /// Create a builder for constructing a Context
    pub fn builder(client: Client) -> ContextBuilder {
        ContextBuilder::new(client)
    }

    /// Create a context for testing with custom collaborators
    #[cfg(test)]
    pub fn for_testing(
        kube: Arc<dyn KubeClient>,
        applier: Arc<dyn Applier>,
        generator: Arc<Generator>,
        kubeconfigs: Arc<dyn KubeconfigProvider>,
        handshake: Arc<dyn Handshake>,
    ) -> Self {
        Self {
            kube,
            applier,
            generator,
            kubeconfigs,
            handshake,
            index: Arc::new(InfraRefIndex::new()),
            scheme: Arc::new(Scheme::provisioning()),
        }
    }
}

/// Builder for constructing [`Context`] instances
pub struct ContextBuilder {
    client: Client,
    config: ManagerConfig,
    secrets: Option<Store<Secret>>,
    index: Option<Arc<InfraRefIndex>>,
    scheme: Option<Arc<Scheme>>,
    kube: Option<Arc<dyn KubeClient>>,
    applier: Option<Arc<dyn Applier>>,
    kubeconfigs: Option<Arc<dyn KubeconfigProvider>>,
    handshake: Option<Arc<dyn Handshake>>,
}

impl ContextBuilder {
    fn new(client: Client) -> Self {
        Self {
            client,
            config: ManagerConfig::default(),
            secrets: None,
            index: None,
            scheme: None,
            kube: None,
            applier: None,
            kubeconfigs: None,
            handshake: None,
        }
    }

    /// Set the credential manager configuration
    pub fn manager_config(mut self, config: ManagerConfig) -> Self {
        self.config = config;
        self
    }

    /// Read cached secrets from this store
    ///
    /// Without one every token lookup falls through to the API server.
    pub fn secret_cache(mut self, secrets: Store<Secret>) -> Self {
        self.secrets = Some(secrets);
        self
    }

    /// Share a reverse index with the node config watches
    pub fn index(mut self, index: Arc<InfraRefIndex>) -> Self {
        self.index = Some(index);
        self
    }

    /// Use this scheme instead of [`Scheme::provisioning`]
    pub fn scheme(mut self, scheme: Arc<Scheme>) -> Self {
        self.scheme = Some(scheme);
        self
    }

    /// Override the Kubernetes client (primarily for testing)
    pub fn kube_client(mut self, kube: Arc<dyn KubeClient>) -> Self {
        self.kube = Some(kube);
        self
    }

    /// Override the apply engine (primarily for testing)
    pub fn applier(mut self, applier: Arc<dyn Applier>) -> Self {
        self.applier = Some(applier);
        self
    }

    /// Override the kubeconfig source (primarily for testing)
    pub fn kubeconfigs(mut self, kubeconfigs: Arc<dyn KubeconfigProvider>) -> Self {
        self.kubeconfigs = Some(kubeconfigs);
        self
    }

    /// Override the import handshake (primarily for testing)
    pub fn handshake(mut self, handshake: Arc<dyn Handshake>) -> Self {
        self.handshake = Some(handshake);
        self
    }

    /// Build the Context
    pub fn build(self) -> Context {
        let client = self.client;
        let scheme = self
            .scheme
            .unwrap_or_else(|| Arc::new(Scheme::provisioning()));

        let manager = Arc::new(Manager::new(
            Arc::new(KubeCredentialStore::new(
                client.clone(),
                self.secrets.unwrap_or_else(|| reflector::store().0),
            )),
            Arc::new(KubeSettings::new(client.clone(), self.config.clone())),
            self.config,
        ));

        let handshake = self.handshake.unwrap_or_else(|| {
            Arc::new(ImportHandshake::new(
                Arc::new(KubeManagementClient::new(client.clone())),
                Arc::new(HttpsManifestFetcher),
                Arc::new(KubeTargetApplierFactory),
                manager.clone(),
            ))
        });

        Context {
            kube: self
                .kube
                .unwrap_or_else(|| Arc::new(KubeClientImpl::new(client.clone()))),
            applier: self
                .applier
                .unwrap_or_else(|| Arc::new(KubeApplier::new(client.clone()))),
            generator: Arc::new(Generator::new(
                Arc::new(KubeNodeConfigLookup::new(client.clone())),
                Arc::new(KubeSchemaLookup::new(client.clone())),
                scheme.clone(),
            )),
            kubeconfigs: self.kubeconfigs.unwrap_or(manager),
            handshake,
            index: self.index.unwrap_or_default(),
            scheme,
        }
    }
}

/// Reconcile a Cluster resource
#[instrument(skip(cluster, ctx), fields(cluster = %cluster.name_any()))]
pub async fn reconcile(cluster: Arc<Cluster>, ctx: Arc<Context>) -> Result<Action> {
    let name = cluster.name_any();
    let namespace = cluster
        .namespace()
        .ok_or_else(|| Error::validation("cluster has no namespace"))?;

    if cluster.metadata.deletion_timestamp.is_some() {
        return handle_deletion(&cluster, &ctx).await;
    }

    info!("reconciling cluster");
    if !has_finalizer(&cluster) {
        info!("adding cleanup finalizer");
        ctx.kube
            .add_finalizer(&namespace, &name, CLUSTER_FINALIZER)
            .await?;
    }
    let current = cluster.status.clone().unwrap_or_default();

    if let Err(e) = cluster.spec.validate() {
        warn!(error = %e, "cluster validation failed");
        let status = current.clone().condition(Condition::new(
            "Ready",
            ConditionStatus::False,
            VALIDATION_FAILED_REASON,
            e.to_string(),
        ));
        if status != current {
            ctx.kube.patch_status(&namespace, &name, &status).await?;
        }
        // Don't requeue for validation errors - they require spec changes
        return Ok(Action::await_change());
    }

    let mut status = current.clone();
    status
        .conditions
        .retain(|c| c.reason != VALIDATION_FAILED_REASON);

    let mut persisted = current;
    if status.management_cluster().is_none() {
        let id = management_cluster_name(&namespace, &name);
        info!(management_cluster = %id, "assigned management cluster");
        status.cluster_name = Some(id);
        ctx.kube.patch_status(&namespace, &name, &status).await?;
        persisted = status.clone();
    }

    // Downstream steps read the id from status
    let mut observed = (*cluster).clone();
    observed.status = Some(status.clone());

    apply_cluster_create(&observed, &status, &ctx).await?;
    ctx.index.update(&observed);

    let action = if observed.spec.rke_config.is_some() {
        apply_generated(&observed, &ctx).await?;
        Action::await_change()
    } else if observed.spec.is_imported() {
        let step = ctx.handshake.run(&observed).await?;
        debug!(?step, "import handshake");
        if step == HandshakeStep::Deployed {
            status.agent_deployed = true;
        }
        step.requeue_after()
            .map(Action::requeue)
            .unwrap_or_else(Action::await_change)
    } else {
        Action::await_change()
    };

    status.observed_generation = cluster.metadata.generation;
    if status != persisted {
        ctx.kube.patch_status(&namespace, &name, &status).await?;
    }

    Ok(action)
}

/// Apply the management cluster record, its namespace and the kubeconfig
async fn apply_cluster_create(
    cluster: &Cluster,
    status: &ClusterStatus,
    ctx: &Context,
) -> Result<()> {
    let name = cluster.name_any();
    let namespace = cluster.namespace().unwrap_or_default();
    let id = status
        .management_cluster()
        .ok_or_else(|| Error::internal("management cluster name not assigned"))?;

    let mut objects = vec![
        Manifest::from_resource(&management_cluster(cluster, id))?,
        Manifest::from_resource(&Namespace {
            metadata: ObjectMeta {
                name: Some(id.to_string()),
                ..Default::default()
            },
            ..Default::default()
        })?,
    ];
    if let Some(secret) = ctx.kubeconfigs.kubeconfig_secret(cluster, status).await? {
        objects.push(Manifest::from_resource(&secret)?);
    }

    let set = ObjectSet::new(CLUSTER_CREATE_SET_ID, &namespace, &name)
        .with_objects(objects)
        .with_prune_types(cluster_create_types(&ctx.scheme)?)
        .with_owner(cluster);
    ctx.applier.apply(&set).await
}

/// Types owned by the `cluster-create` set
fn cluster_create_types(scheme: &Scheme) -> Result<Vec<GroupVersionKind>> {
    Ok(vec![
        scheme.gvk::<ManagementCluster>()?.clone(),
        scheme.gvk::<Namespace>()?.clone(),
        scheme.gvk::<Secret>()?.clone(),
    ])
}

fn has_finalizer(cluster: &Cluster) -> bool {
    cluster
        .metadata
        .finalizers
        .as_ref()
        .is_some_and(|f| f.iter().any(|s| s == CLUSTER_FINALIZER))
}

/// Clean up a deleting cluster and release its finalizer
///
/// Generated objects and the kubeconfig secret go with the cluster through
/// their owner references. The management record and id namespace are
/// cluster-scoped, so the `cluster-create` set is emptied here, which prunes
/// them.
async fn handle_deletion(cluster: &Cluster, ctx: &Context) -> Result<Action> {
    let name = cluster.name_any();
    let namespace = cluster.namespace().unwrap_or_default();
    ctx.index.remove(&namespace, &name);

    if !has_finalizer(cluster) {
        debug!("cluster is being deleted");
        return Ok(Action::await_change());
    }

    let set = ObjectSet::new(CLUSTER_CREATE_SET_ID, &namespace, &name)
        .with_prune_types(cluster_create_types(&ctx.scheme)?);
    ctx.applier.apply(&set).await?;

    ctx.kube
        .remove_finalizer(&namespace, &name, CLUSTER_FINALIZER)
        .await?;
    info!("cluster cleanup complete");
    Ok(Action::await_change())
}

/// The management cluster record backing `cluster`
fn management_cluster(cluster: &Cluster, id: &str) -> ManagementCluster {
    let mut record = ManagementCluster::new(
        id,
        ManagementClusterSpec {
            display_name: cluster.name_any(),
            fleet_workspace_name: cluster.namespace(),
            imported_config: cluster
                .spec
                .is_imported()
                .then(ManagementImportedConfig::default),
        },
    );
    record.metadata.labels = Some(
        [
            (
                CLUSTER_NAMESPACE_LABEL.to_string(),
                cluster.namespace().unwrap_or_default(),
            ),
            (CLUSTER_NAME_LABEL.to_string(), cluster.name_any()),
        ]
        .into(),
    );
    record
}

/// Generate and apply the provisioning objects
async fn apply_generated(cluster: &Cluster, ctx: &Context) -> Result<()> {
    let objects = ctx.generator.generate(cluster).await?;
    info!(count = objects.len(), "applying generated objects");

    let set = ObjectSet::new(
        RKE_CLUSTER_SET_ID,
        cluster.namespace().unwrap_or_default(),
        cluster.name_any(),
    )
    .with_objects(objects)
    .with_prune_types(ctx.generator.owned_types()?)
    .with_owner(cluster);
    ctx.applier.apply(&set).await
}

/// Error policy for the controller
///
/// Errors that need a spec change or a new build wait for the next change;
/// everything else is retried after five seconds.
pub fn error_policy(cluster: Arc<Cluster>, error: &Error, _ctx: Arc<Context>) -> Action {
    error!(
        ?error,
        cluster = %cluster.name_any(),
        "reconciliation failed"
    );

    if error.is_retryable() {
        Action::requeue(Duration::from_secs(5))
    } else {
        Action::await_change()
    }
}

/// Map a changed node config to the clusters that reference it
pub fn node_config_mapper(
    index: Arc<InfraRefIndex>,
    resource: ApiResource,
) -> impl Fn(DynamicObject) -> Vec<ObjectRef<Cluster>> + Send + Sync + 'static {
    move |object| {
        let key = object_key(
            &resource.api_version,
            &resource.kind,
            &object.namespace().unwrap_or_default(),
            &object.name_any(),
        );
        let clusters: Vec<_> = index.lookup(&key).iter().map(ClusterKey::object_ref).collect();
        if !clusters.is_empty() {
            debug!(node_config = %key, count = clusters.len(), "node config changed");
        }
        clusters
    }
}

/// Drop deleted clusters from the reverse index
///
/// The controller does not reconcile objects that are already gone, so
/// deletions are observed with a separate watch.
pub async fn watch_cluster_deletions(api: Api<Cluster>, index: Arc<InfraRefIndex>) {
    watcher(api, watcher::Config::default())
        .default_backoff()
        .for_each(|event| {
            match event {
                Ok(watcher::Event::Delete(cluster)) => {
                    debug!(cluster = %cluster.name_any(), "cluster deleted");
                    index.remove(&cluster.namespace().unwrap_or_default(), &cluster.name_any());
                }
                Ok(_) => {}
                Err(e) => debug!(error = %e, "cluster watch error"),
            }
            futures::future::ready(())
        })
        .await;
}
