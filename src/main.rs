//! Cluster provisioner - provisions RKE clusters and imports existing ones

use std::sync::Arc;

use clap::{Parser, Subcommand};
use futures::channel::oneshot;
use futures::{FutureExt, StreamExt};
use kube::api::ApiResource;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client, Config, CustomResourceExt};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use cluster_provisioner::config::ControllerArgs;
use cluster_provisioner::controller::{
    error_policy, error_policy_rke, node_config_mapper, reconcile, reconcile_rke,
    watch_cluster_deletions, Context, RkeContext,
};
use cluster_provisioner::crd::{Cluster, RKECluster};
use cluster_provisioner::discovery::{
    await_node_config_change, KubeNodeConfigDiscovery, NodeConfigDiscovery, REDISCOVERY_INTERVAL,
};
use cluster_provisioner::index::InfraRefIndex;
use cluster_provisioner::kubeconfig::store::secret_cache;
use cluster_provisioner::scheme::Scheme;

/// Cluster provisioner - turns Cluster objects into running clusters
#[derive(Parser, Debug)]
#[command(name = "cluster-provisioner", version, about, long_about = None)]
struct Cli {
    /// Generate the Cluster CRD manifest and exit
    #[arg(long)]
    crd: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run as controller (default mode)
    ///
    /// Watches Cluster objects, generates and applies their provisioning
    /// objects, deploys the agent to imported clusters and reports on the
    /// RKE control planes it creates.
    Controller(ControllerArgs),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install crypto provider - aws-lc-rs
    // Everything TLS (API server, manifest fetch) depends on it.
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!(
            "CRITICAL: Failed to install aws-lc-rs crypto provider: {:?}. \
             The controller cannot talk TLS without it.",
            e
        );
        std::process::exit(1);
    }

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    if cli.crd {
        let crd = serde_yaml::to_string(&Cluster::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
        println!("{crd}");
        return Ok(());
    }

    let args = match cli.command {
        Some(Commands::Controller(args)) => args,
        None => ControllerArgs::parse_from(["cluster-provisioner"]),
    };
    run_controller(args).await
}

/// Build a client from an explicit kubeconfig, or the default chain
async fn kube_client(args: &ControllerArgs) -> anyhow::Result<Client> {
    let Some(path) = &args.kubeconfig else {
        return Client::try_default()
            .await
            .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e));
    };

    let kubeconfig = Kubeconfig::read_from(path)
        .map_err(|e| anyhow::anyhow!("Failed to read kubeconfig {:?}: {}", path, e))?;
    let config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .map_err(|e| anyhow::anyhow!("Invalid kubeconfig {:?}: {}", path, e))?;
    Client::try_from(config)
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))
}

/// Ensure the Cluster CRD is installed
///
/// The controller installs its own CRD on startup using server-side apply so
/// the schema always matches the binary.
async fn ensure_crds_installed(client: &Client) -> anyhow::Result<()> {
    use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
    use kube::api::{Patch, PatchParams};

    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply("cluster-provisioner").force();

    tracing::info!("Installing Cluster CRD...");
    crds.patch(
        "clusters.rancher.cattle.io",
        &params,
        &Patch::Apply(&Cluster::crd()),
    )
    .await
    .map_err(|e| anyhow::anyhow!("Failed to install Cluster CRD: {}", e))?;

    Ok(())
}

async fn run_controller(args: ControllerArgs) -> anyhow::Result<()> {
    tracing::info!("Cluster provisioner starting...");

    let scheme = Arc::new(Scheme::provisioning());
    scheme
        .validate()
        .map_err(|e| anyhow::anyhow!("Incomplete type scheme: {}", e))?;

    let client = kube_client(&args).await?;
    ensure_crds_installed(&client).await?;

    let config = args
        .manager_config()
        .await
        .map_err(|e| anyhow::anyhow!("{}", e))?;

    let (secrets, secret_driver) = secret_cache(client.clone());
    tokio::spawn(secret_driver);

    let index = Arc::new(InfraRefIndex::new());
    tokio::spawn(watch_cluster_deletions(
        Api::all(client.clone()),
        index.clone(),
    ));

    let ctx = Arc::new(
        Context::builder(client.clone())
            .manager_config(config)
            .secret_cache(secrets)
            .index(index.clone())
            .scheme(scheme)
            .build(),
    );
    let rke_ctx = Arc::new(RkeContext::new(client.clone()));

    let rke_clusters: Api<RKECluster> = Api::all(client.clone());

    // Node config kinds are provider-specific, so they are discovered
    let discovery: Arc<dyn NodeConfigDiscovery> =
        Arc::new(KubeNodeConfigDiscovery::new(client.clone()));
    let kinds = discovery
        .node_config_kinds()
        .await
        .map_err(|e| anyhow::anyhow!("API discovery failed: {}", e))?;

    tracing::info!("Starting controllers...");
    tracing::info!("  - Cluster controller");
    tracing::info!("  - RKECluster controller");

    let cluster_controller = run_cluster_controller(client.clone(), ctx, index, discovery, kinds);

    let rke_controller = Controller::new(rke_clusters, WatcherConfig::default())
        .shutdown_on_signal()
        .run(reconcile_rke, error_policy_rke, rke_ctx)
        .for_each(|result| async move {
            match result {
                Ok(action) => {
                    tracing::debug!(?action, "RKECluster reconciliation completed");
                }
                Err(e) => {
                    tracing::error!(error = ?e, "RKECluster reconciliation error");
                }
            }
        });

    tokio::select! {
        _ = cluster_controller => {
            tracing::info!("Cluster controller completed");
        }
        _ = rke_controller => {
            tracing::info!("RKECluster controller completed");
        }
    }

    tracing::info!("Cluster provisioner shutting down");
    Ok(())
}

/// Run the cluster controller with a watch per node config kind
///
/// A change in the served kinds restarts the controller with the new
/// watches; a shutdown signal ends it.
async fn run_cluster_controller(
    client: Client,
    ctx: Arc<Context>,
    index: Arc<InfraRefIndex>,
    discovery: Arc<dyn NodeConfigDiscovery>,
    mut kinds: Vec<ApiResource>,
) {
    loop {
        let mut controller =
            Controller::new(Api::<Cluster>::all(client.clone()), WatcherConfig::default());
        for resource in &kinds {
            tracing::info!(kind = %resource.kind, "watching node config kind");
            controller = controller.watches_with(
                Api::all_with(client.clone(), resource),
                resource.clone(),
                WatcherConfig::default(),
                node_config_mapper(index.clone(), resource.clone()),
            );
        }

        let (restart_tx, restart_rx) = oneshot::channel::<()>();
        let rediscovery = tokio::spawn({
            let discovery = discovery.clone();
            let known = kinds.clone();
            async move {
                let found =
                    await_node_config_change(discovery.as_ref(), &known, REDISCOVERY_INTERVAL)
                        .await;
                let _ = restart_tx.send(());
                found
            }
        });

        controller
            .shutdown_on_signal()
            .graceful_shutdown_on(restart_rx.map(|_| ()))
            .run(reconcile, error_policy, ctx.clone())
            .for_each(|result| async move {
                match result {
                    Ok(action) => {
                        tracing::debug!(?action, "Cluster reconciliation completed");
                    }
                    Err(e) => {
                        tracing::error!(error = ?e, "Cluster reconciliation error");
                    }
                }
            })
            .await;

        // The send and the return happen in one poll, so a restart always
        // leaves a finished task; after a signal it is still pending
        rediscovery.abort();
        match rediscovery.await {
            Ok(found) => {
                tracing::info!("Node config kinds changed, restarting cluster controller");
                kinds = found;
            }
            Err(_) => return,
        }
    }
}
