//! Topology Controller
//!
//! Runs the NodeResourceTopology controller against a Kubernetes cluster,
//! or performs one-off client operations.

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use kube::{
    api::{Api, PostParams},
    config::{KubeConfigOptions, Kubeconfig},
    Client, CustomResourceExt, ResourceExt,
};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use topocontroller::{
    inventory::{InventorySource, StaticInventory},
    observability::{init_metrics, init_tracing, TracingConfig},
    store::KubeStore,
    Controller, ControllerConfig, NodeResourceTopology, NumaNodeResource,
};
use tracing::info;

#[derive(Parser)]
#[command(name = "topocontroller")]
#[command(about = "Controller for NodeResourceTopology resources")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Path to a kubeconfig. Only required if out-of-cluster.
    #[arg(long, env = "KUBECONFIG")]
    kubeconfig: Option<PathBuf>,

    /// Address of the Kubernetes API server. Overrides any value in kubeconfig.
    #[arg(long)]
    master: Option<String>,

    /// Create the sample node-test1 NodeResourceTopology
    #[arg(long)]
    isclient: bool,

    /// Run the controller until interrupted
    #[arg(long)]
    watch: bool,

    /// Number of concurrent workers
    #[arg(long, env = "TOPO_WORKERS")]
    workers: Option<usize>,

    /// Namespace to watch
    #[arg(long, env = "TOPO_NAMESPACE")]
    namespace: Option<String>,

    /// YAML file with the desired NUMA layout per node
    #[arg(long, env = "TOPO_INVENTORY")]
    inventory: Option<PathBuf>,

    /// Watch cluster nodes and delete topologies of departed nodes
    #[arg(long)]
    watch_nodes: bool,

    /// Create topologies for known nodes that have inventory but no object
    #[arg(long)]
    create_missing: bool,

    /// Serve Prometheus metrics on this address
    #[arg(long, env = "METRICS_ADDR")]
    metrics_addr: Option<SocketAddr>,
}

#[derive(Subcommand)]
enum Commands {
    /// Print CRD manifests to stdout
    Crds,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("failed to install rustls crypto provider"))?;

    let cli = Cli::parse();

    if let Some(Commands::Crds) = cli.command {
        println!("---");
        println!("{}", serde_yaml::to_string(&NodeResourceTopology::crd())?);
        return Ok(());
    }

    init_tracing(&TracingConfig::from_env())?;
    if let Some(addr) = cli.metrics_addr {
        init_metrics(addr)?;
        info!(addr = %addr, "Serving metrics");
    }

    let client = kube_client(cli.kubeconfig.as_deref(), cli.master.as_deref()).await?;
    info!("Connected to Kubernetes");

    let mut config = ControllerConfig::from_env();
    if let Some(namespace) = cli.namespace {
        config.namespace = namespace;
    }
    if let Some(workers) = cli.workers {
        config.workers = workers;
    }
    config.watch_nodes |= cli.watch_nodes;
    config.create_missing |= cli.create_missing;

    if cli.isclient {
        create_sample(client.clone(), &config.namespace).await?;
    }

    if cli.watch {
        let inventory: Arc<dyn InventorySource> = match &cli.inventory {
            Some(path) => Arc::new(StaticInventory::from_file(path)?),
            None => Arc::new(StaticInventory::new()),
        };
        run_controller(client, config, inventory).await?;
    }

    Ok(())
}

async fn kube_client(kubeconfig: Option<&Path>, master: Option<&str>) -> anyhow::Result<Client> {
    let mut config = match kubeconfig {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path)
                .with_context(|| format!("failed to read kubeconfig {}", path.display()))?;
            kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default()).await?
        }
        None => kube::Config::infer().await?,
    };
    if let Some(master) = master {
        config.cluster_url = master
            .parse()
            .with_context(|| format!("invalid master URL {master}"))?;
    }
    Ok(Client::try_from(config)?)
}

/// Create `node-test1` with two identical NUMA nodes.
async fn create_sample(client: Client, namespace: &str) -> anyhow::Result<()> {
    let resources = [("cpu", "2"), ("nic1", "3")];
    let topology = NodeResourceTopology::for_node(
        namespace,
        "node-test1",
        vec![
            NumaNodeResource::new(1, resources),
            NumaNodeResource::new(2, resources),
        ],
    );

    let api: Api<NodeResourceTopology> = Api::namespaced(client, namespace);
    let created = api
        .create(&PostParams::default(), &topology)
        .await
        .context("failed to create NodeResourceTopology node-test1")?;
    info!(
        name = %created.name_any(),
        resource_version = ?created.resource_version(),
        nodes = ?created.spec.nodes,
        "Created NodeResourceTopology"
    );
    Ok(())
}

async fn run_controller(
    client: Client,
    config: ControllerConfig,
    inventory: Arc<dyn InventorySource>,
) -> anyhow::Result<()> {
    let store = Arc::new(KubeStore::new(client, config.namespace.clone()));
    let controller = Controller::new(config, store.clone(), inventory)?.with_node_watch(store);

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        signal.cancel();
    });

    controller.run(shutdown).await?;
    Ok(())
}

/// Listens for SIGTERM and Ctrl+C.
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }
}
