//! NodeResourceTopology controller
//!
//! Wires the watch dispatchers, the work queue and the worker pool:
//!
//! ```text
//! store watch ─┐
//! node watch ──┼─> Dispatcher ─> ObjectCache
//! inventory ───┤        │
//! resync ──────┘        └─> WorkQueue ─> WorkerPool ─> Reconciler ─> store
//! ```

mod context;
mod reconciler;
mod workers;

pub use context::Context;
pub use reconciler::{Outcome, ReconcileError, Reconciler};
pub use workers::{SyncHandler, WorkerPool};

use crate::config::{ConfigError, ControllerConfig};
use crate::crds::NodeResourceTopology;
use crate::dispatcher::{run_inventory_feed, run_resync, DispatchError, Dispatcher};
use crate::inventory::InventorySource;
use crate::key::key_for;
use crate::observability::events;
use crate::queue::{ItemExponentialBackoff, WorkQueue};
use crate::store::{ClusterNode, NodeWatch, TopologyStore};
use kube::ResourceExt;
use std::sync::Arc;
use thiserror::Error;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("node watching is enabled but no node watch was provided")]
    MissingNodeWatch,
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
    #[error("controller task failed: {0}")]
    Join(#[from] JoinError),
}

type Producers = JoinSet<Result<(), DispatchError>>;

pub struct Controller {
    ctx: Context,
    queue: WorkQueue<String>,
    node_watch: Option<Arc<dyn NodeWatch>>,
}

impl Controller {
    pub fn new(
        config: ControllerConfig,
        store: Arc<dyn TopologyStore>,
        inventory: Arc<dyn InventorySource>,
    ) -> Result<Self, ControllerError> {
        config.validate()?;
        let queue = WorkQueue::new(ItemExponentialBackoff::new(
            config.base_delay,
            config.max_delay,
        ));
        Ok(Self {
            ctx: Context::new(config, store, inventory),
            queue,
            node_watch: None,
        })
    }

    /// Source of cluster node events, required when `watch_nodes` is set.
    pub fn with_node_watch(mut self, nodes: Arc<dyn NodeWatch>) -> Self {
        self.node_watch = Some(nodes);
        self
    }

    pub fn context(&self) -> &Context {
        &self.ctx
    }

    /// Run until `shutdown` fires or a watch stream ends.
    ///
    /// Workers start once every cache has synced. On the way out the queue
    /// is shut down, workers drain it and finish their current item.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), ControllerError> {
        let ctx = self.ctx;
        let config = ctx.config.clone();
        let node_watch = match (&ctx.nodes, self.node_watch) {
            (Some(_), None) => return Err(ControllerError::MissingNodeWatch),
            (_, watch) => watch,
        };

        events::controller_started(&config.namespace, config.workers);
        let stop = shutdown.child_token();
        let mut producers = Producers::new();

        let topologies = Dispatcher::new(
            "noderesourcetopology",
            ctx.topologies.clone(),
            self.queue.clone(),
            |obj: &NodeResourceTopology| obj.key(),
        );
        producers.spawn(topologies.run(ctx.store.watch(), stop.clone()));

        if let (Some(cache), Some(watch)) = (&ctx.nodes, node_watch) {
            let namespace = config.namespace.clone();
            let nodes = Dispatcher::new(
                "node",
                cache.clone(),
                self.queue.clone(),
                move |node: &ClusterNode| key_for(&namespace, &node.name_any()),
            );
            producers.spawn(nodes.run(watch.watch_nodes(), stop.clone()));
        }

        let resync = run_resync(
            ctx.topologies.clone(),
            self.queue.clone(),
            config.resync_period,
            stop.clone(),
        );
        producers.spawn(async move {
            resync.await;
            Ok(())
        });

        if let Some(changes) = ctx.inventory.subscribe() {
            let feed = run_inventory_feed(
                changes,
                self.queue.clone(),
                config.namespace.clone(),
                ctx.topologies.clone(),
                stop.clone(),
            );
            producers.spawn(async move {
                feed.await;
                Ok(())
            });
        }

        let (mut result, workers) = tokio::select! {
            _ = wait_synced(&ctx) => {
                info!(workers = config.workers, "Caches synced, starting workers");
                let reconciler = Arc::new(Reconciler::new(ctx.clone()));
                let workers = WorkerPool::new(self.queue.clone(), reconciler, config.max_retries)
                    .spawn(config.workers);
                (supervise(&mut producers, &stop).await, Some(workers))
            }
            result = supervise(&mut producers, &stop) => (result, None),
        };

        stop.cancel();
        self.queue.shutdown();
        while let Some(joined) = producers.join_next().await {
            if let Err(e) = joined {
                warn!(error = %e, "Producer task failed during shutdown");
            }
        }
        if let Some(mut workers) = workers {
            while let Some(joined) = workers.join_next().await {
                if let Err(e) = joined {
                    result = result.and(Err(e.into()));
                }
            }
        }

        events::controller_stopped(&config.namespace);
        result
    }
}

async fn wait_synced(ctx: &Context) {
    ctx.topologies.wait_synced().await;
    if let Some(nodes) = &ctx.nodes {
        nodes.wait_synced().await;
    }
}

/// Wait for shutdown or the first failed producer. Producers that finish
/// cleanly (resync disabled, inventory feed closed) are not an error.
async fn supervise(producers: &mut Producers, stop: &CancellationToken) -> Result<(), ControllerError> {
    loop {
        tokio::select! {
            _ = stop.cancelled() => return Ok(()),
            joined = producers.join_next() => match joined {
                Some(Ok(Ok(()))) => continue,
                Some(Ok(Err(e))) => return Err(e.into()),
                Some(Err(e)) => return Err(e.into()),
                None => {
                    stop.cancelled().await;
                    return Ok(());
                }
            },
        }
    }
}
