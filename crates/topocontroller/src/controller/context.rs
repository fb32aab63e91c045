//! Shared controller context

use crate::cache::ObjectCache;
use crate::config::ControllerConfig;
use crate::crds::NodeResourceTopology;
use crate::inventory::InventorySource;
use crate::store::{ClusterNode, TopologyStore};
use std::sync::Arc;

/// Everything a reconcile pass reads from. Cheap to clone.
#[derive(Clone)]
pub struct Context {
    pub store: Arc<dyn TopologyStore>,
    pub inventory: Arc<dyn InventorySource>,
    pub topologies: ObjectCache<NodeResourceTopology>,
    /// Node cache, present only when node watching is enabled.
    pub nodes: Option<ObjectCache<ClusterNode>>,
    pub config: Arc<ControllerConfig>,
}

impl Context {
    pub fn new(
        config: ControllerConfig,
        store: Arc<dyn TopologyStore>,
        inventory: Arc<dyn InventorySource>,
    ) -> Self {
        let nodes = config.watch_nodes.then(ObjectCache::new);
        Self {
            store,
            inventory,
            topologies: ObjectCache::new(),
            nodes,
            config: Arc::new(config),
        }
    }
}
