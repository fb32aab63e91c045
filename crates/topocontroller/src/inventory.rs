//! Desired-state inventory
//!
//! The controller does not discover hardware. It asks an [`InventorySource`]
//! for the NUMA layout a node should advertise and converges the
//! NodeResourceTopology object toward it.
//!
//! Inventory file format (YAML), keyed by node name:
//!
//! ```yaml
//! node-test1:
//!   - numaID: 1
//!     resources:
//!       cpu: "2"
//!   - numaID: 2
//!     resources:
//!       cpu: "4"
//! ```

use crate::crds::{Layout, NumaNodeResource, TopologyError};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info};

const CHANGE_BUFFER: usize = 256;

#[derive(Debug, Error)]
pub enum InventoryError {
    #[error("failed to read inventory file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse inventory file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("invalid inventory for node {node}: {source}")]
    Invalid {
        node: String,
        #[source]
        source: TopologyError,
    },
}

/// Read-only lookup of the desired NUMA layout by node name.
pub trait InventorySource: Send + Sync {
    /// Desired layout for `node`, or `None` when nothing is known about it.
    fn desired(&self, node: &str) -> Option<Vec<NumaNodeResource>>;

    /// Names of nodes whose desired layout changed. `None` when the source
    /// never changes.
    fn subscribe(&self) -> Option<broadcast::Receiver<String>> {
        None
    }
}

/// In-memory inventory, optionally loaded from a YAML file.
#[derive(Debug)]
pub struct StaticInventory {
    layouts: RwLock<HashMap<String, Vec<NumaNodeResource>>>,
    changes: broadcast::Sender<String>,
}

impl Default for StaticInventory {
    fn default() -> Self {
        Self::new()
    }
}

impl StaticInventory {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_BUFFER);
        Self {
            layouts: RwLock::new(HashMap::new()),
            changes,
        }
    }

    /// Load and validate an inventory file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, InventoryError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| InventoryError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let parsed: BTreeMap<String, Vec<NumaNodeResource>> =
            serde_yaml::from_str(&raw).map_err(|source| InventoryError::Parse {
                path: path.to_path_buf(),
                source,
            })?;

        let inventory = Self::new();
        for (node, nodes) in parsed {
            Layout::from_nodes(&nodes).map_err(|source| InventoryError::Invalid {
                node: node.clone(),
                source,
            })?;
            inventory.layouts.write().insert(node, nodes);
        }
        info!(
            path = %path.display(),
            nodes = inventory.layouts.read().len(),
            "Loaded inventory"
        );
        Ok(inventory)
    }

    /// Set the desired layout of `node` and notify subscribers.
    pub fn set(&self, node: &str, nodes: Vec<NumaNodeResource>) {
        self.layouts.write().insert(node.to_string(), nodes);
        self.notify(node);
    }

    pub fn remove(&self, node: &str) {
        if self.layouts.write().remove(node).is_some() {
            self.notify(node);
        }
    }

    fn notify(&self, node: &str) {
        // No receivers just means nobody is listening yet.
        if self.changes.send(node.to_string()).is_err() {
            debug!(node = %node, "No inventory subscribers");
        }
    }
}

impl InventorySource for StaticInventory {
    fn desired(&self, node: &str) -> Option<Vec<NumaNodeResource>> {
        self.layouts.read().get(node).cloned()
    }

    fn subscribe(&self) -> Option<broadcast::Receiver<String>> {
        Some(self.changes.subscribe())
    }
}
