//! NodeResourceTopology reconciler
//!
//! Converges one object per pass. The cache only decides whether there is
//! anything to do; every write is based on a fresh read from the store and
//! carries that read's `resourceVersion`, so a stale cache can cost an extra
//! read but never a lost update.

use super::Context;
use crate::cache::CacheEntry;
use crate::crds::{sorted_by_numa_id, Layout, NodeResourceTopology, NumaNodeResource, TopologyError};
use crate::key::{key_for, split_key, KeyError};
use crate::observability::events;
use crate::store::StoreError;
use kube::ResourceExt;
use std::future::Future;
use strum::{AsRefStr, Display};
use thiserror::Error;
use tracing::{debug, instrument};

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error(transparent)]
    MalformedKey(#[from] KeyError),
    #[error("invalid desired topology for node {node}: {source}")]
    InvalidTopology {
        node: String,
        #[source]
        source: TopologyError,
    },
    #[error("{key} was modified concurrently")]
    Conflict { key: String },
    #[error("store request for {key} failed: {source}")]
    Store {
        key: String,
        #[source]
        source: StoreError,
    },
}

impl ReconcileError {
    /// Whether another pass may succeed.
    pub fn is_retriable(&self) -> bool {
        match self {
            ReconcileError::MalformedKey(_) | ReconcileError::InvalidTopology { .. } => false,
            ReconcileError::Conflict { .. } => true,
            ReconcileError::Store { source, .. } => !source.is_permanent(),
        }
    }

    /// Metric label for this error.
    pub fn kind(&self) -> &'static str {
        match self {
            ReconcileError::MalformedKey(_) => "malformed_key",
            ReconcileError::InvalidTopology { .. } => "invalid_topology",
            ReconcileError::Conflict { .. } => "conflict",
            ReconcileError::Store {
                source: StoreError::Timeout(_),
                ..
            } => "timeout",
            ReconcileError::Store { .. } => "store",
        }
    }
}

/// What a successful pass did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum Outcome {
    /// Observed state already matches desired state.
    Unchanged,
    Updated,
    Created,
    /// The node left the cluster and its object was removed.
    Deleted,
    /// A deletion was observed; nothing to clean up.
    Cleaned,
    /// No object exists and none is created.
    Absent,
    /// The inventory has nothing for this node.
    NoDesiredState,
}

pub struct Reconciler {
    ctx: Context,
}

impl Reconciler {
    pub fn new(ctx: Context) -> Self {
        Self { ctx }
    }

    #[instrument(skip(self))]
    pub async fn reconcile(&self, key: &str) -> Result<Outcome, ReconcileError> {
        let (namespace, name) = split_key(key, &self.ctx.config.namespace)?;
        let key = key_for(&namespace, &name);
        let cached = self.ctx.topologies.get(&key);
        let departed = self.node_departed(&name);

        match cached {
            CacheEntry::Tombstone => {
                debug!("Deletion observed, nothing to clean up");
                self.ctx.topologies.forget_tombstone(&key);
                if departed {
                    self.forget_node(&name);
                }
                Ok(Outcome::Cleaned)
            }
            CacheEntry::Present(_) if departed => {
                self.delete_departed(&namespace, &name, &key).await
            }
            CacheEntry::Absent if departed => {
                self.confirm_departed(&namespace, &name, &key).await
            }
            CacheEntry::Absent => self.reconcile_absent(&namespace, &name, &key).await,
            CacheEntry::Present(cached) => {
                self.reconcile_present(&namespace, &name, &key, &cached.spec.nodes)
                    .await
            }
        }
    }

    async fn reconcile_present(
        &self,
        namespace: &str,
        name: &str,
        key: &str,
        cached: &[NumaNodeResource],
    ) -> Result<Outcome, ReconcileError> {
        let Some((desired, layout)) = self.desired(name)? else {
            debug!("No desired state in inventory");
            return Ok(Outcome::NoDesiredState);
        };

        if layout.matches(cached) {
            return Ok(Outcome::Unchanged);
        }

        // The cache may be stale: decide on the authoritative copy.
        let mut current = match self.call(self.ctx.store.get(namespace, name)).await {
            Ok(current) => current,
            Err(StoreError::NotFound(_)) => {
                debug!("Object gone from store, waiting for the deletion event");
                return Ok(Outcome::Absent);
            }
            Err(e) => return Err(store_error(key, e)),
        };
        if layout.matches(&current.spec.nodes) {
            debug!("Cache was stale, store already converged");
            return Ok(Outcome::Unchanged);
        }

        let from_version = current.resource_version().unwrap_or_default();
        current.spec.nodes = sorted_by_numa_id(&desired);
        let updated = self
            .call(self.ctx.store.update(&current))
            .await
            .map_err(|e| store_error(key, e))?;

        events::topology_updated(
            key,
            &from_version,
            &updated.resource_version().unwrap_or_default(),
        );
        Ok(Outcome::Updated)
    }

    async fn reconcile_absent(
        &self,
        namespace: &str,
        name: &str,
        key: &str,
    ) -> Result<Outcome, ReconcileError> {
        if !self.ctx.config.create_missing || !self.node_known(name) {
            return Ok(Outcome::Absent);
        }
        let Some((desired, _)) = self.desired(name)? else {
            return Ok(Outcome::Absent);
        };

        let topology = NodeResourceTopology::for_node(namespace, name, sorted_by_numa_id(&desired));
        match self.call(self.ctx.store.create(&topology)).await {
            Ok(_) => {
                events::topology_created(key);
                Ok(Outcome::Created)
            }
            Err(StoreError::AlreadyExists(_)) => {
                debug!("Object already exists, waiting for the watch to catch up");
                Ok(Outcome::Absent)
            }
            Err(e) => Err(store_error(key, e)),
        }
    }

    /// Delete the object of a node that left the cluster. The node
    /// tombstone stays until the object's own deletion is observed.
    async fn delete_departed(
        &self,
        namespace: &str,
        name: &str,
        key: &str,
    ) -> Result<Outcome, ReconcileError> {
        match self.call(self.ctx.store.delete(namespace, name)).await {
            Ok(()) => {
                events::topology_deleted(key, "node_removed");
                Ok(Outcome::Deleted)
            }
            Err(StoreError::NotFound(_)) => {
                debug!("Object of departed node already gone");
                Ok(Outcome::Deleted)
            }
            Err(e) => Err(store_error(key, e)),
        }
    }

    /// The node left but its object was never cached. Ask the store before
    /// letting go of the node tombstone.
    async fn confirm_departed(
        &self,
        namespace: &str,
        name: &str,
        key: &str,
    ) -> Result<Outcome, ReconcileError> {
        match self.call(self.ctx.store.get(namespace, name)).await {
            Ok(_) => self.delete_departed(namespace, name, key).await,
            Err(StoreError::NotFound(_)) => {
                self.forget_node(name);
                Ok(Outcome::Absent)
            }
            Err(e) => Err(store_error(key, e)),
        }
    }

    /// Desired layout for `node`, validated.
    fn desired(
        &self,
        node: &str,
    ) -> Result<Option<(Vec<NumaNodeResource>, Layout)>, ReconcileError> {
        let Some(desired) = self.ctx.inventory.desired(node) else {
            return Ok(None);
        };
        let layout = Layout::from_nodes(&desired).map_err(|source| {
            ReconcileError::InvalidTopology {
                node: node.to_string(),
                source,
            }
        })?;
        Ok(Some((desired, layout)))
    }

    /// Node caches are keyed by node name.
    fn node_departed(&self, node: &str) -> bool {
        self.ctx
            .nodes
            .as_ref()
            .is_some_and(|nodes| nodes.get(node).is_tombstone())
    }

    /// Without node watching every node with inventory counts as known.
    fn node_known(&self, node: &str) -> bool {
        self.ctx
            .nodes
            .as_ref()
            .map_or(true, |nodes| nodes.get(node).exists())
    }

    fn forget_node(&self, node: &str) {
        if let Some(nodes) = &self.ctx.nodes {
            nodes.forget_tombstone(node);
        }
    }

    async fn call<T>(
        &self,
        request: impl Future<Output = Result<T, StoreError>>,
    ) -> Result<T, StoreError> {
        let timeout = self.ctx.config.request_timeout;
        tokio::time::timeout(timeout, request)
            .await
            .map_err(|_| StoreError::Timeout(timeout))?
    }
}

fn store_error(key: &str, error: StoreError) -> ReconcileError {
    match error {
        StoreError::Conflict(_) => ReconcileError::Conflict {
            key: key.to_string(),
        },
        source => ReconcileError::Store {
            key: key.to_string(),
            source,
        },
    }
}
