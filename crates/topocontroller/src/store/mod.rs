//! Remote object store
//!
//! Typed CRUD and watch access to NodeResourceTopology objects with
//! optimistic concurrency: `update` succeeds only if the object still has
//! the `resourceVersion` carried by the caller.

mod kube_store;
mod memory;

pub use self::kube_store::KubeStore;
pub use self::memory::{MemoryStore, StoreCounts};

use crate::crds::NodeResourceTopology;
use async_trait::async_trait;
use futures::stream::BoxStream;
use k8s_openapi::api::core::v1::Node;
use kube::api::{ObjectMeta, PartialObjectMeta, PartialObjectMetaExt};
use kube::runtime::watcher::Event;
use std::time::Duration;
use thiserror::Error;

/// Stream of watch events. Errors are transient; the end of the stream
/// means the watch is gone for good.
pub type WatchStream<T> = BoxStream<'static, Result<Event<T>, StoreError>>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("object {0} not found")]
    NotFound(String),
    #[error("object {0} was modified concurrently (resourceVersion mismatch)")]
    Conflict(String),
    #[error("object {0} already exists")]
    AlreadyExists(String),
    #[error("object {name} rejected by the store: {message}")]
    Invalid { name: String, message: String },
    #[error("store request timed out after {0:?}")]
    Timeout(Duration),
    #[error("watch error: {0}")]
    Watch(String),
    #[error("Kubernetes error: {0}")]
    Kube(#[source] kube::Error),
}

impl StoreError {
    /// Errors that retrying cannot fix.
    pub fn is_permanent(&self) -> bool {
        matches!(self, StoreError::Invalid { .. })
    }
}

/// A cluster node as seen by the node watch: metadata only.
pub type ClusterNode = PartialObjectMeta<Node>;

/// Metadata-only node object named `name`.
pub fn cluster_node(name: &str) -> ClusterNode {
    ObjectMeta {
        name: Some(name.to_string()),
        ..ObjectMeta::default()
    }
    .into_response_partial()
}

/// CRUD and watch access to NodeResourceTopology objects.
#[async_trait]
pub trait TopologyStore: Send + Sync {
    async fn get(&self, namespace: &str, name: &str) -> Result<NodeResourceTopology, StoreError>;

    async fn create(
        &self,
        topology: &NodeResourceTopology,
    ) -> Result<NodeResourceTopology, StoreError>;

    /// Replace the object. The expected version is `metadata.resourceVersion`
    /// of `topology`; a mismatch yields [`StoreError::Conflict`].
    async fn update(
        &self,
        topology: &NodeResourceTopology,
    ) -> Result<NodeResourceTopology, StoreError>;

    async fn delete(&self, namespace: &str, name: &str) -> Result<(), StoreError>;

    fn watch(&self) -> WatchStream<NodeResourceTopology>;
}

/// Watch access to cluster nodes.
pub trait NodeWatch: Send + Sync {
    fn watch_nodes(&self) -> WatchStream<ClusterNode>;
}
