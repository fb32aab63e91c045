//! Kubernetes-backed store

use super::{ClusterNode, NodeWatch, StoreError, TopologyStore, WatchStream};
use crate::crds::NodeResourceTopology;
use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use k8s_openapi::api::core::v1::Node;
use kube::{
    api::{Api, DeleteParams, PostParams},
    runtime::{metadata_watcher, watcher, WatchStreamExt},
    Client, ResourceExt,
};
use tracing::debug;

/// Store backed by the Kubernetes API server.
///
/// Watches are scoped to one namespace; the API server enforces
/// `resourceVersion` preconditions on replace.
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
    namespace: String,
}

impl KubeStore {
    pub fn new(client: Client, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
        }
    }

    fn api(&self, namespace: &str) -> Api<NodeResourceTopology> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

/// Map API status codes onto the store taxonomy.
fn classify(err: kube::Error, name: &str, creating: bool) -> StoreError {
    match &err {
        kube::Error::Api(resp) if resp.code == 404 => StoreError::NotFound(name.to_string()),
        kube::Error::Api(resp) if resp.code == 409 && creating => {
            StoreError::AlreadyExists(name.to_string())
        }
        kube::Error::Api(resp) if resp.code == 409 => StoreError::Conflict(name.to_string()),
        kube::Error::Api(resp) if resp.code == 422 => StoreError::Invalid {
            name: name.to_string(),
            message: resp.message.clone(),
        },
        _ => StoreError::Kube(err),
    }
}

#[async_trait]
impl TopologyStore for KubeStore {
    async fn get(&self, namespace: &str, name: &str) -> Result<NodeResourceTopology, StoreError> {
        self.api(namespace)
            .get(name)
            .await
            .map_err(|e| classify(e, name, false))
    }

    async fn create(
        &self,
        topology: &NodeResourceTopology,
    ) -> Result<NodeResourceTopology, StoreError> {
        let namespace = topology
            .namespace()
            .unwrap_or_else(|| self.namespace.clone());
        let name = topology.name_any();
        debug!(namespace = %namespace, name = %name, "Creating NodeResourceTopology");
        self.api(&namespace)
            .create(&PostParams::default(), topology)
            .await
            .map_err(|e| classify(e, &name, true))
    }

    async fn update(
        &self,
        topology: &NodeResourceTopology,
    ) -> Result<NodeResourceTopology, StoreError> {
        let namespace = topology
            .namespace()
            .unwrap_or_else(|| self.namespace.clone());
        let name = topology.name_any();
        debug!(
            namespace = %namespace,
            name = %name,
            resource_version = ?topology.resource_version(),
            "Replacing NodeResourceTopology"
        );
        self.api(&namespace)
            .replace(&name, &PostParams::default(), topology)
            .await
            .map_err(|e| classify(e, &name, false))
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<(), StoreError> {
        self.api(namespace)
            .delete(name, &DeleteParams::default())
            .await
            .map(|_| ())
            .map_err(|e| classify(e, name, false))
    }

    fn watch(&self) -> WatchStream<NodeResourceTopology> {
        watcher(self.api(&self.namespace), watcher::Config::default())
            .default_backoff()
            .map_err(|e| StoreError::Watch(e.to_string()))
            .boxed()
    }
}

impl NodeWatch for KubeStore {
    fn watch_nodes(&self) -> WatchStream<ClusterNode> {
        let api: Api<Node> = Api::all(self.client.clone());
        metadata_watcher(api, watcher::Config::default())
            .default_backoff()
            .map_err(|e| StoreError::Watch(e.to_string()))
            .boxed()
    }
}
