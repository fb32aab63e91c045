//! In-process store
//!
//! Behaves like the API server for the operations the controller uses:
//! every write bumps a global `resourceVersion`, `update` enforces the
//! caller's version, and every mutation is broadcast to open watches. Used
//! by tests and for running the controller without a cluster.

use super::{cluster_node, ClusterNode, NodeWatch, StoreError, TopologyStore, WatchStream};
use crate::crds::NodeResourceTopology;
use crate::key::key_for;
use async_trait::async_trait;
use futures::{stream, StreamExt};
use kube::runtime::watcher::Event;
use kube::ResourceExt;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};

const WATCH_BUFFER: usize = 1024;

type WriteHook = Box<dyn FnOnce(&mut NodeResourceTopology) + Send>;

/// Calls served by a [`MemoryStore`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreCounts {
    pub gets: u64,
    pub creates: u64,
    /// Updates that were applied.
    pub updates: u64,
    /// Updates rejected because of a version mismatch.
    pub conflicts: u64,
    pub deletes: u64,
}

impl StoreCounts {
    /// Mutating calls issued by clients, accepted or not.
    pub fn writes(&self) -> u64 {
        self.creates + self.updates + self.conflicts + self.deletes
    }
}

#[derive(Default)]
struct State {
    objects: BTreeMap<String, NodeResourceTopology>,
    nodes: BTreeSet<String>,
    last_version: u64,
    counts: StoreCounts,
    concurrent_writes: VecDeque<WriteHook>,
    failures: VecDeque<StoreError>,
}

impl State {
    fn next_version(&mut self) -> String {
        self.last_version += 1;
        self.last_version.to_string()
    }
}

pub struct MemoryStore {
    state: Arc<Mutex<State>>,
    topology_events: broadcast::Sender<Event<NodeResourceTopology>>,
    node_events: broadcast::Sender<Event<ClusterNode>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_watch_buffer(WATCH_BUFFER)
    }

    /// Store whose watches hold at most `capacity` undelivered events. A
    /// watch that falls further behind is relisted.
    pub fn with_watch_buffer(capacity: usize) -> Self {
        let (topology_events, _) = broadcast::channel(capacity);
        let (node_events, _) = broadcast::channel(capacity);
        Self {
            state: Arc::new(Mutex::new(State::default())),
            topology_events,
            node_events,
        }
    }

    /// Write an object as an external client would, bypassing version checks.
    pub fn put(&self, mut topology: NodeResourceTopology) -> NodeResourceTopology {
        let mut state = self.state.lock();
        topology.metadata.resource_version = Some(state.next_version());
        state.objects.insert(topology.key(), topology.clone());
        let _ = self.topology_events.send(Event::Apply(topology.clone()));
        topology
    }

    /// Delete an object as an external client would.
    pub fn remove(&self, namespace: &str, name: &str) -> Option<NodeResourceTopology> {
        let removed = self.state.lock().objects.remove(&key_for(namespace, name));
        if let Some(obj) = &removed {
            let _ = self.topology_events.send(Event::Delete(obj.clone()));
        }
        removed
    }

    pub fn object(&self, namespace: &str, name: &str) -> Option<NodeResourceTopology> {
        self.state
            .lock()
            .objects
            .get(&key_for(namespace, name))
            .cloned()
    }

    pub fn add_node(&self, name: &str) {
        self.state.lock().nodes.insert(name.to_string());
        let _ = self.node_events.send(Event::Apply(cluster_node(name)));
    }

    pub fn remove_node(&self, name: &str) {
        if self.state.lock().nodes.remove(name) {
            let _ = self.node_events.send(Event::Delete(cluster_node(name)));
        }
    }

    pub fn counts(&self) -> StoreCounts {
        self.state.lock().counts
    }

    /// Simulate another writer modifying the target object right before the
    /// next `update` is evaluated. The hook runs once.
    pub fn inject_concurrent_write<F>(&self, hook: F)
    where
        F: FnOnce(&mut NodeResourceTopology) + Send + 'static,
    {
        self.state.lock().concurrent_writes.push_back(Box::new(hook));
    }

    /// Fail the next `update` with `error` before touching any object.
    pub fn fail_next_update(&self, error: StoreError) {
        self.state.lock().failures.push_back(error);
    }

    fn apply_concurrent_write(&self, state: &mut State, key: &str) {
        let Some(hook) = state.concurrent_writes.pop_front() else {
            return;
        };
        let version = state.next_version();
        if let Some(stored) = state.objects.get_mut(key) {
            hook(stored);
            stored.metadata.resource_version = Some(version);
            let _ = self.topology_events.send(Event::Apply(stored.clone()));
        }
    }
}

#[async_trait]
impl TopologyStore for MemoryStore {
    async fn get(&self, namespace: &str, name: &str) -> Result<NodeResourceTopology, StoreError> {
        let mut state = self.state.lock();
        state.counts.gets += 1;
        state
            .objects
            .get(&key_for(namespace, name))
            .cloned()
            .ok_or_else(|| StoreError::NotFound(name.to_string()))
    }

    async fn create(
        &self,
        topology: &NodeResourceTopology,
    ) -> Result<NodeResourceTopology, StoreError> {
        let mut state = self.state.lock();
        state.counts.creates += 1;
        let key = topology.key();
        if state.objects.contains_key(&key) {
            return Err(StoreError::AlreadyExists(topology.name_any()));
        }

        let mut created = topology.clone();
        created.metadata.resource_version = Some(state.next_version());
        state.objects.insert(key, created.clone());
        let _ = self.topology_events.send(Event::Apply(created.clone()));
        Ok(created)
    }

    async fn update(
        &self,
        topology: &NodeResourceTopology,
    ) -> Result<NodeResourceTopology, StoreError> {
        let mut state = self.state.lock();
        if let Some(error) = state.failures.pop_front() {
            return Err(error);
        }

        let key = topology.key();
        let name = topology.name_any();
        self.apply_concurrent_write(&mut state, &key);

        let stored_version = match state.objects.get(&key) {
            Some(stored) => stored.resource_version(),
            None => return Err(StoreError::NotFound(name)),
        };
        if stored_version != topology.resource_version() {
            state.counts.conflicts += 1;
            return Err(StoreError::Conflict(name));
        }

        state.counts.updates += 1;
        let mut updated = topology.clone();
        updated.metadata.resource_version = Some(state.next_version());
        state.objects.insert(key, updated.clone());
        let _ = self.topology_events.send(Event::Apply(updated.clone()));
        Ok(updated)
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        state.counts.deletes += 1;
        match state.objects.remove(&key_for(namespace, name)) {
            Some(obj) => {
                let _ = self.topology_events.send(Event::Delete(obj));
                Ok(())
            }
            None => Err(StoreError::NotFound(name.to_string())),
        }
    }

    fn watch(&self) -> WatchStream<NodeResourceTopology> {
        let state = self.state.clone();
        watch_stream(&self.topology_events, move || {
            state.lock().objects.values().cloned().collect()
        })
    }
}

impl NodeWatch for MemoryStore {
    fn watch_nodes(&self) -> WatchStream<ClusterNode> {
        let state = self.state.clone();
        watch_stream(&self.node_events, move || {
            state.lock().nodes.iter().map(|name| cluster_node(name)).collect()
        })
    }
}

type Pending<T> = VecDeque<Result<Event<T>, StoreError>>;

/// A listing followed by live events. A receiver that lags is resubscribed
/// and relisted, so the consumer never silently misses an event.
fn watch_stream<T, L>(events: &broadcast::Sender<Event<T>>, list: L) -> WatchStream<T>
where
    T: Clone + Send + 'static,
    L: Fn() -> Vec<T> + Send + 'static,
{
    // Subscribe before listing so nothing committed after the listing is missed.
    let rx = events.subscribe();
    let pending = listing(list());
    stream::unfold((rx, pending, list), |(mut rx, mut pending, list)| async move {
        if let Some(item) = pending.pop_front() {
            return Some((item, (rx, pending, list)));
        }
        match rx.recv().await {
            Ok(event) => Some((Ok(event), (rx, pending, list))),
            Err(RecvError::Lagged(missed)) => {
                let rx = rx.resubscribe();
                let pending = listing(list());
                let error =
                    StoreError::Watch(format!("watch fell behind by {missed} events, relisting"));
                Some((Err(error), (rx, pending, list)))
            }
            Err(RecvError::Closed) => None,
        }
    })
    .boxed()
}

fn listing<T>(objects: Vec<T>) -> Pending<T> {
    std::iter::once(Event::Init)
        .chain(objects.into_iter().map(Event::InitApply))
        .chain(std::iter::once(Event::InitDone))
        .map(Ok)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crds::NumaNodeResource;

    fn topology() -> NodeResourceTopology {
        NodeResourceTopology::for_node(
            "default",
            "node-test1",
            vec![NumaNodeResource::new(1, [("cpu", "2")])],
        )
    }

    #[tokio::test]
    async fn test_update_requires_current_version() {
        let store = MemoryStore::new();
        let stored = store.put(topology());

        let updated = store.update(&stored).await.unwrap();
        assert_ne!(updated.resource_version(), stored.resource_version());

        // Writing with the old version is rejected.
        let err = store.update(&stored).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
        assert_eq!(store.counts().updates, 1);
        assert_eq!(store.counts().conflicts, 1);
    }

    #[tokio::test]
    async fn test_concurrent_write_hook_causes_conflict() {
        let store = MemoryStore::new();
        let stored = store.put(topology());
        store.inject_concurrent_write(|obj| {
            obj.labels_mut().insert("touched".into(), "yes".into());
        });

        let err = store.update(&stored).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));

        let current = store.get("default", "node-test1").await.unwrap();
        assert_eq!(current.labels().get("touched").map(String::as_str), Some("yes"));
        assert!(store.update(&current).await.is_ok());
    }

    #[tokio::test]
    async fn test_create_and_delete() {
        let store = MemoryStore::new();
        store.create(&topology()).await.unwrap();
        assert!(matches!(
            store.create(&topology()).await,
            Err(StoreError::AlreadyExists(_))
        ));
        store.delete("default", "node-test1").await.unwrap();
        assert!(matches!(
            store.delete("default", "node-test1").await,
            Err(StoreError::NotFound(_))
        ));
        assert_eq!(store.counts().writes(), 4);
    }

    #[tokio::test]
    async fn test_watch_lists_then_streams() {
        let store = MemoryStore::new();
        store.put(topology());
        let mut watch = store.watch();

        assert!(matches!(watch.next().await, Some(Ok(Event::Init))));
        assert!(matches!(watch.next().await, Some(Ok(Event::InitApply(_)))));
        assert!(matches!(watch.next().await, Some(Ok(Event::InitDone))));

        store.remove("default", "node-test1");
        match watch.next().await {
            Some(Ok(Event::Delete(obj))) => assert_eq!(obj.name_any(), "node-test1"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_lagging_watch_is_relisted() {
        let store = MemoryStore::with_watch_buffer(2);
        let mut watch = store.watch();
        for _ in 0..2 {
            assert!(matches!(watch.next().await, Some(Ok(_))));
        }

        for name in ["a", "b", "c", "d", "e"] {
            store.put(NodeResourceTopology::for_node("default", name, Vec::new()));
        }
        assert!(matches!(watch.next().await, Some(Err(StoreError::Watch(_)))));
        assert!(matches!(watch.next().await, Some(Ok(Event::Init))));
        let mut relisted = Vec::new();
        while let Some(Ok(Event::InitApply(obj))) = watch.next().await {
            relisted.push(obj.name_any());
        }
        assert_eq!(relisted, vec!["a", "b", "c", "d", "e"]);

        // Live again after the relist.
        store.remove("default", "c");
        assert!(matches!(watch.next().await, Some(Ok(Event::Delete(_)))));
    }

    #[tokio::test]
    async fn test_node_watch() {
        let store = MemoryStore::new();
        store.add_node("node-test1");
        let mut watch = store.watch_nodes();

        assert!(matches!(watch.next().await, Some(Ok(Event::Init))));
        match watch.next().await {
            Some(Ok(Event::InitApply(node))) => assert_eq!(node.name_any(), "node-test1"),
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(matches!(watch.next().await, Some(Ok(Event::InitDone))));

        store.remove_node("node-test1");
        assert!(matches!(watch.next().await, Some(Ok(Event::Delete(_)))));
    }
}
