//! Object cache
//!
//! Local mirror of watched objects, fed by a [`Dispatcher`](crate::dispatcher::Dispatcher).
//! Live objects are held in a kube reflector [`Store`]; on top of it the
//! cache keeps a tombstone for every deletion it observed until the
//! reconciler has handled that key. Reads never block on I/O and are served
//! from the last applied watch event, so they may lag the store.

use crate::key::key_for;
use kube::runtime::reflector::{store::Writer, ObjectRef, Store};
use kube::runtime::watcher::Event;
use kube::{Resource, ResourceExt};
use parking_lot::{Mutex, RwLock};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Objects an [`ObjectCache`] can hold.
pub trait Cached: Resource<DynamicType = ()> + Clone + Send + Sync + 'static {}

impl<K> Cached for K where K: Resource<DynamicType = ()> + Clone + Send + Sync + 'static {}

/// Result of a cache lookup.
#[derive(Debug)]
pub enum CacheEntry<K> {
    /// Last observed snapshot.
    Present(Arc<K>),
    /// A deletion was observed for this key and not yet handled.
    Tombstone,
    /// Nothing is known about this key.
    Absent,
}

impl<K> CacheEntry<K> {
    pub fn exists(&self) -> bool {
        matches!(self, CacheEntry::Present(_))
    }

    pub fn is_tombstone(&self) -> bool {
        matches!(self, CacheEntry::Tombstone)
    }
}

/// `namespace/name`, or the bare name when cluster-scoped.
fn object_key<K: Resource>(obj: &K) -> String {
    match obj.namespace() {
        Some(namespace) => key_for(&namespace, &obj.name_any()),
        None => obj.name_any(),
    }
}

fn object_ref<K: Cached>(key: &str) -> ObjectRef<K> {
    match key.split_once('/') {
        Some((namespace, name)) => ObjectRef::new(name).within(namespace),
        None => ObjectRef::new(key),
    }
}

struct Inner<K: Cached> {
    reader: Store<K>,
    writer: Mutex<Writer<K>>,
    tombstones: RwLock<HashSet<String>>,
    synced: AtomicBool,
}

/// Shared, cloneable handle to a cache of `K`.
pub struct ObjectCache<K: Cached> {
    inner: Arc<Inner<K>>,
}

impl<K: Cached> Clone for ObjectCache<K> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<K: Cached> Default for ObjectCache<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Cached> ObjectCache<K> {
    pub fn new() -> Self {
        let writer = Writer::default();
        Self {
            inner: Arc::new(Inner {
                reader: writer.as_reader(),
                writer: Mutex::new(writer),
                tombstones: RwLock::new(HashSet::new()),
                synced: AtomicBool::new(false),
            }),
        }
    }

    pub fn get(&self, key: &str) -> CacheEntry<K> {
        if let Some(obj) = self.inner.reader.get(&object_ref(key)) {
            return CacheEntry::Present(obj);
        }
        if self.inner.tombstones.read().contains(key) {
            CacheEntry::Tombstone
        } else {
            CacheEntry::Absent
        }
    }

    /// Keys of all live objects.
    pub fn keys(&self) -> Vec<String> {
        self.inner
            .reader
            .state()
            .iter()
            .map(|obj| object_key(obj.as_ref()))
            .collect()
    }

    /// Number of live objects.
    pub fn len(&self) -> usize {
        self.inner.reader.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.reader.is_empty()
    }

    /// True once the first full listing has been applied.
    pub fn has_synced(&self) -> bool {
        self.inner.synced.load(Ordering::Acquire)
    }

    /// Wait until the first full listing has been applied.
    pub async fn wait_synced(&self) {
        // The writer lives as long as `self`, so this only returns once synced.
        let _ = self.inner.reader.wait_until_ready().await;
    }

    /// Apply one watch event.
    ///
    /// Returns the objects a completed relist touched: every listed object
    /// plus the last snapshot of every object that vanished, which is now a
    /// tombstone. Other events return nothing.
    pub(crate) fn apply_watcher_event(&self, event: &Event<K>) -> Vec<Arc<K>> {
        let mut writer = self.inner.writer.lock();
        // Held across the store update so `get` never sees a key in neither place.
        let mut tombstones = self.inner.tombstones.write();

        match event {
            Event::Apply(obj) => {
                writer.apply_watcher_event(event);
                tombstones.remove(&object_key(obj));
                Vec::new()
            }
            Event::Delete(obj) => {
                tombstones.insert(object_key(obj));
                writer.apply_watcher_event(event);
                Vec::new()
            }
            Event::Init | Event::InitApply(_) => {
                writer.apply_watcher_event(event);
                Vec::new()
            }
            Event::InitDone => {
                let before = self.inner.reader.state();
                writer.apply_watcher_event(event);
                let listed = self.inner.reader.state();

                let listed_keys: HashSet<String> =
                    listed.iter().map(|obj| object_key(obj.as_ref())).collect();
                tombstones.retain(|key| !listed_keys.contains(key));
                let vanished: Vec<Arc<K>> = before
                    .into_iter()
                    .filter(|obj| !listed_keys.contains(&object_key(obj.as_ref())))
                    .collect();
                tombstones.extend(vanished.iter().map(|obj| object_key(obj.as_ref())));

                self.inner.synced.store(true, Ordering::Release);
                listed.into_iter().chain(vanished).collect()
            }
        }
    }

    /// Drop the tombstone of `key` once its deletion has been handled.
    /// Returns false when there was none.
    pub(crate) fn forget_tombstone(&self, key: &str) -> bool {
        self.inner.tombstones.write().remove(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crds::{NodeResourceTopology, NumaNodeResource};
    use crate::store::cluster_node;
    use std::time::Duration;

    fn nrt(name: &str, cpu: &str) -> NodeResourceTopology {
        NodeResourceTopology::for_node("ns", name, vec![NumaNodeResource::new(1, [("cpu", cpu)])])
    }

    fn cpu_of(entry: CacheEntry<NodeResourceTopology>) -> Option<String> {
        match entry {
            CacheEntry::Present(obj) => Some(obj.spec.nodes[0].resources["cpu"].0.clone()),
            _ => None,
        }
    }

    fn relist(
        cache: &ObjectCache<NodeResourceTopology>,
        objects: &[NodeResourceTopology],
    ) -> Vec<String> {
        cache.apply_watcher_event(&Event::Init);
        for obj in objects {
            cache.apply_watcher_event(&Event::InitApply(obj.clone()));
        }
        let mut keys: Vec<String> = cache
            .apply_watcher_event(&Event::InitDone)
            .iter()
            .map(|obj| object_key(obj.as_ref()))
            .collect();
        keys.sort();
        keys
    }

    #[test]
    fn test_get_apply_delete() {
        let cache = ObjectCache::<NodeResourceTopology>::new();
        assert!(matches!(cache.get("ns/a"), CacheEntry::Absent));

        cache.apply_watcher_event(&Event::Apply(nrt("a", "1")));
        assert_eq!(cpu_of(cache.get("ns/a")).as_deref(), Some("1"));
        assert_eq!(cache.keys(), vec!["ns/a"]);

        cache.apply_watcher_event(&Event::Delete(nrt("a", "1")));
        assert!(cache.get("ns/a").is_tombstone());
        assert!(cache.is_empty());

        // A re-created object replaces the tombstone.
        cache.apply_watcher_event(&Event::Apply(nrt("a", "2")));
        assert_eq!(cpu_of(cache.get("ns/a")).as_deref(), Some("2"));
        assert!(cache.inner.tombstones.read().is_empty());
    }

    #[test]
    fn test_relist_tombstones_vanished_objects() {
        let cache = ObjectCache::new();
        cache.apply_watcher_event(&Event::Apply(nrt("a", "1")));
        cache.apply_watcher_event(&Event::Apply(nrt("b", "2")));
        cache.apply_watcher_event(&Event::Delete(nrt("old", "1")));
        cache.apply_watcher_event(&Event::Delete(nrt("back", "1")));

        let affected = relist(&cache, &[nrt("a", "10"), nrt("c", "3"), nrt("back", "4")]);
        assert_eq!(affected, vec!["ns/a", "ns/b", "ns/back", "ns/c"]);

        assert_eq!(cpu_of(cache.get("ns/a")).as_deref(), Some("10"));
        assert!(cache.get("ns/b").is_tombstone());
        assert!(cache.get("ns/c").exists());
        assert!(cache.get("ns/back").exists());
        // Not yet handled, so still reported.
        assert!(cache.get("ns/old").is_tombstone());

        let mut keys = cache.keys();
        keys.sort();
        assert_eq!(keys, vec!["ns/a", "ns/back", "ns/c"]);
    }

    #[test]
    fn test_relist_is_invisible_until_done() {
        let cache = ObjectCache::<NodeResourceTopology>::new();
        cache.apply_watcher_event(&Event::Init);
        cache.apply_watcher_event(&Event::InitApply(nrt("a", "1")));
        assert!(matches!(cache.get("ns/a"), CacheEntry::Absent));
        assert!(!cache.has_synced());
    }

    #[test]
    fn test_forget_tombstone_releases_entries() {
        let cache = ObjectCache::new();
        for i in 0..1000 {
            let name = format!("node-{i}");
            cache.apply_watcher_event(&Event::Apply(nrt(&name, "1")));
            cache.apply_watcher_event(&Event::Delete(nrt(&name, "1")));
            assert!(cache.forget_tombstone(&format!("ns/{name}")));
        }
        assert!(cache.is_empty());
        assert!(cache.inner.tombstones.read().is_empty());
        assert!(matches!(cache.get("ns/node-7"), CacheEntry::Absent));
        assert!(!cache.forget_tombstone("ns/node-7"));
    }

    #[test]
    fn test_cluster_scoped_keys_are_bare_names() {
        let cache = ObjectCache::new();
        cache.apply_watcher_event(&Event::Apply(cluster_node("node-test1")));
        assert!(cache.get("node-test1").exists());
        assert_eq!(cache.keys(), vec!["node-test1"]);

        cache.apply_watcher_event(&Event::Delete(cluster_node("node-test1")));
        assert!(cache.get("node-test1").is_tombstone());
    }

    #[tokio::test]
    async fn test_wait_synced() {
        let cache = ObjectCache::<NodeResourceTopology>::new();
        assert!(!cache.has_synced());

        let waiter = {
            let cache = cache.clone();
            tokio::spawn(async move { cache.wait_synced().await })
        };
        relist(&cache, &[]);

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("wait_synced should return after the first listing")
            .unwrap();
        assert!(cache.has_synced());
    }
}
