//! Event dispatcher
//!
//! Applies watch events to an [`ObjectCache`] and turns them into work
//! items. The dispatcher of a cache is its only writer.
//!
//! Besides watch streams, two other producers feed the queue: a periodic
//! resync that re-enqueues every cached key, and the inventory change feed.

use crate::cache::{Cached, ObjectCache};
use crate::key::key_for;
use crate::observability::{events, metrics};
use crate::queue::WorkQueue;
use crate::store::StoreError;
use futures::{Stream, StreamExt};
use kube::runtime::watcher::Event;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("{0} watch stream closed")]
    WatchClosed(&'static str),
}

/// Drives one watch stream into a cache and the work queue.
pub struct Dispatcher<K: Cached, F> {
    resource: &'static str,
    cache: ObjectCache<K>,
    queue: WorkQueue<String>,
    key_of: F,
}

impl<K, F> Dispatcher<K, F>
where
    K: Cached,
    F: Fn(&K) -> String,
{
    pub fn new(
        resource: &'static str,
        cache: ObjectCache<K>,
        queue: WorkQueue<String>,
        key_of: F,
    ) -> Self {
        Self {
            resource,
            cache,
            queue,
            key_of,
        }
    }

    /// Consume `stream` until it ends or `shutdown` fires.
    ///
    /// Stream errors are logged; every store relists after one, and the
    /// relist repairs the cache. The end of the stream is fatal.
    pub async fn run<S>(self, stream: S, shutdown: CancellationToken) -> Result<(), DispatchError>
    where
        S: Stream<Item = Result<Event<K>, StoreError>>,
    {
        let mut stream = std::pin::pin!(stream);

        loop {
            let event = tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!(resource = self.resource, "Dispatcher: received shutdown signal");
                    return Ok(());
                }
                event = stream.next() => event,
            };

            match event {
                Some(Ok(event)) => self.handle(&event),
                Some(Err(e)) => {
                    metrics::record_watch_event(self.resource, "error");
                    events::watch_error(self.resource, &e.to_string());
                }
                None => {
                    warn!(resource = self.resource, "Watch stream ended");
                    return Err(DispatchError::WatchClosed(self.resource));
                }
            }
        }
    }

    fn handle(&self, event: &Event<K>) {
        let relisted = self.cache.apply_watcher_event(event);
        match event {
            Event::Init => metrics::record_watch_event(self.resource, "init"),
            Event::InitApply(_) => {}
            Event::InitDone => {
                metrics::record_watch_event(self.resource, "init_done");
                for obj in &relisted {
                    self.queue.add((self.key_of)(obj));
                }
                events::cache_synced(self.resource, self.cache.len());
            }
            Event::Apply(obj) => {
                metrics::record_watch_event(self.resource, "apply");
                self.queue.add((self.key_of)(obj));
            }
            Event::Delete(obj) => {
                metrics::record_watch_event(self.resource, "delete");
                self.queue.add((self.key_of)(obj));
            }
        }
    }
}

/// Re-enqueue every cached key each `period` until `shutdown` fires.
pub async fn run_resync<K: Cached>(
    cache: ObjectCache<K>,
    queue: WorkQueue<String>,
    period: Duration,
    shutdown: CancellationToken,
) {
    if period.is_zero() {
        return;
    }

    let mut ticker = tokio::time::interval(period);
    // The first tick completes immediately; the initial listing covers it.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = ticker.tick() => {
                let keys = cache.keys();
                debug!(keys = keys.len(), "Periodic resync");
                for key in keys {
                    queue.add(key);
                }
            }
        }
    }
}

/// Enqueue the topology key of every node whose desired layout changed.
pub async fn run_inventory_feed<K: Cached>(
    mut changes: broadcast::Receiver<String>,
    queue: WorkQueue<String>,
    namespace: String,
    cache: ObjectCache<K>,
    shutdown: CancellationToken,
) {
    loop {
        let change = tokio::select! {
            _ = shutdown.cancelled() => return,
            change = changes.recv() => change,
        };

        match change {
            Ok(node) => queue.add(key_for(&namespace, &node)),
            Err(RecvError::Lagged(missed)) => {
                warn!(missed = missed, "Inventory feed fell behind, re-enqueuing all keys");
                for key in cache.keys() {
                    queue.add(key);
                }
            }
            Err(RecvError::Closed) => {
                info!("Inventory feed closed");
                return;
            }
        }
    }
}
