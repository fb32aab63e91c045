//! Work queue
//!
//! A deduplicating, rate-limited FIFO of keys shared by the dispatcher
//! (producer) and the workers (consumers).
//!
//! - `dirty`: keys waiting to be processed. An `add` for a dirty key is a no-op.
//! - `processing`: keys handed out by `get` and not yet `done`. A key added
//!   while processing stays dirty and is queued again on `done`, so the same
//!   key is never handed to two workers at once.
//! - Backoff: `add_rate_limited` delays re-adds per key, `forget` resets it.

mod rate_limiter;

pub use rate_limiter::{ItemExponentialBackoff, DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY};

use crate::observability::metrics;
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::trace;

struct State<K> {
    queue: VecDeque<K>,
    dirty: HashSet<K>,
    processing: HashSet<K>,
    backoff: ItemExponentialBackoff<K>,
    shutting_down: bool,
}

struct Shared<K> {
    state: Mutex<State<K>>,
    notify: Notify,
    /// Cancels pending delayed adds on shutdown.
    closed: CancellationToken,
}

/// Cloneable handle to a shared work queue.
pub struct WorkQueue<K> {
    inner: Arc<Shared<K>>,
}

impl<K> Clone for WorkQueue<K> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<K> WorkQueue<K>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
{
    pub fn new(backoff: ItemExponentialBackoff<K>) -> Self {
        Self {
            inner: Arc::new(Shared {
                state: Mutex::new(State {
                    queue: VecDeque::new(),
                    dirty: HashSet::new(),
                    processing: HashSet::new(),
                    backoff,
                    shutting_down: false,
                }),
                notify: Notify::new(),
                closed: CancellationToken::new(),
            }),
        }
    }

    /// Queue `item` unless it is already waiting.
    pub fn add(&self, item: K) {
        let mut state = self.inner.state.lock();
        if state.shutting_down || state.dirty.contains(&item) {
            return;
        }

        state.dirty.insert(item.clone());
        if state.processing.contains(&item) {
            trace!(item = ?item, "Item in flight, deferring until done");
            return;
        }

        state.queue.push_back(item);
        metrics::set_queue_depth(state.queue.len());
        drop(state);
        self.inner.notify.notify_one();
    }

    /// Wait for the next item and mark it as processing.
    ///
    /// Returns `None` once the queue is shut down and drained.
    pub async fn get(&self) -> Option<K> {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            // Register as a waiter before inspecting state so an `add` that
            // lands in between is not missed.
            notified.as_mut().enable();

            {
                let mut state = self.inner.state.lock();
                if let Some(item) = state.queue.pop_front() {
                    state.dirty.remove(&item);
                    state.processing.insert(item.clone());
                    metrics::set_queue_depth(state.queue.len());
                    return Some(item);
                }
                if state.shutting_down {
                    return None;
                }
            }

            notified.await;
        }
    }

    /// Mark `item` as no longer processing.
    ///
    /// If it was added again while in flight it goes back on the queue.
    pub fn done(&self, item: &K) {
        let mut state = self.inner.state.lock();
        state.processing.remove(item);
        if state.dirty.contains(item) {
            state.queue.push_back(item.clone());
            metrics::set_queue_depth(state.queue.len());
            drop(state);
            self.inner.notify.notify_one();
        }
    }

    /// Add `item` after `delay`. Dropped if the queue shuts down first.
    pub fn add_after(&self, item: K, delay: Duration) {
        if self.is_shutting_down() {
            return;
        }
        if delay.is_zero() {
            self.add(item);
            return;
        }

        let queue = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = queue.inner.closed.cancelled() => {}
                _ = tokio::time::sleep(delay) => queue.add(item),
            }
        });
    }

    /// Re-add `item` after its backoff delay, counting one more failure.
    pub fn add_rate_limited(&self, item: K) {
        let delay = self.inner.state.lock().backoff.when(&item);
        trace!(item = ?item, delay_ms = delay.as_millis() as u64, "Requeueing with backoff");
        self.add_after(item, delay);
    }

    /// Reset the backoff for `item`.
    pub fn forget(&self, item: &K) {
        self.inner.state.lock().backoff.forget(item);
    }

    /// Rate-limited requeues of `item` since it was last forgotten.
    pub fn num_requeues(&self, item: &K) -> u32 {
        self.inner.state.lock().backoff.num_requeues(item)
    }

    /// Number of items waiting to be handed out.
    pub fn len(&self) -> usize {
        self.inner.state.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop accepting items and wake every waiting `get`.
    ///
    /// Items already queued are still handed out; in-flight items finish
    /// normally.
    pub fn shutdown(&self) {
        self.inner.state.lock().shutting_down = true;
        self.inner.closed.cancel();
        self.inner.notify.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.state.lock().shutting_down
    }
}

impl<K> Default for WorkQueue<K>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new(ItemExponentialBackoff::default())
    }
}
