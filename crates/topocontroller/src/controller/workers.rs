//! Worker pool
//!
//! Workers pull keys from the queue and hand them to a [`SyncHandler`].
//! The queue guarantees a key is never processed by two workers at once;
//! the pool turns each result into forget, requeue with backoff, or drop.

use super::reconciler::{Outcome, ReconcileError, Reconciler};
use crate::observability::{events, metrics};
use crate::queue::WorkQueue;
use async_trait::async_trait;
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinSet;
use tracing::{debug, warn};

/// Processes one key per call.
#[async_trait]
pub trait SyncHandler: Send + Sync {
    async fn sync(&self, key: &str) -> Result<Outcome, ReconcileError>;
}

#[async_trait]
impl SyncHandler for Reconciler {
    async fn sync(&self, key: &str) -> Result<Outcome, ReconcileError> {
        self.reconcile(key).await
    }
}

pub struct WorkerPool<H: ?Sized> {
    queue: WorkQueue<String>,
    handler: Arc<H>,
    max_retries: u32,
}

impl<H> WorkerPool<H>
where
    H: SyncHandler + ?Sized + 'static,
{
    pub fn new(queue: WorkQueue<String>, handler: Arc<H>, max_retries: u32) -> Self {
        Self {
            queue,
            handler,
            max_retries,
        }
    }

    /// Spawn `workers` tasks. They exit once the queue is shut down and drained.
    pub fn spawn(&self, workers: usize) -> JoinSet<()> {
        let mut set = JoinSet::new();
        for id in 0..workers {
            let queue = self.queue.clone();
            let handler = self.handler.clone();
            let max_retries = self.max_retries;
            set.spawn(async move {
                debug!(worker = id, "Worker started");
                while let Some(key) = queue.get().await {
                    process(&queue, handler.as_ref(), &key, max_retries).await;
                    queue.done(&key);
                }
                debug!(worker = id, "Worker stopped");
            });
        }
        set
    }
}

async fn process<H>(queue: &WorkQueue<String>, handler: &H, key: &str, max_retries: u32)
where
    H: SyncHandler + ?Sized,
{
    let started = Instant::now();
    let result = AssertUnwindSafe(handler.sync(key)).catch_unwind().await;
    let elapsed = started.elapsed();

    match result {
        Ok(Ok(outcome)) => {
            metrics::record_reconcile(outcome.as_ref(), elapsed);
            debug!(key = %key, outcome = %outcome, "Reconciled");
            queue.forget(&key.to_string());
        }
        Ok(Err(e)) => {
            metrics::record_reconcile_error(e.kind(), elapsed);
            let item = key.to_string();
            let retries = queue.num_requeues(&item);
            if e.is_retriable() && retries < max_retries {
                warn!(key = %key, error = %e, retries = retries, "Reconcile failed, requeuing with backoff");
                metrics::record_requeue();
                queue.add_rate_limited(item);
            } else {
                events::item_dropped(key, &e.to_string(), retries, e.is_retriable());
                metrics::record_dropped();
                queue.forget(&item);
            }
        }
        Err(panic) => {
            events::worker_panicked(key, &panic_message(panic.as_ref()));
            metrics::record_dropped();
            queue.forget(&key.to_string());
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::KeyError;
    use parking_lot::Mutex;
    use std::collections::{HashMap, HashSet};
    use std::time::Duration;
    use tokio::sync::Notify;

    /// Records calls per key and flags overlapping passes on the same key.
    #[derive(Default)]
    struct Recorder {
        calls: Mutex<HashMap<String, u32>>,
        in_flight: Mutex<HashSet<String>>,
        overlaps: Mutex<u32>,
    }

    impl Recorder {
        fn enter(&self, key: &str) {
            *self.calls.lock().entry(key.to_string()).or_default() += 1;
            if !self.in_flight.lock().insert(key.to_string()) {
                *self.overlaps.lock() += 1;
            }
        }

        fn leave(&self, key: &str) {
            self.in_flight.lock().remove(key);
        }

        fn calls(&self, key: &str) -> u32 {
            self.calls.lock().get(key).copied().unwrap_or_default()
        }
    }

    struct Slow {
        recorder: Recorder,
        delay: Duration,
    }

    #[async_trait]
    impl SyncHandler for Slow {
        async fn sync(&self, key: &str) -> Result<Outcome, ReconcileError> {
            self.recorder.enter(key);
            tokio::time::sleep(self.delay).await;
            self.recorder.leave(key);
            Ok(Outcome::Unchanged)
        }
    }

    /// Blocks the first pass until released.
    struct Gated {
        recorder: Recorder,
        started: Notify,
        release: Notify,
    }

    #[async_trait]
    impl SyncHandler for Gated {
        async fn sync(&self, key: &str) -> Result<Outcome, ReconcileError> {
            self.recorder.enter(key);
            if self.recorder.calls(key) == 1 {
                self.started.notify_one();
                self.release.notified().await;
            }
            self.recorder.leave(key);
            Ok(Outcome::Updated)
        }
    }

    struct Failing {
        recorder: Recorder,
        retriable: bool,
    }

    #[async_trait]
    impl SyncHandler for Failing {
        async fn sync(&self, key: &str) -> Result<Outcome, ReconcileError> {
            self.recorder.enter(key);
            self.recorder.leave(key);
            if key == "default/boom" {
                panic!("handler exploded");
            }
            if self.retriable {
                Err(ReconcileError::Conflict {
                    key: key.to_string(),
                })
            } else {
                Err(KeyError::Malformed(key.to_string()).into())
            }
        }
    }

    async fn finish(queue: &WorkQueue<String>, workers: JoinSet<()>) {
        queue.shutdown();
        workers.join_all().await;
    }

    #[tokio::test]
    async fn test_adds_while_in_flight_cause_one_extra_pass() {
        let queue = WorkQueue::default();
        let handler = Arc::new(Gated {
            recorder: Recorder::default(),
            started: Notify::new(),
            release: Notify::new(),
        });
        let workers = WorkerPool::new(queue.clone(), handler.clone(), 10).spawn(2);

        queue.add("default/a".to_string());
        handler.started.notified().await;
        for _ in 0..5 {
            queue.add("default/a".to_string());
        }
        handler.release.notify_one();

        while handler.recorder.calls("default/a") < 2 {
            tokio::task::yield_now().await;
        }
        finish(&queue, workers).await;
        assert_eq!(handler.recorder.calls("default/a"), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_key_never_processed_concurrently() {
        let queue = WorkQueue::default();
        let handler = Arc::new(Slow {
            recorder: Recorder::default(),
            delay: Duration::from_millis(2),
        });
        let workers = WorkerPool::new(queue.clone(), handler.clone(), 10).spawn(4);

        for round in 0..50 {
            for key in ["default/a", "default/b", "default/c"] {
                queue.add(key.to_string());
            }
            if round % 10 == 0 {
                tokio::time::sleep(Duration::from_millis(3)).await;
            }
        }
        finish(&queue, workers).await;

        assert_eq!(*handler.recorder.overlaps.lock(), 0);
        for key in ["default/a", "default/b", "default/c"] {
            assert!(handler.recorder.calls(key) >= 1);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retriable_failure_dropped_after_max_retries() {
        let queue = WorkQueue::default();
        let handler = Arc::new(Failing {
            recorder: Recorder::default(),
            retriable: true,
        });
        let workers = WorkerPool::new(queue.clone(), handler.clone(), 3).spawn(1);

        queue.add("default/a".to_string());
        // Backoff totals 5 + 10 + 20 ms; give it ample virtual time.
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert_eq!(handler.recorder.calls("default/a"), 4);
        assert_eq!(queue.num_requeues(&"default/a".to_string()), 0);
        assert!(queue.is_empty());
        finish(&queue, workers).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminal_failure_dropped_immediately() {
        let queue = WorkQueue::default();
        let handler = Arc::new(Failing {
            recorder: Recorder::default(),
            retriable: false,
        });
        let workers = WorkerPool::new(queue.clone(), handler.clone(), 10).spawn(1);

        queue.add("default/a".to_string());
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(handler.recorder.calls("default/a"), 1);
        finish(&queue, workers).await;
    }

    #[tokio::test]
    async fn test_panic_does_not_kill_worker() {
        let queue = WorkQueue::default();
        let handler = Arc::new(Failing {
            recorder: Recorder::default(),
            retriable: false,
        });
        let workers = WorkerPool::new(queue.clone(), handler.clone(), 10).spawn(1);

        queue.add("default/boom".to_string());
        queue.add("default/after".to_string());
        finish(&queue, workers).await;

        assert_eq!(handler.recorder.calls("default/boom"), 1);
        assert_eq!(handler.recorder.calls("default/after"), 1);
    }

    #[test]
    fn test_panic_message() {
        let boxed: Box<dyn Any + Send> = Box::new("static message");
        assert_eq!(panic_message(boxed.as_ref()), "static message");
        let boxed: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(boxed.as_ref()), "owned");
        let boxed: Box<dyn Any + Send> = Box::new(7u8);
        assert_eq!(panic_message(boxed.as_ref()), "unknown panic");
    }
}
