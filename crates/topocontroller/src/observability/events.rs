//! Structured Events
//!
//! One function per event type so field names stay consistent across the
//! controller. Every event carries an `event_type` field.

use tracing::{error, info, warn};

pub fn controller_started(namespace: &str, workers: usize) {
    info!(
        event_type = "controller_started",
        namespace = %namespace,
        workers = workers,
        "Controller started"
    );
}

pub fn controller_stopped(namespace: &str) {
    info!(
        event_type = "controller_stopped",
        namespace = %namespace,
        "Controller stopped"
    );
}

pub fn cache_synced(resource: &str, objects: usize) {
    info!(
        event_type = "cache_synced",
        resource = %resource,
        objects = objects,
        "Cache synced"
    );
}

pub fn watch_error(resource: &str, error: &str) {
    warn!(
        event_type = "watch_error",
        resource = %resource,
        error = %error,
        "Watch stream error, relying on watcher backoff to resync"
    );
}

pub fn topology_updated(key: &str, from_version: &str, to_version: &str) {
    info!(
        event_type = "topology_updated",
        key = %key,
        from_version = %from_version,
        to_version = %to_version,
        "NodeResourceTopology updated"
    );
}

pub fn topology_created(key: &str) {
    info!(
        event_type = "topology_created",
        key = %key,
        "NodeResourceTopology created"
    );
}

pub fn topology_deleted(key: &str, reason: &str) {
    info!(
        event_type = "topology_deleted",
        key = %key,
        reason = %reason,
        "NodeResourceTopology deleted"
    );
}

pub fn item_dropped(key: &str, error: &str, retries: u32, retriable: bool) {
    error!(
        event_type = "item_dropped",
        key = %key,
        error = %error,
        retries = retries,
        retriable = retriable,
        "Dropping work item"
    );
}

pub fn worker_panicked(key: &str, panic: &str) {
    error!(
        event_type = "worker_panicked",
        key = %key,
        panic = %panic,
        "Reconcile panicked, dropping work item"
    );
}
