//! Prometheus Metrics
//!
//! Metrics tracked:
//! - `topocontroller_reconcile_total` - counter of finished passes by outcome
//! - `topocontroller_reconcile_errors_total` - counter of failed passes by error kind
//! - `topocontroller_reconcile_duration_seconds` - histogram of pass durations
//! - `topocontroller_requeues_total` - counter of rate-limited requeues
//! - `topocontroller_items_dropped_total` - counter of items given up on
//! - `topocontroller_queue_depth` - gauge of items waiting in the queue
//! - `topocontroller_watch_events_total` - counter of watch events by resource and type

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};
use std::net::SocketAddr;
use std::time::Duration;

/// Install the Prometheus recorder and serve `/metrics` on `listen`.
///
/// Must be called from within a tokio runtime.
pub fn init_metrics(listen: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new()
        .with_http_listener(listen)
        .install()?;

    register_metric_descriptions();
    Ok(())
}

fn register_metric_descriptions() {
    describe_counter!(
        "topocontroller_reconcile_total",
        "Total number of successful reconcile passes by outcome"
    );
    describe_counter!(
        "topocontroller_reconcile_errors_total",
        "Total number of failed reconcile passes by error kind"
    );
    describe_histogram!(
        "topocontroller_reconcile_duration_seconds",
        "Duration of reconcile passes in seconds"
    );
    describe_counter!(
        "topocontroller_requeues_total",
        "Total number of rate-limited requeues"
    );
    describe_counter!(
        "topocontroller_items_dropped_total",
        "Total number of work items dropped after a terminal error or exhausted retries"
    );
    describe_gauge!(
        "topocontroller_queue_depth",
        "Number of work items waiting to be processed"
    );
    describe_counter!(
        "topocontroller_watch_events_total",
        "Total number of watch events applied to the cache"
    );
}

/// Record a successful pass
pub fn record_reconcile(outcome: &str, duration: Duration) {
    counter!("topocontroller_reconcile_total", "outcome" => outcome.to_string()).increment(1);
    histogram!("topocontroller_reconcile_duration_seconds").record(duration.as_secs_f64());
}

/// Record a failed pass
pub fn record_reconcile_error(kind: &str, duration: Duration) {
    counter!("topocontroller_reconcile_errors_total", "kind" => kind.to_string()).increment(1);
    histogram!("topocontroller_reconcile_duration_seconds").record(duration.as_secs_f64());
}

pub fn record_requeue() {
    counter!("topocontroller_requeues_total").increment(1);
}

pub fn record_dropped() {
    counter!("topocontroller_items_dropped_total").increment(1);
}

pub fn set_queue_depth(depth: usize) {
    gauge!("topocontroller_queue_depth").set(depth as f64);
}

pub fn record_watch_event(resource: &str, event: &str) {
    counter!(
        "topocontroller_watch_events_total",
        "resource" => resource.to_string(),
        "event" => event.to_string()
    )
    .increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metric_recording() {
        // No recorder installed: these must be no-ops, not panics.
        record_reconcile("updated", Duration::from_millis(5));
        record_reconcile_error("conflict", Duration::from_millis(5));
        record_requeue();
        record_dropped();
        set_queue_depth(3);
        record_watch_event("noderesourcetopology", "apply");
    }
}
