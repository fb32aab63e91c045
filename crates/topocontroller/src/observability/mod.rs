//! Observability
//!
//! - `events`: structured lifecycle events with consistent fields
//! - `metrics`: Prometheus metrics for the queue, workers and watches
//! - `tracing`: subscriber setup (text or JSON, `RUST_LOG` filtering)

pub mod events;
pub mod metrics;
pub mod tracing;

pub use self::metrics::init_metrics;
pub use self::tracing::{init_tracing, TracingConfig};
