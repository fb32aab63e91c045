//! Controller Configuration
//!
//! Tunables for the controller with environment variable overrides. The CLI
//! layers its flags on top of [`ControllerConfig::from_env`].

use crate::queue::{DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("workers must be at least 1")]
    NoWorkers,
    #[error("backoff base delay {base:?} exceeds max delay {max:?}")]
    BackoffRange { base: Duration, max: Duration },
}

/// Controller configuration with sensible defaults
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Namespace of watched objects and of bare keys (env: TOPO_NAMESPACE)
    pub namespace: String,

    /// Number of concurrent workers (env: TOPO_WORKERS)
    pub workers: usize,

    // Retry settings
    /// Failed passes per key before it is dropped (env: TOPO_MAX_RETRIES)
    pub max_retries: u32,

    /// First retry delay, doubled per consecutive failure
    pub base_delay: Duration,

    /// Upper bound for the retry delay
    pub max_delay: Duration,

    /// Interval for re-enqueuing every cached key, zero disables
    /// (env: TOPO_RESYNC_SECS)
    pub resync_period: Duration,

    /// Bound on every remote store call (env: TOPO_REQUEST_TIMEOUT_SECS)
    pub request_timeout: Duration,

    /// Create missing objects for known nodes that have inventory
    pub create_missing: bool,

    /// Watch cluster nodes and delete objects of departed nodes
    pub watch_nodes: bool,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            namespace: "default".to_string(),
            workers: 2,
            max_retries: 10,
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            resync_period: Duration::from_secs(30),
            request_timeout: Duration::from_secs(10),
            create_missing: false,
            watch_nodes: false,
        }
    }
}

impl ControllerConfig {
    /// Create configuration from environment variables with defaults
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(namespace) = lookup("TOPO_NAMESPACE") {
            config.namespace = namespace;
        }

        if let Some(workers) = lookup("TOPO_WORKERS").and_then(|v| v.parse().ok()) {
            config.workers = workers;
        }

        if let Some(retries) = lookup("TOPO_MAX_RETRIES").and_then(|v| v.parse().ok()) {
            config.max_retries = retries;
        }

        if let Some(secs) = lookup("TOPO_RESYNC_SECS").and_then(|v| v.parse().ok()) {
            config.resync_period = Duration::from_secs(secs);
        }

        if let Some(secs) = lookup("TOPO_REQUEST_TIMEOUT_SECS").and_then(|v| v.parse().ok()) {
            config.request_timeout = Duration::from_secs(secs);
        }

        config
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::NoWorkers);
        }
        if self.base_delay > self.max_delay {
            return Err(ConfigError::BackoffRange {
                base: self.base_delay,
                max: self.max_delay,
            });
        }
        Ok(())
    }
}
