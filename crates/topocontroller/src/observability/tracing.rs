//! Tracing subscriber setup
//!
//! Environment variables:
//! - `RUST_LOG` - filter directives (default: `info`)
//! - `LOG_FORMAT` - set to `json` for JSON output (default: `text`)

use tracing::level_filters::LevelFilter;
use tracing_subscriber::{
    fmt, layer::SubscriberExt, util::SubscriberInitExt, util::TryInitError, EnvFilter,
};

/// Configuration for tracing initialization
#[derive(Debug, Clone)]
pub struct TracingConfig {
    /// Log format: "text" or "json"
    pub log_format: String,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            log_format: "text".to_string(),
        }
    }
}

impl TracingConfig {
    /// Create config from environment variables
    pub fn from_env() -> Self {
        Self {
            log_format: std::env::var("LOG_FORMAT").unwrap_or_else(|_| "text".to_string()),
        }
    }

    pub fn is_json(&self) -> bool {
        self.log_format.eq_ignore_ascii_case("json")
    }
}

/// Install the global subscriber.
pub fn init_tracing(config: &TracingConfig) -> Result<(), TryInitError> {
    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();

    if config.is_json() {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().json())
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer())
            .try_init()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tracing_config_default() {
        let config = TracingConfig::default();
        assert_eq!(config.log_format, "text");
        assert!(!config.is_json());
        assert!(TracingConfig {
            log_format: "JSON".to_string()
        }
        .is_json());
    }
}
