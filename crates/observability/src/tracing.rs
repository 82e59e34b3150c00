//! Tracing/logging initialization.

use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

/// Subscriber settings. `RUST_LOG` always wins over `default_filter`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// JSON lines when true, human-readable text otherwise.
    pub json: bool,
    pub default_filter: String,
    pub with_target: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            json: true,
            default_filter: "info".to_string(),
            with_target: false,
        }
    }
}

impl ObservabilityConfig {
    /// Plain text output, useful for local runs and tests.
    pub fn pretty() -> Self {
        Self {
            json: false,
            ..Self::default()
        }
    }

    pub fn with_default_filter(mut self, filter: impl Into<String>) -> Self {
        self.default_filter = filter.into();
        self
    }

    fn env_filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(&self.default_filter))
            .unwrap_or_else(|_| EnvFilter::new("info"))
    }
}

/// Install the global subscriber.
///
/// Returns `false` when a global subscriber was already installed (the call is then a no-op).
pub fn init_with(config: &ObservabilityConfig) -> bool {
    let filter = config.env_filter();

    if config.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .with_timer(tracing_subscriber::fmt::time::SystemTime)
            .with_target(config.with_target)
            .try_init()
            .is_ok()
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(config.with_target)
            .try_init()
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_init_is_a_no_op() {
        init_with(&ObservabilityConfig::pretty());
        assert!(!init_with(&ObservabilityConfig::default()));
        ::tracing::info!("still logging after repeated init");
    }

    #[test]
    fn config_deserializes_with_defaults() {
        let config: ObservabilityConfig =
            serde_json::from_str(r#"{"json": false}"#).unwrap();
        assert_eq!(config, ObservabilityConfig::pretty());

        let config = ObservabilityConfig::default().with_default_filter("keystone_infra=debug");
        assert!(config.json);
        assert_eq!(config.default_filter, "keystone_infra=debug");
    }
}
