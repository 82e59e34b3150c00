//! Tracing/logging setup shared by keystone processes and test harnesses.

/// Tracing configuration (filters, formatters).
pub mod tracing;

pub use crate::tracing::ObservabilityConfig;

/// Initialize process-wide observability with JSON logs.
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() -> bool {
    tracing::init_with(&ObservabilityConfig::default())
}

/// Initialize process-wide observability with an explicit configuration.
pub fn init_with(config: &ObservabilityConfig) -> bool {
    tracing::init_with(config)
}
