use async_trait::async_trait;
use serde_json::Value as JsonValue;

use crate::EventEnvelope;

/// Consumer-side side effect for published events (projector, notifier, integration).
///
/// Handlers receive the untyped envelope; they decode the payload they care about and
/// ignore the rest. Side effects are application-defined, so failures are
/// `anyhow::Error`.
///
/// ## Idempotency
///
/// Delivery is at-least-once. Run handlers through the idempotency store with a stable
/// `processor_id` so a redelivered event is skipped rather than applied twice. A handler
/// that returns `Err` is not marked processed and will run again on redelivery.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Stable identifier of this consumer; part of the idempotency key.
    fn processor_id(&self) -> &str;

    async fn handle(&self, envelope: &EventEnvelope<JsonValue>) -> anyhow::Result<()>;
}
