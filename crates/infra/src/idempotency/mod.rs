//! Idempotent event consumption.
//!
//! Delivery is at-least-once, so a consumer may see the same event more than once.
//! The idempotency store records `(event_id, processor_id)` pairs that were handled
//! successfully; [`process_event_idempotently`] consults it before running a side
//! effect and records the pair only after the side effect succeeded.

pub mod in_memory;
pub mod postgres;

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use keystone_events::{EventEnvelope, EventHandler, Metadata};

pub use in_memory::InMemoryIdempotencyStore;
pub use postgres::PostgresIdempotencyStore;

/// Proof that a processor handled an event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessedRecord {
    pub event_id: Uuid,
    pub processor_id: String,
    pub processed_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: Metadata,
}

#[derive(Debug, Error)]
pub enum IdempotencyError {
    /// The pair is already recorded. Benign for consumers: skip the event.
    #[error("event {event_id} already processed by '{processor_id}'")]
    AlreadyProcessed { event_id: Uuid, processor_id: String },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The side effect failed; nothing was recorded and the event may be redelivered.
    #[error("processor '{processor_id}' failed on event {event_id}: {source}")]
    Handler {
        event_id: Uuid,
        processor_id: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("idempotency store error: {0}")]
    Store(String),
}

impl IdempotencyError {
    pub fn is_already_processed(&self) -> bool {
        matches!(self, IdempotencyError::AlreadyProcessed { .. })
    }

    /// Failures that may succeed on another attempt: the side effect or the store.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            IdempotencyError::Handler { .. } | IdempotencyError::Store(_)
        )
    }
}

/// Records which events each processor has handled.
#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    async fn has_been_processed(
        &self,
        event_id: Uuid,
        processor_id: &str,
    ) -> Result<bool, IdempotencyError>;

    /// Record the pair. A second insert of the same pair fails with
    /// [`IdempotencyError::AlreadyProcessed`], so of two racing writers exactly one wins.
    async fn mark_as_processed(
        &self,
        event_id: Uuid,
        processor_id: &str,
        metadata: Metadata,
    ) -> Result<ProcessedRecord, IdempotencyError>;

    async fn get_record(
        &self,
        event_id: Uuid,
        processor_id: &str,
    ) -> Result<Option<ProcessedRecord>, IdempotencyError>;

    /// Delete records processed before `cutoff`. Returns how many were removed.
    async fn purge_processed_before(&self, cutoff: DateTime<Utc>) -> Result<u64, IdempotencyError>;
}

#[async_trait]
impl<S> IdempotencyStore for Arc<S>
where
    S: IdempotencyStore + ?Sized,
{
    async fn has_been_processed(
        &self,
        event_id: Uuid,
        processor_id: &str,
    ) -> Result<bool, IdempotencyError> {
        (**self).has_been_processed(event_id, processor_id).await
    }

    async fn mark_as_processed(
        &self,
        event_id: Uuid,
        processor_id: &str,
        metadata: Metadata,
    ) -> Result<ProcessedRecord, IdempotencyError> {
        (**self)
            .mark_as_processed(event_id, processor_id, metadata)
            .await
    }

    async fn get_record(
        &self,
        event_id: Uuid,
        processor_id: &str,
    ) -> Result<Option<ProcessedRecord>, IdempotencyError> {
        (**self).get_record(event_id, processor_id).await
    }

    async fn purge_processed_before(&self, cutoff: DateTime<Utc>) -> Result<u64, IdempotencyError> {
        (**self).purge_processed_before(cutoff).await
    }
}

pub(crate) fn validate_processor_id(processor_id: &str) -> Result<(), IdempotencyError> {
    if processor_id.trim().is_empty() {
        return Err(IdempotencyError::InvalidArgument(
            "processor_id must not be blank".to_string(),
        ));
    }
    Ok(())
}

/// Run `handler` for `envelope` at most once per `processor_id`.
///
/// - already processed: `Err(AlreadyProcessed)`, handler not called
/// - handler fails: `Err(Handler)`, nothing recorded
/// - handler succeeds: the pair is recorded and the record returned
///
/// A crash between the side effect and the record means the event is handled again
/// on redelivery.
pub async fn process_event_idempotently<'a, E, S, F, Fut>(
    envelope: &'a EventEnvelope<E>,
    store: &S,
    processor_id: &str,
    handler: F,
) -> Result<ProcessedRecord, IdempotencyError>
where
    S: IdempotencyStore + ?Sized,
    F: FnOnce(&'a EventEnvelope<E>) -> Fut,
    Fut: Future<Output = anyhow::Result<()>>,
{
    validate_processor_id(processor_id)?;
    let event_id = envelope.event_id();

    if store.has_been_processed(event_id, processor_id).await? {
        debug!(%event_id, processor_id, "event already processed, skipping");
        return Err(IdempotencyError::AlreadyProcessed {
            event_id,
            processor_id: processor_id.to_string(),
        });
    }

    if let Err(source) = handler(envelope).await {
        warn!(%event_id, processor_id, error = %source, "event handler failed");
        return Err(IdempotencyError::Handler {
            event_id,
            processor_id: processor_id.to_string(),
            source,
        });
    }

    store
        .mark_as_processed(event_id, processor_id, envelope.metadata().clone())
        .await
}

/// [`process_event_idempotently`] for an [`EventHandler`], keyed by its `processor_id()`.
pub async fn handle_idempotently<S, H>(
    envelope: &EventEnvelope<JsonValue>,
    store: &S,
    handler: &H,
) -> Result<ProcessedRecord, IdempotencyError>
where
    S: IdempotencyStore + ?Sized,
    H: EventHandler + ?Sized,
{
    process_event_idempotently(envelope, store, handler.processor_id(), |env| {
        handler.handle(env)
    })
    .await
}
