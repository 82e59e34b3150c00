use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use keystone_core::{AggregateId, ExpectedVersion, TenantId};

use super::model::{Snapshot, StoredEvent, UncommittedEvent};

/// Event store operation error.
///
/// These are **infrastructure errors** (storage, concurrency, isolation) as opposed to
/// domain errors (validation, invariants).
///
/// ## Error Categories
///
/// - **Concurrency**: the stream moved past the expected version. Callers resolve it by
///   reloading and re-deciding; the store never retries.
/// - **InvalidBatch**: the append or snapshot request itself is malformed.
/// - **TenantIsolation**: data for another tenant or aggregate showed up in a stream.
/// - **AggregateTypeMismatch**: the stream already belongs to another aggregate type.
/// - **Serialization**: a payload could not be encoded or decoded.
/// - **Backend** / **Timeout**: storage I/O failed or did not answer in time. Transient.
#[derive(Debug, Error)]
pub enum EventStoreError {
    #[error(
        "optimistic concurrency check failed for tenant '{tenant_id}', aggregate {aggregate_id}: expected version {expected}, actual {actual}"
    )]
    Concurrency {
        tenant_id: TenantId,
        aggregate_id: AggregateId,
        expected: u64,
        actual: u64,
    },

    #[error("tenant isolation violation: {0}")]
    TenantIsolation(String),

    #[error("aggregate type mismatch: {0}")]
    AggregateTypeMismatch(String),

    #[error("invalid batch: {0}")]
    InvalidBatch(String),

    #[error("serialization failed: {0}")]
    Serialization(String),

    #[error("storage backend error: {0}")]
    Backend(String),

    #[error("event store operation '{operation}' timed out after {elapsed:?}")]
    Timeout {
        operation: &'static str,
        elapsed: Duration,
    },
}

impl EventStoreError {
    pub fn is_concurrency(&self) -> bool {
        matches!(self, EventStoreError::Concurrency { .. })
    }
}

/// Append-only, tenant-scoped event store.
///
/// ## Design Principles
///
/// - **Tenant isolation**: every operation is keyed by `(tenant_id, aggregate_id)`;
///   there is no way to address a stream without its tenant.
/// - **Optimistic locking**: via `ExpectedVersion` (no pessimistic locks).
/// - **Append-only**: events are never modified or deleted.
///
/// ## Append Semantics
///
/// `append_events()`:
/// - rejects an empty batch, or one whose events name another tenant/aggregate
/// - checks the current version against `expected_version`
/// - assigns sequence numbers `expected + 1 ..= expected + len`
/// - persists atomically (all or nothing)
///
/// ## Snapshots
///
/// Snapshots are an optimization only. `save_snapshot()` upserts the single current
/// snapshot of a stream and refuses one taken beyond the stream's version.
#[async_trait]
pub trait EventStore: Send + Sync {
    async fn append_events(
        &self,
        tenant_id: &TenantId,
        aggregate_id: AggregateId,
        events: Vec<UncommittedEvent>,
        expected_version: ExpectedVersion,
    ) -> Result<Vec<StoredEvent>, EventStoreError>;

    /// Events with `sequence_number >= from_sequence`, ascending.
    async fn get_events(
        &self,
        tenant_id: &TenantId,
        aggregate_id: AggregateId,
        from_sequence: u64,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        self.get_events_in_range(tenant_id, aggregate_id, from_sequence, None)
            .await
    }

    /// Events within `from_sequence ..= to_sequence` (open-ended when `None`), ascending.
    async fn get_events_in_range(
        &self,
        tenant_id: &TenantId,
        aggregate_id: AggregateId,
        from_sequence: u64,
        to_sequence: Option<u64>,
    ) -> Result<Vec<StoredEvent>, EventStoreError>;

    async fn save_snapshot(&self, snapshot: Snapshot) -> Result<(), EventStoreError>;

    async fn get_snapshot(
        &self,
        tenant_id: &TenantId,
        aggregate_id: AggregateId,
    ) -> Result<Option<Snapshot>, EventStoreError>;

    /// Highest stored sequence number, `None` if the stream was never written.
    async fn get_current_version(
        &self,
        tenant_id: &TenantId,
        aggregate_id: AggregateId,
    ) -> Result<Option<u64>, EventStoreError>;
}

#[async_trait]
impl<S> EventStore for Arc<S>
where
    S: EventStore + ?Sized,
{
    async fn append_events(
        &self,
        tenant_id: &TenantId,
        aggregate_id: AggregateId,
        events: Vec<UncommittedEvent>,
        expected_version: ExpectedVersion,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        (**self)
            .append_events(tenant_id, aggregate_id, events, expected_version)
            .await
    }

    async fn get_events(
        &self,
        tenant_id: &TenantId,
        aggregate_id: AggregateId,
        from_sequence: u64,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        (**self)
            .get_events(tenant_id, aggregate_id, from_sequence)
            .await
    }

    async fn get_events_in_range(
        &self,
        tenant_id: &TenantId,
        aggregate_id: AggregateId,
        from_sequence: u64,
        to_sequence: Option<u64>,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        (**self)
            .get_events_in_range(tenant_id, aggregate_id, from_sequence, to_sequence)
            .await
    }

    async fn save_snapshot(&self, snapshot: Snapshot) -> Result<(), EventStoreError> {
        (**self).save_snapshot(snapshot).await
    }

    async fn get_snapshot(
        &self,
        tenant_id: &TenantId,
        aggregate_id: AggregateId,
    ) -> Result<Option<Snapshot>, EventStoreError> {
        (**self).get_snapshot(tenant_id, aggregate_id).await
    }

    async fn get_current_version(
        &self,
        tenant_id: &TenantId,
        aggregate_id: AggregateId,
    ) -> Result<Option<u64>, EventStoreError> {
        (**self).get_current_version(tenant_id, aggregate_id).await
    }
}

/// Check that a batch is non-empty and addressed entirely to one stream.
///
/// Returns the batch's aggregate type.
pub(crate) fn validate_batch<'a>(
    tenant_id: &TenantId,
    aggregate_id: AggregateId,
    events: &'a [UncommittedEvent],
) -> Result<&'a str, EventStoreError> {
    let Some(first) = events.first() else {
        return Err(EventStoreError::InvalidBatch(
            "cannot append an empty batch".to_string(),
        ));
    };

    for (idx, e) in events.iter().enumerate() {
        if &e.tenant_id != tenant_id {
            return Err(EventStoreError::InvalidBatch(format!(
                "event at index {idx} belongs to tenant '{}', append is for '{tenant_id}'",
                e.tenant_id
            )));
        }
        if e.aggregate_id != aggregate_id {
            return Err(EventStoreError::InvalidBatch(format!(
                "event at index {idx} targets aggregate {}, append is for {aggregate_id}",
                e.aggregate_id
            )));
        }
        if e.aggregate_type != first.aggregate_type {
            return Err(EventStoreError::InvalidBatch(format!(
                "batch mixes aggregate types '{}' and '{}' (index {idx})",
                first.aggregate_type, e.aggregate_type
            )));
        }
    }

    Ok(&first.aggregate_type)
}

/// Check a snapshot against the stream it is about to be saved for.
pub(crate) fn validate_snapshot(
    snapshot: &Snapshot,
    current_version: Option<u64>,
) -> Result<(), EventStoreError> {
    if snapshot.sequence_number == 0 {
        return Err(EventStoreError::InvalidBatch(
            "snapshot sequence_number must be positive".to_string(),
        ));
    }
    let current = current_version.unwrap_or(0);
    if snapshot.sequence_number > current {
        return Err(EventStoreError::InvalidBatch(format!(
            "snapshot at sequence {} is beyond stream version {current}",
            snapshot.sequence_number
        )));
    }
    Ok(())
}

/// Check that a row read back for `(tenant_id, aggregate_id)` really belongs to that stream.
///
/// Queries are keyed by both columns, so a mismatch means the backend returned
/// foreign data; nothing from such a read may reach the caller.
pub(crate) fn ensure_stream_owner(
    tenant_id: &TenantId,
    aggregate_id: AggregateId,
    row_tenant_id: &TenantId,
    row_aggregate_id: AggregateId,
    what: &str,
) -> Result<(), EventStoreError> {
    if row_tenant_id != tenant_id {
        return Err(EventStoreError::TenantIsolation(format!(
            "{what} for tenant '{tenant_id}' came back owned by tenant '{row_tenant_id}'"
        )));
    }
    if row_aggregate_id != aggregate_id {
        return Err(EventStoreError::TenantIsolation(format!(
            "{what} for aggregate {aggregate_id} came back owned by aggregate {row_aggregate_id}"
        )));
    }
    Ok(())
}
