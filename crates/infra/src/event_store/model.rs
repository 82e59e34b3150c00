use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use keystone_core::{AggregateId, SnapshotState, TenantId};
use keystone_events::{Event, EventEnvelope, Metadata};

use super::r#trait::EventStoreError;

/// An event ready to be appended to a stream (not yet assigned a sequence number).
///
/// ## Event Lifecycle
///
/// 1. **Domain event**: produced by the aggregate's `handle()`
/// 2. **UncommittedEvent**: serialized and wrapped with stream metadata
/// 3. **StoredEvent**: persisted with its assigned sequence number
/// 4. **EventEnvelope**: published to consumers
///
/// Build one with [`UncommittedEvent::from_typed`], which captures the event type,
/// schema version and business time needed to decode the payload later.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UncommittedEvent {
    pub event_id: Uuid,
    pub tenant_id: TenantId,
    pub aggregate_id: AggregateId,
    pub aggregate_type: String,

    pub event_type: String,
    pub event_version: u32,
    pub occurred_at: DateTime<Utc>,

    #[serde(default)]
    pub metadata: Metadata,
    pub payload: JsonValue,
}

impl UncommittedEvent {
    /// Serialize a typed domain event into an appendable record.
    pub fn from_typed<E>(
        tenant_id: &TenantId,
        aggregate_id: AggregateId,
        aggregate_type: impl Into<String>,
        event_id: Uuid,
        event: &E,
        metadata: Metadata,
    ) -> Result<Self, EventStoreError>
    where
        E: Event + Serialize,
    {
        let payload = serde_json::to_value(event).map_err(|e| {
            EventStoreError::Serialization(format!(
                "payload serialization failed for '{}': {e}",
                event.event_type()
            ))
        })?;

        Ok(Self {
            event_id,
            tenant_id: tenant_id.clone(),
            aggregate_id,
            aggregate_type: aggregate_type.into(),
            event_type: event.event_type().to_string(),
            event_version: event.version(),
            occurred_at: event.occurred_at(),
            metadata,
            payload,
        })
    }

    /// Attach the sequence number assigned by the store.
    pub(crate) fn into_stored(self, sequence_number: u64) -> StoredEvent {
        StoredEvent {
            event_id: self.event_id,
            tenant_id: self.tenant_id,
            aggregate_id: self.aggregate_id,
            aggregate_type: self.aggregate_type,
            sequence_number,
            event_type: self.event_type,
            event_version: self.event_version,
            occurred_at: self.occurred_at,
            metadata: self.metadata,
            payload: self.payload,
        }
    }
}

/// A stored event in an append-only stream (assigned a sequence number).
///
/// Sequence numbers are stream-scoped (`tenant_id` + `aggregate_id`), start at 1,
/// have no gaps, and never change once assigned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredEvent {
    pub event_id: Uuid,
    pub tenant_id: TenantId,
    pub aggregate_id: AggregateId,
    pub aggregate_type: String,

    /// Position in the aggregate stream.
    pub sequence_number: u64,

    pub event_type: String,
    pub event_version: u32,
    pub occurred_at: DateTime<Utc>,

    #[serde(default)]
    pub metadata: Metadata,
    pub payload: JsonValue,
}

impl StoredEvent {
    /// Decode the payload into the aggregate's event type.
    pub fn decode<E: DeserializeOwned>(&self) -> Result<E, EventStoreError> {
        serde_json::from_value(self.payload.clone()).map_err(|e| {
            EventStoreError::Serialization(format!(
                "cannot decode '{}' at sequence {}: {e}",
                self.event_type, self.sequence_number
            ))
        })
    }

    /// Convert a stored event into a tenant-scoped event envelope for publication.
    pub fn to_envelope(&self) -> EventEnvelope<JsonValue> {
        EventEnvelope::new(
            self.event_id,
            self.tenant_id.clone(),
            self.aggregate_id,
            self.aggregate_type.clone(),
            self.sequence_number,
            self.payload.clone(),
        )
        .with_event_type(self.event_type.clone(), self.event_version)
        .with_occurred_at(self.occurred_at)
        .with_metadata(self.metadata.clone())
    }
}

/// Aggregate snapshot for fast rehydration.
///
/// At most one current snapshot exists per `(tenant_id, aggregate_id)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub tenant_id: TenantId,
    pub aggregate_id: AggregateId,
    pub aggregate_type: String,
    /// Aggregate version the state was captured at.
    pub sequence_number: u64,
    pub state: JsonValue,
    pub created_at: DateTime<Utc>,
}

impl Snapshot {
    pub fn from_state(tenant_id: &TenantId, aggregate_id: AggregateId, state: SnapshotState) -> Self {
        Self {
            tenant_id: tenant_id.clone(),
            aggregate_id,
            aggregate_type: state.aggregate_type,
            sequence_number: state.sequence_number,
            state: state.state,
            created_at: Utc::now(),
        }
    }

    pub fn into_state(self) -> SnapshotState {
        SnapshotState {
            aggregate_type: self.aggregate_type,
            sequence_number: self.sequence_number,
            state: self.state,
        }
    }
}
