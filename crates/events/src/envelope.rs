use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use keystone_core::{AggregateId, TenantId};

use crate::Event;

/// Opaque, ordered key/value metadata carried on events (correlation ids, actor, ...).
///
/// Forwarded verbatim as transport headers when an event is published.
pub type Metadata = BTreeMap<String, String>;

/// Envelope for a committed event, containing multi-tenant + stream metadata.
///
/// This is what publishers send and consumers receive.
///
/// Notes:
/// - **Multi-tenancy** is enforced here via `tenant_id`.
/// - **Append-only**: `sequence_number` is gap-free and increasing per stream, starting at 1.
/// - `payload` is the typed event, or `serde_json::Value` on the consumer side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope<E> {
    event_id: Uuid,
    tenant_id: TenantId,

    aggregate_id: AggregateId,
    aggregate_type: String,

    /// Position in the aggregate stream.
    sequence_number: u64,

    event_type: String,
    event_version: u32,
    occurred_at: DateTime<Utc>,

    #[serde(default)]
    metadata: Metadata,

    payload: E,
}

impl<E> EventEnvelope<E> {
    /// Build an envelope for an untyped (or non-[`Event`]) payload.
    ///
    /// `event_type` defaults to empty, `event_version` to 1 and `occurred_at` to now;
    /// use the `with_*` builders to set them.
    pub fn new(
        event_id: Uuid,
        tenant_id: TenantId,
        aggregate_id: AggregateId,
        aggregate_type: impl Into<String>,
        sequence_number: u64,
        payload: E,
    ) -> Self {
        Self {
            event_id,
            tenant_id,
            aggregate_id,
            aggregate_type: aggregate_type.into(),
            sequence_number,
            event_type: String::new(),
            event_version: 1,
            occurred_at: Utc::now(),
            metadata: Metadata::new(),
            payload,
        }
    }

    pub fn with_event_type(mut self, event_type: impl Into<String>, event_version: u32) -> Self {
        self.event_type = event_type.into();
        self.event_version = event_version;
        self
    }

    pub fn with_occurred_at(mut self, occurred_at: DateTime<Utc>) -> Self {
        self.occurred_at = occurred_at;
        self
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn event_id(&self) -> Uuid {
        self.event_id
    }

    pub fn tenant_id(&self) -> &TenantId {
        &self.tenant_id
    }

    pub fn aggregate_id(&self) -> AggregateId {
        self.aggregate_id
    }

    pub fn aggregate_type(&self) -> &str {
        &self.aggregate_type
    }

    pub fn sequence_number(&self) -> u64 {
        self.sequence_number
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn event_version(&self) -> u32 {
        self.event_version
    }

    pub fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn payload(&self) -> &E {
        &self.payload
    }

    pub fn into_payload(self) -> E {
        self.payload
    }

    /// Convert the payload while keeping every header field.
    pub fn try_map_payload<U, Err>(
        self,
        f: impl FnOnce(E) -> Result<U, Err>,
    ) -> Result<EventEnvelope<U>, Err> {
        let payload = f(self.payload)?;
        Ok(EventEnvelope {
            event_id: self.event_id,
            tenant_id: self.tenant_id,
            aggregate_id: self.aggregate_id,
            aggregate_type: self.aggregate_type,
            sequence_number: self.sequence_number,
            event_type: self.event_type,
            event_version: self.event_version,
            occurred_at: self.occurred_at,
            metadata: self.metadata,
            payload,
        })
    }
}

impl<E: Event> EventEnvelope<E> {
    /// Build an envelope for a typed domain event, taking type, version and time from it.
    pub fn from_event(
        event_id: Uuid,
        tenant_id: TenantId,
        aggregate_id: AggregateId,
        aggregate_type: impl Into<String>,
        sequence_number: u64,
        payload: E,
    ) -> Self {
        let event_type = payload.event_type();
        let event_version = payload.version();
        let occurred_at = payload.occurred_at();
        Self::new(
            event_id,
            tenant_id,
            aggregate_id,
            aggregate_type,
            sequence_number,
            payload,
        )
        .with_event_type(event_type, event_version)
        .with_occurred_at(occurred_at)
    }
}
