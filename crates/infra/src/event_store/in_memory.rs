use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;

use keystone_core::{AggregateId, ExpectedVersion, TenantId};

use super::model::{Snapshot, StoredEvent, UncommittedEvent};
use super::r#trait::{EventStore, EventStoreError, validate_batch, validate_snapshot};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct StreamKey {
    tenant_id: TenantId,
    aggregate_id: AggregateId,
}

impl StreamKey {
    fn new(tenant_id: &TenantId, aggregate_id: AggregateId) -> Self {
        Self {
            tenant_id: tenant_id.clone(),
            aggregate_id,
        }
    }
}

/// In-memory append-only event store.
///
/// Intended for tests/dev. Not optimized for performance. Lock guards are never held
/// across an `.await`.
#[derive(Debug, Default)]
pub struct InMemoryEventStore {
    streams: RwLock<HashMap<StreamKey, Vec<StoredEvent>>>,
    snapshots: RwLock<HashMap<StreamKey, Snapshot>>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn current_version(stream: &[StoredEvent]) -> u64 {
        stream.last().map(|e| e.sequence_number).unwrap_or(0)
    }

    fn poisoned() -> EventStoreError {
        EventStoreError::Backend("lock poisoned".to_string())
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn append_events(
        &self,
        tenant_id: &TenantId,
        aggregate_id: AggregateId,
        events: Vec<UncommittedEvent>,
        expected_version: ExpectedVersion,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        let aggregate_type = validate_batch(tenant_id, aggregate_id, &events)?.to_string();

        let key = StreamKey::new(tenant_id, aggregate_id);
        let mut streams = self.streams.write().map_err(|_| Self::poisoned())?;
        let existing = streams.get(&key);
        let current = existing.map(|s| Self::current_version(s)).unwrap_or(0);

        if !expected_version.matches(current) {
            return Err(EventStoreError::Concurrency {
                tenant_id: tenant_id.clone(),
                aggregate_id,
                expected: expected_version.as_u64(),
                actual: current,
            });
        }

        // Enforce aggregate type stability across the stream.
        if let Some(first) = existing.and_then(|s| s.first()) {
            if first.aggregate_type != aggregate_type {
                return Err(EventStoreError::AggregateTypeMismatch(format!(
                    "stream aggregate_type is '{}', attempted append with '{}'",
                    first.aggregate_type, aggregate_type
                )));
            }
        }

        let committed: Vec<StoredEvent> = events
            .into_iter()
            .zip(current + 1..)
            .map(|(e, sequence)| e.into_stored(sequence))
            .collect();
        // Streams are created only by a successful append.
        streams
            .entry(key)
            .or_default()
            .extend(committed.iter().cloned());

        Ok(committed)
    }

    async fn get_events_in_range(
        &self,
        tenant_id: &TenantId,
        aggregate_id: AggregateId,
        from_sequence: u64,
        to_sequence: Option<u64>,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        let streams = self.streams.read().map_err(|_| Self::poisoned())?;
        let Some(stream) = streams.get(&StreamKey::new(tenant_id, aggregate_id)) else {
            return Ok(Vec::new());
        };

        Ok(stream
            .iter()
            .filter(|e| e.sequence_number >= from_sequence)
            .take_while(|e| to_sequence.is_none_or(|to| e.sequence_number <= to))
            .cloned()
            .collect())
    }

    async fn save_snapshot(&self, snapshot: Snapshot) -> Result<(), EventStoreError> {
        let key = StreamKey::new(&snapshot.tenant_id, snapshot.aggregate_id);

        {
            let streams = self.streams.read().map_err(|_| Self::poisoned())?;
            let stream = streams.get(&key);
            validate_snapshot(&snapshot, stream.map(|s| Self::current_version(s)))?;
            if let Some(existing) = stream.and_then(|s| s.first()) {
                if existing.aggregate_type != snapshot.aggregate_type {
                    return Err(EventStoreError::AggregateTypeMismatch(format!(
                        "stream aggregate_type is '{}', snapshot is '{}'",
                        existing.aggregate_type, snapshot.aggregate_type
                    )));
                }
            }
        }

        let mut snapshots = self.snapshots.write().map_err(|_| Self::poisoned())?;
        // Never replace a newer snapshot with an older one.
        let keep_existing = snapshots
            .get(&key)
            .is_some_and(|existing| existing.sequence_number > snapshot.sequence_number);
        if !keep_existing {
            snapshots.insert(key, snapshot);
        }
        Ok(())
    }

    async fn get_snapshot(
        &self,
        tenant_id: &TenantId,
        aggregate_id: AggregateId,
    ) -> Result<Option<Snapshot>, EventStoreError> {
        let snapshots = self.snapshots.read().map_err(|_| Self::poisoned())?;
        Ok(snapshots
            .get(&StreamKey::new(tenant_id, aggregate_id))
            .cloned())
    }

    async fn get_current_version(
        &self,
        tenant_id: &TenantId,
        aggregate_id: AggregateId,
    ) -> Result<Option<u64>, EventStoreError> {
        let streams = self.streams.read().map_err(|_| Self::poisoned())?;
        Ok(streams
            .get(&StreamKey::new(tenant_id, aggregate_id))
            .and_then(|s| s.last())
            .map(|e| e.sequence_number))
    }
}
