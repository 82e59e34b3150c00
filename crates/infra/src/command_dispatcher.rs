//! Command execution pipeline (application-level orchestration).
//!
//! ```text
//! Command
//!   ↓
//! 1. Load snapshot + remaining events (tenant-scoped)
//!   ↓
//! 2. Rehydrate aggregate
//!   ↓
//! 3. Execute command (validate, then apply the produced events)
//!   ↓
//! 4. Append uncommitted events at the committed version (optimistic concurrency)
//!   ↓
//! 5. Publish committed events
//! ```
//!
//! A concurrency conflict at step 4 reloads and re-executes the command, up to
//! `max_conflict_retries` times. Publication happens only after a successful append,
//! so a publish failure never loses events: they are in the store and can be
//! re-driven with [`CommandDispatcher::republish`].

use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use keystone_core::{
    Aggregate, AggregateId, AggregateRoot, DomainError, ExpectedVersion, SnapshotError, TenantId,
};
use keystone_events::{Command, Event, Metadata, PublishAck, PublishTransport};

use crate::event_store::{EventStore, EventStoreError, Snapshot, StoredEvent, UncommittedEvent};
use crate::publisher::{EventPublisher, PublishError};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatcherConfig {
    /// Bound on a single append. On expiry the outcome is resolved by re-reading the stream.
    pub append_timeout: Duration,
    /// Reload-and-retry budget after an optimistic concurrency conflict.
    pub max_conflict_retries: u32,
    /// Snapshot every N events. 0 disables snapshotting.
    pub snapshot_every: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            append_timeout: Duration::from_secs(10),
            max_conflict_retries: 3,
            snapshot_every: 0,
        }
    }
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(
        "concurrency conflict on tenant '{tenant_id}', aggregate {aggregate_id}: expected version {expected}, actual {actual}"
    )]
    Concurrency {
        tenant_id: TenantId,
        aggregate_id: AggregateId,
        expected: u64,
        actual: u64,
    },

    /// Loaded data belongs to another tenant or aggregate.
    #[error("tenant isolation violation: {0}")]
    TenantIsolation(String),

    /// Loaded stream has gaps, foreign aggregate types or out-of-order sequences.
    #[error("corrupt stream: {0}")]
    CorruptStream(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("not found")]
    NotFound,

    /// Stored event payloads could not be decoded into the aggregate's event type.
    #[error("failed to decode stored event: {0}")]
    Deserialize(String),

    #[error(transparent)]
    Snapshot(#[from] SnapshotError),

    #[error("event store error: {0}")]
    Store(EventStoreError),

    /// Publication failed after a successful append. `committed` is durable.
    #[error("{} committed events were not published: {source}", .committed.len())]
    Publish {
        committed: Vec<StoredEvent>,
        #[source]
        source: PublishError,
    },
}

impl DispatchError {
    pub fn is_concurrency(&self) -> bool {
        matches!(self, DispatchError::Concurrency { .. })
    }
}

impl From<EventStoreError> for DispatchError {
    fn from(value: EventStoreError) -> Self {
        match value {
            EventStoreError::Concurrency {
                tenant_id,
                aggregate_id,
                expected,
                actual,
            } => DispatchError::Concurrency {
                tenant_id,
                aggregate_id,
                expected,
                actual,
            },
            EventStoreError::TenantIsolation(msg) => DispatchError::TenantIsolation(msg),
            other => DispatchError::Store(other),
        }
    }
}

impl From<DomainError> for DispatchError {
    fn from(value: DomainError) -> Self {
        match value {
            DomainError::Validation(msg) => DispatchError::Validation(msg),
            DomainError::InvariantViolation(msg) => DispatchError::InvariantViolation(msg),
            DomainError::InvalidId(msg) => DispatchError::Validation(msg),
            DomainError::InvalidArgument(msg) => DispatchError::InvalidArgument(msg),
            DomainError::Conflict(msg) => DispatchError::Conflict(msg),
            DomainError::NotFound => DispatchError::NotFound,
        }
    }
}

/// Reusable command execution engine for event-sourced aggregates.
///
/// - `S`: event store
/// - `T`: publish transport behind the [`EventPublisher`]
///
/// Aggregates are loaded per call and never shared between calls; two concurrent
/// dispatches to the same aggregate are serialized by the store's version check.
#[derive(Debug)]
pub struct CommandDispatcher<S, T> {
    store: S,
    publisher: EventPublisher<T>,
    config: DispatcherConfig,
}

impl<S, T> CommandDispatcher<S, T> {
    pub fn new(store: S, publisher: EventPublisher<T>, config: DispatcherConfig) -> Self {
        Self {
            store,
            publisher,
            config,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn publisher(&self) -> &EventPublisher<T> {
        &self.publisher
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    pub fn into_parts(self) -> (S, EventPublisher<T>) {
        (self.store, self.publisher)
    }
}

impl<S, T> CommandDispatcher<S, T>
where
    S: EventStore,
    T: PublishTransport,
{
    /// Rebuild an aggregate from its latest snapshot (if any) plus the events after it.
    #[instrument(
        skip(self),
        fields(tenant_id = %tenant_id, aggregate_type = A::aggregate_type(), version = tracing::field::Empty),
        err
    )]
    pub async fn load<A>(
        &self,
        tenant_id: &TenantId,
        aggregate_id: AggregateId,
    ) -> Result<AggregateRoot<A>, DispatchError>
    where
        A: Aggregate,
        A::Event: DeserializeOwned,
    {
        let mut root = AggregateRoot::<A>::new(aggregate_id);

        if let Some(snapshot) = self.store.get_snapshot(tenant_id, aggregate_id).await? {
            validate_snapshot_owner(tenant_id, aggregate_id, &snapshot)?;
            root.restore_from_snapshot(snapshot.into_state())?;
            debug!(snapshot_version = root.version(), "restored from snapshot");
        }

        let from_version = root.version();
        let history = self
            .store
            .get_events(tenant_id, aggregate_id, from_version + 1)
            .await?;
        validate_loaded_stream(
            tenant_id,
            aggregate_id,
            A::aggregate_type(),
            from_version,
            &history,
        )?;

        let events = history
            .iter()
            .map(|stored| {
                stored
                    .decode::<A::Event>()
                    .map_err(|e| DispatchError::Deserialize(e.to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        root.rehydrate(events, from_version);

        tracing::Span::current().record("version", root.version());
        Ok(root)
    }

    /// Append the aggregate's uncommitted events at its committed version.
    pub async fn commit<A>(
        &self,
        tenant_id: &TenantId,
        root: &mut AggregateRoot<A>,
    ) -> Result<Vec<StoredEvent>, DispatchError>
    where
        A: Aggregate,
        A::Event: Event + Serialize,
    {
        self.commit_with_metadata(tenant_id, root, Metadata::new())
            .await
    }

    /// [`commit`](Self::commit) with metadata (correlation ids, actor) stamped on every event.
    ///
    /// An append that does not answer within `append_timeout` has an unknown outcome.
    /// The stream is re-read: if the batch landed the commit succeeds, otherwise the
    /// timeout is returned and the buffer stays pending.
    #[instrument(
        skip(self, root, metadata),
        fields(
            tenant_id = %tenant_id,
            aggregate_id = %root.id(),
            aggregate_type = A::aggregate_type(),
            expected_version = root.committed_version(),
            pending = root.uncommitted_events().len()
        ),
        err
    )]
    pub async fn commit_with_metadata<A>(
        &self,
        tenant_id: &TenantId,
        root: &mut AggregateRoot<A>,
        metadata: Metadata,
    ) -> Result<Vec<StoredEvent>, DispatchError>
    where
        A: Aggregate,
        A::Event: Event + Serialize,
    {
        if !root.has_uncommitted_events() {
            return Ok(Vec::new());
        }

        let aggregate_id = root.id();
        let expected = root.expected_version();
        let uncommitted = root
            .uncommitted_events()
            .iter()
            .map(|event| {
                UncommittedEvent::from_typed(
                    tenant_id,
                    aggregate_id,
                    A::aggregate_type(),
                    Uuid::now_v7(),
                    event,
                    metadata.clone(),
                )
            })
            .collect::<Result<Vec<_>, _>>()?;
        let event_ids: Vec<Uuid> = uncommitted.iter().map(|e| e.event_id).collect();

        let append = self
            .store
            .append_events(tenant_id, aggregate_id, uncommitted, expected);
        let committed = match tokio::time::timeout(self.config.append_timeout, append).await {
            Ok(result) => result?,
            Err(_) => {
                self.resolve_unknown_append(tenant_id, aggregate_id, expected, &event_ids)
                    .await?
            }
        };

        root.mark_events_as_committed();
        self.maybe_snapshot(tenant_id, root, expected.as_u64()).await;

        Ok(committed)
    }

    /// Execute `command` against its aggregate, persist the result and publish it.
    ///
    /// Returns the committed events; an empty vector when the command produced none.
    pub async fn dispatch<A>(
        &self,
        tenant_id: &TenantId,
        command: A::Command,
    ) -> Result<Vec<StoredEvent>, DispatchError>
    where
        A: Aggregate<Error = DomainError>,
        A::Command: Command,
        A::Event: Event + Serialize + DeserializeOwned,
    {
        self.dispatch_with_metadata::<A>(tenant_id, command, Metadata::new())
            .await
    }

    #[instrument(
        skip(self, command, metadata),
        fields(
            tenant_id = %tenant_id,
            aggregate_id = %command.target_aggregate_id(),
            aggregate_type = A::aggregate_type()
        ),
        err
    )]
    pub async fn dispatch_with_metadata<A>(
        &self,
        tenant_id: &TenantId,
        command: A::Command,
        metadata: Metadata,
    ) -> Result<Vec<StoredEvent>, DispatchError>
    where
        A: Aggregate<Error = DomainError>,
        A::Command: Command,
        A::Event: Event + Serialize + DeserializeOwned,
    {
        let aggregate_id = command.target_aggregate_id();
        let mut conflicts = 0u32;

        let committed = loop {
            let mut root = self.load::<A>(tenant_id, aggregate_id).await?;
            root.execute(&command)?;
            if !root.has_uncommitted_events() {
                return Ok(Vec::new());
            }

            match self
                .commit_with_metadata(tenant_id, &mut root, metadata.clone())
                .await
            {
                Ok(committed) => break committed,
                Err(err) if err.is_concurrency() && conflicts < self.config.max_conflict_retries => {
                    conflicts += 1;
                    debug!(attempt = conflicts, error = %err, "concurrency conflict, reloading");
                }
                Err(err) => return Err(err),
            }
        };

        self.publish_committed(committed).await
    }

    /// Publish stored events again, e.g. after a [`DispatchError::Publish`].
    ///
    /// Consumers de-duplicate on the event id, so re-driving already published events
    /// is safe.
    #[instrument(skip(self), fields(tenant_id = %tenant_id), err)]
    pub async fn republish(
        &self,
        tenant_id: &TenantId,
        aggregate_id: AggregateId,
        from_sequence: u64,
        to_sequence: Option<u64>,
    ) -> Result<Vec<PublishAck>, DispatchError> {
        let events = self
            .store
            .get_events_in_range(tenant_id, aggregate_id, from_sequence, to_sequence)
            .await?;

        let mut acks = Vec::with_capacity(events.len());
        for stored in &events {
            match self.publisher.publish_envelope(&stored.to_envelope()).await {
                Ok(ack) => acks.push(ack),
                Err(source) => {
                    return Err(DispatchError::Publish {
                        committed: events,
                        source,
                    });
                }
            }
        }

        info!(republished = acks.len(), "events republished");
        Ok(acks)
    }

    async fn publish_committed(
        &self,
        committed: Vec<StoredEvent>,
    ) -> Result<Vec<StoredEvent>, DispatchError> {
        for stored in &committed {
            if let Err(source) = self.publisher.publish_envelope(&stored.to_envelope()).await {
                warn!(
                    event_id = %stored.event_id,
                    sequence = stored.sequence_number,
                    error = %source,
                    "committed event not published"
                );
                return Err(DispatchError::Publish { committed, source });
            }
        }
        Ok(committed)
    }

    async fn resolve_unknown_append(
        &self,
        tenant_id: &TenantId,
        aggregate_id: AggregateId,
        expected: ExpectedVersion,
        event_ids: &[Uuid],
    ) -> Result<Vec<StoredEvent>, DispatchError> {
        let elapsed = self.config.append_timeout;
        let timed_out = || {
            DispatchError::Store(EventStoreError::Timeout {
                operation: "append_events",
                elapsed,
            })
        };

        let from = expected.as_u64() + 1;
        let to = expected.as_u64() + event_ids.len() as u64;
        let read = self
            .store
            .get_events_in_range(tenant_id, aggregate_id, from, Some(to));
        let landed = match tokio::time::timeout(self.config.append_timeout, read).await {
            Ok(result) => result?,
            Err(_) => {
                warn!(%aggregate_id, "append timed out and its outcome could not be read back");
                return Err(timed_out());
            }
        };

        let ids_match = landed.len() == event_ids.len()
            && landed.iter().zip(event_ids).all(|(s, id)| s.event_id == *id);
        if ids_match {
            info!(%aggregate_id, events = landed.len(), "append timed out but landed");
            return Ok(landed);
        }

        warn!(%aggregate_id, "append timed out and did not land");
        Err(timed_out())
    }

    /// Snapshot when this commit crossed a `snapshot_every` boundary. Failures are logged.
    async fn maybe_snapshot<A>(
        &self,
        tenant_id: &TenantId,
        root: &AggregateRoot<A>,
        previous_version: u64,
    ) where
        A: Aggregate,
    {
        let every = self.config.snapshot_every;
        if every == 0 || previous_version / every == root.version() / every {
            return;
        }

        let state = match root.create_snapshot() {
            Ok(Some(state)) => state,
            Ok(None) => return,
            Err(e) => {
                warn!(aggregate_id = %root.id(), error = %e, "snapshot not taken");
                return;
            }
        };

        let snapshot = Snapshot::from_state(tenant_id, root.id(), state);
        match self.store.save_snapshot(snapshot).await {
            Ok(()) => debug!(aggregate_id = %root.id(), version = root.version(), "snapshot saved"),
            Err(e) => warn!(aggregate_id = %root.id(), error = %e, "snapshot not saved"),
        }
    }
}

fn validate_snapshot_owner(
    tenant_id: &TenantId,
    aggregate_id: AggregateId,
    snapshot: &Snapshot,
) -> Result<(), DispatchError> {
    if &snapshot.tenant_id != tenant_id || snapshot.aggregate_id != aggregate_id {
        return Err(DispatchError::TenantIsolation(format!(
            "snapshot for tenant '{}', aggregate {} returned for tenant '{tenant_id}', aggregate {aggregate_id}",
            snapshot.tenant_id, snapshot.aggregate_id
        )));
    }
    Ok(())
}

fn validate_loaded_stream(
    tenant_id: &TenantId,
    aggregate_id: AggregateId,
    aggregate_type: &str,
    from_version: u64,
    stream: &[StoredEvent],
) -> Result<(), DispatchError> {
    // Enforce isolation and ordering even if a backend returns foreign or shuffled rows.
    let mut expected = from_version + 1;
    for (idx, e) in stream.iter().enumerate() {
        if &e.tenant_id != tenant_id {
            return Err(DispatchError::TenantIsolation(format!(
                "loaded stream contains wrong tenant_id at index {idx}"
            )));
        }
        if e.aggregate_id != aggregate_id {
            return Err(DispatchError::TenantIsolation(format!(
                "loaded stream contains wrong aggregate_id at index {idx}"
            )));
        }
        if e.aggregate_type != aggregate_type {
            return Err(DispatchError::CorruptStream(format!(
                "stream holds '{}' events, loaded as '{aggregate_type}'",
                e.aggregate_type
            )));
        }
        if e.sequence_number != expected {
            return Err(DispatchError::CorruptStream(format!(
                "expected sequence {expected}, found {}",
                e.sequence_number
            )));
        }
        expected += 1;
    }
    Ok(())
}
