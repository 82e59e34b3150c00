//! Aggregate abstraction for event-sourced domain models.
//!
//! Two pieces work together:
//!
//! - [`Aggregate`] is implemented by the domain state. It decides (`handle`) and
//!   folds (`apply`) and never performs IO.
//! - [`AggregateRoot`] is the event-sourced container around that state. It owns the
//!   aggregate id, the version (highest applied sequence number) and the buffer of
//!   events that have been applied in memory but not yet persisted.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

use crate::id::AggregateId;

/// Optimistic concurrency expectation for an append.
///
/// `NoStream` and `Exact(0)` are equivalent: both expect an aggregate that has never
/// been written.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ExpectedVersion {
    /// The aggregate must not exist yet.
    NoStream,
    /// Require the aggregate to be at an exact version.
    Exact(u64),
}

impl ExpectedVersion {
    pub fn as_u64(self) -> u64 {
        match self {
            ExpectedVersion::NoStream => 0,
            ExpectedVersion::Exact(v) => v,
        }
    }

    pub fn matches(self, actual: u64) -> bool {
        self.as_u64() == actual
    }
}

impl From<u64> for ExpectedVersion {
    fn from(value: u64) -> Self {
        if value == 0 {
            ExpectedVersion::NoStream
        } else {
            ExpectedVersion::Exact(value)
        }
    }
}

impl From<Option<u64>> for ExpectedVersion {
    fn from(value: Option<u64>) -> Self {
        value.map(Self::from).unwrap_or(ExpectedVersion::NoStream)
    }
}

/// Snapshot failures. All of these are programmer or data errors and are never retried.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SnapshotError {
    #[error("snapshot type mismatch: aggregate is '{expected}', snapshot is '{found}'")]
    TypeMismatch { expected: String, found: String },

    #[error("snapshot state is incompatible with aggregate '{aggregate_type}': {reason}")]
    Incompatible {
        aggregate_type: String,
        reason: String,
    },

    #[error("cannot snapshot aggregate '{aggregate_type}' with {pending} uncommitted events")]
    PendingEvents {
        aggregate_type: String,
        pending: usize,
    },

    #[error("aggregate '{0}' does not support snapshots")]
    Unsupported(String),

    #[error("snapshot state could not be encoded: {0}")]
    Encode(String),
}

/// Serialized snapshot state as produced by [`AggregateRoot::create_snapshot`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotState {
    pub aggregate_type: String,
    /// Version of the aggregate the state was taken at.
    pub sequence_number: u64,
    pub state: JsonValue,
}

/// Aggregate execution semantics (pure, deterministic).
///
/// - **Decision logic**: `handle(&self, cmd)` validates business invariants and returns events.
/// - **State mutation**: `apply(&mut self, event)` folds an event into state.
///
/// Commands and events are enums; `handle` and `apply` are exhaustive `match`es over
/// them, so every command has a handler and every event a fold arm at compile time.
/// Aggregates must not perform IO or side effects.
pub trait Aggregate: Sized {
    type Command: Clone + core::fmt::Debug;
    type Event: Clone + core::fmt::Debug;
    type Error: core::fmt::Debug;
    /// Snapshot representation. Aggregates that never snapshot use `()`.
    type Snapshot: Serialize + DeserializeOwned;

    /// Stable aggregate type identifier (e.g. "licensing.license").
    fn aggregate_type() -> &'static str;

    /// Create an empty, not-yet-created instance for rehydration.
    fn empty(id: AggregateId) -> Self;

    /// Fold a single event into in-memory state. Performs no validation.
    fn apply(&mut self, event: &Self::Event);

    /// Decide which events to emit given the current state and a command.
    ///
    /// This must not mutate state. State evolution is done through `apply`.
    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error>;

    /// Capture state for a snapshot. `None` means this aggregate is not snapshotted.
    fn snapshot(&self) -> Option<Self::Snapshot> {
        None
    }

    /// Rebuild state from a snapshot taken by [`Aggregate::snapshot`].
    fn restore(id: AggregateId, snapshot: Self::Snapshot) -> Result<Self, SnapshotError> {
        let _ = (id, snapshot);
        Err(SnapshotError::Unsupported(Self::aggregate_type().to_string()))
    }
}

/// Event-sourced container for one aggregate instance.
///
/// Not meant to be shared: load it, mutate it within one command call, persist it.
/// Identity is the aggregate id alone; two roots with the same id compare equal
/// whatever their versions.
#[derive(Debug, Clone)]
pub struct AggregateRoot<A: Aggregate> {
    id: AggregateId,
    version: u64,
    state: A,
    uncommitted: Vec<A::Event>,
}

impl<A: Aggregate> AggregateRoot<A> {
    pub fn new(id: AggregateId) -> Self {
        Self {
            id,
            version: 0,
            state: A::empty(id),
            uncommitted: Vec::new(),
        }
    }

    pub fn id(&self) -> AggregateId {
        self.id
    }

    /// Highest applied sequence number, including uncommitted events.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Version as last confirmed by the store (before any uncommitted events).
    ///
    /// Saturates at 0 when history was rehydrated underneath pending events.
    pub fn committed_version(&self) -> u64 {
        self.version.saturating_sub(self.uncommitted.len() as u64)
    }

    /// Expectation to pass to the store when appending the uncommitted events.
    pub fn expected_version(&self) -> ExpectedVersion {
        ExpectedVersion::from(self.committed_version())
    }

    pub fn state(&self) -> &A {
        &self.state
    }

    pub fn into_state(self) -> A {
        self.state
    }

    /// Record a new event: buffer it, bump the version and fold it into state.
    pub fn apply(&mut self, event: A::Event) {
        self.version += 1;
        self.state.apply(&event);
        self.uncommitted.push(event);
    }

    /// Run a command through `handle` and apply every resulting event.
    ///
    /// Nothing is applied when `handle` rejects the command. Returns the events
    /// produced by this command.
    pub fn execute(&mut self, command: &A::Command) -> Result<&[A::Event], A::Error> {
        let events = self.state.handle(command)?;
        let start = self.uncommitted.len();
        for event in events {
            self.apply(event);
        }
        Ok(&self.uncommitted[start..])
    }

    /// Replay persisted history starting at `from_version`.
    ///
    /// Replayed events are not new facts and never enter the uncommitted buffer.
    /// When `from_version > 0` the state must already reflect that version
    /// (e.g. after [`AggregateRoot::restore_from_snapshot`]).
    pub fn rehydrate<I>(&mut self, events: I, from_version: u64)
    where
        I: IntoIterator<Item = A::Event>,
    {
        self.version = from_version;
        for event in events {
            self.state.apply(&event);
            self.version += 1;
        }
    }

    /// Return and clear the uncommitted events.
    ///
    /// Clearing is irreversible: call this only after the events are durably stored.
    pub fn take_uncommitted_events(&mut self) -> Vec<A::Event> {
        std::mem::take(&mut self.uncommitted)
    }

    /// Borrow the uncommitted events without clearing them.
    pub fn uncommitted_events(&self) -> &[A::Event] {
        &self.uncommitted
    }

    pub fn has_uncommitted_events(&self) -> bool {
        !self.uncommitted.is_empty()
    }

    /// Clear the uncommitted buffer after a successful append.
    pub fn mark_events_as_committed(&mut self) {
        self.uncommitted.clear();
    }

    /// Serialize the current state at `version()`.
    ///
    /// Returns `Ok(None)` for aggregates that do not snapshot.
    pub fn create_snapshot(&self) -> Result<Option<SnapshotState>, SnapshotError> {
        if !self.uncommitted.is_empty() {
            return Err(SnapshotError::PendingEvents {
                aggregate_type: A::aggregate_type().to_string(),
                pending: self.uncommitted.len(),
            });
        }
        let Some(snapshot) = self.state.snapshot() else {
            return Ok(None);
        };
        let state =
            serde_json::to_value(&snapshot).map_err(|e| SnapshotError::Encode(e.to_string()))?;
        Ok(Some(SnapshotState {
            aggregate_type: A::aggregate_type().to_string(),
            sequence_number: self.version,
            state,
        }))
    }

    /// Replace state with a snapshot and set the version to the snapshot's sequence number.
    pub fn restore_from_snapshot(&mut self, snapshot: SnapshotState) -> Result<(), SnapshotError> {
        if snapshot.aggregate_type != A::aggregate_type() {
            return Err(SnapshotError::TypeMismatch {
                expected: A::aggregate_type().to_string(),
                found: snapshot.aggregate_type,
            });
        }
        let typed: A::Snapshot =
            serde_json::from_value(snapshot.state).map_err(|e| SnapshotError::Incompatible {
                aggregate_type: A::aggregate_type().to_string(),
                reason: e.to_string(),
            })?;

        self.state = A::restore(self.id, typed)?;
        self.version = snapshot.sequence_number;
        self.uncommitted.clear();
        Ok(())
    }
}

impl<A: Aggregate> PartialEq for AggregateRoot<A> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl<A: Aggregate> Eq for AggregateRoot<A> {}
