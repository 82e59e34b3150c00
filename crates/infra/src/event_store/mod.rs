//! Append-only event store boundary.
//!
//! Defines the tenant-scoped storage contract for event streams and snapshots, with an
//! in-memory implementation for tests/dev and a Postgres implementation.

pub mod in_memory;
pub mod model;
pub mod postgres;
pub mod r#trait;

pub use in_memory::InMemoryEventStore;
pub use model::{Snapshot, StoredEvent, UncommittedEvent};
pub use postgres::PostgresEventStore;
pub use r#trait::{EventStore, EventStoreError};
