//! `keystone-core`: event-sourcing building blocks.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns):
//! identifiers, the domain error model, and the aggregate abstraction.

pub mod aggregate;
pub mod error;
pub mod id;

pub use aggregate::{Aggregate, AggregateRoot, ExpectedVersion, SnapshotError, SnapshotState};
pub use error::{DomainError, DomainResult};
pub use id::{AggregateId, TenantId};
