//! Infrastructure layer: event store, publisher, idempotent consumers, config.

pub mod command_dispatcher;
pub mod config;
pub mod event_store;
pub mod idempotency;
pub mod publisher;
pub mod retry;
pub mod schema;
pub mod workers;

#[cfg(test)]
mod integration_tests;
