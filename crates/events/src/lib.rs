//! Event-side contracts shared by the store, the publisher and consumers.
//!
//! - [`Event`] / [`Command`]: the traits domain enums implement
//! - [`EventEnvelope`]: the published / consumed shape of a committed event
//! - [`PublishTransport`]: the broker boundary, with an in-memory implementation
//! - [`EventHandler`]: the consumer boundary

pub mod command;
pub mod envelope;
pub mod event;
pub mod handler;
pub mod in_memory_transport;
pub mod subscription;
pub mod tenant;
pub mod transport;

pub use command::Command;
pub use envelope::{EventEnvelope, Metadata};
pub use event::Event;
pub use handler::EventHandler;
pub use in_memory_transport::{InMemoryTransport, PublishedMessage};
pub use subscription::Subscription;
pub use tenant::TenantScoped;
pub use transport::{PublishAck, PublishTransport, TransportError};
