//! Publish transport abstraction (broker boundary).
//!
//! A transport delivers already-encoded bytes to a subject and returns the broker's
//! acknowledgment. Retry, timeouts and ack verification live in the publisher; the
//! transport reports exactly what happened on a single attempt.
//!
//! Delivery is **at-least-once**: a publish retried after a lost ack may be stored
//! twice unless the broker de-duplicates on the `Nats-Msg-Id` header. Consumers must
//! be idempotent.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::Metadata;

/// Header used by JetStream (and the in-memory transport) to de-duplicate publishes.
pub const MSG_ID_HEADER: &str = "Nats-Msg-Id";

/// Broker acknowledgment for a single publish.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishAck {
    /// Stream that stored the message.
    pub stream: String,
    /// Stream sequence assigned by the broker. Stored messages start at 1.
    pub sequence: u64,
    /// The broker recognized the message id and did not store it again.
    #[serde(default)]
    pub duplicate: bool,
    /// Broker-reported error, if any.
    #[serde(default)]
    pub error: Option<String>,
}

impl PublishAck {
    pub fn stored(stream: impl Into<String>, sequence: u64) -> Self {
        Self {
            stream: stream.into(),
            sequence,
            duplicate: false,
            error: None,
        }
    }

    pub fn rejected(stream: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            stream: stream.into(),
            sequence: 0,
            duplicate: false,
            error: Some(error.into()),
        }
    }

    /// Why this ack does not confirm storage, or `None` if it does.
    ///
    /// An ack confirms storage only when it carries no error and a positive sequence.
    pub fn failure_reason(&self) -> Option<String> {
        if let Some(err) = &self.error {
            return Some(format!("broker rejected publish: {err}"));
        }
        if self.sequence == 0 {
            return Some(format!(
                "ack from stream '{}' carried sequence 0",
                self.stream
            ));
        }
        None
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("transport is not connected")]
    NotConnected,

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("publish to '{subject}' failed: {reason}")]
    Publish { subject: String, reason: String },
}

impl TransportError {
    pub fn publish(subject: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Publish {
            subject: subject.into(),
            reason: reason.into(),
        }
    }
}

/// Broker connection used by the event publisher.
///
/// Implementations are long-lived and shared (`Arc`) across publishers.
#[async_trait]
pub trait PublishTransport: Send + Sync {
    /// Cheap, non-blocking connectivity check used for fail-fast preflight.
    fn is_connected(&self) -> bool;

    /// Publish one message and wait for the broker acknowledgment.
    async fn publish(
        &self,
        subject: &str,
        payload: Bytes,
        headers: &Metadata,
    ) -> Result<PublishAck, TransportError>;
}

#[async_trait]
impl<T> PublishTransport for Arc<T>
where
    T: PublishTransport + ?Sized,
{
    fn is_connected(&self) -> bool {
        (**self).is_connected()
    }

    async fn publish(
        &self,
        subject: &str,
        payload: Bytes,
        headers: &Metadata,
    ) -> Result<PublishAck, TransportError> {
        (**self).publish(subject, payload, headers).await
    }
}
