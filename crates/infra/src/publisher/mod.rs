//! Reliable event publication.
//!
//! `EventPublisher` wraps a [`PublishTransport`] with:
//!
//! - tenant-prefixed subjects (`"{tenant_id}.{subject}"`)
//! - a fail-fast connectivity preflight
//! - a per-attempt ack timeout
//! - ack verification (an ack with an error, or sequence 0, is a failure)
//! - retry with exponential backoff via [`RetryPolicy`]
//!
//! Encoding failures are permanent and never retried.

#[cfg(feature = "nats")]
pub mod nats;

use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, instrument, warn};

use keystone_core::TenantId;
use keystone_events::transport::MSG_ID_HEADER;
use keystone_events::{EventEnvelope, Metadata, PublishAck, PublishTransport};

use crate::retry::{AttemptOutcome, RetryPolicy};

#[cfg(feature = "nats")]
pub use nats::NatsTransport;

pub const EVENT_ID_HEADER: &str = "Keystone-Event-Id";
pub const AGGREGATE_ID_HEADER: &str = "Keystone-Aggregate-Id";
pub const AGGREGATE_TYPE_HEADER: &str = "Keystone-Aggregate-Type";
pub const SEQUENCE_HEADER: &str = "Keystone-Sequence";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PublishError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("failed to serialize event for '{subject}': {reason}")]
    Serialization { subject: String, reason: String },

    #[error("publish transport unavailable: {0}")]
    Unavailable(String),

    #[error("publish to '{subject}' failed after {attempts} attempts: {reason}")]
    Failed {
        subject: String,
        attempts: u32,
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublisherConfig {
    pub retry: RetryPolicy,
    /// Bound on a single publish attempt, including the broker ack.
    pub ack_timeout: Duration,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            ack_timeout: Duration::from_secs(5),
        }
    }
}

/// Publishes events to a transport with retry and ack verification.
///
/// The transport is long-lived and may be shared (`Arc<T>` is a transport too).
#[derive(Debug, Clone)]
pub struct EventPublisher<T> {
    transport: T,
    config: PublisherConfig,
}

impl<T> EventPublisher<T>
where
    T: PublishTransport,
{
    pub fn new(transport: T, config: PublisherConfig) -> Self {
        Self { transport, config }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn config(&self) -> &PublisherConfig {
        &self.config
    }

    /// Publish `event` as JSON under `"{tenant_id}.{subject}"`.
    ///
    /// `metadata` entries are sent as transport headers.
    #[instrument(skip(self, event, metadata), fields(tenant_id = %tenant_id), err)]
    pub async fn publish<E>(
        &self,
        subject: &str,
        tenant_id: &TenantId,
        event: &E,
        metadata: Option<&Metadata>,
    ) -> Result<PublishAck, PublishError>
    where
        E: Serialize + ?Sized,
    {
        validate_subject(subject)?;
        let full_subject = tenant_subject(tenant_id, subject);

        let payload = serde_json::to_vec(event).map_err(|e| PublishError::Serialization {
            subject: full_subject.clone(),
            reason: e.to_string(),
        })?;
        let headers = metadata.cloned().unwrap_or_default();

        self.send(&full_subject, Bytes::from(payload), &headers).await
    }

    /// Publish a committed event envelope under `"{tenant_id}.{event_type}"`.
    ///
    /// The payload is the whole envelope. Headers carry the event metadata plus the
    /// event id (also as `Nats-Msg-Id`, so the broker de-duplicates retried
    /// publishes), the aggregate id/type and the stream sequence.
    #[instrument(
        skip(self, envelope),
        fields(
            tenant_id = %envelope.tenant_id(),
            event_id = %envelope.event_id(),
            event_type = envelope.event_type()
        ),
        err
    )]
    pub async fn publish_envelope<E>(
        &self,
        envelope: &EventEnvelope<E>,
    ) -> Result<PublishAck, PublishError>
    where
        E: Serialize,
    {
        validate_subject(envelope.event_type())?;
        let full_subject = tenant_subject(envelope.tenant_id(), envelope.event_type());

        let payload = serde_json::to_vec(envelope).map_err(|e| PublishError::Serialization {
            subject: full_subject.clone(),
            reason: e.to_string(),
        })?;
        let headers = envelope_headers(envelope);

        self.send(&full_subject, Bytes::from(payload), &headers).await
    }

    /// Publish envelopes in order, stopping at the first failure.
    pub async fn publish_envelopes<'a, E, I>(
        &self,
        envelopes: I,
    ) -> Result<Vec<PublishAck>, PublishError>
    where
        E: Serialize + 'a,
        I: IntoIterator<Item = &'a EventEnvelope<E>>,
    {
        let mut acks = Vec::new();
        for envelope in envelopes {
            acks.push(self.publish_envelope(envelope).await?);
        }
        Ok(acks)
    }

    async fn send(
        &self,
        subject: &str,
        payload: Bytes,
        headers: &Metadata,
    ) -> Result<PublishAck, PublishError> {
        if !self.transport.is_connected() {
            warn!(subject, "publish transport not connected; failing fast");
            return Err(PublishError::Unavailable(format!(
                "transport not connected, cannot publish to '{subject}'"
            )));
        }

        let transport = &self.transport;
        let ack_timeout = self.config.ack_timeout;
        let outcome = self
            .config
            .retry
            .run(move |attempt| {
                let payload = payload.clone();
                async move {
                    let sent =
                        tokio::time::timeout(ack_timeout, transport.publish(subject, payload, headers))
                            .await;
                    match sent {
                        Err(_) => AttemptOutcome::Transient(format!(
                            "no ack within {ack_timeout:?} (attempt {attempt})"
                        )),
                        Ok(Err(e)) => AttemptOutcome::Transient(e.to_string()),
                        Ok(Ok(ack)) => match ack.failure_reason() {
                            Some(reason) => AttemptOutcome::Transient(reason),
                            None => AttemptOutcome::Success(ack),
                        },
                    }
                }
            })
            .await;

        match outcome {
            Ok(ack) => {
                debug!(
                    subject,
                    stream = %ack.stream,
                    sequence = ack.sequence,
                    duplicate = ack.duplicate,
                    "event published"
                );
                Ok(ack)
            }
            Err(err) => {
                let attempts = err.attempts();
                let reason = err.into_error();
                warn!(subject, attempts, %reason, "event publication failed");
                Err(PublishError::Failed {
                    subject: subject.to_string(),
                    attempts,
                    reason,
                })
            }
        }
    }
}

fn tenant_subject(tenant_id: &TenantId, subject: &str) -> String {
    format!("{tenant_id}.{subject}")
}

/// A subject is one or more non-empty dot-separated tokens without whitespace or
/// wildcards.
fn validate_subject(subject: &str) -> Result<(), PublishError> {
    if subject.trim().is_empty() {
        return Err(PublishError::InvalidArgument(
            "subject must not be blank".to_string(),
        ));
    }
    if subject.split('.').any(str::is_empty) {
        return Err(PublishError::InvalidArgument(format!(
            "subject '{subject}' contains an empty token"
        )));
    }
    if let Some(c) = subject
        .chars()
        .find(|c| c.is_whitespace() || matches!(c, '*' | '>'))
    {
        return Err(PublishError::InvalidArgument(format!(
            "subject '{subject}' contains reserved character {c:?}"
        )));
    }
    Ok(())
}

fn envelope_headers<E>(envelope: &EventEnvelope<E>) -> Metadata {
    let mut headers = envelope.metadata().clone();
    let event_id = envelope.event_id().to_string();
    headers.insert(MSG_ID_HEADER.to_string(), event_id.clone());
    headers.insert(EVENT_ID_HEADER.to_string(), event_id);
    headers.insert(
        AGGREGATE_ID_HEADER.to_string(),
        envelope.aggregate_id().to_string(),
    );
    headers.insert(
        AGGREGATE_TYPE_HEADER.to_string(),
        envelope.aggregate_type().to_string(),
    );
    headers.insert(
        SEQUENCE_HEADER.to_string(),
        envelope.sequence_number().to_string(),
    );
    headers
}
