//! NATS JetStream publish transport.

use std::time::Duration;

use async_nats::jetstream;
use async_trait::async_trait;
use bytes::Bytes;
use tracing::{debug, info};

use keystone_events::{Metadata, PublishAck, PublishTransport, TransportError};

use crate::config::NatsConfig;

/// JetStream-backed transport. Acks come from the stream that captured the subject.
#[derive(Clone)]
pub struct NatsTransport {
    client: async_nats::Client,
    jetstream: jetstream::Context,
    stream: String,
}

impl NatsTransport {
    /// Connect to NATS and make sure the configured stream exists.
    pub async fn connect(config: &NatsConfig) -> Result<Self, TransportError> {
        let client = async_nats::ConnectOptions::new()
            .connection_timeout(config.connect_timeout)
            .request_timeout(Some(config.request_timeout))
            .connect(&config.url)
            .await
            .map_err(|e| TransportError::Connect(format!("{}: {e}", config.url)))?;

        info!(url = %config.url, "connected to NATS");

        let jetstream = jetstream::new(client.clone());
        ensure_stream(&jetstream, config).await?;

        Ok(Self {
            client,
            jetstream,
            stream: config.stream.clone(),
        })
    }

    /// Wrap an existing connection. The stream must already exist.
    pub fn from_client(client: async_nats::Client, stream: impl Into<String>) -> Self {
        let jetstream = jetstream::new(client.clone());
        Self {
            client,
            jetstream,
            stream: stream.into(),
        }
    }

    pub fn stream(&self) -> &str {
        &self.stream
    }
}

#[async_trait]
impl PublishTransport for NatsTransport {
    fn is_connected(&self) -> bool {
        self.client.connection_state() == async_nats::connection::State::Connected
    }

    async fn publish(
        &self,
        subject: &str,
        payload: Bytes,
        headers: &Metadata,
    ) -> Result<PublishAck, TransportError> {
        let mut header_map = async_nats::HeaderMap::new();
        for (name, value) in headers {
            header_map.insert(name.as_str(), value.as_str());
        }

        let ack = self
            .jetstream
            .publish_with_headers(subject.to_string(), header_map, payload)
            .await
            .map_err(|e| TransportError::publish(subject, e.to_string()))?
            .await
            .map_err(|e| TransportError::publish(subject, format!("ack failed: {e}")))?;

        debug!(
            subject,
            stream = %ack.stream,
            sequence = ack.sequence,
            duplicate = ack.duplicate,
            "JetStream ack received"
        );

        Ok(PublishAck {
            stream: ack.stream,
            sequence: ack.sequence,
            duplicate: ack.duplicate,
            error: None,
        })
    }
}

async fn ensure_stream(js: &jetstream::Context, config: &NatsConfig) -> Result<(), TransportError> {
    let stream_config = jetstream::stream::Config {
        name: config.stream.clone(),
        subjects: config.subjects.clone(),
        storage: jetstream::stream::StorageType::File,
        retention: jetstream::stream::RetentionPolicy::Limits,
        duplicate_window: config.duplicate_window,
        max_age: Duration::ZERO,
        ..Default::default()
    };

    js.get_or_create_stream(stream_config)
        .await
        .map_err(|e| {
            TransportError::Connect(format!(
                "failed to create/get stream '{}': {e}",
                config.stream
            ))
        })?;

    info!(stream = %config.stream, subjects = ?config.subjects, "JetStream stream ready");
    Ok(())
}
