//! Runtime configuration loaded from environment variables.
//!
//! Every setting has a default; a malformed value is logged and the default kept, so a
//! typo in one variable never prevents startup.
//!
//! | Variable | Default |
//! |----------|---------|
//! | `KEYSTONE_PUBLISH_MAX_ATTEMPTS` | 3 |
//! | `KEYSTONE_PUBLISH_INITIAL_DELAY_MS` | 100 |
//! | `KEYSTONE_PUBLISH_BACKOFF_MULTIPLIER` | 2.0 |
//! | `KEYSTONE_PUBLISH_MAX_DELAY_MS` | 5000 |
//! | `KEYSTONE_PUBLISH_ACK_TIMEOUT_MS` | 5000 |
//! | `KEYSTONE_APPEND_TIMEOUT_MS` | 10000 |
//! | `KEYSTONE_MAX_CONFLICT_RETRIES` | 3 |
//! | `KEYSTONE_SNAPSHOT_EVERY` | 0 (disabled) |
//! | `DATABASE_URL` | unset |
//! | `NATS_URL` | `nats://localhost:4222` |
//! | `KEYSTONE_NATS_STREAM` | `KEYSTONE_EVENTS` |

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use keystone_events::in_memory_transport::DEFAULT_STREAM;

use crate::command_dispatcher::DispatcherConfig;
use crate::publisher::PublisherConfig;

/// JetStream connection settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NatsConfig {
    pub url: String,
    pub stream: String,
    /// Subjects captured by the stream. Publishes go to `"{tenant_id}.{subject}"`.
    pub subjects: Vec<String>,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    /// Window in which JetStream drops publishes that repeat a `Nats-Msg-Id`.
    pub duplicate_window: Duration,
}

impl Default for NatsConfig {
    fn default() -> Self {
        Self {
            url: "nats://localhost:4222".to_string(),
            stream: DEFAULT_STREAM.to_string(),
            subjects: vec!["*.>".to_string()],
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(10),
            duplicate_window: Duration::from_secs(120),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KeystoneConfig {
    /// Postgres connection string. `None` means the in-memory stores are used.
    pub database_url: Option<String>,
    pub publisher: PublisherConfig,
    pub dispatcher: DispatcherConfig,
    pub nats: NatsConfig,
}

impl KeystoneConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup. Missing keys keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        let retry = &mut config.publisher.retry;
        override_with(&lookup, "KEYSTONE_PUBLISH_MAX_ATTEMPTS", &mut retry.max_attempts);
        override_millis(&lookup, "KEYSTONE_PUBLISH_INITIAL_DELAY_MS", &mut retry.initial_delay);
        override_with(&lookup, "KEYSTONE_PUBLISH_BACKOFF_MULTIPLIER", &mut retry.multiplier);
        override_millis(&lookup, "KEYSTONE_PUBLISH_MAX_DELAY_MS", &mut retry.max_delay);
        override_millis(
            &lookup,
            "KEYSTONE_PUBLISH_ACK_TIMEOUT_MS",
            &mut config.publisher.ack_timeout,
        );

        let dispatcher = &mut config.dispatcher;
        override_millis(&lookup, "KEYSTONE_APPEND_TIMEOUT_MS", &mut dispatcher.append_timeout);
        override_with(
            &lookup,
            "KEYSTONE_MAX_CONFLICT_RETRIES",
            &mut dispatcher.max_conflict_retries,
        );
        override_with(&lookup, "KEYSTONE_SNAPSHOT_EVERY", &mut dispatcher.snapshot_every);

        config.database_url = lookup("DATABASE_URL").filter(|url| !url.trim().is_empty());
        if let Some(url) = lookup("NATS_URL").filter(|url| !url.trim().is_empty()) {
            config.nats.url = url;
        }
        if let Some(stream) = lookup("KEYSTONE_NATS_STREAM").filter(|s| !s.trim().is_empty()) {
            config.nats.stream = stream;
        }

        config
    }
}

fn override_with<F, T>(lookup: &F, key: &str, target: &mut T)
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    let Some(raw) = lookup(key) else {
        return;
    };
    match raw.trim().parse::<T>() {
        Ok(value) => *target = value,
        Err(_) => warn!(key, value = %raw, "ignoring malformed configuration value"),
    }
}

fn override_millis<F>(lookup: &F, key: &str, target: &mut Duration)
where
    F: Fn(&str) -> Option<String>,
{
    let mut millis = u64::try_from(target.as_millis()).unwrap_or(u64::MAX);
    override_with(lookup, key, &mut millis);
    *target = Duration::from_millis(millis);
}
