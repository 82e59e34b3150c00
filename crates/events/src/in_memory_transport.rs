//! In-memory publish transport for tests/dev.
//!
//! Behaves like a single JetStream stream: every stored message gets the next stream
//! sequence (starting at 1), publishes carrying an already-seen `Nats-Msg-Id` are
//! acknowledged as duplicates without being stored again (within a window of the most
//! recent message ids, see [`DEFAULT_DUPLICATE_WINDOW`]), and subscribers receive
//! stored messages in order. Faults can be injected to exercise the publisher's
//! retry and ack-verification paths.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;

use keystone_core::TenantId;

use crate::Metadata;
use crate::subscription::Subscription;
use crate::transport::{MSG_ID_HEADER, PublishAck, PublishTransport, TransportError};

/// Default stream name reported in acks.
pub const DEFAULT_STREAM: &str = "KEYSTONE_EVENTS";

/// Number of recent message ids remembered for de-duplication.
pub const DEFAULT_DUPLICATE_WINDOW: usize = 10_000;

/// Fault returned by the next publish attempt instead of storing the message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectedFault {
    /// The publish call returns a transport error.
    Error,
    /// The broker acks with an error field set.
    AckError,
    /// The broker acks with sequence 0.
    ZeroSequence,
    /// The publish never completes.
    Hang,
}

/// A message stored by the in-memory transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub subject: String,
    pub payload: Bytes,
    pub headers: Metadata,
    pub stream: String,
    pub sequence: u64,
}

impl PublishedMessage {
    /// Leading subject token (the tenant id for subjects built by the publisher).
    pub fn tenant(&self) -> &str {
        self.subject.split('.').next().unwrap_or_default()
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.payload)
    }
}

#[derive(Debug)]
struct Subscriber {
    subject_prefix: Option<String>,
    tx: mpsc::UnboundedSender<PublishedMessage>,
}

impl Subscriber {
    fn wants(&self, subject: &str) -> bool {
        self.subject_prefix
            .as_deref()
            .is_none_or(|prefix| subject.starts_with(prefix))
    }
}

#[derive(Debug, Default)]
struct State {
    last_sequence: u64,
    msg_ids: HashMap<String, u64>,
    msg_id_order: VecDeque<String>,
    faults: VecDeque<InjectedFault>,
    published: Vec<PublishedMessage>,
    subscribers: Vec<Subscriber>,
}

/// In-memory pub/sub transport.
///
/// - No IO
/// - Fan-out to every live subscriber whose filter matches
/// - At-least-once acceptable (subscribers must be idempotent)
#[derive(Debug)]
pub struct InMemoryTransport {
    stream: String,
    duplicate_window: usize,
    connected: AtomicBool,
    attempts: AtomicU64,
    state: Mutex<State>,
}

impl InMemoryTransport {
    pub fn new() -> Self {
        Self::with_stream(DEFAULT_STREAM)
    }

    pub fn with_stream(stream: impl Into<String>) -> Self {
        Self {
            stream: stream.into(),
            duplicate_window: DEFAULT_DUPLICATE_WINDOW,
            connected: AtomicBool::new(true),
            attempts: AtomicU64::new(0),
            state: Mutex::new(State::default()),
        }
    }

    /// Remember at most `window` message ids; older ids are accepted as new messages.
    pub fn with_duplicate_window(mut self, window: usize) -> Self {
        self.duplicate_window = window.max(1);
        self
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Make the next `times` publish attempts fail with `fault`.
    pub fn inject(&self, fault: InjectedFault, times: usize) {
        if let Ok(mut state) = self.state.lock() {
            state.faults.extend(std::iter::repeat_n(fault, times));
        }
    }

    /// Make the next `times` publish attempts fail with a transport error.
    pub fn fail_next(&self, times: usize) {
        self.inject(InjectedFault::Error, times);
    }

    /// Number of `publish` calls received, including failed attempts.
    pub fn publish_attempts(&self) -> u64 {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Messages stored so far, in stream order.
    pub fn published(&self) -> Vec<PublishedMessage> {
        self.state
            .lock()
            .map(|state| state.published.clone())
            .unwrap_or_default()
    }

    /// Subscribe to every message stored from now on.
    pub fn subscribe(&self) -> Subscription<PublishedMessage> {
        self.add_subscriber(None)
    }

    /// Subscribe to messages whose subject belongs to `tenant_id`.
    pub fn subscribe_tenant(&self, tenant_id: &TenantId) -> Subscription<PublishedMessage> {
        self.add_subscriber(Some(format!("{tenant_id}.")))
    }

    fn add_subscriber(&self, subject_prefix: Option<String>) -> Subscription<PublishedMessage> {
        let (tx, rx) = mpsc::unbounded_channel();

        // A poisoned lock still yields a subscription; it just never receives.
        if let Ok(mut state) = self.state.lock() {
            state.subscribers.push(Subscriber { subject_prefix, tx });
        }

        Subscription::new(rx)
    }

    fn lock(&self, subject: &str) -> Result<MutexGuard<'_, State>, TransportError> {
        self.state
            .lock()
            .map_err(|_| TransportError::publish(subject, "transport state lock poisoned"))
    }
}

impl Default for InMemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PublishTransport for InMemoryTransport {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn publish(
        &self,
        subject: &str,
        payload: Bytes,
        headers: &Metadata,
    ) -> Result<PublishAck, TransportError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }

        let fault = {
            let mut state = self.lock(subject)?;
            state.faults.pop_front()
        };
        match fault {
            Some(InjectedFault::Hang) => {
                return std::future::pending::<Result<PublishAck, TransportError>>().await;
            }
            Some(InjectedFault::Error) => {
                return Err(TransportError::publish(subject, "injected transport failure"));
            }
            Some(InjectedFault::AckError) => {
                return Ok(PublishAck::rejected(&self.stream, "injected broker error"));
            }
            Some(InjectedFault::ZeroSequence) => {
                return Ok(PublishAck::stored(&self.stream, 0));
            }
            None => {}
        }

        let mut state = self.lock(subject)?;
        let msg_id = headers.get(MSG_ID_HEADER);
        if let Some(&sequence) = msg_id.and_then(|id| state.msg_ids.get(id)) {
            tracing::debug!(subject, sequence, "duplicate message id, not stored again");
            return Ok(PublishAck {
                stream: self.stream.clone(),
                sequence,
                duplicate: true,
                error: None,
            });
        }

        state.last_sequence += 1;
        let sequence = state.last_sequence;
        if let Some(id) = msg_id {
            state.msg_ids.insert(id.clone(), sequence);
            state.msg_id_order.push_back(id.clone());
            while state.msg_id_order.len() > self.duplicate_window {
                if let Some(evicted) = state.msg_id_order.pop_front() {
                    state.msg_ids.remove(&evicted);
                }
            }
        }

        let message = PublishedMessage {
            subject: subject.to_string(),
            payload,
            headers: headers.clone(),
            stream: self.stream.clone(),
            sequence,
        };

        // Drop any dead subscribers while publishing.
        state
            .subscribers
            .retain(|sub| !sub.wants(subject) || sub.tx.send(message.clone()).is_ok());
        state.published.push(message);

        tracing::debug!(subject, sequence, "message stored");
        Ok(PublishAck::stored(self.stream.clone(), sequence))
    }
}
