use serde_json::Value as JsonValue;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use keystone_core::TenantId;
use keystone_events::{EventEnvelope, EventHandler, PublishedMessage, Subscription, TenantScoped};

use crate::idempotency::{IdempotencyError, IdempotencyStore, handle_idempotently};
use crate::retry::{AttemptOutcome, RetryError, RetryPolicy};

/// Per-worker counters, returned when the worker stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub processed: u64,
    pub duplicates: u64,
    pub foreign_tenant: u64,
    /// Messages given up on: undecodable, or still failing after all retries.
    pub failed: u64,
}

/// A message the worker gave up on, with the reason.
#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub worker: &'static str,
    pub message: PublishedMessage,
    pub attempts: u32,
    pub reason: String,
}

/// Worker tuning.
#[derive(Debug, Clone, Default)]
pub struct WorkerOptions {
    /// Ignore messages for every other tenant.
    pub tenant_id: Option<TenantId>,
    /// Attempts for handler and store failures before the message is dead-lettered.
    pub retry: RetryPolicy,
    /// Receives messages that could not be processed. Without it they are only logged.
    pub dead_letters: Option<mpsc::UnboundedSender<DeadLetter>>,
}

/// Handle to control and join a background worker.
#[derive(Debug)]
pub struct WorkerHandle {
    shutdown: oneshot::Sender<()>,
    join: JoinHandle<WorkerStats>,
}

impl WorkerHandle {
    /// Request graceful shutdown and wait for the worker to stop.
    ///
    /// The message in flight finishes, retries included. Messages still queued in the
    /// subscription are not processed.
    pub async fn shutdown(self) -> WorkerStats {
        let _ = self.shutdown.send(());
        wait(self.join).await
    }

    /// Wait for the worker to stop on its own, i.e. once its subscription closes.
    pub async fn join(self) -> WorkerStats {
        let WorkerHandle { shutdown, join } = self;
        let stats = wait(join).await;
        drop(shutdown);
        stats
    }
}

async fn wait(join: JoinHandle<WorkerStats>) -> WorkerStats {
    join.await.unwrap_or_else(|e| {
        warn!(error = %e, "consumer worker task did not finish cleanly");
        WorkerStats::default()
    })
}

/// Consumer loop over a transport subscription.
///
/// - decodes each message as an `EventEnvelope<JsonValue>`
/// - runs the handler through the idempotency store, keyed by the handler's `processor_id`
/// - retries handler and store failures per [`WorkerOptions::retry`], then dead-letters
/// - optionally ignores messages for other tenants
/// - supports graceful shutdown
#[derive(Debug)]
pub struct ConsumerWorker;

impl ConsumerWorker {
    /// Spawn a tokio task that processes messages from `subscription` with default options.
    pub fn spawn<S, H>(
        name: &'static str,
        subscription: Subscription<PublishedMessage>,
        tenant_id: Option<TenantId>,
        store: S,
        handler: H,
    ) -> WorkerHandle
    where
        S: IdempotencyStore + 'static,
        H: EventHandler + 'static,
    {
        Self::spawn_with(
            name,
            subscription,
            store,
            handler,
            WorkerOptions {
                tenant_id,
                ..WorkerOptions::default()
            },
        )
    }

    pub fn spawn_with<S, H>(
        name: &'static str,
        subscription: Subscription<PublishedMessage>,
        store: S,
        handler: H,
        options: WorkerOptions,
    ) -> WorkerHandle
    where
        S: IdempotencyStore + 'static,
        H: EventHandler + 'static,
    {
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let join = tokio::spawn(worker_loop(
            name,
            subscription,
            shutdown_rx,
            options,
            store,
            handler,
        ));

        WorkerHandle {
            shutdown: shutdown_tx,
            join,
        }
    }
}

async fn worker_loop<S, H>(
    name: &'static str,
    mut subscription: Subscription<PublishedMessage>,
    mut shutdown_rx: oneshot::Receiver<()>,
    options: WorkerOptions,
    store: S,
    handler: H,
) -> WorkerStats
where
    S: IdempotencyStore,
    H: EventHandler,
{
    let mut stats = WorkerStats::default();
    info!(worker = name, processor_id = handler.processor_id(), "consumer worker started");

    loop {
        let message = tokio::select! {
            biased;
            _ = &mut shutdown_rx => break,
            message = subscription.recv() => match message {
                Some(message) => message,
                None => break,
            },
        };

        if let Some(tenant) = &options.tenant_id {
            if !message.belongs_to(tenant) {
                stats.foreign_tenant += 1;
                continue;
            }
        }

        let envelope: EventEnvelope<JsonValue> = match message.decode() {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(worker = name, subject = %message.subject, error = %e, "undecodable message");
                stats.failed += 1;
                dead_letter(&options, name, message, 1, format!("undecodable payload: {e}"));
                continue;
            }
        };

        if let Some(tenant) = &options.tenant_id {
            if envelope.tenant_id() != tenant {
                warn!(worker = name, subject = %message.subject, "envelope tenant does not match subject");
                stats.foreign_tenant += 1;
                continue;
            }
        }

        let outcome = options
            .retry
            .run(|attempt| {
                let (envelope, store, handler) = (&envelope, &store, &handler);
                async move {
                    match handle_idempotently(envelope, store, handler).await {
                        Ok(_) => AttemptOutcome::Success(()),
                        Err(e) if e.is_retryable() => {
                            debug!(worker = name, event_id = %envelope.event_id(), attempt, error = %e, "handler attempt failed");
                            AttemptOutcome::Transient(e)
                        }
                        Err(e) => AttemptOutcome::Permanent(e),
                    }
                }
            })
            .await;

        match outcome {
            Ok(()) => stats.processed += 1,
            Err(RetryError::Permanent { error, .. }) if error.is_already_processed() => {
                debug!(worker = name, event_id = %envelope.event_id(), "duplicate delivery skipped");
                stats.duplicates += 1;
            }
            Err(e) => {
                let attempts = e.attempts();
                let error: IdempotencyError = e.into_error();
                warn!(worker = name, event_id = %envelope.event_id(), attempts, error = %error, "consumer gave up on event");
                stats.failed += 1;
                dead_letter(&options, name, message, attempts, error.to_string());
            }
        }
    }

    info!(
        worker = name,
        processed = stats.processed,
        duplicates = stats.duplicates,
        failed = stats.failed,
        "consumer worker stopped"
    );
    stats
}

fn dead_letter(
    options: &WorkerOptions,
    worker: &'static str,
    message: PublishedMessage,
    attempts: u32,
    reason: String,
) {
    let Some(sink) = &options.dead_letters else {
        return;
    };
    let letter = DeadLetter {
        worker,
        message,
        attempts,
        reason,
    };
    if sink.send(letter).is_err() {
        warn!(worker, "dead-letter receiver dropped");
    }
}
