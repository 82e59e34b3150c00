//! Integration tests for the full event-sourced pipeline.
//!
//! Command → EventStore → Publisher → Consumer, using the licensing domain.
//!
//! Verifies:
//! - Stream versions and optimistic concurrency (including concurrent appends)
//! - Tenant isolation
//! - Snapshot + tail replay equals full replay
//! - Idempotent consumption and publish retry counts
//! - Resolution of appends whose outcome is unknown after a timeout

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use uuid::Uuid;

use keystone_core::{AggregateId, AggregateRoot, ExpectedVersion, TenantId};
use keystone_events::{EventEnvelope, InMemoryTransport, Metadata, TenantScoped};
use keystone_licensing::{
    ChangeSeats, IssueLicense, License, LicenseCommand, LicenseEvent, RenewLicense,
};
use keystone_observability::ObservabilityConfig;

use crate::command_dispatcher::{CommandDispatcher, DispatchError, DispatcherConfig};
use crate::event_store::{
    EventStore, EventStoreError, InMemoryEventStore, Snapshot, StoredEvent, UncommittedEvent,
};
use crate::idempotency::{InMemoryIdempotencyStore, process_event_idempotently};
use crate::publisher::{EventPublisher, PublishError, PublisherConfig};
use crate::retry::RetryPolicy;

const LICENSE: &str = "licensing.license";

fn tenant(raw: &str) -> TenantId {
    TenantId::new(raw).unwrap()
}

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()
}

fn issue(id: AggregateId) -> LicenseCommand {
    LicenseCommand::Issue(IssueLicense {
        license_id: id,
        product: "keystone".to_string(),
        holder: "acme".to_string(),
        seats: 1,
        expires_at: t0() + ChronoDuration::days(365),
        occurred_at: t0(),
    })
}

fn seats(id: AggregateId, seats: u32) -> LicenseCommand {
    LicenseCommand::ChangeSeats(ChangeSeats {
        license_id: id,
        seats,
        occurred_at: t0(),
    })
}

fn renew(id: AggregateId, days: i64) -> LicenseCommand {
    LicenseCommand::Renew(RenewLicense {
        license_id: id,
        expires_at: t0() + ChronoDuration::days(days),
        occurred_at: t0(),
    })
}

/// Execute `command` on `root` and turn the new events into an appendable batch.
fn decide(
    tenant_id: &TenantId,
    root: &mut AggregateRoot<License>,
    command: &LicenseCommand,
) -> Vec<UncommittedEvent> {
    root.execute(command).unwrap();
    root.take_uncommitted_events()
        .iter()
        .map(|event| {
            UncommittedEvent::from_typed(
                tenant_id,
                root.id(),
                LICENSE,
                Uuid::now_v7(),
                event,
                Metadata::new(),
            )
            .unwrap()
        })
        .collect()
}

fn decode_all(stored: &[StoredEvent]) -> Vec<LicenseEvent> {
    stored.iter().map(|s| s.decode().unwrap()).collect()
}

/// Text logs for test runs; `RUST_LOG` overrides the filter.
fn init_logging() {
    keystone_observability::init_with(
        &ObservabilityConfig::pretty().with_default_filter("keystone_infra=debug"),
    );
}

fn publisher(transport: Arc<InMemoryTransport>, retry: RetryPolicy) -> EventPublisher<Arc<InMemoryTransport>> {
    init_logging();
    EventPublisher::new(
        transport,
        PublisherConfig {
            retry,
            ack_timeout: Duration::from_millis(100),
        },
    )
}

#[tokio::test]
async fn stream_version_scenario_for_tenant_t1() {
    let store = InMemoryEventStore::new();
    let t1 = tenant("t1");
    let x = AggregateId::new();
    let mut root = AggregateRoot::<License>::new(x);

    let first = decide(&t1, &mut root, &issue(x));
    store
        .append_events(&t1, x, first, ExpectedVersion::NoStream)
        .await
        .unwrap();
    assert_eq!(store.get_current_version(&t1, x).await.unwrap(), Some(1));

    let second = decide(&t1, &mut root, &renew(x, 730));
    let committed = store
        .append_events(&t1, x, second.clone(), ExpectedVersion::Exact(1))
        .await
        .unwrap();
    assert_eq!(committed[0].sequence_number, 2);
    assert_eq!(store.get_current_version(&t1, x).await.unwrap(), Some(2));

    let retry = second
        .into_iter()
        .map(|mut e| {
            e.event_id = Uuid::now_v7();
            e
        })
        .collect();
    let err = store
        .append_events(&t1, x, retry, ExpectedVersion::Exact(1))
        .await
        .unwrap_err();
    match err {
        EventStoreError::Concurrency {
            tenant_id,
            aggregate_id,
            expected,
            actual,
        } => {
            assert_eq!(tenant_id, t1);
            assert_eq!(aggregate_id, x);
            assert_eq!(expected, 1);
            assert_eq!(actual, 2);
        }
        other => panic!("expected concurrency conflict, got {other:?}"),
    }
    assert_eq!(store.get_current_version(&t1, x).await.unwrap(), Some(2));
}

#[tokio::test]
async fn concurrent_appends_at_same_version_have_exactly_one_winner() {
    let store = Arc::new(InMemoryEventStore::new());
    let t1 = tenant("t1");
    let x = AggregateId::new();
    let mut root = AggregateRoot::<License>::new(x);
    let first = decide(&t1, &mut root, &issue(x));
    store
        .append_events(&t1, x, first, ExpectedVersion::NoStream)
        .await
        .unwrap();
    let history = decode_all(&store.get_events(&t1, x, 1).await.unwrap());
    let attempts = (2..10u32).map(|n| {
        let store = store.clone();
        let t1 = t1.clone();
        let mut replica = AggregateRoot::<License>::new(x);
        replica.rehydrate(history.clone(), 0);
        let batch = decide(&t1, &mut replica, &seats(x, n));
        tokio::spawn(async move {
            store
                .append_events(&t1, x, batch, ExpectedVersion::Exact(1))
                .await
        })
    });

    let results = futures::future::join_all(attempts).await;
    let mut winners = 0;
    let mut conflicts = 0;
    for result in results {
        match result.unwrap() {
            Ok(committed) => {
                assert_eq!(committed[0].sequence_number, 2);
                winners += 1;
            }
            Err(e) if e.is_concurrency() => conflicts += 1,
            Err(e) => panic!("unexpected error {e}"),
        }
    }

    assert_eq!(winners, 1);
    assert_eq!(conflicts, 7);
    assert_eq!(store.get_current_version(&t1, x).await.unwrap(), Some(2));
}

#[tokio::test]
async fn same_aggregate_id_is_isolated_per_tenant() {
    let store = InMemoryEventStore::new();
    let (t1, t2) = (tenant("t1"), tenant("t2"));
    let x = AggregateId::new();

    let mut root = AggregateRoot::<License>::new(x);
    let batch = decide(&t1, &mut root, &issue(x));
    store
        .append_events(&t1, x, batch, ExpectedVersion::NoStream)
        .await
        .unwrap();

    assert!(store.get_events(&t2, x, 1).await.unwrap().is_empty());
    assert_eq!(store.get_current_version(&t2, x).await.unwrap(), None);

    let mut other = AggregateRoot::<License>::new(x);
    let batch = decide(&t2, &mut other, &issue(x));
    let committed = store
        .append_events(&t2, x, batch, ExpectedVersion::NoStream)
        .await
        .unwrap();
    assert_eq!(committed[0].sequence_number, 1);

    for stored in store.get_events(&t1, x, 1).await.unwrap() {
        assert_eq!(stored.tenant_id, t1);
    }
}

#[tokio::test]
async fn snapshot_plus_range_equals_full_replay() {
    let store = InMemoryEventStore::new();
    let t1 = tenant("t1");
    let x = AggregateId::new();
    let mut live = AggregateRoot::<License>::new(x);

    let mut commands = vec![issue(x)];
    commands.extend((2..=5).map(|n| seats(x, n)));
    for command in &commands {
        let expected = live.expected_version();
        let batch = decide(&t1, &mut live, command);
        store.append_events(&t1, x, batch, expected).await.unwrap();
    }
    assert_eq!(live.version(), 5);

    let state = live.create_snapshot().unwrap().unwrap();
    store
        .save_snapshot(Snapshot::from_state(&t1, x, state))
        .await
        .unwrap();

    for command in [renew(x, 500), seats(x, 9), renew(x, 900)] {
        let expected = live.expected_version();
        let batch = decide(&t1, &mut live, &command);
        store.append_events(&t1, x, batch, expected).await.unwrap();
    }
    assert_eq!(store.get_current_version(&t1, x).await.unwrap(), Some(8));

    let snapshot = store.get_snapshot(&t1, x).await.unwrap().unwrap();
    assert_eq!(snapshot.sequence_number, 5);
    let tail = store.get_events_in_range(&t1, x, 6, None).await.unwrap();
    assert_eq!(tail.len(), 3);

    let mut from_snapshot = AggregateRoot::<License>::new(x);
    from_snapshot
        .restore_from_snapshot(snapshot.into_state())
        .unwrap();
    from_snapshot.rehydrate(decode_all(&tail), 5);

    let mut full = AggregateRoot::<License>::new(x);
    full.rehydrate(decode_all(&store.get_events(&t1, x, 1).await.unwrap()), 0);

    assert_eq!(from_snapshot.state(), full.state());
    assert_eq!(from_snapshot.version(), 8);
    assert_eq!(full.version(), 8);
    assert_eq!(full.state(), live.state());
}

#[tokio::test]
async fn take_uncommitted_events_twice_returns_empty() {
    let x = AggregateId::new();
    let mut root = AggregateRoot::<License>::new(x);
    root.execute(&issue(x)).unwrap();

    assert_eq!(root.take_uncommitted_events().len(), 1);
    assert!(root.take_uncommitted_events().is_empty());
}

#[tokio::test]
async fn dispatched_events_are_consumed_exactly_once() {
    let store = Arc::new(InMemoryEventStore::new());
    let transport = Arc::new(InMemoryTransport::new());
    let t1 = tenant("t1");
    let mut subscription = transport.subscribe_tenant(&t1);
    let dispatcher = CommandDispatcher::new(
        store,
        publisher(transport.clone(), RetryPolicy::default()),
        DispatcherConfig::default(),
    );

    let x = AggregateId::new();
    dispatcher.dispatch::<License>(&t1, issue(x)).await.unwrap();
    dispatcher
        .dispatch::<License>(&tenant("t2"), issue(x))
        .await
        .unwrap();

    let message = subscription.recv().await.unwrap();
    assert!(message.belongs_to(&t1));
    assert!(subscription.try_recv().is_none());

    let envelope: EventEnvelope<serde_json::Value> = message.decode().unwrap();
    assert_eq!(envelope.sequence_number(), 1);
    assert_eq!(envelope.event_type(), "licensing.license.issued");

    let idempotency = InMemoryIdempotencyStore::new();
    let calls = std::sync::atomic::AtomicUsize::new(0);
    for _ in 0..2 {
        let _ = process_event_idempotently(&envelope, &idempotency, "notifier", |env| {
            let event: Result<LicenseEvent, _> = serde_json::from_value(env.payload().clone());
            calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            async move { event.map(|_| ()).map_err(anyhow::Error::from) }
        })
        .await;
    }
    assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);

    // A republish is recognised by the broker through the message id.
    let acks = dispatcher.republish(&t1, x, 1, None).await.unwrap();
    assert!(acks[0].duplicate);
    assert!(subscription.try_recv().is_none());
}

#[tokio::test(start_paused = true)]
async fn publish_retries_until_success() {
    let transport = Arc::new(InMemoryTransport::new());
    let publisher = publisher(
        transport.clone(),
        RetryPolicy::exponential(3, Duration::from_millis(100), 2.0, Duration::from_secs(1)),
    );
    transport.fail_next(2);

    let ack = publisher
        .publish("licensing.audit", &tenant("t1"), &serde_json::json!({"n": 1}), None)
        .await
        .unwrap();

    assert_eq!(ack.sequence, 1);
    assert_eq!(transport.publish_attempts(), 3);
}

#[tokio::test(start_paused = true)]
async fn publish_gives_up_after_max_attempts() {
    let transport = Arc::new(InMemoryTransport::new());
    let publisher = publisher(
        transport.clone(),
        RetryPolicy::fixed(4, Duration::from_millis(10)),
    );
    transport.fail_next(100);

    let err = publisher
        .publish("licensing.audit", &tenant("t1"), &serde_json::json!({"n": 1}), None)
        .await
        .unwrap_err();

    assert!(matches!(err, PublishError::Failed { attempts: 4, .. }));
    assert_eq!(transport.publish_attempts(), 4);
}

/// Store whose appends never answer. With `land` set, the append is applied first.
struct StalledStore {
    inner: InMemoryEventStore,
    land: bool,
}

#[async_trait]
impl EventStore for StalledStore {
    async fn append_events(
        &self,
        tenant_id: &TenantId,
        aggregate_id: AggregateId,
        events: Vec<UncommittedEvent>,
        expected_version: ExpectedVersion,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        if self.land {
            self.inner
                .append_events(tenant_id, aggregate_id, events, expected_version)
                .await?;
        }
        std::future::pending().await
    }

    async fn get_events_in_range(
        &self,
        tenant_id: &TenantId,
        aggregate_id: AggregateId,
        from_sequence: u64,
        to_sequence: Option<u64>,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        self.inner
            .get_events_in_range(tenant_id, aggregate_id, from_sequence, to_sequence)
            .await
    }

    async fn save_snapshot(&self, snapshot: Snapshot) -> Result<(), EventStoreError> {
        self.inner.save_snapshot(snapshot).await
    }

    async fn get_snapshot(
        &self,
        tenant_id: &TenantId,
        aggregate_id: AggregateId,
    ) -> Result<Option<Snapshot>, EventStoreError> {
        self.inner.get_snapshot(tenant_id, aggregate_id).await
    }

    async fn get_current_version(
        &self,
        tenant_id: &TenantId,
        aggregate_id: AggregateId,
    ) -> Result<Option<u64>, EventStoreError> {
        self.inner.get_current_version(tenant_id, aggregate_id).await
    }
}

fn stalled_dispatcher(land: bool) -> CommandDispatcher<StalledStore, Arc<InMemoryTransport>> {
    CommandDispatcher::new(
        StalledStore {
            inner: InMemoryEventStore::new(),
            land,
        },
        publisher(Arc::new(InMemoryTransport::new()), RetryPolicy::no_retry()),
        DispatcherConfig {
            append_timeout: Duration::from_millis(50),
            ..Default::default()
        },
    )
}

#[tokio::test(start_paused = true)]
async fn timed_out_append_that_landed_is_a_success() {
    let dispatcher = stalled_dispatcher(true);
    let t1 = tenant("t1");
    let x = AggregateId::new();
    let mut root = AggregateRoot::<License>::new(x);
    root.execute(&issue(x)).unwrap();

    let committed = dispatcher.commit(&t1, &mut root).await.unwrap();

    assert_eq!(committed.len(), 1);
    assert_eq!(committed[0].sequence_number, 1);
    assert!(!root.has_uncommitted_events());
}

#[tokio::test(start_paused = true)]
async fn timed_out_append_that_did_not_land_surfaces_timeout() {
    let dispatcher = stalled_dispatcher(false);
    let t1 = tenant("t1");
    let x = AggregateId::new();
    let mut root = AggregateRoot::<License>::new(x);
    root.execute(&issue(x)).unwrap();

    let err = dispatcher.commit(&t1, &mut root).await.unwrap_err();

    assert!(matches!(
        err,
        DispatchError::Store(EventStoreError::Timeout {
            operation: "append_events",
            ..
        })
    ));
    assert!(root.has_uncommitted_events());
    assert_eq!(
        dispatcher.store().get_current_version(&t1, x).await.unwrap(),
        None
    );
}
