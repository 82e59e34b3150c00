use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};

use chrono::{Duration, Utc};
use keystone_core::{AggregateId, ExpectedVersion, TenantId};
use keystone_events::{InMemoryTransport, Metadata};
use keystone_infra::command_dispatcher::{CommandDispatcher, DispatcherConfig};
use keystone_infra::event_store::{EventStore, InMemoryEventStore, UncommittedEvent};
use keystone_infra::publisher::{EventPublisher, PublisherConfig};
use keystone_licensing::{
    ChangeSeats, IssueLicense, License, LicenseCommand, LicenseEvent, SeatsChanged,
};
use std::sync::Arc;
use tokio::runtime::Runtime;

type Dispatcher = CommandDispatcher<Arc<InMemoryEventStore>, Arc<InMemoryTransport>>;

fn runtime() -> Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

fn tenant() -> TenantId {
    TenantId::new("bench").unwrap()
}

fn setup_dispatcher(config: DispatcherConfig) -> (Dispatcher, Arc<InMemoryEventStore>) {
    let store = Arc::new(InMemoryEventStore::new());
    let publisher = EventPublisher::new(Arc::new(InMemoryTransport::new()), PublisherConfig::default());
    (CommandDispatcher::new(store.clone(), publisher, config), store)
}

fn issue(license_id: AggregateId) -> LicenseCommand {
    let now = Utc::now();
    LicenseCommand::Issue(IssueLicense {
        license_id,
        product: black_box("keystone".to_string()),
        holder: "acme".to_string(),
        seats: 1,
        expires_at: now + Duration::days(365),
        occurred_at: now,
    })
}

fn change_seats(license_id: AggregateId, seats: u32) -> LicenseCommand {
    LicenseCommand::ChangeSeats(ChangeSeats {
        license_id,
        seats,
        occurred_at: Utc::now(),
    })
}

fn bench_command_execution_latency(c: &mut Criterion) {
    let mut group = c.benchmark_group("command_execution_latency");
    let rt = runtime();

    // First command, no history
    group.bench_function("issue_fresh", |b| {
        let (dispatcher, _) = setup_dispatcher(DispatcherConfig::default());
        let tenant_id = tenant();
        b.iter(|| {
            rt.block_on(dispatcher.dispatch::<License>(&tenant_id, issue(AggregateId::new())))
                .unwrap();
        });
    });

    // Alternating seat changes on one license with a growing history
    group.bench_function("change_seats_with_history", |b| {
        let (dispatcher, _) = setup_dispatcher(DispatcherConfig::default());
        let tenant_id = tenant();
        let license_id = AggregateId::new();
        rt.block_on(dispatcher.dispatch::<License>(&tenant_id, issue(license_id)))
            .unwrap();

        let mut seats = 1;
        b.iter(|| {
            seats = if seats == 1 { 2 } else { 1 };
            rt.block_on(
                dispatcher.dispatch::<License>(&tenant_id, change_seats(license_id, black_box(seats))),
            )
            .unwrap();
        });
    });

    group.finish();
}

fn bench_event_append_throughput(c: &mut Criterion) {
    let mut group = c.benchmark_group("event_append_throughput");
    let rt = runtime();

    for batch_size in [1u32, 10, 100, 1000].iter() {
        group.throughput(Throughput::Elements(u64::from(*batch_size)));
        group.bench_with_input(
            BenchmarkId::new("batch_append", batch_size),
            batch_size,
            |b, &size| {
                let store = InMemoryEventStore::new();
                let tenant_id = tenant();

                b.iter(|| {
                    // A fresh stream per iteration keeps the version check constant.
                    let license_id = AggregateId::new();
                    let events: Vec<UncommittedEvent> = (0..size)
                        .map(|i| {
                            let event = LicenseEvent::SeatsChanged(SeatsChanged {
                                license_id,
                                previous_seats: i + 1,
                                seats: i + 2,
                                occurred_at: Utc::now(),
                            });
                            UncommittedEvent::from_typed(
                                &tenant_id,
                                license_id,
                                "licensing.license",
                                uuid::Uuid::now_v7(),
                                &event,
                                Metadata::new(),
                            )
                            .unwrap()
                        })
                        .collect();

                    black_box(
                        rt.block_on(store.append_events(
                            &tenant_id,
                            license_id,
                            events,
                            ExpectedVersion::NoStream,
                        ))
                        .unwrap(),
                    );
                });
            },
        );
    }

    group.finish();
}

async fn seed_history(dispatcher: &Dispatcher, tenant_id: &TenantId, license_id: AggregateId, len: u32) {
    dispatcher
        .dispatch::<License>(tenant_id, issue(license_id))
        .await
        .unwrap();
    for i in 1..len {
        dispatcher
            .dispatch::<License>(tenant_id, change_seats(license_id, i + 1))
            .await
            .unwrap();
    }
}

fn bench_rehydration(c: &mut Criterion) {
    let mut group = c.benchmark_group("rehydration");
    let rt = runtime();
    let tenant_id = tenant();

    for history_len in [10u32, 100, 1000].iter() {
        group.throughput(Throughput::Elements(u64::from(*history_len)));

        let (replay, _) = setup_dispatcher(DispatcherConfig::default());
        let replay_id = AggregateId::new();
        rt.block_on(seed_history(&replay, &tenant_id, replay_id, *history_len));

        group.bench_with_input(
            BenchmarkId::new("full_replay", history_len),
            history_len,
            |b, _| {
                b.iter(|| {
                    let root = rt
                        .block_on(replay.load::<License>(&tenant_id, replay_id))
                        .unwrap();
                    black_box(root.version());
                });
            },
        );

        // Snapshot every 8 events: at most 7 events are replayed on top.
        let (snapshotted, store) = setup_dispatcher(DispatcherConfig {
            snapshot_every: 8,
            ..DispatcherConfig::default()
        });
        let snapshotted_id = AggregateId::new();
        rt.block_on(seed_history(&snapshotted, &tenant_id, snapshotted_id, *history_len));
        assert!(
            rt.block_on(store.get_snapshot(&tenant_id, snapshotted_id))
                .unwrap()
                .is_some()
        );

        group.bench_with_input(
            BenchmarkId::new("snapshot_plus_tail", history_len),
            history_len,
            |b, _| {
                b.iter(|| {
                    let root = rt
                        .block_on(snapshotted.load::<License>(&tenant_id, snapshotted_id))
                        .unwrap();
                    black_box(root.version());
                });
            },
        );
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_command_execution_latency,
    bench_event_append_throughput,
    bench_rehydration
);
criterion_main!(benches);
