//! Postgres-backed event store implementation.
//!
//! Enforces tenant isolation, optimistic concurrency control, and append-only semantics
//! at the database level. Tables are created by [`crate::schema::ensure_schema`].
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | EventStoreError | Scenario |
//! |------------|----------------------|-----------------|----------|
//! | Database (unique violation) on insert | `23505` | `Concurrency` | Concurrent append won the sequence number |
//! | Database (check constraint violation) | `23514` | `InvalidBatch` | Invalid data (e.g. sequence_number <= 0) |
//! | Database (other) | Any other | `Backend` | Other database errors |
//! | PoolClosed / Io / Tls / other | N/A | `Backend` | Network errors, connection failures, etc. |

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{FromRow, PgPool, Postgres, Row, Transaction};
use tracing::{Span, instrument};

use keystone_core::{AggregateId, ExpectedVersion, TenantId};
use keystone_events::Metadata;

use super::model::{Snapshot, StoredEvent, UncommittedEvent};
use super::r#trait::{
    EventStore, EventStoreError, ensure_stream_owner, validate_batch, validate_snapshot,
};

const SELECT_EVENT_COLUMNS: &str = r#"
    SELECT
        event_id,
        tenant_id,
        aggregate_id,
        aggregate_type,
        sequence_number,
        event_type,
        event_version,
        occurred_at,
        metadata,
        payload
    FROM events
"#;

/// Postgres-backed append-only event store.
///
/// ## Tenant Isolation
///
/// Every query includes `tenant_id` in the WHERE clause, so a stream can only be
/// addressed together with its tenant.
///
/// ## Optimistic Concurrency
///
/// `append_events()` runs in one transaction:
/// 1. Read the current stream version (`MAX(sequence_number)`)
/// 2. Validate it matches `expected_version`
/// 3. Insert the new events
///
/// If another transaction commits between steps 1 and 3, the unique constraint on
/// `(tenant_id, aggregate_id, sequence_number)` fails the insert and the append is
/// reported as a concurrency conflict.
#[derive(Debug, Clone)]
pub struct PostgresEventStore {
    pool: Arc<PgPool>,
}

impl PostgresEventStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl EventStore for PostgresEventStore {
    #[instrument(
        skip(self, events),
        fields(
            tenant_id = %tenant_id,
            aggregate_id = %aggregate_id,
            event_count = events.len(),
            expected_version = expected_version.as_u64(),
            committed_events = tracing::field::Empty
        ),
        err
    )]
    async fn append_events(
        &self,
        tenant_id: &TenantId,
        aggregate_id: AggregateId,
        events: Vec<UncommittedEvent>,
        expected_version: ExpectedVersion,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        let aggregate_type = validate_batch(tenant_id, aggregate_id, &events)?.to_string();

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let (current_version, existing_aggregate_type) =
            check_stream_version(&mut tx, tenant_id, aggregate_id).await?;

        if let Some(existing_type) = existing_aggregate_type {
            if existing_type != aggregate_type {
                tx.rollback()
                    .await
                    .map_err(|e| map_sqlx_error("rollback", e))?;
                return Err(EventStoreError::AggregateTypeMismatch(format!(
                    "stream aggregate_type is '{existing_type}', attempted append with '{aggregate_type}'"
                )));
            }
        }

        if !expected_version.matches(current_version) {
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("rollback", e))?;
            return Err(EventStoreError::Concurrency {
                tenant_id: tenant_id.clone(),
                aggregate_id,
                expected: expected_version.as_u64(),
                actual: current_version,
            });
        }

        let mut stored_events = Vec::with_capacity(events.len());
        let mut next_sequence = current_version + 1;

        for event in events {
            let inserted = sqlx::query(
                r#"
                INSERT INTO events (
                    event_id,
                    tenant_id,
                    aggregate_id,
                    aggregate_type,
                    sequence_number,
                    event_type,
                    event_version,
                    occurred_at,
                    metadata,
                    payload
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                "#,
            )
            .bind(event.event_id)
            .bind(tenant_id.as_str())
            .bind(aggregate_id.as_uuid())
            .bind(&aggregate_type)
            .bind(next_sequence as i64)
            .bind(&event.event_type)
            .bind(event.event_version as i32)
            .bind(event.occurred_at)
            .bind(Json(&event.metadata))
            .bind(&event.payload)
            .execute(&mut *tx)
            .await;

            if let Err(e) = inserted {
                if !is_unique_violation(&e) {
                    return Err(map_sqlx_error("insert_event", e));
                }
                // A concurrent transaction took this sequence number.
                tx.rollback()
                    .await
                    .map_err(|e| map_sqlx_error("rollback", e))?;
                let actual = self
                    .get_current_version(tenant_id, aggregate_id)
                    .await?
                    .unwrap_or(0);
                return Err(EventStoreError::Concurrency {
                    tenant_id: tenant_id.clone(),
                    aggregate_id,
                    expected: expected_version.as_u64(),
                    actual,
                });
            }

            stored_events.push(event.into_stored(next_sequence));
            next_sequence += 1;
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;

        Span::current().record("committed_events", stored_events.len());
        Ok(stored_events)
    }

    #[instrument(
        skip(self),
        fields(
            tenant_id = %tenant_id,
            aggregate_id = %aggregate_id,
            event_count = tracing::field::Empty
        ),
        err
    )]
    async fn get_events_in_range(
        &self,
        tenant_id: &TenantId,
        aggregate_id: AggregateId,
        from_sequence: u64,
        to_sequence: Option<u64>,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        let sql = format!(
            "{SELECT_EVENT_COLUMNS}
            WHERE tenant_id = $1
                AND aggregate_id = $2
                AND sequence_number >= $3
                AND ($4::BIGINT IS NULL OR sequence_number <= $4)
            ORDER BY sequence_number ASC"
        );

        let rows = sqlx::query(&sql)
            .bind(tenant_id.as_str())
            .bind(aggregate_id.as_uuid())
            .bind(from_sequence as i64)
            .bind(to_sequence.map(|to| to as i64))
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_events_in_range", e))?;

        let mut stored_events = Vec::with_capacity(rows.len());
        for row in rows {
            let stored = StoredEventRow::from_row(&row).map_err(|e| {
                EventStoreError::Serialization(format!("failed to decode event row: {e}"))
            })?;
            let stored = StoredEvent::try_from(stored)?;
            ensure_stream_owner(
                tenant_id,
                aggregate_id,
                &stored.tenant_id,
                stored.aggregate_id,
                "event",
            )?;
            stored_events.push(stored);
        }

        Span::current().record("event_count", stored_events.len());
        Ok(stored_events)
    }

    /// Upsert the current snapshot. An older snapshot never replaces a newer one.
    #[instrument(
        skip(self, snapshot),
        fields(
            tenant_id = %snapshot.tenant_id,
            aggregate_id = %snapshot.aggregate_id,
            sequence_number = snapshot.sequence_number
        ),
        err
    )]
    async fn save_snapshot(&self, snapshot: Snapshot) -> Result<(), EventStoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let (current_version, existing_aggregate_type) =
            check_stream_version(&mut tx, &snapshot.tenant_id, snapshot.aggregate_id).await?;
        let current = (current_version > 0).then_some(current_version);
        validate_snapshot(&snapshot, current)?;
        if let Some(existing_type) = existing_aggregate_type {
            if existing_type != snapshot.aggregate_type {
                return Err(EventStoreError::AggregateTypeMismatch(format!(
                    "stream aggregate_type is '{existing_type}', snapshot is '{}'",
                    snapshot.aggregate_type
                )));
            }
        }

        sqlx::query(
            r#"
            INSERT INTO snapshots (
                tenant_id,
                aggregate_id,
                aggregate_type,
                sequence_number,
                state,
                created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (tenant_id, aggregate_id)
            DO UPDATE SET
                aggregate_type = EXCLUDED.aggregate_type,
                sequence_number = EXCLUDED.sequence_number,
                state = EXCLUDED.state,
                created_at = EXCLUDED.created_at
            WHERE snapshots.sequence_number <= EXCLUDED.sequence_number
            "#,
        )
        .bind(snapshot.tenant_id.as_str())
        .bind(snapshot.aggregate_id.as_uuid())
        .bind(&snapshot.aggregate_type)
        .bind(snapshot.sequence_number as i64)
        .bind(&snapshot.state)
        .bind(snapshot.created_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("save_snapshot", e))?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(())
    }

    #[instrument(
        skip(self),
        fields(
            tenant_id = %tenant_id,
            aggregate_id = %aggregate_id,
            snapshot_found = tracing::field::Empty
        ),
        err
    )]
    async fn get_snapshot(
        &self,
        tenant_id: &TenantId,
        aggregate_id: AggregateId,
    ) -> Result<Option<Snapshot>, EventStoreError> {
        let row = sqlx::query(
            r#"
            SELECT
                tenant_id,
                aggregate_id,
                aggregate_type,
                sequence_number,
                state,
                created_at
            FROM snapshots
            WHERE tenant_id = $1 AND aggregate_id = $2
            "#,
        )
        .bind(tenant_id.as_str())
        .bind(aggregate_id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_snapshot", e))?;

        Span::current().record("snapshot_found", row.is_some());
        let Some(row) = row else {
            return Ok(None);
        };

        let snapshot_row = SnapshotRow::from_row(&row).map_err(|e| {
            EventStoreError::Serialization(format!("failed to decode snapshot row: {e}"))
        })?;
        let snapshot = Snapshot::try_from(snapshot_row)?;
        ensure_stream_owner(
            tenant_id,
            aggregate_id,
            &snapshot.tenant_id,
            snapshot.aggregate_id,
            "snapshot",
        )?;
        Ok(Some(snapshot))
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id, aggregate_id = %aggregate_id), err)]
    async fn get_current_version(
        &self,
        tenant_id: &TenantId,
        aggregate_id: AggregateId,
    ) -> Result<Option<u64>, EventStoreError> {
        let row = sqlx::query(
            r#"
            SELECT MAX(sequence_number) AS current_version
            FROM events
            WHERE tenant_id = $1 AND aggregate_id = $2
            "#,
        )
        .bind(tenant_id.as_str())
        .bind(aggregate_id.as_uuid())
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_current_version", e))?;

        let current: Option<i64> = row.try_get("current_version").map_err(|e| {
            EventStoreError::Serialization(format!("failed to read current_version: {e}"))
        })?;
        Ok(current.map(|v| v as u64))
    }
}

/// Read the current version of a stream inside a transaction.
///
/// Returns `(current_version, aggregate_type)` where `current_version` is 0 and
/// `aggregate_type` is `None` if the stream doesn't exist.
async fn check_stream_version(
    tx: &mut Transaction<'_, Postgres>,
    tenant_id: &TenantId,
    aggregate_id: AggregateId,
) -> Result<(u64, Option<String>), EventStoreError> {
    let row = sqlx::query(
        r#"
        SELECT
            COALESCE(MAX(sequence_number), 0) AS current_version,
            MAX(aggregate_type) AS aggregate_type
        FROM events
        WHERE tenant_id = $1 AND aggregate_id = $2
        "#,
    )
    .bind(tenant_id.as_str())
    .bind(aggregate_id.as_uuid())
    .fetch_one(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("check_stream_version", e))?;

    let current_version: i64 = row.try_get("current_version").map_err(|e| {
        EventStoreError::Serialization(format!("failed to read current_version: {e}"))
    })?;
    let aggregate_type: Option<String> = row.try_get("aggregate_type").map_err(|e| {
        EventStoreError::Serialization(format!("failed to read aggregate_type: {e}"))
    })?;

    Ok((current_version as u64, aggregate_type))
}

/// Map SQLx errors to EventStoreError.
pub(crate) fn map_sqlx_error(operation: &str, err: sqlx::Error) -> EventStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {operation}: {}", db_err.message());
            match db_err.code().as_deref() {
                Some("23514") => EventStoreError::InvalidBatch(msg),
                _ => EventStoreError::Backend(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            EventStoreError::Backend(format!("connection pool closed in {operation}"))
        }
        sqlx::Error::PoolTimedOut => EventStoreError::Backend(format!(
            "timed out acquiring a connection in {operation}"
        )),
        _ => EventStoreError::Backend(format!("sqlx error in {operation}: {err}")),
    }
}

/// Check if an error is a unique constraint violation.
pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        return db_err.code().as_deref() == Some("23505");
    }
    false
}

fn decode_tenant(raw: String) -> Result<TenantId, EventStoreError> {
    TenantId::new(raw)
        .map_err(|e| EventStoreError::Serialization(format!("stored tenant_id is invalid: {e}")))
}

// SQLx row types

#[derive(Debug)]
struct StoredEventRow {
    event_id: uuid::Uuid,
    tenant_id: String,
    aggregate_id: uuid::Uuid,
    aggregate_type: String,
    sequence_number: i64,
    event_type: String,
    event_version: i32,
    occurred_at: DateTime<Utc>,
    metadata: Json<Metadata>,
    payload: serde_json::Value,
}

impl<'r> FromRow<'r, sqlx::postgres::PgRow> for StoredEventRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(StoredEventRow {
            event_id: row.try_get("event_id")?,
            tenant_id: row.try_get("tenant_id")?,
            aggregate_id: row.try_get("aggregate_id")?,
            aggregate_type: row.try_get("aggregate_type")?,
            sequence_number: row.try_get("sequence_number")?,
            event_type: row.try_get("event_type")?,
            event_version: row.try_get("event_version")?,
            occurred_at: row.try_get("occurred_at")?,
            metadata: row.try_get("metadata")?,
            payload: row.try_get("payload")?,
        })
    }
}

impl TryFrom<StoredEventRow> for StoredEvent {
    type Error = EventStoreError;

    fn try_from(row: StoredEventRow) -> Result<Self, Self::Error> {
        Ok(StoredEvent {
            event_id: row.event_id,
            tenant_id: decode_tenant(row.tenant_id)?,
            aggregate_id: AggregateId::from_uuid(row.aggregate_id),
            aggregate_type: row.aggregate_type,
            sequence_number: row.sequence_number as u64,
            event_type: row.event_type,
            event_version: row.event_version as u32,
            occurred_at: row.occurred_at,
            metadata: row.metadata.0,
            payload: row.payload,
        })
    }
}

#[derive(Debug)]
struct SnapshotRow {
    tenant_id: String,
    aggregate_id: uuid::Uuid,
    aggregate_type: String,
    sequence_number: i64,
    state: serde_json::Value,
    created_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, sqlx::postgres::PgRow> for SnapshotRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(SnapshotRow {
            tenant_id: row.try_get("tenant_id")?,
            aggregate_id: row.try_get("aggregate_id")?,
            aggregate_type: row.try_get("aggregate_type")?,
            sequence_number: row.try_get("sequence_number")?,
            state: row.try_get("state")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

impl TryFrom<SnapshotRow> for Snapshot {
    type Error = EventStoreError;

    fn try_from(row: SnapshotRow) -> Result<Self, Self::Error> {
        Ok(Snapshot {
            tenant_id: decode_tenant(row.tenant_id)?,
            aggregate_id: AggregateId::from_uuid(row.aggregate_id),
            aggregate_type: row.aggregate_type,
            sequence_number: row.sequence_number as u64,
            state: row.state,
            created_at: row.created_at,
        })
    }
}
