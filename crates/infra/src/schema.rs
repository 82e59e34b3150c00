//! Postgres schema for the event store and the idempotency store.

use sqlx::PgPool;
use tracing::info;

use crate::event_store::EventStoreError;
use crate::event_store::postgres::map_sqlx_error;

/// Append-only event streams. `(tenant_id, aggregate_id, sequence_number)` is the
/// concurrency guard.
pub const CREATE_EVENTS_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS events (
    event_id        UUID PRIMARY KEY,
    tenant_id       TEXT NOT NULL,
    aggregate_id    UUID NOT NULL,
    aggregate_type  TEXT NOT NULL,
    sequence_number BIGINT NOT NULL CHECK (sequence_number > 0),
    event_type      TEXT NOT NULL,
    event_version   INTEGER NOT NULL,
    occurred_at     TIMESTAMPTZ NOT NULL,
    metadata        JSONB NOT NULL DEFAULT '{}'::jsonb,
    payload         JSONB NOT NULL,
    created_at      TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    UNIQUE (tenant_id, aggregate_id, sequence_number)
)";

pub const CREATE_EVENTS_TYPE_INDEX: &str = r"
CREATE INDEX IF NOT EXISTS idx_events_tenant_event_type
    ON events (tenant_id, event_type)";

/// One current snapshot per stream.
pub const CREATE_SNAPSHOTS_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS snapshots (
    tenant_id       TEXT NOT NULL,
    aggregate_id    UUID NOT NULL,
    aggregate_type  TEXT NOT NULL,
    sequence_number BIGINT NOT NULL CHECK (sequence_number > 0),
    state           JSONB NOT NULL,
    created_at      TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    PRIMARY KEY (tenant_id, aggregate_id)
)";

/// Consumer-side dedupe records.
pub const CREATE_PROCESSED_EVENTS_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS processed_events (
    event_id     UUID NOT NULL,
    processor_id TEXT NOT NULL,
    processed_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    metadata     JSONB NOT NULL DEFAULT '{}'::jsonb,
    PRIMARY KEY (event_id, processor_id)
)";

pub const CREATE_PROCESSED_EVENTS_INDEX: &str = r"
CREATE INDEX IF NOT EXISTS idx_processed_events_processed_at
    ON processed_events (processed_at)";

/// Every statement, in execution order. Each is idempotent.
pub const CREATE_TABLES: &[&str] = &[
    CREATE_EVENTS_TABLE,
    CREATE_EVENTS_TYPE_INDEX,
    CREATE_SNAPSHOTS_TABLE,
    CREATE_PROCESSED_EVENTS_TABLE,
    CREATE_PROCESSED_EVENTS_INDEX,
];

/// Create the tables if they do not exist yet.
pub async fn ensure_schema(pool: &PgPool) -> Result<(), EventStoreError> {
    for statement in CREATE_TABLES {
        sqlx::query(statement)
            .execute(pool)
            .await
            .map_err(|e| map_sqlx_error("ensure_schema", e))?;
    }
    info!(statements = CREATE_TABLES.len(), "event store schema ensured");
    Ok(())
}
