//! Postgres-backed idempotency store over the `processed_events` table.
//!
//! The primary key `(event_id, processor_id)` arbitrates racing consumers: the insert
//! uses `ON CONFLICT DO NOTHING` and a zero row count means someone else recorded the
//! pair first.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::postgres::PgRow;
use sqlx::{FromRow, PgPool, Row};
use tracing::instrument;
use uuid::Uuid;

use keystone_events::Metadata;

use super::{IdempotencyError, IdempotencyStore, ProcessedRecord, validate_processor_id};

#[derive(Debug, Clone)]
pub struct PostgresIdempotencyStore {
    pool: Arc<PgPool>,
}

impl PostgresIdempotencyStore {
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
impl IdempotencyStore for PostgresIdempotencyStore {
    #[instrument(skip(self), err)]
    async fn has_been_processed(
        &self,
        event_id: Uuid,
        processor_id: &str,
    ) -> Result<bool, IdempotencyError> {
        validate_processor_id(processor_id)?;
        let exists: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS(
                SELECT 1 FROM processed_events
                WHERE event_id = $1 AND processor_id = $2
            )
            "#,
        )
        .bind(event_id)
        .bind(processor_id)
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| store_error("has_been_processed", e))?;

        Ok(exists)
    }

    #[instrument(skip(self, metadata), err)]
    async fn mark_as_processed(
        &self,
        event_id: Uuid,
        processor_id: &str,
        metadata: Metadata,
    ) -> Result<ProcessedRecord, IdempotencyError> {
        validate_processor_id(processor_id)?;
        let processed_at = Utc::now();

        let result = sqlx::query(
            r#"
            INSERT INTO processed_events (event_id, processor_id, processed_at, metadata)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (event_id, processor_id) DO NOTHING
            "#,
        )
        .bind(event_id)
        .bind(processor_id)
        .bind(processed_at)
        .bind(Json(&metadata))
        .execute(&*self.pool)
        .await
        .map_err(|e| store_error("mark_as_processed", e))?;

        if result.rows_affected() == 0 {
            return Err(IdempotencyError::AlreadyProcessed {
                event_id,
                processor_id: processor_id.to_string(),
            });
        }

        Ok(ProcessedRecord {
            event_id,
            processor_id: processor_id.to_string(),
            processed_at,
            metadata,
        })
    }

    #[instrument(skip(self), err)]
    async fn get_record(
        &self,
        event_id: Uuid,
        processor_id: &str,
    ) -> Result<Option<ProcessedRecord>, IdempotencyError> {
        validate_processor_id(processor_id)?;
        let row: Option<ProcessedRow> = sqlx::query_as(
            r#"
            SELECT event_id, processor_id, processed_at, metadata
            FROM processed_events
            WHERE event_id = $1 AND processor_id = $2
            "#,
        )
        .bind(event_id)
        .bind(processor_id)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| store_error("get_record", e))?;

        Ok(row.map(ProcessedRecord::from))
    }

    #[instrument(skip(self), err)]
    async fn purge_processed_before(&self, cutoff: DateTime<Utc>) -> Result<u64, IdempotencyError> {
        let result = sqlx::query("DELETE FROM processed_events WHERE processed_at < $1")
            .bind(cutoff)
            .execute(&*self.pool)
            .await
            .map_err(|e| store_error("purge_processed_before", e))?;

        Ok(result.rows_affected())
    }
}

fn store_error(operation: &str, err: sqlx::Error) -> IdempotencyError {
    IdempotencyError::Store(format!("{operation}: {err}"))
}

#[derive(Debug)]
struct ProcessedRow {
    event_id: Uuid,
    processor_id: String,
    processed_at: DateTime<Utc>,
    metadata: Json<Metadata>,
}

impl<'r> FromRow<'r, PgRow> for ProcessedRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(ProcessedRow {
            event_id: row.try_get("event_id")?,
            processor_id: row.try_get("processor_id")?,
            processed_at: row.try_get("processed_at")?,
            metadata: row.try_get("metadata")?,
        })
    }
}

impl From<ProcessedRow> for ProcessedRecord {
    fn from(row: ProcessedRow) -> Self {
        Self {
            event_id: row.event_id,
            processor_id: row.processor_id,
            processed_at: row.processed_at,
            metadata: row.metadata.0,
        }
    }
}
