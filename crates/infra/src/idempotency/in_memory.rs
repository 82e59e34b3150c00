use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use keystone_events::Metadata;

use super::{IdempotencyError, IdempotencyStore, ProcessedRecord, validate_processor_id};

type RecordKey = (Uuid, String);

/// In-memory idempotency store for tests and single-process deployments.
#[derive(Debug, Clone, Default)]
pub struct InMemoryIdempotencyStore {
    records: Arc<RwLock<HashMap<RecordKey, ProcessedRecord>>>,
}

impl InMemoryIdempotencyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

#[async_trait]
impl IdempotencyStore for InMemoryIdempotencyStore {
    async fn has_been_processed(
        &self,
        event_id: Uuid,
        processor_id: &str,
    ) -> Result<bool, IdempotencyError> {
        validate_processor_id(processor_id)?;
        let records = self.records.read().await;
        Ok(records.contains_key(&(event_id, processor_id.to_string())))
    }

    async fn mark_as_processed(
        &self,
        event_id: Uuid,
        processor_id: &str,
        metadata: Metadata,
    ) -> Result<ProcessedRecord, IdempotencyError> {
        validate_processor_id(processor_id)?;
        let key = (event_id, processor_id.to_string());

        let mut records = self.records.write().await;
        if records.contains_key(&key) {
            return Err(IdempotencyError::AlreadyProcessed {
                event_id,
                processor_id: processor_id.to_string(),
            });
        }

        let record = ProcessedRecord {
            event_id,
            processor_id: processor_id.to_string(),
            processed_at: Utc::now(),
            metadata,
        };
        records.insert(key, record.clone());
        Ok(record)
    }

    async fn get_record(
        &self,
        event_id: Uuid,
        processor_id: &str,
    ) -> Result<Option<ProcessedRecord>, IdempotencyError> {
        validate_processor_id(processor_id)?;
        let records = self.records.read().await;
        Ok(records.get(&(event_id, processor_id.to_string())).cloned())
    }

    async fn purge_processed_before(&self, cutoff: DateTime<Utc>) -> Result<u64, IdempotencyError> {
        let mut records = self.records.write().await;
        let before = records.len();
        records.retain(|_, record| record.processed_at >= cutoff);
        let purged = before - records.len();
        if purged > 0 {
            tracing::debug!(purged, %cutoff, "purged processed-event records");
        }
        Ok(purged as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[tokio::test]
    async fn mark_then_query() {
        let store = InMemoryIdempotencyStore::new();
        let event_id = Uuid::now_v7();

        assert!(!store.has_been_processed(event_id, "p1").await.unwrap());

        let mut metadata = Metadata::new();
        metadata.insert("worker".to_string(), "w-1".to_string());
        store
            .mark_as_processed(event_id, "p1", metadata.clone())
            .await
            .unwrap();

        assert!(store.has_been_processed(event_id, "p1").await.unwrap());
        assert!(!store.has_been_processed(event_id, "p2").await.unwrap());

        let record = store.get_record(event_id, "p1").await.unwrap().unwrap();
        assert_eq!(record.metadata, metadata);
    }

    #[tokio::test]
    async fn duplicate_mark_is_rejected() {
        let store = InMemoryIdempotencyStore::new();
        let event_id = Uuid::now_v7();

        store
            .mark_as_processed(event_id, "p1", Metadata::new())
            .await
            .unwrap();
        let err = store
            .mark_as_processed(event_id, "p1", Metadata::new())
            .await
            .unwrap_err();

        assert!(err.is_already_processed());
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn concurrent_marks_have_exactly_one_winner() {
        let store = InMemoryIdempotencyStore::new();
        let event_id = Uuid::now_v7();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .mark_as_processed(event_id, "p1", Metadata::new())
                    .await
                    .is_ok()
            }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn purge_removes_only_older_records() {
        let store = InMemoryIdempotencyStore::new();
        let old = Uuid::now_v7();
        let fresh = Uuid::now_v7();

        store.mark_as_processed(old, "p1", Metadata::new()).await.unwrap();
        store
            .records
            .write()
            .await
            .get_mut(&(old, "p1".to_string()))
            .unwrap()
            .processed_at = Utc::now() - Duration::days(30);
        store.mark_as_processed(fresh, "p1", Metadata::new()).await.unwrap();

        let purged = store
            .purge_processed_before(Utc::now() - Duration::days(7))
            .await
            .unwrap();

        assert_eq!(purged, 1);
        assert!(!store.has_been_processed(old, "p1").await.unwrap());
        assert!(store.has_been_processed(fresh, "p1").await.unwrap());
    }
}
