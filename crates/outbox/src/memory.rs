use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::EventId;
use tokio::sync::RwLock;

use crate::{NewOutboxRecord, OutboxRecord, OutboxStatus, OutboxStore, Result};

/// In-memory outbox for tests and single-process runs.
///
/// Records are kept in insertion order, which is the order the relay
/// publishes them in.
#[derive(Clone, Default)]
pub struct InMemoryOutboxStore {
    records: Arc<RwLock<Vec<OutboxRecord>>>,
}

impl InMemoryOutboxStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends several records under one lock.
    ///
    /// In-memory repositories call this while holding their own state lock,
    /// which makes the state change and its events visible together.
    pub async fn append(&self, records: Vec<NewOutboxRecord>) {
        let mut stored = self.records.write().await;
        stored.extend(records.into_iter().map(NewOutboxRecord::into_pending));
    }

    /// Snapshot of every record, oldest first.
    pub async fn all(&self) -> Vec<OutboxRecord> {
        self.records.read().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    async fn settle(
        &self,
        event_id: EventId,
        apply: impl FnOnce(&mut OutboxRecord),
    ) -> Result<bool> {
        let mut records = self.records.write().await;
        match records
            .iter_mut()
            .find(|r| r.event_id == event_id && r.status == OutboxStatus::Pending)
        {
            Some(record) => {
                apply(record);
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[async_trait]
impl OutboxStore for InMemoryOutboxStore {
    async fn insert(&self, record: NewOutboxRecord) -> Result<()> {
        self.append(vec![record]).await;
        Ok(())
    }

    async fn fetch_pending(&self, limit: usize) -> Result<Vec<OutboxRecord>> {
        let records = self.records.read().await;
        Ok(records
            .iter()
            .filter(|r| r.status == OutboxStatus::Pending)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn mark_published(&self, event_id: EventId, at: DateTime<Utc>) -> Result<bool> {
        self.settle(event_id, |r| {
            r.status = OutboxStatus::Published;
            r.published_at = Some(at);
        })
        .await
    }

    async fn mark_failed(&self, event_id: EventId, reason: &str) -> Result<bool> {
        self.settle(event_id, |r| {
            r.status = OutboxStatus::Failed;
            r.failure_reason = Some(reason.to_string());
        })
        .await
    }

    async fn purge_published(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let mut records = self.records.write().await;
        let before = records.len();
        records.retain(|r| {
            !(r.status == OutboxStatus::Published
                && r.published_at.is_some_and(|at| at < older_than))
        });
        Ok((before - records.len()) as u64)
    }

    async fn get(&self, event_id: EventId) -> Result<Option<OutboxRecord>> {
        let records = self.records.read().await;
        Ok(records.iter().find(|r| r.event_id == event_id).cloned())
    }

    async fn count_by_status(&self, status: OutboxStatus) -> Result<u64> {
        let records = self.records.read().await;
        Ok(records.iter().filter(|r| r.status == status).count() as u64)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;
    use common::payload::UserDeleted;
    use common::{EventPayload, ServiceTag, UserId};

    use super::*;

    fn record() -> NewOutboxRecord {
        let payload = EventPayload::UserDeleted(UserDeleted {
            user_id: UserId::new(),
        });
        NewOutboxRecord::from_payload(ServiceTag::Cart, &payload, None).unwrap()
    }

    #[tokio::test]
    async fn test_pending_records_come_back_oldest_first() {
        let store = InMemoryOutboxStore::new();
        let first = record();
        let second = record();
        store.insert(first.clone()).await.unwrap();
        store.insert(second.clone()).await.unwrap();

        let pending = store.fetch_pending(10).await.unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].event_id, first.event_id);
        assert_eq!(pending[1].event_id, second.event_id);

        assert_eq!(store.fetch_pending(1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_settled_records_never_change_again() {
        let store = InMemoryOutboxStore::new();
        let r = record();
        store.insert(r.clone()).await.unwrap();

        assert!(store.mark_published(r.event_id, Utc::now()).await.unwrap());
        assert!(!store.mark_failed(r.event_id, "late").await.unwrap());
        assert!(!store.mark_published(r.event_id, Utc::now()).await.unwrap());

        let stored = store.get(r.event_id).await.unwrap().unwrap();
        assert_eq!(stored.status, OutboxStatus::Published);
        assert!(stored.failure_reason.is_none());
        assert!(store.fetch_pending(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_records_keep_their_reason() {
        let store = InMemoryOutboxStore::new();
        let r = record();
        store.insert(r.clone()).await.unwrap();

        assert!(store.mark_failed(r.event_id, "broker down").await.unwrap());
        let stored = store.get(r.event_id).await.unwrap().unwrap();
        assert_eq!(stored.status, OutboxStatus::Failed);
        assert_eq!(stored.failure_reason.as_deref(), Some("broker down"));
        assert_eq!(store.count_by_status(OutboxStatus::Failed).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_purge_only_removes_old_published_records() {
        let store = InMemoryOutboxStore::new();
        let old = record();
        let fresh = record();
        let failed = record();
        store
            .append(vec![old.clone(), fresh.clone(), failed.clone()])
            .await;

        let now = Utc::now();
        store
            .mark_published(old.event_id, now - Duration::hours(100))
            .await
            .unwrap();
        store.mark_published(fresh.event_id, now).await.unwrap();
        store.mark_failed(failed.event_id, "x").await.unwrap();

        let purged = store
            .purge_published(now - Duration::hours(72))
            .await
            .unwrap();
        assert_eq!(purged, 1);
        assert!(store.get(old.event_id).await.unwrap().is_none());
        assert!(store.get(fresh.event_id).await.unwrap().is_some());
        assert!(store.get(failed.event_id).await.unwrap().is_some());
    }
}
