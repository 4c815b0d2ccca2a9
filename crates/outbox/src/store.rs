use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::EventId;

use crate::{NewOutboxRecord, OutboxRecord, OutboxStatus, Result};

/// Durable storage for outbox records.
///
/// Producers normally write records inside their own local transaction
/// (see the Postgres helpers); `insert` is for callers without one.
/// Status changes are conditional on the record still being `Pending`, so a
/// record is settled at most once however many relays race for it.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    async fn insert(&self, record: NewOutboxRecord) -> Result<()>;

    /// Up to `limit` pending records, oldest first.
    async fn fetch_pending(&self, limit: usize) -> Result<Vec<OutboxRecord>>;

    /// Returns false if the record was not pending.
    async fn mark_published(&self, event_id: EventId, at: DateTime<Utc>) -> Result<bool>;

    /// Returns false if the record was not pending.
    async fn mark_failed(&self, event_id: EventId, reason: &str) -> Result<bool>;

    /// Deletes published records older than `older_than`. Returns how many.
    async fn purge_published(&self, older_than: DateTime<Utc>) -> Result<u64>;

    async fn get(&self, event_id: EventId) -> Result<Option<OutboxRecord>>;

    async fn count_by_status(&self, status: OutboxStatus) -> Result<u64>;
}
