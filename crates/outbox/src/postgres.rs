use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{AggregateType, EventId, EventType, ServiceTag};
use sqlx::{PgConnection, PgPool, Row, postgres::PgRow};
use uuid::Uuid;

use crate::{NewOutboxRecord, OutboxError, OutboxRecord, OutboxStatus, OutboxStore, Result};

const SELECT_COLUMNS: &str = "event_id, aggregate_type, aggregate_id, event_type, payload, \
     producer, trace_id, version, created_at, status, published_at, failure_reason";

/// Writes `records` on `conn`, which is expected to be inside the caller's
/// transaction. This is the producer half of the outbox pattern.
pub async fn insert_in_tx(conn: &mut PgConnection, records: &[NewOutboxRecord]) -> Result<()> {
    for record in records {
        sqlx::query(
            r#"
            INSERT INTO outbox (event_id, aggregate_type, aggregate_id, event_type, payload,
                                producer, trace_id, version, created_at, status)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, 'PENDING')
            "#,
        )
        .bind(record.event_id.as_uuid())
        .bind(record.aggregate_type.as_str())
        .bind(&record.aggregate_id)
        .bind(record.event_type.as_str())
        .bind(&record.payload)
        .bind(record.producer.as_str())
        .bind(&record.trace_id)
        .bind(record.version)
        .bind(record.created_at)
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}

/// PostgreSQL-backed outbox.
///
/// Optionally scoped to one producer so several relays can share a table
/// without picking up each other's rows.
#[derive(Clone)]
pub struct PostgresOutboxStore {
    pool: PgPool,
    producer: Option<ServiceTag>,
}

impl PostgresOutboxStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            producer: None,
        }
    }

    /// Restricts `fetch_pending` to records emitted by `producer`.
    pub fn for_producer(mut self, producer: ServiceTag) -> Self {
        self.producer = Some(producer);
        self
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn row_to_record(row: PgRow) -> Result<OutboxRecord> {
        let event_id = EventId::from_uuid(row.try_get::<Uuid, _>("event_id")?);
        let corrupt = |reason: String| OutboxError::Corrupt {
            event_id: event_id.to_string(),
            reason,
        };

        let aggregate_type: String = row.try_get("aggregate_type")?;
        let producer: String = row.try_get("producer")?;
        let status: String = row.try_get("status")?;
        let event_type: String = row.try_get("event_type")?;

        Ok(OutboxRecord {
            event_id,
            aggregate_type: AggregateType::parse(&aggregate_type)
                .ok_or_else(|| corrupt(format!("unknown aggregate type {aggregate_type}")))?,
            aggregate_id: row.try_get("aggregate_id")?,
            event_type: EventType::parse(&event_type),
            payload: row.try_get("payload")?,
            producer: ServiceTag::parse(&producer)
                .ok_or_else(|| corrupt(format!("unknown producer {producer}")))?,
            trace_id: row.try_get("trace_id")?,
            version: row.try_get("version")?,
            created_at: row.try_get("created_at")?,
            status: OutboxStatus::parse(&status)
                .ok_or_else(|| corrupt(format!("unknown status {status}")))?,
            published_at: row.try_get("published_at")?,
            failure_reason: row.try_get("failure_reason")?,
        })
    }
}

#[async_trait]
impl OutboxStore for PostgresOutboxStore {
    async fn insert(&self, record: NewOutboxRecord) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        insert_in_tx(&mut conn, std::slice::from_ref(&record)).await
    }

    async fn fetch_pending(&self, limit: usize) -> Result<Vec<OutboxRecord>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {SELECT_COLUMNS}
            FROM outbox
            WHERE status = 'PENDING' AND ($1::TEXT IS NULL OR producer = $1)
            ORDER BY seq ASC
            LIMIT $2
            "#
        ))
        .bind(self.producer.map(|p| p.as_str()))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_record).collect()
    }

    async fn mark_published(&self, event_id: EventId, at: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE outbox SET status = 'PUBLISHED', published_at = $2
            WHERE event_id = $1 AND status = 'PENDING'
            "#,
        )
        .bind(event_id.as_uuid())
        .bind(at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn mark_failed(&self, event_id: EventId, reason: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE outbox SET status = 'FAILED', failure_reason = $2
            WHERE event_id = $1 AND status = 'PENDING'
            "#,
        )
        .bind(event_id.as_uuid())
        .bind(reason)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn purge_published(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM outbox WHERE status = 'PUBLISHED' AND published_at < $1",
        )
        .bind(older_than)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn get(&self, event_id: EventId) -> Result<Option<OutboxRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {SELECT_COLUMNS} FROM outbox WHERE event_id = $1"
        ))
        .bind(event_id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_record).transpose()
    }

    async fn count_by_status(&self, status: OutboxStatus) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM outbox WHERE status = $1")
            .bind(status.as_str())
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }
}
