//! State-stored aggregate repositories.
//!
//! Both orders and payments are stored as a JSON document plus a few indexed
//! columns, one row per order id. Saves are a compare-and-swap on `version`
//! and write the aggregate's outbox records in the same commit.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use common::{OrderId, ServiceTag, UserId};
use domain::{Aggregate, Order, Payment, integration_events};
use outbox::{InMemoryOutboxStore, NewOutboxRecord};
use serde::Serialize;
use serde::de::DeserializeOwned;
use sqlx::{PgPool, Row};
use tokio::sync::RwLock;

use crate::{Result, SagaError};

/// An aggregate that can be kept by a [`Repository`].
pub trait Stored: Aggregate + Clone + Serialize + DeserializeOwned + 'static {
    /// Table holding the aggregate.
    const TABLE: &'static str;

    fn key(&self) -> OrderId;

    fn owner(&self) -> UserId;

    fn status_label(&self) -> &'static str;
}

impl Stored for Order {
    const TABLE: &'static str = "orders";

    fn key(&self) -> OrderId {
        self.id()
    }

    fn owner(&self) -> UserId {
        self.user_id()
    }

    fn status_label(&self) -> &'static str {
        self.status().as_str()
    }
}

impl Stored for Payment {
    const TABLE: &'static str = "payments";

    fn key(&self) -> OrderId {
        self.order_id()
    }

    fn owner(&self) -> UserId {
        self.user_id()
    }

    fn status_label(&self) -> &'static str {
        self.status().as_str()
    }
}

/// Storage for one aggregate type.
#[async_trait]
pub trait Repository<A: Stored>: Send + Sync {
    async fn get(&self, id: OrderId) -> Result<Option<A>>;

    /// Saves `aggregate` if nobody saved it since it was loaded, together
    /// with `outbox`.
    ///
    /// The aggregate's version is the expected version (0 for a new one).
    /// On success it is bumped; on [`SagaError::Conflict`] nothing is written.
    async fn save(&self, aggregate: &mut A, outbox: Vec<NewOutboxRecord>) -> Result<()>;
}

fn conflict<A: Stored>(aggregate: &A) -> SagaError {
    SagaError::Conflict {
        aggregate: A::aggregate_type(),
        id: aggregate.key(),
    }
}

/// Applies `events` to `aggregate` and saves it with the outbox records of
/// the events it announces.
pub(crate) async fn persist<A: Stored>(
    repository: &dyn Repository<A>,
    aggregate: &mut A,
    events: Vec<A::Event>,
    producer: ServiceTag,
    trace_id: Option<&str>,
) -> Result<()> {
    let outbox = crate::outbound::records(producer, &integration_events(&events), trace_id)?;
    aggregate.commit(events);
    repository.save(aggregate, outbox).await
}

/// In-memory repository sharing an outbox with its siblings.
pub struct InMemoryRepository<A> {
    state: Arc<RwLock<HashMap<OrderId, A>>>,
    outbox: InMemoryOutboxStore,
}

impl<A> Clone for InMemoryRepository<A> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
            outbox: self.outbox.clone(),
        }
    }
}

impl<A: Stored> InMemoryRepository<A> {
    pub fn new(outbox: InMemoryOutboxStore) -> Self {
        Self {
            state: Arc::new(RwLock::new(HashMap::new())),
            outbox,
        }
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl<A: Stored> Repository<A> for InMemoryRepository<A> {
    async fn get(&self, id: OrderId) -> Result<Option<A>> {
        Ok(self.state.read().await.get(&id).cloned())
    }

    async fn save(&self, aggregate: &mut A, outbox: Vec<NewOutboxRecord>) -> Result<()> {
        let mut state = self.state.write().await;
        let expected = aggregate.version();
        let current = state.get(&aggregate.key()).map(|a| a.version());

        match current {
            None if expected == 0 => {}
            Some(version) if version == expected => {}
            _ => return Err(conflict(aggregate)),
        }

        aggregate.set_version(expected + 1);
        self.outbox.append(outbox).await;
        state.insert(aggregate.key(), aggregate.clone());
        Ok(())
    }
}

/// PostgreSQL repository.
pub struct PostgresRepository<A> {
    pool: PgPool,
    _aggregate: PhantomData<fn() -> A>,
}

impl<A> Clone for PostgresRepository<A> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            _aggregate: PhantomData,
        }
    }
}

impl<A: Stored> PostgresRepository<A> {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            _aggregate: PhantomData,
        }
    }
}

#[async_trait]
impl<A: Stored> Repository<A> for PostgresRepository<A> {
    async fn get(&self, id: OrderId) -> Result<Option<A>> {
        let row = sqlx::query(&format!(
            "SELECT version, state FROM {} WHERE id = $1",
            A::TABLE
        ))
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let state: serde_json::Value = row.try_get("state")?;
        let mut aggregate: A = serde_json::from_value(state)?;
        aggregate.set_version(row.try_get("version")?);
        Ok(Some(aggregate))
    }

    async fn save(&self, aggregate: &mut A, outbox: Vec<NewOutboxRecord>) -> Result<()> {
        let expected = aggregate.version();
        let next = expected + 1;
        let mut document = aggregate.clone();
        document.set_version(next);
        let state = serde_json::to_value(&document)?;

        let mut tx = self.pool.begin().await?;

        let written = if expected == 0 {
            sqlx::query(&format!(
                r#"
                INSERT INTO {} (id, user_id, status, version, state, updated_at)
                VALUES ($1, $2, $3, 1, $4, NOW())
                ON CONFLICT (id) DO NOTHING
                "#,
                A::TABLE
            ))
            .bind(aggregate.key().as_uuid())
            .bind(aggregate.owner().as_uuid())
            .bind(aggregate.status_label())
            .bind(&state)
            .execute(&mut *tx)
            .await?
        } else {
            sqlx::query(&format!(
                r#"
                UPDATE {} SET status = $3, version = $4, state = $5, updated_at = NOW()
                WHERE id = $1 AND version = $2
                "#,
                A::TABLE
            ))
            .bind(aggregate.key().as_uuid())
            .bind(expected)
            .bind(aggregate.status_label())
            .bind(next)
            .bind(&state)
            .execute(&mut *tx)
            .await?
        };

        if written.rows_affected() != 1 {
            return Err(conflict(aggregate));
        }

        outbox::insert_in_tx(&mut *tx, &outbox).await?;
        tx.commit().await?;

        aggregate.set_version(next);
        Ok(())
    }
}
