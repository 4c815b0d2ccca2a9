//! Postgres outbox store and relay.
//!
//! These need Docker. Run with:
//!
//! ```bash
//! cargo test -p outbox --test postgres_integration -- --ignored --test-threads=1
//! ```

use std::sync::Arc;

use chrono::{Duration, Utc};
use common::payload::OrderConfirmed;
use common::{EventPayload, OrderId, ServiceTag, UserId};
use message_bus::{DEFAULT_EVENT_TOPIC, InMemoryMessageBus};
use outbox::{
    NewOutboxRecord, OutboxRelay, OutboxStatus, OutboxStore, PostgresOutboxStore, RelayConfig,
    insert_in_tx,
};
use serial_test::serial;
use sqlx::PgPool;
use testcontainers::{ContainerAsync, runners::AsyncRunner};
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;

struct ContainerInfo {
    #[allow(dead_code)] // Container must stay alive for tests
    container: ContainerAsync<Postgres>,
    connection_string: String,
}

static CONTAINER: OnceCell<Arc<ContainerInfo>> = OnceCell::const_new();

async fn pool() -> PgPool {
    let info = CONTAINER
        .get_or_init(|| async {
            let container = Postgres::default().start().await.unwrap();
            let host = container.get_host().await.unwrap();
            let port = container.get_host_port_ipv4(5432).await.unwrap();
            let connection_string =
                format!("postgres://postgres:postgres@{host}:{port}/postgres");

            let temp_pool = PgPool::connect(&connection_string).await.unwrap();
            sqlx::raw_sql(include_str!("../../../migrations/20250101000001_outbox.sql"))
                .execute(&temp_pool)
                .await
                .unwrap();
            temp_pool.close().await;

            Arc::new(ContainerInfo {
                container,
                connection_string,
            })
        })
        .await
        .clone();

    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(5)
        .connect(&info.connection_string)
        .await
        .unwrap();
    sqlx::query("TRUNCATE outbox").execute(&pool).await.unwrap();
    pool
}

fn record(producer: ServiceTag) -> NewOutboxRecord {
    let payload = EventPayload::OrderConfirmed(OrderConfirmed {
        order_id: OrderId::new(),
        user_id: UserId::new(),
    });
    NewOutboxRecord::from_payload(producer, &payload, Some("trace-1".to_string())).unwrap()
}

#[tokio::test]
#[ignore = "requires Docker"]
#[serial]
async fn rolled_back_transaction_leaves_no_record() {
    let pool = pool().await;
    let store = PostgresOutboxStore::new(pool.clone());

    let mut tx = pool.begin().await.unwrap();
    insert_in_tx(&mut tx, &[record(ServiceTag::Order)]).await.unwrap();
    tx.rollback().await.unwrap();
    assert!(store.fetch_pending(10).await.unwrap().is_empty());

    let mut tx = pool.begin().await.unwrap();
    insert_in_tx(&mut tx, &[record(ServiceTag::Order)]).await.unwrap();
    tx.commit().await.unwrap();
    assert_eq!(store.fetch_pending(10).await.unwrap().len(), 1);
}

#[tokio::test]
#[ignore = "requires Docker"]
#[serial]
async fn producer_scope_filters_pending_records() {
    let pool = pool().await;
    let unscoped = PostgresOutboxStore::new(pool.clone());
    unscoped.insert(record(ServiceTag::Order)).await.unwrap();
    unscoped.insert(record(ServiceTag::Payment)).await.unwrap();

    let payments = PostgresOutboxStore::new(pool.clone()).for_producer(ServiceTag::Payment);
    let pending = payments.fetch_pending(10).await.unwrap();

    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].producer, ServiceTag::Payment);
    assert_eq!(unscoped.fetch_pending(10).await.unwrap().len(), 2);
}

#[tokio::test]
#[ignore = "requires Docker"]
#[serial]
async fn relay_publishes_in_order_then_purges() {
    let pool = pool().await;
    let store = PostgresOutboxStore::new(pool.clone());
    let first = record(ServiceTag::Order);
    let second = record(ServiceTag::Order);
    store.insert(first.clone()).await.unwrap();
    store.insert(second.clone()).await.unwrap();

    let bus = InMemoryMessageBus::new(1);
    let relay = OutboxRelay::new(
        Arc::new(store.clone()),
        Arc::new(bus.clone()),
        RelayConfig::default(),
    );
    let report = relay.tick().await.unwrap();

    assert_eq!(report.published, 2);
    let messages = bus.messages(DEFAULT_EVENT_TOPIC).await;
    assert_eq!(messages[0].key, first.aggregate_id);
    assert_eq!(messages[1].key, second.aggregate_id);
    assert_eq!(store.count_by_status(OutboxStatus::Published).await.unwrap(), 2);
    assert!(!store.mark_failed(first.event_id, "late").await.unwrap());

    let purged = store.purge_published(Utc::now() + Duration::seconds(1)).await.unwrap();
    assert_eq!(purged, 2);
    assert!(store.get(first.event_id).await.unwrap().is_none());
}
