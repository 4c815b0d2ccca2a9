//! Redis-backed ledger and mapping tests.
//!
//! These need Docker. Run with:
//!
//! ```bash
//! cargo test -p stock-ledger --test redis_integration -- --ignored --test-threads=1
//! ```

use std::sync::Arc;
use std::time::Duration;

use common::{OrderId, ReservedItem, StockKey};
use serial_test::serial;
use stock_ledger::{LedgerError, RedisReservationMap, RedisStockLedger, ReservationMap, StockLedger};
use testcontainers::{ContainerAsync, runners::AsyncRunner};
use testcontainers_modules::redis::Redis;
use tokio::sync::OnceCell;

struct ContainerInfo {
    #[allow(dead_code)] // Container must stay alive for tests
    container: ContainerAsync<Redis>,
    url: String,
}

static CONTAINER: OnceCell<Arc<ContainerInfo>> = OnceCell::const_new();

async fn redis_url() -> String {
    CONTAINER
        .get_or_init(|| async {
            let container = Redis::default().start().await.unwrap();
            let host = container.get_host().await.unwrap();
            let port = container.get_host_port_ipv4(6379).await.unwrap();
            Arc::new(ContainerInfo {
                container,
                url: format!("redis://{host}:{port}"),
            })
        })
        .await
        .url
        .clone()
}

fn unique_key() -> StockKey {
    StockKey::product(format!("SKU-{}", OrderId::new()))
}

#[tokio::test]
#[ignore = "requires Docker"]
#[serial]
async fn reserve_script_distinguishes_outcomes() {
    let ledger = RedisStockLedger::connect(&redis_url().await).await.unwrap();
    let key = unique_key();

    assert!(matches!(
        ledger.reserve(&key, 1).await,
        Err(LedgerError::KeyNotFound(_))
    ));

    ledger.sync(&key, 3).await.unwrap();
    assert_eq!(ledger.reserve(&key, 2).await.unwrap(), 1);
    // Draining to exactly zero is a success, not a rejection.
    assert_eq!(ledger.reserve(&key, 1).await.unwrap(), 0);
    assert!(matches!(
        ledger.reserve(&key, 1).await,
        Err(LedgerError::InsufficientStock { requested: 1, .. })
    ));
    assert_eq!(ledger.available(&key).await.unwrap(), Some(0));
}

#[tokio::test]
#[ignore = "requires Docker"]
#[serial]
async fn concurrent_reserves_never_oversell() {
    let ledger = RedisStockLedger::connect(&redis_url().await).await.unwrap();
    let key = unique_key();
    ledger.sync(&key, 10).await.unwrap();

    let handles: Vec<_> = (0..50)
        .map(|_| {
            let ledger = ledger.clone();
            let key = key.clone();
            tokio::spawn(async move { ledger.reserve(&key, 1).await.is_ok() })
        })
        .collect();

    let mut granted = 0;
    for handle in handles {
        if handle.await.unwrap() {
            granted += 1;
        }
    }
    assert_eq!(granted, 10);
    assert_eq!(ledger.available(&key).await.unwrap(), Some(0));
}

#[tokio::test]
#[ignore = "requires Docker"]
#[serial]
async fn release_once_is_guarded_per_token() {
    let ledger = RedisStockLedger::connect(&redis_url().await).await.unwrap();
    let key = unique_key();
    ledger.sync(&key, 0).await.unwrap();

    assert!(ledger.release_once(&key, 2, "order-a").await.unwrap());
    assert!(!ledger.release_once(&key, 2, "order-a").await.unwrap());
    assert_eq!(ledger.available(&key).await.unwrap(), Some(2));
}

#[tokio::test]
#[ignore = "requires Docker"]
#[serial]
async fn mapping_roundtrip_and_write_once() {
    let map = RedisReservationMap::connect(&redis_url().await, Duration::from_secs(60))
        .await
        .unwrap();
    let order_id = OrderId::new();
    let items = vec![ReservedItem::new(StockKey::variant("SKU-1", "L"), 2)];

    assert!(map.save(order_id, &items).await.unwrap());
    assert!(!map.save(order_id, &[]).await.unwrap());
    assert_eq!(map.get(order_id).await.unwrap(), Some(items));

    map.delete(order_id).await.unwrap();
    assert_eq!(map.get(order_id).await.unwrap(), None);
}
