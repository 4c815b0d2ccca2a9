//! Redis-backed ledger and reservation map.
//!
//! Counters live under `stock:{product}` / `stock:{product}:{variant}`.
//! Every check-and-mutate runs as one Lua script so it is atomic on the
//! server.

use std::time::Duration;

use async_trait::async_trait;
use common::{OrderId, ReservedItem, StockKey};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, Script};

use crate::ledger::{RELEASE_GUARD_TTL, release_guard_key};
use crate::mapping::mapping_key;
use crate::{LedgerError, ReservationMap, Result, StockLedger};

/// Returns -1 if the key is absent, 0 if the counter is too low, and the
/// remaining quantity plus one on success. The offset keeps a reservation
/// that drains the counter to zero distinct from a rejection.
const RESERVE_SCRIPT: &str = r#"
local current = redis.call('GET', KEYS[1])
if not current then
    return -1
end
local requested = tonumber(ARGV[1])
if tonumber(current) < requested then
    return 0
end
return redis.call('DECRBY', KEYS[1], requested) + 1
"#;

/// Returns the new counter value, or -1 if the guard already existed.
const RELEASE_ONCE_SCRIPT: &str = r#"
if redis.call('SET', KEYS[2], '1', 'NX', 'EX', ARGV[2]) then
    return redis.call('INCRBY', KEYS[1], ARGV[1])
end
return -1
"#;

/// Redis ledger using a shared connection manager.
#[derive(Clone)]
pub struct RedisStockLedger {
    conn: ConnectionManager,
    reserve_script: Script,
    release_once_script: Script,
}

impl RedisStockLedger {
    /// Connects to `redis_url`.
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let client = Client::open(redis_url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self::new(conn))
    }

    pub fn new(conn: ConnectionManager) -> Self {
        Self {
            conn,
            reserve_script: Script::new(RESERVE_SCRIPT),
            release_once_script: Script::new(RELEASE_ONCE_SCRIPT),
        }
    }
}

#[async_trait]
impl StockLedger for RedisStockLedger {
    #[tracing::instrument(skip(self, key), fields(key = %key))]
    async fn reserve(&self, key: &StockKey, quantity: u32) -> Result<u64> {
        if quantity == 0 {
            return Err(LedgerError::InvalidQuantity(quantity));
        }
        let cache_key = key.cache_key();
        let mut conn = self.conn.clone();
        let outcome: i64 = self
            .reserve_script
            .key(&cache_key)
            .arg(quantity)
            .invoke_async(&mut conn)
            .await?;

        match outcome {
            -1 => Err(LedgerError::KeyNotFound(cache_key)),
            0 => Err(LedgerError::InsufficientStock {
                key: cache_key,
                requested: quantity,
            }),
            remaining_plus_one => Ok((remaining_plus_one - 1).max(0) as u64),
        }
    }

    async fn release(&self, key: &StockKey, quantity: u32) -> Result<u64> {
        let mut conn = self.conn.clone();
        let value: i64 = conn.incr(key.cache_key(), quantity).await?;
        Ok(value.max(0) as u64)
    }

    #[tracing::instrument(skip(self, key), fields(key = %key))]
    async fn release_once(&self, key: &StockKey, quantity: u32, token: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let outcome: i64 = self
            .release_once_script
            .key(key.cache_key())
            .key(release_guard_key(key, token))
            .arg(quantity)
            .arg(RELEASE_GUARD_TTL.as_secs())
            .invoke_async(&mut conn)
            .await?;
        Ok(outcome >= 0)
    }

    async fn available(&self, key: &StockKey) -> Result<Option<u64>> {
        let mut conn = self.conn.clone();
        let value: Option<i64> = conn.get(key.cache_key()).await?;
        Ok(value.map(|v| v.max(0) as u64))
    }

    async fn sync(&self, key: &StockKey, quantity: u64) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.set(key.cache_key(), quantity).await?;
        Ok(())
    }
}

/// Redis reservation map. Entries are JSON arrays stored with `SET NX EX`.
#[derive(Clone)]
pub struct RedisReservationMap {
    conn: ConnectionManager,
    ttl: Duration,
}

impl RedisReservationMap {
    pub async fn connect(redis_url: &str, ttl: Duration) -> Result<Self> {
        let client = Client::open(redis_url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self::new(conn, ttl))
    }

    pub fn new(conn: ConnectionManager, ttl: Duration) -> Self {
        Self { conn, ttl }
    }
}

#[async_trait]
impl ReservationMap for RedisReservationMap {
    async fn save(&self, order_id: OrderId, items: &[ReservedItem]) -> Result<bool> {
        let mut conn = self.conn.clone();
        let body = serde_json::to_string(items)?;
        let written: Option<String> = redis::cmd("SET")
            .arg(mapping_key(order_id))
            .arg(body)
            .arg("NX")
            .arg("EX")
            .arg(self.ttl.as_secs().max(1))
            .query_async(&mut conn)
            .await?;
        Ok(written.is_some())
    }

    async fn get(&self, order_id: OrderId) -> Result<Option<Vec<ReservedItem>>> {
        let mut conn = self.conn.clone();
        let body: Option<String> = conn.get(mapping_key(order_id)).await?;
        body.map(|b| serde_json::from_str(&b).map_err(LedgerError::from))
            .transpose()
    }

    async fn delete(&self, order_id: OrderId) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.del(mapping_key(order_id)).await?;
        Ok(())
    }
}
