use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::{OrderId, ReservedItem, StockKey};
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;

use crate::ledger::{RELEASE_GUARD_TTL, release_guard_key};
use crate::{LedgerError, ReservationMap, Result, StockLedger};

/// In-memory ledger for tests and single-process deployments.
///
/// A single mutex serializes every mutation, which gives the same
/// check-and-decrement atomicity the Redis script provides. Release guards
/// expire like their Redis counterparts.
#[derive(Clone)]
pub struct InMemoryStockLedger {
    inner: Arc<Mutex<LedgerState>>,
    guard_ttl: Duration,
}

#[derive(Default)]
struct LedgerState {
    counters: HashMap<String, u64>,
    /// Guard key → expiry.
    release_guards: HashMap<String, Instant>,
}

impl Default for InMemoryStockLedger {
    fn default() -> Self {
        Self::with_guard_ttl(RELEASE_GUARD_TTL)
    }
}

impl InMemoryStockLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_guard_ttl(guard_ttl: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(LedgerState::default())),
            guard_ttl,
        }
    }

    /// Number of counters currently held.
    pub async fn len(&self) -> usize {
        self.inner.lock().await.counters.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl StockLedger for InMemoryStockLedger {
    async fn reserve(&self, key: &StockKey, quantity: u32) -> Result<u64> {
        if quantity == 0 {
            return Err(LedgerError::InvalidQuantity(quantity));
        }
        let cache_key = key.cache_key();
        let mut state = self.inner.lock().await;
        let counter = state
            .counters
            .get_mut(&cache_key)
            .ok_or_else(|| LedgerError::KeyNotFound(cache_key.clone()))?;

        if *counter < u64::from(quantity) {
            return Err(LedgerError::InsufficientStock {
                key: cache_key,
                requested: quantity,
            });
        }
        *counter -= u64::from(quantity);
        Ok(*counter)
    }

    async fn release(&self, key: &StockKey, quantity: u32) -> Result<u64> {
        let mut state = self.inner.lock().await;
        let counter = state.counters.entry(key.cache_key()).or_insert(0);
        *counter += u64::from(quantity);
        Ok(*counter)
    }

    async fn release_once(&self, key: &StockKey, quantity: u32, token: &str) -> Result<bool> {
        let now = Instant::now();
        let mut state = self.inner.lock().await;
        state.release_guards.retain(|_, expires_at| *expires_at > now);
        let guard = release_guard_key(key, token);
        if state.release_guards.contains_key(&guard) {
            return Ok(false);
        }
        state.release_guards.insert(guard, now + self.guard_ttl);
        *state.counters.entry(key.cache_key()).or_insert(0) += u64::from(quantity);
        Ok(true)
    }

    async fn available(&self, key: &StockKey) -> Result<Option<u64>> {
        Ok(self.inner.lock().await.counters.get(&key.cache_key()).copied())
    }

    async fn sync(&self, key: &StockKey, quantity: u64) -> Result<()> {
        self.inner
            .lock()
            .await
            .counters
            .insert(key.cache_key(), quantity);
        Ok(())
    }
}

/// In-memory reservation map with per-entry expiry.
///
/// Expiry is measured on the tokio clock so tests can advance it with
/// `tokio::time::advance`.
#[derive(Clone)]
pub struct InMemoryReservationMap {
    entries: Arc<RwLock<HashMap<OrderId, (Vec<ReservedItem>, Instant)>>>,
    ttl: Duration,
}

impl InMemoryReservationMap {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            ttl,
        }
    }
}

impl Default for InMemoryReservationMap {
    fn default() -> Self {
        Self::new(crate::DEFAULT_RESERVATION_TTL)
    }
}

#[async_trait]
impl ReservationMap for InMemoryReservationMap {
    async fn save(&self, order_id: OrderId, items: &[ReservedItem]) -> Result<bool> {
        let mut entries = self.entries.write().await;
        let now = Instant::now();
        if let Some((_, expires_at)) = entries.get(&order_id)
            && *expires_at > now
        {
            return Ok(false);
        }
        entries.insert(order_id, (items.to_vec(), now + self.ttl));
        Ok(true)
    }

    async fn get(&self, order_id: OrderId) -> Result<Option<Vec<ReservedItem>>> {
        let entries = self.entries.read().await;
        Ok(entries
            .get(&order_id)
            .filter(|(_, expires_at)| *expires_at > Instant::now())
            .map(|(items, _)| items.clone()))
    }

    async fn delete(&self, order_id: OrderId) -> Result<()> {
        self.entries.write().await.remove(&order_id);
        Ok(())
    }
}
