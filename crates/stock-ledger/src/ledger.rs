use std::time::Duration;

use async_trait::async_trait;
use common::StockKey;

use crate::Result;

/// Cache-resident stock counters, one per sellable unit.
///
/// Every mutation is a single atomic server-side operation. A counter is
/// never driven below zero and never deleted, only zeroed.
#[async_trait]
pub trait StockLedger: Send + Sync {
    /// Decrements the counter by `quantity` if it holds at least that much.
    ///
    /// Returns the remaining quantity. Fails with `InsufficientStock` when the
    /// counter is too low and with `KeyNotFound` when no counter exists.
    async fn reserve(&self, key: &StockKey, quantity: u32) -> Result<u64>;

    /// Increments the counter unconditionally and returns the new value.
    async fn release(&self, key: &StockKey, quantity: u32) -> Result<u64>;

    /// Increments the counter at most once per `(token, key)`.
    ///
    /// Returns false when the guard was already taken and nothing changed.
    /// Compensations pass the order id as token so redelivered events cannot
    /// release the same reservation twice.
    async fn release_once(&self, key: &StockKey, quantity: u32, token: &str) -> Result<bool>;

    /// Point-in-time read. `None` if no counter exists.
    async fn available(&self, key: &StockKey) -> Result<Option<u64>>;

    /// Sets the counter to `quantity`, creating it if needed.
    async fn sync(&self, key: &StockKey, quantity: u64) -> Result<()>;
}

/// How long a release guard outlives the reservation it protects.
pub(crate) const RELEASE_GUARD_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Key of the guard that makes `release_once` idempotent.
pub(crate) fn release_guard_key(key: &StockKey, token: &str) -> String {
    format!("stock-release:{}:{}", token, key.cache_key())
}
