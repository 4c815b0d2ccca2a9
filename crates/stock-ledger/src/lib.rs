//! Stock reservation primitives.
//!
//! - [`StockLedger`]: atomic per-unit counters (reserve, release, sync)
//! - [`ReservationMap`]: which items each order reserved, TTL-bounded
//!
//! Both come in an in-memory flavour for tests and a Redis flavour for
//! deployments.

mod error;
mod ledger;
mod mapping;
mod memory;
mod redis_store;

use std::time::Duration;

pub use error::{LedgerError, Result};
pub use ledger::StockLedger;
pub use mapping::ReservationMap;
pub use memory::{InMemoryReservationMap, InMemoryStockLedger};
pub use redis_store::{RedisReservationMap, RedisStockLedger};

/// Default lifetime of an order's reservation mapping.
pub const DEFAULT_RESERVATION_TTL: Duration = Duration::from_secs(60 * 60);
