//! Transactional outbox.
//!
//! A participant writes an [`OutboxRecord`] in the same local commit as the
//! state change it announces; the [`OutboxRelay`] later publishes it. This
//! gives at-least-once, per-aggregate ordered delivery without a distributed
//! transaction.

mod error;
mod memory;
mod postgres;
mod record;
mod relay;
mod store;

pub use error::{OutboxError, Result};
pub use memory::InMemoryOutboxStore;
pub use postgres::{PostgresOutboxStore, insert_in_tx};
pub use record::{NewOutboxRecord, OutboxRecord, OutboxStatus};
pub use relay::{OutboxRelay, RelayConfig, RelayReport};
pub use store::OutboxStore;
