//! Order fulfillment saga participants.
//!
//! Each participant owns its local state, writes the events it announces to
//! its outbox in the same commit, and reacts to the other participants'
//! events through a [`message_bus::HandlerRegistry`]:
//!
//! - [`order`]: checkout, cancel, and the order state machine
//! - [`payment`]: payment per order, gateway behind a circuit breaker, refunds
//! - [`inventory`]: reservations in the stock ledger, durable deduction and restore
//! - [`cart`]: cart cleanup after confirmation or account deletion
//!
//! There is no coordinator; compensation happens by each participant
//! reacting to the failure events of the others.

pub mod cart;
mod error;
pub mod inventory;
mod outbound;
pub mod order;
pub mod payment;
mod principal;
pub mod repository;

use sqlx::PgPool;

pub use error::{Result, SagaError};
pub use outbound::new_trace_id;
pub use principal::Principal;
pub use repository::{InMemoryRepository, PostgresRepository, Repository, Stored};

/// Applies the workspace migrations.
pub async fn run_migrations(pool: &PgPool) -> std::result::Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("../../migrations").run(pool).await
}
