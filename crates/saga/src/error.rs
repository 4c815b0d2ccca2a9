//! Saga error types.

use common::{AggregateType, EnvelopeError, OrderId, StockKey};
use domain::{DomainError, OrderError, PaymentError};
use message_bus::HandlerError;
use outbox::OutboxError;
use stock_ledger::LedgerError;
use thiserror::Error;

/// Errors that can occur in a saga participant.
#[derive(Debug, Error)]
pub enum SagaError {
    /// An aggregate rejected a command.
    #[error("Domain error: {0}")]
    Domain(#[from] DomainError),

    /// Stock ledger or reservation map failure.
    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Outbox error: {0}")]
    Outbox(#[from] OutboxError),

    /// An incoming event could not be decoded.
    #[error("Envelope error: {0}")]
    Envelope(#[from] EnvelopeError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Someone else saved the aggregate first.
    #[error("Concurrent modification of {aggregate} {id}")]
    Conflict { aggregate: AggregateType, id: OrderId },

    #[error("{what} not found: {id}")]
    NotFound { what: &'static str, id: String },

    /// The caller does not own the resource.
    #[error("Access denied to {what} {id}")]
    Forbidden { what: &'static str, id: String },

    /// The catalogue has no such unit.
    #[error("Unknown stock unit: {0}")]
    UnknownUnit(StockKey),

    /// The inventory service refused a reservation.
    #[error("Stock unavailable: {0}")]
    StockUnavailable(String),

    /// The inventory service could not be reached.
    #[error("Inventory service error: {0}")]
    Inventory(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Durable stock is corrupt or inconsistent with the ledger.
    #[error("Integrity violation: {0}")]
    Integrity(String),
}

impl From<OrderError> for SagaError {
    fn from(err: OrderError) -> Self {
        SagaError::Domain(DomainError::Order(err))
    }
}

impl From<PaymentError> for SagaError {
    fn from(err: PaymentError) -> Self {
        SagaError::Domain(DomainError::Payment(err))
    }
}

impl SagaError {
    pub(crate) fn not_found(what: &'static str, id: impl ToString) -> Self {
        SagaError::NotFound {
            what,
            id: id.to_string(),
        }
    }

    /// True if retrying the same operation may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            SagaError::Ledger(e) => e.is_transient(),
            SagaError::Outbox(OutboxError::Database(_))
            | SagaError::Database(_)
            | SagaError::Conflict { .. }
            | SagaError::Inventory(_) => true,
            SagaError::Domain(DomainError::Payment(PaymentError::GatewayUnavailable(_))) => true,
            _ => false,
        }
    }
}

impl From<SagaError> for HandlerError {
    fn from(err: SagaError) -> Self {
        if err.is_transient() {
            HandlerError::Transient(err.to_string())
        } else {
            HandlerError::Fatal(err.to_string())
        }
    }
}

/// Convenience type alias for saga results.
pub type Result<T> = std::result::Result<T, SagaError>;
