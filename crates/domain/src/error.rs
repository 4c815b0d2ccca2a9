//! Domain error types.

use thiserror::Error;

use crate::order::OrderError;
use crate::payment::PaymentError;

/// Errors that can occur during domain operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DomainError {
    /// An error occurred in the order aggregate.
    #[error("Order error: {0}")]
    Order(#[from] OrderError),

    /// An error occurred in the payment aggregate.
    #[error("Payment error: {0}")]
    Payment(#[from] PaymentError),
}

impl DomainError {
    /// True when the command was rejected because of the aggregate's status.
    pub fn is_invalid_transition(&self) -> bool {
        matches!(
            self,
            DomainError::Order(OrderError::InvalidTransition { .. })
                | DomainError::Payment(PaymentError::InvalidTransition { .. })
        )
    }
}
