//! Payment aggregate.

mod aggregate;
mod events;
mod state;

pub use aggregate::Payment;
pub use events::PaymentEvent;
pub use state::PaymentStatus;

use common::{Money, OrderId};
use thiserror::Error;

/// Errors that can occur during payment operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PaymentError {
    #[error("Invalid state transition: cannot {action} from {from} state")]
    InvalidTransition {
        from: PaymentStatus,
        action: &'static str,
    },

    #[error("Amount mismatch: expected {expected}, got {actual}")]
    AmountMismatch { expected: Money, actual: Money },

    #[error("Invalid amount: {0} (must be greater than 0)")]
    InvalidAmount(Money),

    #[error("Paid payment for order {0} has no payment key")]
    MissingPaymentKey(OrderId),

    /// The gateway is unreachable or the circuit is open.
    #[error("Payment gateway unavailable: {0}")]
    GatewayUnavailable(String),
}
