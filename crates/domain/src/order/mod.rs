//! Order aggregate and related types.

mod aggregate;
mod events;
mod state;
mod value_objects;

pub use aggregate::Order;
pub use events::OrderEvent;
pub use state::{OrderStatus, OrderTrigger, Transition};
pub use value_objects::OrderLine;

use common::StockKey;
use thiserror::Error;

/// Errors that can occur during order operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OrderError {
    /// Order is not in a status that allows the action.
    #[error("Invalid state transition: cannot {action} from {from} state")]
    InvalidTransition {
        from: OrderStatus,
        action: &'static str,
    },

    /// Order has no lines.
    #[error("Order has no items")]
    NoLines,

    /// Invalid quantity.
    #[error("Invalid quantity for {key}: {quantity} (must be greater than 0)")]
    InvalidQuantity { key: StockKey, quantity: u32 },

    /// Invalid price.
    #[error("Invalid price for {key}: {price} (must be greater than 0)")]
    InvalidPrice { key: StockKey, price: i64 },
}
