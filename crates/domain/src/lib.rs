//! Domain layer of the order fulfillment saga.
//!
//! This crate provides:
//! - `Aggregate` and `DomainEvent` traits for state-stored aggregates
//! - the Order aggregate with its status transition table
//! - the Payment aggregate
//!
//! Aggregates never touch storage. Commands return the events they produce;
//! the saga participants persist the new state together with the
//! integration events derived from them.

pub mod aggregate;
pub mod error;
pub mod order;
pub mod payment;

pub use aggregate::{Aggregate, DomainEvent, integration_events};
pub use error::DomainError;
pub use order::{Order, OrderError, OrderEvent, OrderLine, OrderStatus, OrderTrigger, Transition};
pub use payment::{Payment, PaymentError, PaymentEvent, PaymentStatus};
