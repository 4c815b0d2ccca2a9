//! Shared types for the order fulfillment saga.
//!
//! Every participant speaks the same wire schema: an [`EventEnvelope`] whose
//! payload is one of the [`payload`] bodies.

pub mod envelope;
pub mod payload;
mod types;

pub use envelope::{
    AggregateType, EnvelopeError, EventEnvelope, EventEnvelopeBuilder, EventType, SCHEMA_VERSION,
};
pub use payload::EventPayload;
pub use types::{
    EventId, Money, OrderId, ProductId, ReservedItem, ServiceTag, StockKey, UserId, VariantId,
};
