//! Message bus client for the saga.
//!
//! The bus is byte-level ([`MessagePublisher`], [`MessageSource`]); the
//! [`EventConsumer`] runtime layers envelope decoding, handler routing,
//! retries and dead-lettering on top.

pub mod bus;
pub mod consumer;
mod error;
#[cfg(feature = "kafka")]
pub mod kafka;
mod memory;
mod retry;

pub use bus::{Headers, Message, MessagePublisher, MessageSource, PublishReceipt};
pub use consumer::{EventConsumer, EventHandler, FnHandler, HandlerRegistry, Outcome};
pub use error::{BusError, HandlerError, Result};
#[cfg(feature = "kafka")]
pub use kafka::{KafkaPublisher, KafkaSource};
pub use memory::{InMemoryMessageBus, InMemorySource};
pub use retry::RetryPolicy;

/// Topic every saga participant publishes to and consumes from.
pub const DEFAULT_EVENT_TOPIC: &str = "saga-events";

/// Where records that could not be handled end up.
pub const DEFAULT_DEAD_LETTER_TOPIC: &str = "saga-events.DLT";
