//! The event envelope shared by every saga participant.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

use crate::types::{EventId, ServiceTag};

/// Current envelope schema version.
pub const SCHEMA_VERSION: i32 = 1;

/// Errors raised while building or decoding envelopes.
#[derive(Debug, Error)]
pub enum EnvelopeError {
    /// A required builder field was not set.
    #[error("Missing envelope field: {0}")]
    MissingField(&'static str),

    /// The envelope or its payload could not be (de)serialized.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Saga event types.
///
/// Unknown names survive decoding as [`EventType::Other`] so that a consumer
/// can acknowledge and skip events added by newer producers.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventType {
    OrderCreated,
    PaymentCompleted,
    PaymentFailed,
    StockDeducted,
    StockDeductionFailed,
    OrderConfirmed,
    OrderCancelled,
    RefundSucceeded,
    RefundFailed,
    UserDeleted,
    Other(String),
}

impl EventType {
    pub fn as_str(&self) -> &str {
        match self {
            EventType::OrderCreated => "ORDER_CREATED",
            EventType::PaymentCompleted => "PAYMENT_COMPLETED",
            EventType::PaymentFailed => "PAYMENT_FAILED",
            EventType::StockDeducted => "STOCK_DEDUCTED",
            EventType::StockDeductionFailed => "STOCK_DEDUCTION_FAILED",
            EventType::OrderConfirmed => "ORDER_CONFIRMED",
            EventType::OrderCancelled => "ORDER_CANCELLED",
            EventType::RefundSucceeded => "REFUND_SUCCEEDED",
            EventType::RefundFailed => "REFUND_FAILED",
            EventType::UserDeleted => "USER_DELETED",
            EventType::Other(name) => name,
        }
    }

    pub fn parse(name: &str) -> Self {
        match name {
            "ORDER_CREATED" => EventType::OrderCreated,
            "PAYMENT_COMPLETED" => EventType::PaymentCompleted,
            "PAYMENT_FAILED" => EventType::PaymentFailed,
            "STOCK_DEDUCTED" => EventType::StockDeducted,
            "STOCK_DEDUCTION_FAILED" => EventType::StockDeductionFailed,
            "ORDER_CONFIRMED" => EventType::OrderConfirmed,
            "ORDER_CANCELLED" => EventType::OrderCancelled,
            "REFUND_SUCCEEDED" => EventType::RefundSucceeded,
            "REFUND_FAILED" => EventType::RefundFailed,
            "USER_DELETED" => EventType::UserDeleted,
            other => EventType::Other(other.to_string()),
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for EventType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for EventType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        Ok(EventType::parse(&name))
    }
}

/// Kind of aggregate an event is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AggregateType {
    Order,
    Payment,
    Product,
    User,
}

impl AggregateType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AggregateType::Order => "ORDER",
            AggregateType::Payment => "PAYMENT",
            AggregateType::Product => "PRODUCT",
            AggregateType::User => "USER",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "ORDER" => Some(AggregateType::Order),
            "PAYMENT" => Some(AggregateType::Payment),
            "PRODUCT" => Some(AggregateType::Product),
            "USER" => Some(AggregateType::User),
            _ => None,
        }
    }
}

impl std::fmt::Display for AggregateType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Wire form of a saga event.
///
/// `aggregate_id` doubles as the partition key on the bus, so every event
/// about one order is consumed in the order it was sent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope {
    pub event_id: EventId,
    pub event_type: EventType,
    pub aggregate_type: AggregateType,
    pub aggregate_id: String,
    pub occurred_at: DateTime<Utc>,
    pub producer: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    pub version: i32,
    /// Type-specific body, serialized as a JSON string.
    pub payload: String,
}

impl EventEnvelope {
    pub fn builder() -> EventEnvelopeBuilder {
        EventEnvelopeBuilder::default()
    }

    /// Returns true if `service` emitted this event.
    pub fn is_from(&self, service: ServiceTag) -> bool {
        self.producer == service.as_str()
    }

    /// Decodes the payload string into `T`.
    pub fn decode_payload<T: DeserializeOwned>(&self) -> Result<T, EnvelopeError> {
        Ok(serde_json::from_str(&self.payload)?)
    }

    /// Serializes the envelope to the bytes sent on the bus.
    pub fn to_bytes(&self) -> Result<Vec<u8>, EnvelopeError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Builder for [`EventEnvelope`].
#[derive(Debug, Default)]
pub struct EventEnvelopeBuilder {
    event_id: Option<EventId>,
    event_type: Option<EventType>,
    aggregate_type: Option<AggregateType>,
    aggregate_id: Option<String>,
    occurred_at: Option<DateTime<Utc>>,
    producer: Option<String>,
    trace_id: Option<String>,
    version: Option<i32>,
    payload: Option<String>,
}

impl EventEnvelopeBuilder {
    /// Sets the event ID. A fresh one is generated if not set.
    pub fn event_id(mut self, id: EventId) -> Self {
        self.event_id = Some(id);
        self
    }

    pub fn event_type(mut self, event_type: EventType) -> Self {
        self.event_type = Some(event_type);
        self
    }

    pub fn aggregate(mut self, aggregate_type: AggregateType, id: impl ToString) -> Self {
        self.aggregate_type = Some(aggregate_type);
        self.aggregate_id = Some(id.to_string());
        self
    }

    /// Sets the occurrence time. Defaults to now.
    pub fn occurred_at(mut self, at: DateTime<Utc>) -> Self {
        self.occurred_at = Some(at);
        self
    }

    pub fn producer(mut self, producer: impl Into<String>) -> Self {
        self.producer = Some(producer.into());
        self
    }

    pub fn trace_id(mut self, trace_id: Option<String>) -> Self {
        self.trace_id = trace_id;
        self
    }

    /// Sets the schema version. Defaults to [`SCHEMA_VERSION`].
    pub fn version(mut self, version: i32) -> Self {
        self.version = Some(version);
        self
    }

    /// Serializes `payload` into the payload string.
    pub fn payload<T: Serialize>(mut self, payload: &T) -> Result<Self, EnvelopeError> {
        self.payload = Some(serde_json::to_string(payload)?);
        Ok(self)
    }

    /// Sets an already serialized payload.
    pub fn payload_raw(mut self, payload: impl Into<String>) -> Self {
        self.payload = Some(payload.into());
        self
    }

    pub fn build(self) -> Result<EventEnvelope, EnvelopeError> {
        Ok(EventEnvelope {
            event_id: self.event_id.unwrap_or_default(),
            event_type: self
                .event_type
                .ok_or(EnvelopeError::MissingField("eventType"))?,
            aggregate_type: self
                .aggregate_type
                .ok_or(EnvelopeError::MissingField("aggregateType"))?,
            aggregate_id: self
                .aggregate_id
                .ok_or(EnvelopeError::MissingField("aggregateId"))?,
            occurred_at: self.occurred_at.unwrap_or_else(Utc::now),
            producer: self.producer.ok_or(EnvelopeError::MissingField("producer"))?,
            trace_id: self.trace_id,
            version: self.version.unwrap_or(SCHEMA_VERSION),
            payload: self.payload.ok_or(EnvelopeError::MissingField("payload"))?,
        })
    }
}
