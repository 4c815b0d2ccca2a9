//! Typed bodies of the saga events.

use serde::{Deserialize, Serialize};

use crate::envelope::{AggregateType, EnvelopeError, EventEnvelope, EventType};
use crate::types::{Money, OrderId, ReservedItem, StockKey, UserId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderCreated {
    pub order_id: OrderId,
    pub user_id: UserId,
    pub items: Vec<ReservedItem>,
    pub total_amount: Money,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentCompleted {
    pub order_id: OrderId,
    pub user_id: UserId,
    pub payment_key: String,
    pub amount: Money,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentFailed {
    pub order_id: OrderId,
    pub user_id: UserId,
    pub failure_code: String,
    pub failure_message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StockDeducted {
    pub order_id: OrderId,
    pub items: Vec<ReservedItem>,
}

/// Why one unit (or the whole order, when `key` is absent) could not be deducted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemFailure {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<StockKey>,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StockDeductionFailed {
    pub order_id: OrderId,
    pub failures: Vec<ItemFailure>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderConfirmed {
    pub order_id: OrderId,
    pub user_id: UserId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderCancelled {
    pub order_id: OrderId,
    pub user_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefundSucceeded {
    pub order_id: OrderId,
    pub payment_key: String,
    pub amount: Money,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefundFailed {
    pub order_id: OrderId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payment_key: Option<String>,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserDeleted {
    pub user_id: UserId,
}

/// Any event body a participant can emit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventPayload {
    OrderCreated(OrderCreated),
    PaymentCompleted(PaymentCompleted),
    PaymentFailed(PaymentFailed),
    StockDeducted(StockDeducted),
    StockDeductionFailed(StockDeductionFailed),
    OrderConfirmed(OrderConfirmed),
    OrderCancelled(OrderCancelled),
    RefundSucceeded(RefundSucceeded),
    RefundFailed(RefundFailed),
    UserDeleted(UserDeleted),
}

impl EventPayload {
    pub fn event_type(&self) -> EventType {
        match self {
            EventPayload::OrderCreated(_) => EventType::OrderCreated,
            EventPayload::PaymentCompleted(_) => EventType::PaymentCompleted,
            EventPayload::PaymentFailed(_) => EventType::PaymentFailed,
            EventPayload::StockDeducted(_) => EventType::StockDeducted,
            EventPayload::StockDeductionFailed(_) => EventType::StockDeductionFailed,
            EventPayload::OrderConfirmed(_) => EventType::OrderConfirmed,
            EventPayload::OrderCancelled(_) => EventType::OrderCancelled,
            EventPayload::RefundSucceeded(_) => EventType::RefundSucceeded,
            EventPayload::RefundFailed(_) => EventType::RefundFailed,
            EventPayload::UserDeleted(_) => EventType::UserDeleted,
        }
    }

    /// Aggregate type and id the event is filed under.
    ///
    /// Everything but user events is keyed by order id so that one order's
    /// events share a partition, whichever service emits them.
    pub fn aggregate(&self) -> (AggregateType, String) {
        match self {
            EventPayload::OrderCreated(p) => (AggregateType::Order, p.order_id.to_string()),
            EventPayload::OrderConfirmed(p) => (AggregateType::Order, p.order_id.to_string()),
            EventPayload::OrderCancelled(p) => (AggregateType::Order, p.order_id.to_string()),
            EventPayload::PaymentCompleted(p) => (AggregateType::Payment, p.order_id.to_string()),
            EventPayload::PaymentFailed(p) => (AggregateType::Payment, p.order_id.to_string()),
            EventPayload::RefundSucceeded(p) => (AggregateType::Payment, p.order_id.to_string()),
            EventPayload::RefundFailed(p) => (AggregateType::Payment, p.order_id.to_string()),
            EventPayload::StockDeducted(p) => (AggregateType::Product, p.order_id.to_string()),
            EventPayload::StockDeductionFailed(p) => {
                (AggregateType::Product, p.order_id.to_string())
            }
            EventPayload::UserDeleted(p) => (AggregateType::User, p.user_id.to_string()),
        }
    }

    /// Decodes the body of `envelope` by its event type.
    ///
    /// Returns `None` for event types this build does not know.
    pub fn decode(envelope: &EventEnvelope) -> Result<Option<Self>, EnvelopeError> {
        let payload = match &envelope.event_type {
            EventType::OrderCreated => EventPayload::OrderCreated(envelope.decode_payload()?),
            EventType::PaymentCompleted => {
                EventPayload::PaymentCompleted(envelope.decode_payload()?)
            }
            EventType::PaymentFailed => EventPayload::PaymentFailed(envelope.decode_payload()?),
            EventType::StockDeducted => EventPayload::StockDeducted(envelope.decode_payload()?),
            EventType::StockDeductionFailed => {
                EventPayload::StockDeductionFailed(envelope.decode_payload()?)
            }
            EventType::OrderConfirmed => EventPayload::OrderConfirmed(envelope.decode_payload()?),
            EventType::OrderCancelled => EventPayload::OrderCancelled(envelope.decode_payload()?),
            EventType::RefundSucceeded => {
                EventPayload::RefundSucceeded(envelope.decode_payload()?)
            }
            EventType::RefundFailed => EventPayload::RefundFailed(envelope.decode_payload()?),
            EventType::UserDeleted => EventPayload::UserDeleted(envelope.decode_payload()?),
            EventType::Other(_) => return Ok(None),
        };
        Ok(Some(payload))
    }

    /// Serializes the body into the envelope's payload string.
    pub fn encode(&self) -> Result<String, EnvelopeError> {
        let body = match self {
            EventPayload::OrderCreated(p) => serde_json::to_string(p),
            EventPayload::PaymentCompleted(p) => serde_json::to_string(p),
            EventPayload::PaymentFailed(p) => serde_json::to_string(p),
            EventPayload::StockDeducted(p) => serde_json::to_string(p),
            EventPayload::StockDeductionFailed(p) => serde_json::to_string(p),
            EventPayload::OrderConfirmed(p) => serde_json::to_string(p),
            EventPayload::OrderCancelled(p) => serde_json::to_string(p),
            EventPayload::RefundSucceeded(p) => serde_json::to_string(p),
            EventPayload::RefundFailed(p) => serde_json::to_string(p),
            EventPayload::UserDeleted(p) => serde_json::to_string(p),
        }?;
        Ok(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ServiceTag;

    #[test]
    fn test_stock_events_are_keyed_by_order() {
        let order_id = OrderId::new();
        let payload = EventPayload::StockDeductionFailed(StockDeductionFailed {
            order_id,
            failures: vec![ItemFailure {
                key: None,
                reason: "mapping not found".to_string(),
            }],
        });

        let (aggregate_type, aggregate_id) = payload.aggregate();
        assert_eq!(aggregate_type, AggregateType::Product);
        assert_eq!(aggregate_id, order_id.to_string());
        assert_eq!(payload.event_type(), EventType::StockDeductionFailed);
    }

    #[test]
    fn test_encoded_payload_decodes_from_envelope() {
        let created = OrderCreated {
            order_id: OrderId::new(),
            user_id: UserId::new(),
            items: vec![ReservedItem::new(StockKey::product("SKU-X"), 2)],
            total_amount: Money::from_cents(2000),
        };
        let payload = EventPayload::OrderCreated(created.clone());

        let envelope = EventEnvelope::builder()
            .event_type(payload.event_type())
            .aggregate(AggregateType::Order, created.order_id)
            .producer(ServiceTag::Order.as_str())
            .payload_raw(payload.encode().unwrap())
            .build()
            .unwrap();

        let decoded: OrderCreated = envelope.decode_payload().unwrap();
        assert_eq!(decoded, created);
        assert!(envelope.payload.contains("\"totalAmount\":2000"));
    }

    #[test]
    fn test_unknown_types_decode_to_none() {
        let envelope = EventEnvelope::builder()
            .event_type(EventType::parse("COUPON_ISSUED"))
            .aggregate(AggregateType::User, "u-1")
            .producer("coupon-service")
            .payload_raw("{}")
            .build()
            .unwrap();
        assert!(EventPayload::decode(&envelope).unwrap().is_none());
    }

    #[test]
    fn test_malformed_body_is_an_error() {
        let envelope = EventEnvelope::builder()
            .event_type(EventType::PaymentCompleted)
            .aggregate(AggregateType::Payment, "o-1")
            .producer(ServiceTag::Payment.as_str())
            .payload_raw(r#"{"orderId":"not-a-uuid"}"#)
            .build()
            .unwrap();
        assert!(EventPayload::decode(&envelope).is_err());
    }
}
