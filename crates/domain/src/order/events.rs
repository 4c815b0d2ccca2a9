//! Order domain events.

use chrono::{DateTime, Utc};
use common::payload::{OrderCancelled, OrderConfirmed, OrderCreated};
use common::{EventPayload, Money, OrderId, UserId};
use serde::{Deserialize, Serialize};

use crate::aggregate::DomainEvent;

use super::OrderLine;

/// Facts recorded by the order aggregate.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum OrderEvent {
    /// Order was placed after its stock was reserved.
    Placed {
        order_id: OrderId,
        user_id: UserId,
        lines: Vec<OrderLine>,
        total: Money,
        at: DateTime<Utc>,
    },

    /// The payment service charged the order.
    PaymentConfirmed { order_id: OrderId, at: DateTime<Utc> },

    /// Inventory durably deducted the stock.
    StockConfirmed {
        order_id: OrderId,
        user_id: UserId,
        at: DateTime<Utc>,
    },

    /// The payment was declined.
    PaymentRejected {
        order_id: OrderId,
        reason: String,
        at: DateTime<Utc>,
    },

    /// Inventory could not deduct the stock.
    StockRejected {
        order_id: OrderId,
        reason: String,
        at: DateTime<Utc>,
    },

    /// The owner cancelled the order.
    Cancelled {
        order_id: OrderId,
        user_id: UserId,
        reason: Option<String>,
        at: DateTime<Utc>,
    },

    /// A refund failed and the order needs a human.
    EscalatedToManualCheck {
        order_id: OrderId,
        reason: String,
        at: DateTime<Utc>,
    },
}

impl OrderEvent {
    pub fn order_id(&self) -> OrderId {
        match self {
            OrderEvent::Placed { order_id, .. }
            | OrderEvent::PaymentConfirmed { order_id, .. }
            | OrderEvent::StockConfirmed { order_id, .. }
            | OrderEvent::PaymentRejected { order_id, .. }
            | OrderEvent::StockRejected { order_id, .. }
            | OrderEvent::Cancelled { order_id, .. }
            | OrderEvent::EscalatedToManualCheck { order_id, .. } => *order_id,
        }
    }

    pub fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            OrderEvent::Placed { at, .. }
            | OrderEvent::PaymentConfirmed { at, .. }
            | OrderEvent::StockConfirmed { at, .. }
            | OrderEvent::PaymentRejected { at, .. }
            | OrderEvent::StockRejected { at, .. }
            | OrderEvent::Cancelled { at, .. }
            | OrderEvent::EscalatedToManualCheck { at, .. } => *at,
        }
    }
}

impl DomainEvent for OrderEvent {
    fn event_type(&self) -> &'static str {
        match self {
            OrderEvent::Placed { .. } => "OrderPlaced",
            OrderEvent::PaymentConfirmed { .. } => "OrderPaymentConfirmed",
            OrderEvent::StockConfirmed { .. } => "OrderStockConfirmed",
            OrderEvent::PaymentRejected { .. } => "OrderPaymentRejected",
            OrderEvent::StockRejected { .. } => "OrderStockRejected",
            OrderEvent::Cancelled { .. } => "OrderCancelled",
            OrderEvent::EscalatedToManualCheck { .. } => "OrderEscalatedToManualCheck",
        }
    }

    fn integration_event(&self) -> Option<EventPayload> {
        match self {
            OrderEvent::Placed {
                order_id,
                user_id,
                lines,
                total,
                ..
            } => Some(EventPayload::OrderCreated(OrderCreated {
                order_id: *order_id,
                user_id: *user_id,
                items: lines.iter().map(OrderLine::reserved_item).collect(),
                total_amount: *total,
            })),
            OrderEvent::StockConfirmed {
                order_id, user_id, ..
            } => Some(EventPayload::OrderConfirmed(OrderConfirmed {
                order_id: *order_id,
                user_id: *user_id,
            })),
            OrderEvent::Cancelled {
                order_id,
                user_id,
                reason,
                ..
            } => Some(EventPayload::OrderCancelled(OrderCancelled {
                order_id: *order_id,
                user_id: *user_id,
                reason: reason.clone(),
            })),
            OrderEvent::PaymentConfirmed { .. }
            | OrderEvent::PaymentRejected { .. }
            | OrderEvent::StockRejected { .. }
            | OrderEvent::EscalatedToManualCheck { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use common::{EventType, StockKey};

    use super::*;

    #[test]
    fn test_placed_announces_order_created() {
        let order_id = OrderId::new();
        let event = OrderEvent::Placed {
            order_id,
            user_id: UserId::new(),
            lines: vec![OrderLine::new(
                StockKey::product("SKU-1"),
                "Widget",
                2,
                Money::from_cents(500),
            )],
            total: Money::from_cents(1000),
            at: Utc::now(),
        };

        let Some(EventPayload::OrderCreated(created)) = event.integration_event() else {
            panic!("expected ORDER_CREATED");
        };
        assert_eq!(created.order_id, order_id);
        assert_eq!(created.items.len(), 1);
        assert_eq!(created.items[0].quantity, 2);
        assert_eq!(created.total_amount, Money::from_cents(1000));
    }

    #[test]
    fn test_internal_transitions_are_not_announced() {
        let event = OrderEvent::PaymentConfirmed {
            order_id: OrderId::new(),
            at: Utc::now(),
        };
        assert!(event.integration_event().is_none());
        assert_eq!(event.event_type(), "OrderPaymentConfirmed");
    }

    #[test]
    fn test_cancelled_carries_reason() {
        let event = OrderEvent::Cancelled {
            order_id: OrderId::new(),
            user_id: UserId::new(),
            reason: Some("changed my mind".to_string()),
            at: Utc::now(),
        };
        let payload = event.integration_event().unwrap();
        assert_eq!(payload.event_type(), EventType::OrderCancelled);
    }
}
