use chrono::{DateTime, Utc};
use common::payload::{PaymentCompleted, PaymentFailed, RefundFailed, RefundSucceeded};
use common::{EventPayload, Money, OrderId, UserId};
use serde::{Deserialize, Serialize};

use crate::aggregate::DomainEvent;

/// Facts recorded by the payment aggregate.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum PaymentEvent {
    Requested {
        order_id: OrderId,
        user_id: UserId,
        amount: Money,
        at: DateTime<Utc>,
    },
    Approved {
        order_id: OrderId,
        user_id: UserId,
        payment_key: String,
        amount: Money,
        at: DateTime<Utc>,
    },
    Declined {
        order_id: OrderId,
        user_id: UserId,
        code: String,
        message: String,
        at: DateTime<Utc>,
    },
    Refunded {
        order_id: OrderId,
        payment_key: String,
        amount: Money,
        at: DateTime<Utc>,
    },
    RefundRejected {
        order_id: OrderId,
        payment_key: Option<String>,
        reason: String,
        at: DateTime<Utc>,
    },
    /// An unconfirmed payment was dropped because its order went away.
    Voided {
        order_id: OrderId,
        reason: String,
        at: DateTime<Utc>,
    },
}

impl PaymentEvent {
    pub fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            PaymentEvent::Requested { at, .. }
            | PaymentEvent::Approved { at, .. }
            | PaymentEvent::Declined { at, .. }
            | PaymentEvent::Refunded { at, .. }
            | PaymentEvent::RefundRejected { at, .. }
            | PaymentEvent::Voided { at, .. } => *at,
        }
    }
}

impl DomainEvent for PaymentEvent {
    fn event_type(&self) -> &'static str {
        match self {
            PaymentEvent::Requested { .. } => "PaymentRequested",
            PaymentEvent::Approved { .. } => "PaymentApproved",
            PaymentEvent::Declined { .. } => "PaymentDeclined",
            PaymentEvent::Refunded { .. } => "PaymentRefunded",
            PaymentEvent::RefundRejected { .. } => "PaymentRefundRejected",
            PaymentEvent::Voided { .. } => "PaymentVoided",
        }
    }

    fn integration_event(&self) -> Option<EventPayload> {
        match self {
            PaymentEvent::Approved {
                order_id,
                user_id,
                payment_key,
                amount,
                ..
            } => Some(EventPayload::PaymentCompleted(PaymentCompleted {
                order_id: *order_id,
                user_id: *user_id,
                payment_key: payment_key.clone(),
                amount: *amount,
            })),
            PaymentEvent::Declined {
                order_id,
                user_id,
                code,
                message,
                ..
            } => Some(EventPayload::PaymentFailed(PaymentFailed {
                order_id: *order_id,
                user_id: *user_id,
                failure_code: code.clone(),
                failure_message: message.clone(),
            })),
            PaymentEvent::Refunded {
                order_id,
                payment_key,
                amount,
                ..
            } => Some(EventPayload::RefundSucceeded(RefundSucceeded {
                order_id: *order_id,
                payment_key: payment_key.clone(),
                amount: *amount,
            })),
            PaymentEvent::RefundRejected {
                order_id,
                payment_key,
                reason,
                ..
            } => Some(EventPayload::RefundFailed(RefundFailed {
                order_id: *order_id,
                payment_key: payment_key.clone(),
                reason: reason.clone(),
            })),
            PaymentEvent::Requested { .. } | PaymentEvent::Voided { .. } => None,
        }
    }
}
