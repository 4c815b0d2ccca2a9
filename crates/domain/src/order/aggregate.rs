//! Order aggregate implementation.

use chrono::{DateTime, Utc};
use common::{AggregateType, Money, OrderId, ReservedItem, UserId};
use serde::{Deserialize, Serialize};

use crate::aggregate::Aggregate;

use super::{OrderError, OrderEvent, OrderLine, OrderStatus, OrderTrigger, Transition};

/// Order aggregate root.
///
/// Lives in the order service. Saga events drive it through
/// [`OrderStatus`]; the owner may cancel it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    id: OrderId,
    user_id: UserId,
    status: OrderStatus,
    lines: Vec<OrderLine>,
    total: Money,

    /// Current version for optimistic concurrency.
    #[serde(default)]
    version: i64,

    /// Last failure or escalation reason, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    failure_reason: Option<String>,

    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl Aggregate for Order {
    type Event = OrderEvent;
    type Error = OrderError;

    fn aggregate_type() -> AggregateType {
        AggregateType::Order
    }

    fn version(&self) -> i64 {
        self.version
    }

    fn set_version(&mut self, version: i64) {
        self.version = version;
    }

    fn apply(&mut self, event: &Self::Event) {
        match event {
            OrderEvent::Placed {
                user_id,
                lines,
                total,
                at,
                ..
            } => {
                self.user_id = *user_id;
                self.lines = lines.clone();
                self.total = *total;
                self.status = OrderStatus::Pending;
                self.created_at = *at;
            }
            OrderEvent::PaymentConfirmed { .. } => self.status = OrderStatus::Paid,
            OrderEvent::StockConfirmed { .. } => self.status = OrderStatus::Confirmed,
            OrderEvent::PaymentRejected { reason, .. } | OrderEvent::StockRejected { reason, .. } => {
                self.status = OrderStatus::Failed;
                self.failure_reason = Some(reason.clone());
            }
            OrderEvent::Cancelled { .. } => self.status = OrderStatus::Cancelled,
            OrderEvent::EscalatedToManualCheck { reason, .. } => {
                self.status = OrderStatus::ManualCheck;
                self.failure_reason = Some(reason.clone());
            }
        }
        self.updated_at = event.occurred_at();
    }
}

// Query methods
impl Order {
    pub fn id(&self) -> OrderId {
        self.id
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    pub fn status(&self) -> OrderStatus {
        self.status
    }

    pub fn lines(&self) -> &[OrderLine] {
        &self.lines
    }

    pub fn total(&self) -> Money {
        self.total
    }

    pub fn failure_reason(&self) -> Option<&str> {
        self.failure_reason.as_deref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    /// Units and quantities the order reserved.
    pub fn reserved_items(&self) -> Vec<ReservedItem> {
        self.lines.iter().map(OrderLine::reserved_item).collect()
    }

    pub fn is_owned_by(&self, user_id: UserId) -> bool {
        self.user_id == user_id
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

// Command methods (return events)
impl Order {
    /// Places a new order over already reserved lines.
    ///
    /// Returns the order in PENDING with the events that created it.
    pub fn place(
        order_id: OrderId,
        user_id: UserId,
        lines: Vec<OrderLine>,
    ) -> Result<(Self, Vec<OrderEvent>), OrderError> {
        if lines.is_empty() {
            return Err(OrderError::NoLines);
        }
        for line in &lines {
            if line.quantity == 0 {
                return Err(OrderError::InvalidQuantity {
                    key: line.key.clone(),
                    quantity: line.quantity,
                });
            }
            if !line.unit_price.is_positive() {
                return Err(OrderError::InvalidPrice {
                    key: line.key.clone(),
                    price: line.unit_price.cents(),
                });
            }
        }

        let now = Utc::now();
        let total = lines.iter().map(OrderLine::total_price).sum();
        let mut order = Order {
            id: order_id,
            user_id,
            status: OrderStatus::Pending,
            lines: Vec::new(),
            total: Money::zero(),
            version: 0,
            failure_reason: None,
            created_at: now,
            updated_at: now,
        };
        let events = order.commit(vec![OrderEvent::Placed {
            order_id,
            user_id,
            lines,
            total,
            at: now,
        }]);
        Ok((order, events))
    }

    /// PAYMENT_COMPLETED arrived.
    pub fn confirm_payment(&self) -> Result<Vec<OrderEvent>, OrderError> {
        self.step(OrderTrigger::PaymentCompleted, |order_id, _, at| {
            OrderEvent::PaymentConfirmed { order_id, at }
        })
    }

    /// STOCK_DEDUCTED arrived.
    pub fn confirm_stock(&self) -> Result<Vec<OrderEvent>, OrderError> {
        self.step(OrderTrigger::StockDeducted, |order_id, user_id, at| {
            OrderEvent::StockConfirmed {
                order_id,
                user_id,
                at,
            }
        })
    }

    /// PAYMENT_FAILED arrived.
    pub fn reject_payment(&self, reason: impl Into<String>) -> Result<Vec<OrderEvent>, OrderError> {
        let reason = reason.into();
        self.step(OrderTrigger::PaymentFailed, |order_id, _, at| {
            OrderEvent::PaymentRejected {
                order_id,
                reason,
                at,
            }
        })
    }

    /// STOCK_DEDUCTION_FAILED arrived.
    pub fn reject_stock(&self, reason: impl Into<String>) -> Result<Vec<OrderEvent>, OrderError> {
        let reason = reason.into();
        self.step(OrderTrigger::StockDeductionFailed, |order_id, _, at| {
            OrderEvent::StockRejected {
                order_id,
                reason,
                at,
            }
        })
    }

    /// The owner cancels the order.
    pub fn cancel(&self, reason: Option<String>) -> Result<Vec<OrderEvent>, OrderError> {
        self.step(OrderTrigger::UserCancel, |order_id, user_id, at| {
            OrderEvent::Cancelled {
                order_id,
                user_id,
                reason,
                at,
            }
        })
    }

    /// REFUND_FAILED arrived.
    pub fn escalate(&self, reason: impl Into<String>) -> Result<Vec<OrderEvent>, OrderError> {
        let reason = reason.into();
        self.step(OrderTrigger::RefundFailed, |order_id, _, at| {
            OrderEvent::EscalatedToManualCheck {
                order_id,
                reason,
                at,
            }
        })
    }

    /// Empty when the trigger was already applied.
    fn step(
        &self,
        trigger: OrderTrigger,
        event: impl FnOnce(OrderId, UserId, DateTime<Utc>) -> OrderEvent,
    ) -> Result<Vec<OrderEvent>, OrderError> {
        match self.status.transition(trigger)? {
            Transition::To(_) => Ok(vec![event(self.id, self.user_id, Utc::now())]),
            Transition::AlreadyApplied => Ok(Vec::new()),
        }
    }
}
