//! Order state machine.

use serde::{Deserialize, Serialize};

use super::OrderError;

/// The status of an order in the saga.
///
/// State transitions:
/// ```text
///            PAYMENT_COMPLETED         STOCK_DEDUCTED
/// Pending ───────────────────► Paid ─────────────────► Confirmed
///    │ PAYMENT_FAILED            │ STOCK_DEDUCTION_FAILED    │
///    └──────────► Failed ◄───────┘                           │
/// Pending | Paid | Confirmed ── user cancel ──► Cancelled ◄──┘
/// Pending | Paid | Failed ── REFUND_FAILED ──► ManualCheck
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    /// Stock reserved, waiting for payment.
    #[default]
    Pending,

    /// Payment approved, waiting for stock deduction.
    Paid,

    /// Stock deducted. Terminal for the happy path.
    Confirmed,

    /// Payment or stock deduction failed.
    Failed,

    /// Cancelled by the user (terminal state).
    Cancelled,

    /// A refund failed; needs a human (terminal state).
    ManualCheck,
}

/// What drives an order transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OrderTrigger {
    PaymentCompleted,
    StockDeducted,
    PaymentFailed,
    StockDeductionFailed,
    UserCancel,
    RefundFailed,
}

impl OrderTrigger {
    pub const ALL: [OrderTrigger; 6] = [
        OrderTrigger::PaymentCompleted,
        OrderTrigger::StockDeducted,
        OrderTrigger::PaymentFailed,
        OrderTrigger::StockDeductionFailed,
        OrderTrigger::UserCancel,
        OrderTrigger::RefundFailed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderTrigger::PaymentCompleted => "payment completed",
            OrderTrigger::StockDeducted => "stock deducted",
            OrderTrigger::PaymentFailed => "payment failed",
            OrderTrigger::StockDeductionFailed => "stock deduction failed",
            OrderTrigger::UserCancel => "cancel",
            OrderTrigger::RefundFailed => "refund failed",
        }
    }
}

/// Result of checking a trigger against the current status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Move to the given status.
    To(OrderStatus),
    /// The trigger was already applied; nothing to do.
    AlreadyApplied,
}

impl OrderStatus {
    pub const ALL: [OrderStatus; 6] = [
        OrderStatus::Pending,
        OrderStatus::Paid,
        OrderStatus::Confirmed,
        OrderStatus::Failed,
        OrderStatus::Cancelled,
        OrderStatus::ManualCheck,
    ];

    /// Checks `trigger` against the transition table.
    ///
    /// Event redeliveries that find the order already in the target status
    /// are no-ops. A user cancel of a cancelled order is a new request, not a
    /// redelivery, and is rejected.
    pub fn transition(self, trigger: OrderTrigger) -> Result<Transition, OrderError> {
        use OrderStatus::*;
        use OrderTrigger::*;

        let outcome = match (self, trigger) {
            (Pending, PaymentCompleted) => Transition::To(Paid),
            (Paid, PaymentCompleted) => Transition::AlreadyApplied,

            (Paid, StockDeducted) => Transition::To(Confirmed),
            (Confirmed, StockDeducted) => Transition::AlreadyApplied,

            (Pending, PaymentFailed) => Transition::To(Failed),
            (Paid, StockDeductionFailed) => Transition::To(Failed),
            (Failed, PaymentFailed | StockDeductionFailed) => Transition::AlreadyApplied,

            (Pending | Paid | Confirmed, UserCancel) => Transition::To(Cancelled),

            (Pending | Paid | Failed, RefundFailed) => Transition::To(ManualCheck),
            (ManualCheck, RefundFailed) => Transition::AlreadyApplied,

            (from, trigger) => {
                return Err(OrderError::InvalidTransition {
                    from,
                    action: trigger.as_str(),
                });
            }
        };
        Ok(outcome)
    }

    /// Returns true if the user may still cancel.
    pub fn can_cancel(&self) -> bool {
        matches!(
            self,
            OrderStatus::Pending | OrderStatus::Paid | OrderStatus::Confirmed
        )
    }

    /// Returns true if no saga event moves the order any more.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Confirmed | OrderStatus::Cancelled | OrderStatus::ManualCheck
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "PENDING",
            OrderStatus::Paid => "PAID",
            OrderStatus::Confirmed => "CONFIRMED",
            OrderStatus::Failed => "FAILED",
            OrderStatus::Cancelled => "CANCELLED",
            OrderStatus::ManualCheck => "MANUAL_CHECK",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        OrderStatus::ALL.into_iter().find(|status| status.as_str() == s)
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
