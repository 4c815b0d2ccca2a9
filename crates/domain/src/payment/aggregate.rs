use chrono::{DateTime, Utc};
use common::{AggregateType, Money, OrderId, UserId};
use serde::{Deserialize, Serialize};

use crate::aggregate::Aggregate;

use super::{PaymentError, PaymentEvent, PaymentStatus};

/// Payment aggregate, one per order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Payment {
    order_id: OrderId,
    user_id: UserId,
    amount: Money,
    status: PaymentStatus,

    /// Gateway reference, set once approved.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    payment_key: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    failure_code: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    failure_reason: Option<String>,

    /// Why the last refund attempt failed. The payment stays PAID.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    refund_failure_reason: Option<String>,

    #[serde(default)]
    version: i64,

    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl Aggregate for Payment {
    type Event = PaymentEvent;
    type Error = PaymentError;

    fn aggregate_type() -> AggregateType {
        AggregateType::Payment
    }

    fn version(&self) -> i64 {
        self.version
    }

    fn set_version(&mut self, version: i64) {
        self.version = version;
    }

    fn apply(&mut self, event: &Self::Event) {
        match event {
            PaymentEvent::Requested {
                user_id,
                amount,
                at,
                ..
            } => {
                self.user_id = *user_id;
                self.amount = *amount;
                self.status = PaymentStatus::Ready;
                self.created_at = *at;
            }
            PaymentEvent::Approved { payment_key, .. } => {
                self.status = PaymentStatus::Paid;
                self.payment_key = Some(payment_key.clone());
            }
            PaymentEvent::Declined { code, message, .. } => {
                self.status = PaymentStatus::Failed;
                self.failure_code = Some(code.clone());
                self.failure_reason = Some(message.clone());
            }
            PaymentEvent::Refunded { .. } => {
                self.status = PaymentStatus::Cancelled;
                self.refund_failure_reason = None;
            }
            PaymentEvent::RefundRejected { reason, .. } => {
                self.refund_failure_reason = Some(reason.clone());
            }
            PaymentEvent::Voided { reason, .. } => {
                self.status = PaymentStatus::Failed;
                self.failure_reason = Some(reason.clone());
            }
        }
        self.updated_at = event.occurred_at();
    }
}

impl Payment {
    pub fn order_id(&self) -> OrderId {
        self.order_id
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    pub fn amount(&self) -> Money {
        self.amount
    }

    pub fn status(&self) -> PaymentStatus {
        self.status
    }

    pub fn payment_key(&self) -> Option<&str> {
        self.payment_key.as_deref()
    }

    pub fn failure_code(&self) -> Option<&str> {
        self.failure_code.as_deref()
    }

    pub fn failure_reason(&self) -> Option<&str> {
        self.failure_reason.as_deref()
    }

    pub fn refund_failure_reason(&self) -> Option<&str> {
        self.refund_failure_reason.as_deref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }
}

impl Payment {
    /// Opens a READY payment for an order.
    pub fn request(
        order_id: OrderId,
        user_id: UserId,
        amount: Money,
    ) -> Result<(Self, Vec<PaymentEvent>), PaymentError> {
        if !amount.is_positive() {
            return Err(PaymentError::InvalidAmount(amount));
        }
        let now = Utc::now();
        let mut payment = Payment {
            order_id,
            user_id,
            amount: Money::zero(),
            status: PaymentStatus::Ready,
            payment_key: None,
            failure_code: None,
            failure_reason: None,
            refund_failure_reason: None,
            version: 0,
            created_at: now,
            updated_at: now,
        };
        let events = payment.commit(vec![PaymentEvent::Requested {
            order_id,
            user_id,
            amount,
            at: now,
        }]);
        Ok((payment, events))
    }

    /// Checks a confirm request before the gateway is called.
    pub fn ensure_confirmable(&self, amount: Money) -> Result<(), PaymentError> {
        if !self.status.can_confirm() {
            return Err(self.invalid("confirm"));
        }
        if amount != self.amount {
            return Err(PaymentError::AmountMismatch {
                expected: self.amount,
                actual: amount,
            });
        }
        Ok(())
    }

    /// The gateway approved the charge.
    pub fn approve(&self, payment_key: impl Into<String>) -> Result<Vec<PaymentEvent>, PaymentError> {
        if !self.status.can_confirm() {
            return Err(self.invalid("approve"));
        }
        Ok(vec![PaymentEvent::Approved {
            order_id: self.order_id,
            user_id: self.user_id,
            payment_key: payment_key.into(),
            amount: self.amount,
            at: Utc::now(),
        }])
    }

    /// The gateway declined the charge.
    pub fn decline(
        &self,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Result<Vec<PaymentEvent>, PaymentError> {
        if !self.status.can_confirm() {
            return Err(self.invalid("decline"));
        }
        Ok(vec![PaymentEvent::Declined {
            order_id: self.order_id,
            user_id: self.user_id,
            code: code.into(),
            message: message.into(),
            at: Utc::now(),
        }])
    }

    /// Checks a refund before the gateway is called; returns the key to refund.
    pub fn ensure_refundable(&self) -> Result<&str, PaymentError> {
        if !self.status.can_refund() {
            return Err(self.invalid("refund"));
        }
        self.payment_key
            .as_deref()
            .ok_or(PaymentError::MissingPaymentKey(self.order_id))
    }

    pub fn refund_succeeded(&self) -> Result<Vec<PaymentEvent>, PaymentError> {
        let payment_key = self.ensure_refundable()?.to_string();
        Ok(vec![PaymentEvent::Refunded {
            order_id: self.order_id,
            payment_key,
            amount: self.amount,
            at: Utc::now(),
        }])
    }

    /// Records a refused refund; the payment stays PAID.
    pub fn refund_failed(&self, reason: impl Into<String>) -> Result<Vec<PaymentEvent>, PaymentError> {
        let payment_key = self.ensure_refundable()?.to_string();
        Ok(vec![PaymentEvent::RefundRejected {
            order_id: self.order_id,
            payment_key: Some(payment_key),
            reason: reason.into(),
            at: Utc::now(),
        }])
    }

    /// Drops a READY payment whose order was cancelled.
    pub fn void(&self, reason: impl Into<String>) -> Result<Vec<PaymentEvent>, PaymentError> {
        if !self.status.can_void() {
            return Err(self.invalid("void"));
        }
        Ok(vec![PaymentEvent::Voided {
            order_id: self.order_id,
            reason: reason.into(),
            at: Utc::now(),
        }])
    }

    fn invalid(&self, action: &'static str) -> PaymentError {
        PaymentError::InvalidTransition {
            from: self.status,
            action,
        }
    }
}

#[cfg(test)]
mod tests {
    use common::EventPayload;

    use super::*;
    use crate::aggregate::integration_events;

    fn ready() -> Payment {
        Payment::request(OrderId::new(), UserId::new(), Money::from_cents(2000))
            .unwrap()
            .0
    }

    fn paid() -> Payment {
        let mut payment = ready();
        let events = payment.approve("pk-1").unwrap();
        payment.commit(events);
        payment
    }

    #[test]
    fn test_request_opens_ready_payment_without_announcing() {
        let (payment, events) =
            Payment::request(OrderId::new(), UserId::new(), Money::from_cents(2000)).unwrap();
        assert_eq!(payment.status(), PaymentStatus::Ready);
        assert_eq!(payment.amount(), Money::from_cents(2000));
        assert!(integration_events(&events).is_empty());
    }

    #[test]
    fn test_request_rejects_non_positive_amount() {
        assert!(matches!(
            Payment::request(OrderId::new(), UserId::new(), Money::zero()),
            Err(PaymentError::InvalidAmount(_))
        ));
    }

    #[test]
    fn test_confirm_checks_amount() {
        let payment = ready();
        assert!(payment.ensure_confirmable(Money::from_cents(2000)).is_ok());
        assert!(matches!(
            payment.ensure_confirmable(Money::from_cents(1999)),
            Err(PaymentError::AmountMismatch { .. })
        ));
    }

    #[test]
    fn test_approve_announces_payment_completed() {
        let payment = ready();
        let events = payment.approve("pk-1").unwrap();
        let announced = integration_events(&events);
        let [EventPayload::PaymentCompleted(completed)] = &announced[..] else {
            panic!("expected PAYMENT_COMPLETED");
        };
        assert_eq!(completed.payment_key, "pk-1");
        assert_eq!(completed.amount, Money::from_cents(2000));
    }

    #[test]
    fn test_paid_cannot_be_confirmed_again() {
        let payment = paid();
        assert_eq!(payment.status(), PaymentStatus::Paid);
        assert!(matches!(
            payment.ensure_confirmable(Money::from_cents(2000)),
            Err(PaymentError::InvalidTransition {
                from: PaymentStatus::Paid,
                ..
            })
        ));
    }

    #[test]
    fn test_decline_records_code_and_message() {
        let mut payment = ready();
        let events = payment.decline("REJECT_CARD", "card declined").unwrap();
        let announced = integration_events(&events);
        payment.commit(events);

        assert_eq!(payment.status(), PaymentStatus::Failed);
        assert_eq!(payment.failure_code(), Some("REJECT_CARD"));
        assert!(matches!(announced[..], [EventPayload::PaymentFailed(_)]));
    }

    #[test]
    fn test_refund_success_cancels() {
        let mut payment = paid();
        let events = payment.refund_succeeded().unwrap();
        payment.commit(events);
        assert_eq!(payment.status(), PaymentStatus::Cancelled);
        assert!(payment.refund_succeeded().is_err());
    }

    #[test]
    fn test_refund_failure_stays_paid() {
        let mut payment = paid();
        let events = payment.refund_failed("gateway refused").unwrap();
        let announced = integration_events(&events);
        payment.commit(events);

        assert_eq!(payment.status(), PaymentStatus::Paid);
        assert_eq!(payment.refund_failure_reason(), Some("gateway refused"));
        assert!(matches!(announced[..], [EventPayload::RefundFailed(_)]));
    }

    #[test]
    fn test_refund_of_failed_payment_is_rejected() {
        let mut payment = ready();
        let events = payment.decline("REJECT_CARD", "card declined").unwrap();
        payment.commit(events);
        let before = payment.clone();

        assert!(matches!(
            payment.ensure_refundable(),
            Err(PaymentError::InvalidTransition {
                from: PaymentStatus::Failed,
                action: "refund"
            })
        ));
        assert!(payment.refund_failed("x").is_err());
        assert_eq!(payment, before);
    }

    #[test]
    fn test_void_only_from_ready() {
        let mut payment = ready();
        let events = payment.void("order cancelled").unwrap();
        assert!(integration_events(&events).is_empty());
        payment.commit(events);
        assert_eq!(payment.status(), PaymentStatus::Failed);

        assert!(paid().void("order cancelled").is_err());
    }
}
