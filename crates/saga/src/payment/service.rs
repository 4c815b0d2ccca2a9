use std::sync::Arc;

use common::payload::{OrderCancelled, OrderCreated, StockDeductionFailed};
use common::{EventEnvelope, Money, OrderId, ServiceTag};
use domain::{Payment, PaymentError, PaymentStatus};
use serde::{Deserialize, Serialize};

use super::gateway::{ApprovalRequest, GatewayError, PaymentGateway};
use crate::outbound::new_trace_id;
use crate::principal::Principal;
use crate::repository::{Repository, persist};
use crate::{Result, SagaError};

/// The buyer's confirmation of an authorized charge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmPayment {
    pub order_id: OrderId,
    pub payment_key: String,
    pub amount: Money,
}

/// The payment participant.
pub struct PaymentService {
    repository: Arc<dyn Repository<Payment>>,
    gateway: Arc<dyn PaymentGateway>,
}

impl PaymentService {
    pub fn new(repository: Arc<dyn Repository<Payment>>, gateway: Arc<dyn PaymentGateway>) -> Self {
        Self {
            repository,
            gateway,
        }
    }

    /// ORDER_CREATED: open a READY payment for the order's total.
    #[tracing::instrument(skip(self, envelope), fields(event_id = %envelope.event_id))]
    pub async fn on_order_created(&self, envelope: EventEnvelope) -> Result<()> {
        let event: OrderCreated = envelope.decode_payload()?;
        if self.repository.get(event.order_id).await?.is_some() {
            tracing::debug!(order_id = %event.order_id, "payment already opened");
            return Ok(());
        }
        let (mut payment, _) = Payment::request(event.order_id, event.user_id, event.total_amount)?;
        match self.repository.save(&mut payment, Vec::new()).await {
            // Lost a race with a redelivery of the same event.
            Err(SagaError::Conflict { .. }) => Ok(()),
            other => other,
        }?;
        tracing::info!(order_id = %event.order_id, amount = %event.total_amount, "payment ready");
        Ok(())
    }

    /// Captures the charge. A decline fails the payment; an unreachable
    /// gateway changes nothing.
    #[tracing::instrument(skip(self, request, trace_id), fields(order_id = %request.order_id))]
    pub async fn confirm(
        &self,
        principal: &Principal,
        request: ConfirmPayment,
        trace_id: Option<String>,
    ) -> Result<Payment> {
        let mut payment = self.load(principal, request.order_id).await?;
        payment.ensure_confirmable(request.amount)?;

        let approval = ApprovalRequest {
            payment_key: request.payment_key.clone(),
            order_id: request.order_id,
            amount: request.amount,
        };
        let events = match self.gateway.approve(&approval).await {
            Ok(approved) => payment.approve(approved.payment_key)?,
            Err(GatewayError::Declined { code, message }) => {
                tracing::warn!(order_id = %request.order_id, %code, %message, "payment declined");
                payment.decline(code, message)?
            }
            Err(GatewayError::Unavailable(reason)) => {
                tracing::warn!(order_id = %request.order_id, %reason, "payment gateway unavailable");
                return Err(PaymentError::GatewayUnavailable(reason).into());
            }
        };

        let trace_id = trace_id.unwrap_or_else(new_trace_id);
        persist(
            self.repository.as_ref(),
            &mut payment,
            events,
            ServiceTag::Payment,
            Some(&trace_id),
        )
        .await?;
        tracing::info!(order_id = %request.order_id, status = %payment.status(), "payment confirmed");
        Ok(payment)
    }

    /// Human-triggered refund of a PAID payment.
    #[tracing::instrument(skip(self, trace_id))]
    pub async fn refund(
        &self,
        principal: &Principal,
        order_id: OrderId,
        trace_id: Option<String>,
    ) -> Result<Payment> {
        let mut payment = self.load(principal, order_id).await?;
        let trace_id = trace_id.unwrap_or_else(new_trace_id);
        self.refund_payment(&mut payment, "refund requested", Some(&trace_id))
            .await?;
        Ok(payment)
    }

    pub async fn get(&self, principal: &Principal, order_id: OrderId) -> Result<Payment> {
        self.load(principal, order_id).await
    }

    async fn load(&self, principal: &Principal, order_id: OrderId) -> Result<Payment> {
        let payment = self
            .repository
            .get(order_id)
            .await?
            .ok_or_else(|| SagaError::not_found("payment", order_id))?;
        if !principal.can_access(payment.user_id()) {
            return Err(SagaError::Forbidden {
                what: "payment",
                id: order_id.to_string(),
            });
        }
        Ok(payment)
    }

    /// Calls the gateway and records the outcome. A refusal is recorded as
    /// REFUND_FAILED; unavailability is returned as an error.
    async fn refund_payment(
        &self,
        payment: &mut Payment,
        reason: &str,
        trace_id: Option<&str>,
    ) -> Result<()> {
        let order_id = payment.order_id();
        let payment_key = payment.ensure_refundable()?.to_string();

        let events = match self.gateway.cancel(&payment_key, reason).await {
            Ok(()) => payment.refund_succeeded()?,
            Err(GatewayError::Declined { code, message }) => {
                tracing::error!(%order_id, %code, %message, "refund refused by gateway");
                payment.refund_failed(format!("{code}: {message}"))?
            }
            Err(GatewayError::Unavailable(reason)) => {
                return Err(PaymentError::GatewayUnavailable(reason).into());
            }
        };
        persist(
            self.repository.as_ref(),
            payment,
            events,
            ServiceTag::Payment,
            trace_id,
        )
        .await?;
        tracing::info!(%order_id, status = %payment.status(), "refund recorded");
        Ok(())
    }

    /// STOCK_DEDUCTION_FAILED: the goods are gone, give the money back.
    #[tracing::instrument(skip(self, envelope), fields(event_id = %envelope.event_id))]
    pub async fn on_stock_deduction_failed(&self, envelope: EventEnvelope) -> Result<()> {
        let event: StockDeductionFailed = envelope.decode_payload()?;
        let Some(mut payment) = self.repository.get(event.order_id).await? else {
            tracing::warn!(order_id = %event.order_id, "no payment for failed deduction, skipping");
            return Ok(());
        };
        if payment.status() != PaymentStatus::Paid {
            tracing::info!(order_id = %event.order_id, status = %payment.status(), "nothing to refund");
            return Ok(());
        }
        self.refund_payment(&mut payment, "stock deduction failed", envelope.trace_id.as_deref())
            .await
    }

    /// ORDER_CANCELLED: refund a captured payment, void an open one.
    #[tracing::instrument(skip(self, envelope), fields(event_id = %envelope.event_id))]
    pub async fn on_order_cancelled(&self, envelope: EventEnvelope) -> Result<()> {
        let event: OrderCancelled = envelope.decode_payload()?;
        let order_id = event.order_id;
        let Some(mut payment) = self.repository.get(order_id).await? else {
            tracing::warn!(%order_id, "no payment for cancelled order, skipping");
            return Ok(());
        };
        let reason = event.reason.as_deref().unwrap_or("order cancelled");

        match payment.status() {
            PaymentStatus::Paid => {
                self.refund_payment(&mut payment, reason, envelope.trace_id.as_deref())
                    .await
            }
            PaymentStatus::Ready => {
                let events = payment.void(reason)?;
                persist(
                    self.repository.as_ref(),
                    &mut payment,
                    events,
                    ServiceTag::Payment,
                    envelope.trace_id.as_deref(),
                )
                .await?;
                tracing::info!(%order_id, "open payment voided");
                Ok(())
            }
            PaymentStatus::Cancelled | PaymentStatus::Failed => {
                tracing::debug!(%order_id, status = %payment.status(), "nothing to compensate");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use common::payload::ItemFailure;
    use common::{EventPayload, EventType, ReservedItem, StockKey, UserId};
    use domain::Aggregate;
    use outbox::InMemoryOutboxStore;

    use super::*;
    use crate::payment::{Scripted, ScriptedGateway};
    use crate::repository::InMemoryRepository;

    struct Fixture {
        service: PaymentService,
        gateway: ScriptedGateway,
        outbox: InMemoryOutboxStore,
        owner: Principal,
        order_id: OrderId,
    }

    fn envelope(payload: EventPayload) -> EventEnvelope {
        let (aggregate_type, aggregate_id) = payload.aggregate();
        EventEnvelope::builder()
            .event_type(payload.event_type())
            .aggregate(aggregate_type, aggregate_id)
            .producer(ServiceTag::Order.as_str())
            .trace_id(Some("trace-3".to_string()))
            .payload_raw(payload.encode().unwrap())
            .build()
            .unwrap()
    }

    async fn fixture() -> Fixture {
        let outbox = InMemoryOutboxStore::new();
        let gateway = ScriptedGateway::new();
        let service = PaymentService::new(
            Arc::new(InMemoryRepository::<Payment>::new(outbox.clone())),
            Arc::new(gateway.clone()),
        );
        let user_id = UserId::new();
        let order_id = OrderId::new();
        service
            .on_order_created(envelope(EventPayload::OrderCreated(OrderCreated {
                order_id,
                user_id,
                items: vec![ReservedItem::new(StockKey::product("SKU-1"), 2)],
                total_amount: Money::from_cents(2000),
            })))
            .await
            .unwrap();
        Fixture {
            service,
            gateway,
            outbox,
            owner: Principal::user(user_id),
            order_id,
        }
    }

    fn confirm(order_id: OrderId, cents: i64) -> ConfirmPayment {
        ConfirmPayment {
            order_id,
            payment_key: "pk-1".to_string(),
            amount: Money::from_cents(cents),
        }
    }

    #[tokio::test]
    async fn test_order_created_opens_one_ready_payment() {
        let f = fixture().await;
        let created = envelope(EventPayload::OrderCreated(OrderCreated {
            order_id: f.order_id,
            user_id: f.owner.user_id().unwrap(),
            items: Vec::new(),
            total_amount: Money::from_cents(2000),
        }));
        f.service.on_order_created(created).await.unwrap();

        let payment = f.service.get(&f.owner, f.order_id).await.unwrap();
        assert_eq!(payment.status(), PaymentStatus::Ready);
        assert_eq!(payment.version(), 1);
        assert!(f.outbox.is_empty().await);
    }

    #[tokio::test]
    async fn test_confirm_pays_and_announces() {
        let f = fixture().await;
        let payment = f
            .service
            .confirm(&f.owner, confirm(f.order_id, 2000), Some("t-1".to_string()))
            .await
            .unwrap();

        assert_eq!(payment.status(), PaymentStatus::Paid);
        assert_eq!(payment.payment_key(), Some("pk-1"));
        let written = f.outbox.all().await;
        assert_eq!(written[0].event_type, EventType::PaymentCompleted);
        assert_eq!(written[0].trace_id.as_deref(), Some("t-1"));
    }

    #[tokio::test]
    async fn test_amount_mismatch_changes_nothing() {
        let f = fixture().await;
        let err = f
            .service
            .confirm(&f.owner, confirm(f.order_id, 1999), None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SagaError::Domain(domain::DomainError::Payment(PaymentError::AmountMismatch { .. }))
        ));
        assert!(f.outbox.is_empty().await);
    }

    #[tokio::test]
    async fn test_decline_fails_the_payment() {
        let f = fixture().await;
        f.gateway
            .script_approve(Scripted::Fail(GatewayError::declined("REJECT_CARD", "declined")))
            .await;
        let payment = f
            .service
            .confirm(&f.owner, confirm(f.order_id, 2000), None)
            .await
            .unwrap();

        assert_eq!(payment.status(), PaymentStatus::Failed);
        assert_eq!(f.outbox.all().await[0].event_type, EventType::PaymentFailed);
    }

    #[tokio::test]
    async fn test_unavailable_gateway_leaves_payment_ready() {
        let f = fixture().await;
        f.gateway
            .script_approve(Scripted::Fail(GatewayError::Unavailable("circuit open".to_string())))
            .await;
        let err = f
            .service
            .confirm(&f.owner, confirm(f.order_id, 2000), None)
            .await
            .unwrap_err();

        assert!(err.is_transient());
        let payment = f.service.get(&f.owner, f.order_id).await.unwrap();
        assert_eq!(payment.status(), PaymentStatus::Ready);
        assert!(f.outbox.is_empty().await);
    }

    #[tokio::test]
    async fn test_strangers_cannot_confirm() {
        let f = fixture().await;
        let err = f
            .service
            .confirm(&Principal::user(UserId::new()), confirm(f.order_id, 2000), None)
            .await
            .unwrap_err();
        assert!(matches!(err, SagaError::Forbidden { .. }));
    }

    #[tokio::test]
    async fn test_refund_failure_stays_paid_and_announces() {
        let f = fixture().await;
        f.service
            .confirm(&f.owner, confirm(f.order_id, 2000), None)
            .await
            .unwrap();
        f.gateway
            .script_cancel(Scripted::Fail(GatewayError::declined("NOT_CANCELABLE", "settled")))
            .await;

        let payment = f
            .service
            .refund(&Principal::Operator, f.order_id, None)
            .await
            .unwrap();

        assert_eq!(payment.status(), PaymentStatus::Paid);
        assert_eq!(payment.refund_failure_reason(), Some("NOT_CANCELABLE: settled"));
        assert_eq!(f.outbox.all().await[1].event_type, EventType::RefundFailed);
    }

    #[tokio::test]
    async fn test_refund_of_failed_payment_has_no_side_effects() {
        let f = fixture().await;
        f.gateway
            .script_approve(Scripted::Fail(GatewayError::declined("REJECT_CARD", "declined")))
            .await;
        f.service
            .confirm(&f.owner, confirm(f.order_id, 2000), None)
            .await
            .unwrap();
        let before = f.service.get(&f.owner, f.order_id).await.unwrap();

        let err = f
            .service
            .refund(&f.owner, f.order_id, None)
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            SagaError::Domain(domain::DomainError::Payment(PaymentError::InvalidTransition {
                from: PaymentStatus::Failed,
                ..
            }))
        ));
        assert_eq!(f.service.get(&f.owner, f.order_id).await.unwrap(), before);
        assert!(f.gateway.cancelled().await.is_empty());
        assert_eq!(f.outbox.len().await, 1);
    }

    #[tokio::test]
    async fn test_deduction_failure_refunds_a_paid_payment() {
        let f = fixture().await;
        f.service
            .confirm(&f.owner, confirm(f.order_id, 2000), None)
            .await
            .unwrap();
        let failed = envelope(EventPayload::StockDeductionFailed(StockDeductionFailed {
            order_id: f.order_id,
            failures: vec![ItemFailure {
                key: None,
                reason: "mapping not found".to_string(),
            }],
        }));

        f.service.on_stock_deduction_failed(failed.clone()).await.unwrap();
        f.service.on_stock_deduction_failed(failed).await.unwrap();

        let payment = f.service.get(&f.owner, f.order_id).await.unwrap();
        assert_eq!(payment.status(), PaymentStatus::Cancelled);
        assert_eq!(f.gateway.cancelled().await, vec!["pk-1".to_string()]);
        let written = f.outbox.all().await;
        assert_eq!(written.len(), 2);
        assert_eq!(written[1].event_type, EventType::RefundSucceeded);
        assert_eq!(written[1].trace_id.as_deref(), Some("trace-3"));
    }

    #[tokio::test]
    async fn test_cancellation_voids_an_open_payment() {
        let f = fixture().await;
        let cancelled = envelope(EventPayload::OrderCancelled(OrderCancelled {
            order_id: f.order_id,
            user_id: f.owner.user_id().unwrap(),
            reason: None,
        }));

        f.service.on_order_cancelled(cancelled).await.unwrap();

        let payment = f.service.get(&f.owner, f.order_id).await.unwrap();
        assert_eq!(payment.status(), PaymentStatus::Failed);
        assert!(f.outbox.is_empty().await);
        assert!(f.gateway.cancelled().await.is_empty());
    }

    #[tokio::test]
    async fn test_unavailable_gateway_during_compensation_is_transient() {
        let f = fixture().await;
        f.service
            .confirm(&f.owner, confirm(f.order_id, 2000), None)
            .await
            .unwrap();
        f.gateway
            .script_cancel(Scripted::Fail(GatewayError::Unavailable("timeout".to_string())))
            .await;
        let cancelled = envelope(EventPayload::OrderCancelled(OrderCancelled {
            order_id: f.order_id,
            user_id: f.owner.user_id().unwrap(),
            reason: None,
        }));

        let err = f.service.on_order_cancelled(cancelled).await.unwrap_err();

        assert!(err.is_transient());
        let payment = f.service.get(&f.owner, f.order_id).await.unwrap();
        assert_eq!(payment.status(), PaymentStatus::Paid);
    }
}
