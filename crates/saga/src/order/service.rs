use std::sync::Arc;

use common::payload::{
    PaymentCompleted, PaymentFailed, RefundFailed, StockDeducted, StockDeductionFailed,
};
use common::{EventEnvelope, OrderId, ReservedItem, ServiceTag};
use domain::{Order, OrderError, OrderEvent, OrderLine};
use serde::{Deserialize, Serialize};

use super::inventory_client::InventoryClient;
use crate::outbound::new_trace_id;
use crate::principal::Principal;
use crate::repository::{Repository, persist};
use crate::{Result, SagaError};

/// What the buyer wants to buy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckoutRequest {
    pub items: Vec<ReservedItem>,
}

/// The order participant.
pub struct OrderService {
    repository: Arc<dyn Repository<Order>>,
    inventory: Arc<dyn InventoryClient>,
}

impl OrderService {
    pub fn new(repository: Arc<dyn Repository<Order>>, inventory: Arc<dyn InventoryClient>) -> Self {
        Self {
            repository,
            inventory,
        }
    }

    /// Prices the items from the catalogue, reserves them, and writes the
    /// PENDING order with its ORDER_CREATED event.
    ///
    /// Fails synchronously if anything is unknown or out of stock. If the
    /// order cannot be written the reservation is given back.
    #[tracing::instrument(skip(self, request, trace_id))]
    pub async fn checkout(
        &self,
        principal: &Principal,
        request: CheckoutRequest,
        trace_id: Option<String>,
    ) -> Result<Order> {
        let Some(user_id) = principal.user_id() else {
            return Err(SagaError::InvalidRequest(
                "checkout needs a buyer".to_string(),
            ));
        };
        if request.items.is_empty() {
            return Err(OrderError::NoLines.into());
        }

        let infos = self.inventory.product_info(&request.items).await?;
        if infos.len() != request.items.len() {
            return Err(SagaError::Integrity(format!(
                "asked about {} units, inventory answered {}",
                request.items.len(),
                infos.len()
            )));
        }
        let mut lines = Vec::with_capacity(infos.len());
        for (item, info) in request.items.iter().zip(infos) {
            let (true, Some(name), Some(price)) = (info.found, info.name, info.unit_price) else {
                return Err(SagaError::UnknownUnit(item.key.clone()));
            };
            lines.push(OrderLine::new(item.key.clone(), name, item.quantity, price));
        }

        let order_id = OrderId::new();
        let (mut order, events) = Order::place(order_id, user_id, lines)?;
        let trace_id = trace_id.unwrap_or_else(new_trace_id);

        if let Err(err) = self.inventory.reserve(order_id, &order.reserved_items()).await {
            metrics::counter!("saga_checkouts_total", "outcome" => "rejected").increment(1);
            tracing::warn!(%order_id, error = %err, "reservation refused");
            return Err(err);
        }

        // Placing already applied the events; only the outbox is left to build.
        let outbox = crate::outbound::records(
            ServiceTag::Order,
            &domain::integration_events(&events),
            Some(&trace_id),
        )?;
        if let Err(err) = self.repository.save(&mut order, outbox).await {
            metrics::counter!("saga_checkouts_total", "outcome" => "failed").increment(1);
            tracing::error!(%order_id, error = %err, "order write failed, releasing reservation");
            if let Err(release) = self.inventory.release(order_id).await {
                tracing::error!(%order_id, error = %release, "reservation release failed");
            }
            return Err(err);
        }

        metrics::counter!("saga_checkouts_total", "outcome" => "placed").increment(1);
        tracing::info!(%order_id, %user_id, total = %order.total(), %trace_id, "order placed");
        Ok(order)
    }

    /// The owner (or an operator) cancels the order.
    #[tracing::instrument(skip(self, reason, trace_id))]
    pub async fn cancel(
        &self,
        principal: &Principal,
        order_id: OrderId,
        reason: Option<String>,
        trace_id: Option<String>,
    ) -> Result<Order> {
        let mut order = self.load(principal, order_id).await?;
        let events = order.cancel(reason)?;
        let trace_id = trace_id.unwrap_or_else(new_trace_id);
        persist(
            self.repository.as_ref(),
            &mut order,
            events,
            ServiceTag::Order,
            Some(&trace_id),
        )
        .await?;
        tracing::info!(%order_id, "order cancelled");
        Ok(order)
    }

    /// Status polling.
    pub async fn get(&self, principal: &Principal, order_id: OrderId) -> Result<Order> {
        self.load(principal, order_id).await
    }

    async fn load(&self, principal: &Principal, order_id: OrderId) -> Result<Order> {
        let order = self
            .repository
            .get(order_id)
            .await?
            .ok_or_else(|| SagaError::not_found("order", order_id))?;
        if !principal.can_access(order.user_id()) {
            return Err(SagaError::Forbidden {
                what: "order",
                id: order_id.to_string(),
            });
        }
        Ok(order)
    }

    /// Runs an event-driven command against a stored order.
    ///
    /// An unknown order is skipped; a redelivered event is a no-op.
    async fn advance<F>(&self, order_id: OrderId, envelope: &EventEnvelope, command: F) -> Result<()>
    where
        F: FnOnce(&Order) -> std::result::Result<Vec<OrderEvent>, OrderError>,
    {
        let Some(mut order) = self.repository.get(order_id).await? else {
            tracing::warn!(%order_id, event_type = %envelope.event_type, "event for unknown order, skipping");
            return Ok(());
        };
        let events = command(&order)?;
        if events.is_empty() {
            tracing::debug!(%order_id, status = %order.status(), "already applied");
            return Ok(());
        }
        persist(
            self.repository.as_ref(),
            &mut order,
            events,
            ServiceTag::Order,
            envelope.trace_id.as_deref(),
        )
        .await?;
        tracing::info!(%order_id, status = %order.status(), "order advanced");
        Ok(())
    }

    pub async fn on_payment_completed(&self, envelope: EventEnvelope) -> Result<()> {
        let event: PaymentCompleted = envelope.decode_payload()?;
        self.advance(event.order_id, &envelope, Order::confirm_payment)
            .await
    }

    pub async fn on_stock_deducted(&self, envelope: EventEnvelope) -> Result<()> {
        let event: StockDeducted = envelope.decode_payload()?;
        self.advance(event.order_id, &envelope, Order::confirm_stock)
            .await
    }

    pub async fn on_payment_failed(&self, envelope: EventEnvelope) -> Result<()> {
        let event: PaymentFailed = envelope.decode_payload()?;
        let reason = format!("{}: {}", event.failure_code, event.failure_message);
        self.advance(event.order_id, &envelope, |order| order.reject_payment(reason))
            .await
    }

    pub async fn on_stock_deduction_failed(&self, envelope: EventEnvelope) -> Result<()> {
        let event: StockDeductionFailed = envelope.decode_payload()?;
        let reason = event
            .failures
            .iter()
            .map(|f| f.reason.as_str())
            .collect::<Vec<_>>()
            .join("; ");
        self.advance(event.order_id, &envelope, |order| order.reject_stock(reason))
            .await
    }

    pub async fn on_refund_failed(&self, envelope: EventEnvelope) -> Result<()> {
        let event: RefundFailed = envelope.decode_payload()?;
        tracing::error!(order_id = %event.order_id, reason = %event.reason, "refund failed, order needs manual check");
        self.advance(event.order_id, &envelope, |order| order.escalate(event.reason))
            .await
    }
}
