use std::sync::Arc;

use common::payload::{
    ItemFailure, OrderCancelled, PaymentCompleted, PaymentFailed, StockDeducted,
    StockDeductionFailed,
};
use common::{EventEnvelope, EventPayload, Money, OrderId, ReservedItem, ServiceTag, StockKey};
use serde::{Deserialize, Serialize};
use stock_ledger::{ReservationMap, StockLedger};

use super::store::{Deduction, SettlementOutcome, StockStore, StockUnit};
use crate::outbound::records;
use crate::{Result, SagaError};

/// Body of the bulk reserve call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReservationRequest {
    pub order_id: OrderId,
    pub items: Vec<ReservedItem>,
}

/// Body of the bulk product-info call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductInfoRequest {
    pub items: Vec<ReservedItem>,
}

/// Catalogue and stock view of one requested unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductInfo {
    pub key: StockKey,
    pub found: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit_price: Option<Money>,
    /// Durable quantity.
    pub stock: u64,
    /// Reservable quantity in the ledger, if the unit has a counter.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cached: Option<u64>,
    pub requested: u32,
    /// Whether `requested` can currently be reserved.
    pub available: bool,
}

const MAPPING_NOT_FOUND: &str = "mapping not found";

/// Folds repeated lines for the same unit into one, in first-seen order.
fn merge_lines(items: &[ReservedItem]) -> Result<Vec<ReservedItem>> {
    let mut merged: Vec<ReservedItem> = Vec::with_capacity(items.len());
    for item in items {
        match merged.iter_mut().find(|line| line.key == item.key) {
            Some(line) => {
                line.quantity = line.quantity.checked_add(item.quantity).ok_or_else(|| {
                    SagaError::InvalidRequest(format!("quantity of {} out of range", item.key))
                })?;
            }
            None => merged.push(item.clone()),
        }
    }
    Ok(merged)
}

/// The inventory participant: reservation in the ledger, confirmation and
/// compensation in the durable store.
pub struct InventoryService {
    ledger: Arc<dyn StockLedger>,
    mappings: Arc<dyn ReservationMap>,
    stock: Arc<dyn StockStore>,
}

impl InventoryService {
    pub fn new(
        ledger: Arc<dyn StockLedger>,
        mappings: Arc<dyn ReservationMap>,
        stock: Arc<dyn StockStore>,
    ) -> Self {
        Self {
            ledger,
            mappings,
            stock,
        }
    }

    /// Creates or replaces a unit and resets its counter to the durable
    /// quantity.
    #[tracing::instrument(skip(self, unit), fields(key = %unit.key))]
    pub async fn register_unit(&self, unit: StockUnit) -> Result<()> {
        let key = unit.key.clone();
        let quantity = unit.quantity;
        self.stock.upsert(unit).await?;
        self.ledger.sync(&key, quantity).await?;
        tracing::info!(%key, quantity, "stock unit registered");
        Ok(())
    }

    /// Re-syncs every durable unit into the ledger. Returns how many.
    pub async fn warm_up(&self) -> Result<usize> {
        let units = self.stock.all().await?;
        for unit in &units {
            self.ledger.sync(&unit.key, unit.quantity).await?;
        }
        tracing::info!(units = units.len(), "stock ledger warmed up");
        Ok(units.len())
    }

    pub async fn unit(&self, key: &StockKey) -> Result<Option<StockUnit>> {
        self.stock.get(key).await
    }

    pub async fn product_info(&self, items: &[ReservedItem]) -> Result<Vec<ProductInfo>> {
        let mut infos = Vec::with_capacity(items.len());
        for item in items {
            let unit = self.stock.get(&item.key).await?;
            let cached = self.ledger.available(&item.key).await?;
            infos.push(ProductInfo {
                key: item.key.clone(),
                found: unit.is_some(),
                name: unit.as_ref().map(|u| u.name.clone()),
                unit_price: unit.as_ref().map(|u| u.unit_price),
                stock: unit.as_ref().map_or(0, |u| u.quantity),
                cached,
                requested: item.quantity,
                available: cached.is_some_and(|c| c >= u64::from(item.quantity)),
            });
        }
        Ok(infos)
    }

    /// Reserves every item of an order in the ledger and remembers the
    /// reservation.
    ///
    /// Items are reserved in order; the first failure releases what this
    /// call already reserved. Reserving an order twice is a no-op.
    #[tracing::instrument(skip(self, items))]
    pub async fn reserve(&self, order_id: OrderId, items: &[ReservedItem]) -> Result<()> {
        if items.is_empty() {
            return Err(SagaError::InvalidRequest("nothing to reserve".to_string()));
        }
        if let Some(item) = items.iter().find(|item| item.quantity == 0) {
            return Err(SagaError::InvalidRequest(format!(
                "quantity of {} must be positive",
                item.key
            )));
        }
        if self.mappings.get(order_id).await?.is_some() {
            tracing::info!(%order_id, "order already reserved");
            return Ok(());
        }

        // One counter decrement and one guarded release per unit.
        let items = merge_lines(items)?;
        let mut reserved: Vec<&ReservedItem> = Vec::with_capacity(items.len());
        for item in &items {
            match self.ledger.reserve(&item.key, item.quantity).await {
                Ok(remaining) => {
                    tracing::debug!(%order_id, key = %item.key, remaining, "reserved");
                    reserved.push(item);
                }
                Err(err) => {
                    metrics::counter!("stock_reservation_failures_total").increment(1);
                    tracing::warn!(%order_id, key = %item.key, error = %err, "reservation failed");
                    self.roll_back(&reserved).await;
                    return Err(err.into());
                }
            }
        }

        match self.mappings.save(order_id, &items).await {
            Ok(true) => {}
            Ok(false) => {
                // A concurrent request for the same order won.
                tracing::warn!(%order_id, "reservation raced, undoing duplicate");
                self.roll_back(&reserved).await;
                return Ok(());
            }
            Err(err) => {
                tracing::error!(%order_id, error = %err, "saving reservation failed, rolling back");
                self.roll_back(&reserved).await;
                return Err(err.into());
            }
        }

        metrics::counter!("stock_reservations_total").increment(1);
        Ok(())
    }

    /// Undoes an order's reservation. Returns false if there was none.
    #[tracing::instrument(skip(self))]
    pub async fn release(&self, order_id: OrderId) -> Result<bool> {
        let Some(items) = self.mappings.get(order_id).await? else {
            tracing::info!(%order_id, "no reservation to release");
            return Ok(false);
        };
        self.release_once(order_id, &items).await?;
        self.mappings.delete(order_id).await?;
        Ok(true)
    }

    /// Best effort: a failed rollback leaves the counter low, never high.
    async fn roll_back(&self, reserved: &[&ReservedItem]) {
        for item in reserved {
            if let Err(err) = self.ledger.release(&item.key, item.quantity).await {
                tracing::error!(key = %item.key, quantity = item.quantity, error = %err, "rollback release failed");
            }
        }
    }

    async fn release_once(&self, order_id: OrderId, items: &[ReservedItem]) -> Result<()> {
        let token = order_id.to_string();
        for item in &merge_lines(items)? {
            if !self.ledger.release_once(&item.key, item.quantity, &token).await? {
                tracing::debug!(%order_id, key = %item.key, "already released");
            }
        }
        Ok(())
    }

    /// PAYMENT_COMPLETED: turn the reservation into a durable deduction.
    #[tracing::instrument(skip(self, envelope), fields(event_id = %envelope.event_id))]
    pub async fn on_payment_completed(&self, envelope: EventEnvelope) -> Result<()> {
        let event: PaymentCompleted = envelope.decode_payload()?;
        let order_id = event.order_id;
        let trace_id = envelope.trace_id.as_deref();
        let mapping = self.mappings.get(order_id).await?;

        if let Some(settlement) = self.stock.settlement(order_id).await? {
            tracing::info!(%order_id, outcome = settlement.outcome.as_str(), "order already settled");
            if let Some(items) = mapping {
                self.finish(order_id, settlement.outcome, &items).await?;
            }
            return Ok(());
        }

        let Some(items) = mapping else {
            tracing::warn!(%order_id, "reservation mapping not found");
            let failures = vec![ItemFailure {
                key: None,
                reason: MAPPING_NOT_FOUND.to_string(),
            }];
            let outbox = Self::failure_records(order_id, failures, trace_id)?;
            self.stock.settle_failed(order_id, MAPPING_NOT_FOUND, outbox).await?;
            return Ok(());
        };

        let deducted = EventPayload::StockDeducted(StockDeducted {
            order_id,
            items: items.clone(),
        });
        let outbox = records(ServiceTag::Inventory, &[deducted], trace_id)?;

        match self.stock.deduct(order_id, &items, outbox).await? {
            Deduction::Deducted => {
                tracing::info!(%order_id, "stock deducted");
                self.finish(order_id, SettlementOutcome::Deducted, &items).await
            }
            Deduction::AlreadySettled(settlement) => {
                self.finish(order_id, settlement.outcome, &items).await
            }
            Deduction::Rejected(failures) => {
                let reason = failures
                    .iter()
                    .map(|f| match &f.key {
                        Some(key) => format!("{key}: {}", f.reason),
                        None => f.reason.clone(),
                    })
                    .collect::<Vec<_>>()
                    .join("; ");
                tracing::warn!(%order_id, %reason, "stock deduction failed");
                let outbox = Self::failure_records(order_id, failures, trace_id)?;
                if self.stock.settle_failed(order_id, &reason, outbox).await? {
                    self.finish(order_id, SettlementOutcome::Failed, &items).await?;
                }
                Ok(())
            }
        }
    }

    /// Clears what a settled order still holds in the cache.
    async fn finish(
        &self,
        order_id: OrderId,
        outcome: SettlementOutcome,
        items: &[ReservedItem],
    ) -> Result<()> {
        if outcome == SettlementOutcome::Failed {
            self.release_once(order_id, items).await?;
        }
        self.mappings.delete(order_id).await?;
        Ok(())
    }

    fn failure_records(
        order_id: OrderId,
        failures: Vec<ItemFailure>,
        trace_id: Option<&str>,
    ) -> Result<Vec<outbox::NewOutboxRecord>> {
        let payload = EventPayload::StockDeductionFailed(StockDeductionFailed { order_id, failures });
        records(ServiceTag::Inventory, &[payload], trace_id)
    }

    /// PAYMENT_FAILED: give the reservation back to the cache.
    #[tracing::instrument(skip(self, envelope), fields(event_id = %envelope.event_id))]
    pub async fn on_payment_failed(&self, envelope: EventEnvelope) -> Result<()> {
        let event: PaymentFailed = envelope.decode_payload()?;
        if !self.release(event.order_id).await? {
            tracing::warn!(order_id = %event.order_id, "payment failed for unknown reservation, skipping");
        }
        Ok(())
    }

    /// ORDER_CANCELLED: release the cache reservation and restore whatever
    /// was durably deducted.
    #[tracing::instrument(skip(self, envelope), fields(event_id = %envelope.event_id))]
    pub async fn on_order_cancelled(&self, envelope: EventEnvelope) -> Result<()> {
        let event: OrderCancelled = envelope.decode_payload()?;
        let order_id = event.order_id;

        let held = match self.mappings.get(order_id).await? {
            Some(items) => items,
            None => self.stock.confirmed(order_id).await?,
        };
        // The cache goes first: a committed restore reports nothing on retry,
        // the guarded release can simply run again.
        self.release_once(order_id, &held).await?;

        let restored = self.stock.restore(order_id).await?;
        if !restored.is_empty() {
            tracing::info!(%order_id, units = restored.len(), "durable stock restored");
        }
        self.mappings.delete(order_id).await?;
        Ok(())
    }
}
