//! Durable stock: the authoritative quantity per unit, plus the per-order
//! confirmation ledger that makes deduction and restore idempotent.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::payload::ItemFailure;
use common::{Money, OrderId, ProductId, ReservedItem, StockKey, VariantId};
use outbox::{InMemoryOutboxStore, NewOutboxRecord};
use serde::{Deserialize, Serialize};
use sqlx::{PgConnection, PgPool, Row, postgres::PgRow};
use tokio::sync::{Mutex, RwLock};

use crate::{Result, SagaError};

/// A sellable unit as the catalogue knows it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StockUnit {
    pub key: StockKey,
    pub name: String,
    pub unit_price: Money,
    pub quantity: u64,
}

/// How inventory settled an order's payment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettlementOutcome {
    Deducted,
    Failed,
}

impl SettlementOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            SettlementOutcome::Deducted => "DEDUCTED",
            SettlementOutcome::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "DEDUCTED" => Some(SettlementOutcome::Deducted),
            "FAILED" => Some(SettlementOutcome::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settlement {
    pub order_id: OrderId,
    pub outcome: SettlementOutcome,
    pub reason: Option<String>,
    pub settled_at: DateTime<Utc>,
}

/// Result of a durable deduction attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Deduction {
    /// Every item was decremented and the outbox written.
    Deducted,
    /// The order was settled before; nothing changed.
    AlreadySettled(Settlement),
    /// At least one item could not be decremented; nothing changed.
    Rejected(Vec<ItemFailure>),
}

/// Durable stock rows and per-order confirmations.
#[async_trait]
pub trait StockStore: Send + Sync {
    /// Creates or replaces a unit.
    async fn upsert(&self, unit: StockUnit) -> Result<()>;

    async fn get(&self, key: &StockKey) -> Result<Option<StockUnit>>;

    async fn all(&self) -> Result<Vec<StockUnit>>;

    async fn settlement(&self, order_id: OrderId) -> Result<Option<Settlement>>;

    /// Decrements every item of an order in one commit, with row locks taken
    /// in key order, and writes `outbox` in the same commit.
    ///
    /// All or nothing: a single failing item rejects the whole order.
    async fn deduct(
        &self,
        order_id: OrderId,
        items: &[ReservedItem],
        outbox: Vec<NewOutboxRecord>,
    ) -> Result<Deduction>;

    /// Records that the order could not be deducted and writes `outbox`.
    ///
    /// Returns false, writing nothing, if the order was already settled.
    async fn settle_failed(
        &self,
        order_id: OrderId,
        reason: &str,
        outbox: Vec<NewOutboxRecord>,
    ) -> Result<bool>;

    /// Everything durably deducted for the order, restored or not.
    async fn confirmed(&self, order_id: OrderId) -> Result<Vec<ReservedItem>>;

    /// Gives back everything durably deducted for the order and not yet
    /// restored. Returns what was restored.
    async fn restore(&self, order_id: OrderId) -> Result<Vec<ReservedItem>>;
}

/// Sums quantities per unit, in key order.
fn merge(items: &[ReservedItem]) -> BTreeMap<StockKey, u64> {
    let mut merged = BTreeMap::new();
    for item in items {
        *merged.entry(item.key.clone()).or_insert(0) += u64::from(item.quantity);
    }
    merged
}

fn shortfall(key: &StockKey, requested: u64, available: Option<u64>) -> Option<ItemFailure> {
    let reason = match available {
        None => "stock unit not found".to_string(),
        Some(available) if available < requested => {
            format!("insufficient stock: requested {requested}, available {available}")
        }
        Some(_) => return None,
    };
    Some(ItemFailure {
        key: Some(key.clone()),
        reason,
    })
}

fn to_item(key: StockKey, quantity: u64) -> Result<ReservedItem> {
    let quantity = u32::try_from(quantity)
        .map_err(|_| SagaError::Integrity(format!("quantity {quantity} of {key} out of range")))?;
    Ok(ReservedItem::new(key, quantity))
}

#[derive(Debug, Clone)]
struct Confirmation {
    key: StockKey,
    quantity: u64,
    restored: bool,
}

#[derive(Default)]
struct OrderBook {
    confirmations: HashMap<OrderId, Vec<Confirmation>>,
    settlements: HashMap<OrderId, Settlement>,
}

/// In-memory stock store. Each unit is its own `Mutex` row.
#[derive(Clone, Default)]
pub struct InMemoryStockStore {
    units: Arc<RwLock<BTreeMap<StockKey, Arc<Mutex<StockUnit>>>>>,
    orders: Arc<Mutex<OrderBook>>,
    outbox: InMemoryOutboxStore,
}

impl InMemoryStockStore {
    pub fn new(outbox: InMemoryOutboxStore) -> Self {
        Self {
            outbox,
            ..Self::default()
        }
    }

    /// Current durable quantity of a unit.
    pub async fn quantity(&self, key: &StockKey) -> Option<u64> {
        let row = self.units.read().await.get(key).cloned()?;
        let unit = row.lock().await;
        Some(unit.quantity)
    }

    async fn row(&self, key: &StockKey) -> Option<Arc<Mutex<StockUnit>>> {
        self.units.read().await.get(key).cloned()
    }
}

#[async_trait]
impl StockStore for InMemoryStockStore {
    async fn upsert(&self, unit: StockUnit) -> Result<()> {
        match self.row(&unit.key).await {
            Some(row) => *row.lock().await = unit,
            None => {
                self.units
                    .write()
                    .await
                    .insert(unit.key.clone(), Arc::new(Mutex::new(unit)));
            }
        }
        Ok(())
    }

    async fn get(&self, key: &StockKey) -> Result<Option<StockUnit>> {
        match self.row(key).await {
            Some(row) => Ok(Some(row.lock().await.clone())),
            None => Ok(None),
        }
    }

    async fn all(&self) -> Result<Vec<StockUnit>> {
        let rows: Vec<_> = self.units.read().await.values().cloned().collect();
        let mut units = Vec::with_capacity(rows.len());
        for row in rows {
            units.push(row.lock().await.clone());
        }
        Ok(units)
    }

    async fn settlement(&self, order_id: OrderId) -> Result<Option<Settlement>> {
        Ok(self.orders.lock().await.settlements.get(&order_id).cloned())
    }

    async fn deduct(
        &self,
        order_id: OrderId,
        items: &[ReservedItem],
        outbox: Vec<NewOutboxRecord>,
    ) -> Result<Deduction> {
        let mut book = self.orders.lock().await;
        if let Some(settlement) = book.settlements.get(&order_id) {
            return Ok(Deduction::AlreadySettled(settlement.clone()));
        }

        let merged = merge(items);
        let mut locked = Vec::with_capacity(merged.len());
        let mut failures = Vec::new();
        for (key, requested) in &merged {
            match self.row(key).await {
                Some(row) => {
                    let guard = row.lock_owned().await;
                    if let Some(failure) = shortfall(key, *requested, Some(guard.quantity)) {
                        failures.push(failure);
                    }
                    locked.push((guard, *requested));
                }
                None => failures.extend(shortfall(key, *requested, None)),
            }
        }
        if !failures.is_empty() {
            return Ok(Deduction::Rejected(failures));
        }

        let mut confirmations = Vec::with_capacity(locked.len());
        for (mut unit, requested) in locked {
            unit.quantity -= requested;
            confirmations.push(Confirmation {
                key: unit.key.clone(),
                quantity: requested,
                restored: false,
            });
        }
        book.confirmations.insert(order_id, confirmations);
        book.settlements.insert(
            order_id,
            Settlement {
                order_id,
                outcome: SettlementOutcome::Deducted,
                reason: None,
                settled_at: Utc::now(),
            },
        );
        self.outbox.append(outbox).await;
        Ok(Deduction::Deducted)
    }

    async fn settle_failed(
        &self,
        order_id: OrderId,
        reason: &str,
        outbox: Vec<NewOutboxRecord>,
    ) -> Result<bool> {
        let mut book = self.orders.lock().await;
        if book.settlements.contains_key(&order_id) {
            return Ok(false);
        }
        book.settlements.insert(
            order_id,
            Settlement {
                order_id,
                outcome: SettlementOutcome::Failed,
                reason: Some(reason.to_string()),
                settled_at: Utc::now(),
            },
        );
        self.outbox.append(outbox).await;
        Ok(true)
    }

    async fn confirmed(&self, order_id: OrderId) -> Result<Vec<ReservedItem>> {
        let book = self.orders.lock().await;
        book.confirmations
            .get(&order_id)
            .into_iter()
            .flatten()
            .map(|c| to_item(c.key.clone(), c.quantity))
            .collect()
    }

    async fn restore(&self, order_id: OrderId) -> Result<Vec<ReservedItem>> {
        let mut book = self.orders.lock().await;
        let Some(confirmations) = book.confirmations.get_mut(&order_id) else {
            return Ok(Vec::new());
        };

        let mut restored = Vec::new();
        for confirmation in confirmations.iter_mut().filter(|c| !c.restored) {
            let row = self.row(&confirmation.key).await.ok_or_else(|| {
                SagaError::Integrity(format!(
                    "confirmed unit {} of order {order_id} has no stock row",
                    confirmation.key
                ))
            })?;
            row.lock().await.quantity += confirmation.quantity;
            confirmation.restored = true;
            restored.push(to_item(confirmation.key.clone(), confirmation.quantity)?);
        }
        Ok(restored)
    }
}

/// PostgreSQL stock store.
///
/// Unit rows are locked with `SELECT ... FOR UPDATE` in key order, so two
/// orders touching the same units never deadlock.
#[derive(Clone)]
pub struct PostgresStockStore {
    pool: PgPool,
}

/// Absent variants are stored as the empty string so the key can be a
/// primary key.
fn variant_column(key: &StockKey) -> &str {
    key.variant_id.as_ref().map(VariantId::as_str).unwrap_or("")
}

fn key_from_columns(product_id: String, variant_id: String) -> StockKey {
    StockKey {
        product_id: ProductId::new(product_id),
        variant_id: (!variant_id.is_empty()).then(|| VariantId::new(variant_id)),
    }
}

impl PostgresStockStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_unit(row: PgRow) -> Result<StockUnit> {
        let quantity: i64 = row.try_get("quantity")?;
        let key = key_from_columns(row.try_get("product_id")?, row.try_get("variant_id")?);
        Ok(StockUnit {
            quantity: u64::try_from(quantity)
                .map_err(|_| SagaError::Integrity(format!("negative stock for {key}")))?,
            name: row.try_get("name")?,
            unit_price: Money::from_cents(row.try_get("unit_price")?),
            key,
        })
    }

    fn row_to_settlement(order_id: OrderId, row: PgRow) -> Result<Settlement> {
        let outcome: String = row.try_get("outcome")?;
        Ok(Settlement {
            order_id,
            outcome: SettlementOutcome::parse(&outcome)
                .ok_or_else(|| SagaError::Integrity(format!("unknown settlement {outcome}")))?,
            reason: row.try_get("reason")?,
            settled_at: row.try_get("settled_at")?,
        })
    }

    async fn lock_quantity(conn: &mut PgConnection, key: &StockKey) -> Result<Option<u64>> {
        let quantity: Option<i64> = sqlx::query_scalar(
            "SELECT quantity FROM stock_units WHERE product_id = $1 AND variant_id = $2 FOR UPDATE",
        )
        .bind(key.product_id.as_str())
        .bind(variant_column(key))
        .fetch_optional(&mut *conn)
        .await?;
        Ok(quantity.map(|q| q.max(0) as u64))
    }

    async fn adjust(conn: &mut PgConnection, key: &StockKey, delta: i64) -> Result<()> {
        sqlx::query(
            "UPDATE stock_units SET quantity = quantity + $3, updated_at = NOW() \
             WHERE product_id = $1 AND variant_id = $2",
        )
        .bind(key.product_id.as_str())
        .bind(variant_column(key))
        .bind(delta)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    async fn insert_settlement(
        conn: &mut PgConnection,
        order_id: OrderId,
        outcome: SettlementOutcome,
        reason: Option<&str>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO stock_settlements (order_id, outcome, reason, settled_at)
            VALUES ($1, $2, $3, NOW())
            ON CONFLICT (order_id) DO NOTHING
            "#,
        )
        .bind(order_id.as_uuid())
        .bind(outcome.as_str())
        .bind(reason)
        .execute(&mut *conn)
        .await?;
        Ok(result.rows_affected() == 1)
    }
}

#[async_trait]
impl StockStore for PostgresStockStore {
    async fn upsert(&self, unit: StockUnit) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO stock_units (product_id, variant_id, name, unit_price, quantity, updated_at)
            VALUES ($1, $2, $3, $4, $5, NOW())
            ON CONFLICT (product_id, variant_id)
            DO UPDATE SET name = $3, unit_price = $4, quantity = $5, updated_at = NOW()
            "#,
        )
        .bind(unit.key.product_id.as_str())
        .bind(variant_column(&unit.key))
        .bind(&unit.name)
        .bind(unit.unit_price.cents())
        .bind(i64::try_from(unit.quantity).unwrap_or(i64::MAX))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, key: &StockKey) -> Result<Option<StockUnit>> {
        let row = sqlx::query(
            r#"
            SELECT product_id, variant_id, name, unit_price, quantity
            FROM stock_units WHERE product_id = $1 AND variant_id = $2
            "#,
        )
        .bind(key.product_id.as_str())
        .bind(variant_column(key))
        .fetch_optional(&self.pool)
        .await?;
        row.map(Self::row_to_unit).transpose()
    }

    async fn all(&self) -> Result<Vec<StockUnit>> {
        let rows = sqlx::query(
            r#"
            SELECT product_id, variant_id, name, unit_price, quantity
            FROM stock_units ORDER BY product_id, variant_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Self::row_to_unit).collect()
    }

    async fn settlement(&self, order_id: OrderId) -> Result<Option<Settlement>> {
        let row = sqlx::query(
            "SELECT outcome, reason, settled_at FROM stock_settlements WHERE order_id = $1",
        )
        .bind(order_id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;
        row.map(|row| Self::row_to_settlement(order_id, row))
            .transpose()
    }

    #[tracing::instrument(skip(self, items, outbox))]
    async fn deduct(
        &self,
        order_id: OrderId,
        items: &[ReservedItem],
        outbox: Vec<NewOutboxRecord>,
    ) -> Result<Deduction> {
        let mut tx = self.pool.begin().await?;

        // Claims the order first; a concurrent deduction of the same order
        // waits here and then sees the settlement.
        if !Self::insert_settlement(&mut tx, order_id, SettlementOutcome::Deducted, None).await? {
            tx.rollback().await?;
            return match self.settlement(order_id).await? {
                Some(settlement) => Ok(Deduction::AlreadySettled(settlement)),
                None => Err(SagaError::Integrity(format!(
                    "settlement of order {order_id} vanished"
                ))),
            };
        }

        let merged = merge(items);
        let mut failures = Vec::new();
        for (key, requested) in &merged {
            let available = Self::lock_quantity(&mut tx, key).await?;
            failures.extend(shortfall(key, *requested, available));
        }
        if !failures.is_empty() {
            tx.rollback().await?;
            return Ok(Deduction::Rejected(failures));
        }

        for (key, requested) in &merged {
            let requested = i64::try_from(*requested)
                .map_err(|_| SagaError::Integrity(format!("quantity of {key} out of range")))?;
            Self::adjust(&mut tx, key, -requested).await?;
            sqlx::query(
                r#"
                INSERT INTO stock_confirmations (order_id, product_id, variant_id, quantity, restored, confirmed_at)
                VALUES ($1, $2, $3, $4, FALSE, NOW())
                "#,
            )
            .bind(order_id.as_uuid())
            .bind(key.product_id.as_str())
            .bind(variant_column(key))
            .bind(requested)
            .execute(&mut *tx)
            .await?;
        }

        outbox::insert_in_tx(&mut tx, &outbox).await?;
        tx.commit().await?;
        Ok(Deduction::Deducted)
    }

    async fn settle_failed(
        &self,
        order_id: OrderId,
        reason: &str,
        outbox: Vec<NewOutboxRecord>,
    ) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        if !Self::insert_settlement(&mut tx, order_id, SettlementOutcome::Failed, Some(reason))
            .await?
        {
            tx.rollback().await?;
            return Ok(false);
        }
        outbox::insert_in_tx(&mut tx, &outbox).await?;
        tx.commit().await?;
        Ok(true)
    }

    async fn confirmed(&self, order_id: OrderId) -> Result<Vec<ReservedItem>> {
        let rows = sqlx::query(
            r#"
            SELECT product_id, variant_id, quantity
            FROM stock_confirmations
            WHERE order_id = $1
            ORDER BY product_id, variant_id
            "#,
        )
        .bind(order_id.as_uuid())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                let key = key_from_columns(row.try_get("product_id")?, row.try_get("variant_id")?);
                let quantity: i64 = row.try_get("quantity")?;
                to_item(key, quantity.max(0) as u64)
            })
            .collect()
    }

    #[tracing::instrument(skip(self))]
    async fn restore(&self, order_id: OrderId) -> Result<Vec<ReservedItem>> {
        let mut tx = self.pool.begin().await?;
        let rows = sqlx::query(
            r#"
            SELECT product_id, variant_id, quantity
            FROM stock_confirmations
            WHERE order_id = $1 AND NOT restored
            ORDER BY product_id, variant_id
            FOR UPDATE
            "#,
        )
        .bind(order_id.as_uuid())
        .fetch_all(&mut *tx)
        .await?;

        let mut restored = Vec::with_capacity(rows.len());
        for row in rows {
            let key = key_from_columns(row.try_get("product_id")?, row.try_get("variant_id")?);
            let quantity: i64 = row.try_get("quantity")?;
            if Self::lock_quantity(&mut tx, &key).await?.is_none() {
                return Err(SagaError::Integrity(format!(
                    "confirmed unit {key} of order {order_id} has no stock row"
                )));
            }
            Self::adjust(&mut tx, &key, quantity).await?;
            restored.push(to_item(key, quantity.max(0) as u64)?);
        }

        sqlx::query("UPDATE stock_confirmations SET restored = TRUE WHERE order_id = $1")
            .bind(order_id.as_uuid())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(restored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit(key: StockKey, quantity: u64) -> StockUnit {
        StockUnit {
            key,
            name: "Widget".to_string(),
            unit_price: Money::from_cents(1000),
            quantity,
        }
    }

    async fn store_with(units: &[(StockKey, u64)]) -> InMemoryStockStore {
        let store = InMemoryStockStore::new(InMemoryOutboxStore::new());
        for (key, quantity) in units {
            store.upsert(unit(key.clone(), *quantity)).await.unwrap();
        }
        store
    }

    #[tokio::test]
    async fn test_deduct_is_all_or_nothing() {
        let a = StockKey::product("A");
        let b = StockKey::variant("B", "red");
        let store = store_with(&[(a.clone(), 5), (b.clone(), 1)]).await;
        let order_id = OrderId::new();

        let result = store
            .deduct(
                order_id,
                &[ReservedItem::new(a.clone(), 2), ReservedItem::new(b.clone(), 3)],
                Vec::new(),
            )
            .await
            .unwrap();

        let Deduction::Rejected(failures) = result else {
            panic!("expected rejection");
        };
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].key, Some(b.clone()));
        assert_eq!(store.quantity(&a).await, Some(5));
        assert_eq!(store.quantity(&b).await, Some(1));
        assert!(store.settlement(order_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_deduct_twice_is_settled_once() {
        let a = StockKey::product("A");
        let store = store_with(&[(a.clone(), 5)]).await;
        let order_id = OrderId::new();
        let items = [ReservedItem::new(a.clone(), 2)];

        assert_eq!(
            store.deduct(order_id, &items, Vec::new()).await.unwrap(),
            Deduction::Deducted
        );
        assert!(matches!(
            store.deduct(order_id, &items, Vec::new()).await.unwrap(),
            Deduction::AlreadySettled(Settlement {
                outcome: SettlementOutcome::Deducted,
                ..
            })
        ));
        assert_eq!(store.quantity(&a).await, Some(3));
    }

    #[tokio::test]
    async fn test_duplicate_lines_are_merged() {
        let a = StockKey::product("A");
        let store = store_with(&[(a.clone(), 3)]).await;

        let result = store
            .deduct(
                OrderId::new(),
                &[ReservedItem::new(a.clone(), 2), ReservedItem::new(a.clone(), 2)],
                Vec::new(),
            )
            .await
            .unwrap();

        assert!(matches!(result, Deduction::Rejected(_)));
        assert_eq!(store.quantity(&a).await, Some(3));
    }

    #[tokio::test]
    async fn test_unknown_unit_is_reported() {
        let store = store_with(&[]).await;
        let result = store
            .deduct(
                OrderId::new(),
                &[ReservedItem::new(StockKey::product("ghost"), 1)],
                Vec::new(),
            )
            .await
            .unwrap();
        let Deduction::Rejected(failures) = result else {
            panic!("expected rejection");
        };
        assert_eq!(failures[0].reason, "stock unit not found");
    }

    #[tokio::test]
    async fn test_restore_gives_back_once() {
        let a = StockKey::product("A");
        let store = store_with(&[(a.clone(), 5)]).await;
        let order_id = OrderId::new();
        store
            .deduct(order_id, &[ReservedItem::new(a.clone(), 2)], Vec::new())
            .await
            .unwrap();

        let restored = store.restore(order_id).await.unwrap();
        assert_eq!(restored, vec![ReservedItem::new(a.clone(), 2)]);
        assert_eq!(store.quantity(&a).await, Some(5));

        assert!(store.restore(order_id).await.unwrap().is_empty());
        assert_eq!(store.quantity(&a).await, Some(5));
        // Confirmations stay readable after the restore.
        assert_eq!(
            store.confirmed(order_id).await.unwrap(),
            vec![ReservedItem::new(a.clone(), 2)]
        );
    }

    #[tokio::test]
    async fn test_restore_without_deduction_is_empty() {
        let store = store_with(&[(StockKey::product("A"), 5)]).await;
        assert!(store.restore(OrderId::new()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_settle_failed_only_once() {
        let store = store_with(&[]).await;
        let order_id = OrderId::new();
        assert!(store.settle_failed(order_id, "mapping not found", Vec::new()).await.unwrap());
        assert!(!store.settle_failed(order_id, "again", Vec::new()).await.unwrap());
        let settlement = store.settlement(order_id).await.unwrap().unwrap();
        assert_eq!(settlement.outcome, SettlementOutcome::Failed);
        assert_eq!(settlement.reason.as_deref(), Some("mapping not found"));
    }
}
