use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use common::{ProductId, StockKey, UserId, VariantId};
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Row};
use tokio::sync::RwLock;

use crate::Result;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CartLine {
    #[serde(flatten)]
    pub key: StockKey,
    pub quantity: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cart {
    pub user_id: UserId,
    pub lines: Vec<CartLine>,
}

impl Cart {
    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}

#[async_trait]
pub trait CartStore: Send + Sync {
    /// Adds `quantity` of a unit, on top of what the cart already holds.
    async fn add(&self, user_id: UserId, key: StockKey, quantity: u32) -> Result<()>;

    async fn get(&self, user_id: UserId) -> Result<Cart>;

    /// Empties the cart. Returns false if it was already empty.
    async fn clear(&self, user_id: UserId) -> Result<bool>;
}

#[derive(Clone, Default)]
pub struct InMemoryCartStore {
    carts: Arc<RwLock<HashMap<UserId, BTreeMap<StockKey, u32>>>>,
}

impl InMemoryCartStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CartStore for InMemoryCartStore {
    async fn add(&self, user_id: UserId, key: StockKey, quantity: u32) -> Result<()> {
        let mut carts = self.carts.write().await;
        let line = carts.entry(user_id).or_default().entry(key).or_insert(0);
        *line = line.saturating_add(quantity);
        Ok(())
    }

    async fn get(&self, user_id: UserId) -> Result<Cart> {
        let carts = self.carts.read().await;
        let lines = carts
            .get(&user_id)
            .map(|lines| {
                lines
                    .iter()
                    .map(|(key, quantity)| CartLine {
                        key: key.clone(),
                        quantity: *quantity,
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(Cart { user_id, lines })
    }

    async fn clear(&self, user_id: UserId) -> Result<bool> {
        Ok(self
            .carts
            .write()
            .await
            .remove(&user_id)
            .is_some_and(|lines| !lines.is_empty()))
    }
}

#[derive(Clone)]
pub struct PostgresCartStore {
    pool: PgPool,
}

impl PostgresCartStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CartStore for PostgresCartStore {
    async fn add(&self, user_id: UserId, key: StockKey, quantity: u32) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO cart_items (user_id, product_id, variant_id, quantity, updated_at)
            VALUES ($1, $2, $3, $4, NOW())
            ON CONFLICT (user_id, product_id, variant_id)
            DO UPDATE SET quantity = cart_items.quantity + $4, updated_at = NOW()
            "#,
        )
        .bind(user_id.as_uuid())
        .bind(key.product_id.as_str())
        .bind(key.variant_id.as_ref().map(VariantId::as_str).unwrap_or(""))
        .bind(i64::from(quantity))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, user_id: UserId) -> Result<Cart> {
        let rows = sqlx::query(
            r#"
            SELECT product_id, variant_id, quantity FROM cart_items
            WHERE user_id = $1 ORDER BY product_id, variant_id
            "#,
        )
        .bind(user_id.as_uuid())
        .fetch_all(&self.pool)
        .await?;

        let mut lines = Vec::with_capacity(rows.len());
        for row in rows {
            let variant: String = row.try_get("variant_id")?;
            let quantity: i64 = row.try_get("quantity")?;
            lines.push(CartLine {
                key: StockKey {
                    product_id: ProductId::new(row.try_get::<String, _>("product_id")?),
                    variant_id: (!variant.is_empty()).then(|| VariantId::new(variant)),
                },
                quantity: u32::try_from(quantity).unwrap_or(u32::MAX),
            });
        }
        Ok(Cart { user_id, lines })
    }

    async fn clear(&self, user_id: UserId) -> Result<bool> {
        let result = sqlx::query("DELETE FROM cart_items WHERE user_id = $1")
            .bind(user_id.as_uuid())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_adding_the_same_unit_accumulates() {
        let store = InMemoryCartStore::new();
        let user = UserId::new();
        store.add(user, StockKey::product("A"), 1).await.unwrap();
        store.add(user, StockKey::product("A"), 2).await.unwrap();
        store.add(user, StockKey::variant("A", "red"), 1).await.unwrap();

        let cart = store.get(user).await.unwrap();
        assert_eq!(cart.lines.len(), 2);
        assert_eq!(cart.lines[0].quantity, 3);
    }

    #[tokio::test]
    async fn test_clearing_twice_reports_once() {
        let store = InMemoryCartStore::new();
        let user = UserId::new();
        store.add(user, StockKey::product("A"), 1).await.unwrap();
        assert!(store.clear(user).await.unwrap());
        assert!(!store.clear(user).await.unwrap());
    }
}
