//! Value objects for the order domain.

use common::{Money, ReservedItem, StockKey};
use serde::{Deserialize, Serialize};

/// A line of an order, priced from the catalogue at checkout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderLine {
    /// The unit being bought.
    pub key: StockKey,

    /// Human-readable product name.
    pub product_name: String,

    /// Quantity ordered.
    pub quantity: u32,

    /// Price per unit.
    pub unit_price: Money,
}

impl OrderLine {
    pub fn new(
        key: StockKey,
        product_name: impl Into<String>,
        quantity: u32,
        unit_price: Money,
    ) -> Self {
        Self {
            key,
            product_name: product_name.into(),
            quantity,
            unit_price,
        }
    }

    /// Returns the total price for this line (quantity * unit_price).
    pub fn total_price(&self) -> Money {
        self.unit_price.times(self.quantity)
    }

    /// The reservation this line needs.
    pub fn reserved_item(&self) -> ReservedItem {
        ReservedItem::new(self.key.clone(), self.quantity)
    }
}
