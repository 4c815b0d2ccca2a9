use async_trait::async_trait;
use common::{OrderId, ReservedItem};

use crate::Result;

/// Ephemeral order id → reserved items map.
///
/// Written when stock is reserved, read by the handlers that later confirm or
/// compensate the reservation, deleted once a terminal outcome was processed.
/// Entries expire after a TTL, so readers must treat `None` as "nothing left
/// to do" and skip.
#[async_trait]
pub trait ReservationMap: Send + Sync {
    /// Writes the mapping unless a live one exists. Returns true if written.
    async fn save(&self, order_id: OrderId, items: &[ReservedItem]) -> Result<bool>;

    async fn get(&self, order_id: OrderId) -> Result<Option<Vec<ReservedItem>>>;

    async fn delete(&self, order_id: OrderId) -> Result<()>;
}

pub(crate) fn mapping_key(order_id: OrderId) -> String {
    format!("order-stock:{order_id}")
}
