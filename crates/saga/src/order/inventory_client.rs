//! How the order service reaches inventory synchronously at checkout.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::{OrderId, ReservedItem};
use reqwest::{Client, StatusCode};

use crate::inventory::{InventoryService, ProductInfo, ProductInfoRequest, ReservationRequest};
use crate::{Result, SagaError};

/// Inventory's synchronous endpoints as seen from checkout.
#[async_trait]
pub trait InventoryClient: Send + Sync {
    async fn product_info(&self, items: &[ReservedItem]) -> Result<Vec<ProductInfo>>;

    /// Reserves every item or none. Insufficient stock is
    /// [`SagaError::StockUnavailable`] (or the ledger's own error in process).
    async fn reserve(&self, order_id: OrderId, items: &[ReservedItem]) -> Result<()>;

    /// Undoes a reservation whose order could not be written.
    async fn release(&self, order_id: OrderId) -> Result<()>;
}

/// Calls an inventory service living in the same process.
#[derive(Clone)]
pub struct InProcessInventoryClient {
    inventory: Arc<InventoryService>,
}

impl InProcessInventoryClient {
    pub fn new(inventory: Arc<InventoryService>) -> Self {
        Self { inventory }
    }
}

#[async_trait]
impl InventoryClient for InProcessInventoryClient {
    async fn product_info(&self, items: &[ReservedItem]) -> Result<Vec<ProductInfo>> {
        self.inventory.product_info(items).await
    }

    async fn reserve(&self, order_id: OrderId, items: &[ReservedItem]) -> Result<()> {
        self.inventory.reserve(order_id, items).await
    }

    async fn release(&self, order_id: OrderId) -> Result<()> {
        self.inventory.release(order_id).await.map(|_| ())
    }
}

/// Calls a remote inventory service over its internal HTTP endpoints.
#[derive(Clone)]
pub struct HttpInventoryClient {
    client: Client,
    base_url: String,
}

impl HttpInventoryClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SagaError::Inventory(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn post<B: serde::Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<reqwest::Response> {
        let response = self
            .client
            .post(self.url(path))
            .json(body)
            .send()
            .await
            .map_err(|e| SagaError::Inventory(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        match status {
            StatusCode::UNPROCESSABLE_ENTITY | StatusCode::CONFLICT => {
                Err(SagaError::StockUnavailable(body))
            }
            StatusCode::BAD_REQUEST => Err(SagaError::InvalidRequest(body)),
            _ => Err(SagaError::Inventory(format!("{path} returned {status}: {body}"))),
        }
    }
}

#[async_trait]
impl InventoryClient for HttpInventoryClient {
    async fn product_info(&self, items: &[ReservedItem]) -> Result<Vec<ProductInfo>> {
        let body = ProductInfoRequest {
            items: items.to_vec(),
        };
        self.post("/internal/products/info", &body)
            .await?
            .json()
            .await
            .map_err(|e| SagaError::Inventory(e.to_string()))
    }

    async fn reserve(&self, order_id: OrderId, items: &[ReservedItem]) -> Result<()> {
        let body = ReservationRequest {
            order_id,
            items: items.to_vec(),
        };
        self.post("/internal/stock/reservations", &body).await?;
        Ok(())
    }

    async fn release(&self, order_id: OrderId) -> Result<()> {
        self.post(
            &format!("/internal/stock/reservations/{order_id}/release"),
            &serde_json::json!({}),
        )
        .await?;
        Ok(())
    }
}
