//! Internal inventory endpoints, called synchronously by the order service.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use saga::inventory::{InventoryService, ProductInfo, ProductInfoRequest, ReservationRequest, StockUnit};
use serde::Serialize;

use super::parse_order_id;
use crate::error::ApiError;

pub fn router(service: Arc<InventoryService>) -> Router {
    Router::new()
        .route("/internal/stock/reservations", post(reserve))
        .route("/internal/stock/reservations/{order_id}/release", post(release))
        .route("/internal/products/info", post(product_info))
        .route("/internal/stock/units", post(register_unit))
        .with_state(service)
}

#[derive(Serialize)]
pub struct ReleaseResponse {
    pub released: bool,
}

/// POST /internal/stock/reservations: all items or none.
#[tracing::instrument(skip_all, fields(order_id = %request.order_id))]
pub async fn reserve(
    State(service): State<Arc<InventoryService>>,
    Json(request): Json<ReservationRequest>,
) -> Result<StatusCode, ApiError> {
    service.reserve(request.order_id, &request.items).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /internal/stock/reservations/{order_id}/release
#[tracing::instrument(skip(service))]
pub async fn release(
    State(service): State<Arc<InventoryService>>,
    Path(order_id): Path<String>,
) -> Result<Json<ReleaseResponse>, ApiError> {
    let released = service.release(parse_order_id(&order_id)?).await?;
    Ok(Json(ReleaseResponse { released }))
}

/// POST /internal/products/info
#[tracing::instrument(skip_all)]
pub async fn product_info(
    State(service): State<Arc<InventoryService>>,
    Json(request): Json<ProductInfoRequest>,
) -> Result<Json<Vec<ProductInfo>>, ApiError> {
    Ok(Json(service.product_info(&request.items).await?))
}

/// POST /internal/stock/units: registers a unit or overwrites its stock,
/// and resyncs its ledger counter.
#[tracing::instrument(skip_all, fields(key = %unit.key))]
pub async fn register_unit(
    State(service): State<Arc<InventoryService>>,
    Json(unit): Json<StockUnit>,
) -> Result<StatusCode, ApiError> {
    service.register_unit(unit).await?;
    Ok(StatusCode::NO_CONTENT)
}
