//! Checkout, status polling and user cancel.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use common::ReservedItem;
use domain::Order;
use saga::order::{CheckoutRequest, OrderService};
use serde::{Deserialize, Serialize};

use super::{Caller, TraceId, parse_order_id};
use crate::error::ApiError;

pub fn router(service: Arc<OrderService>) -> Router {
    Router::new()
        .route("/orders", post(checkout))
        .route("/orders/{id}", get(status))
        .route("/orders/{id}/cancel", post(cancel))
        .with_state(service)
}

#[derive(Debug, Default, Deserialize)]
pub struct CancelRequest {
    pub reason: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderLineResponse {
    #[serde(flatten)]
    pub item: ReservedItem,
    pub name: String,
    pub unit_price: i64,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderResponse {
    pub id: String,
    pub user_id: String,
    pub status: String,
    pub total: i64,
    pub lines: Vec<OrderLineResponse>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    pub updated_at: String,
}

impl From<&Order> for OrderResponse {
    fn from(order: &Order) -> Self {
        Self {
            id: order.id().to_string(),
            user_id: order.user_id().to_string(),
            status: order.status().as_str().to_string(),
            total: order.total().cents(),
            lines: order
                .lines()
                .iter()
                .map(|line| OrderLineResponse {
                    item: line.reserved_item(),
                    name: line.product_name.clone(),
                    unit_price: line.unit_price.cents(),
                })
                .collect(),
            failure_reason: order.failure_reason().map(str::to_string),
            updated_at: order.updated_at().to_rfc3339(),
        }
    }
}

/// POST /orders: prices the items, reserves them and places the order.
#[tracing::instrument(skip(service, caller, trace, request))]
pub async fn checkout(
    State(service): State<Arc<OrderService>>,
    Caller(caller): Caller,
    TraceId(trace): TraceId,
    Json(request): Json<CheckoutRequest>,
) -> Result<(StatusCode, Json<OrderResponse>), ApiError> {
    let order = service.checkout(&caller, request, trace).await?;
    Ok((StatusCode::CREATED, Json(OrderResponse::from(&order))))
}

/// GET /orders/{id}
#[tracing::instrument(skip(service, caller))]
pub async fn status(
    State(service): State<Arc<OrderService>>,
    Caller(caller): Caller,
    Path(id): Path<String>,
) -> Result<Json<OrderResponse>, ApiError> {
    let order = service.get(&caller, parse_order_id(&id)?).await?;
    Ok(Json(OrderResponse::from(&order)))
}

/// POST /orders/{id}/cancel
#[tracing::instrument(skip(service, caller, trace, request))]
pub async fn cancel(
    State(service): State<Arc<OrderService>>,
    Caller(caller): Caller,
    TraceId(trace): TraceId,
    Path(id): Path<String>,
    request: Option<Json<CancelRequest>>,
) -> Result<Json<OrderResponse>, ApiError> {
    let reason = request.and_then(|Json(body)| body.reason);
    let order = service
        .cancel(&caller, parse_order_id(&id)?, reason, trace)
        .await?;
    Ok(Json(OrderResponse::from(&order)))
}
