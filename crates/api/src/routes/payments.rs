//! Payment confirmation, refunds and status.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use domain::Payment;
use saga::payment::{ConfirmPayment, PaymentService};
use serde::Serialize;

use super::{Caller, TraceId, parse_order_id};
use crate::error::ApiError;

pub fn router(service: Arc<PaymentService>) -> Router {
    Router::new()
        .route("/payments/confirm", post(confirm))
        .route("/payments/{order_id}", get(status))
        .route("/payments/{order_id}/refund", post(refund))
        .with_state(service)
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentResponse {
    pub order_id: String,
    pub status: String,
    pub amount: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payment_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refund_failure_reason: Option<String>,
}

impl From<&Payment> for PaymentResponse {
    fn from(payment: &Payment) -> Self {
        Self {
            order_id: payment.order_id().to_string(),
            status: payment.status().as_str().to_string(),
            amount: payment.amount().cents(),
            payment_key: payment.payment_key().map(str::to_string),
            failure_code: payment.failure_code().map(str::to_string),
            failure_reason: payment.failure_reason().map(str::to_string),
            refund_failure_reason: payment.refund_failure_reason().map(str::to_string),
        }
    }
}

/// POST /payments/confirm: captures the charge the buyer authorized.
///
/// A declined charge still answers 200 with status FAILED; the order learns
/// about it through PAYMENT_FAILED.
#[tracing::instrument(skip_all)]
pub async fn confirm(
    State(service): State<Arc<PaymentService>>,
    Caller(caller): Caller,
    TraceId(trace): TraceId,
    Json(request): Json<ConfirmPayment>,
) -> Result<Json<PaymentResponse>, ApiError> {
    let payment = service.confirm(&caller, request, trace).await?;
    Ok(Json(PaymentResponse::from(&payment)))
}

/// GET /payments/{order_id}
#[tracing::instrument(skip(service, caller))]
pub async fn status(
    State(service): State<Arc<PaymentService>>,
    Caller(caller): Caller,
    Path(order_id): Path<String>,
) -> Result<Json<PaymentResponse>, ApiError> {
    let payment = service.get(&caller, parse_order_id(&order_id)?).await?;
    Ok(Json(PaymentResponse::from(&payment)))
}

/// POST /payments/{order_id}/refund
#[tracing::instrument(skip(service, caller, trace))]
pub async fn refund(
    State(service): State<Arc<PaymentService>>,
    Caller(caller): Caller,
    TraceId(trace): TraceId,
    Path(order_id): Path<String>,
) -> Result<Json<PaymentResponse>, ApiError> {
    let payment = service
        .refund(&caller, parse_order_id(&order_id)?, trace)
        .await?;
    Ok(Json(PaymentResponse::from(&payment)))
}
