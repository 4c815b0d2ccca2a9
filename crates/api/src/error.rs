//! API error types with HTTP response mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use domain::{DomainError, OrderError, PaymentError};
use saga::SagaError;
use stock_ledger::LedgerError;

/// API-level error type that maps to HTTP responses.
#[derive(Debug)]
pub enum ApiError {
    /// Malformed path, header or body.
    BadRequest(String),
    /// No caller identity on a request that needs one.
    Unauthorized,
    /// A participant rejected or failed the operation.
    Saga(SagaError),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::Saga(err) => saga_status(err),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match self {
            ApiError::BadRequest(msg) => msg,
            ApiError::Unauthorized => "missing x-user-id header".to_string(),
            ApiError::Saga(err) => err.to_string(),
        };
        metrics::counter!("api_errors_total", "status" => status.as_u16().to_string()).increment(1);
        if status.is_server_error() {
            tracing::error!(%status, error = %message, "request failed");
        }

        let body = serde_json::json!({ "error": message });
        (status, axum::Json(body)).into_response()
    }
}

fn saga_status(err: &SagaError) -> StatusCode {
    match err {
        SagaError::Domain(domain) => domain_status(domain),
        SagaError::Ledger(ledger) => match ledger {
            LedgerError::InsufficientStock { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            LedgerError::InvalidQuantity(_) => StatusCode::BAD_REQUEST,
            LedgerError::Redis(_) => StatusCode::SERVICE_UNAVAILABLE,
            LedgerError::KeyNotFound(_) | LedgerError::Serialization(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        },
        SagaError::Conflict { .. } => StatusCode::CONFLICT,
        SagaError::NotFound { .. } => StatusCode::NOT_FOUND,
        SagaError::Forbidden { .. } => StatusCode::FORBIDDEN,
        SagaError::UnknownUnit(_) | SagaError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        SagaError::StockUnavailable(_) => StatusCode::UNPROCESSABLE_ENTITY,
        SagaError::Inventory(_) => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn domain_status(err: &DomainError) -> StatusCode {
    match err {
        DomainError::Order(order) => match order {
            OrderError::InvalidTransition { .. } => StatusCode::CONFLICT,
            OrderError::NoLines
            | OrderError::InvalidQuantity { .. }
            | OrderError::InvalidPrice { .. } => StatusCode::BAD_REQUEST,
        },
        DomainError::Payment(payment) => match payment {
            PaymentError::InvalidTransition { .. } => StatusCode::CONFLICT,
            PaymentError::AmountMismatch { .. } | PaymentError::InvalidAmount(_) => {
                StatusCode::BAD_REQUEST
            }
            PaymentError::GatewayUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            PaymentError::MissingPaymentKey(_) => StatusCode::INTERNAL_SERVER_ERROR,
        },
    }
}

impl From<SagaError> for ApiError {
    fn from(err: SagaError) -> Self {
        ApiError::Saga(err)
    }
}
