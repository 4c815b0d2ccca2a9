//! HTTP handlers, one module per participant.

pub mod carts;
pub mod health;
pub mod inventory;
pub mod metrics;
pub mod orders;
pub mod payments;

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use common::{OrderId, UserId};
use saga::Principal;

use crate::error::ApiError;

pub const USER_HEADER: &str = "x-user-id";
pub const OPERATOR_HEADER: &str = "x-operator";
pub const TRACE_HEADER: &str = "x-trace-id";

/// The caller, from `x-user-id` (a buyer) or `x-operator: true` (back office).
pub struct Caller(pub Principal);

impl<S: Send + Sync> FromRequestParts<S> for Caller {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        if let Some(raw) = header(parts, USER_HEADER) {
            let user_id = UserId::parse(raw)
                .map_err(|e| ApiError::BadRequest(format!("invalid {USER_HEADER}: {e}")))?;
            return Ok(Caller(Principal::user(user_id)));
        }
        if header(parts, OPERATOR_HEADER) == Some("true") {
            return Ok(Caller(Principal::Operator));
        }
        Err(ApiError::Unauthorized)
    }
}

/// Optional `x-trace-id` carried into the outbox records the request writes.
pub struct TraceId(pub Option<String>);

impl<S: Send + Sync> FromRequestParts<S> for TraceId {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(TraceId(header(parts, TRACE_HEADER).map(str::to_string)))
    }
}

fn header<'a>(parts: &'a Parts, name: &str) -> Option<&'a str> {
    parts
        .headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

pub(crate) fn parse_order_id(raw: &str) -> Result<OrderId, ApiError> {
    OrderId::parse(raw).map_err(|e| ApiError::BadRequest(format!("invalid order id: {e}")))
}

pub(crate) fn parse_user_id(raw: &str) -> Result<UserId, ApiError> {
    UserId::parse(raw).map_err(|e| ApiError::BadRequest(format!("invalid user id: {e}")))
}
