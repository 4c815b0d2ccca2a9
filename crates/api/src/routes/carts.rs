//! Cart surface.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use common::ReservedItem;
use saga::cart::{Cart, CartService};

use super::{Caller, parse_user_id};
use crate::error::ApiError;

pub fn router(service: Arc<CartService>) -> Router {
    Router::new()
        .route("/carts/{user_id}", get(get_cart))
        .route("/carts/{user_id}/items", post(add_item))
        .with_state(service)
}

/// GET /carts/{user_id}
pub async fn get_cart(
    State(service): State<Arc<CartService>>,
    Caller(caller): Caller,
    Path(user_id): Path<String>,
) -> Result<Json<Cart>, ApiError> {
    Ok(Json(service.get(&caller, parse_user_id(&user_id)?).await?))
}

/// POST /carts/{user_id}/items: adds on top of what the cart holds.
#[tracing::instrument(skip(service, caller, item))]
pub async fn add_item(
    State(service): State<Arc<CartService>>,
    Caller(caller): Caller,
    Path(user_id): Path<String>,
    Json(item): Json<ReservedItem>,
) -> Result<Json<Cart>, ApiError> {
    let cart = service
        .add_item(&caller, parse_user_id(&user_id)?, item.key, item.quantity)
        .await?;
    Ok(Json(cart))
}
