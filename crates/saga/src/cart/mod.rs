//! Cart participant: clears a buyer's cart once their order is confirmed or
//! their account is deleted.

mod store;

use std::sync::Arc;

use common::payload::{OrderConfirmed, UserDeleted};
use common::{EventEnvelope, EventType, StockKey, UserId};
use message_bus::HandlerRegistry;

pub use store::{Cart, CartLine, CartStore, InMemoryCartStore, PostgresCartStore};

use crate::outbound::route;
use crate::principal::Principal;
use crate::{Result, SagaError};

pub struct CartService {
    store: Arc<dyn CartStore>,
}

impl CartService {
    pub fn new(store: Arc<dyn CartStore>) -> Self {
        Self { store }
    }

    pub async fn add_item(
        &self,
        principal: &Principal,
        user_id: UserId,
        key: StockKey,
        quantity: u32,
    ) -> Result<Cart> {
        self.authorize(principal, user_id)?;
        if quantity == 0 {
            return Err(SagaError::InvalidRequest(
                "quantity must be positive".to_string(),
            ));
        }
        self.store.add(user_id, key, quantity).await?;
        self.store.get(user_id).await
    }

    pub async fn get(&self, principal: &Principal, user_id: UserId) -> Result<Cart> {
        self.authorize(principal, user_id)?;
        self.store.get(user_id).await
    }

    fn authorize(&self, principal: &Principal, user_id: UserId) -> Result<()> {
        if principal.can_access(user_id) {
            Ok(())
        } else {
            Err(SagaError::Forbidden {
                what: "cart",
                id: user_id.to_string(),
            })
        }
    }

    #[tracing::instrument(skip(self, envelope), fields(event_id = %envelope.event_id))]
    pub async fn on_order_confirmed(&self, envelope: EventEnvelope) -> Result<()> {
        let event: OrderConfirmed = envelope.decode_payload()?;
        if self.store.clear(event.user_id).await? {
            tracing::info!(user_id = %event.user_id, order_id = %event.order_id, "cart cleared");
        }
        Ok(())
    }

    #[tracing::instrument(skip(self, envelope), fields(event_id = %envelope.event_id))]
    pub async fn on_user_deleted(&self, envelope: EventEnvelope) -> Result<()> {
        let event: UserDeleted = envelope.decode_payload()?;
        self.store.clear(event.user_id).await?;
        tracing::info!(user_id = %event.user_id, "cart of deleted user cleared");
        Ok(())
    }
}

/// Event routes of the cart consumer.
pub fn handlers(service: Arc<CartService>) -> HandlerRegistry {
    HandlerRegistry::new()
        .on(
            EventType::OrderConfirmed,
            route(&service, |svc, env| async move { svc.on_order_confirmed(env).await }),
        )
        .on(
            EventType::UserDeleted,
            route(&service, |svc, env| async move { svc.on_user_deleted(env).await }),
        )
}
