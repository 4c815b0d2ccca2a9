//! Inventory participant.
//!
//! Reservations live in the stock ledger (fast, cache-resident); the durable
//! store is only touched when a payment completes or an order is cancelled.

mod service;
mod store;

use std::sync::Arc;

use common::EventType;
use message_bus::HandlerRegistry;

pub use service::{InventoryService, ProductInfo, ProductInfoRequest, ReservationRequest};
pub use store::{
    Deduction, InMemoryStockStore, PostgresStockStore, Settlement, SettlementOutcome, StockStore,
    StockUnit,
};

use crate::outbound::route;

/// Event routes of the inventory consumer.
pub fn handlers(service: Arc<InventoryService>) -> HandlerRegistry {
    HandlerRegistry::new()
        .on(
            EventType::PaymentCompleted,
            route(&service, |svc, env| async move { svc.on_payment_completed(env).await }),
        )
        .on(
            EventType::PaymentFailed,
            route(&service, |svc, env| async move { svc.on_payment_failed(env).await }),
        )
        .on(
            EventType::OrderCancelled,
            route(&service, |svc, env| async move { svc.on_order_cancelled(env).await }),
        )
}
