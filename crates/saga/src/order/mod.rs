//! Order participant: checkout, cancel, status polling, and the order state
//! machine driven by payment and inventory events.

mod inventory_client;
mod service;

use std::sync::Arc;

use common::EventType;
use message_bus::HandlerRegistry;

pub use inventory_client::{HttpInventoryClient, InProcessInventoryClient, InventoryClient};
pub use service::{CheckoutRequest, OrderService};

use crate::outbound::route;

/// Event routes of the order consumer.
pub fn handlers(service: Arc<OrderService>) -> HandlerRegistry {
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
            EventType::StockDeducted,
            route(&service, |svc, env| async move { svc.on_stock_deducted(env).await }),
        )
        .on(
            EventType::StockDeductionFailed,
            route(&service, |svc, env| async move {
                svc.on_stock_deduction_failed(env).await
            }),
        )
        .on(
            EventType::RefundFailed,
            route(&service, |svc, env| async move { svc.on_refund_failed(env).await }),
        )
}
