//! Payment participant: payment per order, gateway confirmation behind a
//! circuit breaker, and refunds as compensation.

mod breaker;
mod gateway;
mod service;

use std::sync::Arc;

use common::EventType;
use message_bus::HandlerRegistry;

pub use breaker::{BreakerConfig, BreakerError, BreakerState, BreakerStats, CircuitBreaker};
pub use gateway::{
    Approval, ApprovalRequest, BreakerGateway, GatewayError, HttpGateway, HttpGatewayConfig,
    PaymentGateway, Scripted, ScriptedGateway,
};
pub use service::{ConfirmPayment, PaymentService};

use crate::outbound::route;

/// Event routes of the payment consumer.
pub fn handlers(service: Arc<PaymentService>) -> HandlerRegistry {
    HandlerRegistry::new()
        .on(
            EventType::OrderCreated,
            route(&service, |svc, env| async move { svc.on_order_created(env).await }),
        )
        .on(
            EventType::StockDeductionFailed,
            route(&service, |svc, env| async move {
                svc.on_stock_deduction_failed(env).await
            }),
        )
        .on(
            EventType::OrderCancelled,
            route(&service, |svc, env| async move { svc.on_order_cancelled(env).await }),
        )
}
