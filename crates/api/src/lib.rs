//! HTTP surface and process runtime for the order fulfillment saga.
//!
//! One binary serves any subset of the participants (`SERVICE_ROLE`). Each
//! participant mounts its routes, drains its outbox onto the bus and consumes
//! the shared event topic, with structured logging (tracing) and Prometheus
//! metrics.

pub mod config;
pub mod error;
pub mod routes;
pub mod runtime;

use axum::Router;
use axum::routing::get;
use metrics_exporter_prometheus::PrometheusHandle;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use config::ServiceRole;
use runtime::Services;

/// Creates the router for the participants in `services`.
pub fn create_app(role: ServiceRole, services: &Services, metrics_handle: PrometheusHandle) -> Router {
    let mut app = Router::new()
        .route("/health", get(routes::health::check))
        .with_state(role)
        .merge(
            Router::new()
                .route("/metrics", get(routes::metrics::get))
                .with_state(metrics_handle),
        );

    if let Some(orders) = &services.orders {
        app = app.merge(routes::orders::router(orders.clone()));
    }
    if let Some(payments) = &services.payments {
        app = app.merge(routes::payments::router(payments.clone()));
    }
    if let Some(inventory) = &services.inventory {
        app = app.merge(routes::inventory::router(inventory.clone()));
    }
    if let Some(carts) = &services.carts {
        app = app.merge(routes::carts::router(carts.clone()));
    }

    app.layer(
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any),
    )
    .layer(TraceLayer::new_for_http())
}
