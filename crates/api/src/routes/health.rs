//! Health check endpoint.

use axum::Json;
use axum::extract::State;
use serde::Serialize;

use crate::config::ServiceRole;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub role: &'static str,
}

/// GET /health: liveness plus the participants this process runs.
pub async fn check(State(role): State<ServiceRole>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        role: role.as_str(),
    })
}
