//! Liveness endpoint for monitoring probes.

use axum::{response::IntoResponse, routing::get, Router};

use super::AppState;

pub fn create_health_router() -> Router<AppState> {
    Router::new().route("/health", get(health_check))
}

pub async fn health_check() -> impl IntoResponse {
    "OK"
}
