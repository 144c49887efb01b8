//! HTTP control API
//!
//! Thin JSON surface over the orchestrator: play/stop, status, shared
//! viewer accounting and proxy events. Media bytes never pass through here.

mod error;
mod health;
mod shared;
mod streams;

use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tvmux_orchestrator::{FailoverController, SharedStreamMultiplexer, StatusService};

pub use error::{AppError, AppResult};

#[derive(Clone)]
pub struct AppState {
    pub controller: Arc<FailoverController>,
    pub status: Arc<StatusService>,
    /// `None` when shared mode is disabled
    pub multiplexer: Option<SharedStreamMultiplexer>,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .merge(health::create_health_router())
        .route("/api/streams", get(streams::list_streams))
        .route("/api/streams/{stream_type}/{model_id}", get(streams::get_stream))
        .route("/api/streams/{stream_type}/{model_id}/play", post(streams::play))
        .route("/api/streams/{stream_type}/{model_id}/stop", post(streams::stop))
        .route("/api/cleanup", post(streams::cleanup))
        .route("/api/shared", get(shared::list_shared))
        .route("/api/shared/{stream_key}", get(shared::get_shared))
        .route(
            "/api/shared/{stream_key}/clients/{client_id}",
            post(shared::join).delete(shared::leave),
        )
        .route(
            "/api/shared/{stream_key}/clients/{client_id}/heartbeat",
            post(shared::heartbeat),
        )
        .route("/api/events", post(shared::proxy_event))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
