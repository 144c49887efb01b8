//! Shared-mode viewer accounting and proxy webhooks.

use axum::{
    extract::{Path, State},
    Json,
};
use serde::Serialize;
use tvmux_orchestrator::shared::{EventOutcome, ProxyEvent, SharedStream, ViewerHandle};
use tvmux_orchestrator::status::SharedStreamReport;
use tvmux_orchestrator::SharedStreamMultiplexer;

use super::{AppError, AppResult, AppState};

#[derive(Debug, Serialize)]
pub struct LeaveResponse {
    pub client_count: u64,
}

#[derive(Debug, Serialize)]
pub struct HeartbeatResponse {
    pub ok: bool,
}

fn multiplexer(state: &AppState) -> AppResult<&SharedStreamMultiplexer> {
    state
        .multiplexer
        .as_ref()
        .ok_or_else(|| AppError::not_found("Shared stream mode is disabled"))
}

pub async fn list_shared(State(state): State<AppState>) -> AppResult<Json<Vec<SharedStream>>> {
    Ok(Json(state.status.list_shared_streams().await?))
}

pub async fn get_shared(
    State(state): State<AppState>,
    Path(stream_key): Path<String>,
) -> AppResult<Json<SharedStreamReport>> {
    state
        .status
        .shared_stream_stats(&stream_key)
        .await?
        .map(Json)
        .ok_or_else(|| AppError::not_found(format!("Shared stream {stream_key}")))
}

pub async fn join(
    State(state): State<AppState>,
    Path((stream_key, client_id)): Path<(String, String)>,
) -> AppResult<Json<ViewerHandle>> {
    let handle = multiplexer(&state)?.join(&stream_key, &client_id).await?;
    Ok(Json(handle))
}

pub async fn leave(
    State(state): State<AppState>,
    Path((stream_key, client_id)): Path<(String, String)>,
) -> AppResult<Json<LeaveResponse>> {
    multiplexer(&state)?
        .leave(&stream_key, &client_id)
        .await?
        .map(|client_count| Json(LeaveResponse { client_count }))
        .ok_or_else(|| AppError::not_found(format!("Viewer {client_id} on {stream_key}")))
}

pub async fn heartbeat(
    State(state): State<AppState>,
    Path((stream_key, client_id)): Path<(String, String)>,
) -> AppResult<Json<HeartbeatResponse>> {
    if !multiplexer(&state)?.touch(&stream_key, &client_id).await? {
        return Err(AppError::not_found(format!("Viewer {client_id} on {stream_key}")));
    }
    Ok(Json(HeartbeatResponse { ok: true }))
}

pub async fn proxy_event(
    State(state): State<AppState>,
    Json(event): Json<ProxyEvent>,
) -> AppResult<Json<EventOutcome>> {
    Ok(Json(multiplexer(&state)?.apply_event(event).await?))
}
