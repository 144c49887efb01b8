//! Play, stop and status of stream sessions.

use axum::{
    extract::{Path, State},
    Json,
};
use serde::Serialize;
use tracing::info;
use tvmux_orchestrator::status::{CleanupReport, SessionHealth};
use tvmux_orchestrator::{ActiveSource, SessionKey, StreamSession, StreamType};

use super::{AppResult, AppState};

#[derive(Debug, Serialize)]
pub struct StreamList {
    pub count: usize,
    pub sessions: Vec<StreamSession>,
}

#[derive(Debug, Serialize)]
pub struct StopResponse {
    pub stopped: bool,
}

fn session_key(stream_type: &str, model_id: u64) -> AppResult<SessionKey> {
    let stream_type: StreamType = stream_type.parse()?;
    Ok(SessionKey::new(stream_type, model_id))
}

pub async fn list_streams(State(state): State<AppState>) -> AppResult<Json<StreamList>> {
    let sessions = state.status.list_sessions().await?;
    Ok(Json(StreamList {
        count: sessions.len(),
        sessions,
    }))
}

pub async fn get_stream(
    State(state): State<AppState>,
    Path((stream_type, model_id)): Path<(String, u64)>,
) -> AppResult<Json<SessionHealth>> {
    let key = session_key(&stream_type, model_id)?;
    Ok(Json(state.status.health(key).await?))
}

/// Dropping this future (client gone) releases any claim the attempt held.
pub async fn play(
    State(state): State<AppState>,
    Path((stream_type, model_id)): Path<(String, u64)>,
) -> AppResult<Json<ActiveSource>> {
    let key = session_key(&stream_type, model_id)?;
    let active = state.controller.resolve_and_start(key).await?;
    Ok(Json(active))
}

pub async fn stop(
    State(state): State<AppState>,
    Path((stream_type, model_id)): Path<(String, u64)>,
) -> AppResult<Json<StopResponse>> {
    let key = session_key(&stream_type, model_id)?;
    let stopped = state.controller.stop(key).await?;
    info!(%key, stopped, "Administrative stop");
    Ok(Json(StopResponse { stopped }))
}

pub async fn cleanup(State(state): State<AppState>) -> AppResult<Json<CleanupReport>> {
    Ok(Json(state.status.cleanup().await?))
}
