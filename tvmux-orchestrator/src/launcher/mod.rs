//! Relay process launching and supervision handles

mod ffmpeg;

use async_trait::async_trait;
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;

use crate::error::OrchestratorResult;
use crate::model::{OwnerId, SessionKey, Source, SourceId, StreamType};

pub use ffmpeg::{FfmpegLauncher, FfmpegProcess};

/// Everything needed to start a relay for one candidate source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchRequest {
    /// Session the relay serves; candidates of one chain share it
    pub session_key: SessionKey,
    pub stream_type: StreamType,
    pub source_id: SourceId,
    pub url: String,
    pub title: String,
    pub owner_id: OwnerId,
    pub user_agent: String,
}

impl LaunchRequest {
    #[must_use]
    pub fn for_source(session_key: SessionKey, source: &Source, user_agent: &str) -> Self {
        Self {
            session_key,
            stream_type: source.stream_type,
            source_id: source.id,
            url: source.url.clone(),
            title: source.title.clone(),
            owner_id: source.owner.id,
            user_agent: user_agent.to_string(),
        }
    }
}

/// Result of one health poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ProcessHealth {
    Healthy,
    /// Running, but no progress for `idle_secs`
    Stalled { idle_secs: u64 },
    Exited { code: Option<i32> },
}

impl ProcessHealth {
    #[must_use]
    pub const fn is_healthy(&self) -> bool {
        matches!(self, Self::Healthy)
    }
}

/// A launched relay process owned by this node.
#[async_trait]
pub trait ProcessHandle: Send + Sync {
    fn pid(&self) -> Option<u32>;

    /// Segment directory the process writes into, owned by this process alone
    fn output_dir(&self) -> Option<&Path>;

    async fn health(&self) -> ProcessHealth;

    /// Kill the process and release its output storage. Idempotent.
    async fn stop(&self);

    /// Latest output bitrate reported by the process
    fn bandwidth_kbps(&self) -> Option<u32>;
}

#[async_trait]
pub trait ProcessLauncher: Send + Sync {
    /// Spawn the relay and confirm it produces output.
    ///
    /// Fails with `ResourceSetup` when output storage cannot be allocated and
    /// with `LaunchFailure` for everything else.
    async fn launch(&self, request: &LaunchRequest) -> OrchestratorResult<Arc<dyn ProcessHandle>>;
}
