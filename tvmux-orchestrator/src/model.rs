//! Plain data types shared by every orchestrator component.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::error::OrchestratorError;

pub type SourceId = u64;
pub type OwnerId = u64;

/// Kind of playable item. Channels are live, episodes are VOD.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamType {
    Channel,
    Episode,
}

impl StreamType {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Channel => "channel",
            Self::Episode => "episode",
        }
    }
}

impl fmt::Display for StreamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StreamType {
    type Err = OrchestratorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "channel" => Ok(Self::Channel),
            "episode" => Ok(Self::Episode),
            other => Err(OrchestratorError::InvalidStreamKey(format!(
                "unknown stream type '{other}'"
            ))),
        }
    }
}

/// Identity of a logical play request: at most one session per key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionKey {
    pub stream_type: StreamType,
    pub model_id: SourceId,
}

impl SessionKey {
    #[must_use]
    pub const fn new(stream_type: StreamType, model_id: SourceId) -> Self {
        Self {
            stream_type,
            model_id,
        }
    }
}

/// Formats as `"{type}:{model_id}"`, e.g. `channel:42`.
impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.stream_type, self.model_id)
    }
}

impl FromStr for SessionKey {
    type Err = OrchestratorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (stream_type, model_id) = s
            .split_once(':')
            .ok_or_else(|| OrchestratorError::InvalidStreamKey(s.to_string()))?;
        let model_id = model_id
            .parse()
            .map_err(|_| OrchestratorError::InvalidStreamKey(s.to_string()))?;
        Ok(Self::new(stream_type.parse()?, model_id))
    }
}

/// A playlist whose concurrent-stream limit candidates count against.
///
/// `available_streams == 0` means unlimited. The live counter is owned by the
/// concurrency gate, never by this struct.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaOwner {
    pub id: OwnerId,
    #[serde(default)]
    pub available_streams: u32,
}

impl QuotaOwner {
    #[must_use]
    pub const fn is_unlimited(&self) -> bool {
        self.available_streams == 0
    }

    /// Whether a post-increment count is still within the limit.
    #[must_use]
    pub const fn admits(&self, count_after_claim: i64) -> bool {
        self.is_unlimited() || count_after_claim <= self.available_streams as i64
    }
}

/// A physical stream that can satisfy a logical play request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Source {
    pub id: SourceId,
    pub stream_type: StreamType,
    pub title: String,
    pub url: String,
    pub owner: QuotaOwner,
    #[serde(default)]
    pub user_agent: Option<String>,
}

/// The source that ended up serving a play request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveSource {
    pub key: SessionKey,
    pub source_id: SourceId,
    /// Position of the winning source in its failover chain
    pub source_index: usize,
    pub owner_id: OwnerId,
    pub title: String,
    pub url: String,
    pub output_dir: Option<PathBuf>,
    /// True when an already running session was returned
    pub reused: bool,
}
