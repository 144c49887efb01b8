use thiserror::Error;

use crate::model::{OwnerId, SourceId};

/// Errors raised while resolving, starting and supervising stream sessions.
///
/// `SourceNotResponding`, `LaunchFailure` and `QuotaExceeded` are candidate
/// failures: the failover loop logs them and moves on to the next source.
/// Everything else is terminal for the attempt.
#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("Source {source_id} is not responding: {reason}")]
    SourceNotResponding { source_id: SourceId, reason: String },

    #[error("Failed to launch source {source_id}: {reason}")]
    LaunchFailure { source_id: SourceId, reason: String },

    #[error("Quota exceeded for owner {owner_id}")]
    QuotaExceeded { owner_id: OwnerId },

    #[error("No source available for {key}")]
    ChainExhausted { key: String },

    #[error("Resource setup failed: {0}")]
    ResourceSetup(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid stream key: {0}")]
    InvalidStreamKey(String),

    #[error("Timed out waiting for {0}")]
    JoinTimeout(String),

    #[error("Request cancelled")]
    Cancelled,

    #[error("Store error: {0}")]
    Store(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl OrchestratorError {
    /// Whether the failover loop should try the next candidate.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::SourceNotResponding { .. } | Self::LaunchFailure { .. } | Self::QuotaExceeded { .. }
        )
    }

    pub(crate) fn not_responding(source_id: SourceId, reason: impl Into<String>) -> Self {
        Self::SourceNotResponding {
            source_id,
            reason: reason.into(),
        }
    }

    pub(crate) fn launch_failure(source_id: SourceId, reason: impl Into<String>) -> Self {
        Self::LaunchFailure {
            source_id,
            reason: reason.into(),
        }
    }
}

pub type OrchestratorResult<T> = Result<T, OrchestratorError>;

impl From<redis::RedisError> for OrchestratorError {
    fn from(err: redis::RedisError) -> Self {
        Self::Store(err.to_string())
    }
}

impl From<tvmux_core::Error> for OrchestratorError {
    fn from(err: tvmux_core::Error) -> Self {
        match err {
            tvmux_core::Error::NotFound(msg) => Self::NotFound(msg),
            tvmux_core::Error::Serialization(e) => Self::Serialization(e),
            other => Self::Store(other.to_string()),
        }
    }
}
