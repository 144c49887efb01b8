//! Shared (proxy) mode: many viewers on one upstream session
//!
//! Viewers join and leave by stream key. The first joiner wins the key's
//! creator marker and starts the session; everyone else attaches to the
//! persisted [`SharedStream`] row. The session is stopped a grace period
//! after the last viewer leaves.

mod events;
mod multiplexer;
mod redis;
mod store;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::OrchestratorResult;
use crate::failover::FailoverController;
use crate::launcher::ProcessHealth;
use crate::model::SessionKey;

pub use self::events::{EventOutcome, ProxyEvent};
pub use self::multiplexer::{ReapReport, SharedStreamMultiplexer, ViewerHandle};
pub use self::redis::RedisSharedStreamStore;
pub use self::store::{InMemorySharedStreamStore, SharedStreamStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SharedStreamStatus {
    Starting,
    Active,
    Stopping,
    Error,
}

impl SharedStreamStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Active => "active",
            Self::Stopping => "stopping",
            Self::Error => "error",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "starting" => Some(Self::Starting),
            "active" => Some(Self::Active),
            "stopping" => Some(Self::Stopping),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    Unknown,
}

impl HealthStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Unhealthy => "unhealthy",
            Self::Unknown => "unknown",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "healthy" => Some(Self::Healthy),
            "unhealthy" => Some(Self::Unhealthy),
            "unknown" => Some(Self::Unknown),
            _ => None,
        }
    }
}

impl From<ProcessHealth> for HealthStatus {
    fn from(health: ProcessHealth) -> Self {
        match health {
            ProcessHealth::Healthy => Self::Healthy,
            ProcessHealth::Stalled { .. } | ProcessHealth::Exited { .. } => Self::Unhealthy,
        }
    }
}

/// Persisted state of one shared upstream session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharedStream {
    pub stream_key: String,
    pub status: SharedStreamStatus,
    pub health_status: HealthStatus,
    pub client_count: u64,
    pub bandwidth_kbps: u32,
    /// Node running the upstream session
    pub node_id: String,
    /// False when the key was already playing and the row adopted that
    /// session; only owned sessions are stopped with the row.
    pub owns_session: bool,
    pub created_at: DateTime<Utc>,
    pub last_client_activity: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharedStreamClient {
    pub stream_key: String,
    pub client_id: String,
    pub connected_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

impl SharedStreamClient {
    #[must_use]
    pub fn new(stream_key: &str, client_id: &str, now: DateTime<Utc>) -> Self {
        Self {
            stream_key: stream_key.to_string(),
            client_id: client_id.to_string(),
            connected_at: now,
            last_seen: now,
        }
    }
}

/// Append-only usage sample.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharedStreamStat {
    pub stream_key: String,
    pub client_count: u64,
    pub bandwidth_kbps: u32,
    pub recorded_at: DateTime<Utc>,
}

/// What a shared stream key runs on.
#[async_trait]
pub trait SessionBackend: Send + Sync {
    /// Start or attach to the session for `stream_key`. True when this call
    /// started it.
    async fn start(&self, stream_key: &str) -> OrchestratorResult<bool>;

    async fn stop(&self, stream_key: &str) -> OrchestratorResult<()>;

    /// `None` when nothing runs for the key on this node
    async fn health(&self, stream_key: &str) -> OrchestratorResult<Option<ProcessHealth>>;

    fn bandwidth_kbps(&self, stream_key: &str) -> Option<u32>;
}

/// Backs shared streams with failover-controlled sessions; stream keys are
/// session keys (`channel:42`).
pub struct ControllerBackend {
    controller: Arc<FailoverController>,
}

impl ControllerBackend {
    pub fn new(controller: Arc<FailoverController>) -> Self {
        Self { controller }
    }
}

#[async_trait]
impl SessionBackend for ControllerBackend {
    async fn start(&self, stream_key: &str) -> OrchestratorResult<bool> {
        let key: SessionKey = stream_key.parse()?;
        let active = self.controller.resolve_and_start(key).await?;
        Ok(!active.reused)
    }

    async fn stop(&self, stream_key: &str) -> OrchestratorResult<()> {
        let key: SessionKey = stream_key.parse()?;
        self.controller.stop(key).await?;
        Ok(())
    }

    async fn health(&self, stream_key: &str) -> OrchestratorResult<Option<ProcessHealth>> {
        let key: SessionKey = stream_key.parse()?;
        if self.controller.sessions().get(key).await?.is_none() {
            return Ok(None);
        }
        Ok(self.controller.process_health(key).await)
    }

    fn bandwidth_kbps(&self, stream_key: &str) -> Option<u32> {
        let key: SessionKey = stream_key.parse().ok()?;
        self.controller.bandwidth_kbps(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_strings() {
        for status in [
            SharedStreamStatus::Starting,
            SharedStreamStatus::Active,
            SharedStreamStatus::Stopping,
            SharedStreamStatus::Error,
        ] {
            assert_eq!(SharedStreamStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(HealthStatus::parse("bogus"), None);
    }

    #[test]
    fn test_health_from_process() {
        assert_eq!(HealthStatus::from(ProcessHealth::Healthy), HealthStatus::Healthy);
        assert_eq!(
            HealthStatus::from(ProcessHealth::Stalled { idle_secs: 30 }),
            HealthStatus::Unhealthy
        );
    }
}
