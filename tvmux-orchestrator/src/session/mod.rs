//! Stream session registry
//!
//! One running session per [`SessionKey`]. The registry is the only place a
//! session's existence is decided: registration is compare-and-set, removal
//! is an atomic take so exactly one caller ends up releasing the session's
//! quota claim.

mod redis;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use crate::error::OrchestratorResult;
use crate::model::{ActiveSource, OwnerId, SessionKey, SourceId};

pub use self::redis::RedisSessionRegistry;

/// A running relay for one logical play request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamSession {
    pub key: SessionKey,
    pub active_source_id: SourceId,
    /// Title of the active source
    pub title: String,
    /// Title of the originally requested source
    pub original_title: String,
    pub url: String,
    pub pid: Option<u32>,
    /// Node that owns the process
    pub node_id: String,
    /// Full failover chain, originally requested source first
    pub source_ids: Vec<SourceId>,
    pub current_index: usize,
    /// Owner whose quota this session holds
    pub owner_id: OwnerId,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub monitoring_suppressed_until: Option<DateTime<Utc>>,
    #[serde(default)]
    pub output_dir: Option<PathBuf>,
}

impl StreamSession {
    #[must_use]
    pub fn is_monitoring_suppressed(&self, now: DateTime<Utc>) -> bool {
        self.monitoring_suppressed_until.is_some_and(|until| until > now)
    }

    #[must_use]
    pub fn to_active_source(&self, reused: bool) -> ActiveSource {
        ActiveSource {
            key: self.key,
            source_id: self.active_source_id,
            source_index: self.current_index,
            owner_id: self.owner_id,
            title: self.title.clone(),
            url: self.url.clone(),
            output_dir: self.output_dir.clone(),
            reused,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Running,
    /// Failover chain exhausted; kept for observation only
    Terminated,
}

impl SessionStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Terminated => "terminated",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(Self::Running),
            "terminated" => Some(Self::Terminated),
            _ => None,
        }
    }
}

#[async_trait]
pub trait SessionRegistry: Send + Sync {
    /// Register `session` unless a running session already holds its key
    async fn try_register(&self, session: &StreamSession) -> OrchestratorResult<bool>;

    /// The running session for `key`, if any
    async fn get(&self, key: SessionKey) -> OrchestratorResult<Option<StreamSession>>;

    async fn status(&self, key: SessionKey) -> OrchestratorResult<Option<SessionStatus>>;

    /// Atomically take the running session out of the registry
    async fn remove(&self, key: SessionKey) -> OrchestratorResult<Option<StreamSession>>;

    /// Record that the key's failover chain was exhausted
    async fn mark_terminated(&self, key: SessionKey) -> OrchestratorResult<()>;

    /// Set or clear monitoring suppression. Returns false when no session runs.
    async fn set_monitoring_suppressed(
        &self,
        key: SessionKey,
        until: Option<DateTime<Utc>>,
    ) -> OrchestratorResult<bool>;

    async fn list(&self) -> OrchestratorResult<Vec<StreamSession>>;

    /// Take the per-key creation marker; returns the holder token
    async fn try_lock_creation(&self, key: SessionKey, ttl: Duration) -> OrchestratorResult<Option<String>>;

    /// Push the creation marker's expiry out; false when `token` lost it
    async fn extend_creation(&self, key: SessionKey, token: &str, ttl: Duration) -> OrchestratorResult<bool>;

    async fn unlock_creation(&self, key: SessionKey, token: &str) -> OrchestratorResult<()>;
}

#[derive(Debug)]
struct Entry {
    session: Option<StreamSession>,
    status: SessionStatus,
}

/// Single-node registry.
#[derive(Debug, Default)]
pub struct InMemorySessionRegistry {
    entries: Mutex<HashMap<SessionKey, Entry>>,
    creation_locks: Mutex<HashMap<SessionKey, (String, Instant)>>,
}

impl InMemorySessionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionRegistry for InMemorySessionRegistry {
    async fn try_register(&self, session: &StreamSession) -> OrchestratorResult<bool> {
        let mut entries = self.entries.lock();
        if entries
            .get(&session.key)
            .is_some_and(|e| e.status == SessionStatus::Running)
        {
            return Ok(false);
        }
        entries.insert(
            session.key,
            Entry {
                session: Some(session.clone()),
                status: SessionStatus::Running,
            },
        );
        Ok(true)
    }

    async fn get(&self, key: SessionKey) -> OrchestratorResult<Option<StreamSession>> {
        Ok(self
            .entries
            .lock()
            .get(&key)
            .filter(|e| e.status == SessionStatus::Running)
            .and_then(|e| e.session.clone()))
    }

    async fn status(&self, key: SessionKey) -> OrchestratorResult<Option<SessionStatus>> {
        Ok(self.entries.lock().get(&key).map(|e| e.status))
    }

    async fn remove(&self, key: SessionKey) -> OrchestratorResult<Option<StreamSession>> {
        let mut entries = self.entries.lock();
        match entries.get(&key) {
            Some(e) if e.status == SessionStatus::Running => {
                Ok(entries.remove(&key).and_then(|e| e.session))
            }
            _ => Ok(None),
        }
    }

    async fn mark_terminated(&self, key: SessionKey) -> OrchestratorResult<()> {
        self.entries.lock().insert(
            key,
            Entry {
                session: None,
                status: SessionStatus::Terminated,
            },
        );
        Ok(())
    }

    async fn set_monitoring_suppressed(
        &self,
        key: SessionKey,
        until: Option<DateTime<Utc>>,
    ) -> OrchestratorResult<bool> {
        let mut entries = self.entries.lock();
        match entries
            .get_mut(&key)
            .filter(|e| e.status == SessionStatus::Running)
            .and_then(|e| e.session.as_mut())
        {
            Some(session) => {
                session.monitoring_suppressed_until = until;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn list(&self) -> OrchestratorResult<Vec<StreamSession>> {
        Ok(self
            .entries
            .lock()
            .values()
            .filter(|e| e.status == SessionStatus::Running)
            .filter_map(|e| e.session.clone())
            .collect())
    }

    async fn try_lock_creation(&self, key: SessionKey, ttl: Duration) -> OrchestratorResult<Option<String>> {
        let mut locks = self.creation_locks.lock();
        let now = Instant::now();
        if locks.get(&key).is_some_and(|(_, expires)| *expires > now) {
            return Ok(None);
        }
        let token = nanoid::nanoid!(16);
        locks.insert(key, (token.clone(), now + ttl));
        Ok(Some(token))
    }

    async fn extend_creation(&self, key: SessionKey, token: &str, ttl: Duration) -> OrchestratorResult<bool> {
        let mut locks = self.creation_locks.lock();
        match locks.get_mut(&key) {
            Some((held, expires)) if held == token => {
                *expires = Instant::now() + ttl;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn unlock_creation(&self, key: SessionKey, token: &str) -> OrchestratorResult<()> {
        let mut locks = self.creation_locks.lock();
        if locks.get(&key).is_some_and(|(held, _)| held == token) {
            locks.remove(&key);
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) fn test_session(key: SessionKey, source_id: SourceId, owner_id: OwnerId) -> StreamSession {
    StreamSession {
        key,
        active_source_id: source_id,
        title: format!("Source {source_id}"),
        original_title: format!("Source {}", key.model_id),
        url: format!("http://upstream.example/{source_id}.ts"),
        pid: Some(4242),
        node_id: "node-test".to_string(),
        source_ids: vec![key.model_id, source_id],
        current_index: 0,
        owner_id,
        started_at: Utc::now(),
        monitoring_suppressed_until: None,
        output_dir: None,
    }
}
