// Redis-backed session registry
//
// Layout: one hash per key with fields `session` (JSON), `status` and
// `suppressed_until` (epoch millis), plus a set indexing running keys.
// Every state change that must be exclusive runs as a single Lua script.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use redis::aio::ConnectionManager as RedisConnectionManager;
use redis::Script;
use std::time::Duration;
use tracing::{debug, info, warn};
use tvmux_core::{DistributedLock, KeyBuilder};

use super::{SessionRegistry, SessionStatus, StreamSession};
use crate::error::OrchestratorResult;
use crate::model::SessionKey;

/// Terminated markers are kept this long for status queries
const TERMINATED_TTL_SECS: i64 = 3600;

const REGISTER_SCRIPT: &str = r#"
    if redis.call('HGET', KEYS[1], 'status') == 'running' then
        return 0
    end
    redis.call('DEL', KEYS[1])
    redis.call('HSET', KEYS[1], 'session', ARGV[1], 'status', 'running')
    redis.call('SADD', KEYS[2], ARGV[2])
    return 1
"#;

const REMOVE_SCRIPT: &str = r#"
    if redis.call('HGET', KEYS[1], 'status') ~= 'running' then
        return false
    end
    local session = redis.call('HGET', KEYS[1], 'session')
    local suppressed = redis.call('HGET', KEYS[1], 'suppressed_until') or ''
    redis.call('DEL', KEYS[1])
    redis.call('SREM', KEYS[2], ARGV[1])
    if not session then
        return false
    end
    return {session, suppressed}
"#;

const TERMINATE_SCRIPT: &str = r#"
    redis.call('HDEL', KEYS[1], 'session', 'suppressed_until')
    redis.call('HSET', KEYS[1], 'status', 'terminated')
    redis.call('EXPIRE', KEYS[1], ARGV[2])
    redis.call('SREM', KEYS[2], ARGV[1])
    return 1
"#;

const SUPPRESS_SCRIPT: &str = r#"
    if redis.call('HGET', KEYS[1], 'status') ~= 'running' then
        return 0
    end
    if ARGV[1] == '' then
        redis.call('HDEL', KEYS[1], 'suppressed_until')
    else
        redis.call('HSET', KEYS[1], 'suppressed_until', ARGV[1])
    end
    return 1
"#;

#[derive(Clone)]
pub struct RedisSessionRegistry {
    redis: RedisConnectionManager,
    keys: KeyBuilder,
    lock: DistributedLock,
}

impl RedisSessionRegistry {
    #[must_use]
    pub fn new(redis: RedisConnectionManager, keys: KeyBuilder) -> Self {
        let lock = DistributedLock::new(redis.clone(), keys.clone());
        Self { redis, keys, lock }
    }

    fn session_key(&self, key: SessionKey) -> String {
        self.keys
            .session(key.stream_type.as_str(), &key.model_id.to_string())
    }

    fn lock_name(key: SessionKey) -> String {
        format!("create:{key}")
    }
}

fn decode(json: &str, suppressed_until: Option<&str>) -> OrchestratorResult<StreamSession> {
    let mut session: StreamSession = serde_json::from_str(json)?;
    session.monitoring_suppressed_until = suppressed_until
        .and_then(|raw| raw.parse::<i64>().ok())
        .and_then(|ms| Utc.timestamp_millis_opt(ms).single());
    Ok(session)
}

#[async_trait]
impl SessionRegistry for RedisSessionRegistry {
    async fn try_register(&self, session: &StreamSession) -> OrchestratorResult<bool> {
        let mut stored = session.clone();
        // suppression lives in its own field
        stored.monitoring_suppressed_until = None;
        let json = serde_json::to_string(&stored)?;

        let mut conn = self.redis.clone();
        let registered: i32 = Script::new(REGISTER_SCRIPT)
            .key(self.session_key(session.key))
            .key(self.keys.session_index())
            .arg(&json)
            .arg(session.key.to_string())
            .invoke_async(&mut conn)
            .await?;

        if registered == 1 {
            info!(key = %session.key, source_id = session.active_source_id, "Session registered");
        } else {
            debug!(key = %session.key, "Session already running");
        }
        Ok(registered == 1)
    }

    async fn get(&self, key: SessionKey) -> OrchestratorResult<Option<StreamSession>> {
        let mut conn = self.redis.clone();
        let (status, json, suppressed): (Option<String>, Option<String>, Option<String>) = redis::cmd("HMGET")
            .arg(self.session_key(key))
            .arg("status")
            .arg("session")
            .arg("suppressed_until")
            .query_async(&mut conn)
            .await?;

        match (status.as_deref(), json) {
            (Some("running"), Some(json)) => Ok(Some(decode(&json, suppressed.as_deref())?)),
            _ => Ok(None),
        }
    }

    async fn status(&self, key: SessionKey) -> OrchestratorResult<Option<SessionStatus>> {
        let mut conn = self.redis.clone();
        let status: Option<String> = redis::cmd("HGET")
            .arg(self.session_key(key))
            .arg("status")
            .query_async(&mut conn)
            .await?;
        Ok(status.as_deref().and_then(SessionStatus::parse))
    }

    async fn remove(&self, key: SessionKey) -> OrchestratorResult<Option<StreamSession>> {
        let mut conn = self.redis.clone();
        let taken: Option<(String, String)> = Script::new(REMOVE_SCRIPT)
            .key(self.session_key(key))
            .key(self.keys.session_index())
            .arg(key.to_string())
            .invoke_async(&mut conn)
            .await?;

        match taken {
            Some((json, suppressed)) => {
                let suppressed = (!suppressed.is_empty()).then_some(suppressed.as_str());
                Ok(Some(decode(&json, suppressed)?))
            }
            None => Ok(None),
        }
    }

    async fn mark_terminated(&self, key: SessionKey) -> OrchestratorResult<()> {
        let mut conn = self.redis.clone();
        let _: i32 = Script::new(TERMINATE_SCRIPT)
            .key(self.session_key(key))
            .key(self.keys.session_index())
            .arg(key.to_string())
            .arg(TERMINATED_TTL_SECS)
            .invoke_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn set_monitoring_suppressed(
        &self,
        key: SessionKey,
        until: Option<DateTime<Utc>>,
    ) -> OrchestratorResult<bool> {
        let value = until.map(|t| t.timestamp_millis().to_string()).unwrap_or_default();
        let mut conn = self.redis.clone();
        let updated: i32 = Script::new(SUPPRESS_SCRIPT)
            .key(self.session_key(key))
            .arg(value)
            .invoke_async(&mut conn)
            .await?;
        Ok(updated == 1)
    }

    async fn list(&self) -> OrchestratorResult<Vec<StreamSession>> {
        let mut conn = self.redis.clone();
        let members: Vec<String> = redis::cmd("SMEMBERS")
            .arg(self.keys.session_index())
            .query_async(&mut conn)
            .await?;

        let mut sessions = Vec::with_capacity(members.len());
        for member in members {
            let Ok(key) = member.parse::<SessionKey>() else {
                warn!(member = %member, "Dropping malformed session index entry");
                continue;
            };
            if let Some(session) = self.get(key).await? {
                sessions.push(session);
            }
        }
        Ok(sessions)
    }

    async fn try_lock_creation(&self, key: SessionKey, ttl: Duration) -> OrchestratorResult<Option<String>> {
        Ok(self.lock.acquire(&Self::lock_name(key), ttl).await?)
    }

    async fn extend_creation(&self, key: SessionKey, token: &str, ttl: Duration) -> OrchestratorResult<bool> {
        Ok(self.lock.extend(&Self::lock_name(key), token, ttl).await?)
    }

    async fn unlock_creation(&self, key: SessionKey, token: &str) -> OrchestratorResult<()> {
        self.lock.release(&Self::lock_name(key), token).await?;
        Ok(())
    }
}
