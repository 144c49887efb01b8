// Quota counter storage
//
// Counters are only ever touched through atomic increment/decrement so that
// concurrent claimants never need a lock. The Redis store is the one that
// makes limits hold across replicas.

use async_trait::async_trait;
use dashmap::DashMap;
use redis::aio::ConnectionManager as RedisConnectionManager;
use tvmux_core::KeyBuilder;

use crate::error::OrchestratorResult;
use crate::model::OwnerId;

#[async_trait]
pub trait QuotaStore: Send + Sync {
    /// Atomically add one and return the new count
    async fn increment(&self, owner_id: OwnerId) -> OrchestratorResult<i64>;

    /// Atomically subtract one, never going below zero, and return the new count
    async fn decrement(&self, owner_id: OwnerId) -> OrchestratorResult<i64>;

    async fn get(&self, owner_id: OwnerId) -> OrchestratorResult<i64>;
}

/// Per-process counters for single-node deployments and tests.
#[derive(Debug, Default)]
pub struct InMemoryQuotaStore {
    counters: DashMap<OwnerId, i64>,
}

impl InMemoryQuotaStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl QuotaStore for InMemoryQuotaStore {
    async fn increment(&self, owner_id: OwnerId) -> OrchestratorResult<i64> {
        let mut entry = self.counters.entry(owner_id).or_insert(0);
        *entry += 1;
        Ok(*entry)
    }

    async fn decrement(&self, owner_id: OwnerId) -> OrchestratorResult<i64> {
        let mut entry = self.counters.entry(owner_id).or_insert(0);
        if *entry > 0 {
            *entry -= 1;
        } else {
            tracing::warn!(owner_id, "Attempted to release quota below zero");
        }
        Ok(*entry)
    }

    async fn get(&self, owner_id: OwnerId) -> OrchestratorResult<i64> {
        Ok(self.counters.get(&owner_id).map_or(0, |v| *v))
    }
}

/// Floor-at-zero decrement; returns -1 when the counter was already zero.
const DECREMENT_SCRIPT: &str = r#"
    local n = redis.call('DECR', KEYS[1])
    if n < 0 then
        redis.call('SET', KEYS[1], 0)
        return -1
    end
    return n
"#;

#[derive(Clone)]
pub struct RedisQuotaStore {
    redis: RedisConnectionManager,
    keys: KeyBuilder,
}

impl RedisQuotaStore {
    #[must_use]
    pub const fn new(redis: RedisConnectionManager, keys: KeyBuilder) -> Self {
        Self { redis, keys }
    }
}

#[async_trait]
impl QuotaStore for RedisQuotaStore {
    async fn increment(&self, owner_id: OwnerId) -> OrchestratorResult<i64> {
        let mut conn = self.redis.clone();
        let count: i64 = redis::cmd("INCR")
            .arg(self.keys.quota_counter(&owner_id.to_string()))
            .query_async(&mut conn)
            .await?;
        Ok(count)
    }

    async fn decrement(&self, owner_id: OwnerId) -> OrchestratorResult<i64> {
        let mut conn = self.redis.clone();
        let count: i64 = redis::Script::new(DECREMENT_SCRIPT)
            .key(self.keys.quota_counter(&owner_id.to_string()))
            .invoke_async(&mut conn)
            .await?;

        if count < 0 {
            tracing::warn!(owner_id, "Attempted to release quota below zero");
            return Ok(0);
        }
        Ok(count)
    }

    async fn get(&self, owner_id: OwnerId) -> OrchestratorResult<i64> {
        let mut conn = self.redis.clone();
        let count: Option<i64> = redis::cmd("GET")
            .arg(self.keys.quota_counter(&owner_id.to_string()))
            .query_async(&mut conn)
            .await?;
        Ok(count.unwrap_or(0))
    }
}
