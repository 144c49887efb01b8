//! Distributed lock using Redis
//!
//! Used as the creation marker for stream sessions and shared streams: only
//! the holder of the marker may start the underlying process.
//! Acquisition is a single `SET NX PX`; release and extension are
//! compare-and-delete / compare-and-expire Lua scripts keyed on the token.

use redis::aio::ConnectionManager as RedisConnectionManager;
use redis::Script;
use std::time::Duration;

use crate::{Error, KeyBuilder, Result};

#[derive(Clone)]
pub struct DistributedLock {
    redis: RedisConnectionManager,
    keys: KeyBuilder,
}

impl DistributedLock {
    #[must_use]
    pub const fn new(redis: RedisConnectionManager, keys: KeyBuilder) -> Self {
        Self { redis, keys }
    }

    /// Try to take the lock. Returns the holder token, or None if it is held.
    pub async fn acquire(&self, name: &str, ttl: Duration) -> Result<Option<String>> {
        let lock_key = self.keys.lock(name);
        let token = nanoid::nanoid!(16);
        let mut conn = self.redis.clone();

        let result: Option<String> = redis::cmd("SET")
            .arg(&lock_key)
            .arg(&token)
            .arg("NX")
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await
            .map_err(|e| Error::Internal(format!("Failed to acquire lock: {e}")))?;

        if result.is_some() {
            tracing::debug!(lock_key = %lock_key, ttl_ms = ttl_millis(ttl), "Lock acquired");
            Ok(Some(token))
        } else {
            tracing::trace!(lock_key = %lock_key, "Lock already held");
            Ok(None)
        }
    }

    /// Release the lock if `token` still owns it.
    ///
    /// Returns false when the lock expired or was re-taken by someone else.
    pub async fn release(&self, name: &str, token: &str) -> Result<bool> {
        let lock_key = self.keys.lock(name);
        let script = Script::new(
            r#"
            if redis.call("GET", KEYS[1]) == ARGV[1] then
                return redis.call("DEL", KEYS[1])
            else
                return 0
            end
            "#,
        );

        let mut conn = self.redis.clone();
        let result: i32 = script
            .key(&lock_key)
            .arg(token)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| Error::Internal(format!("Failed to release lock: {e}")))?;

        let released = result == 1;
        if !released {
            tracing::warn!(lock_key = %lock_key, "Lock release failed: token mismatch or expired");
        }
        Ok(released)
    }

    /// Extend the TTL of a held lock.
    pub async fn extend(&self, name: &str, token: &str, ttl: Duration) -> Result<bool> {
        let lock_key = self.keys.lock(name);
        let script = Script::new(
            r#"
            if redis.call("GET", KEYS[1]) == ARGV[1] then
                return redis.call("PEXPIRE", KEYS[1], ARGV[2])
            else
                return 0
            end
            "#,
        );

        let mut conn = self.redis.clone();
        let result: i32 = script
            .key(&lock_key)
            .arg(token)
            .arg(ttl_millis(ttl))
            .invoke_async(&mut conn)
            .await
            .map_err(|e| Error::Internal(format!("Failed to extend lock: {e}")))?;

        Ok(result == 1)
    }

    /// Whether anyone currently holds the lock.
    pub async fn is_held(&self, name: &str) -> Result<bool> {
        let mut conn = self.redis.clone();
        let exists: bool = redis::cmd("EXISTS")
            .arg(self.keys.lock(name))
            .query_async(&mut conn)
            .await?;
        Ok(exists)
    }
}

fn ttl_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}
