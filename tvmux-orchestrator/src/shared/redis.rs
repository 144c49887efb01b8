// Redis-backed shared stream store
//
// Per stream key: a hash for the stream row, a hash of client rows (JSON by
// client id) and a list of stat samples. A set indexes live stream keys.
// Client-count changes run as Lua scripts together with the client row
// change.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use redis::aio::ConnectionManager as RedisConnectionManager;
use redis::Script;
use std::collections::HashMap;
use std::time::Duration;
use tracing::warn;
use tvmux_core::{DistributedLock, KeyBuilder};

use super::store::SharedStreamStore;
use super::{HealthStatus, SharedStream, SharedStreamClient, SharedStreamStat, SharedStreamStatus};
use crate::error::OrchestratorResult;

const CREATE_SCRIPT: &str = r#"
    redis.call('DEL', KEYS[1], KEYS[2])
    redis.call('HSET', KEYS[1],
        'status', ARGV[2], 'health_status', ARGV[3], 'client_count', 1,
        'bandwidth_kbps', ARGV[4], 'node_id', ARGV[5],
        'created_at', ARGV[6], 'last_client_activity', ARGV[7],
        'owns_session', ARGV[10])
    redis.call('HSET', KEYS[2], ARGV[8], ARGV[9])
    redis.call('SADD', KEYS[3], ARGV[1])
    return 1
"#;

const ADD_CLIENT_SCRIPT: &str = r#"
    if redis.call('EXISTS', KEYS[1]) == 0 then
        return -1
    end
    if redis.call('HSETNX', KEYS[2], ARGV[1], ARGV[2]) == 1 then
        redis.call('HSET', KEYS[1], 'last_client_activity', ARGV[3])
        return redis.call('HINCRBY', KEYS[1], 'client_count', 1)
    end
    return tonumber(redis.call('HGET', KEYS[1], 'client_count'))
"#;

const REMOVE_CLIENT_SCRIPT: &str = r#"
    if redis.call('HDEL', KEYS[2], ARGV[1]) == 0 then
        return -1
    end
    if redis.call('EXISTS', KEYS[1]) == 0 then
        return -1
    end
    local n = redis.call('HINCRBY', KEYS[1], 'client_count', -1)
    if n < 0 then
        redis.call('HSET', KEYS[1], 'client_count', 0)
        n = 0
    end
    redis.call('HSET', KEYS[1], 'last_client_activity', ARGV[2])
    return n
"#;

const TOUCH_SCRIPT: &str = r#"
    if redis.call('HEXISTS', KEYS[1], ARGV[1]) == 0 then
        return 0
    end
    redis.call('HSET', KEYS[1], ARGV[1], ARGV[2])
    return 1
"#;

const UPDATE_SCRIPT: &str = r#"
    if redis.call('EXISTS', KEYS[1]) == 0 then
        return 0
    end
    for i = 1, #ARGV, 2 do
        redis.call('HSET', KEYS[1], ARGV[i], ARGV[i + 1])
    end
    return 1
"#;

const DELETE_IF_IDLE_SCRIPT: &str = r#"
    local n = redis.call('HGET', KEYS[1], 'client_count')
    if not n or tonumber(n) > 0 then
        return 0
    end
    redis.call('DEL', KEYS[1], KEYS[2])
    redis.call('SREM', KEYS[3], ARGV[1])
    return 1
"#;

const DELETE_SCRIPT: &str = r#"
    local existed = redis.call('DEL', KEYS[1])
    redis.call('DEL', KEYS[2])
    redis.call('SREM', KEYS[3], ARGV[1])
    return existed
"#;

#[derive(Clone)]
pub struct RedisSharedStreamStore {
    redis: RedisConnectionManager,
    keys: KeyBuilder,
    lock: DistributedLock,
}

impl RedisSharedStreamStore {
    #[must_use]
    pub fn new(redis: RedisConnectionManager, keys: KeyBuilder) -> Self {
        let lock = DistributedLock::new(redis.clone(), keys.clone());
        Self { redis, keys, lock }
    }

    fn creator_lock(stream_key: &str) -> String {
        format!("shared:{stream_key}")
    }

    async fn update(&self, stream_key: &str, fields: &[(&str, String)]) -> OrchestratorResult<bool> {
        let script = Script::new(UPDATE_SCRIPT);
        let mut invocation = script.key(self.keys.shared_stream(stream_key));
        for (field, value) in fields {
            invocation.arg(*field).arg(value);
        }
        let mut conn = self.redis.clone();
        let updated: i32 = invocation.invoke_async(&mut conn).await?;
        Ok(updated == 1)
    }
}

fn millis(t: DateTime<Utc>) -> String {
    t.timestamp_millis().to_string()
}

fn parse_millis(raw: Option<&String>) -> Option<DateTime<Utc>> {
    raw.and_then(|v| v.parse::<i64>().ok())
        .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
}

/// Rebuild a stream row from its hash; `None` for an empty or partial hash.
fn stream_from_hash(stream_key: &str, fields: &HashMap<String, String>) -> Option<SharedStream> {
    let created_at = parse_millis(fields.get("created_at"))?;
    Some(SharedStream {
        stream_key: stream_key.to_string(),
        status: SharedStreamStatus::parse(fields.get("status")?)?,
        health_status: fields
            .get("health_status")
            .and_then(|h| HealthStatus::parse(h))
            .unwrap_or(HealthStatus::Unknown),
        client_count: fields
            .get("client_count")
            .and_then(|n| n.parse::<i64>().ok())
            .map_or(0, |n| u64::try_from(n).unwrap_or(0)),
        bandwidth_kbps: fields
            .get("bandwidth_kbps")
            .and_then(|n| n.parse().ok())
            .unwrap_or(0),
        node_id: fields.get("node_id").cloned().unwrap_or_default(),
        owns_session: fields.get("owns_session").is_none_or(|v| v == "1"),
        created_at,
        last_client_activity: parse_millis(fields.get("last_client_activity")).unwrap_or(created_at),
    })
}

fn count(raw: i64) -> Option<u64> {
    u64::try_from(raw).ok()
}

#[async_trait]
impl SharedStreamStore for RedisSharedStreamStore {
    async fn try_claim_creator(&self, stream_key: &str, ttl: Duration) -> OrchestratorResult<Option<String>> {
        Ok(self.lock.acquire(&Self::creator_lock(stream_key), ttl).await?)
    }

    async fn release_creator(&self, stream_key: &str, token: &str) -> OrchestratorResult<()> {
        self.lock.release(&Self::creator_lock(stream_key), token).await?;
        Ok(())
    }

    async fn get(&self, stream_key: &str) -> OrchestratorResult<Option<SharedStream>> {
        let mut conn = self.redis.clone();
        let fields: HashMap<String, String> = redis::cmd("HGETALL")
            .arg(self.keys.shared_stream(stream_key))
            .query_async(&mut conn)
            .await?;
        if fields.is_empty() {
            return Ok(None);
        }
        let stream = stream_from_hash(stream_key, &fields);
        if stream.is_none() {
            warn!(stream_key, "Ignoring malformed shared stream row");
        }
        Ok(stream)
    }

    async fn create(&self, stream: &SharedStream, first_client: &SharedStreamClient) -> OrchestratorResult<()> {
        let key = &stream.stream_key;
        let mut conn = self.redis.clone();
        let _: i32 = Script::new(CREATE_SCRIPT)
            .key(self.keys.shared_stream(key))
            .key(self.keys.shared_clients(key))
            .key(self.keys.shared_index())
            .arg(key)
            .arg(stream.status.as_str())
            .arg(stream.health_status.as_str())
            .arg(stream.bandwidth_kbps)
            .arg(&stream.node_id)
            .arg(millis(stream.created_at))
            .arg(millis(stream.last_client_activity))
            .arg(&first_client.client_id)
            .arg(serde_json::to_string(first_client)?)
            .arg(u8::from(stream.owns_session))
            .invoke_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn add_client(&self, client: &SharedStreamClient) -> OrchestratorResult<Option<u64>> {
        let key = &client.stream_key;
        let mut conn = self.redis.clone();
        let n: i64 = Script::new(ADD_CLIENT_SCRIPT)
            .key(self.keys.shared_stream(key))
            .key(self.keys.shared_clients(key))
            .arg(&client.client_id)
            .arg(serde_json::to_string(client)?)
            .arg(millis(client.connected_at))
            .invoke_async(&mut conn)
            .await?;
        Ok(count(n))
    }

    async fn remove_client(
        &self,
        stream_key: &str,
        client_id: &str,
        now: DateTime<Utc>,
    ) -> OrchestratorResult<Option<u64>> {
        let mut conn = self.redis.clone();
        let n: i64 = Script::new(REMOVE_CLIENT_SCRIPT)
            .key(self.keys.shared_stream(stream_key))
            .key(self.keys.shared_clients(stream_key))
            .arg(client_id)
            .arg(millis(now))
            .invoke_async(&mut conn)
            .await?;
        Ok(count(n))
    }

    async fn touch(&self, stream_key: &str, client_id: &str, now: DateTime<Utc>) -> OrchestratorResult<bool> {
        let mut conn = self.redis.clone();
        let raw: Option<String> = redis::cmd("HGET")
            .arg(self.keys.shared_clients(stream_key))
            .arg(client_id)
            .query_async(&mut conn)
            .await?;
        let Some(raw) = raw else {
            return Ok(false);
        };

        let mut client: SharedStreamClient = serde_json::from_str(&raw)?;
        client.last_seen = now;
        let touched: i32 = Script::new(TOUCH_SCRIPT)
            .key(self.keys.shared_clients(stream_key))
            .arg(client_id)
            .arg(serde_json::to_string(&client)?)
            .invoke_async(&mut conn)
            .await?;
        Ok(touched == 1)
    }

    async fn set_status(
        &self,
        stream_key: &str,
        status: SharedStreamStatus,
        health: HealthStatus,
    ) -> OrchestratorResult<bool> {
        self.update(
            stream_key,
            &[
                ("status", status.as_str().to_string()),
                ("health_status", health.as_str().to_string()),
            ],
        )
        .await
    }

    async fn set_bandwidth(&self, stream_key: &str, kbps: u32) -> OrchestratorResult<bool> {
        self.update(stream_key, &[("bandwidth_kbps", kbps.to_string())]).await
    }

    async fn delete_if_idle(&self, stream_key: &str) -> OrchestratorResult<bool> {
        let mut conn = self.redis.clone();
        let deleted: i32 = Script::new(DELETE_IF_IDLE_SCRIPT)
            .key(self.keys.shared_stream(stream_key))
            .key(self.keys.shared_clients(stream_key))
            .key(self.keys.shared_index())
            .arg(stream_key)
            .invoke_async(&mut conn)
            .await?;
        Ok(deleted == 1)
    }

    async fn delete(&self, stream_key: &str) -> OrchestratorResult<bool> {
        let mut conn = self.redis.clone();
        let existed: i32 = Script::new(DELETE_SCRIPT)
            .key(self.keys.shared_stream(stream_key))
            .key(self.keys.shared_clients(stream_key))
            .key(self.keys.shared_index())
            .arg(stream_key)
            .invoke_async(&mut conn)
            .await?;
        Ok(existed == 1)
    }

    async fn list(&self) -> OrchestratorResult<Vec<SharedStream>> {
        let mut conn = self.redis.clone();
        let members: Vec<String> = redis::cmd("SMEMBERS")
            .arg(self.keys.shared_index())
            .query_async(&mut conn)
            .await?;

        let mut streams = Vec::with_capacity(members.len());
        for stream_key in members {
            if let Some(stream) = self.get(&stream_key).await? {
                streams.push(stream);
            }
        }
        Ok(streams)
    }

    async fn clients(&self, stream_key: &str) -> OrchestratorResult<Vec<SharedStreamClient>> {
        let mut conn = self.redis.clone();
        let rows: HashMap<String, String> = redis::cmd("HGETALL")
            .arg(self.keys.shared_clients(stream_key))
            .query_async(&mut conn)
            .await?;

        Ok(rows
            .into_iter()
            .filter_map(|(client_id, raw)| match serde_json::from_str(&raw) {
                Ok(client) => Some(client),
                Err(e) => {
                    warn!(stream_key, client_id = %client_id, error = %e, "Ignoring malformed client row");
                    None
                }
            })
            .collect())
    }

    async fn record_stat(&self, stat: &SharedStreamStat) -> OrchestratorResult<()> {
        let mut conn = self.redis.clone();
        let _: i64 = redis::cmd("RPUSH")
            .arg(self.keys.shared_stats(&stat.stream_key))
            .arg(serde_json::to_string(stat)?)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn stats(&self, stream_key: &str) -> OrchestratorResult<Vec<SharedStreamStat>> {
        let mut conn = self.redis.clone();
        let raw: Vec<String> = redis::cmd("LRANGE")
            .arg(self.keys.shared_stats(stream_key))
            .arg(0)
            .arg(-1)
            .query_async(&mut conn)
            .await?;
        raw.iter()
            .map(|s| Ok(serde_json::from_str::<SharedStreamStat>(s)?))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_from_hash() {
        let fields: HashMap<String, String> = [
            ("status", "active"),
            ("health_status", "healthy"),
            ("client_count", "3"),
            ("bandwidth_kbps", "2500"),
            ("node_id", "node-a"),
            ("created_at", "1700000000000"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        let stream = stream_from_hash("ch-A", &fields).unwrap();
        assert_eq!(stream.client_count, 3);
        assert_eq!(stream.status, SharedStreamStatus::Active);
        assert_eq!(stream.bandwidth_kbps, 2500);
        assert_eq!(stream.last_client_activity, stream.created_at);
        assert!(stream.owns_session);
    }

    #[test]
    fn test_stream_from_hash_adopted_session() {
        let fields: HashMap<String, String> = [
            ("status", "active"),
            ("node_id", "node-a"),
            ("created_at", "1700000000000"),
            ("owns_session", "0"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        assert!(!stream_from_hash("channel:1", &fields).unwrap().owns_session);
    }

    #[test]
    fn test_stream_from_partial_hash() {
        let fields = HashMap::from([("client_count".to_string(), "1".to_string())]);
        assert!(stream_from_hash("ch-A", &fields).is_none());
    }

    #[test]
    fn test_negative_script_result_is_absent() {
        assert_eq!(count(-1), None);
        assert_eq!(count(0), Some(0));
    }

    #[tokio::test]
    #[ignore = "Requires Redis"]
    async fn test_redis_client_accounting() {
        let client = redis::Client::open("redis://localhost:6379").unwrap();
        let redis = RedisConnectionManager::new(client).await.unwrap();
        let store = RedisSharedStreamStore::new(redis, KeyBuilder::new(format!("tvmux-test-{}", nanoid::nanoid!(6))));
        let now = Utc::now();

        store
            .create(
                &crate::shared::store::test_stream("ch-A", "node-a"),
                &SharedStreamClient::new("ch-A", "c1", now),
            )
            .await
            .unwrap();
        assert_eq!(store.add_client(&SharedStreamClient::new("ch-A", "c2", now)).await.unwrap(), Some(2));
        assert_eq!(store.add_client(&SharedStreamClient::new("ch-A", "c2", now)).await.unwrap(), Some(2));
        assert!(store.touch("ch-A", "c2", now).await.unwrap());
        assert_eq!(store.remove_client("ch-A", "c2", now).await.unwrap(), Some(1));
        assert_eq!(store.remove_client("ch-A", "c2", now).await.unwrap(), None);

        assert!(!store.delete_if_idle("ch-A").await.unwrap());
        assert_eq!(store.remove_client("ch-A", "c1", now).await.unwrap(), Some(0));
        assert!(store.delete_if_idle("ch-A").await.unwrap());
        assert!(store.list().await.unwrap().is_empty());
    }
}
