use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

use super::{HealthStatus, SharedStream, SharedStreamClient, SharedStreamStat, SharedStreamStatus};
use crate::error::OrchestratorResult;

/// Persistence for shared streams, their clients and usage samples.
///
/// Every operation that changes `client_count` is atomic together with the
/// matching client row change, so attach and detach stay symmetric.
#[async_trait]
pub trait SharedStreamStore: Send + Sync {
    /// Compare-and-set the key's creator marker; returns the holder token
    async fn try_claim_creator(&self, stream_key: &str, ttl: Duration) -> OrchestratorResult<Option<String>>;

    async fn release_creator(&self, stream_key: &str, token: &str) -> OrchestratorResult<()>;

    async fn get(&self, stream_key: &str) -> OrchestratorResult<Option<SharedStream>>;

    /// Insert the stream row together with its first client
    async fn create(&self, stream: &SharedStream, first_client: &SharedStreamClient) -> OrchestratorResult<()>;

    /// Attach a client. `None` when the stream row does not exist; a client
    /// already attached is not counted twice.
    async fn add_client(&self, client: &SharedStreamClient) -> OrchestratorResult<Option<u64>>;

    /// Detach a client. `None` when it was not attached.
    async fn remove_client(
        &self,
        stream_key: &str,
        client_id: &str,
        now: DateTime<Utc>,
    ) -> OrchestratorResult<Option<u64>>;

    /// Record client activity; false when the client is not attached
    async fn touch(&self, stream_key: &str, client_id: &str, now: DateTime<Utc>) -> OrchestratorResult<bool>;

    async fn set_status(
        &self,
        stream_key: &str,
        status: SharedStreamStatus,
        health: HealthStatus,
    ) -> OrchestratorResult<bool>;

    async fn set_bandwidth(&self, stream_key: &str, kbps: u32) -> OrchestratorResult<bool>;

    /// Delete the stream and its clients only if no client is attached
    async fn delete_if_idle(&self, stream_key: &str) -> OrchestratorResult<bool>;

    /// Delete the stream and its clients unconditionally
    async fn delete(&self, stream_key: &str) -> OrchestratorResult<bool>;

    async fn list(&self) -> OrchestratorResult<Vec<SharedStream>>;

    async fn clients(&self, stream_key: &str) -> OrchestratorResult<Vec<SharedStreamClient>>;

    async fn record_stat(&self, stat: &SharedStreamStat) -> OrchestratorResult<()>;

    async fn stats(&self, stream_key: &str) -> OrchestratorResult<Vec<SharedStreamStat>>;
}

#[derive(Debug, Default)]
struct State {
    streams: HashMap<String, SharedStream>,
    clients: HashMap<String, HashMap<String, SharedStreamClient>>,
    stats: HashMap<String, Vec<SharedStreamStat>>,
    creators: HashMap<String, (String, Instant)>,
}

/// Single-node store; one mutex makes every operation atomic.
#[derive(Debug, Default)]
pub struct InMemorySharedStreamStore {
    state: Mutex<State>,
}

impl InMemorySharedStreamStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SharedStreamStore for InMemorySharedStreamStore {
    async fn try_claim_creator(&self, stream_key: &str, ttl: Duration) -> OrchestratorResult<Option<String>> {
        let mut state = self.state.lock();
        let now = Instant::now();
        if state
            .creators
            .get(stream_key)
            .is_some_and(|(_, expires)| *expires > now)
        {
            return Ok(None);
        }
        let token = nanoid::nanoid!(16);
        state
            .creators
            .insert(stream_key.to_string(), (token.clone(), now + ttl));
        Ok(Some(token))
    }

    async fn release_creator(&self, stream_key: &str, token: &str) -> OrchestratorResult<()> {
        let mut state = self.state.lock();
        if state
            .creators
            .get(stream_key)
            .is_some_and(|(held, _)| held == token)
        {
            state.creators.remove(stream_key);
        }
        Ok(())
    }

    async fn get(&self, stream_key: &str) -> OrchestratorResult<Option<SharedStream>> {
        Ok(self.state.lock().streams.get(stream_key).cloned())
    }

    async fn create(&self, stream: &SharedStream, first_client: &SharedStreamClient) -> OrchestratorResult<()> {
        let mut state = self.state.lock();
        let mut stream = stream.clone();
        stream.client_count = 1;
        state.streams.insert(stream.stream_key.clone(), stream);
        state.clients.insert(
            first_client.stream_key.clone(),
            HashMap::from([(first_client.client_id.clone(), first_client.clone())]),
        );
        Ok(())
    }

    async fn add_client(&self, client: &SharedStreamClient) -> OrchestratorResult<Option<u64>> {
        let mut state = self.state.lock();
        let State { streams, clients, .. } = &mut *state;
        let Some(stream) = streams.get_mut(&client.stream_key) else {
            return Ok(None);
        };

        let rows = clients.entry(client.stream_key.clone()).or_default();
        if !rows.contains_key(&client.client_id) {
            rows.insert(client.client_id.clone(), client.clone());
            stream.client_count += 1;
            stream.last_client_activity = client.connected_at;
        }
        Ok(Some(stream.client_count))
    }

    async fn remove_client(
        &self,
        stream_key: &str,
        client_id: &str,
        now: DateTime<Utc>,
    ) -> OrchestratorResult<Option<u64>> {
        let mut state = self.state.lock();
        let State { streams, clients, .. } = &mut *state;

        let removed = clients
            .get_mut(stream_key)
            .and_then(|rows| rows.remove(client_id))
            .is_some();
        if !removed {
            return Ok(None);
        }
        let Some(stream) = streams.get_mut(stream_key) else {
            return Ok(None);
        };
        stream.client_count = stream.client_count.saturating_sub(1);
        stream.last_client_activity = now;
        Ok(Some(stream.client_count))
    }

    async fn touch(&self, stream_key: &str, client_id: &str, now: DateTime<Utc>) -> OrchestratorResult<bool> {
        let mut state = self.state.lock();
        match state
            .clients
            .get_mut(stream_key)
            .and_then(|rows| rows.get_mut(client_id))
        {
            Some(client) => {
                client.last_seen = now;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn set_status(
        &self,
        stream_key: &str,
        status: SharedStreamStatus,
        health: HealthStatus,
    ) -> OrchestratorResult<bool> {
        let mut state = self.state.lock();
        match state.streams.get_mut(stream_key) {
            Some(stream) => {
                stream.status = status;
                stream.health_status = health;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn set_bandwidth(&self, stream_key: &str, kbps: u32) -> OrchestratorResult<bool> {
        let mut state = self.state.lock();
        match state.streams.get_mut(stream_key) {
            Some(stream) => {
                stream.bandwidth_kbps = kbps;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete_if_idle(&self, stream_key: &str) -> OrchestratorResult<bool> {
        let mut state = self.state.lock();
        if !state
            .streams
            .get(stream_key)
            .is_some_and(|s| s.client_count == 0)
        {
            return Ok(false);
        }
        state.streams.remove(stream_key);
        state.clients.remove(stream_key);
        Ok(true)
    }

    async fn delete(&self, stream_key: &str) -> OrchestratorResult<bool> {
        let mut state = self.state.lock();
        state.clients.remove(stream_key);
        Ok(state.streams.remove(stream_key).is_some())
    }

    async fn list(&self) -> OrchestratorResult<Vec<SharedStream>> {
        Ok(self.state.lock().streams.values().cloned().collect())
    }

    async fn clients(&self, stream_key: &str) -> OrchestratorResult<Vec<SharedStreamClient>> {
        Ok(self
            .state
            .lock()
            .clients
            .get(stream_key)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn record_stat(&self, stat: &SharedStreamStat) -> OrchestratorResult<()> {
        self.state
            .lock()
            .stats
            .entry(stat.stream_key.clone())
            .or_default()
            .push(stat.clone());
        Ok(())
    }

    async fn stats(&self, stream_key: &str) -> OrchestratorResult<Vec<SharedStreamStat>> {
        Ok(self.state.lock().stats.get(stream_key).cloned().unwrap_or_default())
    }
}

#[cfg(test)]
pub(crate) fn test_stream(stream_key: &str, node_id: &str) -> SharedStream {
    let now = Utc::now();
    SharedStream {
        stream_key: stream_key.to_string(),
        status: SharedStreamStatus::Active,
        health_status: HealthStatus::Healthy,
        client_count: 1,
        bandwidth_kbps: 0,
        node_id: node_id.to_string(),
        owns_session: true,
        created_at: now,
        last_client_activity: now,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_attach_detach_symmetry() {
        let store = InMemorySharedStreamStore::new();
        let now = Utc::now();
        store
            .create(&test_stream("ch-A", "n1"), &SharedStreamClient::new("ch-A", "c1", now))
            .await
            .unwrap();

        assert_eq!(store.add_client(&SharedStreamClient::new("ch-A", "c2", now)).await.unwrap(), Some(2));
        // same client again is not double counted
        assert_eq!(store.add_client(&SharedStreamClient::new("ch-A", "c2", now)).await.unwrap(), Some(2));

        assert_eq!(store.remove_client("ch-A", "c2", now).await.unwrap(), Some(1));
        assert_eq!(store.remove_client("ch-A", "c2", now).await.unwrap(), None);
        assert_eq!(store.remove_client("ch-A", "c1", now).await.unwrap(), Some(0));
        assert_eq!(store.get("ch-A").await.unwrap().unwrap().client_count, 0);
    }

    #[tokio::test]
    async fn test_add_client_requires_stream() {
        let store = InMemorySharedStreamStore::new();
        let client = SharedStreamClient::new("ch-B", "c1", Utc::now());
        assert_eq!(store.add_client(&client).await.unwrap(), None);
        assert!(store.clients("ch-B").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_if_idle_respects_clients() {
        let store = InMemorySharedStreamStore::new();
        let now = Utc::now();
        store
            .create(&test_stream("ch-A", "n1"), &SharedStreamClient::new("ch-A", "c1", now))
            .await
            .unwrap();

        assert!(!store.delete_if_idle("ch-A").await.unwrap());
        store.remove_client("ch-A", "c1", now).await.unwrap();
        assert!(store.delete_if_idle("ch-A").await.unwrap());
        assert!(store.get("ch-A").await.unwrap().is_none());
        assert!(!store.delete_if_idle("ch-A").await.unwrap());
    }

    #[tokio::test]
    async fn test_creator_marker_is_exclusive() {
        let store = InMemorySharedStreamStore::new();
        let ttl = Duration::from_secs(10);
        let token = store.try_claim_creator("ch-A", ttl).await.unwrap().unwrap();
        assert!(store.try_claim_creator("ch-A", ttl).await.unwrap().is_none());
        assert!(store.try_claim_creator("ch-B", ttl).await.unwrap().is_some());

        store.release_creator("ch-A", &token).await.unwrap();
        assert!(store.try_claim_creator("ch-A", ttl).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_touch_and_stats() {
        let store = InMemorySharedStreamStore::new();
        let t0 = Utc::now();
        store
            .create(&test_stream("ch-A", "n1"), &SharedStreamClient::new("ch-A", "c1", t0))
            .await
            .unwrap();

        let t1 = t0 + chrono::Duration::seconds(5);
        assert!(store.touch("ch-A", "c1", t1).await.unwrap());
        assert!(!store.touch("ch-A", "nobody", t1).await.unwrap());
        assert_eq!(store.clients("ch-A").await.unwrap()[0].last_seen, t1);

        store
            .record_stat(&SharedStreamStat {
                stream_key: "ch-A".to_string(),
                client_count: 1,
                bandwidth_kbps: 900,
                recorded_at: t1,
            })
            .await
            .unwrap();
        assert_eq!(store.stats("ch-A").await.unwrap().len(), 1);
    }
}
