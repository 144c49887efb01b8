// Viewer multiplexing onto shared upstream sessions
//
// - Joiners attach to an existing row, or race for the creator marker
// - Only the marker holder starts the backend session and creates the row
// - Losers poll until the row appears or the join timeout elapses
// - The last leave schedules teardown after the grace period; any attach
//   cancels it, and teardown re-checks the count under the marker

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tvmux_core::SharedStreamConfig;

use super::store::SharedStreamStore;
use super::{HealthStatus, SessionBackend, SharedStream, SharedStreamClient, SharedStreamStat, SharedStreamStatus};
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::launcher::ProcessHealth;

/// A viewer attached to a shared stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ViewerHandle {
    pub stream_key: String,
    pub client_id: String,
    /// Viewer count right after this join
    pub client_count: u64,
    /// True for the viewer whose join started the upstream session
    pub created: bool,
}

/// Work done by one reaper pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ReapReport {
    pub reconciled_streams: usize,
    pub evicted_clients: usize,
    pub idle_streams_stopped: usize,
    pub stats_recorded: usize,
}

struct Inner {
    store: Arc<dyn SharedStreamStore>,
    backend: Arc<dyn SessionBackend>,
    config: SharedStreamConfig,
    node_id: String,
    pending_teardowns: DashMap<String, (u64, CancellationToken)>,
    next_teardown_id: AtomicU64,
}

#[derive(Clone)]
pub struct SharedStreamMultiplexer {
    inner: Arc<Inner>,
}

impl SharedStreamMultiplexer {
    pub fn new(
        store: Arc<dyn SharedStreamStore>,
        backend: Arc<dyn SessionBackend>,
        config: SharedStreamConfig,
        node_id: impl Into<String>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                backend,
                config,
                node_id: node_id.into(),
                pending_teardowns: DashMap::new(),
                next_teardown_id: AtomicU64::new(0),
            }),
        }
    }

    #[must_use]
    pub fn store(&self) -> &Arc<dyn SharedStreamStore> {
        &self.inner.store
    }

    #[must_use]
    pub fn config(&self) -> &SharedStreamConfig {
        &self.inner.config
    }

    /// Whether a teardown is scheduled for `stream_key`
    #[must_use]
    pub fn teardown_pending(&self, stream_key: &str) -> bool {
        self.inner.pending_teardowns.contains_key(stream_key)
    }

    /// Attach `client_id` to the stream, starting it if nobody runs it yet.
    pub async fn join(&self, stream_key: &str, client_id: &str) -> OrchestratorResult<ViewerHandle> {
        let store = &self.inner.store;
        let join_timeout = self.inner.config.join_timeout();
        let deadline = tokio::time::Instant::now() + join_timeout;

        loop {
            let client = SharedStreamClient::new(stream_key, client_id, Utc::now());
            if let Some(client_count) = store.add_client(&client).await? {
                return Ok(self.attached(stream_key, client_id, client_count));
            }

            if let Some(token) = store.try_claim_creator(stream_key, join_timeout).await? {
                let result = self.create(&client).await;
                if let Err(e) = store.release_creator(stream_key, &token).await {
                    warn!(stream_key, error = %e, "Failed to release creator marker");
                }
                return result;
            }

            if tokio::time::Instant::now() >= deadline {
                warn!(stream_key, client_id, "Timed out waiting for shared stream creation");
                return Err(OrchestratorError::JoinTimeout(stream_key.to_string()));
            }
            debug!(stream_key, client_id, "Shared stream being created elsewhere, waiting");
            tokio::time::sleep(self.inner.config.join_poll_interval()).await;
        }
    }

    async fn create(&self, client: &SharedStreamClient) -> OrchestratorResult<ViewerHandle> {
        let store = &self.inner.store;
        let stream_key = client.stream_key.as_str();

        // the previous holder may have created the row before releasing
        if let Some(client_count) = store.add_client(client).await? {
            return Ok(self.attached(stream_key, &client.client_id, client_count));
        }

        let owns_session = self.inner.backend.start(stream_key).await?;
        if !owns_session {
            info!(stream_key, "Adopting session already running for the key");
        }

        let now = Utc::now();
        let stream = SharedStream {
            stream_key: stream_key.to_string(),
            status: SharedStreamStatus::Active,
            health_status: HealthStatus::Healthy,
            client_count: 1,
            bandwidth_kbps: 0,
            node_id: self.inner.node_id.clone(),
            owns_session,
            created_at: now,
            last_client_activity: now,
        };
        if let Err(e) = store.create(&stream, client).await {
            error!(stream_key, error = %e, "Failed to persist shared stream");
            if owns_session {
                if let Err(stop_err) = self.inner.backend.stop(stream_key).await {
                    error!(stream_key, error = %stop_err, "Failed to stop session");
                }
            }
            return Err(e);
        }

        info!(stream_key, client_id = %client.client_id, "Shared stream created");
        Ok(ViewerHandle {
            stream_key: stream_key.to_string(),
            client_id: client.client_id.clone(),
            client_count: 1,
            created: true,
        })
    }

    fn attached(&self, stream_key: &str, client_id: &str, client_count: u64) -> ViewerHandle {
        self.cancel_teardown(stream_key);
        info!(stream_key, client_id, client_count, "Viewer attached to shared stream");
        ViewerHandle {
            stream_key: stream_key.to_string(),
            client_id: client_id.to_string(),
            client_count,
            created: false,
        }
    }

    /// Attach-only accounting: count a viewer on an existing stream without
    /// ever starting one. `None` when the stream is unknown.
    pub async fn attach(&self, stream_key: &str, client_id: &str) -> OrchestratorResult<Option<u64>> {
        let client = SharedStreamClient::new(stream_key, client_id, Utc::now());
        let count = self.inner.store.add_client(&client).await?;
        if let Some(client_count) = count {
            self.attached(stream_key, client_id, client_count);
        }
        Ok(count)
    }

    /// Detach `client_id`. The last leave schedules teardown after the grace
    /// period. `None` when the client was not attached.
    pub async fn leave(&self, stream_key: &str, client_id: &str) -> OrchestratorResult<Option<u64>> {
        let Some(client_count) = self
            .inner
            .store
            .remove_client(stream_key, client_id, Utc::now())
            .await?
        else {
            debug!(stream_key, client_id, "Leave for unknown viewer");
            return Ok(None);
        };

        info!(stream_key, client_id, client_count, "Viewer left shared stream");
        if client_count == 0 {
            self.schedule_teardown(stream_key);
        }
        Ok(Some(client_count))
    }

    /// Heartbeat from a viewer
    pub async fn touch(&self, stream_key: &str, client_id: &str) -> OrchestratorResult<bool> {
        self.inner.store.touch(stream_key, client_id, Utc::now()).await
    }

    /// Mark the stream as active and healthy; false when unknown.
    pub async fn mark_active(&self, stream_key: &str) -> OrchestratorResult<bool> {
        self.inner
            .store
            .set_status(stream_key, SharedStreamStatus::Active, HealthStatus::Healthy)
            .await
    }

    /// Drop the stream row regardless of viewers, stopping its session if
    /// the row owns it.
    pub async fn reconcile(&self, stream_key: &str) -> OrchestratorResult<bool> {
        self.cancel_teardown(stream_key);
        let owned = self.owns_session(stream_key).await?;
        let existed = self.inner.store.delete(stream_key).await?;
        if owned {
            if let Err(e) = self.inner.backend.stop(stream_key).await {
                warn!(stream_key, error = %e, "Failed to stop session while reconciling");
            }
        }
        if existed {
            info!(stream_key, "Shared stream reconciled");
        }
        Ok(existed)
    }

    async fn owns_session(&self, stream_key: &str) -> OrchestratorResult<bool> {
        Ok(self
            .inner
            .store
            .get(stream_key)
            .await?
            .is_some_and(|stream| stream.owns_session))
    }

    fn cancel_teardown(&self, stream_key: &str) {
        if let Some((_, (_, token))) = self.inner.pending_teardowns.remove(stream_key) {
            token.cancel();
            debug!(stream_key, "Pending teardown cancelled");
        }
    }

    fn schedule_teardown(&self, stream_key: &str) {
        let id = self.inner.next_teardown_id.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        if let Some((_, previous)) = self
            .inner
            .pending_teardowns
            .insert(stream_key.to_string(), (id, token.clone()))
        {
            previous.cancel();
        }

        let grace = self.inner.config.grace_period();
        debug!(stream_key, grace_secs = grace.as_secs(), "Teardown scheduled");

        let this = self.clone();
        let stream_key = stream_key.to_string();
        tokio::spawn(async move {
            tokio::select! {
                () = token.cancelled() => {}
                () = tokio::time::sleep(grace) => {
                    this.inner.pending_teardowns.remove_if(&stream_key, |_, (pending, _)| *pending == id);
                    if let Err(e) = this.teardown(&stream_key).await {
                        error!(stream_key = %stream_key, error = %e, "Shared stream teardown failed");
                    }
                }
            }
        });
    }

    /// Stop the stream if it still has no viewers. Returns whether it stopped.
    pub async fn teardown(&self, stream_key: &str) -> OrchestratorResult<bool> {
        let store = &self.inner.store;
        let Some(token) = store
            .try_claim_creator(stream_key, self.inner.config.join_timeout())
            .await?
        else {
            debug!(stream_key, "Creator marker held, skipping teardown");
            return Ok(false);
        };

        let result: OrchestratorResult<bool> = async {
            let owned = self.owns_session(stream_key).await?;
            if !store.delete_if_idle(stream_key).await? {
                debug!(stream_key, "Viewer arrived during grace period, keeping stream");
                return Ok(false);
            }
            if owned {
                self.inner.backend.stop(stream_key).await?;
                info!(stream_key, "Shared stream stopped");
            } else {
                info!(stream_key, "Shared stream released, adopted session left running");
            }
            Ok(true)
        }
        .await;

        if let Err(e) = store.release_creator(stream_key, &token).await {
            warn!(stream_key, error = %e, "Failed to release creator marker");
        }
        result
    }

    /// One reaper pass at wall-clock time `now`.
    pub async fn reap_at(&self, now: DateTime<Utc>) -> OrchestratorResult<ReapReport> {
        let mut report = ReapReport::default();
        let client_timeout = chrono::Duration::from_std(self.inner.config.client_timeout())
            .unwrap_or_else(|_| chrono::Duration::seconds(60));
        let grace = chrono::Duration::from_std(self.inner.config.grace_period())
            .unwrap_or_else(|_| chrono::Duration::seconds(30));

        for stream in self.inner.store.list().await? {
            if stream.node_id != self.inner.node_id {
                continue;
            }
            let stream_key = stream.stream_key.as_str();

            let health = match self.inner.backend.health(stream_key).await {
                Ok(health) => health,
                Err(e) => {
                    warn!(stream_key, error = %e, "Health check failed, skipping stream");
                    continue;
                }
            };
            match health {
                None | Some(ProcessHealth::Exited { .. }) => {
                    warn!(stream_key, client_count = stream.client_count, "Upstream session gone, reconciling");
                    self.reconcile(stream_key).await?;
                    report.reconciled_streams += 1;
                    continue;
                }
                Some(health) => {
                    let health = HealthStatus::from(health);
                    if health != stream.health_status {
                        self.inner.store.set_status(stream_key, stream.status, health).await?;
                    }
                }
            }

            let mut client_count = stream.client_count;
            for client in self.inner.store.clients(stream_key).await? {
                if now - client.last_seen <= client_timeout {
                    continue;
                }
                warn!(stream_key, client_id = %client.client_id, "Evicting silent viewer");
                if let Some(count) = self.leave(stream_key, &client.client_id).await? {
                    client_count = count;
                    report.evicted_clients += 1;
                }
            }

            if client_count == 0
                && !self.teardown_pending(stream_key)
                && now - stream.last_client_activity > grace
                && self.teardown(stream_key).await?
            {
                report.idle_streams_stopped += 1;
                continue;
            }

            let bandwidth_kbps = self
                .inner
                .backend
                .bandwidth_kbps(stream_key)
                .unwrap_or(stream.bandwidth_kbps);
            self.inner.store.set_bandwidth(stream_key, bandwidth_kbps).await?;
            self.inner
                .store
                .record_stat(&SharedStreamStat {
                    stream_key: stream_key.to_string(),
                    client_count,
                    bandwidth_kbps,
                    recorded_at: now,
                })
                .await?;
            report.stats_recorded += 1;
        }

        if report != ReapReport::default() {
            debug!(?report, "Reaper pass complete");
        }
        Ok(report)
    }

    pub async fn reap(&self) -> OrchestratorResult<ReapReport> {
        self.reap_at(Utc::now()).await
    }

    /// Drop every stream row owned by this node and stop its session.
    pub async fn shutdown(&self) -> OrchestratorResult<usize> {
        let mut stopped = 0;
        for stream in self.inner.store.list().await? {
            if stream.node_id == self.inner.node_id && self.reconcile(&stream.stream_key).await? {
                stopped += 1;
            }
        }
        Ok(stopped)
    }

    /// Run the reaper every `reaper_interval` until cancelled.
    pub async fn run_reaper(self, cancel: CancellationToken) {
        let period = self.inner.config.reaper_interval().max(Duration::from_secs(1));
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(interval_secs = period.as_secs(), "Shared stream reaper started");

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(e) = self.reap().await {
                        error!(error = %e, "Reaper pass failed");
                    }
                }
            }
        }
        info!("Shared stream reaper stopped");
    }
}
