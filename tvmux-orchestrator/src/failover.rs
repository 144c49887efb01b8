//! Failover chain driver
//!
//! For each candidate, in chain order: claim the owner's quota, probe the
//! source, launch the relay. Candidate failures release the claim and
//! advance; only exhaustion and resource setup failures reach the caller.
//! A successful start registers the session, commits the claim to it and
//! submits the session's monitor task.
//!
//! Session creation for a key is serialised by the registry's creation
//! marker, so concurrent requests for the same key start at most one relay.

use chrono::Utc;
use dashmap::DashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tvmux_core::OrchestratorConfig;

use crate::chain::{SourceChain, SourceChainResolver};
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::launcher::{LaunchRequest, ProcessHandle, ProcessHealth, ProcessLauncher};
use crate::model::{ActiveSource, OwnerId, SessionKey, Source};
use crate::monitor::{MonitorQueue, MonitorTask};
use crate::probe::PreflightProbe;
use crate::quota::{ConcurrencyGate, QuotaClaim};
use crate::session::{SessionRegistry, StreamSession};

const CREATION_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Position of one attempt in the start state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailoverState {
    Idle,
    Claiming,
    Probing,
    Launching,
    Running,
    Failed { reason: String },
    Exhausted,
}

impl fmt::Display for FailoverState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => f.write_str("idle"),
            Self::Claiming => f.write_str("claiming"),
            Self::Probing => f.write_str("probing"),
            Self::Launching => f.write_str("launching"),
            Self::Running => f.write_str("running"),
            Self::Failed { reason } => write!(f, "failed: {reason}"),
            Self::Exhausted => f.write_str("exhausted"),
        }
    }
}

/// Result of re-entering the chain for a degraded session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailoverOutcome {
    Recovered(ActiveSource),
    /// Chain exhausted; the key is marked terminated
    Exhausted,
    /// The session changed or vanished before failover began
    Stale,
    /// Another attempt holds the key's creation marker
    Busy,
}

/// Collaborators injected into the controller.
#[derive(Clone)]
pub struct Collaborators {
    pub gate: Arc<dyn ConcurrencyGate>,
    pub probe: Arc<dyn PreflightProbe>,
    pub launcher: Arc<dyn ProcessLauncher>,
    pub resolver: Arc<dyn SourceChainResolver>,
    pub sessions: Arc<dyn SessionRegistry>,
    pub monitor_queue: Arc<dyn MonitorQueue>,
}

pub struct FailoverController {
    gate: Arc<dyn ConcurrencyGate>,
    probe: Arc<dyn PreflightProbe>,
    launcher: Arc<dyn ProcessLauncher>,
    resolver: Arc<dyn SourceChainResolver>,
    sessions: Arc<dyn SessionRegistry>,
    monitor_queue: Arc<dyn MonitorQueue>,
    config: OrchestratorConfig,
    node_id: String,
    processes: DashMap<SessionKey, Arc<dyn ProcessHandle>>,
}

/// Held creation marker; dropping it without `release` schedules the unlock.
struct CreationGuard {
    sessions: Arc<dyn SessionRegistry>,
    key: SessionKey,
    token: Option<String>,
}

impl CreationGuard {
    async fn refresh(&self, ttl: Duration) {
        if let Some(token) = &self.token {
            match self.sessions.extend_creation(self.key, token, ttl).await {
                Ok(true) => {}
                Ok(false) => warn!(key = %self.key, "Creation marker lost during start attempt"),
                Err(e) => warn!(key = %self.key, error = %e, "Failed to extend creation marker"),
            }
        }
    }

    async fn release(mut self) {
        if let Some(token) = self.token.take() {
            if let Err(e) = self.sessions.unlock_creation(self.key, &token).await {
                warn!(key = %self.key, error = %e, "Failed to release creation marker");
            }
        }
    }
}

impl Drop for CreationGuard {
    fn drop(&mut self) {
        let Some(token) = self.token.take() else {
            return;
        };
        let sessions = Arc::clone(&self.sessions);
        let key = self.key;
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Err(e) = sessions.unlock_creation(key, &token).await {
                    warn!(%key, error = %e, "Failed to release dropped creation marker");
                }
            });
        }
    }
}

enum CreationAttempt {
    Owner(CreationGuard),
    Existing(StreamSession),
    TimedOut,
}

impl FailoverController {
    pub fn new(collaborators: Collaborators, config: OrchestratorConfig, node_id: impl Into<String>) -> Self {
        Self {
            gate: collaborators.gate,
            probe: collaborators.probe,
            launcher: collaborators.launcher,
            resolver: collaborators.resolver,
            sessions: collaborators.sessions,
            monitor_queue: collaborators.monitor_queue,
            config,
            node_id: node_id.into(),
            processes: DashMap::new(),
        }
    }

    #[must_use]
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    #[must_use]
    pub const fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    #[must_use]
    pub fn sessions(&self) -> &Arc<dyn SessionRegistry> {
        &self.sessions
    }

    #[must_use]
    pub fn gate(&self) -> &Arc<dyn ConcurrencyGate> {
        &self.gate
    }

    /// Return the running session for `key`, or start one.
    pub async fn resolve_and_start(&self, key: SessionKey) -> OrchestratorResult<ActiveSource> {
        self.resolve_and_start_with_cancel(key, CancellationToken::new()).await
    }

    /// As [`Self::resolve_and_start`]; cancelling `cancel` abandons the
    /// attempt, releasing any held claim and killing any half-started relay.
    pub async fn resolve_and_start_with_cancel(
        &self,
        key: SessionKey,
        cancel: CancellationToken,
    ) -> OrchestratorResult<ActiveSource> {
        if let Some(existing) = self.sessions.get(key).await? {
            debug!(%key, source_id = existing.active_source_id, "Attaching to running session");
            return Ok(existing.to_active_source(true));
        }

        let guard = match self.acquire_creation(key, &cancel, true).await? {
            CreationAttempt::Owner(guard) => guard,
            CreationAttempt::Existing(session) => return Ok(session.to_active_source(true)),
            CreationAttempt::TimedOut => return Err(OrchestratorError::JoinTimeout(key.to_string())),
        };

        let result: OrchestratorResult<ActiveSource> = async {
            // another node may have finished while we waited for the marker
            if let Some(existing) = self.sessions.get(key).await? {
                return Ok(existing.to_active_source(true));
            }
            let chain = self.resolver.resolve(key).await?;
            self.run_chain(&chain, 0, &cancel, &guard).await
        }
        .await;

        guard.release().await;
        result
    }

    /// Re-enter the chain after the session behind `task` degraded.
    pub async fn failover(&self, task: &MonitorTask) -> OrchestratorResult<FailoverOutcome> {
        let key = task.key();
        let cancel = CancellationToken::new();

        let guard = match self.acquire_creation(key, &cancel, false).await? {
            CreationAttempt::Owner(guard) => guard,
            CreationAttempt::Existing(_) | CreationAttempt::TimedOut => return Ok(FailoverOutcome::Busy),
        };

        let result = self.failover_locked(task, &cancel, &guard).await;
        guard.release().await;
        result
    }

    async fn failover_locked(
        &self,
        task: &MonitorTask,
        cancel: &CancellationToken,
        guard: &CreationGuard,
    ) -> OrchestratorResult<FailoverOutcome> {
        let key = task.key();

        match self.sessions.get(key).await? {
            Some(session)
                if session.active_source_id == task.active_stream_id
                    && session.current_index == task.current_index_in_source_ids => {}
            _ => return Ok(FailoverOutcome::Stale),
        }
        let Some(old) = self.sessions.remove(key).await? else {
            return Ok(FailoverOutcome::Stale);
        };

        if let Some((_, handle)) = self.processes.remove(&key) {
            handle.stop().await;
        }
        self.release_quota(old.owner_id).await;

        let next = old.current_index + 1;
        warn!(%key, from_source = old.active_source_id, index = next, "Failing over to next source");

        match self.run_chain(&task.chain, next, cancel, guard).await {
            Ok(active) => Ok(FailoverOutcome::Recovered(active)),
            Err(OrchestratorError::ChainExhausted { .. }) => {
                self.sessions.mark_terminated(key).await?;
                error!(%key, "Failover chain exhausted, session terminated");
                Ok(FailoverOutcome::Exhausted)
            }
            Err(e) => {
                self.sessions.mark_terminated(key).await?;
                error!(%key, error = %e, "Failover aborted, session terminated");
                Err(e)
            }
        }
    }

    /// Stop a running session on administrative request.
    ///
    /// Returns false when the key had no running session.
    pub async fn stop(&self, key: SessionKey) -> OrchestratorResult<bool> {
        let until = Utc::now()
            + chrono::Duration::from_std(self.config.suppression()).unwrap_or_else(|_| chrono::Duration::seconds(30));
        self.sessions.set_monitoring_suppressed(key, Some(until)).await?;

        let Some(session) = self.sessions.remove(key).await? else {
            self.reap_orphan(key).await;
            return Ok(false);
        };

        if let Some((_, handle)) = self.processes.remove(&key) {
            handle.stop().await;
        }
        self.gate.release(session.owner_id).await?;
        info!(%key, source_id = session.active_source_id, owner_id = session.owner_id, "Stream session stopped");
        Ok(true)
    }

    /// Stop every session whose relay runs on this node.
    pub async fn shutdown(&self) {
        let keys: Vec<SessionKey> = self.processes.iter().map(|e| *e.key()).collect();
        for key in keys {
            if let Err(e) = self.stop(key).await {
                error!(%key, error = %e, "Failed to stop session during shutdown");
            }
        }
    }

    /// Kill a local relay that no longer has a registered session.
    pub async fn reap_orphan(&self, key: SessionKey) {
        if let Some((_, handle)) = self.processes.remove(&key) {
            warn!(%key, pid = ?handle.pid(), "Stopping relay without a session");
            handle.stop().await;
        }
    }

    /// Kill every local relay whose session is gone. Returns how many.
    pub async fn reap_orphans(&self) -> OrchestratorResult<usize> {
        let keys: Vec<SessionKey> = self.processes.iter().map(|e| *e.key()).collect();
        let mut reaped = 0;
        for key in keys {
            if self.sessions.get(key).await?.is_none() {
                self.reap_orphan(key).await;
                reaped += 1;
            }
        }
        Ok(reaped)
    }

    /// Health of the local relay for `key`; `None` when not on this node.
    pub async fn process_health(&self, key: SessionKey) -> Option<ProcessHealth> {
        let handle = self.processes.get(&key).map(|e| Arc::clone(e.value()))?;
        Some(handle.health().await)
    }

    #[must_use]
    pub fn bandwidth_kbps(&self, key: SessionKey) -> Option<u32> {
        self.processes.get(&key).and_then(|e| e.value().bandwidth_kbps())
    }

    #[must_use]
    pub fn local_process_count(&self) -> usize {
        self.processes.len()
    }

    async fn acquire_creation(
        &self,
        key: SessionKey,
        cancel: &CancellationToken,
        attach_existing: bool,
    ) -> OrchestratorResult<CreationAttempt> {
        let ttl = self.config.creation_lock_ttl();
        let deadline = tokio::time::Instant::now() + self.config.creation_wait();

        loop {
            if let Some(token) = self.sessions.try_lock_creation(key, ttl).await? {
                return Ok(CreationAttempt::Owner(CreationGuard {
                    sessions: Arc::clone(&self.sessions),
                    key,
                    token: Some(token),
                }));
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(%key, "Timed out waiting for concurrent session start");
                return Ok(CreationAttempt::TimedOut);
            }

            tokio::select! {
                () = cancel.cancelled() => return Err(OrchestratorError::Cancelled),
                () = tokio::time::sleep(CREATION_POLL_INTERVAL) => {}
            }

            if attach_existing {
                if let Some(existing) = self.sessions.get(key).await? {
                    return Ok(CreationAttempt::Existing(existing));
                }
            }
        }
    }

    async fn run_chain(
        &self,
        chain: &SourceChain,
        start: usize,
        cancel: &CancellationToken,
        guard: &CreationGuard,
    ) -> OrchestratorResult<ActiveSource> {
        let key = chain.key();

        for (index, source) in chain.sources().iter().enumerate().skip(start) {
            if cancel.is_cancelled() {
                return Err(OrchestratorError::Cancelled);
            }
            if index > start {
                guard.refresh(self.config.creation_lock_ttl()).await;
            }

            transition(key, index, &FailoverState::Claiming);
            let Some(claim) = QuotaClaim::acquire(&self.gate, &source.owner).await? else {
                let reason = OrchestratorError::QuotaExceeded {
                    owner_id: source.owner.id,
                };
                transition(key, index, &FailoverState::Failed { reason: reason.to_string() });
                warn!(%key, source_id = source.id, owner_id = source.owner.id, index, "Owner at capacity, skipping source");
                continue;
            };

            match self.start_candidate(chain, index, source, claim, cancel).await {
                Ok(active) => return Ok(active),
                Err(e) if e.is_retryable() => {
                    transition(key, index, &FailoverState::Failed { reason: e.to_string() });
                    warn!(%key, source_id = source.id, index, error = %e, "Source failed, advancing");
                }
                Err(e) => {
                    transition(key, index, &FailoverState::Failed { reason: e.to_string() });
                    return Err(e);
                }
            }
        }

        transition(key, chain.len(), &FailoverState::Exhausted);
        warn!(%key, sources = ?chain.ids(), "No source available");
        Err(OrchestratorError::ChainExhausted { key: key.to_string() })
    }

    async fn start_candidate(
        &self,
        chain: &SourceChain,
        index: usize,
        source: &Source,
        claim: QuotaClaim,
        cancel: &CancellationToken,
    ) -> OrchestratorResult<ActiveSource> {
        let key = chain.key();
        let user_agent = source
            .user_agent
            .as_deref()
            .unwrap_or(&self.config.default_user_agent);

        transition(key, index, &FailoverState::Probing);
        let probed = tokio::select! {
            () = cancel.cancelled() => Err(OrchestratorError::Cancelled),
            result = self.probe.probe(source, user_agent, self.config.probe_timeout()) => result,
        };
        if let Err(e) = probed {
            release_claim(claim).await;
            return Err(e);
        }

        transition(key, index, &FailoverState::Launching);
        let request = LaunchRequest::for_source(key, source, user_agent);
        let launched = tokio::select! {
            () = cancel.cancelled() => Err(OrchestratorError::Cancelled),
            result = self.launcher.launch(&request) => result,
        };
        let handle = match launched {
            Ok(handle) => handle,
            Err(e) => {
                release_claim(claim).await;
                return Err(e);
            }
        };

        let original_title = chain
            .original()
            .map_or_else(|| source.title.clone(), |s| s.title.clone());
        let session = StreamSession {
            key,
            active_source_id: source.id,
            title: source.title.clone(),
            original_title,
            url: source.url.clone(),
            pid: handle.pid(),
            node_id: self.node_id.clone(),
            source_ids: chain.ids(),
            current_index: index,
            owner_id: source.owner.id,
            started_at: Utc::now(),
            monitoring_suppressed_until: None,
            output_dir: handle.output_dir().map(ToOwned::to_owned),
        };

        match self.sessions.try_register(&session).await {
            Ok(true) => {}
            Ok(false) => {
                handle.stop().await;
                release_claim(claim).await;
                return match self.sessions.get(key).await? {
                    Some(existing) => Ok(existing.to_active_source(true)),
                    None => Err(OrchestratorError::Store(format!("session for {key} vanished during registration"))),
                };
            }
            Err(e) => {
                handle.stop().await;
                release_claim(claim).await;
                return Err(e);
            }
        }

        let owner_id = claim.commit();
        if let Some(previous) = self.processes.insert(key, handle) {
            previous.stop().await;
        }
        transition(key, index, &FailoverState::Running);

        let task = MonitorTask::for_chain(&chain.at(index))?;
        if let Err(e) = self.monitor_queue.submit(task, self.config.monitor_interval()).await {
            error!(%key, error = %e, "Failed to submit monitor task");
        }

        info!(
            %key,
            source_id = source.id,
            owner_id,
            index,
            pid = ?session.pid,
            "Stream session started"
        );
        Ok(session.to_active_source(false))
    }

    async fn release_quota(&self, owner_id: OwnerId) {
        if let Err(e) = self.gate.release(owner_id).await {
            error!(owner_id, error = %e, "Failed to release quota");
        }
    }
}

async fn release_claim(claim: QuotaClaim) {
    let owner_id = claim.owner_id();
    if let Err(e) = claim.release().await {
        error!(owner_id, error = %e, "Failed to release quota claim");
    }
}

fn transition(key: SessionKey, index: usize, state: &FailoverState) {
    debug!(%key, index, state = %state, "Failover state");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{CatalogChainResolver, StaticCatalog};
    use crate::model::{QuotaOwner, SourceId, StreamType};
    use crate::monitor::LocalMonitorQueue;
    use crate::probe::MockPreflightProbe;
    use crate::quota::{InMemoryQuotaStore, QuotaGate, QuotaStore};
    use crate::session::InMemorySessionRegistry;
    use async_trait::async_trait;
    use std::path::Path;

    struct NoopHandle;

    #[async_trait]
    impl ProcessHandle for NoopHandle {
        fn pid(&self) -> Option<u32> {
            Some(1)
        }
        fn output_dir(&self) -> Option<&Path> {
            None
        }
        async fn health(&self) -> ProcessHealth {
            ProcessHealth::Healthy
        }
        async fn stop(&self) {}
        fn bandwidth_kbps(&self) -> Option<u32> {
            None
        }
    }

    struct OkLauncher;

    #[async_trait]
    impl ProcessLauncher for OkLauncher {
        async fn launch(&self, _request: &LaunchRequest) -> OrchestratorResult<Arc<dyn ProcessHandle>> {
            Ok(Arc::new(NoopHandle))
        }
    }

    fn source(id: SourceId, owner: u64, limit: u32) -> Source {
        Source {
            id,
            stream_type: StreamType::Channel,
            title: format!("Source {id}"),
            url: format!("http://upstream.example/{id}"),
            owner: QuotaOwner {
                id: owner,
                available_streams: limit,
            },
            user_agent: None,
        }
    }

    fn controller(probe: MockPreflightProbe) -> (FailoverController, Arc<InMemoryQuotaStore>) {
        let catalog = StaticCatalog::new()
            .with_source(source(1, 10, 1), vec![2])
            .with_source(source(2, 20, 1), vec![]);
        let store = Arc::new(InMemoryQuotaStore::new());
        let (queue, _rx) = LocalMonitorQueue::new();
        let controller = FailoverController::new(
            Collaborators {
                gate: Arc::new(QuotaGate::new(store.clone())),
                probe: Arc::new(probe),
                launcher: Arc::new(OkLauncher),
                resolver: Arc::new(CatalogChainResolver::new(catalog)),
                sessions: Arc::new(InMemorySessionRegistry::new()),
                monitor_queue: Arc::new(queue),
            },
            OrchestratorConfig::default(),
            "node-test",
        );
        (controller, store)
    }

    #[tokio::test]
    async fn test_probe_failure_advances_and_releases() {
        let mut probe = MockPreflightProbe::new();
        probe
            .expect_probe()
            .withf(|source, _, _| source.id == 1)
            .times(1)
            .returning(|source, _, _| Err(OrchestratorError::not_responding(source.id, "refused")));
        probe
            .expect_probe()
            .withf(|source, _, _| source.id == 2)
            .times(1)
            .returning(|_, _, _| Ok(()));
        let (controller, store) = controller(probe);

        let active = controller
            .resolve_and_start(SessionKey::new(StreamType::Channel, 1))
            .await
            .unwrap();
        assert_eq!(active.source_id, 2);
        assert_eq!(active.source_index, 1);
        assert!(!active.reused);
        assert_eq!(store.get(10).await.unwrap(), 0);
        assert_eq!(store.get(20).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_probe_uses_default_user_agent() {
        let mut probe = MockPreflightProbe::new();
        let expected = OrchestratorConfig::default().default_user_agent;
        probe
            .expect_probe()
            .withf(move |_, ua, _| ua == expected)
            .times(1)
            .returning(|_, _, _| Ok(()));
        let (controller, _) = controller(probe);

        controller
            .resolve_and_start(SessionKey::new(StreamType::Channel, 1))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_second_request_reuses_without_claim() {
        let mut probe = MockPreflightProbe::new();
        probe.expect_probe().times(1).returning(|_, _, _| Ok(()));
        let (controller, store) = controller(probe);
        let key = SessionKey::new(StreamType::Channel, 1);

        let first = controller.resolve_and_start(key).await.unwrap();
        let second = controller.resolve_and_start(key).await.unwrap();
        assert_eq!(first.source_id, second.source_id);
        assert!(second.reused);
        assert_eq!(store.get(10).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_stop_releases_once() {
        let mut probe = MockPreflightProbe::new();
        probe.expect_probe().returning(|_, _, _| Ok(()));
        let (controller, store) = controller(probe);
        let key = SessionKey::new(StreamType::Channel, 1);

        controller.resolve_and_start(key).await.unwrap();
        assert_eq!(controller.local_process_count(), 1);

        assert!(controller.stop(key).await.unwrap());
        assert!(!controller.stop(key).await.unwrap());
        assert_eq!(store.get(10).await.unwrap(), 0);
        assert_eq!(controller.local_process_count(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let probe = MockPreflightProbe::new();
        let (controller, store) = controller(probe);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = controller
            .resolve_and_start_with_cancel(SessionKey::new(StreamType::Channel, 1), cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::Cancelled));
        assert_eq!(store.get(10).await.unwrap(), 0);
    }

    #[test]
    fn test_state_display() {
        assert_eq!(FailoverState::Probing.to_string(), "probing");
        assert_eq!(
            FailoverState::Failed { reason: "boom".into() }.to_string(),
            "failed: boom"
        );
    }
}
