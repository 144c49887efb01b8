#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tvmux_core::OrchestratorConfig;
use tvmux_orchestrator::quota::{InMemoryQuotaStore, QuotaStore};
use tvmux_orchestrator::{
    CatalogChainResolver, Collaborators, FailoverController, InMemorySessionRegistry, LaunchRequest, MonitorQueue,
    MonitorTask, OrchestratorError, OrchestratorResult, PreflightProbe, ProcessHandle, ProcessHealth,
    ProcessLauncher, QuotaGate, QuotaOwner, Source, SourceId, StaticCatalog, StreamType,
};

pub fn source(id: SourceId, owner: u64, limit: u32) -> Source {
    Source {
        id,
        stream_type: StreamType::Channel,
        title: format!("Channel {id}"),
        url: format!("http://upstream.test/live/{id}.ts"),
        owner: QuotaOwner {
            id: owner,
            available_streams: limit,
        },
        user_agent: None,
    }
}

/// Probe that fails for a configurable set of sources and records calls.
#[derive(Default)]
pub struct ScriptedProbe {
    failing: Mutex<HashSet<SourceId>>,
    calls: Mutex<Vec<SourceId>>,
}

impl ScriptedProbe {
    pub fn fail(&self, id: SourceId) {
        self.failing.lock().insert(id);
    }

    pub fn calls(&self) -> Vec<SourceId> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl PreflightProbe for ScriptedProbe {
    async fn probe(&self, source: &Source, _user_agent: &str, _timeout: Duration) -> OrchestratorResult<()> {
        self.calls.lock().push(source.id);
        if self.failing.lock().contains(&source.id) {
            return Err(OrchestratorError::SourceNotResponding {
                source_id: source.id,
                reason: "connection refused".to_string(),
            });
        }
        Ok(())
    }
}

pub struct FakeHandle {
    pub source_id: SourceId,
    health: Mutex<ProcessHealth>,
    stopped: AtomicBool,
}

impl FakeHandle {
    pub fn set_health(&self, health: ProcessHealth) {
        *self.health.lock() = health;
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProcessHandle for FakeHandle {
    fn pid(&self) -> Option<u32> {
        Some(40_000 + u32::try_from(self.source_id).unwrap_or(0))
    }

    fn output_dir(&self) -> Option<&Path> {
        None
    }

    async fn health(&self) -> ProcessHealth {
        if self.is_stopped() {
            return ProcessHealth::Exited { code: None };
        }
        *self.health.lock()
    }

    async fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    fn bandwidth_kbps(&self) -> Option<u32> {
        Some(2_400)
    }
}

/// Launcher handing out [`FakeHandle`]s after an optional delay.
#[derive(Default)]
pub struct FakeLauncher {
    failing: Mutex<HashSet<SourceId>>,
    launches: Mutex<Vec<SourceId>>,
    handles: Mutex<HashMap<SourceId, Arc<FakeHandle>>>,
    delay: Mutex<Duration>,
}

impl FakeLauncher {
    pub fn fail(&self, id: SourceId) {
        self.failing.lock().insert(id);
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = delay;
    }

    pub fn launches(&self) -> Vec<SourceId> {
        self.launches.lock().clone()
    }

    pub fn handle(&self, id: SourceId) -> Option<Arc<FakeHandle>> {
        self.handles.lock().get(&id).cloned()
    }
}

#[async_trait]
impl ProcessLauncher for FakeLauncher {
    async fn launch(&self, request: &LaunchRequest) -> OrchestratorResult<Arc<dyn ProcessHandle>> {
        let delay = *self.delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.launches.lock().push(request.source_id);
        if self.failing.lock().contains(&request.source_id) {
            return Err(OrchestratorError::LaunchFailure {
                source_id: request.source_id,
                reason: "no output within 8000ms".to_string(),
            });
        }
        let handle = Arc::new(FakeHandle {
            source_id: request.source_id,
            health: Mutex::new(ProcessHealth::Healthy),
            stopped: AtomicBool::new(false),
        });
        self.handles.lock().insert(request.source_id, Arc::clone(&handle));
        Ok(handle)
    }
}

/// Queue that only records submissions; tests drive ticks by hand.
#[derive(Default)]
pub struct RecordingQueue {
    tasks: Mutex<Vec<MonitorTask>>,
}

impl RecordingQueue {
    pub fn tasks(&self) -> Vec<MonitorTask> {
        self.tasks.lock().clone()
    }

    pub fn last(&self) -> Option<MonitorTask> {
        self.tasks.lock().last().cloned()
    }
}

#[async_trait]
impl MonitorQueue for RecordingQueue {
    async fn submit(&self, task: MonitorTask, _delay: Duration) -> OrchestratorResult<()> {
        self.tasks.lock().push(task);
        Ok(())
    }
}

pub struct Harness {
    pub controller: Arc<FailoverController>,
    pub quota: Arc<InMemoryQuotaStore>,
    pub probe: Arc<ScriptedProbe>,
    pub launcher: Arc<FakeLauncher>,
    pub queue: Arc<RecordingQueue>,
    pub sessions: Arc<InMemorySessionRegistry>,
}

impl Harness {
    pub fn new(catalog: StaticCatalog) -> Self {
        let quota = Arc::new(InMemoryQuotaStore::new());
        let probe = Arc::new(ScriptedProbe::default());
        let launcher = Arc::new(FakeLauncher::default());
        let queue = Arc::new(RecordingQueue::default());
        let sessions = Arc::new(InMemorySessionRegistry::new());

        let controller = Arc::new(FailoverController::new(
            Collaborators {
                gate: Arc::new(QuotaGate::new(quota.clone())),
                probe: probe.clone(),
                launcher: launcher.clone(),
                resolver: Arc::new(CatalogChainResolver::new(catalog)),
                sessions: sessions.clone(),
                monitor_queue: queue.clone(),
            },
            OrchestratorConfig::default(),
            "node-test",
        ));

        Self {
            controller,
            quota,
            probe,
            launcher,
            queue,
            sessions,
        }
    }

    pub async fn active(&self, owner: u64) -> i64 {
        self.quota.get(owner).await.unwrap_or(-1)
    }
}
