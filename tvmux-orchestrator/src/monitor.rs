//! Session health supervision
//!
//! Each running session has one self-requeuing [`MonitorTask`]. A tick polls
//! the session's process; a degraded process sends the task back into the
//! [`FailoverController`] at the next chain position. Tasks that no longer
//! match the registered session are dropped, so at most one task per session
//! keeps rescheduling.

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::chain::SourceChain;
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::failover::{FailoverController, FailoverOutcome};
use crate::launcher::ProcessHealth;
use crate::model::{OwnerId, SessionKey, Source, SourceId, StreamType};

/// Payload of one supervision tick.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitorTask {
    pub stream_type: StreamType,
    pub active_stream_id: SourceId,
    pub original_model_id: SourceId,
    pub original_model_title: String,
    pub playlist_id_of_active_stream: OwnerId,
    pub stream_source_ids: Vec<SourceId>,
    pub current_index_in_source_ids: usize,
    /// The chain the session was started from, positioned at the active source
    pub chain: SourceChain,
}

impl MonitorTask {
    /// Task for `chain` positioned at its running source.
    pub fn for_chain(chain: &SourceChain) -> OrchestratorResult<Self> {
        let key = chain.key();
        let active: &Source = chain
            .current()
            .ok_or_else(|| OrchestratorError::NotFound(format!("chain position for {key}")))?;
        let original_model_title = chain
            .original()
            .map_or_else(|| active.title.clone(), |s| s.title.clone());

        Ok(Self {
            stream_type: key.stream_type,
            active_stream_id: active.id,
            original_model_id: key.model_id,
            original_model_title,
            playlist_id_of_active_stream: active.owner.id,
            stream_source_ids: chain.ids(),
            current_index_in_source_ids: chain.current_index(),
            chain: chain.clone(),
        })
    }

    #[must_use]
    pub const fn key(&self) -> SessionKey {
        SessionKey::new(self.stream_type, self.original_model_id)
    }
}

/// Outbound task submission.
#[async_trait]
pub trait MonitorQueue: Send + Sync {
    async fn submit(&self, task: MonitorTask, delay: Duration) -> OrchestratorResult<()>;
}

/// In-process queue; the matching [`MonitorReceiver`] is drained by
/// [`HealthMonitor::run`].
#[derive(Clone)]
pub struct LocalMonitorQueue {
    tx: mpsc::UnboundedSender<(MonitorTask, Duration)>,
}

pub struct MonitorReceiver {
    rx: mpsc::UnboundedReceiver<(MonitorTask, Duration)>,
}

impl LocalMonitorQueue {
    #[must_use]
    pub fn new() -> (Self, MonitorReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, MonitorReceiver { rx })
    }
}

#[async_trait]
impl MonitorQueue for LocalMonitorQueue {
    async fn submit(&self, task: MonitorTask, delay: Duration) -> OrchestratorResult<()> {
        self.tx
            .send((task, delay))
            .map_err(|_| OrchestratorError::Store("monitor queue closed".to_string()))
    }
}

/// What a tick decided.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// Healthy or suppressed; tick again after the interval
    Reschedule,
    /// The key no longer has a session
    NoSession,
    /// The session moved on to another source or attempt
    Stale,
    /// Failover ran; the new session (if any) has its own task
    FailedOver(FailoverOutcome),
}

pub struct HealthMonitor {
    controller: Arc<FailoverController>,
    queue: Arc<dyn MonitorQueue>,
    interval: Duration,
}

impl HealthMonitor {
    pub fn new(controller: Arc<FailoverController>, queue: Arc<dyn MonitorQueue>, interval: Duration) -> Self {
        Self {
            controller,
            queue,
            interval,
        }
    }

    /// Poll one session.
    pub async fn tick(&self, task: &MonitorTask) -> OrchestratorResult<TickOutcome> {
        let key = task.key();

        let Some(session) = self.controller.sessions().get(key).await? else {
            self.controller.reap_orphan(key).await;
            debug!(%key, "No session for monitor task, stopping");
            return Ok(TickOutcome::NoSession);
        };

        if session.active_source_id != task.active_stream_id
            || session.current_index != task.current_index_in_source_ids
        {
            debug!(%key, task_source = task.active_stream_id, session_source = session.active_source_id, "Stale monitor task");
            return Ok(TickOutcome::Stale);
        }

        if session.is_monitoring_suppressed(Utc::now()) {
            debug!(%key, "Monitoring suppressed");
            return Ok(TickOutcome::Reschedule);
        }

        let health = self
            .controller
            .process_health(key)
            .await
            .unwrap_or(ProcessHealth::Exited { code: None });
        if health.is_healthy() {
            return Ok(TickOutcome::Reschedule);
        }

        warn!(
            %key,
            source_id = session.active_source_id,
            index = session.current_index,
            health = ?health,
            "Session degraded, failing over"
        );
        let outcome = self.controller.failover(task).await?;
        Ok(TickOutcome::FailedOver(outcome))
    }

    async fn tick_and_requeue(&self, task: MonitorTask) {
        let key = task.key();
        match self.tick(&task).await {
            Ok(TickOutcome::Reschedule | TickOutcome::FailedOver(FailoverOutcome::Busy)) => {
                if let Err(e) = self.queue.submit(task, self.interval).await {
                    error!(%key, error = %e, "Failed to reschedule monitor task");
                }
            }
            Ok(outcome) => debug!(%key, ?outcome, "Monitor task finished"),
            Err(e) => {
                // store errors are transient; keep supervising
                error!(%key, error = %e, "Monitor tick failed");
                if let Err(e) = self.queue.submit(task, self.interval).await {
                    error!(%key, error = %e, "Failed to reschedule monitor task");
                }
            }
        }
    }

    /// Drain `receiver`, running each task after its delay.
    pub async fn run(self: Arc<Self>, mut receiver: MonitorReceiver, cancel: CancellationToken) {
        info!(interval_secs = self.interval.as_secs(), "Health monitor started");
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                next = receiver.rx.recv() => {
                    let Some((task, delay)) = next else { break };
                    let monitor = Arc::clone(&self);
                    let cancel = cancel.clone();
                    tokio::spawn(async move {
                        tokio::select! {
                            () = cancel.cancelled() => {}
                            () = tokio::time::sleep(delay) => monitor.tick_and_requeue(task).await,
                        }
                    });
                }
            }
        }
        info!("Health monitor stopped");
    }
}
