//! Read-only status surface and on-demand cleanup.

use serde::Serialize;
use std::sync::Arc;
use tracing::info;

use crate::error::OrchestratorResult;
use crate::failover::FailoverController;
use crate::launcher::ProcessHealth;
use crate::model::SessionKey;
use crate::session::{SessionStatus, StreamSession};
use crate::shared::{ReapReport, SharedStream, SharedStreamClient, SharedStreamMultiplexer, SharedStreamStat};

/// Health flags for one session key.
#[derive(Debug, Clone, Serialize)]
pub struct SessionHealth {
    pub key: SessionKey,
    /// `None` when the key never ran or its terminated record expired
    pub status: Option<SessionStatus>,
    pub session: Option<StreamSession>,
    /// `None` when the relay does not run on this node
    pub process: Option<ProcessHealth>,
    pub monitoring_suppressed: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct SharedStreamReport {
    pub stream: SharedStream,
    pub clients: Vec<SharedStreamClient>,
    pub stats: Vec<SharedStreamStat>,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct CleanupReport {
    pub orphan_processes: usize,
    pub shared: ReapReport,
}

pub struct StatusService {
    controller: Arc<FailoverController>,
    multiplexer: Option<SharedStreamMultiplexer>,
}

impl StatusService {
    pub fn new(controller: Arc<FailoverController>, multiplexer: Option<SharedStreamMultiplexer>) -> Self {
        Self {
            controller,
            multiplexer,
        }
    }

    /// Running sessions across all nodes
    pub async fn active_stream_count(&self) -> OrchestratorResult<usize> {
        Ok(self.controller.sessions().list().await?.len())
    }

    pub async fn list_sessions(&self) -> OrchestratorResult<Vec<StreamSession>> {
        let mut sessions = self.controller.sessions().list().await?;
        sessions.sort_by_key(|s| s.started_at);
        Ok(sessions)
    }

    pub async fn health(&self, key: SessionKey) -> OrchestratorResult<SessionHealth> {
        let sessions = self.controller.sessions();
        let status = sessions.status(key).await?;
        let session = sessions.get(key).await?;
        let monitoring_suppressed = session
            .as_ref()
            .is_some_and(|s| s.is_monitoring_suppressed(chrono::Utc::now()));

        Ok(SessionHealth {
            key,
            status,
            session,
            process: self.controller.process_health(key).await,
            monitoring_suppressed,
        })
    }

    /// Clients and usage samples of one shared stream; `None` when unknown
    /// or shared mode is off.
    pub async fn shared_stream_stats(&self, stream_key: &str) -> OrchestratorResult<Option<SharedStreamReport>> {
        let Some(multiplexer) = &self.multiplexer else {
            return Ok(None);
        };
        let store = multiplexer.store();
        let Some(stream) = store.get(stream_key).await? else {
            return Ok(None);
        };
        Ok(Some(SharedStreamReport {
            stream,
            clients: store.clients(stream_key).await?,
            stats: store.stats(stream_key).await?,
        }))
    }

    pub async fn list_shared_streams(&self) -> OrchestratorResult<Vec<SharedStream>> {
        match &self.multiplexer {
            Some(multiplexer) => multiplexer.store().list().await,
            None => Ok(Vec::new()),
        }
    }

    /// Kill orphaned relays and run a reaper pass now.
    pub async fn cleanup(&self) -> OrchestratorResult<CleanupReport> {
        let orphan_processes = self.controller.reap_orphans().await?;
        let shared = match &self.multiplexer {
            Some(multiplexer) => multiplexer.reap().await?,
            None => ReapReport::default(),
        };
        info!(orphan_processes, ?shared, "Cleanup complete");
        Ok(CleanupReport {
            orphan_processes,
            shared,
        })
    }
}
