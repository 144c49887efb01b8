//! Lifecycle events reported by an external stream proxy.

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::SharedStreamMultiplexer;
use crate::error::OrchestratorResult;

/// Wire shape: `{"event": "CLIENT_CONNECTED", "stream_key": "...", "client_id": "..."}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProxyEvent {
    ClientConnected { stream_key: String, client_id: String },
    ClientDisconnected { stream_key: String, client_id: String },
    StreamStarted { stream_key: String },
    StreamEnded { stream_key: String },
}

impl ProxyEvent {
    #[must_use]
    pub fn stream_key(&self) -> &str {
        match self {
            Self::ClientConnected { stream_key, .. }
            | Self::ClientDisconnected { stream_key, .. }
            | Self::StreamStarted { stream_key }
            | Self::StreamEnded { stream_key } => stream_key,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum EventOutcome {
    Attached { client_count: u64 },
    Detached { client_count: u64 },
    StatusUpdated,
    Reconciled,
    /// The event referenced an unknown stream or client
    Ignored,
}

impl SharedStreamMultiplexer {
    /// Apply a proxy event. Connects never start a session: the proxy only
    /// reports viewers of streams that already exist.
    pub async fn apply_event(&self, event: ProxyEvent) -> OrchestratorResult<EventOutcome> {
        debug!(?event, "Proxy event");
        let outcome = match &event {
            ProxyEvent::ClientConnected { stream_key, client_id } => self
                .attach(stream_key, client_id)
                .await?
                .map_or(EventOutcome::Ignored, |client_count| EventOutcome::Attached { client_count }),
            ProxyEvent::ClientDisconnected { stream_key, client_id } => self
                .leave(stream_key, client_id)
                .await?
                .map_or(EventOutcome::Ignored, |client_count| EventOutcome::Detached { client_count }),
            ProxyEvent::StreamStarted { stream_key } => {
                if self.mark_active(stream_key).await? {
                    EventOutcome::StatusUpdated
                } else {
                    EventOutcome::Ignored
                }
            }
            ProxyEvent::StreamEnded { stream_key } => {
                if self.reconcile(stream_key).await? {
                    EventOutcome::Reconciled
                } else {
                    EventOutcome::Ignored
                }
            }
        };

        if outcome != EventOutcome::Ignored {
            info!(stream_key = event.stream_key(), ?outcome, "Proxy event applied");
        }
        Ok(outcome)
    }
}
