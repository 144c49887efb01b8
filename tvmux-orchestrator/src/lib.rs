//! Stream session orchestration: failover chains, per-owner concurrency
//! quotas, relay process supervision and shared viewer sessions.

pub mod chain;
pub mod error;
pub mod failover;
pub mod launcher;
pub mod model;
pub mod monitor;
pub mod probe;
pub mod quota;
pub mod session;
pub mod shared;
pub mod status;

pub use chain::{CatalogChainResolver, SourceCatalog, SourceChain, SourceChainResolver, StaticCatalog};
pub use error::{OrchestratorError, OrchestratorResult};
pub use failover::{Collaborators, FailoverController, FailoverOutcome, FailoverState};
pub use launcher::{FfmpegLauncher, LaunchRequest, ProcessHandle, ProcessHealth, ProcessLauncher};
pub use model::{ActiveSource, OwnerId, QuotaOwner, SessionKey, Source, SourceId, StreamType};
pub use monitor::{HealthMonitor, LocalMonitorQueue, MonitorQueue, MonitorTask};
pub use probe::{FfprobeProbe, HttpProbe, PreflightProbe};
pub use quota::{ConcurrencyGate, QuotaClaim, QuotaGate};
pub use session::{InMemorySessionRegistry, RedisSessionRegistry, SessionRegistry, StreamSession};
pub use shared::{SharedStreamMultiplexer, SharedStreamStore};
pub use status::StatusService;
