pub mod bootstrap;
pub mod config;
pub mod error;
pub mod keys;
pub mod lock;
pub mod logging;

pub use config::{Config, OrchestratorConfig, ProbeMethod, SharedStreamConfig};
pub use error::{Error, Result};
pub use keys::KeyBuilder;
pub use lock::DistributedLock;
