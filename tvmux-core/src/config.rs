use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub redis: RedisConfig,
    pub logging: LoggingConfig,
    pub orchestrator: OrchestratorConfig,
    pub shared: SharedStreamConfig,
    /// JSON file with sources, quota owners and failover lists
    pub catalog_path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub http_port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            http_port: 8080,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    /// Empty url means single-node mode with in-memory stores
    pub url: String,
    pub key_prefix: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            key_prefix: "tvmux".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "pretty"
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

/// How candidates are checked before a process is launched
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeMethod {
    /// Run ffprobe against the source and require at least one stream
    #[default]
    Ffprobe,
    /// Plain HTTP GET that must return a success status and a first body chunk
    Http,
}

/// Failover, launch and supervision settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub probe_method: ProbeMethod,
    pub probe_timeout_ms: u64,
    pub ffprobe_path: String,
    pub ffmpeg_path: String,
    /// Window in which a launched process must report progress
    pub speed_check_timeout_ms: u64,
    /// Root directory for per-session segment output
    pub output_dir: String,
    pub default_user_agent: String,
    pub monitor_interval_secs: u64,
    /// A process with no progress for this long counts as degraded
    pub stall_timeout_secs: u64,
    pub creation_lock_ttl_secs: u64,
    /// How long a second request waits for a concurrent start of the same key
    pub creation_wait_ms: u64,
    /// Monitoring suppression window applied on manual stop
    pub suppression_secs: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            probe_method: ProbeMethod::Ffprobe,
            probe_timeout_ms: 5_000,
            ffprobe_path: "ffprobe".to_string(),
            ffmpeg_path: "ffmpeg".to_string(),
            speed_check_timeout_ms: 8_000,
            output_dir: "./data/streams".to_string(),
            default_user_agent: "VLC/3.0.20 LibVLC/3.0.20".to_string(),
            monitor_interval_secs: 10,
            stall_timeout_secs: 20,
            creation_lock_ttl_secs: 30,
            creation_wait_ms: 20_000,
            suppression_secs: 30,
        }
    }
}

impl OrchestratorConfig {
    #[must_use]
    pub const fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    #[must_use]
    pub const fn speed_check_timeout(&self) -> Duration {
        Duration::from_millis(self.speed_check_timeout_ms)
    }

    #[must_use]
    pub const fn monitor_interval(&self) -> Duration {
        Duration::from_secs(self.monitor_interval_secs)
    }

    #[must_use]
    pub const fn stall_timeout(&self) -> Duration {
        Duration::from_secs(self.stall_timeout_secs)
    }

    #[must_use]
    pub const fn creation_lock_ttl(&self) -> Duration {
        Duration::from_secs(self.creation_lock_ttl_secs)
    }

    #[must_use]
    pub const fn creation_wait(&self) -> Duration {
        Duration::from_millis(self.creation_wait_ms)
    }

    #[must_use]
    pub const fn suppression(&self) -> Duration {
        Duration::from_secs(self.suppression_secs)
    }
}

/// Shared (proxy) mode settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SharedStreamConfig {
    pub enabled: bool,
    /// Delay between the last viewer leaving and the session being stopped
    pub grace_period_secs: u64,
    pub reaper_interval_secs: u64,
    /// Clients without a heartbeat for this long are detached by the reaper
    pub client_timeout_secs: u64,
    pub join_poll_interval_ms: u64,
    pub join_timeout_ms: u64,
}

impl Default for SharedStreamConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            grace_period_secs: 10,
            reaper_interval_secs: 30,
            client_timeout_secs: 90,
            join_poll_interval_ms: 200,
            join_timeout_ms: 30_000,
        }
    }
}

impl SharedStreamConfig {
    #[must_use]
    pub const fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }

    #[must_use]
    pub const fn reaper_interval(&self) -> Duration {
        Duration::from_secs(self.reaper_interval_secs)
    }

    #[must_use]
    pub const fn client_timeout(&self) -> Duration {
        Duration::from_secs(self.client_timeout_secs)
    }

    #[must_use]
    pub const fn join_poll_interval(&self) -> Duration {
        Duration::from_millis(self.join_poll_interval_ms)
    }

    #[must_use]
    pub const fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }
}

impl Config {
    /// Load configuration from multiple sources with priority:
    /// 1. Environment variables (highest priority)
    /// 2. Config file (if provided)
    /// 3. Defaults (lowest priority)
    pub fn load(config_file: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
            }
        }

        // TVMUX_SERVER_HOST, TVMUX_ORCHESTRATOR_PROBE_TIMEOUT_MS, ...
        builder = builder.add_source(
            Environment::with_prefix("TVMUX")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Load from environment variables only (for Docker/K8s)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(None)
    }

    /// Load from file path
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        Self::load(Some(path))
    }

    /// Collect every configuration problem instead of stopping at the first.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.server.http_port == 0 {
            errors.push("server.http_port must be non-zero".to_string());
        }
        if !matches!(self.logging.format.as_str(), "json" | "pretty") {
            errors.push(format!(
                "logging.format must be 'json' or 'pretty', got '{}'",
                self.logging.format
            ));
        }

        let o = &self.orchestrator;
        if o.probe_timeout_ms == 0 {
            errors.push("orchestrator.probe_timeout_ms must be non-zero".to_string());
        }
        if o.speed_check_timeout_ms == 0 {
            errors.push("orchestrator.speed_check_timeout_ms must be non-zero".to_string());
        }
        if o.monitor_interval_secs == 0 {
            errors.push("orchestrator.monitor_interval_secs must be non-zero".to_string());
        }
        if o.stall_timeout_secs < o.monitor_interval_secs {
            errors.push(
                "orchestrator.stall_timeout_secs must be at least monitor_interval_secs".to_string(),
            );
        }
        if o.creation_lock_ttl_secs == 0 {
            errors.push("orchestrator.creation_lock_ttl_secs must be non-zero".to_string());
        }
        if o.output_dir.trim().is_empty() {
            errors.push("orchestrator.output_dir must not be empty".to_string());
        }

        let s = &self.shared;
        if s.reaper_interval_secs == 0 {
            errors.push("shared.reaper_interval_secs must be non-zero".to_string());
        }
        if s.join_poll_interval_ms == 0 {
            errors.push("shared.join_poll_interval_ms must be non-zero".to_string());
        }
        if s.join_timeout_ms < s.join_poll_interval_ms {
            errors.push("shared.join_timeout_ms must be at least join_poll_interval_ms".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Get HTTP address
    #[must_use]
    pub fn http_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.http_port)
    }

    #[must_use]
    pub fn redis_enabled(&self) -> bool {
        !self.redis.url.trim().is_empty()
    }
}
