//! Configuration loading and shared connections

use anyhow::Result;
use redis::aio::ConnectionManager as RedisConnectionManager;
use tracing::{info, warn};

use crate::Config;

/// Load configuration from config file or environment variables
///
/// Config file search order:
/// 1. explicit path (command line)
/// 2. `TVMUX_CONFIG_PATH` environment variable
/// 3. ./config.yaml (current working directory)
/// 4. /config/config.yaml (container mount path)
/// 5. environment variables only
pub fn load_config(explicit_path: Option<&str>) -> Result<Config> {
    let config_path = explicit_path
        .map(str::to_string)
        .or_else(|| {
            std::env::var("TVMUX_CONFIG_PATH")
                .ok()
                .filter(|p| std::path::Path::new(p).exists())
        })
        .or_else(|| {
            ["config.yaml", "/config/config.yaml"]
                .into_iter()
                .find(|p| std::path::Path::new(p).exists())
                .map(str::to_string)
        });

    // Logging is not initialised yet, so report on stderr.
    let config = if let Some(path) = config_path {
        eprintln!("Loading config from {path}");
        Config::from_file(&path)?
    } else {
        eprintln!("No config file found, using environment variables");
        Config::from_env()?
    };

    if let Err(errors) = config.validate() {
        for error in &errors {
            eprintln!("Config validation error: {error}");
        }
        return Err(anyhow::anyhow!(
            "Configuration validation failed with {} error(s): {}",
            errors.len(),
            errors.join("; ")
        ));
    }

    Ok(config)
}

/// Connect to Redis if configured.
///
/// Returns `None` in single-node mode; callers then fall back to in-memory
/// stores, which only coordinate within this process.
pub async fn init_redis(config: &Config) -> Result<Option<RedisConnectionManager>> {
    if !config.redis_enabled() {
        warn!(
            "Redis not configured: quota counters and session registry are per-process only \
             (not shared across replicas)"
        );
        return Ok(None);
    }

    let client = redis::Client::open(config.redis.url.clone())?;
    let conn = RedisConnectionManager::new(client).await?;
    info!("Connected to Redis");
    Ok(Some(conn))
}
