//! tracing subscriber setup
//!
//! `RUST_LOG` wins over the configured level. `json` is meant for log
//! shippers and `pretty` for a terminal; either can be redirected to an
//! append-only file.

use anyhow::Context;
use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Arc;
use tracing::Level;
use tracing_subscriber::fmt::{self, format::FmtSpan, writer::BoxMakeWriter};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LoggingConfig;

/// Held at info when the relay itself logs at debug or trace
const CHATTY_TARGETS: &[&str] = &["hyper_util", "reqwest", "redis", "tower_http"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LogFormat {
    Json,
    Pretty,
}

impl LogFormat {
    fn parse(format: &str) -> anyhow::Result<Self> {
        match format.to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "pretty" => Ok(Self::Pretty),
            other => Err(anyhow::anyhow!("Invalid log format: {other}")),
        }
    }
}

/// Install the global subscriber. Fails if one is already installed.
pub fn init_logging(config: &LoggingConfig) -> anyhow::Result<()> {
    let level = parse_log_level(&config.level)?;
    let format = LogFormat::parse(&config.format)?;
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter(level));
    let writer = match config.file_path.as_deref() {
        Some(path) => file_writer(Path::new(path))?,
        None => BoxMakeWriter::new(std::io::stdout),
    };

    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Json => registry
            .with(
                fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_span_list(true)
                    .with_span_events(FmtSpan::CLOSE)
                    .with_file(true)
                    .with_line_number(true)
                    .with_writer(writer),
            )
            .try_init()?,
        LogFormat::Pretty => registry
            .with(
                fmt::layer()
                    .pretty()
                    .with_file(false)
                    .with_line_number(true)
                    .with_writer(writer),
            )
            .try_init()?,
    }
    Ok(())
}

fn default_filter(level: Level) -> EnvFilter {
    EnvFilter::new(filter_directives(level))
}

fn filter_directives(level: Level) -> String {
    let mut directives = vec![level.as_str().to_ascii_lowercase()];
    // Level ordering: more verbose compares greater
    if level > Level::INFO {
        directives.extend(CHATTY_TARGETS.iter().map(|target| format!("{target}=info")));
    }
    directives.join(",")
}

fn file_writer(path: &Path) -> anyhow::Result<BoxMakeWriter> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("cannot create log directory {}", parent.display()))?;
    }
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("cannot open log file {}", path.display()))?;
    Ok(BoxMakeWriter::new(Arc::new(file)))
}

/// Parse log level string to tracing Level
fn parse_log_level(level: &str) -> anyhow::Result<Level> {
    match level.to_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" | "warning" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        _ => Err(anyhow::anyhow!("Invalid log level: {level}")),
    }
}
