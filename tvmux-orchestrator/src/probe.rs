//! Preflight reachability checks
//!
//! A probe runs before any process is launched and must settle within its
//! timeout. Every failure, including the timeout itself, is reported as
//! [`OrchestratorError::SourceNotResponding`].

use async_trait::async_trait;
use serde::Deserialize;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

use crate::error::{OrchestratorError, OrchestratorResult};
use crate::model::Source;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PreflightProbe: Send + Sync {
    async fn probe(&self, source: &Source, user_agent: &str, timeout: Duration) -> OrchestratorResult<()>;
}

/// Probes with `ffprobe`, requiring at least one decodable stream.
#[derive(Debug, Clone)]
pub struct FfprobeProbe {
    ffprobe_path: String,
}

#[derive(Debug, Deserialize)]
struct FfprobeOutput {
    #[serde(default)]
    streams: Vec<FfprobeStream>,
}

#[derive(Debug, Deserialize)]
struct FfprobeStream {
    #[serde(default)]
    codec_type: Option<String>,
}

impl FfprobeProbe {
    pub fn new(ffprobe_path: impl Into<String>) -> Self {
        Self {
            ffprobe_path: ffprobe_path.into(),
        }
    }

    async fn run(&self, source: &Source, user_agent: &str) -> OrchestratorResult<()> {
        let output = Command::new(&self.ffprobe_path)
            .args(["-v", "error", "-user_agent", user_agent])
            .args(["-show_entries", "stream=codec_type", "-of", "json"])
            .arg(&source.url)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| OrchestratorError::not_responding(source.id, format!("failed to run ffprobe: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(OrchestratorError::not_responding(
                source.id,
                format!("ffprobe exited with {}: {}", output.status, stderr.trim()),
            ));
        }

        let streams = parse_stream_types(&output.stdout)
            .map_err(|e| OrchestratorError::not_responding(source.id, format!("unreadable ffprobe output: {e}")))?;
        if streams.is_empty() {
            return Err(OrchestratorError::not_responding(source.id, "no streams found"));
        }

        debug!(source_id = source.id, streams = ?streams, "ffprobe found streams");
        Ok(())
    }
}

fn parse_stream_types(stdout: &[u8]) -> Result<Vec<String>, serde_json::Error> {
    let parsed: FfprobeOutput = serde_json::from_slice(stdout)?;
    Ok(parsed
        .streams
        .into_iter()
        .map(|s| s.codec_type.unwrap_or_else(|| "unknown".to_string()))
        .collect())
}

#[async_trait]
impl PreflightProbe for FfprobeProbe {
    async fn probe(&self, source: &Source, user_agent: &str, timeout: Duration) -> OrchestratorResult<()> {
        match tokio::time::timeout(timeout, self.run(source, user_agent)).await {
            Ok(result) => result,
            Err(_) => Err(OrchestratorError::not_responding(
                source.id,
                format!("ffprobe timed out after {}ms", timeout.as_millis()),
            )),
        }
    }
}

/// Probes with a plain HTTP GET: success status plus a first body chunk.
#[derive(Debug, Clone, Default)]
pub struct HttpProbe {
    client: reqwest::Client,
}

impl HttpProbe {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub const fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    async fn run(&self, source: &Source, user_agent: &str) -> OrchestratorResult<()> {
        let mut response = self
            .client
            .get(&source.url)
            .header(reqwest::header::USER_AGENT, user_agent)
            .send()
            .await
            .map_err(|e| OrchestratorError::not_responding(source.id, e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(OrchestratorError::not_responding(source.id, format!("HTTP {status}")));
        }

        loop {
            match response.chunk().await {
                Ok(Some(chunk)) if chunk.is_empty() => {}
                Ok(Some(chunk)) => {
                    debug!(source_id = source.id, bytes = chunk.len(), "HTTP probe received data");
                    return Ok(());
                }
                Ok(None) => return Err(OrchestratorError::not_responding(source.id, "empty response body")),
                Err(e) => return Err(OrchestratorError::not_responding(source.id, e.to_string())),
            }
        }
    }
}

#[async_trait]
impl PreflightProbe for HttpProbe {
    async fn probe(&self, source: &Source, user_agent: &str, timeout: Duration) -> OrchestratorResult<()> {
        match tokio::time::timeout(timeout, self.run(source, user_agent)).await {
            Ok(result) => result,
            Err(_) => Err(OrchestratorError::not_responding(
                source.id,
                format!("no data within {}ms", timeout.as_millis()),
            )),
        }
    }
}
