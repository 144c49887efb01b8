// ffmpeg HLS relay
//
// The relay copies the upstream into an HLS segment directory and reports
// progress on stdout (`-progress pipe:1`). Progress lines drive the speed
// check, stall detection and the bandwidth figure.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tokio::process::{Child, ChildStdout, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use tvmux_core::OrchestratorConfig;

use super::{LaunchRequest, ProcessHandle, ProcessHealth, ProcessLauncher};
use crate::error::{OrchestratorError, OrchestratorResult};

const STOP_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct FfmpegLauncher {
    ffmpeg_path: String,
    output_root: PathBuf,
    speed_check_timeout: Duration,
    stall_timeout: Duration,
}

impl FfmpegLauncher {
    pub fn new(
        ffmpeg_path: impl Into<String>,
        output_root: impl Into<PathBuf>,
        speed_check_timeout: Duration,
        stall_timeout: Duration,
    ) -> Self {
        Self {
            ffmpeg_path: ffmpeg_path.into(),
            output_root: output_root.into(),
            speed_check_timeout,
            stall_timeout,
        }
    }

    #[must_use]
    pub fn from_config(config: &OrchestratorConfig) -> Self {
        Self::new(
            config.ffmpeg_path.clone(),
            config.output_dir.clone(),
            config.speed_check_timeout(),
            config.stall_timeout(),
        )
    }

    /// `{root}/{type}/{model_id}/{source_id}-{nonce}`: one directory per launch,
    /// so stopping a relay never touches segments of another session that
    /// happens to relay the same source.
    fn output_dir_for(&self, request: &LaunchRequest) -> PathBuf {
        self.output_root
            .join(request.session_key.stream_type.as_str())
            .join(request.session_key.model_id.to_string())
            .join(format!("{}-{}", request.source_id, nanoid::nanoid!(8)))
    }
}

fn build_args(request: &LaunchRequest, output_dir: &Path) -> Vec<String> {
    let segment_pattern = output_dir.join("segment_%05d.ts").to_string_lossy().into_owned();
    let playlist = output_dir.join("index.m3u8").to_string_lossy().into_owned();

    let mut args: Vec<String> = ["-hide_banner", "-nostats", "-loglevel", "error"]
        .into_iter()
        .map(String::from)
        .collect();
    args.extend(["-user_agent".to_string(), request.user_agent.clone()]);
    args.extend(["-i".to_string(), request.url.clone()]);
    args.extend(
        [
            "-c",
            "copy",
            "-f",
            "hls",
            "-hls_time",
            "4",
            "-hls_list_size",
            "6",
            "-hls_flags",
            "delete_segments+omit_endlist",
            "-hls_segment_filename",
        ]
        .into_iter()
        .map(String::from),
    );
    args.push(segment_pattern);
    args.extend(["-progress".to_string(), "pipe:1".to_string(), playlist]);
    args
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum ProgressField {
    OutTimeUs(i64),
    TotalSize(u64),
    BitrateKbps(f64),
}

/// Parse one `key=value` line of ffmpeg `-progress` output.
fn parse_progress_line(line: &str) -> Option<ProgressField> {
    let (key, value) = line.trim().split_once('=')?;
    match key {
        "out_time_us" | "out_time_ms" => value.parse().ok().map(ProgressField::OutTimeUs),
        "total_size" => value.parse().ok().map(ProgressField::TotalSize),
        "bitrate" => value
            .trim()
            .strip_suffix("kbits/s")
            .and_then(|v| v.trim().parse().ok())
            .map(ProgressField::BitrateKbps),
        _ => None,
    }
}

#[derive(Debug, Default)]
struct ProgressCursor {
    out_time_us: i64,
    total_size: u64,
}

impl ProgressCursor {
    /// Whether the field moves output forward
    fn advance(&mut self, field: ProgressField) -> bool {
        match field {
            ProgressField::OutTimeUs(t) if t > self.out_time_us => {
                self.out_time_us = t;
                true
            }
            ProgressField::TotalSize(s) if s > self.total_size => {
                self.total_size = s;
                true
            }
            _ => false,
        }
    }
}

#[derive(Debug)]
struct ProgressState {
    last_progress: Mutex<Instant>,
    bitrate_kbps: AtomicU32,
}

impl ProgressState {
    fn new() -> Self {
        Self {
            last_progress: Mutex::new(Instant::now()),
            bitrate_kbps: AtomicU32::new(0),
        }
    }

    fn record(&self, field: ProgressField, advanced: bool) {
        if advanced {
            *self.last_progress.lock() = Instant::now();
        }
        if let ProgressField::BitrateKbps(kbps) = field {
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            self.bitrate_kbps.store(kbps.max(0.0).round() as u32, Ordering::Relaxed);
        }
    }
}

/// Wait for the first progress line that shows output moving.
async fn speed_check(
    lines: &mut Lines<BufReader<ChildStdout>>,
    state: &ProgressState,
    cursor: &mut ProgressCursor,
    timeout: Duration,
) -> Result<(), String> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        match tokio::time::timeout_at(deadline, lines.next_line()).await {
            Err(_) => return Err(format!("no output within {}ms", timeout.as_millis())),
            Ok(Err(e)) => return Err(format!("failed reading progress: {e}")),
            Ok(Ok(None)) => return Err("process exited before producing output".to_string()),
            Ok(Ok(Some(line))) => {
                if let Some(field) = parse_progress_line(&line) {
                    let advanced = cursor.advance(field);
                    state.record(field, advanced);
                    if advanced {
                        return Ok(());
                    }
                }
            }
        }
    }
}

async fn remove_output_dir(dir: &Path) {
    if let Err(e) = tokio::fs::remove_dir_all(dir).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(dir = %dir.display(), error = %e, "Failed to remove segment directory");
        }
    }
}

async fn kill_child(child: &mut Child) {
    if let Err(e) = child.start_kill() {
        debug!(error = %e, "Kill signal not delivered");
    }
    if tokio::time::timeout(STOP_TIMEOUT, child.wait()).await.is_err() {
        warn!(pid = ?child.id(), "Relay did not exit after kill");
    }
}

#[async_trait]
impl ProcessLauncher for FfmpegLauncher {
    async fn launch(&self, request: &LaunchRequest) -> OrchestratorResult<Arc<dyn ProcessHandle>> {
        let output_dir = self.output_dir_for(request);
        tokio::fs::create_dir_all(&output_dir).await.map_err(|e| {
            OrchestratorError::ResourceSetup(format!(
                "cannot create segment directory {}: {e}",
                output_dir.display()
            ))
        })?;

        let mut child = match Command::new(&self.ffmpeg_path)
            .args(build_args(request, &output_dir))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                remove_output_dir(&output_dir).await;
                return Err(OrchestratorError::launch_failure(
                    request.source_id,
                    format!("failed to spawn {}: {e}", self.ffmpeg_path),
                ));
            }
        };
        let pid = child.id();

        if let Some(stderr) = child.stderr.take() {
            let source_id = request.source_id;
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    warn!(source_id, "ffmpeg: {line}");
                }
            });
        }

        let Some(stdout) = child.stdout.take() else {
            kill_child(&mut child).await;
            remove_output_dir(&output_dir).await;
            return Err(OrchestratorError::launch_failure(request.source_id, "progress pipe unavailable"));
        };
        let mut lines = BufReader::new(stdout).lines();
        let state = Arc::new(ProgressState::new());
        let mut cursor = ProgressCursor::default();

        if let Err(reason) = speed_check(&mut lines, &state, &mut cursor, self.speed_check_timeout).await {
            kill_child(&mut child).await;
            remove_output_dir(&output_dir).await;
            return Err(OrchestratorError::launch_failure(request.source_id, reason));
        }

        let reader = {
            let state = Arc::clone(&state);
            tokio::spawn(async move {
                while let Ok(Some(line)) = lines.next_line().await {
                    if let Some(field) = parse_progress_line(&line) {
                        let advanced = cursor.advance(field);
                        state.record(field, advanced);
                    }
                }
            })
        };

        info!(
            stream_type = %request.stream_type,
            source_id = request.source_id,
            pid = ?pid,
            output_dir = %output_dir.display(),
            "Relay process started"
        );

        Ok(Arc::new(FfmpegProcess {
            child: tokio::sync::Mutex::new(Some(child)),
            pid,
            output_dir,
            state,
            stall_timeout: self.stall_timeout,
            reader: Mutex::new(Some(reader)),
        }))
    }
}

/// Handle to a running ffmpeg relay.
pub struct FfmpegProcess {
    child: tokio::sync::Mutex<Option<Child>>,
    pid: Option<u32>,
    output_dir: PathBuf,
    state: Arc<ProgressState>,
    stall_timeout: Duration,
    reader: Mutex<Option<JoinHandle<()>>>,
}

#[async_trait]
impl ProcessHandle for FfmpegProcess {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn output_dir(&self) -> Option<&Path> {
        Some(&self.output_dir)
    }

    async fn health(&self) -> ProcessHealth {
        let mut guard = self.child.lock().await;
        let Some(child) = guard.as_mut() else {
            return ProcessHealth::Exited { code: None };
        };

        match child.try_wait() {
            Ok(Some(status)) => ProcessHealth::Exited { code: status.code() },
            Err(e) => {
                warn!(pid = ?self.pid, error = %e, "Failed to poll relay process");
                ProcessHealth::Exited { code: None }
            }
            Ok(None) => {
                let idle = self.state.last_progress.lock().elapsed();
                if idle > self.stall_timeout {
                    ProcessHealth::Stalled {
                        idle_secs: idle.as_secs(),
                    }
                } else {
                    ProcessHealth::Healthy
                }
            }
        }
    }

    async fn stop(&self) {
        let child = self.child.lock().await.take();
        let Some(mut child) = child else {
            return;
        };

        kill_child(&mut child).await;
        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }
        remove_output_dir(&self.output_dir).await;
        info!(pid = ?self.pid, "Relay process stopped");
    }

    fn bandwidth_kbps(&self) -> Option<u32> {
        match self.state.bitrate_kbps.load(Ordering::Relaxed) {
            0 => None,
            kbps => Some(kbps),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{SessionKey, StreamType};

    fn request(source_id: u64) -> LaunchRequest {
        request_for(source_id, source_id)
    }

    fn request_for(model_id: u64, source_id: u64) -> LaunchRequest {
        LaunchRequest {
            session_key: SessionKey::new(StreamType::Channel, model_id),
            stream_type: StreamType::Channel,
            source_id,
            url: "http://upstream.example/live.ts".to_string(),
            title: "News".to_string(),
            owner_id: 1,
            user_agent: "tvmux-test".to_string(),
        }
    }

    #[test]
    fn test_parse_progress_line() {
        assert_eq!(parse_progress_line("out_time_us=1500000"), Some(ProgressField::OutTimeUs(1_500_000)));
        assert_eq!(parse_progress_line("total_size=4096"), Some(ProgressField::TotalSize(4096)));
        assert_eq!(parse_progress_line("bitrate=2310.4kbits/s"), Some(ProgressField::BitrateKbps(2310.4)));
        assert_eq!(parse_progress_line("bitrate=N/A"), None);
        assert_eq!(parse_progress_line("total_size=N/A"), None);
        assert_eq!(parse_progress_line("progress=continue"), None);
        assert_eq!(parse_progress_line("garbage"), None);
    }

    #[test]
    fn test_cursor_only_counts_forward_motion() {
        let mut cursor = ProgressCursor::default();
        assert!(!cursor.advance(ProgressField::OutTimeUs(0)));
        assert!(cursor.advance(ProgressField::OutTimeUs(10)));
        assert!(!cursor.advance(ProgressField::OutTimeUs(10)));
        assert!(cursor.advance(ProgressField::TotalSize(1)));
        assert!(!cursor.advance(ProgressField::BitrateKbps(100.0)));
    }

    #[test]
    fn test_build_args_places_output_last() {
        let dir = PathBuf::from("/tmp/hls/channel/7");
        let args = build_args(&request(7), &dir);

        let ua = args.iter().position(|a| a == "-user_agent").unwrap();
        let input = args.iter().position(|a| a == "-i").unwrap();
        assert!(ua < input);
        assert_eq!(args[input + 1], "http://upstream.example/live.ts");
        assert!(args.windows(2).any(|w| w[0] == "-progress" && w[1] == "pipe:1"));
        assert_eq!(args.last().unwrap(), "/tmp/hls/channel/7/index.m3u8");
    }

    #[tokio::test]
    async fn test_output_root_unusable_is_resource_setup() {
        let root = tempfile::NamedTempFile::new().unwrap();
        let launcher = FfmpegLauncher::new(
            "ffmpeg",
            root.path(),
            Duration::from_millis(200),
            Duration::from_secs(5),
        );
        let err = launcher.launch(&request(1)).await.err().unwrap();
        assert!(matches!(err, OrchestratorError::ResourceSetup(_)));
    }

    #[tokio::test]
    async fn test_missing_binary_is_launch_failure() {
        let root = tempfile::tempdir().unwrap();
        let launcher = FfmpegLauncher::new(
            "/nonexistent/ffmpeg",
            root.path(),
            Duration::from_millis(200),
            Duration::from_secs(5),
        );
        let err = launcher.launch(&request(1)).await.err().unwrap();
        assert!(matches!(err, OrchestratorError::LaunchFailure { source_id: 1, .. }));
        let leftovers = std::fs::read_dir(root.path().join("channel/1")).unwrap().count();
        assert_eq!(leftovers, 0);
    }

    #[cfg(unix)]
    mod fake_ffmpeg {
        use super::*;
        use std::os::unix::fs::PermissionsExt;

        fn script(dir: &Path, body: &str) -> PathBuf {
            let path = dir.join("fake-ffmpeg.sh");
            std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
            path
        }

        fn launcher(bin: &Path, root: &Path, stall: Duration) -> FfmpegLauncher {
            FfmpegLauncher::new(bin.to_string_lossy(), root, Duration::from_millis(500), stall)
        }

        #[tokio::test]
        async fn test_launch_passes_speed_check() {
            let bin_dir = tempfile::tempdir().unwrap();
            let root = tempfile::tempdir().unwrap();
            let bin = script(
                bin_dir.path(),
                "echo out_time_us=0\necho bitrate=1800.0kbits/s\necho out_time_us=2000000\necho progress=continue\nsleep 30",
            );

            let handle = launcher(&bin, root.path(), Duration::from_secs(30))
                .launch(&request(3))
                .await
                .unwrap();
            assert!(handle.pid().is_some());
            let dir = handle.output_dir().unwrap().to_path_buf();
            assert_eq!(dir.parent().unwrap(), root.path().join("channel/3"));
            assert!(dir.file_name().unwrap().to_string_lossy().starts_with("3-"));
            assert!(dir.exists());
            assert_eq!(handle.health().await, ProcessHealth::Healthy);
            assert_eq!(handle.bandwidth_kbps(), Some(1800));

            handle.stop().await;
            assert_eq!(handle.health().await, ProcessHealth::Exited { code: None });
            assert!(!dir.exists());
            handle.stop().await;
        }

        #[tokio::test]
        async fn test_same_source_in_two_sessions_keeps_separate_storage() {
            let bin_dir = tempfile::tempdir().unwrap();
            let root = tempfile::tempdir().unwrap();
            let bin = script(bin_dir.path(), "echo out_time_us=1000\nsleep 30");
            let launcher = launcher(&bin, root.path(), Duration::from_secs(30));

            // channel:2 plays source 2 directly, channel:1 failed over onto it
            let direct = launcher.launch(&request_for(2, 2)).await.unwrap();
            let failed_over = launcher.launch(&request_for(1, 2)).await.unwrap();
            let direct_dir = direct.output_dir().unwrap().to_path_buf();
            let failed_over_dir = failed_over.output_dir().unwrap().to_path_buf();
            assert_ne!(direct_dir, failed_over_dir);

            failed_over.stop().await;
            assert!(!failed_over_dir.exists());
            assert!(direct_dir.exists());
            assert_eq!(direct.health().await, ProcessHealth::Healthy);

            // A relaunch of the same session gets fresh storage too
            let again = launcher.launch(&request_for(2, 2)).await.unwrap();
            assert_ne!(again.output_dir().unwrap(), direct_dir.as_path());

            direct.stop().await;
            again.stop().await;
            assert!(!direct_dir.exists());
        }

        #[tokio::test]
        async fn test_silent_process_fails_speed_check() {
            let bin_dir = tempfile::tempdir().unwrap();
            let root = tempfile::tempdir().unwrap();
            let bin = script(bin_dir.path(), "sleep 30");

            let started = Instant::now();
            let err = launcher(&bin, root.path(), Duration::from_secs(30))
                .launch(&request(4))
                .await
                .err()
                .unwrap();
            assert!(matches!(err, OrchestratorError::LaunchFailure { source_id: 4, .. }));
            assert!(started.elapsed() < Duration::from_secs(10));
        }

        #[tokio::test]
        async fn test_early_exit_fails_speed_check() {
            let bin_dir = tempfile::tempdir().unwrap();
            let root = tempfile::tempdir().unwrap();
            let bin = script(bin_dir.path(), "echo progress=end\nexit 1");

            let err = launcher(&bin, root.path(), Duration::from_secs(30))
                .launch(&request(5))
                .await
                .err()
                .unwrap();
            assert!(err.to_string().contains("exited before producing output"));
        }

        #[tokio::test]
        async fn test_stalled_process_reported() {
            let bin_dir = tempfile::tempdir().unwrap();
            let root = tempfile::tempdir().unwrap();
            let bin = script(bin_dir.path(), "echo total_size=1024\nsleep 30");

            let handle = launcher(&bin, root.path(), Duration::from_millis(100))
                .launch(&request(6))
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_millis(300)).await;
            assert!(matches!(handle.health().await, ProcessHealth::Stalled { .. }));
            handle.stop().await;
        }

        #[tokio::test]
        async fn test_exited_process_reported() {
            let bin_dir = tempfile::tempdir().unwrap();
            let root = tempfile::tempdir().unwrap();
            let bin = script(bin_dir.path(), "echo out_time_us=500\nexit 3");

            let handle = launcher(&bin, root.path(), Duration::from_secs(30))
                .launch(&request(8))
                .await
                .unwrap();
            let mut health = handle.health().await;
            for _ in 0..50 {
                if !health.is_healthy() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
                health = handle.health().await;
            }
            assert_eq!(health, ProcessHealth::Exited { code: Some(3) });
            handle.stop().await;
        }
    }
}
