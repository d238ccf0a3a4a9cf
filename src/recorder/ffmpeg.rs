use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{MediaRecorder, RecordOutput, RecordRequest, RecorderError, Result};

const STDERR_TAIL_LINES: usize = 8;

#[derive(Debug, Clone)]
pub struct FfmpegConfig {
    pub binary_path: PathBuf,
    /// How long to wait for a clean exit after asking ffmpeg to quit
    pub stop_grace: Duration,
}

impl Default for FfmpegConfig {
    fn default() -> Self {
        Self {
            binary_path: PathBuf::from("ffmpeg"),
            stop_grace: Duration::from_secs(10),
        }
    }
}

/// Records streams with `ffmpeg -c copy`
pub struct FfmpegRecorder {
    config: FfmpegConfig,
}

impl FfmpegRecorder {
    pub fn new(config: FfmpegConfig) -> Self {
        Self { config }
    }

    pub fn build_args(&self, request: &RecordRequest) -> Vec<String> {
        vec![
            "-hide_banner".to_string(),
            "-loglevel".to_string(),
            "warning".to_string(),
            "-i".to_string(),
            request.stream_url.clone(),
            "-c".to_string(),
            "copy".to_string(),
            "-t".to_string(),
            request.max_duration.as_secs().max(1).to_string(),
            "-y".to_string(),
            request.output_path.to_string_lossy().to_string(),
        ]
    }
}

/// Forward encoder stderr to the log and keep the last lines for error reports
async fn forward_stderr(stderr: ChildStderr) -> Vec<String> {
    let mut lines = BufReader::new(stderr).lines();
    let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);

    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if line.to_ascii_lowercase().contains("error") {
                    warn!(target: "feedpipe::ffmpeg", "{}", line);
                } else {
                    debug!(target: "feedpipe::ffmpeg", "{}", line);
                }
                if tail.len() == STDERR_TAIL_LINES {
                    tail.pop_front();
                }
                tail.push_back(line);
            }
            Ok(None) => break,
            Err(e) => {
                debug!("Stopped reading ffmpeg stderr: {}", e);
                break;
            }
        }
    }

    tail.into_iter().collect()
}

impl FfmpegRecorder {
    /// Quit through stdin, then SIGTERM, then kill. Each step waits `stop_grace`.
    async fn stop(&self, child: &mut Child, stdin: Option<&mut ChildStdin>) -> Result<ExitStatus> {
        let grace = self.config.stop_grace;

        if let Some(stdin) = stdin {
            let _ = stdin.write_all(b"q\n").await;
            let _ = stdin.flush().await;
        }
        if let Ok(status) = tokio::time::timeout(grace, child.wait()).await {
            return Ok(status?);
        }

        if terminate(child) {
            warn!(grace_secs = grace.as_secs(), "ffmpeg ignored quit, sent SIGTERM");
            if let Ok(status) = tokio::time::timeout(grace, child.wait()).await {
                return Ok(status?);
            }
        }

        warn!(grace_secs = grace.as_secs(), "ffmpeg did not exit in time, killing");
        child.kill().await?;
        Ok(child.wait().await?)
    }
}

/// Send SIGTERM. Returns `false` when no signal was delivered.
#[cfg(unix)]
fn terminate(child: &Child) -> bool {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    let Some(pid) = child.id().and_then(|pid| i32::try_from(pid).ok()) else {
        return false;
    };
    match kill(Pid::from_raw(pid), Signal::SIGTERM) {
        Ok(()) => true,
        Err(err) => {
            debug!(pid, error = %err, "SIGTERM not delivered");
            false
        }
    }
}

#[cfg(not(unix))]
fn terminate(_child: &Child) -> bool {
    false
}

#[async_trait]
impl MediaRecorder for FfmpegRecorder {
    async fn record(
        &self,
        request: &RecordRequest,
        cancel: CancellationToken,
    ) -> Result<RecordOutput> {
        let args = self.build_args(request);
        info!(
            stream_url = %request.stream_url,
            output = %request.output_path.display(),
            max_secs = request.max_duration.as_secs(),
            "Starting ffmpeg recording"
        );

        let started = Instant::now();
        let mut child = Command::new(&self.config.binary_path)
            .args(&args)
            .env("LC_ALL", "C")
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(RecorderError::Spawn)?;

        let stderr = child.stderr.take().ok_or(RecorderError::Pipe("stderr"))?;
        let mut stdin = child.stdin.take();
        let stderr_task = tokio::spawn(forward_stderr(stderr));

        let status = tokio::select! {
            status = child.wait() => status?,
            _ = cancel.cancelled() => {
                info!(output = %request.output_path.display(), "Stopping ffmpeg gracefully");
                self.stop(&mut child, stdin.as_mut()).await?
            }
        };
        drop(stdin);

        let tail = stderr_task.await.unwrap_or_default();
        if !status.success() {
            return Err(RecorderError::ExitStatus {
                code: status.code(),
                stderr: tail.join("\n"),
            });
        }

        let size = tokio::fs::metadata(&request.output_path).await?.len();
        let duration_secs = started.elapsed().as_secs();
        info!(
            output = %request.output_path.display(),
            size,
            duration_secs,
            "Recording finished"
        );

        Ok(RecordOutput {
            output_path: request.output_path.clone(),
            size,
            duration_secs,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn request(dir: &TempDir) -> RecordRequest {
        RecordRequest {
            stream_url: "https://live.example/stream.m3u8".to_string(),
            output_path: dir.path().join("out.ts"),
            max_duration: Duration::from_secs(7200),
        }
    }

    #[test]
    fn test_build_args_copies_stream() {
        let dir = TempDir::new().unwrap();
        let recorder = FfmpegRecorder::new(FfmpegConfig::default());
        let args = recorder.build_args(&request(&dir));

        let joined = args.join(" ");
        assert!(joined.contains("-i https://live.example/stream.m3u8"));
        assert!(joined.contains("-c copy"));
        assert!(joined.contains("-t 7200"));
        assert_eq!(args.last().map(String::as_str), dir.path().join("out.ts").to_str());
    }

    #[cfg(unix)]
    fn fake_ffmpeg(dir: &TempDir, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.path().join("fake-ffmpeg");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_successful_recording_reports_size() {
        let dir = TempDir::new().unwrap();
        let binary = fake_ffmpeg(&dir, "for last; do :; done\nprintf 'media' > \"$last\"");
        let recorder = FfmpegRecorder::new(FfmpegConfig {
            binary_path: binary,
            stop_grace: Duration::from_secs(5),
        });

        let output = recorder
            .record(&request(&dir), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(output.size, 5);
        assert_eq!(output.output_path, dir.path().join("out.ts"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_nonzero_exit_is_error_with_stderr() {
        let dir = TempDir::new().unwrap();
        let binary = fake_ffmpeg(&dir, "echo 'Connection refused' >&2\nexit 1");
        let recorder = FfmpegRecorder::new(FfmpegConfig {
            binary_path: binary,
            stop_grace: Duration::from_secs(5),
        });

        let err = recorder
            .record(&request(&dir), CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            RecorderError::ExitStatus { code, stderr } => {
                assert_eq!(code, Some(1));
                assert!(stderr.contains("Connection refused"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cancel_sends_quit_and_keeps_output() {
        let dir = TempDir::new().unwrap();
        let binary = fake_ffmpeg(
            &dir,
            "for last; do :; done\nread cmd\nprintf 'partial' > \"$last\"\nexit 0",
        );
        let recorder = FfmpegRecorder::new(FfmpegConfig {
            binary_path: binary,
            stop_grace: Duration::from_secs(5),
        });

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            trigger.cancel();
        });

        let output = recorder.record(&request(&dir), cancel).await.unwrap();
        assert_eq!(output.size, 7);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cancel_falls_back_to_sigterm() {
        let dir = TempDir::new().unwrap();
        let binary = fake_ffmpeg(
            &dir,
            "for last; do :; done\ntrap 'printf term > \"$last\"; exit 0' TERM\nwhile :; do sleep 0.05; done",
        );
        let recorder = FfmpegRecorder::new(FfmpegConfig {
            binary_path: binary,
            stop_grace: Duration::from_millis(300),
        });

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            trigger.cancel();
        });

        let output = recorder.record(&request(&dir), cancel).await.unwrap();
        assert_eq!(output.size, 4);
    }

    #[tokio::test]
    async fn test_missing_binary_is_spawn_error() {
        let dir = TempDir::new().unwrap();
        let recorder = FfmpegRecorder::new(FfmpegConfig {
            binary_path: dir.path().join("does-not-exist"),
            stop_grace: Duration::from_secs(1),
        });

        let err = recorder
            .record(&request(&dir), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, RecorderError::Spawn(_)));
    }
}
