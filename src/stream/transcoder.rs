//! Transcoder subprocess supervision
//!
//! One subprocess per stream pulls the camera's native RTSP feed and
//! republishes it toward the relay ingest with copied video and normalized
//! audio. The supervisor never waits for the relay to confirm frames; it
//! only tracks process lifecycle.

use std::collections::VecDeque;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot, RwLock};

use crate::config::TranscoderConfig;
use crate::error::{AppError, Result};

/// Maximum number of diagnostic log lines kept per stream
const LOG_BUFFER_SIZE: usize = 200;

/// Natural exit of a transcoder subprocess, delivered to the registry owner
/// as a message. Kill-initiated exits are not reported; the registry entry
/// is already gone by the time the kill is sent.
#[derive(Debug)]
pub struct TranscoderExit {
    pub id: String,
    pub epoch: u64,
    pub status: Option<ExitStatus>,
}

/// Handle to a spawned transcoder
///
/// `epoch` identifies this particular spawn. A late exit event carrying an
/// older epoch must never affect a session re-created by a restart.
#[derive(Debug)]
pub struct TranscoderHandle {
    pub epoch: u64,
    kill: Option<oneshot::Sender<()>>,
    logs: Arc<RwLock<VecDeque<String>>>,
}

impl TranscoderHandle {
    /// Signal the waiter task to kill the subprocess. Idempotent.
    pub fn terminate(&mut self) {
        if let Some(kill) = self.kill.take() {
            let _ = kill.send(());
        }
    }

    /// Most recent diagnostic lines from the subprocess.
    pub async fn logs(&self, lines: usize) -> Vec<String> {
        let logs = self.logs.read().await;
        let start = logs.len().saturating_sub(lines);
        logs.range(start..).cloned().collect()
    }
}

impl Drop for TranscoderHandle {
    fn drop(&mut self) {
        // Dropping the kill sender makes the waiter task reap the child.
        self.kill.take();
    }
}

/// Spawns and supervises transcoder subprocesses
pub struct TranscoderSupervisor {
    config: TranscoderConfig,
    ingest_url: String,
    next_epoch: AtomicU64,
    exit_tx: mpsc::UnboundedSender<TranscoderExit>,
}

impl TranscoderSupervisor {
    pub fn new(
        config: TranscoderConfig,
        ingest_url: String,
        exit_tx: mpsc::UnboundedSender<TranscoderExit>,
    ) -> Self {
        Self {
            config,
            ingest_url,
            next_epoch: AtomicU64::new(1),
            exit_tx,
        }
    }

    /// Relay ingest base the transcoders push to.
    pub fn ingest_url(&self) -> &str {
        &self.ingest_url
    }

    /// Check that the transcoder binary can be spawned. Bare names are left
    /// to PATH resolution at spawn time.
    pub fn check_available(&self) -> bool {
        let binary = Path::new(&self.config.binary);
        if binary.components().count() > 1 {
            binary.exists()
        } else {
            true
        }
    }

    /// Fixed argument list: pull the source over TCP, copy video, normalize
    /// audio, push to the relay ingest under the same id.
    fn build_args(&self, id: &str, source_url: &str) -> Vec<String> {
        vec![
            "-hide_banner".to_string(),
            "-loglevel".to_string(),
            "warning".to_string(),
            "-rtsp_transport".to_string(),
            "tcp".to_string(),
            "-i".to_string(),
            source_url.to_string(),
            "-c:v".to_string(),
            "copy".to_string(),
            "-c:a".to_string(),
            "aac".to_string(),
            "-b:a".to_string(),
            self.config.audio_bitrate.clone(),
            "-ar".to_string(),
            self.config.audio_sample_rate.to_string(),
            "-f".to_string(),
            "rtsp".to_string(),
            format!("{}/{}", self.ingest_url.trim_end_matches('/'), id),
        ]
    }

    /// Spawn a transcoder for `id`. Returns as soon as the process is
    /// running; frame flow toward the relay is not confirmed here.
    pub fn start(&self, id: &str, source_url: &str) -> Result<TranscoderHandle> {
        if !self.check_available() {
            return Err(AppError::Transcoder(format!(
                "transcoder binary not found at {}",
                self.config.binary
            )));
        }

        let args = self.build_args(id, source_url);
        let epoch = self.next_epoch.fetch_add(1, Ordering::Relaxed);

        tracing::info!(
            stream = %id,
            epoch,
            "Starting transcoder: {} {}",
            self.config.binary,
            args.join(" ")
        );

        let mut child = Command::new(&self.config.binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                AppError::Transcoder(format!("failed to start {}: {}", self.config.binary, e))
            })?;

        let logs = Arc::new(RwLock::new(VecDeque::with_capacity(LOG_BUFFER_SIZE)));

        if let Some(stdout) = child.stdout.take() {
            let logs = logs.clone();
            let id = id.to_string();
            tokio::spawn(async move {
                collect_logs(&id, stdout, logs).await;
            });
        }
        if let Some(stderr) = child.stderr.take() {
            let logs = logs.clone();
            let id = id.to_string();
            tokio::spawn(async move {
                collect_logs(&id, stderr, logs).await;
            });
        }

        tracing::info!(stream = %id, pid = ?child.id(), "Transcoder started");

        // The waiter task owns the child. Natural exits are reported as
        // messages; a kill signal (or dropped handle) reaps silently.
        let (kill_tx, kill_rx) = oneshot::channel::<()>();
        let exit_tx = self.exit_tx.clone();
        let waiter_id = id.to_string();
        tokio::spawn(async move {
            tokio::select! {
                status = child.wait() => {
                    let status = status.ok();
                    tracing::info!(
                        stream = %waiter_id,
                        epoch,
                        status = ?status,
                        "Transcoder exited"
                    );
                    let _ = exit_tx.send(TranscoderExit {
                        id: waiter_id,
                        epoch,
                        status,
                    });
                }
                _ = kill_rx => {
                    if let Err(e) = child.kill().await {
                        tracing::warn!(stream = %waiter_id, "Failed to kill transcoder: {}", e);
                    }
                    let _ = child.wait().await;
                    tracing::info!(stream = %waiter_id, epoch, "Transcoder stopped");
                }
            }
        });

        Ok(TranscoderHandle {
            epoch,
            kill: Some(kill_tx),
            logs,
        })
    }
}

/// Collect subprocess output into the bounded per-stream ring
async fn collect_logs<R: tokio::io::AsyncRead + Unpin>(
    id: &str,
    reader: R,
    logs: Arc<RwLock<VecDeque<String>>>,
) {
    let reader = BufReader::new(reader);
    let mut lines = reader.lines();

    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                tracing::debug!("[transcoder:{}] {}", id, line);
                let mut logs = logs.write().await;
                if logs.len() >= LOG_BUFFER_SIZE {
                    logs.pop_front();
                }
                logs.push_back(line);
            }
            Ok(None) => break,
            Err(e) => {
                tracing::warn!("[transcoder:{}] error reading output: {}", id, e);
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::tests::fake_transcoder;

    fn supervisor_with(
        binary: &str,
    ) -> (
        TranscoderSupervisor,
        mpsc::UnboundedReceiver<TranscoderExit>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let config = TranscoderConfig {
            binary: binary.to_string(),
            ..Default::default()
        };
        (
            TranscoderSupervisor::new(config, "rtsp://127.0.0.1:8554".to_string(), tx),
            rx,
        )
    }

    #[test]
    fn build_args_pull_copy_normalize_push() {
        let (supervisor, _rx) = supervisor_with("ffmpeg");
        let args = supervisor.build_args("cam1", "rtsp://u:p@1.2.3.4:554/live");

        let joined = args.join(" ");
        assert!(joined.contains("-rtsp_transport tcp"));
        assert!(joined.contains("-i rtsp://u:p@1.2.3.4:554/live"));
        assert!(joined.contains("-c:v copy"));
        assert!(joined.contains("-c:a aac"));
        assert!(joined.contains("-ar 44100"));
        assert_eq!(args.last().unwrap(), "rtsp://127.0.0.1:8554/cam1");
    }

    #[test]
    fn missing_binary_path_is_unavailable() {
        let (supervisor, _rx) = supervisor_with("/nonexistent/dir/ffmpeg");
        assert!(!supervisor.check_available());

        // Bare names defer to PATH resolution
        let (supervisor, _rx) = supervisor_with("ffmpeg");
        assert!(supervisor.check_available());
    }

    #[tokio::test]
    async fn start_with_missing_binary_fails() {
        let (supervisor, _rx) = supervisor_with("/nonexistent/dir/ffmpeg");
        let err = supervisor
            .start("cam1", "rtsp://example/live")
            .expect_err("should fail");
        assert!(matches!(err, AppError::Transcoder(_)));
    }

    #[tokio::test]
    async fn natural_exit_is_delivered_as_message() {
        let (_dir, script) = fake_transcoder("exit 3");
        let (supervisor, mut rx) = supervisor_with(&script);

        let handle = supervisor
            .start("cam1", "rtsp://example/live")
            .expect("spawn");

        let exit = tokio::time::timeout(std::time::Duration::from_secs(5), rx.recv())
            .await
            .expect("exit within timeout")
            .expect("channel open");
        assert_eq!(exit.id, "cam1");
        assert_eq!(exit.epoch, handle.epoch);
        assert_eq!(exit.status.and_then(|s| s.code()), Some(3));
    }

    #[tokio::test]
    async fn terminate_does_not_report_an_exit() {
        let (_dir, script) = fake_transcoder("sleep 60");
        let (supervisor, mut rx) = supervisor_with(&script);

        let mut handle = supervisor
            .start("cam1", "rtsp://example/live")
            .expect("spawn");
        handle.terminate();

        // Killed processes stay silent; only natural exits become messages.
        let timed_out =
            tokio::time::timeout(std::time::Duration::from_millis(500), rx.recv()).await;
        assert!(timed_out.is_err());
    }

    #[tokio::test]
    async fn epochs_are_unique_per_spawn() {
        let (_dir, script) = fake_transcoder("sleep 60");
        let (supervisor, _rx) = supervisor_with(&script);

        let mut a = supervisor.start("cam1", "rtsp://example/live").expect("a");
        let mut b = supervisor.start("cam1", "rtsp://example/live").expect("b");
        assert_ne!(a.epoch, b.epoch);

        a.terminate();
        b.terminate();
    }
}
