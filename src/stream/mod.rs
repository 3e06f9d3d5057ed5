//! Stream session lifecycle
//!
//! `StreamManager` is the only writer of the registry: it registers a
//! camera's source, spawns the transcoder that republishes it to the relay,
//! and applies asynchronous transcoder exits delivered as messages by the
//! supervisor's waiter tasks.

pub mod registry;
pub mod transcoder;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;

use crate::config::AppConfig;
use crate::error::{AppError, Result};
use crate::events::{EventBus, StreamEvent};

pub use registry::{SessionStatus, StreamEndpoints, StreamInfo, StreamRegistry, StreamSession};
pub use transcoder::{TranscoderExit, TranscoderSupervisor};

/// Result of an add operation. A duplicate id is not an error: the client's
/// re-registration path adds speculatively without consulting `list` first.
#[derive(Debug)]
pub enum AddOutcome {
    Added(StreamInfo),
    AlreadyExists,
}

/// Owns the registry and the transcoder supervisor
pub struct StreamManager {
    registry: Arc<StreamRegistry>,
    supervisor: TranscoderSupervisor,
    events: Arc<EventBus>,
    settle_delay: Duration,
}

impl StreamManager {
    pub fn new(config: &AppConfig, events: Arc<EventBus>) -> Arc<Self> {
        let (exit_tx, exit_rx) = mpsc::unbounded_channel();
        let registry = Arc::new(StreamRegistry::new());
        let supervisor = TranscoderSupervisor::new(
            config.transcoder.clone(),
            config.relay.ingest_url.clone(),
            exit_tx,
        );

        spawn_exit_listener(registry.clone(), events.clone(), exit_rx);

        Arc::new(Self {
            registry,
            supervisor,
            events,
            settle_delay: Duration::from_millis(config.playback.restart_settle_ms),
        })
    }

    /// Register a stream and start its transcoder.
    ///
    /// Idempotent: an id that is already registered returns
    /// `AddOutcome::AlreadyExists` with no side effects.
    pub async fn add(&self, id: &str, source_url: &str) -> Result<AddOutcome> {
        let id = validate_id(id)?;
        let source_url = source_url.trim();
        if source_url.is_empty() {
            return Err(AppError::BadRequest("rtspUrl is required".to_string()));
        }

        if self.registry.contains(id).await {
            return Ok(AddOutcome::AlreadyExists);
        }

        let endpoints = self.endpoints_for(id);
        let handle = self.supervisor.start(id, source_url)?;
        let started_at = Utc::now();

        let session = StreamSession {
            id: id.to_string(),
            source_url: source_url.to_string(),
            endpoints: endpoints.clone(),
            status: SessionStatus::Starting,
            handle,
            started_at,
        };

        if let Err(mut rejected) = self.registry.insert(session).await {
            // Lost a race with a concurrent add for the same id.
            rejected.handle.terminate();
            return Ok(AddOutcome::AlreadyExists);
        }

        // The spawn succeeded; nobody waits for the relay to confirm frames.
        self.registry.set_status(id, SessionStatus::Running).await;
        self.events.publish(StreamEvent::Registered { id: id.to_string() });

        Ok(AddOutcome::Added(StreamInfo {
            id: id.to_string(),
            rtsp_url: source_url.to_string(),
            hls_url: endpoints.hls_url,
            webrtc_url: endpoints.webrtc_url,
            status: SessionStatus::Running,
            start_time: started_at,
        }))
    }

    /// Stop the transcoder and delete the session.
    pub async fn remove(&self, id: &str) -> Result<()> {
        match self.registry.remove(id).await {
            Some(mut session) => {
                session.status = SessionStatus::Stopping;
                session.handle.terminate();
                self.events.publish(StreamEvent::Removed { id: id.to_string() });
                Ok(())
            }
            None => Err(AppError::NotFound(format!("stream {id} is not registered"))),
        }
    }

    /// Remove, wait out the relay's path grace period, then re-add with the
    /// previously known source.
    pub async fn restart(&self, id: &str) -> Result<StreamInfo> {
        let source_url = self
            .registry
            .source_url(id)
            .await
            .ok_or_else(|| AppError::NotFound(format!("stream {id} is not registered")))?;

        if let Err(e) = self.remove(id).await {
            tracing::debug!(stream = %id, "remove during restart: {}", e);
        }

        tokio::time::sleep(self.settle_delay).await;

        match self.add(id, &source_url).await? {
            AddOutcome::Added(info) => Ok(info),
            AddOutcome::AlreadyExists => self
                .registry
                .info(id)
                .await
                .ok_or_else(|| AppError::Internal(format!("stream {id} vanished during restart"))),
        }
    }

    /// Snapshot of registered streams; only true at time of call.
    pub async fn list(&self) -> Vec<StreamInfo> {
        self.registry.snapshot().await
    }

    pub async fn count(&self) -> usize {
        self.registry.count().await
    }

    /// Recent transcoder output for a stream.
    pub async fn logs(&self, id: &str, lines: usize) -> Result<Vec<String>> {
        self.registry
            .transcoder_logs(id, lines)
            .await
            .ok_or_else(|| AppError::NotFound(format!("stream {id} is not registered")))
    }

    /// Stop every transcoder. Used during shutdown.
    pub async fn shutdown(&self) {
        let infos = self.registry.snapshot().await;
        for info in infos {
            if let Some(mut session) = self.registry.remove(&info.id).await {
                session.handle.terminate();
                tracing::info!(stream = %info.id, "Transcoder stopped on shutdown");
            }
        }
    }

    fn endpoints_for(&self, id: &str) -> StreamEndpoints {
        StreamEndpoints {
            hls_url: format!("/hls/{id}/index.m3u8"),
            webrtc_url: format!("/whep/{id}"),
            republish_url: format!("{}/{}", self.supervisor_ingest().trim_end_matches('/'), id),
        }
    }

    fn supervisor_ingest(&self) -> &str {
        self.supervisor.ingest_url()
    }
}

/// The id travels verbatim as a path segment across registration, proxying
/// and playback; reject anything that cannot do that safely.
fn validate_id(id: &str) -> Result<&str> {
    let id = id.trim();
    if id.is_empty() {
        return Err(AppError::BadRequest("id is required".to_string()));
    }
    if id == "." || id == ".." {
        return Err(AppError::BadRequest(format!("invalid stream id: {id}")));
    }
    let valid = id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if !valid {
        return Err(AppError::BadRequest(format!(
            "stream id must be a safe path segment: {id}"
        )));
    }
    Ok(id)
}

/// Apply transcoder exits to the registry.
///
/// Exits arrive as messages, never as direct mutation from the waiter task.
/// The epoch comparison drops events from superseded spawns.
fn spawn_exit_listener(
    registry: Arc<StreamRegistry>,
    events: Arc<EventBus>,
    mut exit_rx: mpsc::UnboundedReceiver<TranscoderExit>,
) {
    tokio::spawn(async move {
        while let Some(exit) = exit_rx.recv().await {
            match registry.remove_if_epoch(&exit.id, exit.epoch).await {
                Some(_session) => {
                    tracing::warn!(
                        stream = %exit.id,
                        status = ?exit.status,
                        "Transcoder died, removing session"
                    );
                    events.publish(StreamEvent::TranscoderExited {
                        id: exit.id,
                        code: exit.status.and_then(|s| s.code()),
                    });
                }
                None => {
                    tracing::debug!(
                        stream = %exit.id,
                        epoch = exit.epoch,
                        "Stale transcoder exit ignored"
                    );
                }
            }
        }
    });
}
