//! In-memory stream registry
//!
//! Single source of truth for "is this camera registered". A session present
//! here is not a guarantee of flowing video: the transcoder can die at any
//! moment and its exit is applied asynchronously.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::stream::transcoder::TranscoderHandle;

/// Stream session status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionStatus {
    Starting,
    Running,
    Stopping,
    Stopped,
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Starting => write!(f, "Starting"),
            Self::Running => write!(f, "Running"),
            Self::Stopping => write!(f, "Stopping"),
            Self::Stopped => write!(f, "Stopped"),
        }
    }
}

/// Playback endpoints derived from a stream id
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEndpoints {
    /// Manifest path served through the proxy
    pub hls_url: String,
    /// WHEP signaling path served through the proxy
    pub webrtc_url: String,
    /// Relay ingest target the transcoder pushes to
    pub republish_url: String,
}

/// A registered stream and its transcoder
#[derive(Debug)]
pub struct StreamSession {
    pub id: String,
    pub source_url: String,
    pub endpoints: StreamEndpoints,
    pub status: SessionStatus,
    pub handle: TranscoderHandle,
    pub started_at: DateTime<Utc>,
}

impl StreamSession {
    pub fn info(&self) -> StreamInfo {
        StreamInfo {
            id: self.id.clone(),
            rtsp_url: self.source_url.clone(),
            hls_url: self.endpoints.hls_url.clone(),
            webrtc_url: self.endpoints.webrtc_url.clone(),
            status: self.status,
            start_time: self.started_at,
        }
    }
}

/// Wire-level description of a registered stream
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamInfo {
    pub id: String,
    pub rtsp_url: String,
    pub hls_url: String,
    pub webrtc_url: String,
    pub status: SessionStatus,
    pub start_time: DateTime<Utc>,
}

/// Registry of active stream sessions
///
/// All mutation goes through `StreamManager` and the exit drain task; the
/// map lock is the only synchronization. Races between remove and add for
/// the same id are tolerated by idempotent add and absent-tolerant remove,
/// not by locking across calls.
pub struct StreamRegistry {
    sessions: RwLock<HashMap<String, StreamSession>>,
}

impl StreamRegistry {
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
        }
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.sessions.read().await.contains_key(id)
    }

    pub async fn source_url(&self, id: &str) -> Option<String> {
        self.sessions
            .read()
            .await
            .get(id)
            .map(|s| s.source_url.clone())
    }

    pub async fn info(&self, id: &str) -> Option<StreamInfo> {
        self.sessions.read().await.get(id).map(|s| s.info())
    }

    /// Insert a session unless the id is already registered.
    /// Returns the rejected session on conflict so the caller can tear its
    /// transcoder down.
    pub async fn insert(&self, session: StreamSession) -> Result<(), StreamSession> {
        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(&session.id) {
            return Err(session);
        }
        sessions.insert(session.id.clone(), session);
        Ok(())
    }

    pub async fn remove(&self, id: &str) -> Option<StreamSession> {
        self.sessions.write().await.remove(id)
    }

    /// Remove a session only if it is still owned by the given spawn epoch.
    ///
    /// Guards against a stale exit event from a process that was already
    /// superseded by a restart.
    pub async fn remove_if_epoch(&self, id: &str, epoch: u64) -> Option<StreamSession> {
        let mut sessions = self.sessions.write().await;
        match sessions.get(id) {
            Some(session) if session.handle.epoch == epoch => sessions.remove(id),
            _ => None,
        }
    }

    pub async fn set_status(&self, id: &str, status: SessionStatus) {
        if let Some(session) = self.sessions.write().await.get_mut(id) {
            session.status = status;
        }
    }

    /// Recent transcoder output for a stream, if registered.
    pub async fn transcoder_logs(&self, id: &str, lines: usize) -> Option<Vec<String>> {
        let sessions = self.sessions.read().await;
        let session = sessions.get(id)?;
        Some(session.handle.logs(lines).await)
    }

    /// Point-in-time snapshot. Only true at time of call.
    pub async fn snapshot(&self) -> Vec<StreamInfo> {
        let sessions = self.sessions.read().await;
        let mut infos: Vec<StreamInfo> = sessions.values().map(|s| s.info()).collect();
        infos.sort_by(|a, b| a.id.cmp(&b.id));
        infos
    }

    pub async fn count(&self) -> usize {
        self.sessions.read().await.len()
    }
}

impl Default for StreamRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TranscoderConfig;
    use crate::stream::tests::fake_transcoder;
    use crate::stream::transcoder::TranscoderSupervisor;
    use tokio::sync::mpsc;

    fn endpoints(id: &str) -> StreamEndpoints {
        StreamEndpoints {
            hls_url: format!("/hls/{id}/index.m3u8"),
            webrtc_url: format!("/whep/{id}"),
            republish_url: format!("rtsp://127.0.0.1:8554/{id}"),
        }
    }

    async fn live_session(id: &str, script: &str) -> StreamSession {
        let (tx, _rx) = mpsc::unbounded_channel();
        // Receiver dropped on purpose: these sessions only exercise the map.
        let supervisor = TranscoderSupervisor::new(
            TranscoderConfig {
                binary: script.to_string(),
                ..Default::default()
            },
            "rtsp://127.0.0.1:8554".to_string(),
            tx,
        );
        let handle = supervisor.start(id, "rtsp://example/live").expect("spawn");
        StreamSession {
            id: id.to_string(),
            source_url: "rtsp://example/live".to_string(),
            endpoints: endpoints(id),
            status: SessionStatus::Running,
            handle,
            started_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn insert_rejects_duplicate_ids() {
        let (_dir, script) = fake_transcoder("sleep 60");
        let registry = StreamRegistry::new();

        registry.insert(live_session("cam1", &script).await).await.ok().unwrap();
        let rejected = registry.insert(live_session("cam1", &script).await).await.err();
        assert!(rejected.is_some());
        assert_eq!(registry.count().await, 1);

        if let Some(mut session) = rejected {
            session.handle.terminate();
        }
        if let Some(mut session) = registry.remove("cam1").await {
            session.handle.terminate();
        }
    }

    #[tokio::test]
    async fn remove_absent_is_a_noop() {
        let (_dir, script) = fake_transcoder("sleep 60");
        let registry = StreamRegistry::new();
        registry.insert(live_session("cam1", &script).await).await.ok().unwrap();

        assert!(registry.remove("unknown").await.is_none());
        assert_eq!(registry.count().await, 1);
        assert!(registry.contains("cam1").await);

        if let Some(mut session) = registry.remove("cam1").await {
            session.handle.terminate();
        }
    }

    #[tokio::test]
    async fn stale_epoch_cannot_remove_a_superseding_session() {
        let (_dir, script) = fake_transcoder("sleep 60");
        let registry = StreamRegistry::new();

        let session = live_session("cam1", &script).await;
        let current_epoch = session.handle.epoch;
        registry.insert(session).await.ok().unwrap();

        // An exit event from a previous spawn carries an older epoch.
        assert!(registry
            .remove_if_epoch("cam1", current_epoch.wrapping_sub(1))
            .await
            .is_none());
        assert!(registry.contains("cam1").await);

        // The matching epoch removes as usual.
        let mut removed = registry
            .remove_if_epoch("cam1", current_epoch)
            .await
            .expect("matching epoch removes");
        removed.handle.terminate();
        assert_eq!(registry.count().await, 0);
    }

    #[tokio::test]
    async fn snapshot_is_sorted_and_complete() {
        let (_dir, script) = fake_transcoder("sleep 60");
        let registry = StreamRegistry::new();
        registry.insert(live_session("cam2", &script).await).await.ok().unwrap();
        registry.insert(live_session("cam1", &script).await).await.ok().unwrap();

        let infos = registry.snapshot().await;
        assert_eq!(infos.len(), 2);
        assert_eq!(infos[0].id, "cam1");
        assert_eq!(infos[1].id, "cam2");
        assert_eq!(infos[0].hls_url, "/hls/cam1/index.m3u8");
        assert_eq!(infos[0].status, SessionStatus::Running);

        for id in ["cam1", "cam2"] {
            if let Some(mut session) = registry.remove(id).await {
                session.handle.terminate();
            }
        }
    }

    #[test]
    fn status_serializes_capitalized() {
        let json = serde_json::to_string(&SessionStatus::Running).unwrap();
        assert_eq!(json, "\"Running\"");
        assert_eq!(SessionStatus::Starting.to_string(), "Starting");
    }
}
