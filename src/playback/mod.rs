//! Adaptive playback client
//!
//! One `PlaybackSession` per camera owns a single live connection object and
//! drives it through a bounded-retry reconnect state machine. The state
//! machine is generic over the `StreamConnection` capability trait; the four
//! protocol modules supply only the connection-object lifecycle. On every
//! Kth retry of a relay-mediated protocol the session re-registers the
//! stream with the control API, because the relay may have lost the backing
//! transcoder independently of this client's connection.

pub mod connection;
pub mod control;
pub mod flv;
pub mod hls;
pub mod loader;
pub mod mjpeg;
pub mod policy;
pub mod sdp;
pub mod webrtc;

use std::str::FromStr;
use std::sync::Arc;

use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::AppError;

pub use connection::StreamConnection;
pub use control::{ControlApiClient, Reregister};
pub use policy::ReconnectPolicy;

/// Delivery protocol of a playback session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackProtocol {
    Mjpeg,
    Hls,
    Flv,
    WebRtc,
}

impl std::fmt::Display for PlaybackProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Mjpeg => write!(f, "mjpeg"),
            Self::Hls => write!(f, "hls"),
            Self::Flv => write!(f, "flv"),
            Self::WebRtc => write!(f, "webrtc"),
        }
    }
}

impl FromStr for PlaybackProtocol {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "mjpeg" => Ok(Self::Mjpeg),
            "hls" => Ok(Self::Hls),
            "flv" => Ok(Self::Flv),
            "webrtc" | "whep" => Ok(Self::WebRtc),
            other => Err(AppError::BadRequest(format!(
                "unknown playback protocol: {other}"
            ))),
        }
    }
}

/// Connection state of a playback session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Loading,
    Connected,
    Error,
    Destroyed,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Loading => write!(f, "loading"),
            Self::Connected => write!(f, "connected"),
            Self::Error => write!(f, "error"),
            Self::Destroyed => write!(f, "destroyed"),
        }
    }
}

/// Observable status of a playback session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaybackStatus {
    pub state: ConnectionState,
    /// Consecutive failures since the last successful connect
    pub retry_count: u32,
    /// Retry bound reached; only an explicit `request_retry` continues
    pub exhausted: bool,
}

impl PlaybackStatus {
    fn initial() -> Self {
        Self {
            state: ConnectionState::Loading,
            retry_count: 0,
            exhausted: false,
        }
    }
}

/// One adaptive playback session for one camera
///
/// Owns exactly one connection object at a time and at most one pending
/// retry timer. Teardown cancels the timer and closes the connection before
/// the driver task finishes; dropping the session without `destroy` still
/// cancels the driver.
pub struct PlaybackSession {
    camera_id: String,
    status_rx: watch::Receiver<PlaybackStatus>,
    retry_now: Arc<Notify>,
    cancel: CancellationToken,
    driver: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl PlaybackSession {
    /// Start a session driving `connection` under `policy`.
    ///
    /// `reregistrar` is consulted on every Kth retry; pass `None` for
    /// protocols that are not relay-mediated.
    pub fn spawn<C>(
        camera_id: impl Into<String>,
        connection: C,
        policy: ReconnectPolicy,
        reregistrar: Option<Arc<dyn Reregister>>,
    ) -> Self
    where
        C: StreamConnection + 'static,
    {
        let camera_id = camera_id.into();
        let (status_tx, status_rx) = watch::channel(PlaybackStatus::initial());
        let retry_now = Arc::new(Notify::new());
        let cancel = CancellationToken::new();

        let driver = tokio::spawn(drive(
            camera_id.clone(),
            connection,
            policy,
            reregistrar,
            status_tx,
            retry_now.clone(),
            cancel.clone(),
        ));

        Self {
            camera_id,
            status_rx,
            retry_now,
            cancel,
            driver: parking_lot::Mutex::new(Some(driver)),
        }
    }

    pub fn camera_id(&self) -> &str {
        &self.camera_id
    }

    pub fn status(&self) -> PlaybackStatus {
        self.status_rx.borrow().clone()
    }

    pub fn retry_count(&self) -> u32 {
        self.status_rx.borrow().retry_count
    }

    /// Watch state transitions.
    pub fn subscribe(&self) -> watch::Receiver<PlaybackStatus> {
        self.status_rx.clone()
    }

    /// Manual retry. Skips a pending backoff timer and resumes an exhausted
    /// session; never resets the retry count.
    pub fn request_retry(&self) {
        self.retry_now.notify_one();
    }

    /// Tear the session down: cancel any pending retry timer, close the
    /// connection and wait for the driver to finish.
    pub async fn destroy(&self) {
        self.cancel.cancel();
        let driver = self.driver.lock().take();
        if let Some(driver) = driver {
            let _ = driver.await;
        }
    }
}

impl Drop for PlaybackSession {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// The reconnect state machine.
async fn drive<C: StreamConnection>(
    camera_id: String,
    mut connection: C,
    policy: ReconnectPolicy,
    reregistrar: Option<Arc<dyn Reregister>>,
    status_tx: watch::Sender<PlaybackStatus>,
    retry_now: Arc<Notify>,
    cancel: CancellationToken,
) {
    let mut retry_count: u32 = 0;

    'outer: loop {
        publish(&status_tx, ConnectionState::Loading, retry_count, false);

        let opened = tokio::select! {
            _ = cancel.cancelled() => break 'outer,
            result = connection.open() => result,
        };

        match opened {
            Ok(()) => {
                // Reset only here, never on a manual retry.
                retry_count = 0;
                publish(&status_tx, ConnectionState::Connected, 0, false);
                tracing::info!(camera = %camera_id, "Playback connected");

                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break 'outer,
                        _ = tokio::time::sleep(policy.health_interval) => {
                            if !connection.is_healthy().await {
                                tracing::warn!(camera = %camera_id, "Playback connection degraded");
                                break;
                            }
                        }
                    }
                }
            }
            Err(err) => {
                tracing::warn!(camera = %camera_id, error = %err, "Playback open failed");
            }
        }

        // Tear the previous connection object down fully before any retry.
        connection.close().await;
        if cancel.is_cancelled() {
            break;
        }

        retry_count = retry_count.saturating_add(1);
        let exhausted = policy.exhausted(retry_count);
        publish(&status_tx, ConnectionState::Error, retry_count, exhausted);

        if policy.reregister_due(retry_count) {
            if let Some(reregistrar) = &reregistrar {
                // "already exists" counts as success; a real failure only
                // delays recovery until the next threshold.
                if let Err(err) = reregistrar.reregister().await {
                    tracing::warn!(
                        camera = %camera_id,
                        error = %err,
                        "Stream re-registration failed"
                    );
                }
            }
        }

        if exhausted {
            tracing::warn!(
                camera = %camera_id,
                retries = retry_count,
                "Retry bound exhausted, waiting for manual retry"
            );
            tokio::select! {
                _ = cancel.cancelled() => break 'outer,
                _ = retry_now.notified() => {}
            }
        } else {
            let delay = policy.delay_for(retry_count);
            tracing::debug!(
                camera = %camera_id,
                attempt = retry_count,
                delay_ms = delay.as_millis() as u64,
                "Scheduling reconnect"
            );
            tokio::select! {
                _ = cancel.cancelled() => break 'outer,
                _ = retry_now.notified() => {}
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    connection.close().await;
    publish(&status_tx, ConnectionState::Destroyed, retry_count, false);
}

fn publish(
    status_tx: &watch::Sender<PlaybackStatus>,
    state: ConnectionState,
    retry_count: u32,
    exhausted: bool,
) {
    status_tx.send_replace(PlaybackStatus {
        state,
        retry_count,
        exhausted,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::time::Duration;

    /// Shared observation side of a mock connection
    #[derive(Clone)]
    struct Probe {
        script: Arc<parking_lot::Mutex<VecDeque<bool>>>,
        default_open_ok: Arc<AtomicBool>,
        healthy: Arc<AtomicBool>,
        opens: Arc<AtomicU32>,
        closes: Arc<AtomicU32>,
        live: Arc<AtomicBool>,
        overlapping_open: Arc<AtomicBool>,
    }

    struct MockConnection {
        probe: Probe,
    }

    fn mock(default_open_ok: bool) -> (MockConnection, Probe) {
        let probe = Probe {
            script: Arc::new(parking_lot::Mutex::new(VecDeque::new())),
            default_open_ok: Arc::new(AtomicBool::new(default_open_ok)),
            healthy: Arc::new(AtomicBool::new(true)),
            opens: Arc::new(AtomicU32::new(0)),
            closes: Arc::new(AtomicU32::new(0)),
            live: Arc::new(AtomicBool::new(false)),
            overlapping_open: Arc::new(AtomicBool::new(false)),
        };
        (
            MockConnection {
                probe: probe.clone(),
            },
            probe,
        )
    }

    #[async_trait]
    impl StreamConnection for MockConnection {
        async fn open(&mut self) -> crate::error::Result<()> {
            self.probe.opens.fetch_add(1, Ordering::SeqCst);
            let ok = self
                .probe
                .script
                .lock()
                .pop_front()
                .unwrap_or(self.probe.default_open_ok.load(Ordering::SeqCst));
            if ok {
                if self.probe.live.swap(true, Ordering::SeqCst) {
                    self.probe.overlapping_open.store(true, Ordering::SeqCst);
                }
                Ok(())
            } else {
                Err(AppError::Playback("scripted failure".to_string()))
            }
        }

        async fn close(&mut self) {
            self.probe.live.store(false, Ordering::SeqCst);
            self.probe.closes.fetch_add(1, Ordering::SeqCst);
        }

        async fn is_healthy(&mut self) -> bool {
            self.probe.healthy.load(Ordering::SeqCst)
        }
    }

    struct CountingReregistrar {
        calls: AtomicU32,
    }

    #[async_trait]
    impl Reregister for CountingReregistrar {
        async fn reregister(&self) -> crate::error::Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn fast_policy() -> ReconnectPolicy {
        ReconnectPolicy {
            short_interval: Duration::from_millis(5),
            long_interval: Duration::from_millis(10),
            short_attempts: 3,
            max_retries: None,
            reregister_every: None,
            health_interval: Duration::from_millis(5),
        }
    }

    async fn wait_for(
        rx: &mut watch::Receiver<PlaybackStatus>,
        mut predicate: impl FnMut(&PlaybackStatus) -> bool,
    ) -> PlaybackStatus {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                {
                    let status = rx.borrow_and_update();
                    if predicate(&status) {
                        return status.clone();
                    }
                }
                rx.changed().await.expect("status channel open");
            }
        })
        .await
        .expect("status condition within timeout")
    }

    #[tokio::test]
    async fn retry_count_resets_only_on_connect() {
        let (conn, probe) = mock(true);
        // Two failures, then success.
        probe.script.lock().extend([false, false, true]);

        let session = PlaybackSession::spawn("cam1", conn, fast_policy(), None);
        let mut rx = session.subscribe();

        let status = wait_for(&mut rx, |s| s.state == ConnectionState::Connected).await;
        assert_eq!(status.retry_count, 0);

        // Degrade the live connection: the count restarts from one.
        probe.healthy.store(false, Ordering::SeqCst);
        let status = wait_for(&mut rx, |s| s.state == ConnectionState::Error).await;
        assert_eq!(status.retry_count, 1);

        session.destroy().await;
        assert!(!probe.overlapping_open.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn consecutive_failures_accumulate() {
        let (conn, probe) = mock(false);
        let session = PlaybackSession::spawn("cam1", conn, fast_policy(), None);
        let mut rx = session.subscribe();

        let mut last_seen = 0u32;
        let status = wait_for(&mut rx, |s| {
            assert!(s.retry_count >= last_seen, "retry count went backwards");
            last_seen = s.retry_count;
            s.retry_count >= 3
        })
        .await;
        assert_eq!(status.state, ConnectionState::Error);

        session.destroy().await;
        assert!(!probe.overlapping_open.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn every_kth_retry_reregisters() {
        let (conn, _probe) = mock(false);
        let policy = ReconnectPolicy {
            reregister_every: Some(2),
            max_retries: Some(6),
            ..fast_policy()
        };
        let reregistrar = Arc::new(CountingReregistrar {
            calls: AtomicU32::new(0),
        });

        let session =
            PlaybackSession::spawn("cam1", conn, policy, Some(reregistrar.clone()));
        let mut rx = session.subscribe();

        wait_for(&mut rx, |s| s.exhausted).await;

        // Retries 2, 4 and 6 escalate. The status update is published just
        // before the escalation call, so allow it a moment to land.
        let deadline = std::time::Instant::now() + Duration::from_secs(1);
        while reregistrar.calls.load(Ordering::SeqCst) < 3 {
            assert!(std::time::Instant::now() < deadline, "escalations missing");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(reregistrar.calls.load(Ordering::SeqCst), 3);

        session.destroy().await;
    }

    #[tokio::test]
    async fn exhausted_session_waits_for_manual_retry() {
        let (conn, probe) = mock(false);
        let policy = ReconnectPolicy {
            max_retries: Some(2),
            ..fast_policy()
        };
        let session = PlaybackSession::spawn("cam1", conn, policy, None);
        let mut rx = session.subscribe();

        let status = wait_for(&mut rx, |s| s.exhausted).await;
        assert_eq!(status.retry_count, 2);

        // Parked: no new attempts on their own.
        let opens_before = probe.opens.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(probe.opens.load(Ordering::SeqCst), opens_before);

        // The explicit retry action continues without resetting the count.
        session.request_retry();
        let status = wait_for(&mut rx, |s| s.retry_count >= 3).await;
        assert!(status.retry_count >= 3);
        assert!(probe.opens.load(Ordering::SeqCst) > opens_before);

        session.destroy().await;
    }

    #[tokio::test]
    async fn destroy_clears_pending_retries_and_connection() {
        let (conn, probe) = mock(false);
        let session = PlaybackSession::spawn("cam1", conn, fast_policy(), None);
        let mut rx = session.subscribe();

        wait_for(&mut rx, |s| s.retry_count >= 1).await;
        session.destroy().await;

        assert_eq!(session.status().state, ConnectionState::Destroyed);
        assert!(!probe.live.load(Ordering::SeqCst));

        // No timer survived teardown.
        let opens_before = probe.opens.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(probe.opens.load(Ordering::SeqCst), opens_before);
        assert!(probe.closes.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test]
    async fn reconnect_cycles_never_overlap_connections() {
        let (conn, probe) = mock(true);
        let policy = ReconnectPolicy {
            short_interval: Duration::from_millis(2),
            health_interval: Duration::from_millis(2),
            ..fast_policy()
        };
        let session = PlaybackSession::spawn("cam1", conn, policy, None);

        // Flap health so the session churns through connect/error cycles.
        for _ in 0..10 {
            probe.healthy.store(false, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(8)).await;
            probe.healthy.store(true, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(8)).await;
        }

        session.destroy().await;
        assert!(!probe.overlapping_open.load(Ordering::SeqCst));
        assert!(!probe.live.load(Ordering::SeqCst));
    }

    /// A failing HLS loader escalating into the control path: every Kth
    /// retry re-adds the stream, so it shows up in the registry again even
    /// though playback itself keeps failing.
    #[tokio::test]
    async fn hls_failure_escalates_into_stream_registration() {
        use crate::events::EventBus;
        use crate::stream::tests::{fake_transcoder, test_config};
        use crate::stream::StreamManager;

        struct ManagerReregistrar {
            manager: Arc<StreamManager>,
            id: String,
            rtsp_url: String,
        }

        #[async_trait]
        impl Reregister for ManagerReregistrar {
            async fn reregister(&self) -> crate::error::Result<()> {
                self.manager.add(&self.id, &self.rtsp_url).await.map(|_| ())
            }
        }

        let (_dir, script) = fake_transcoder("sleep 60");
        let manager = StreamManager::new(&test_config(&script), Arc::new(EventBus::new()));

        // Nothing listens here: every manifest fetch fails, like a relay
        // with a dead transcode subprocess behind it.
        let connection =
            super::hls::HlsConnection::new("http://127.0.0.1:9/hls/cam1/index.m3u8")
                .expect("conn");
        let policy = ReconnectPolicy {
            short_interval: Duration::from_millis(5),
            long_interval: Duration::from_millis(10),
            short_attempts: 3,
            max_retries: Some(6),
            reregister_every: Some(3),
            health_interval: Duration::from_millis(5),
        };
        let session = PlaybackSession::spawn(
            "cam1",
            connection,
            policy,
            Some(Arc::new(ManagerReregistrar {
                manager: manager.clone(),
                id: "cam1".to_string(),
                rtsp_url: "rtsp://u:p@1.2.3.4:554/live".to_string(),
            })),
        );
        let mut rx = session.subscribe();

        let status = wait_for(&mut rx, |s| s.exhausted).await;
        assert_eq!(status.retry_count, 6);

        // Retries 3 and 6 re-registered the stream.
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        loop {
            if manager.list().await.iter().any(|s| s.id == "cam1") {
                break;
            }
            assert!(
                std::time::Instant::now() < deadline,
                "escalation never re-registered the stream"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        session.destroy().await;
        manager.shutdown().await;
    }

    #[test]
    fn protocol_parsing() {
        assert_eq!(
            "webrtc".parse::<PlaybackProtocol>().unwrap(),
            PlaybackProtocol::WebRtc
        );
        assert_eq!(
            "WHEP".parse::<PlaybackProtocol>().unwrap(),
            PlaybackProtocol::WebRtc
        );
        assert_eq!(
            "mjpeg".parse::<PlaybackProtocol>().unwrap(),
            PlaybackProtocol::Mjpeg
        );
        assert!("dash".parse::<PlaybackProtocol>().is_err());
    }
}
