use std::sync::Arc;

use tokio::sync::broadcast;

use crate::config::AppConfig;
use crate::events::EventBus;
use crate::proxy::RelayProxy;
use crate::stream::StreamManager;

/// Application-wide state shared across handlers
pub struct AppState {
    /// Resolved configuration (not hot-reloadable)
    pub config: AppConfig,
    /// Stream registry + transcoder supervisor
    pub streams: Arc<StreamManager>,
    /// Reverse proxy to the relay's internal ports
    pub proxy: RelayProxy,
    /// Event bus for stream lifecycle notifications
    pub events: Arc<EventBus>,
    /// Shutdown signal sender
    pub shutdown_tx: broadcast::Sender<()>,
}

impl AppState {
    pub fn new(
        config: AppConfig,
        streams: Arc<StreamManager>,
        proxy: RelayProxy,
        events: Arc<EventBus>,
        shutdown_tx: broadcast::Sender<()>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            streams,
            proxy,
            events,
            shutdown_tx,
        })
    }

    /// Subscribe to shutdown signal
    pub fn shutdown_signal(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }
}
