//! Event system for stream lifecycle notifications
//!
//! A small broadcast bus so observers (logging, tests, future UI pushes) can
//! follow registry changes without polling `list()`.

use serde::Serialize;
use tokio::sync::broadcast;

/// Event channel capacity (ring buffer size)
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Stream lifecycle events
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    /// A stream was registered and its transcoder spawned
    Registered { id: String },
    /// A stream was removed (explicit remove or restart)
    Removed { id: String },
    /// The transcoder subprocess exited on its own
    TranscoderExited { id: String, code: Option<i32> },
}

/// Global event bus for broadcasting stream events
///
/// Events are fire-and-forget: with no active subscribers they are dropped.
pub struct EventBus {
    tx: broadcast::Sender<StreamEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Publish an event to all subscribers
    pub fn publish(&self, event: StreamEvent) {
        // If no subscribers, send returns Err which is normal
        let _ = self.tx.send(event);
    }

    /// Subscribe to events
    ///
    /// The receiver uses a ring buffer; a subscriber that falls too far
    /// behind receives a `Lagged` error and misses events.
    pub fn subscribe(&self) -> broadcast::Receiver<StreamEvent> {
        self.tx.subscribe()
    }

    /// Current number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
