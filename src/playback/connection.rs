//! Connection capability interface
//!
//! The reconnect state machine is generic over this trait; each protocol
//! supplies only its connection-object lifecycle.

use async_trait::async_trait;

use crate::error::Result;

/// One live protocol connection for one camera.
///
/// Contract: the driving session owns the object exclusively and strictly
/// sequences calls — `open` is never invoked while a previous open is live
/// without an intervening `close`. `close` must be idempotent and must
/// release everything (sockets, tasks, peer connections) so that a retry
/// starts from a clean slate.
#[async_trait]
pub trait StreamConnection: Send {
    /// Establish the connection. Returning `Ok` means playback is live
    /// (for WebRTC: the peer connection reached `connected`).
    async fn open(&mut self) -> Result<()>;

    /// Tear the connection down, releasing all resources. Idempotent.
    async fn close(&mut self);

    /// Probe the live connection. `false` routes the session into `Error`
    /// and schedules a retry.
    async fn is_healthy(&mut self) -> bool;
}
