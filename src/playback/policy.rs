//! Per-protocol reconnect policy
//!
//! A short fixed interval for the first attempts, a longer steady interval
//! after that. Relay-mediated protocols additionally re-register the stream
//! every Kth retry, because the most common unrecoverable failure is a dead
//! transcode subprocess the relay no longer serves. No jitter is applied
//! across cameras; synchronized retries are an accepted tradeoff.

use std::time::Duration;

use super::PlaybackProtocol;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Interval used for the first `short_attempts` retries
    pub short_interval: Duration,
    /// Steady interval after that
    pub long_interval: Duration,
    /// Number of retries served at the short interval
    pub short_attempts: u32,
    /// Total retry bound; `None` retries indefinitely
    pub max_retries: Option<u32>,
    /// Re-register the stream on every Nth retry; `None` never re-registers
    pub reregister_every: Option<u32>,
    /// Interval between health probes while connected
    pub health_interval: Duration,
}

impl ReconnectPolicy {
    /// MJPEG is not relay-mediated: bounded retries, no re-registration.
    pub fn mjpeg() -> Self {
        Self {
            short_interval: Duration::from_secs(3),
            long_interval: Duration::from_secs(5),
            short_attempts: 5,
            max_retries: Some(10),
            reregister_every: None,
            health_interval: Duration::from_secs(2),
        }
    }

    /// HLS against a live camera keeps trying forever.
    pub fn hls() -> Self {
        Self {
            short_interval: Duration::from_secs(2),
            long_interval: Duration::from_secs(10),
            short_attempts: 10,
            max_retries: None,
            reregister_every: Some(5),
            health_interval: Duration::from_secs(2),
        }
    }

    /// The legacy low-latency path gives up after a bound and surfaces a
    /// manual retry action.
    pub fn flv() -> Self {
        Self {
            short_interval: Duration::from_secs(2),
            long_interval: Duration::from_secs(10),
            short_attempts: 10,
            max_retries: Some(30),
            reregister_every: Some(5),
            health_interval: Duration::from_secs(1),
        }
    }

    /// WebRTC retries indefinitely while the camera is online; a dead relay
    /// path is expected to self-heal once the backing stream restarts.
    pub fn webrtc() -> Self {
        Self {
            short_interval: Duration::from_secs(1),
            long_interval: Duration::from_secs(15),
            short_attempts: 10,
            max_retries: None,
            reregister_every: Some(5),
            health_interval: Duration::from_secs(1),
        }
    }

    pub fn for_protocol(protocol: PlaybackProtocol) -> Self {
        match protocol {
            PlaybackProtocol::Mjpeg => Self::mjpeg(),
            PlaybackProtocol::Hls => Self::hls(),
            PlaybackProtocol::Flv => Self::flv(),
            PlaybackProtocol::WebRtc => Self::webrtc(),
        }
    }

    /// Delay before the given retry attempt (1-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        if retry <= self.short_attempts {
            self.short_interval
        } else {
            self.long_interval
        }
    }

    /// Whether the bound is exhausted at the given retry count.
    pub fn exhausted(&self, retry: u32) -> bool {
        self.max_retries.map(|max| retry >= max).unwrap_or(false)
    }

    /// Whether this retry should also re-register the stream upstream.
    pub fn reregister_due(&self, retry: u32) -> bool {
        match self.reregister_every {
            Some(every) if every > 0 => retry % every == 0,
            _ => false,
        }
    }
}
