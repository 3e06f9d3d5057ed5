//! Application configuration
//!
//! Resolved once at process start from an optional TOML file plus CLI
//! overrides. Nothing here is hot-reloadable.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Web server settings
    pub server: ServerConfig,
    /// External relay settings
    pub relay: RelayConfig,
    /// Transcoder subprocess settings
    pub transcoder: TranscoderConfig,
    /// Playback / lifecycle tuning
    pub playback: PlaybackConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            relay: RelayConfig::default(),
            transcoder: TranscoderConfig::default(),
            playback: PlaybackConfig::default(),
        }
    }
}

/// Web server configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address
    pub bind_address: String,
    /// HTTP port
    pub http_port: u16,
    /// Shared secret required as a bearer token on the WHEP path.
    /// Empty/absent disables the check.
    pub stream_password: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            http_port: 8080,
            stream_password: None,
        }
    }
}

impl ServerConfig {
    /// Effective WHEP secret, treating an empty string as unset.
    pub fn whep_secret(&self) -> Option<&str> {
        self.stream_password.as_deref().filter(|s| !s.is_empty())
    }
}

/// External relay configuration
///
/// The relay terminates RTSP/WebRTC/HLS and exposes per-stream ingest and
/// egress paths. All URLs are base URLs without a trailing stream id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RelayConfig {
    /// HLS egress base (manifests and segments)
    pub hls_url: String,
    /// WHEP signaling base
    pub whep_url: String,
    /// HTTP-FLV egress base
    pub flv_url: String,
    /// RTSP ingest base the transcoder republishes to
    pub ingest_url: String,
    /// Credential injected by the proxy on relay requests
    pub api_user: Option<String>,
    pub api_pass: Option<String>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            hls_url: "http://127.0.0.1:8888".to_string(),
            whep_url: "http://127.0.0.1:8889".to_string(),
            flv_url: "http://127.0.0.1:8890".to_string(),
            ingest_url: "rtsp://127.0.0.1:8554".to_string(),
            api_user: None,
            api_pass: None,
        }
    }
}

/// Transcoder subprocess configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TranscoderConfig {
    /// Transcoder binary (absolute path or resolved via PATH)
    pub binary: String,
    /// Audio bitrate of the republish leg (video is copied)
    pub audio_bitrate: String,
    /// Audio sample rate of the republish leg
    pub audio_sample_rate: u32,
}

impl Default for TranscoderConfig {
    fn default() -> Self {
        Self {
            binary: "ffmpeg".to_string(),
            audio_bitrate: "128k".to_string(),
            audio_sample_rate: 44_100,
        }
    }
}

/// Playback / stream lifecycle tuning
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PlaybackConfig {
    /// Delay between remove and re-add during restart. The relay keeps the
    /// path owned for a grace period after removal; re-adding inside that
    /// window is silently rejected.
    pub restart_settle_ms: u64,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            restart_settle_ms: 1000,
        }
    }
}

impl AppConfig {
    /// Load configuration from a TOML file, falling back to defaults when no
    /// path is given.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };

        let raw = std::fs::read_to_string(path).map_err(|e| {
            AppError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;

        toml::from_str(&raw)
            .map_err(|e| AppError::Config(format!("failed to parse {}: {}", path.display(), e)))
    }
}
