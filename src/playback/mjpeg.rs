//! MJPEG playback connection
//!
//! Talks straight to the camera, not to the relay: the connection object is
//! a single image resource load, refreshed with a cache-busting query
//! parameter. No re-registration path exists for this protocol.

use std::time::Duration;

use async_trait::async_trait;
use url::Url;

use crate::error::{AppError, Result};

use super::connection::StreamConnection;

const FETCH_TIMEOUT: Duration = Duration::from_secs(5);

pub struct MjpegConnection {
    url: Url,
    http: reqwest::Client,
    /// Monotonic cache-busting counter; one increment per fetch
    fetches: u64,
    frames: u64,
}

impl MjpegConnection {
    /// `url` is the camera's direct snapshot endpoint.
    pub fn new(url: &str) -> Result<Self> {
        let url = Url::parse(url)
            .map_err(|e| AppError::Playback(format!("invalid MJPEG url {url}: {e}")))?;
        let http = reqwest::Client::builder()
            .timeout(FETCH_TIMEOUT)
            .build()
            .map_err(|e| AppError::Playback(format!("failed to build MJPEG client: {e}")))?;

        Ok(Self {
            url,
            http,
            fetches: 0,
            frames: 0,
        })
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }

    fn next_url(&mut self) -> Url {
        self.fetches = self.fetches.wrapping_add(1);
        let mut url = self.url.clone();
        url.query_pairs_mut()
            .append_pair("cb", &self.fetches.to_string());
        url
    }

    async fn fetch_frame(&mut self) -> Result<()> {
        let url = self.next_url();
        let response = self.http.get(url).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(AppError::Playback(format!(
                "camera answered {status} for image fetch"
            )));
        }

        let body = response.bytes().await?;
        if body.is_empty() {
            return Err(AppError::Playback("camera returned an empty image".to_string()));
        }

        self.frames += 1;
        Ok(())
    }
}

#[async_trait]
impl StreamConnection for MjpegConnection {
    async fn open(&mut self) -> Result<()> {
        self.fetch_frame().await
    }

    async fn close(&mut self) {
        // A poller holds no persistent resources.
    }

    /// Each probe pulls the next frame; the poller is its own health check.
    async fn is_healthy(&mut self) -> bool {
        self.fetch_frame().await.is_ok()
    }
}
