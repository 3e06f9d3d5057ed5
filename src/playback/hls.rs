//! HLS playback connection
//!
//! A segmented-stream loader reduced to its liveness signal: the manifest's
//! media sequence number. A manifest that stops advancing past the stall
//! window is the signature of a dead transcode subprocess — the relay keeps
//! serving the last manifest it saw while nothing refills it.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use url::Url;

use crate::error::{AppError, Result};

use super::connection::StreamConnection;

const FETCH_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_STALL_WINDOW: Duration = Duration::from_secs(10);

/// Fields of an HLS media playlist this loader cares about
#[derive(Debug, PartialEq, Eq)]
pub struct HlsManifest {
    pub media_sequence: Option<u64>,
    pub segments: Vec<String>,
}

/// Parse the line-oriented playlist format. Only `#EXT-X-MEDIA-SEQUENCE`
/// and segment URIs are extracted.
pub fn parse_manifest(text: &str) -> Result<HlsManifest> {
    let mut lines = text.lines().map(str::trim);
    if lines.next() != Some("#EXTM3U") {
        return Err(AppError::Playback("not an HLS manifest".to_string()));
    }

    let mut media_sequence = None;
    let mut segments = Vec::new();
    for line in lines {
        if let Some(value) = line.strip_prefix("#EXT-X-MEDIA-SEQUENCE:") {
            media_sequence = value.trim().parse::<u64>().ok();
        } else if !line.is_empty() && !line.starts_with('#') {
            segments.push(line.to_string());
        }
    }

    Ok(HlsManifest {
        media_sequence,
        segments,
    })
}

pub struct HlsConnection {
    manifest_url: Url,
    http: reqwest::Client,
    stall_window: Duration,
    last_sequence: Option<u64>,
    last_advance: Option<Instant>,
}

impl HlsConnection {
    /// `manifest_url` points at the proxy's manifest path for one stream.
    pub fn new(manifest_url: &str) -> Result<Self> {
        Self::with_stall_window(manifest_url, DEFAULT_STALL_WINDOW)
    }

    pub fn with_stall_window(manifest_url: &str, stall_window: Duration) -> Result<Self> {
        let manifest_url = Url::parse(manifest_url)
            .map_err(|e| AppError::Playback(format!("invalid HLS url {manifest_url}: {e}")))?;
        let http = reqwest::Client::builder()
            .timeout(FETCH_TIMEOUT)
            .build()
            .map_err(|e| AppError::Playback(format!("failed to build HLS client: {e}")))?;

        Ok(Self {
            manifest_url,
            http,
            stall_window,
            last_sequence: None,
            last_advance: None,
        })
    }

    async fn fetch_manifest(&self) -> Result<HlsManifest> {
        let response = self.http.get(self.manifest_url.clone()).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(AppError::Playback(format!(
                "manifest fetch answered {status}"
            )));
        }
        parse_manifest(&response.text().await?)
    }

    /// Record an observation; returns false once the sequence has been
    /// frozen for longer than the stall window.
    fn observe(&mut self, sequence: Option<u64>) -> bool {
        let advanced = match (self.last_sequence, sequence) {
            (None, _) => true,
            (Some(prev), Some(seen)) => seen > prev,
            (Some(_), None) => false,
        };

        if advanced {
            self.last_sequence = sequence.or(self.last_sequence);
            self.last_advance = Some(Instant::now());
            return true;
        }

        match self.last_advance {
            Some(last) => last.elapsed() <= self.stall_window,
            None => false,
        }
    }
}

#[async_trait]
impl StreamConnection for HlsConnection {
    async fn open(&mut self) -> Result<()> {
        let manifest = self.fetch_manifest().await?;
        if manifest.segments.is_empty() {
            return Err(AppError::Playback("manifest lists no segments".to_string()));
        }
        self.last_sequence = manifest.media_sequence;
        self.last_advance = Some(Instant::now());
        Ok(())
    }

    async fn close(&mut self) {
        self.last_sequence = None;
        self.last_advance = None;
    }

    async fn is_healthy(&mut self) -> bool {
        match self.fetch_manifest().await {
            Ok(manifest) => self.observe(manifest.media_sequence),
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn manifest(sequence: u64, segments: &[&str]) -> String {
        let mut text = format!(
            "#EXTM3U\n#EXT-X-VERSION:3\n#EXT-X-TARGETDURATION:2\n#EXT-X-MEDIA-SEQUENCE:{sequence}\n"
        );
        for segment in segments {
            text.push_str("#EXTINF:2.000,\n");
            text.push_str(segment);
            text.push('\n');
        }
        text
    }

    #[test]
    fn parses_sequence_and_segments() {
        let parsed = parse_manifest(&manifest(7, &["seg7.ts", "seg8.ts"])).expect("parse");
        assert_eq!(parsed.media_sequence, Some(7));
        assert_eq!(parsed.segments, vec!["seg7.ts", "seg8.ts"]);

        let err = parse_manifest("<html>404</html>").expect_err("not a manifest");
        assert!(matches!(err, AppError::Playback(_)));
    }

    #[test]
    fn frozen_sequence_stalls_after_the_window() {
        let mut conn =
            HlsConnection::with_stall_window("http://127.0.0.1:1/x.m3u8", Duration::ZERO)
                .expect("conn");

        assert!(conn.observe(Some(5)));
        // Sequence advanced: healthy regardless of the window.
        assert!(conn.observe(Some(6)));
        // Frozen with a zero-width window: stalled on the next probe.
        std::thread::sleep(Duration::from_millis(2));
        assert!(!conn.observe(Some(6)));
    }

    #[test]
    fn frozen_sequence_within_window_is_still_healthy() {
        let mut conn = HlsConnection::with_stall_window(
            "http://127.0.0.1:1/x.m3u8",
            Duration::from_secs(60),
        )
        .expect("conn");

        assert!(conn.observe(Some(5)));
        assert!(conn.observe(Some(5)));
        assert!(conn.observe(Some(5)));
    }

    #[tokio::test]
    async fn open_requires_segments() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/hls/cam1/index.m3u8"))
            .respond_with(
                ResponseTemplate::new(200).set_body_string(manifest(3, &["seg3.ts"])),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/hls/cam2/index.m3u8"))
            .respond_with(ResponseTemplate::new(200).set_body_string("#EXTM3U\n"))
            .mount(&server)
            .await;

        let mut conn =
            HlsConnection::new(&format!("{}/hls/cam1/index.m3u8", server.uri())).expect("conn");
        conn.open().await.expect("open");
        assert!(conn.is_healthy().await);

        let mut empty =
            HlsConnection::new(&format!("{}/hls/cam2/index.m3u8", server.uri())).expect("conn");
        assert!(empty.open().await.is_err());
    }

    #[tokio::test]
    async fn fetch_failure_is_unhealthy() {
        let mut conn =
            HlsConnection::new("http://127.0.0.1:9/hls/cam1/index.m3u8").expect("conn");
        assert!(conn.open().await.is_err());
        assert!(!conn.is_healthy().await);
    }
}
