//! HTTP-FLV playback connection
//!
//! The low-latency legacy path: one long-lived HTTP response carrying an
//! FLV byte stream from the relay egress. The loader validates the
//! container header, then consumes tags on a background task; socket close,
//! EOF or data starvation all degrade the connection.
//!
//! FLV tag structure:
//! ```text
//! +--------+-------------+-----------+-------------+---------+
//! | Type(1)| DataSize(3) | TS(3+1)   | StreamID(3) | Data(N) |
//! +--------+-------------+-----------+-------------+---------+
//! ```
//! followed by a 4-byte PreviousTagSize.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::BytesMut;
use futures::StreamExt;
use tokio::task::JoinHandle;
use url::Url;

use crate::error::{AppError, Result};

use super::connection::StreamConnection;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const OPEN_TIMEOUT: Duration = Duration::from_secs(8);
const DEFAULT_STALL_WINDOW: Duration = Duration::from_secs(6);

/// FLV file header length (signature through data offset)
const FLV_HEADER_LEN: usize = 9;

/// Audio / video / script tag types
const TAG_TYPES: [u8; 3] = [8, 9, 18];

/// Validate the FLV header and return the offset of the first tag,
/// including the leading PreviousTagSize0.
pub fn validate_header(data: &[u8]) -> Result<usize> {
    if data.len() < FLV_HEADER_LEN {
        return Err(AppError::Playback("short FLV header".to_string()));
    }
    if &data[0..3] != b"FLV" {
        return Err(AppError::Playback("missing FLV signature".to_string()));
    }
    if data[3] != 1 {
        return Err(AppError::Playback(format!("unsupported FLV version {}", data[3])));
    }

    let data_offset = u32::from_be_bytes([data[5], data[6], data[7], data[8]]);
    if (data_offset as usize) < FLV_HEADER_LEN {
        return Err(AppError::Playback("invalid FLV data offset".to_string()));
    }

    Ok(data_offset as usize + 4)
}

/// Incremental FLV tag walker. Feeds on arbitrary chunk boundaries and
/// counts complete tags.
pub struct FlvTagWalker {
    buf: BytesMut,
}

impl FlvTagWalker {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(16 * 1024),
        }
    }

    /// Consume a chunk, returning the number of complete tags drained.
    pub fn push(&mut self, chunk: &[u8]) -> u64 {
        self.buf.extend_from_slice(chunk);

        let mut tags = 0;
        loop {
            if self.buf.len() < 11 {
                break;
            }
            let data_size =
                ((self.buf[1] as usize) << 16) | ((self.buf[2] as usize) << 8) | self.buf[3] as usize;
            let total = 11 + data_size + 4;
            if self.buf.len() < total {
                break;
            }

            let tag_type = self.buf[0] & 0x1F;
            if TAG_TYPES.contains(&tag_type) {
                tags += 1;
            }
            let _ = self.buf.split_to(total);
        }
        tags
    }
}

impl Default for FlvTagWalker {
    fn default() -> Self {
        Self::new()
    }
}

struct FlvStats {
    started: Instant,
    last_data_ms: AtomicU64,
    tags: AtomicU64,
    bytes: AtomicU64,
    finished: AtomicBool,
}

impl FlvStats {
    fn new() -> Self {
        Self {
            started: Instant::now(),
            last_data_ms: AtomicU64::new(0),
            tags: AtomicU64::new(0),
            bytes: AtomicU64::new(0),
            finished: AtomicBool::new(false),
        }
    }

    fn record(&self, bytes: usize, tags: u64) {
        self.last_data_ms
            .store(self.started.elapsed().as_millis() as u64, Ordering::Relaxed);
        self.bytes.fetch_add(bytes as u64, Ordering::Relaxed);
        self.tags.fetch_add(tags, Ordering::Relaxed);
    }

    fn idle(&self) -> Duration {
        let last = self.last_data_ms.load(Ordering::Relaxed);
        self.started
            .elapsed()
            .saturating_sub(Duration::from_millis(last))
    }
}

struct Reader {
    task: JoinHandle<()>,
    stats: Arc<FlvStats>,
}

pub struct FlvConnection {
    url: Url,
    http: reqwest::Client,
    stall_window: Duration,
    reader: Option<Reader>,
}

impl FlvConnection {
    /// `url` is the relay's HTTP-FLV egress for one stream.
    pub fn new(url: &str) -> Result<Self> {
        Self::with_stall_window(url, DEFAULT_STALL_WINDOW)
    }

    pub fn with_stall_window(url: &str, stall_window: Duration) -> Result<Self> {
        let url = Url::parse(url)
            .map_err(|e| AppError::Playback(format!("invalid FLV url {url}: {e}")))?;
        // No overall timeout: the response body is a live stream.
        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| AppError::Playback(format!("failed to build FLV client: {e}")))?;

        Ok(Self {
            url,
            http,
            stall_window,
            reader: None,
        })
    }

    pub fn tags(&self) -> u64 {
        self.reader
            .as_ref()
            .map(|r| r.stats.tags.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    async fn open_stream(&mut self) -> Result<()> {
        let response = self.http.get(self.url.clone()).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(AppError::Playback(format!("relay answered {status} for FLV")));
        }

        let mut stream = response.bytes_stream();
        let mut buf = BytesMut::new();
        // The header may arrive fragmented.
        while buf.len() < FLV_HEADER_LEN + 4 {
            match stream.next().await {
                Some(Ok(chunk)) => buf.extend_from_slice(&chunk),
                Some(Err(e)) => {
                    return Err(AppError::Playback(format!("FLV stream read failed: {e}")))
                }
                None => {
                    return Err(AppError::Playback(
                        "stream ended before the FLV header".to_string(),
                    ))
                }
            }
        }

        let first_tag = validate_header(&buf)?;
        // Headers longer than the standard 9 bytes are rare but legal.
        while buf.len() < first_tag {
            match stream.next().await {
                Some(Ok(chunk)) => buf.extend_from_slice(&chunk),
                Some(Err(e)) => {
                    return Err(AppError::Playback(format!("FLV stream read failed: {e}")))
                }
                None => {
                    return Err(AppError::Playback(
                        "stream ended before the FLV header".to_string(),
                    ))
                }
            }
        }
        let mut walker = FlvTagWalker::new();
        let stats = Arc::new(FlvStats::new());
        let leftover_tags = if buf.len() > first_tag {
            walker.push(&buf[first_tag..])
        } else {
            0
        };
        stats.record(buf.len(), leftover_tags);

        let task_stats = stats.clone();
        let task = tokio::spawn(async move {
            while let Some(chunk) = stream.next().await {
                match chunk {
                    Ok(chunk) => {
                        let tags = walker.push(&chunk);
                        task_stats.record(chunk.len(), tags);
                    }
                    Err(e) => {
                        tracing::debug!("FLV stream read error: {}", e);
                        break;
                    }
                }
            }
            task_stats.finished.store(true, Ordering::Relaxed);
        });

        self.reader = Some(Reader { task, stats });
        Ok(())
    }
}

#[async_trait]
impl StreamConnection for FlvConnection {
    async fn open(&mut self) -> Result<()> {
        self.close().await;
        match tokio::time::timeout(OPEN_TIMEOUT, self.open_stream()).await {
            Ok(result) => result,
            Err(_) => Err(AppError::Playback("FLV open timed out".to_string())),
        }
    }

    async fn close(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.task.abort();
        }
    }

    async fn is_healthy(&mut self) -> bool {
        match &self.reader {
            Some(reader) => {
                !reader.stats.finished.load(Ordering::Relaxed)
                    && reader.stats.idle() <= self.stall_window
            }
            None => false,
        }
    }
}
