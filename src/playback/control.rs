//! Control-API client
//!
//! The playback side's view of the server: list registered streams and add
//! one speculatively. `add` is the escalation path of the reconnect state
//! machine, so a duplicate registration is success, not an error.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use crate::error::{AppError, Result};
use crate::stream::StreamInfo;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// The camera identifier and the stream id are the same value under this
/// fixed transform; both sides must agree on it, nothing links them
/// otherwise.
pub fn stream_key(camera_id: &str) -> String {
    camera_id
        .trim()
        .to_ascii_lowercase()
        .replace(char::is_whitespace, "-")
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AddStreamBody<'a> {
    id: &'a str,
    rtsp_url: &'a str,
}

/// Outcome of an add call against the control API
#[derive(Debug, PartialEq, Eq)]
pub enum RegisterOutcome {
    Registered,
    AlreadyRegistered,
}

/// HTTP client for the server's control API
#[derive(Clone)]
pub struct ControlApiClient {
    base_url: String,
    http: reqwest::Client,
}

impl ControlApiClient {
    pub fn new(base_url: &str) -> Result<Self> {
        url::Url::parse(base_url)
            .map_err(|e| AppError::Config(format!("invalid control API url {base_url}: {e}")))?;

        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| AppError::Config(format!("failed to build control client: {e}")))?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
        })
    }

    /// Register a stream, tolerating "already exists".
    pub async fn add(&self, id: &str, rtsp_url: &str) -> Result<RegisterOutcome> {
        let url = format!("{}/api/streams", self.base_url);
        let response = self
            .http
            .post(&url)
            .json(&AddStreamBody { id, rtsp_url })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(AppError::Playback(format!(
                "stream registration for {id} failed: {status}"
            )));
        }

        let body: serde_json::Value = response.json().await?;
        if body.get("message").and_then(|m| m.as_str()) == Some("already exists") {
            Ok(RegisterOutcome::AlreadyRegistered)
        } else {
            Ok(RegisterOutcome::Registered)
        }
    }

    /// Snapshot of registered streams.
    pub async fn list(&self) -> Result<Vec<StreamInfo>> {
        let url = format!("{}/api/streams", self.base_url);
        let response = self.http.get(&url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(AppError::Playback(format!("stream list failed: {status}")));
        }
        Ok(response.json().await?)
    }

    pub async fn remove(&self, id: &str) -> Result<()> {
        let url = format!("{}/api/streams/{id}", self.base_url);
        let response = self.http.delete(&url).send().await?;
        let status = response.status();
        if status.as_u16() == 404 {
            return Err(AppError::NotFound(format!("stream {id} is not registered")));
        }
        if !status.is_success() {
            return Err(AppError::Playback(format!(
                "stream removal for {id} failed: {status}"
            )));
        }
        Ok(())
    }
}

/// Escalation hook the reconnect state machine calls on every Kth retry.
#[async_trait]
pub trait Reregister: Send + Sync {
    async fn reregister(&self) -> Result<()>;
}

/// Re-adds one stream with its known source through the control API.
pub struct StreamReregistration {
    client: ControlApiClient,
    id: String,
    rtsp_url: String,
}

impl StreamReregistration {
    pub fn new(client: ControlApiClient, id: impl Into<String>, rtsp_url: impl Into<String>) -> Self {
        Self {
            client,
            id: id.into(),
            rtsp_url: rtsp_url.into(),
        }
    }
}

#[async_trait]
impl Reregister for StreamReregistration {
    async fn reregister(&self) -> Result<()> {
        match self.client.add(&self.id, &self.rtsp_url).await? {
            RegisterOutcome::Registered => {
                tracing::info!(stream = %self.id, "Stream re-registered upstream");
            }
            RegisterOutcome::AlreadyRegistered => {
                tracing::debug!(stream = %self.id, "Stream already registered upstream");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn stream_key_is_a_stable_transform() {
        assert_eq!(stream_key("cam1"), "cam1");
        assert_eq!(stream_key("  Front Door "), "front-door");
        assert_eq!(stream_key("CAM2"), "cam2");
    }

    #[tokio::test]
    async fn add_distinguishes_fresh_and_existing_registration() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/streams"))
            .and(body_json(serde_json::json!({
                "id": "cam1",
                "rtspUrl": "rtsp://u:p@1.2.3.4:554/live",
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "cam1",
                "hlsUrl": "/hls/cam1/index.m3u8",
                "webrtcUrl": "/whep/cam1",
                "status": "Running",
            })))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/streams"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "message": "already exists",
                "id": "cam1",
            })))
            .mount(&server)
            .await;

        let client = ControlApiClient::new(&server.uri()).expect("client");
        let first = client
            .add("cam1", "rtsp://u:p@1.2.3.4:554/live")
            .await
            .expect("first add");
        assert_eq!(first, RegisterOutcome::Registered);

        let second = client
            .add("cam1", "rtsp://u:p@1.2.3.4:554/live")
            .await
            .expect("second add");
        assert_eq!(second, RegisterOutcome::AlreadyRegistered);
    }

    #[tokio::test]
    async fn reregistration_tolerates_already_exists() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/streams"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "message": "already exists",
                "id": "cam1",
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = ControlApiClient::new(&server.uri()).expect("client");
        let reregistration =
            StreamReregistration::new(client, "cam1", "rtsp://u:p@1.2.3.4:554/live");
        reregistration
            .reregister()
            .await
            .expect("duplicate add is success");
    }

    #[tokio::test]
    async fn server_errors_are_surfaced() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/streams"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let client = ControlApiClient::new(&server.uri()).expect("client");
        let err = client
            .add("cam1", "rtsp://example/live")
            .await
            .expect_err("500 from server");
        assert!(matches!(err, AppError::Playback(_)));
    }

    #[tokio::test]
    async fn remove_maps_404_to_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/api/streams/cam1"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let client = ControlApiClient::new(&server.uri()).expect("client");
        let err = client.remove("cam1").await.expect_err("absent stream");
        assert!(matches!(err, AppError::NotFound(_)));
    }
}
