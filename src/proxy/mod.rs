//! Reverse proxy to the external relay
//!
//! Rewrites the public path space onto the relay's internal ports and
//! injects the relay credential. Bytes pass through unmodified; the SDP
//! candidate rewrite is a client-side concern. The proxy never retries —
//! retry policy lives entirely in the playback client.

use std::time::Duration;

use bytes::Bytes;
use reqwest::header::CONTENT_TYPE;
use url::Url;

use crate::config::RelayConfig;
use crate::error::{AppError, Result};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Response passed through from the relay
#[derive(Debug)]
pub struct ProxiedBody {
    pub content_type: Option<String>,
    pub body: Bytes,
}

/// Relay's answer to a WHEP offer
#[derive(Debug)]
pub struct WhepAnswer {
    pub sdp: String,
    /// WHEP session resource for later DELETE, when the relay returns one
    pub resource: Option<String>,
    pub content_type: Option<String>,
}

/// Forwards playback requests to the relay's internal ports
pub struct RelayProxy {
    http: reqwest::Client,
    hls_base: String,
    whep_base: String,
    api_user: Option<String>,
    api_pass: Option<String>,
}

impl RelayProxy {
    pub fn new(relay: &RelayConfig) -> Result<Self> {
        for (name, value) in [("hls_url", &relay.hls_url), ("whep_url", &relay.whep_url)] {
            Url::parse(value)
                .map_err(|e| AppError::Config(format!("invalid relay {name} {value}: {e}")))?;
        }

        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| AppError::Config(format!("failed to build relay client: {e}")))?;

        Ok(Self {
            http,
            hls_base: relay.hls_url.trim_end_matches('/').to_string(),
            whep_base: relay.whep_url.trim_end_matches('/').to_string(),
            api_user: relay.api_user.clone(),
            api_pass: relay.api_pass.clone(),
        })
    }

    fn with_credentials(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_user {
            Some(user) => req.basic_auth(user, self.api_pass.as_deref()),
            None => req,
        }
    }

    /// Fetch an HLS manifest or segment for `id`, bytes passed through.
    pub async fn fetch_hls(
        &self,
        id: &str,
        path: &str,
        query: Option<&str>,
    ) -> Result<ProxiedBody> {
        let mut url = format!("{}/{}/{}", self.hls_base, id, path.trim_start_matches('/'));
        if let Some(query) = query {
            url.push('?');
            url.push_str(query);
        }

        let response = self
            .with_credentials(self.http.get(&url))
            .send()
            .await
            .map_err(|e| AppError::ProxyFailure(format!("relay unreachable: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(AppError::ProxyFailure(format!(
                "relay answered {status} for {url}"
            )));
        }

        let content_type = header_string(&response, CONTENT_TYPE.as_str());
        let body = response
            .bytes()
            .await
            .map_err(|e| AppError::ProxyFailure(format!("relay body read failed: {e}")))?;

        Ok(ProxiedBody { content_type, body })
    }

    /// Forward a client SDP offer to the relay's per-stream WHEP endpoint
    /// and return the SDP answer unmodified.
    pub async fn forward_whep_offer(&self, id: &str, offer: String) -> Result<WhepAnswer> {
        let url = format!("{}/{}/whep", self.whep_base, id);

        let response = self
            .with_credentials(
                self.http
                    .post(&url)
                    .header(CONTENT_TYPE, "application/sdp")
                    .body(offer),
            )
            .send()
            .await
            .map_err(|e| AppError::ProxyFailure(format!("relay unreachable: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(AppError::ProxyFailure(format!(
                "relay answered {status} for {url}"
            )));
        }

        let resource = header_string(&response, "location");
        let content_type = header_string(&response, CONTENT_TYPE.as_str());
        let sdp = response
            .text()
            .await
            .map_err(|e| AppError::ProxyFailure(format!("relay body read failed: {e}")))?;

        Ok(WhepAnswer {
            sdp,
            resource,
            content_type,
        })
    }
}

fn header_string(response: &reqwest::Response, name: &str) -> Option<String> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string())
}
