//! WebRTC/WHEP playback connection
//!
//! Receive-only peer connection established through the proxy's WHEP path:
//! offer out as `application/sdp`, answer back, internal ICE candidates
//! rewritten before the answer is applied. Remote tracks are attached once
//! per track identity; duplicates from renegotiation are ignored.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{watch, Notify};
use url::Url;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_gatherer_state::RTCIceGathererState;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::{RTCRtpTransceiver, RTCRtpTransceiverInit};
use webrtc::track::track_remote::TrackRemote;

use crate::error::{AppError, Result};

use super::connection::StreamConnection;
use super::sdp::rewrite_internal_candidates;

const SIGNALING_TIMEOUT: Duration = Duration::from_secs(10);
const ICE_GATHER_TIMEOUT: Duration = Duration::from_secs(5);
const CONNECT_WAIT: Duration = Duration::from_secs(10);

pub struct WebRtcConnection {
    whep_url: Url,
    bearer: Option<String>,
    http: reqwest::Client,
    peer: Option<Arc<RTCPeerConnection>>,
    state_rx: Option<watch::Receiver<RTCPeerConnectionState>>,
    resource_url: Arc<Mutex<Option<String>>>,
    packets: Arc<AtomicU64>,
}

impl WebRtcConnection {
    /// `whep_url` is the proxy's signaling path for one stream; `bearer` is
    /// the optional stream password sent as an Authorization header.
    pub fn new(whep_url: &str, bearer: Option<String>) -> Result<Self> {
        let whep_url = Url::parse(whep_url)
            .map_err(|e| AppError::WebRtc(format!("invalid WHEP url {whep_url}: {e}")))?;
        let http = reqwest::Client::builder()
            .timeout(SIGNALING_TIMEOUT)
            .build()
            .map_err(|e| AppError::WebRtc(format!("failed to build signaling client: {e}")))?;

        Ok(Self {
            whep_url,
            bearer: bearer.filter(|b| !b.is_empty()),
            http,
            peer: None,
            state_rx: None,
            resource_url: Arc::new(Mutex::new(None)),
            packets: Arc::new(AtomicU64::new(0)),
        })
    }

    pub fn packets(&self) -> u64 {
        self.packets.load(Ordering::Relaxed)
    }

    async fn build_peer(
        &self,
    ) -> Result<(Arc<RTCPeerConnection>, watch::Receiver<RTCPeerConnectionState>)> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| AppError::WebRtc(format!("failed to register codecs: {e}")))?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .map_err(|e| AppError::WebRtc(format!("failed to register interceptors: {e}")))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let peer = Arc::new(
            api.new_peer_connection(RTCConfiguration::default())
                .await
                .map_err(|e| AppError::WebRtc(format!("failed to create peer connection: {e}")))?,
        );

        for kind in [RTPCodecType::Video, RTPCodecType::Audio] {
            peer.add_transceiver_from_kind(
                kind,
                Some(RTCRtpTransceiverInit {
                    direction: RTCRtpTransceiverDirection::Recvonly,
                    send_encodings: vec![],
                }),
            )
            .await
            .map_err(|e| AppError::WebRtc(format!("failed to add {kind:?} transceiver: {e}")))?;
        }

        let (state_tx, state_rx) = watch::channel(RTCPeerConnectionState::New);
        peer.on_peer_connection_state_change(Box::new(move |state| {
            let _ = state_tx.send(state);
            Box::pin(async {})
        }));

        // Accumulate remote tracks once per track identity.
        let seen_tracks: Arc<Mutex<HashSet<String>>> = Arc::new(Mutex::new(HashSet::new()));
        let packets = self.packets.clone();
        peer.on_track(Box::new(move |track: Arc<TrackRemote>,
                                     _receiver: Arc<RTCRtpReceiver>,
                                     _transceiver: Arc<RTCRtpTransceiver>| {
            let seen_tracks = seen_tracks.clone();
            let packets = packets.clone();
            Box::pin(async move {
                let identity = track.id();
                if !seen_tracks.lock().insert(identity.clone()) {
                    tracing::debug!(track = %identity, "Duplicate remote track ignored");
                    return;
                }

                let mime = track.codec().capability.mime_type.clone();
                tracing::info!(track = %identity, mime = %mime, "Remote track attached");

                tokio::spawn(async move {
                    loop {
                        match track.read_rtp().await {
                            Ok((_packet, _attributes)) => {
                                packets.fetch_add(1, Ordering::Relaxed);
                            }
                            Err(e) => {
                                tracing::debug!(track = %identity, "Track read ended: {}", e);
                                break;
                            }
                        }
                    }
                });
            })
        }));

        Ok((peer, state_rx))
    }

    async fn signal(&self, peer: &Arc<RTCPeerConnection>) -> Result<()> {
        // Gather host candidates before sending the offer; WHEP is a single
        // round trip with no trickle.
        let gathered = Arc::new(Notify::new());
        let gathered_tx = gathered.clone();
        peer.on_ice_gathering_state_change(Box::new(move |state| {
            if state == RTCIceGathererState::Complete {
                gathered_tx.notify_one();
            }
            Box::pin(async {})
        }));

        let offer = peer
            .create_offer(None)
            .await
            .map_err(|e| AppError::WebRtc(format!("failed to create offer: {e}")))?;
        peer.set_local_description(offer)
            .await
            .map_err(|e| AppError::WebRtc(format!("failed to set local description: {e}")))?;

        tokio::select! {
            _ = gathered.notified() => {}
            _ = tokio::time::sleep(ICE_GATHER_TIMEOUT) => {}
        }

        let local = peer
            .local_description()
            .await
            .ok_or_else(|| AppError::WebRtc("no local description available".to_string()))?;

        let mut request = self
            .http
            .post(self.whep_url.clone())
            .header(reqwest::header::CONTENT_TYPE, "application/sdp")
            .body(local.sdp);
        if let Some(bearer) = &self.bearer {
            request = request.bearer_auth(bearer);
        }

        let response = request
            .send()
            .await
            .map_err(|e| AppError::WebRtc(format!("WHEP request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(AppError::WebRtc(format!("WHEP endpoint answered {status}")));
        }

        if let Some(location) = response
            .headers()
            .get(reqwest::header::LOCATION)
            .and_then(|v| v.to_str().ok())
        {
            let resolved = self
                .whep_url
                .join(location)
                .map(|u| u.to_string())
                .unwrap_or_else(|_| location.to_string());
            *self.resource_url.lock() = Some(resolved);
        }

        let answer_sdp = response
            .text()
            .await
            .map_err(|e| AppError::WebRtc(format!("failed to read WHEP answer: {e}")))?;

        // The relay may hand out candidates on its own container network;
        // substitute the host this client actually reached.
        let reachable_host = self.whep_url.host_str().unwrap_or("localhost").to_string();
        let answer_sdp = rewrite_internal_candidates(&answer_sdp, &reachable_host);

        let answer = RTCSessionDescription::answer(answer_sdp)
            .map_err(|e| AppError::WebRtc(format!("invalid WHEP answer: {e}")))?;
        peer.set_remote_description(answer)
            .await
            .map_err(|e| AppError::WebRtc(format!("failed to set remote description: {e}")))?;

        Ok(())
    }

    async fn wait_connected(
        &self,
        state_rx: &mut watch::Receiver<RTCPeerConnectionState>,
    ) -> Result<()> {
        tokio::time::timeout(CONNECT_WAIT, async {
            loop {
                let state = *state_rx.borrow();
                match state {
                    RTCPeerConnectionState::Connected => return Ok(()),
                    RTCPeerConnectionState::Failed | RTCPeerConnectionState::Closed => {
                        return Err(AppError::WebRtc(format!("peer connection {state}")))
                    }
                    _ => {}
                }
                if state_rx.changed().await.is_err() {
                    return Err(AppError::WebRtc(
                        "peer connection state channel closed".to_string(),
                    ));
                }
            }
        })
        .await
        .map_err(|_| AppError::WebRtc("timed out waiting for peer connection".to_string()))?
    }
}

#[async_trait]
impl StreamConnection for WebRtcConnection {
    async fn open(&mut self) -> Result<()> {
        self.close().await;

        let (peer, mut state_rx) = self.build_peer().await?;
        self.peer = Some(peer.clone());

        self.signal(&peer).await?;
        self.wait_connected(&mut state_rx).await?;

        self.state_rx = Some(state_rx);
        Ok(())
    }

    async fn close(&mut self) {
        // Release the WHEP session resource first; best effort.
        let resource = self.resource_url.lock().take();
        if let Some(resource) = resource {
            let mut request = self.http.delete(&resource);
            if let Some(bearer) = &self.bearer {
                request = request.bearer_auth(bearer);
            }
            if let Err(e) = request.send().await {
                tracing::debug!("WHEP resource delete failed: {}", e);
            }
        }

        if let Some(peer) = self.peer.take() {
            if let Err(e) = peer.close().await {
                tracing::debug!("Peer connection close failed: {}", e);
            }
        }
        self.state_rx = None;
    }

    async fn is_healthy(&mut self) -> bool {
        match &self.state_rx {
            Some(state_rx) => *state_rx.borrow() == RTCPeerConnectionState::Connected,
            None => false,
        }
    }
}
