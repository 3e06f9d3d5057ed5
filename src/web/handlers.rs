use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Path, Query, RawQuery, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};
use crate::state::AppState;
use crate::stream::{AddOutcome, SessionStatus, StreamInfo};

// ============================================================================
// Control API
// ============================================================================

/// Health check response
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub streams: usize,
}

pub async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        streams: state.streams.count().await,
    })
}

pub async fn list_streams(State(state): State<Arc<AppState>>) -> Json<Vec<StreamInfo>> {
    Json(state.streams.list().await)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddStreamRequest {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub rtsp_url: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AddStreamResponse {
    pub id: String,
    pub hls_url: String,
    pub webrtc_url: String,
    pub status: SessionStatus,
}

pub async fn add_stream(
    State(state): State<Arc<AppState>>,
    Json(req): Json<AddStreamRequest>,
) -> Result<Response> {
    match state.streams.add(&req.id, &req.rtsp_url).await? {
        AddOutcome::Added(info) => Ok(Json(AddStreamResponse {
            id: info.id,
            hls_url: info.hls_url,
            webrtc_url: info.webrtc_url,
            status: info.status,
        })
        .into_response()),
        // Duplicate adds are expected from the client re-registration path.
        AddOutcome::AlreadyExists => Ok(Json(serde_json::json!({
            "message": "already exists",
            "id": req.id.trim(),
        }))
        .into_response()),
    }
}

/// Unified success body for mutations without a richer payload
#[derive(Debug, Serialize)]
pub struct ApiMessage {
    pub success: bool,
    pub message: String,
}

pub async fn remove_stream(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<ApiMessage>> {
    state.streams.remove(&id).await?;
    Ok(Json(ApiMessage {
        success: true,
        message: format!("stream {id} removed"),
    }))
}

pub async fn restart_stream(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<AddStreamResponse>> {
    let info = state.streams.restart(&id).await?;
    Ok(Json(AddStreamResponse {
        id: info.id,
        hls_url: info.hls_url,
        webrtc_url: info.webrtc_url,
        status: info.status,
    }))
}

#[derive(Debug, Deserialize)]
pub struct LogsQuery {
    pub lines: Option<usize>,
}

pub async fn stream_logs(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<LogsQuery>,
) -> Result<Json<Vec<String>>> {
    let lines = query.lines.unwrap_or(50);
    Ok(Json(state.streams.logs(&id, lines).await?))
}

// ============================================================================
// Playback proxy
// ============================================================================

pub async fn hls_proxy(
    State(state): State<Arc<AppState>>,
    Path((id, path)): Path<(String, String)>,
    RawQuery(query): RawQuery,
) -> Result<Response> {
    // The id and segment path land verbatim in the relay URL.
    if id.contains("..") || path.split('/').any(|segment| segment == "..") {
        return Err(AppError::BadRequest("invalid stream path".to_string()));
    }

    let proxied = state
        .proxy
        .fetch_hls(&id, &path, query.as_deref())
        .await?;

    let mut builder = Response::builder().status(StatusCode::OK);
    if let Some(content_type) = proxied.content_type {
        builder = builder.header(header::CONTENT_TYPE, content_type);
    }
    builder
        .body(Body::from(proxied.body))
        .map_err(|e| AppError::Internal(format!("failed to build proxy response: {e}")))
}

pub async fn whep_proxy(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
    offer: String,
) -> Result<Response> {
    if id.contains("..") {
        return Err(AppError::BadRequest("invalid stream path".to_string()));
    }

    if let Some(secret) = state.config.server.whep_secret() {
        let authorized = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .map(|v| v == format!("Bearer {secret}"))
            .unwrap_or(false);
        if !authorized {
            return Err(AppError::Unauthorized);
        }
    }

    let answer = state.proxy.forward_whep_offer(&id, offer).await?;

    let status = if answer.resource.is_some() {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    let mut builder = Response::builder().status(status).header(
        header::CONTENT_TYPE,
        answer.content_type.as_deref().unwrap_or("application/sdp"),
    );
    if let Some(resource) = answer.resource {
        builder = builder.header(header::LOCATION, resource);
    }
    builder
        .body(Body::from(answer.sdp))
        .map_err(|e| AppError::Internal(format!("failed to build WHEP response: {e}")))
}
