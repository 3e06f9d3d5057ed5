use axum::{
    routing::{delete, get, post},
    Router,
};
use std::sync::Arc;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use super::handlers;
use crate::state::AppState;

/// Create the main application router
pub fn create_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    // Control API: registry mutations and snapshots
    let api_routes = Router::new()
        .route(
            "/streams",
            get(handlers::list_streams).post(handlers::add_stream),
        )
        .route("/streams/:id", delete(handlers::remove_stream))
        .route("/streams/:id/restart", post(handlers::restart_stream))
        .route("/streams/:id/logs", get(handlers::stream_logs));

    // Playback paths proxied to the relay
    let proxy_routes = Router::new()
        .route("/hls/:id/*path", get(handlers::hls_proxy))
        .route("/whep/:id", post(handlers::whep_proxy));

    Router::new()
        .nest("/api", api_routes)
        .merge(proxy_routes)
        .route("/health", get(handlers::health))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
