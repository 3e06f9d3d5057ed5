//! HTTP surface: control API and playback proxy routes

pub mod handlers;
pub mod routes;

pub use routes::create_router;
