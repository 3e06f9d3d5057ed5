//! camhub - Multi-camera streaming hub
//!
//! This crate registers phone cameras' RTSP feeds with an external relay,
//! supervises the per-camera transcoder subprocesses, proxies HLS/WHEP
//! playback to the relay, and provides the adaptive playback client that
//! recovers broken sessions with bounded, escalating retries.

pub mod config;
pub mod error;
pub mod events;
pub mod playback;
pub mod proxy;
pub mod state;
pub mod stream;
pub mod utils;
pub mod web;

pub use error::{AppError, Result};
