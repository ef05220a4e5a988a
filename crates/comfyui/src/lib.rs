//! ComfyUI WebSocket and REST client library.
//!
//! Provides typed message parsing, the WebSocket connection, HTTP API
//! wrappers, and the per-submission execution loop that feeds ComfyUI's
//! event stream into a [`genq_core::progress::ProgressTracker`].

pub mod api;
pub mod client;
pub mod execution;
pub mod messages;
pub mod translate;
