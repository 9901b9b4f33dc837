//! HTTP and WebSocket request handlers
//!
//! - `api` - Health check endpoint
//! - `bridge` - Voice bridge WebSocket

pub mod api;
pub mod bridge;

pub use bridge::voice_bridge_handler;
