//! Voice bridge WebSocket route
//!
//! `GET /voice` upgrades to a WebSocket carrying one bridge session.
//!
//! # Protocol
//!
//! Client sends:
//! - Binary frames: raw PCM16 microphone audio
//! - `session.init`, `interrupt`, `commit`, `response.create`, `session.update`
//!
//! Server sends:
//! - `ready` once the upstream session is configured
//! - `transcript.partial` / `transcript.final` for the user's speech
//! - `turn.complete` after each generated response
//! - `error` and `closing`
//! - Every upstream event verbatim, audio deltas with a `seq` counter
//!
//! # Example
//!
//! ```json
//! // Client
//! {"type": "session.init", "sessionId": "kitchen-tablet", "instructions": "Be brief."}
//!
//! // Server
//! {"type": "ready", "sessionId": "sess_0b6c..."}
//! ```

use axum::{Router, routing::get};
use tower_http::trace::TraceLayer;

use crate::handlers::bridge::voice_bridge_handler;
use crate::state::AppState;
use std::sync::Arc;

pub fn create_bridge_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/voice", get(voice_bridge_handler))
        .layer(TraceLayer::new_for_http())
}
