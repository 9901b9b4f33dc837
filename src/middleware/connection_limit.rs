//! Connection caps for the voice WebSocket.
//!
//! A global cap and a per-IP cap are checked before the upgrade. A reserved
//! slot travels to the handler as a [`ClientIp`] extension and is released
//! when the socket ends.
//!
//! ```ignore
//! let app = Router::new()
//!     .route("/voice", get(voice_bridge_handler))
//!     .layer(axum::middleware::from_fn_with_state(
//!         state.clone(),
//!         connection_limit_middleware,
//!     ));
//! ```

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{Request, StatusCode, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tracing::warn;

use crate::state::{AppState, ConnectionLimitError};

/// Client address whose slot the handler must release.
#[derive(Clone, Debug)]
pub struct ClientIp(pub IpAddr);

fn is_websocket_upgrade(request: &Request<Body>) -> bool {
    request
        .headers()
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("websocket"))
}

impl IntoResponse for ConnectionLimitError {
    fn into_response(self) -> Response {
        match self {
            ConnectionLimitError::GlobalLimitReached => (
                StatusCode::SERVICE_UNAVAILABLE,
                "Server at capacity. Please try again later.",
            )
                .into_response(),
            ConnectionLimitError::PerIpLimitReached => (
                StatusCode::TOO_MANY_REQUESTS,
                "Too many connections from your IP address.",
            )
                .into_response(),
        }
    }
}

/// Reserve a connection slot for WebSocket upgrades.
///
/// Global cap exhaustion answers 503, per-IP exhaustion answers 429. Plain
/// HTTP requests pass through unchecked.
pub async fn connection_limit_middleware(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    if !is_websocket_upgrade(&request) {
        return next.run(request).await;
    }

    let client_ip = addr.ip();
    match state.try_acquire_connection(client_ip) {
        Ok(()) => {
            request.extensions_mut().insert(ClientIp(client_ip));
            next.run(request).await
        }
        Err(limit) => {
            warn!(ip = %client_ip, limit = ?limit, "Rejecting WebSocket connection");
            limit.into_response()
        }
    }
}
