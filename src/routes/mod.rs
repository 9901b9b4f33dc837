//! Router assembly.

use axum::{Router, middleware};
use http::{HeaderValue, Method, header::CONTENT_TYPE};
use std::sync::Arc;
use tower_governor::{
    GovernorLayer, governor::GovernorConfigBuilder, key_extractor::SmartIpKeyExtractor,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::set_header::SetResponseHeaderLayer;
use tracing::{info, warn};

use crate::middleware::connection_limit_middleware;
use crate::state::AppState;

pub mod api;
pub mod bridge;

/// Rates at or above this disable rate limiting, for load testing
const RATE_LIMIT_DISABLED_AT: u32 = 100_000;

/// Build the complete application: health, the voice WebSocket and the
/// shared security layers.
///
/// Serve it with `into_make_service_with_connect_info::<SocketAddr>()`; the
/// connection limit and rate limit layers need the peer address.
pub fn create_app(state: Arc<AppState>) -> Router {
    let bridge_routes = bridge::create_bridge_router().layer(middleware::from_fn_with_state(
        state.clone(),
        connection_limit_middleware,
    ));

    let requests_per_second = state.config.rate_limit_requests_per_second;
    let burst_size = state.config.rate_limit_burst_size;
    let governor_layer = if requests_per_second >= RATE_LIMIT_DISABLED_AT {
        info!("Rate limiting disabled (rate >= {}/s)", RATE_LIMIT_DISABLED_AT);
        None
    } else {
        let governor_config = GovernorConfigBuilder::default()
            .per_second(requests_per_second as u64)
            .burst_size(burst_size)
            .key_extractor(SmartIpKeyExtractor)
            .finish();
        if governor_config.is_none() {
            warn!(
                requests_per_second,
                burst_size, "Invalid rate limit settings, rate limiting disabled"
            );
        }
        governor_config.map(GovernorLayer::new)
    };
    let cors_layer = cors_layer(state.config.cors_allowed_origins.as_deref());

    let security_headers = tower::ServiceBuilder::new()
        .layer(SetResponseHeaderLayer::overriding(
            http::header::X_CONTENT_TYPE_OPTIONS,
            HeaderValue::from_static("nosniff"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            http::header::X_FRAME_OPTIONS,
            HeaderValue::from_static("DENY"),
        ));

    api::create_api_router()
        .merge(bridge_routes)
        .with_state(state)
        .layer(cors_layer)
        .layer(tower::util::option_layer(governor_layer))
        .layer(security_headers)
}

fn cors_layer(origins: Option<&str>) -> CorsLayer {
    let base = CorsLayer::new()
        .allow_methods([Method::GET, Method::OPTIONS])
        .allow_headers([CONTENT_TYPE]);

    match origins {
        Some("*") => base.allow_origin(Any).allow_credentials(false),
        Some(origins) => {
            let origins: Vec<HeaderValue> = origins
                .split(',')
                .filter_map(|s| s.trim().parse().ok())
                .collect();
            base.allow_origin(origins).allow_credentials(true)
        }
        None => {
            info!(
                "CORS not configured, defaulting to same-origin only. \
                 Set CORS_ALLOWED_ORIGINS to enable cross-origin access."
            );
            base.allow_credentials(false)
        }
    }
}
