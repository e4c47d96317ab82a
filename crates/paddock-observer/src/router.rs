//! Axum router for the proxy.
//!
//! CORS allows any origin so browser dashboards on other hosts can
//! subscribe directly.

use std::sync::Arc;

use axum::Router;
use axum::routing::get;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::handlers;
use crate::sse;
use crate::state::AppState;

/// Build the router:
///
/// - `GET /health`
/// - `GET /api/sse`
/// - `GET /api/state`
/// - `GET /api/state/{domain}`
pub fn build_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handlers::health))
        .route("/api/sse", get(sse::stream_events))
        .route("/api/state", get(handlers::get_state))
        .route("/api/state/{domain}", get(handlers::get_domain))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
