//! JSON endpoints.
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET` | `/health` | Mode, client count and source availability |
//! | `GET` | `/api/state` | Full state document |
//! | `GET` | `/api/state/{domain}` | One top-level domain |

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use paddock_core::Mode;
use serde::Serialize;
use serde_json::Value;

use crate::error::ObserverError;
use crate::state::{AppState, SourceAvailability};

/// Body of `GET /health`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    /// `starting` before the first activation, `degraded` once every
    /// adapter is exhausted, `ok` otherwise.
    pub status: &'static str,
    /// Active mode.
    pub mode: Option<Mode>,
    /// Connected stream clients.
    pub clients: usize,
    /// Whether the document holds any domain.
    pub has_state: bool,
    /// Mode forced by configuration.
    pub forced: Option<Mode>,
    /// Adapters the selector gave up on.
    pub failed: Vec<Mode>,
    /// Adapters that are configured and have not failed.
    pub sources: SourceAvailability,
}

/// `GET /health`
pub async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let status = state.mode_status();
    let label = match status.mode {
        None => "starting",
        Some(Mode::Stopped) => "degraded",
        Some(_) => "ok",
    };
    Json(HealthResponse {
        status: label,
        mode: status.mode,
        clients: state.feed.client_count(),
        has_state: state.feed.has_state(),
        forced: status.forced,
        sources: state.sources.without(&status.failed),
        failed: status.failed,
    })
}

/// `GET /api/state`
pub async fn get_state(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(state.feed.snapshot())
}

/// `GET /api/state/{domain}`
///
/// # Errors
///
/// [`ObserverError::NotFound`] when the domain has not been written.
pub async fn get_domain(
    State(state): State<Arc<AppState>>,
    Path(domain): Path<String>,
) -> Result<Json<Value>, ObserverError> {
    state
        .feed
        .domain(&domain)
        .map(Json)
        .ok_or_else(|| ObserverError::NotFound(format!("domain `{domain}` has no data")))
}
