//! Error type for the HTTP boundary.
//!
//! [`ObserverError`] converts into a JSON response of the form
//! `{"error": "...", "status": 404}` through its
//! [`IntoResponse`](axum::response::IntoResponse) implementation.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

/// Errors returned by the HTTP handlers.
#[derive(Debug, thiserror::Error)]
pub enum ObserverError {
    /// The requested resource does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The proxy is shutting down and accepts no new stream clients.
    #[error("unavailable: {0}")]
    Unavailable(String),
}

impl IntoResponse for ObserverError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            Self::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            Self::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg.clone()),
        };

        let body = serde_json::json!({
            "error": message,
            "status": status.as_u16(),
        });

        (status, axum::Json(body)).into_response()
    }
}
