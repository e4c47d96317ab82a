//! Error types for the source adapters.

use paddock_core::clock::ClockError;

use crate::auth::AuthError;

/// Errors raised while talking to an upstream.
///
/// None of these escape an adapter's task: they are logged and fed into the
/// adapter's reconnect policy, which decides whether to signal the mode
/// selector.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    /// The HTTP request could not be sent or its body not read.
    #[error("HTTP error: {0}")]
    Http(String),

    /// The upstream answered with a non-success status.
    #[error("upstream returned {status} for {url}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Requested URL.
        url: String,
    },

    /// Websocket handshake or transport failure.
    #[error("websocket error: {0}")]
    WebSocket(String),

    /// MQTT connection failure.
    #[error("MQTT error: {0}")]
    Mqtt(String),

    /// The upstream spoke something other than the expected protocol.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Token acquisition failed.
    #[error("authentication error: {0}")]
    Auth(#[from] AuthError),

    /// The stream ended without an error.
    #[error("stream closed by upstream")]
    Closed,

    /// Replay clock failure.
    #[error("clock error: {0}")]
    Clock(#[from] ClockError),

    /// Serialization or deserialization failure.
    #[error("serde error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl From<reqwest::Error> for SourceError {
    fn from(e: reqwest::Error) -> Self {
        Self::Http(e.to_string())
    }
}

impl From<url::ParseError> for SourceError {
    fn from(e: url::ParseError) -> Self {
        Self::Protocol(format!("invalid URL: {e}"))
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for SourceError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::WebSocket(e.to_string())
    }
}

impl From<rumqttc::ClientError> for SourceError {
    fn from(e: rumqttc::ClientError) -> Self {
        Self::Mqtt(e.to_string())
    }
}

impl From<rumqttc::ConnectionError> for SourceError {
    fn from(e: rumqttc::ConnectionError) -> Self {
        Self::Mqtt(e.to_string())
    }
}
