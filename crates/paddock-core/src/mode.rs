//! Source modes and the status published by the mode selector.

use std::fmt;
use std::str::FromStr;

use serde::Serialize;

/// Which source is feeding the state document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Already-normalized SSE stream from another proxy.
    Relay,
    /// Negotiated websocket to the official timing hub.
    #[serde(rename = "signalr")]
    Native,
    /// Authenticated MQTT topics.
    #[serde(rename = "pubsub")]
    PubSub,
    /// Time-windowed REST polling.
    Poller,
    /// Historical session played back on a virtual clock.
    Replay,
    /// Nothing left to run.
    Stopped,
}

impl Mode {
    /// Modes that have an adapter, in default priority order.
    pub const ADAPTERS: [Self; 5] = [
        Self::Relay,
        Self::Native,
        Self::PubSub,
        Self::Poller,
        Self::Replay,
    ];

    /// Name used in configuration and in the health response.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Relay => "relay",
            Self::Native => "signalr",
            Self::PubSub => "pubsub",
            Self::Poller => "poller",
            Self::Replay => "replay",
            Self::Stopped => "stopped",
        }
    }

    /// Parse a configured mode where `auto` (or empty) means no forced mode.
    ///
    /// # Errors
    ///
    /// Returns [`UnknownMode`] for anything else that is not a mode name.
    pub fn parse_forced(raw: &str) -> Result<Option<Self>, UnknownMode> {
        let trimmed = raw.trim();
        if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("auto") {
            return Ok(None);
        }
        trimmed.parse().map(Some)
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A mode name that is not recognised.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown mode `{0}`")]
pub struct UnknownMode(pub String);

impl FromStr for Mode {
    type Err = UnknownMode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "relay" => Ok(Self::Relay),
            "signalr" | "native" => Ok(Self::Native),
            "pubsub" | "mqtt" => Ok(Self::PubSub),
            "poller" | "rest" => Ok(Self::Poller),
            "replay" => Ok(Self::Replay),
            "stopped" => Ok(Self::Stopped),
            other => Err(UnknownMode(other.to_owned())),
        }
    }
}

/// Snapshot of the mode selector, published on a watch channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModeStatus {
    /// Active mode. `None` before the first activation.
    pub mode: Option<Mode>,
    /// Adapters that failed and will not be retried.
    pub failed: Vec<Mode>,
    /// Mode forced by configuration, if any.
    pub forced: Option<Mode>,
}

impl ModeStatus {
    /// Status before anything has started.
    pub const fn starting(forced: Option<Mode>) -> Self {
        Self {
            mode: None,
            failed: Vec::new(),
            forced,
        }
    }
}
