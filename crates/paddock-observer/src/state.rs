//! Shared state handed to every handler.

use paddock_core::config::ProxyConfig;
use paddock_core::{LiveFeed, Mode, ModeStatus};
use serde::Serialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Which adapters could run at all with the loaded configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[allow(clippy::struct_excessive_bools)]
pub struct SourceAvailability {
    /// A relay upstream is configured.
    pub relay: bool,
    /// The native timing hub adapter.
    pub signalr: bool,
    /// Broker credentials are configured.
    pub pubsub: bool,
    /// The REST poller.
    pub poller: bool,
    /// Historical replay.
    pub replay: bool,
}

impl SourceAvailability {
    /// Derive availability from configuration alone.
    pub fn from_config(config: &ProxyConfig) -> Self {
        Self {
            relay: config.relay.url().is_some(),
            signalr: true,
            pubsub: config.openf1.credentials().is_some(),
            poller: true,
            replay: true,
        }
    }

    /// Every adapter available.
    pub const fn all() -> Self {
        Self {
            relay: true,
            signalr: true,
            pubsub: true,
            poller: true,
            replay: true,
        }
    }

    /// Availability after the selector has given up on `failed`.
    #[must_use]
    pub fn without(mut self, failed: &[Mode]) -> Self {
        for mode in failed {
            match mode {
                Mode::Relay => self.relay = false,
                Mode::Native => self.signalr = false,
                Mode::PubSub => self.pubsub = false,
                Mode::Poller => self.poller = false,
                Mode::Replay => self.replay = false,
                Mode::Stopped => {}
            }
        }
        self
    }
}

/// Handler state: the feed, the selector's status and the shutdown signal.
#[derive(Debug)]
pub struct AppState {
    /// State document and subscriber hub.
    pub feed: LiveFeed,
    /// Latest status published by the mode selector.
    pub status: watch::Receiver<ModeStatus>,
    /// Configured adapter availability.
    pub sources: SourceAvailability,
    /// Cancelled when the process shuts down; ends open streams.
    pub shutdown: CancellationToken,
}

impl AppState {
    /// Bundle the pieces the handlers need.
    pub const fn new(
        feed: LiveFeed,
        status: watch::Receiver<ModeStatus>,
        sources: SourceAvailability,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            feed,
            status,
            sources,
            shutdown,
        }
    }

    /// Copy of the current selector status.
    pub fn mode_status(&self) -> ModeStatus {
        self.status.borrow().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn availability_follows_configuration() {
        let mut config = ProxyConfig::default();
        config.relay.host = String::new();
        config.openf1.username = None;
        let sources = SourceAvailability::from_config(&config);
        assert!(!sources.relay);
        assert!(!sources.pubsub);
        assert!(sources.signalr && sources.poller && sources.replay);
    }

    #[test]
    fn failed_sources_are_unavailable() {
        let sources = SourceAvailability::all().without(&[Mode::Native, Mode::Poller]);
        assert!(sources.relay);
        assert!(!sources.signalr);
        assert!(!sources.poller);
        assert!(sources.replay);
    }
}
