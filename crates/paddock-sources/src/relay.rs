//! Primary-feed relay: follow another proxy's event stream.
//!
//! The upstream already speaks this proxy's own format, so the relay only
//! has to reframe: the first event of every connection replaces the state
//! document, everything after merges into it.

use std::time::Duration;

use futures::StreamExt;
use paddock_core::Mode;
use paddock_core::config::RelayConfig;
use reqwest::header::ACCEPT;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::SourceError;
use crate::eventstream::{EventStreamParser, SseEvent};
use crate::schedule::{Backoff, sleep_or_cancelled};
use crate::source::{SignalKind, Source, SourceContext, TaskSlot};

/// Adapter following an upstream SSE stream.
pub struct RelaySource {
    config: RelayConfig,
    client: reqwest::Client,
    slot: TaskSlot,
}

impl RelaySource {
    /// Create a relay adapter. Nothing connects until [`Source::start`].
    pub fn new(config: RelayConfig, client: reqwest::Client) -> Self {
        Self {
            config,
            client,
            slot: TaskSlot::default(),
        }
    }
}

impl Source for RelaySource {
    fn mode(&self) -> Mode {
        Mode::Relay
    }

    fn start(&mut self, ctx: SourceContext) -> bool {
        let Some(url) = self.config.url() else {
            warn!("relay host not configured");
            return false;
        };
        let backoff = Backoff::new(
            Duration::from_millis(self.config.backoff_step_ms),
            self.config.max_attempts,
        );
        info!(url = %url, "starting relay");
        let task = run_relay(self.client.clone(), url, backoff, ctx.clone());
        self.slot.spawn(&ctx, task);
        true
    }

    fn stop(&mut self) {
        self.slot.stop();
    }

    fn is_running(&self) -> bool {
        self.slot.is_running()
    }
}

async fn run_relay(client: reqwest::Client, url: String, mut backoff: Backoff, ctx: SourceContext) {
    loop {
        let mut delivered: usize = 0;
        let result = stream_once(&client, &url, &ctx, &mut delivered).await;
        if ctx.is_cancelled() {
            return;
        }
        if delivered > 0 {
            backoff.reset();
        }
        match result {
            Ok(()) | Err(SourceError::Closed) => info!(delivered, "relay stream ended"),
            Err(e) => warn!(error = %e, attempt = backoff.attempts(), "relay connection failed"),
        }

        let Some(delay) = backoff.next_delay() else {
            warn!(attempts = backoff.attempts(), "relay reconnect budget exhausted");
            ctx.signal(SignalKind::Exhausted);
            return;
        };
        debug!(delay_ms = delay.as_millis(), "relay reconnecting");
        if !sleep_or_cancelled(ctx.token(), delay).await {
            return;
        }
    }
}

async fn stream_once(
    client: &reqwest::Client,
    url: &str,
    ctx: &SourceContext,
    delivered: &mut usize,
) -> Result<(), SourceError> {
    let response = tokio::select! {
        () = ctx.token().cancelled() => return Ok(()),
        response = client.get(url).header(ACCEPT, "text/event-stream").send() => response?,
    };
    let status = response.status();
    if !status.is_success() {
        return Err(SourceError::Status {
            status: status.as_u16(),
            url: url.to_owned(),
        });
    }
    info!(url, "relay connected");

    let mut parser = EventStreamParser::default();
    let mut body = response.bytes_stream();
    loop {
        let chunk = tokio::select! {
            () = ctx.token().cancelled() => return Ok(()),
            chunk = body.next() => chunk,
        };
        match chunk {
            Some(Ok(bytes)) => {
                for event in parser.feed(&bytes) {
                    if forward_event(ctx, &event, *delivered == 0) {
                        *delivered = delivered.saturating_add(1);
                    }
                }
            }
            Some(Err(e)) => return Err(e.into()),
            None => return Err(SourceError::Closed),
        }
    }
}

/// Push one relayed event into the feed. Returns `false` for a malformed one.
fn forward_event(ctx: &SourceContext, event: &SseEvent, first: bool) -> bool {
    let Ok(Value::Object(payload)) = serde_json::from_str::<Value>(&event.data) else {
        debug!(event = ?event.event, "dropping malformed relay event");
        return false;
    };
    if first || event.event.as_deref() == Some("initial") {
        ctx.feed.replace(payload);
    } else {
        ctx.feed.apply(payload);
    }
    true
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use paddock_core::LiveFeed;
    use serde_json::json;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    use super::*;

    fn event(name: &str, data: &str) -> SseEvent {
        SseEvent {
            event: Some(name.to_owned()),
            data: data.to_owned(),
        }
    }

    #[test]
    fn first_event_replaces_then_merges() {
        let feed = LiveFeed::new();
        feed.apply(json!({"WeatherData": {"AirTemp": "20"}}).as_object().cloned().unwrap());
        let (tx, _rx) = mpsc::unbounded_channel();
        let ctx = SourceContext::new(feed.gated(CancellationToken::new()), Mode::Relay, 1, tx);

        assert!(forward_event(&ctx, &event("update", r#"{"LapCount":{"CurrentLap":2}}"#), true));
        assert!(feed.domain("WeatherData").is_none());

        assert!(forward_event(&ctx, &event("update", r#"{"LapCount":{"TotalLaps":57}}"#), false));
        assert_eq!(
            feed.domain("LapCount"),
            Some(json!({"CurrentLap": 2, "TotalLaps": 57}))
        );

        assert!(!forward_event(&ctx, &event("update", "not json"), false));
        assert!(!forward_event(&ctx, &event("update", "[1,2]"), false));
    }

    #[test]
    fn unconfigured_host_refuses_to_start() {
        let mut relay = RelaySource::new(RelayConfig::default(), reqwest::Client::new());
        let (tx, _rx) = mpsc::unbounded_channel();
        let ctx = SourceContext::new(LiveFeed::new().gated(CancellationToken::new()), Mode::Relay, 1, tx);
        assert!(!relay.start(ctx));
        assert!(!relay.is_running());
    }
}
