//! Server-sent event stream for dashboards.
//!
//! Clients connect to `GET /api/sse`. The subscription is registered under
//! the document lock, so the first frame is an `initial` event carrying the
//! full document (when there is one) and nothing broadcast afterwards is
//! missed. Keepalives from the hub become `:keepalive` comments.
//!
//! The stream ends when the hub drops the subscriber (slow consumer) or the
//! proxy shuts down. A client that goes away is removed from the hub as
//! soon as its body is dropped.

use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::State;
use axum::response::sse::{Event, Sse};
use futures::stream::{self, Stream, StreamExt};
use paddock_core::LiveFeed;
use paddock_core::hub::{HubFrame, Subscription};
use tracing::debug;
use uuid::Uuid;

use crate::error::ObserverError;
use crate::state::AppState;

/// `GET /api/sse`
///
/// # Errors
///
/// [`ObserverError::Unavailable`] once shutdown has begun.
pub async fn stream_events(
    State(state): State<Arc<AppState>>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ObserverError> {
    if state.shutdown.is_cancelled() {
        return Err(ObserverError::Unavailable("shutting down".to_owned()));
    }

    let subscription = state.feed.subscribe();
    let guard = ClientGuard {
        feed: state.feed.clone(),
        id: subscription.id,
    };
    debug!(subscriber = %subscription.id, "stream client connected");

    let events = stream::unfold((subscription, guard), |(mut subscription, guard)| async move {
        let frame = subscription.recv().await?;
        Some((Ok(to_event(&frame)), (subscription, guard)))
    })
    .take_until(state.shutdown.clone().cancelled_owned());

    Ok(Sse::new(events))
}

fn to_event(frame: &HubFrame) -> Event {
    match frame {
        HubFrame::Event(event) => Event::default().event(event.name).data(event.data.as_str()),
        HubFrame::Heartbeat => Event::default().comment("keepalive"),
    }
}

/// Removes the subscriber when the response body is dropped.
struct ClientGuard {
    feed: LiveFeed,
    id: Uuid,
}

impl Drop for ClientGuard {
    fn drop(&mut self) {
        self.feed.hub().remove(self.id);
        debug!(subscriber = %self.id, "stream client disconnected");
    }
}
