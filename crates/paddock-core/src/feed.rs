//! The shared capability handle over the state document and the hub.
//!
//! Every mutation takes the document lock, merges, and broadcasts the same
//! partial before the lock is released, so subscribers see updates in merge
//! order. Registration snapshots the document under the same lock, which
//! means a new subscriber never misses or double-receives a delta.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::{Map, Value, json};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::hub::{BroadcastHub, EVENT_INITIAL, EVENT_UPDATE, Subscription};
use crate::message_log::{self, LogKind};
use crate::store::{StateDocument, domain};

struct FeedInner {
    doc: Mutex<StateDocument>,
    hub: BroadcastHub,
}

/// Cloneable handle to the process-wide state document.
///
/// All clones point at the same document. [`LiveFeed::clear`] empties the
/// document in place, so handles held by adapters stay valid across source
/// switches.
#[derive(Clone)]
pub struct LiveFeed {
    inner: Arc<FeedInner>,
}

impl LiveFeed {
    /// Create an empty feed with a default hub.
    pub fn new() -> Self {
        Self::with_hub(BroadcastHub::new())
    }

    /// Create an empty feed around an existing hub.
    pub fn with_hub(hub: BroadcastHub) -> Self {
        Self {
            inner: Arc::new(FeedInner {
                doc: Mutex::new(StateDocument::new()),
                hub,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, StateDocument> {
        self.inner
            .doc
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Merge a partial update and broadcast it as an `update` event.
    ///
    /// Returns `false` (and broadcasts nothing) for an empty partial.
    pub fn apply(&self, partial: Map<String, Value>) -> bool {
        self.apply_gated(partial, None)
    }

    fn apply_gated(&self, mut partial: Map<String, Value>, gate: Option<&CancellationToken>) -> bool {
        if partial.is_empty() {
            return false;
        }
        let mut doc = self.lock();
        if is_closed(gate) {
            return false;
        }
        mark_live(&doc, &mut partial);
        doc.merge(&partial);
        self.inner.hub.broadcast(EVENT_UPDATE, &Value::Object(partial));
        true
    }

    /// Replace the whole document and broadcast it as an `initial` event.
    pub fn replace(&self, full: Map<String, Value>) {
        self.replace_gated(full, None);
    }

    fn replace_gated(&self, mut full: Map<String, Value>, gate: Option<&CancellationToken>) -> bool {
        let mut doc = self.lock();
        if is_closed(gate) {
            return false;
        }
        doc.clear();
        mark_live(&doc, &mut full);
        doc.merge(&full);
        self.inner.hub.broadcast(EVENT_INITIAL, &doc.snapshot());
        true
    }

    /// Append entries to a bounded message log.
    ///
    /// Duplicates are skipped. When anything new was added the full
    /// resulting list is merged and broadcast (arrays replace wholesale).
    /// Returns the number of entries added.
    pub fn append_log(&self, kind: LogKind, entries: Vec<Value>) -> usize {
        self.append_log_gated(kind, entries, None)
    }

    fn append_log_gated(
        &self,
        kind: LogKind,
        entries: Vec<Value>,
        gate: Option<&CancellationToken>,
    ) -> usize {
        if entries.is_empty() {
            return 0;
        }
        let mut doc = self.lock();
        if is_closed(gate) {
            return 0;
        }
        let existing = doc
            .pointer(&[kind.domain(), kind.list_field()])
            .map(message_log::collect_entries)
            .unwrap_or_default();
        let (list, added) = message_log::append(kind, &existing, entries);
        if added == 0 {
            return 0;
        }

        let mut partial = Map::new();
        partial.insert(
            kind.domain().to_owned(),
            json!({ kind.list_field(): list }),
        );
        mark_live(&doc, &mut partial);
        doc.merge(&partial);
        self.inner.hub.broadcast(EVENT_UPDATE, &Value::Object(partial));
        debug!(log = kind.domain(), added, "message log extended");
        added
    }

    /// Remove every domain from the document.
    ///
    /// When anything was removed, subscribers get an empty `initial` event
    /// so they drop what they were showing.
    pub fn clear(&self) {
        let mut doc = self.lock();
        self.clear_locked(&mut doc);
    }

    fn clear_locked(&self, doc: &mut StateDocument) {
        if doc.is_empty() {
            return;
        }
        doc.clear();
        self.inner.hub.broadcast(EVENT_INITIAL, &doc.snapshot());
    }

    /// Point-in-time copy of the whole document.
    pub fn snapshot(&self) -> Value {
        self.lock().snapshot()
    }

    /// Copy of one top-level domain, if present.
    pub fn domain(&self, key: &str) -> Option<Value> {
        self.lock().get(key).cloned()
    }

    /// Copy of a nested value, if present.
    pub fn pointer(&self, path: &[&str]) -> Option<Value> {
        self.lock().pointer(path).cloned()
    }

    /// `true` once any domain has been written since the last clear.
    pub fn has_state(&self) -> bool {
        !self.lock().is_empty()
    }

    /// Register a subscriber, queueing the current snapshot atomically.
    pub fn subscribe(&self) -> Subscription {
        let doc = self.lock();
        let snapshot = doc.snapshot();
        self.inner.hub.register(Some(&snapshot))
    }

    /// Number of connected subscribers.
    pub fn client_count(&self) -> usize {
        self.inner.hub.client_count()
    }

    /// The hub behind this feed.
    pub fn hub(&self) -> &BroadcastHub {
        &self.inner.hub
    }

    /// A write handle that goes quiet once `token` is cancelled.
    pub fn gated(&self, token: CancellationToken) -> GatedFeed {
        GatedFeed {
            feed: self.clone(),
            token,
        }
    }
}

/// Write handle held by one source.
///
/// The cancellation check happens under the document lock, so once the
/// token is cancelled and a following [`LiveFeed::clear`] has returned, no
/// write from this handle can land in the document.
#[derive(Clone, Debug)]
pub struct GatedFeed {
    feed: LiveFeed,
    token: CancellationToken,
}

impl GatedFeed {
    /// Gated [`LiveFeed::apply`].
    pub fn apply(&self, partial: Map<String, Value>) -> bool {
        self.feed.apply_gated(partial, Some(&self.token))
    }

    /// Gated [`LiveFeed::replace`]. Returns `false` when the write was dropped.
    pub fn replace(&self, full: Map<String, Value>) -> bool {
        self.feed.replace_gated(full, Some(&self.token))
    }

    /// Gated [`LiveFeed::append_log`].
    pub fn append_log(&self, kind: LogKind, entries: Vec<Value>) -> usize {
        self.feed.append_log_gated(kind, entries, Some(&self.token))
    }

    /// Clear the document unless this handle was already cancelled.
    pub fn clear(&self) -> bool {
        let mut doc = self.feed.lock();
        if self.token.is_cancelled() {
            return false;
        }
        self.feed.clear_locked(&mut doc);
        true
    }

    /// Copy of a nested value, if present.
    pub fn pointer(&self, path: &[&str]) -> Option<Value> {
        self.feed.pointer(path)
    }

    /// `false` once the owning source was stopped.
    pub fn is_open(&self) -> bool {
        !self.token.is_cancelled()
    }

    /// The token gating this handle.
    pub const fn token(&self) -> &CancellationToken {
        &self.token
    }
}

fn is_closed(gate: Option<&CancellationToken>) -> bool {
    gate.is_some_and(CancellationToken::is_cancelled)
}

impl Default for LiveFeed {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for LiveFeed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveFeed")
            .field("clients", &self.client_count())
            .finish_non_exhaustive()
    }
}

/// Add `SessionInfo.isLive = true` to the partial the first time data lands.
fn mark_live(doc: &StateDocument, partial: &mut Map<String, Value>) {
    let already = doc
        .pointer(&[domain::SESSION_INFO, "isLive"])
        .and_then(Value::as_bool)
        .unwrap_or(false);
    if already {
        return;
    }
    match partial.get_mut(domain::SESSION_INFO) {
        Some(Value::Object(info)) => {
            info.insert("isLive".to_owned(), Value::Bool(true));
        }
        Some(_) => {}
        None => {
            partial.insert(domain::SESSION_INFO.to_owned(), json!({"isLive": true}));
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use crate::hub::HubFrame;

    fn object(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }

    fn next_event(sub: &mut Subscription) -> (&'static str, Value) {
        match sub.try_recv() {
            Some(HubFrame::Event(ev)) => (ev.name, serde_json::from_str(&ev.data).unwrap()),
            other => panic!("expected event, got {other:?}"),
        }
    }

    #[test]
    fn first_write_marks_session_live() {
        let feed = LiveFeed::new();
        assert!(!feed.has_state());
        feed.apply(object(json!({"LapCount": {"CurrentLap": 1}})));
        assert_eq!(feed.pointer(&["SessionInfo", "isLive"]), Some(json!(true)));
    }

    #[test]
    fn empty_partial_is_not_broadcast() {
        let feed = LiveFeed::new();
        let mut sub = feed.subscribe();
        assert!(!feed.apply(Map::new()));
        assert!(sub.try_recv().is_none());
    }

    #[test]
    fn subscriber_sees_snapshot_then_deltas_in_order() {
        let feed = LiveFeed::new();
        feed.apply(object(json!({"TrackStatus": {"Status": "1", "Message": "AllClear"}})));

        let mut sub = feed.subscribe();
        let (name, initial) = next_event(&mut sub);
        assert_eq!(name, EVENT_INITIAL);
        assert_eq!(initial["TrackStatus"]["Status"], "1");

        feed.apply(object(json!({"TrackStatus": {"Status": "2", "Message": "Yellow"}})));
        feed.apply(object(json!({"LapCount": {"CurrentLap": 4}})));
        let (name, first) = next_event(&mut sub);
        assert_eq!(name, EVENT_UPDATE);
        assert_eq!(first, json!({"TrackStatus": {"Status": "2", "Message": "Yellow"}}));
        let (_, second) = next_event(&mut sub);
        assert_eq!(second, json!({"LapCount": {"CurrentLap": 4}}));
    }

    #[test]
    fn replace_broadcasts_full_document() {
        let feed = LiveFeed::new();
        feed.apply(object(json!({"WeatherData": {"AirTemp": "20"}})));
        let mut sub = feed.subscribe();
        let _ = next_event(&mut sub);

        feed.replace(object(json!({"LapCount": {"CurrentLap": 9}})));
        let (name, doc) = next_event(&mut sub);
        assert_eq!(name, EVENT_INITIAL);
        assert!(doc.get("WeatherData").is_none());
        assert_eq!(doc["LapCount"]["CurrentLap"], 9);
        assert_eq!(doc["SessionInfo"]["isLive"], true);
    }

    #[test]
    fn append_log_dedups_and_broadcasts_whole_list() {
        let feed = LiveFeed::new();
        let msg = json!({"Utc": "2024-03-02T15:00:00Z", "Message": "GREEN LIGHT - PIT EXIT OPEN"});
        assert_eq!(feed.append_log(LogKind::RaceControl, vec![msg.clone()]), 1);

        let mut sub = feed.subscribe();
        let _ = next_event(&mut sub);
        assert_eq!(feed.append_log(LogKind::RaceControl, vec![msg]), 0);
        assert!(sub.try_recv().is_none());

        let other = json!({"Utc": "2024-03-02T15:01:00Z", "Message": "DRS ENABLED"});
        assert_eq!(feed.append_log(LogKind::RaceControl, vec![other]), 1);
        let (_, partial) = next_event(&mut sub);
        assert_eq!(
            partial["RaceControlMessages"]["Messages"].as_array().map(Vec::len),
            Some(2)
        );
    }

    #[test]
    fn cancelled_gate_drops_writes() {
        let feed = LiveFeed::new();
        let token = CancellationToken::new();
        let gated = feed.gated(token.clone());
        assert!(gated.apply(object(json!({"LapCount": {"CurrentLap": 1}}))));

        token.cancel();
        feed.clear();
        assert!(!gated.apply(object(json!({"LapCount": {"CurrentLap": 2}}))));
        assert!(!gated.replace(object(json!({"LapCount": {"CurrentLap": 3}}))));
        assert_eq!(
            gated.append_log(LogKind::TeamRadio, vec![json!({"Path": "a.mp3"})]),
            0
        );
        assert!(!gated.clear());
        assert!(!feed.has_state());
    }

    #[test]
    fn clear_keeps_handles_working() {
        let feed = LiveFeed::new();
        let adapter_handle = feed.clone();
        adapter_handle.apply(object(json!({"WeatherData": {"AirTemp": "20"}})));
        feed.clear();
        assert!(!feed.has_state());
        adapter_handle.apply(object(json!({"WeatherData": {"TrackTemp": "31"}})));
        assert_eq!(feed.domain("WeatherData"), Some(json!({"TrackTemp": "31"})));
    }

    #[test]
    fn clear_tells_subscribers_to_drop_state() {
        let feed = LiveFeed::new();
        feed.apply(object(json!({"LapCount": {"CurrentLap": 12}})));
        let mut sub = feed.subscribe();
        let _ = next_event(&mut sub);

        feed.clear();
        let (name, doc) = next_event(&mut sub);
        assert_eq!(name, EVENT_INITIAL);
        assert_eq!(doc, json!({}));

        feed.clear();
        assert!(sub.try_recv().is_none());
    }
}
