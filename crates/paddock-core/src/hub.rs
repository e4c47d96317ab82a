//! Subscriber fan-out for state changes.
//!
//! Every connected stream client owns a bounded queue. A broadcast
//! serializes the payload once, wraps it in an [`Arc`] and pushes a pointer
//! into every queue. A queue that is closed (client gone) or full (client
//! too slow) gets its subscriber dropped; the rest of the broadcast carries
//! on. A dropped client reconnects and starts over from a fresh snapshot.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

/// Event name carrying a full state document.
pub const EVENT_INITIAL: &str = "initial";

/// Event name carrying a partial update.
pub const EVENT_UPDATE: &str = "update";

/// Default per-subscriber queue depth.
pub const DEFAULT_SUBSCRIBER_BUFFER: usize = 512;

/// A named, already-serialized stream event.
#[derive(Debug, PartialEq, Eq)]
pub struct StreamEvent {
    /// Event name (`initial` or `update`).
    pub name: &'static str,
    /// JSON payload.
    pub data: String,
}

/// One item queued for a subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HubFrame {
    /// A state event shared by every subscriber.
    Event(Arc<StreamEvent>),
    /// Comment-only keepalive.
    Heartbeat,
}

struct SubscriberHandle {
    id: Uuid,
    sender: mpsc::Sender<HubFrame>,
}

/// Receiving end handed to a stream client.
#[derive(Debug)]
pub struct Subscription {
    /// Identifier used in logs and for explicit removal.
    pub id: Uuid,
    receiver: mpsc::Receiver<HubFrame>,
}

impl Subscription {
    /// Wait for the next frame. `None` once the hub dropped this subscriber.
    pub async fn recv(&mut self) -> Option<HubFrame> {
        self.receiver.recv().await
    }

    /// Take a frame if one is already queued.
    pub fn try_recv(&mut self) -> Option<HubFrame> {
        self.receiver.try_recv().ok()
    }

    /// Give up the wrapper and keep the raw receiver.
    pub fn into_receiver(self) -> mpsc::Receiver<HubFrame> {
        self.receiver
    }
}

/// The set of connected subscribers.
pub struct BroadcastHub {
    subscribers: Mutex<Vec<SubscriberHandle>>,
    buffer: usize,
}

impl BroadcastHub {
    /// Create a hub with the default queue depth.
    pub fn new() -> Self {
        Self::with_buffer(DEFAULT_SUBSCRIBER_BUFFER)
    }

    /// Create a hub whose subscriber queues hold `buffer` frames.
    pub fn with_buffer(buffer: usize) -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            buffer: buffer.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<SubscriberHandle>> {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a subscriber. When `snapshot` is a non-empty document it is
    /// queued as the subscriber's first `initial` event.
    pub fn register(&self, snapshot: Option<&Value>) -> Subscription {
        let (sender, receiver) = mpsc::channel(self.buffer);
        let id = Uuid::new_v4();

        if let Some(doc) = snapshot.filter(|doc| !is_empty_document(doc)) {
            match serde_json::to_string(doc) {
                Ok(data) => {
                    let frame = HubFrame::Event(Arc::new(StreamEvent {
                        name: EVENT_INITIAL,
                        data,
                    }));
                    // Fresh queue with capacity >= 1, cannot be full.
                    let _ = sender.try_send(frame);
                }
                Err(e) => warn!(error = %e, "failed to serialize initial snapshot"),
            }
        }

        let mut subscribers = self.lock();
        subscribers.push(SubscriberHandle { id, sender });
        debug!(subscriber = %id, clients = subscribers.len(), "subscriber registered");
        Subscription { id, receiver }
    }

    /// Serialize `payload` once and queue it for every subscriber.
    ///
    /// Returns the number of subscribers that accepted the event.
    pub fn broadcast(&self, name: &'static str, payload: &Value) -> usize {
        let data = match serde_json::to_string(payload) {
            Ok(data) => data,
            Err(e) => {
                warn!(event = name, error = %e, "failed to serialize broadcast payload");
                return 0;
            }
        };
        self.send_all(&HubFrame::Event(Arc::new(StreamEvent { name, data })))
    }

    /// Queue a keepalive for every subscriber, pruning closed ones.
    pub fn heartbeat(&self) -> usize {
        self.send_all(&HubFrame::Heartbeat)
    }

    fn send_all(&self, frame: &HubFrame) -> usize {
        let mut subscribers = self.lock();
        subscribers.retain(|sub| match sub.sender.try_send(frame.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(subscriber = %sub.id, "subscriber queue full, dropping subscriber");
                false
            }
            Err(TrySendError::Closed(_)) => {
                debug!(subscriber = %sub.id, "subscriber disconnected");
                false
            }
        });
        subscribers.len()
    }

    /// Explicitly remove a subscriber. Unknown ids are ignored.
    pub fn remove(&self, id: Uuid) {
        self.lock().retain(|sub| sub.id != id);
    }

    /// Number of subscribers whose connection is still open.
    pub fn client_count(&self) -> usize {
        self.lock()
            .iter()
            .filter(|sub| !sub.sender.is_closed())
            .count()
    }

    /// Send a keepalive every `every` until `token` is cancelled.
    pub async fn run_heartbeat(&self, every: Duration, token: CancellationToken) {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick of an interval fires immediately.
        ticker.tick().await;
        loop {
            tokio::select! {
                () = token.cancelled() => return,
                _ = ticker.tick() => {
                    let clients = self.heartbeat();
                    debug!(clients, "keepalive sent");
                }
            }
        }
    }
}

impl Default for BroadcastHub {
    fn default() -> Self {
        Self::new()
    }
}

fn is_empty_document(doc: &Value) -> bool {
    match doc {
        Value::Object(map) => map.is_empty(),
        Value::Null => true,
        _ => false,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use serde_json::json;

    use super::*;

    fn event(frame: Option<HubFrame>) -> Arc<StreamEvent> {
        match frame {
            Some(HubFrame::Event(ev)) => ev,
            other => panic!("expected event, got {other:?}"),
        }
    }

    #[test]
    fn register_queues_initial_snapshot() {
        let hub = BroadcastHub::new();
        let mut sub = hub.register(Some(&json!({"TrackStatus": {"Status": "1"}})));
        let ev = event(sub.try_recv());
        assert_eq!(ev.name, EVENT_INITIAL);
        assert_eq!(ev.data, r#"{"TrackStatus":{"Status":"1"}}"#);
    }

    #[test]
    fn register_skips_empty_snapshot() {
        let hub = BroadcastHub::new();
        let mut sub = hub.register(Some(&json!({})));
        assert!(sub.try_recv().is_none());
        let mut sub = hub.register(None);
        assert!(sub.try_recv().is_none());
        assert_eq!(hub.client_count(), 2);
    }

    #[test]
    fn broadcast_survives_closed_subscriber() {
        let hub = BroadcastHub::new();
        let mut a = hub.register(None);
        let b = hub.register(None);
        let mut c = hub.register(None);
        drop(b);

        let delivered = hub.broadcast(EVENT_UPDATE, &json!({"LapCount": {"CurrentLap": 5}}));
        assert_eq!(delivered, 2);
        assert_eq!(hub.client_count(), 2);
        assert_eq!(event(a.try_recv()).data, r#"{"LapCount":{"CurrentLap":5}}"#);
        assert_eq!(event(c.try_recv()).name, EVENT_UPDATE);
    }

    #[test]
    fn slow_subscriber_is_dropped_when_queue_fills() {
        let hub = BroadcastHub::with_buffer(2);
        let mut fast = hub.register(None);
        let _slow = hub.register(None);

        for lap in 0..2 {
            hub.broadcast(EVENT_UPDATE, &json!({"LapCount": {"CurrentLap": lap}}));
            assert!(fast.try_recv().is_some());
        }
        let delivered = hub.broadcast(EVENT_UPDATE, &json!({"LapCount": {"CurrentLap": 3}}));
        assert_eq!(delivered, 1);
        assert!(fast.try_recv().is_some());
    }

    #[test]
    fn events_arrive_in_broadcast_order() {
        let hub = BroadcastHub::new();
        let mut sub = hub.register(None);
        for lap in 1..=3 {
            hub.broadcast(EVENT_UPDATE, &json!({"LapCount": {"CurrentLap": lap}}));
        }
        let laps: Vec<String> = (0..3).map(|_| event(sub.try_recv()).data.clone()).collect();
        assert_eq!(
            laps,
            vec![
                r#"{"LapCount":{"CurrentLap":1}}"#,
                r#"{"LapCount":{"CurrentLap":2}}"#,
                r#"{"LapCount":{"CurrentLap":3}}"#,
            ]
        );
    }

    #[test]
    fn heartbeat_prunes_and_reaches_everyone() {
        let hub = BroadcastHub::new();
        let mut a = hub.register(None);
        let b = hub.register(None);
        drop(b);
        assert_eq!(hub.heartbeat(), 1);
        assert_eq!(a.try_recv(), Some(HubFrame::Heartbeat));
    }

    #[test]
    fn remove_unknown_id_is_harmless() {
        let hub = BroadcastHub::new();
        let sub = hub.register(None);
        hub.remove(Uuid::new_v4());
        assert_eq!(hub.client_count(), 1);
        hub.remove(sub.id);
        assert_eq!(hub.client_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_task_ticks_until_cancelled() {
        let hub = Arc::new(BroadcastHub::new());
        let mut sub = hub.register(None);
        let token = CancellationToken::new();
        let task = {
            let hub = Arc::clone(&hub);
            let token = token.clone();
            tokio::spawn(async move { hub.run_heartbeat(Duration::from_secs(15), token).await })
        };

        assert_eq!(sub.recv().await, Some(HubFrame::Heartbeat));
        token.cancel();
        task.await.unwrap();
    }
}
