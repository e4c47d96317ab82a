//! Integration tests for the broker, polling and native hub adapters.
//!
//! The REST side is an axum server; the broker is a bare TCP listener that
//! answers just enough MQTT 3.1.1 (CONNACK, SUBACK, PINGRESP) to get the
//! client subscribed, then pushes canned publishes.

#![allow(
    clippy::unwrap_used,
    clippy::indexing_slicing,
    clippy::arithmetic_side_effects,
    clippy::cast_possible_truncation
)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use axum::Router;
use axum::extract::ws::{Message, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::routing::{get, post};
use paddock_core::config::{OpenF1Config, SignalRConfig};
use paddock_core::{LiveFeed, Mode};
use paddock_sources::auth::TokenProvider;
use paddock_sources::poller::PollerSource;
use paddock_sources::pubsub::PubSubSource;
use paddock_sources::signalr::SignalRSource;
use paddock_sources::source::SourceSignal;
use paddock_sources::{SignalKind, Source, SourceContext};
use serde_json::{Value, json};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const ENDED: &str = "2024-03-02T17:00:00+00:00";

async fn serve(router: Router) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, router).await.unwrap() });
    addr
}

async fn eventually<F>(mut check: F)
where
    F: FnMut() -> bool,
{
    for _ in 0..250 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(check(), "condition not reached in time");
}

async fn next_signal(rx: &mut mpsc::UnboundedReceiver<SourceSignal>) -> SignalKind {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap()
        .kind
}

fn openf1_session(session_end: &'static str) -> Router {
    Router::new()
        .route(
            "/token",
            post(|| async {
                axum::Json(json!({"access_token": "tok", "token_type": "bearer", "expires_in": 3600}))
            }),
        )
        .route(
            "/v1/sessions",
            get(move || async move {
                axum::Json(json!([{
                    "session_key": 9472, "session_name": "Race", "session_type": "Race",
                    "location": "Sakhir", "country_name": "Bahrain",
                    "date_start": "2024-03-02T15:00:00+00:00", "date_end": session_end
                }]))
            }),
        )
        .route(
            "/v1/drivers",
            get(|| async {
                axum::Json(json!([
                    {"driver_number": 1, "name_acronym": "VER", "team_name": "Red Bull Racing"},
                    {"driver_number": 16, "name_acronym": "LEC", "team_name": "Ferrari"},
                    {"driver_number": 44, "name_acronym": "HAM", "team_name": "Mercedes"}
                ]))
            }),
        )
        .route(
            "/v1/race_control",
            get(|| async {
                axum::Json(json!([{
                    "date": "2024-03-02T15:30:00+00:00", "category": "Other",
                    "message": "CAR 16 (LEC) RETIRED", "driver_number": 16
                }]))
            }),
        )
        .route(
            "/v1/position",
            get(|| async {
                axum::Json(json!([
                    {"driver_number": 44, "date": "2024-03-02T15:40:00+00:00", "position": 4},
                    {"driver_number": 44, "date": "2024-03-02T15:40:02+00:00", "position": 3}
                ]))
            }),
        )
        .route(
            "/v1/stints",
            get(|| async {
                axum::Json(json!([{
                    "driver_number": 44, "stint_number": 1, "compound": "SOFT",
                    "lap_start": 1, "lap_end": null, "tyre_age_at_start": 0
                }]))
            }),
        )
        .fallback(|| async { axum::Json(json!([])) })
}

fn openf1_config(addr: SocketAddr) -> OpenF1Config {
    OpenF1Config {
        api_base: format!("http://{addr}/v1"),
        token_url: format!("http://{addr}/token"),
        mqtt_host: "127.0.0.1".to_owned(),
        mqtt_tls: false,
        username: Some("fan@example.org".to_owned()),
        password: Some("pw".to_owned()),
        poll_interval_ms: 20,
        reconnect_delay_ms: 20,
        max_reconnects: 1,
        ..OpenF1Config::default()
    }
}

async fn read_packet(stream: &mut TcpStream) -> Option<(u8, Vec<u8>)> {
    let header = stream.read_u8().await.ok()?;
    let mut remaining: usize = 0;
    let mut shift = 0;
    loop {
        let byte = stream.read_u8().await.ok()?;
        remaining |= usize::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            break;
        }
        shift += 7;
    }
    let mut body = vec![0; remaining];
    stream.read_exact(&mut body).await.ok()?;
    Some((header >> 4, body))
}

fn publish_packet(topic: &str, payload: &Value) -> Vec<u8> {
    let payload = serde_json::to_vec(payload).unwrap();
    let mut remaining = 2 + topic.len() + payload.len();
    let mut packet = vec![0x30];
    loop {
        let mut byte = (remaining % 128) as u8;
        remaining /= 128;
        if remaining > 0 {
            byte |= 0x80;
        }
        packet.push(byte);
        if remaining == 0 {
            break;
        }
    }
    packet.extend_from_slice(&u16::try_from(topic.len()).unwrap().to_be_bytes());
    packet.extend_from_slice(topic.as_bytes());
    packet.extend_from_slice(&payload);
    packet
}

/// Minimal broker. Answers CONNECT with `return_code` and, once accepted,
/// pushes `publishes` and keeps the connection open. Returns the port and
/// a count of accepted TCP connections.
async fn fake_broker(return_code: u8, publishes: Vec<(&'static str, Value)>) -> (u16, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let connections = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&connections);
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            counter.fetch_add(1, Ordering::SeqCst);
            let publishes = publishes.clone();
            tokio::spawn(async move {
                while let Some((kind, body)) = read_packet(&mut stream).await {
                    let reply = match kind {
                        1 => vec![0x20, 0x02, 0x00, return_code],
                        8 => vec![0x90, 0x03, body[0], body[1], 0x00],
                        12 => vec![0xd0, 0x00],
                        14 => return,
                        _ => continue,
                    };
                    if stream.write_all(&reply).await.is_err() {
                        return;
                    }
                    if kind == 1 {
                        if return_code != 0 {
                            return;
                        }
                        for (topic, payload) in &publishes {
                            if stream.write_all(&publish_packet(topic, payload)).await.is_err() {
                                return;
                            }
                        }
                    }
                }
            });
        }
    });
    (port, connections)
}

fn pubsub(config: &OpenF1Config) -> PubSubSource {
    let client = reqwest::Client::new();
    let tokens = TokenProvider::new(
        client.clone(),
        config.token_url.clone(),
        "fan@example.org".to_owned(),
        "pw".to_owned(),
    );
    PubSubSource::new(config.clone(), client, Some(Arc::new(tokens)))
}

#[tokio::test]
async fn broker_backfills_on_first_connack_while_connected() {
    let addr = serve(openf1_session(ENDED)).await;
    let position = json!({"driver_number": 1, "date": "2024-03-02T15:05:00+00:00", "position": 1});
    let (port, connections) = fake_broker(0, vec![("v1/position", position)]).await;
    let config = OpenF1Config {
        mqtt_port: port,
        ..openf1_config(addr)
    };

    let feed = LiveFeed::new();
    let mut source = pubsub(&config);
    let (tx, mut rx) = mpsc::unbounded_channel();
    assert!(source.start(SourceContext::new(feed.gated(CancellationToken::new()), Mode::PubSub, 1, tx)));

    eventually(|| feed.pointer(&["DriverList", "44", "Tla"]) == Some(json!("HAM"))).await;
    eventually(|| feed.pointer(&["TimingData", "Lines", "1", "Position"]) == Some(json!("1"))).await;
    assert_eq!(feed.pointer(&["TimingData", "Lines", "16", "Retired"]), Some(json!(true)));
    let messages = feed.pointer(&["RaceControlMessages", "Messages"]).unwrap();
    assert_eq!(messages[0]["Message"], "CAR 16 (LEC) RETIRED");

    assert!(source.is_running());
    assert_eq!(connections.load(Ordering::SeqCst), 1);
    assert!(rx.try_recv().is_err());

    source.stop();
    assert!(!source.is_running());
}

#[tokio::test]
async fn broker_refusing_credentials_makes_pubsub_unavailable() {
    let addr = serve(openf1_session(ENDED)).await;
    let (port, _connections) = fake_broker(4, Vec::new()).await;
    let config = OpenF1Config {
        mqtt_port: port,
        ..openf1_config(addr)
    };

    let feed = LiveFeed::new();
    let mut source = pubsub(&config);
    let (tx, mut rx) = mpsc::unbounded_channel();
    assert!(source.start(SourceContext::new(feed.gated(CancellationToken::new()), Mode::PubSub, 1, tx)));

    assert!(matches!(next_signal(&mut rx).await, SignalKind::Unavailable(_)));
    assert!(feed.domain("DriverList").is_none());
}

#[tokio::test]
async fn poller_merges_windows_and_stints_then_reports_ended_session() {
    let addr = serve(openf1_session(ENDED)).await;
    let feed = LiveFeed::new();
    let mut source = PollerSource::new(openf1_config(addr), reqwest::Client::new(), None);
    let (tx, mut rx) = mpsc::unbounded_channel();
    assert!(source.start(SourceContext::new(feed.gated(CancellationToken::new()), Mode::Poller, 1, tx)));

    assert_eq!(next_signal(&mut rx).await, SignalKind::NoLiveSession);
    eventually(|| feed.pointer(&["TimingData", "Lines", "44", "Position"]) == Some(json!("3"))).await;
    eventually(|| {
        feed.pointer(&["TimingAppData", "Lines", "44", "Stints", "0", "Compound"]) == Some(json!("SOFT"))
    })
    .await;
    assert_eq!(feed.pointer(&["SessionInfo", "Key"]), Some(json!(9472)));
    assert_eq!(feed.pointer(&["TimingData", "Lines", "16", "Retired"]), Some(json!(true)));

    assert!(source.is_running());
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(rx.try_recv().is_err());
    source.stop();
}

#[tokio::test]
async fn poller_gives_up_after_repeated_discovery_failures() {
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&hits);
    let router = Router::new().route(
        "/v1/sessions",
        get(move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }),
    );
    let addr = serve(router).await;
    let feed = LiveFeed::new();
    let mut source = PollerSource::new(openf1_config(addr), reqwest::Client::new(), None);
    let (tx, mut rx) = mpsc::unbounded_channel();
    assert!(source.start(SourceContext::new(feed.gated(CancellationToken::new()), Mode::Poller, 1, tx)));

    assert_eq!(next_signal(&mut rx).await, SignalKind::Exhausted);
    assert_eq!(hits.load(Ordering::SeqCst), 2);
    eventually(|| !source.is_running()).await;
    assert!(!feed.has_state());
}

#[tokio::test]
async fn native_hub_without_live_session_hands_off_once() {
    let negotiations = Arc::new(AtomicUsize::new(0));
    let sockets = Arc::new(AtomicUsize::new(0));
    let closed = Arc::new(AtomicBool::new(false));

    let negotiated = Arc::clone(&negotiations);
    let opened = Arc::clone(&sockets);
    let socket_closed = Arc::clone(&closed);
    let router = Router::new()
        .route(
            "/signalr/negotiate",
            get(move || {
                let negotiated = Arc::clone(&negotiated);
                async move {
                    negotiated.fetch_add(1, Ordering::SeqCst);
                    axum::Json(json!({"ConnectionToken": "abc", "ProtocolVersion": "1.5"}))
                }
            }),
        )
        .route(
            "/signalr/connect",
            get(move |ws: WebSocketUpgrade| {
                let opened = Arc::clone(&opened);
                let socket_closed = Arc::clone(&socket_closed);
                async move {
                    opened.fetch_add(1, Ordering::SeqCst);
                    ws.on_upgrade(move |mut socket| async move {
                        let _subscribe = socket.recv().await;
                        let reply = json!({
                            "R": {
                                "SessionInfo": {"Name": "Race", "ArchiveStatus": {"Status": "Complete"}},
                                "LapCount": {"CurrentLap": 57, "TotalLaps": 57}
                            },
                            "I": "1"
                        });
                        if socket.send(Message::Text(reply.to_string().into())).await.is_ok() {
                            while let Some(Ok(frame)) = socket.recv().await {
                                if matches!(frame, Message::Close(_)) {
                                    break;
                                }
                            }
                        }
                        socket_closed.store(true, Ordering::SeqCst);
                    })
                }
            }),
        );
    let addr = serve(router).await;

    let config = SignalRConfig {
        base_url: format!("http://{addr}/signalr"),
        reconnect_delay_ms: 20,
        handoff_grace_ms: 300,
        max_reconnects: 3,
        ..SignalRConfig::default()
    };
    let feed = LiveFeed::new();
    let mut source = SignalRSource::new(config, reqwest::Client::new());
    let (tx, mut rx) = mpsc::unbounded_channel();
    assert!(source.start(SourceContext::new(feed.gated(CancellationToken::new()), Mode::Native, 1, tx)));

    assert_eq!(next_signal(&mut rx).await, SignalKind::NoLiveSession);
    assert!(!closed.load(Ordering::SeqCst));
    assert!(!feed.has_state());

    eventually(|| closed.load(Ordering::SeqCst)).await;
    eventually(|| !source.is_running()).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(negotiations.load(Ordering::SeqCst), 1);
    assert_eq!(sockets.load(Ordering::SeqCst), 1);
    assert!(rx.try_recv().is_err());
}
