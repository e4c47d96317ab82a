//! Native live-timing hub client (classic SignalR over a websocket).
//!
//! Connection is two steps: `GET /negotiate` hands out a connection token and
//! a session cookie, then `/connect` upgrades to a websocket carrying both.
//! One subscribe frame names the topics. The hub answers with a full
//! snapshot in `R`, followed by incremental `feed` invocations in `M`.
//!
//! When the snapshot shows no session is running, the client signals the
//! selector and holds the socket open until it is stopped or the grace
//! period runs out. It never reconnects after that.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use paddock_core::config::SignalRConfig;
use paddock_core::message_log::{LogKind, collect_entries};
use paddock_core::{GatedFeed, Mode, domain};
use reqwest::header::{SET_COOKIE, USER_AGENT};
use serde::Deserialize;
use serde_json::{Map, Value, json};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderValue, header};
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{debug, info, warn};
use url::Url;

use crate::error::SourceError;
use crate::schedule::sleep_or_cancelled;
use crate::source::{SignalKind, Source, SourceContext, TaskSlot};

const HUB_NAME: &str = "Streaming";
const CLIENT_PROTOCOL: &str = "1.5";
const CLIENT_AGENT: &str = "BestHTTP";
const HEARTBEAT_TOPIC: &str = "Heartbeat";

/// One decoded hub message.
#[derive(Debug, Clone, PartialEq)]
pub enum HubMessage {
    /// Full snapshot answering the subscribe call.
    Initial(Map<String, Value>),
    /// Incremental update for one topic.
    Feed {
        /// Topic name, e.g. `TimingData`.
        topic: String,
        /// Partial payload.
        data: Value,
    },
}

#[derive(Debug, Deserialize)]
struct NegotiateResponse {
    #[serde(rename = "ConnectionToken")]
    connection_token: String,
}

#[derive(Debug)]
struct Negotiated {
    token: String,
    cookie: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Cancelled,
    NotLive,
    Closed,
}

/// Adapter for the native timing hub.
pub struct SignalRSource {
    config: SignalRConfig,
    client: reqwest::Client,
    slot: TaskSlot,
}

impl SignalRSource {
    /// Create a native adapter. Nothing connects until [`Source::start`].
    pub fn new(config: SignalRConfig, client: reqwest::Client) -> Self {
        Self {
            config,
            client,
            slot: TaskSlot::default(),
        }
    }
}

impl Source for SignalRSource {
    fn mode(&self) -> Mode {
        Mode::Native
    }

    fn start(&mut self, ctx: SourceContext) -> bool {
        if Url::parse(&self.config.base_url).is_err() {
            warn!(base_url = %self.config.base_url, "native hub URL is invalid");
            return false;
        }
        info!(base_url = %self.config.base_url, "starting native hub client");
        let task = run_native(self.client.clone(), self.config.clone(), ctx.clone());
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

async fn run_native(client: reqwest::Client, config: SignalRConfig, ctx: SourceContext) {
    let delay = Duration::from_millis(config.reconnect_delay_ms);
    let mut failures: u32 = 0;
    loop {
        let mut live = false;
        let result = connect_once(&client, &config, &ctx, &mut live).await;
        if ctx.is_cancelled() {
            return;
        }
        match result {
            Ok(Outcome::Cancelled | Outcome::NotLive) => return,
            Ok(Outcome::Closed) => info!("native hub closed the connection"),
            Err(e) => warn!(error = %e, "native hub connection failed"),
        }
        if live {
            failures = 0;
        } else {
            failures = failures.saturating_add(1);
        }
        if failures > config.max_reconnects {
            warn!(failures, "native hub reconnect budget exhausted");
            ctx.signal(SignalKind::Exhausted);
            return;
        }
        debug!(delay_ms = delay.as_millis(), failures, "native hub reconnecting");
        if !sleep_or_cancelled(ctx.token(), delay).await {
            return;
        }
    }
}

async fn connect_once(
    client: &reqwest::Client,
    config: &SignalRConfig,
    ctx: &SourceContext,
    live: &mut bool,
) -> Result<Outcome, SourceError> {
    let negotiated = tokio::select! {
        () = ctx.token().cancelled() => return Ok(Outcome::Cancelled),
        result = negotiate(client, &config.base_url) => result?,
    };

    let url = connect_url(&config.base_url, &negotiated.token)?;
    let mut request = url.as_str().into_client_request()?;
    request
        .headers_mut()
        .insert(header::USER_AGENT, HeaderValue::from_static(CLIENT_AGENT));
    if let Some(cookie) = &negotiated.cookie {
        let value = HeaderValue::from_str(cookie)
            .map_err(|e| SourceError::Protocol(format!("unusable session cookie: {e}")))?;
        request.headers_mut().insert(header::COOKIE, value);
    }

    let (stream, _) = tokio::select! {
        () = ctx.token().cancelled() => return Ok(Outcome::Cancelled),
        result = connect_async(request) => result?,
    };
    info!("native hub connected");
    let (mut write, mut read) = stream.split();
    write
        .send(Message::Text(subscribe_frame(&config.topics).into()))
        .await?;

    let grace = Duration::from_millis(config.handoff_grace_ms);
    loop {
        let message = tokio::select! {
            () = ctx.token().cancelled() => {
                if let Err(e) = write.close().await {
                    debug!(error = %e, "closing native socket");
                }
                return Ok(Outcome::Cancelled);
            }
            message = read.next() => message,
        };
        let text = match message {
            Some(Ok(Message::Text(text))) => text,
            Some(Ok(Message::Close(_))) | None => return Ok(Outcome::Closed),
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(e.into()),
        };
        let decoded = match decode_frame(text.as_str()) {
            Ok(decoded) => decoded,
            Err(e) => {
                debug!(error = %e, "dropping malformed hub frame");
                continue;
            }
        };
        for hub_message in decoded {
            match hub_message {
                HubMessage::Initial(snapshot) => {
                    if !is_live_session(&snapshot) {
                        info!("native hub reports no live session");
                        ctx.signal(SignalKind::NoLiveSession);
                        sleep_or_cancelled(ctx.token(), grace).await;
                        if let Err(e) = write.close().await {
                            debug!(error = %e, "closing native socket");
                        }
                        return Ok(Outcome::NotLive);
                    }
                    *live = true;
                    write_snapshot(&ctx.feed, snapshot);
                }
                HubMessage::Feed { topic, data } => write_topic(&ctx.feed, &topic, data),
            }
        }
    }
}

async fn negotiate(client: &reqwest::Client, base_url: &str) -> Result<Negotiated, SourceError> {
    let mut url = Url::parse(&format!("{}/negotiate", base_url.trim_end_matches('/')))?;
    url.query_pairs_mut()
        .append_pair("connectionData", &connection_data())
        .append_pair("clientProtocol", CLIENT_PROTOCOL);

    let response = client
        .get(url.clone())
        .header(USER_AGENT, CLIENT_AGENT)
        .send()
        .await?;
    let status = response.status();
    if !status.is_success() {
        return Err(SourceError::Status {
            status: status.as_u16(),
            url: url.to_string(),
        });
    }

    let cookies: Vec<&str> = response
        .headers()
        .get_all(SET_COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .filter_map(|value| value.split(';').next())
        .map(str::trim)
        .filter(|pair| !pair.is_empty())
        .collect();
    let cookie = (!cookies.is_empty()).then(|| cookies.join("; "));

    let body: NegotiateResponse = response.json().await?;
    debug!(has_cookie = cookie.is_some(), "negotiated native hub connection");
    Ok(Negotiated {
        token: body.connection_token,
        cookie,
    })
}

fn connection_data() -> String {
    json!([{ "name": HUB_NAME }]).to_string()
}

/// Websocket URL for `/connect` with the negotiated token.
pub fn connect_url(base_url: &str, connection_token: &str) -> Result<Url, SourceError> {
    let mut url = Url::parse(&format!("{}/connect", base_url.trim_end_matches('/')))?;
    let scheme = match url.scheme() {
        "https" | "wss" => "wss",
        "http" | "ws" => "ws",
        other => {
            return Err(SourceError::Protocol(format!(
                "unsupported hub scheme {other}"
            )));
        }
    };
    url.set_scheme(scheme)
        .map_err(|()| SourceError::Protocol(format!("cannot switch scheme to {scheme}")))?;
    url.query_pairs_mut()
        .append_pair("clientProtocol", CLIENT_PROTOCOL)
        .append_pair("transport", "webSockets")
        .append_pair("connectionToken", connection_token)
        .append_pair("connectionData", &connection_data());
    Ok(url)
}

/// The one subscribe invocation. Compressed `.z` topics are left out.
pub fn subscribe_frame(topics: &[String]) -> String {
    let topics: Vec<&str> = topics
        .iter()
        .map(String::as_str)
        .filter(|t| !t.ends_with(".z"))
        .collect();
    json!({"H": HUB_NAME, "M": "Subscribe", "A": [topics], "I": 1}).to_string()
}

/// Split one websocket text frame into hub messages.
///
/// Keepalive frames (`{}`) decode to nothing. Invocations other than `feed`
/// and malformed invocation entries are skipped.
pub fn decode_frame(text: &str) -> Result<Vec<HubMessage>, SourceError> {
    let frame: Value = serde_json::from_str(text)?;
    let mut messages = Vec::new();
    if let Some(Value::Object(snapshot)) = frame.get("R") {
        messages.push(HubMessage::Initial(snapshot.clone()));
    }
    if let Some(Value::Array(invocations)) = frame.get("M") {
        for invocation in invocations {
            if invocation.get("M").and_then(Value::as_str) != Some("feed") {
                continue;
            }
            let Some(Value::Array(args)) = invocation.get("A") else {
                continue;
            };
            let (Some(topic), Some(data)) = (args.first().and_then(Value::as_str), args.get(1)) else {
                continue;
            };
            messages.push(HubMessage::Feed {
                topic: topic.to_owned(),
                data: data.clone(),
            });
        }
    }
    Ok(messages)
}

/// `false` when the snapshot shows no session, an archived one, or one that
/// has finished.
pub fn is_live_session(snapshot: &Map<String, Value>) -> bool {
    let Some(info) = snapshot.get(domain::SESSION_INFO).and_then(Value::as_object) else {
        return false;
    };
    if info.is_empty() {
        return false;
    }
    let archived = info
        .get("ArchiveStatus")
        .and_then(|a| a.get("Status"))
        .and_then(Value::as_str)
        == Some("Complete");
    let finished = matches!(
        snapshot
            .get(domain::SESSION_STATUS)
            .and_then(|s| s.get("Status"))
            .and_then(Value::as_str),
        Some("Finalised" | "Ends")
    );
    !archived && !finished
}

const fn log_topic(topic: &str) -> Option<LogKind> {
    match topic.as_bytes() {
        b"RaceControlMessages" => Some(LogKind::RaceControl),
        b"TeamRadio" => Some(LogKind::TeamRadio),
        _ => None,
    }
}

fn ignored_topic(topic: &str) -> bool {
    topic == HEARTBEAT_TOPIC || topic.ends_with(".z")
}

fn log_entries(kind: LogKind, data: &Value) -> Vec<Value> {
    data.get(kind.list_field()).map(collect_entries).unwrap_or_default()
}

fn write_snapshot(feed: &GatedFeed, mut snapshot: Map<String, Value>) {
    snapshot.retain(|topic, _| !ignored_topic(topic));
    let logs: Vec<(LogKind, Value)> = [LogKind::RaceControl, LogKind::TeamRadio]
        .into_iter()
        .filter_map(|kind| snapshot.remove(kind.domain()).map(|data| (kind, data)))
        .collect();
    let topics = snapshot.len();
    if !feed.replace(snapshot) {
        return;
    }
    for (kind, data) in logs {
        feed.append_log(kind, log_entries(kind, &data));
    }
    info!(topics, "native snapshot applied");
}

fn write_topic(feed: &GatedFeed, topic: &str, data: Value) {
    if ignored_topic(topic) {
        return;
    }
    if let Some(kind) = log_topic(topic) {
        feed.append_log(kind, log_entries(kind, &data));
        return;
    }
    let mut partial = Map::new();
    partial.insert(topic.to_owned(), data);
    feed.apply(partial);
}
