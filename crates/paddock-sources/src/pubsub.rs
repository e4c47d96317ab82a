//! Authenticated MQTT client for the `OpenF1` live broker.
//!
//! The broker wants the account username plus a fresh OAuth access token as
//! the password. Every discipline has its own topic; each publish is one
//! record that goes through the [`TimingBoard`]. History from before the
//! first connection is backfilled once over REST.

use std::sync::Arc;
use std::time::Duration;

use paddock_core::Mode;
use paddock_core::config::OpenF1Config;
use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, MqttOptions, Packet, QoS, Transport,
};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::auth::TokenProvider;
use crate::backfill::backfill;
use crate::error::SourceError;
use crate::openf1::{Discipline, OpenF1Client, session_key};
use crate::schedule::sleep_or_cancelled;
use crate::source::{SignalKind, Source, SourceContext, TaskSlot};
use crate::timing::TimingBoard;

const KEEP_ALIVE: Duration = Duration::from_secs(30);
const REQUEST_CAPACITY: usize = 64;
const MAX_PACKET_BYTES: usize = 1_048_576;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Cancelled,
    Refused,
    Dropped,
}

/// Adapter for the `OpenF1` MQTT broker.
pub struct PubSubSource {
    config: OpenF1Config,
    client: reqwest::Client,
    tokens: Option<Arc<TokenProvider>>,
    slot: TaskSlot,
}

impl PubSubSource {
    /// Create a pub/sub adapter. Without `tokens` it refuses to start.
    pub fn new(config: OpenF1Config, client: reqwest::Client, tokens: Option<Arc<TokenProvider>>) -> Self {
        Self {
            config,
            client,
            tokens,
            slot: TaskSlot::default(),
        }
    }
}

impl Source for PubSubSource {
    fn mode(&self) -> Mode {
        Mode::PubSub
    }

    fn start(&mut self, ctx: SourceContext) -> bool {
        let Some(tokens) = self.tokens.clone() else {
            warn!("pub/sub credentials not configured");
            return false;
        };
        let rest = OpenF1Client::new(self.client.clone(), &self.config.api_base).with_tokens(Arc::clone(&tokens));
        info!(host = %self.config.mqtt_host, port = self.config.mqtt_port, "starting pub/sub client");
        let task = run_pubsub(self.config.clone(), tokens, rest, ctx.clone());
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

/// State carried across broker connections.
struct BrokerLoop {
    config: OpenF1Config,
    tokens: Arc<TokenProvider>,
    rest: OpenF1Client,
    ctx: SourceContext,
    board: TimingBoard,
    backfill_started: bool,
}

async fn run_pubsub(config: OpenF1Config, tokens: Arc<TokenProvider>, rest: OpenF1Client, ctx: SourceContext) {
    let mut broker = BrokerLoop {
        config,
        tokens,
        rest,
        ctx,
        board: TimingBoard::new(),
        backfill_started: false,
    };
    broker.run().await;
}

impl BrokerLoop {
    async fn run(&mut self) {
        let delay = Duration::from_millis(self.config.reconnect_delay_ms);
        let mut failures: u32 = 0;
        let mut first_attempt = true;

        loop {
            let token = if first_attempt {
                self.tokens.token().await
            } else {
                self.tokens.refresh().await
            };
            first_attempt = false;

            match token {
                Ok(token) => {
                    let mut connected = false;
                    let result = self.connect_once(token, &mut connected).await;
                    if self.ctx.is_cancelled() {
                        return;
                    }
                    if connected {
                        failures = 0;
                    } else {
                        failures = failures.saturating_add(1);
                    }
                    match result {
                        Ok(Outcome::Cancelled) => return,
                        Ok(Outcome::Refused) => {
                            warn!("broker refused the credentials");
                            self.ctx
                                .signal(SignalKind::Unavailable("broker rejected credentials".to_owned()));
                            return;
                        }
                        Ok(Outcome::Dropped) => info!("broker connection dropped"),
                        Err(e) => warn!(error = %e, failures, "broker connection failed"),
                    }
                }
                Err(e) if e.is_permanent() => {
                    warn!(error = %e, "token endpoint rejected credentials");
                    self.ctx.signal(SignalKind::Unavailable(e.to_string()));
                    return;
                }
                Err(e) => {
                    failures = failures.saturating_add(1);
                    warn!(error = %e, failures, "token acquisition failed");
                }
            }

            if failures > self.config.max_reconnects {
                warn!(failures, "broker reconnect budget exhausted");
                self.ctx.signal(SignalKind::Exhausted);
                return;
            }
            debug!(delay_ms = delay.as_millis(), "broker reconnecting");
            if !sleep_or_cancelled(self.ctx.token(), delay).await {
                return;
            }
        }
    }

    async fn connect_once(&mut self, token: String, connected: &mut bool) -> Result<Outcome, SourceError> {
        let options = broker_options(&self.config, self.tokens.username(), token);
        let (client, mut eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);
        for discipline in Discipline::STREAMED {
            client.subscribe(discipline.topic(), QoS::AtMostOnce).await?;
        }

        loop {
            let event = tokio::select! {
                () = self.ctx.token().cancelled() => {
                    if let Err(e) = client.try_disconnect() {
                        debug!(error = %e, "broker disconnect");
                    }
                    return Ok(Outcome::Cancelled);
                }
                event = eventloop.poll() => event,
            };
            match event {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    *connected = true;
                    info!("broker connected");
                    if !self.backfill_started {
                        self.backfill_started = true;
                        spawn_backfill(self.rest.clone(), &self.ctx);
                    }
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    let Some(discipline) = Discipline::from_topic(&publish.topic) else {
                        debug!(topic = %publish.topic, "ignoring unknown topic");
                        continue;
                    };
                    for record in parse_records(&publish.payload) {
                        self.board.ingest(discipline, &record).write(&self.ctx.feed);
                    }
                }
                Ok(_) => {}
                Err(ConnectionError::ConnectionRefused(
                    ConnectReturnCode::BadUserNamePassword | ConnectReturnCode::NotAuthorized,
                )) => return Ok(Outcome::Refused),
                Err(e) if *connected => {
                    debug!(error = %e, "broker event loop ended");
                    return Ok(Outcome::Dropped);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

fn broker_options(config: &OpenF1Config, username: &str, token: String) -> MqttOptions {
    let client_id = format!("paddock-{}", uuid::Uuid::new_v4().simple());
    let mut options = MqttOptions::new(client_id, config.mqtt_host.clone(), config.mqtt_port);
    options.set_keep_alive(KEEP_ALIVE);
    options.set_credentials(username, token);
    options.set_max_packet_size(MAX_PACKET_BYTES, MAX_PACKET_BYTES);
    if config.mqtt_tls {
        options.set_transport(Transport::tls_with_default_config());
    }
    options
}

fn spawn_backfill(rest: OpenF1Client, ctx: &SourceContext) {
    let feed = ctx.feed.clone();
    tokio::spawn(async move {
        let token = feed.token().clone();
        let work = async {
            match rest.session("latest").await {
                Ok(Some(session)) => {
                    let Some(key) = session_key(&session) else {
                        warn!("latest session has no key; skipping backfill");
                        return;
                    };
                    backfill(&rest, &key, &feed).await;
                }
                Ok(None) => info!("no session to backfill"),
                Err(e) => warn!(error = %e, "session lookup for backfill failed"),
            }
        };
        tokio::select! {
            () = token.cancelled() => {}
            () = work => {}
        }
    });
}

/// Records in one publish: a single object or an array of them.
fn parse_records(payload: &[u8]) -> Vec<Value> {
    match serde_json::from_slice::<Value>(payload) {
        Ok(Value::Array(records)) => records.into_iter().filter(Value::is_object).collect(),
        Ok(record @ Value::Object(_)) => vec![record],
        Ok(_) => Vec::new(),
        Err(e) => {
            debug!(error = %e, "dropping malformed publish");
            Vec::new()
        }
    }
}
