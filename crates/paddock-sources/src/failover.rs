//! The mode selector: which adapter feeds the document, and what comes next.
//!
//! Exactly one adapter runs at a time. Adapters report trouble over a
//! signal channel; each signal carries the epoch of the activation that sent
//! it, so a late signal from an adapter that was already replaced is ignored.
//!
//! The walk only goes forward. An adapter that failed is never tried again,
//! replay is the last stop, and a fatal replay leaves the selector in
//! [`Mode::Stopped`] with an empty document.

use std::sync::Arc;

use paddock_core::config::{ConfigError, ProxyConfig};
use paddock_core::{LiveFeed, Mode, ModeStatus};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::auth::TokenProvider;
use crate::poller::PollerSource;
use crate::pubsub::PubSubSource;
use crate::relay::RelaySource;
use crate::replay::ReplaySource;
use crate::signalr::SignalRSource;
use crate::source::{SignalKind, Source, SourceContext, SourceSignal};

/// The order adapters are tried in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailoverPlan {
    chain: Vec<Mode>,
    forced: Option<Mode>,
}

impl FailoverPlan {
    /// Plan from an automatic `chain` and an optional forced mode.
    pub const fn new(chain: Vec<Mode>, forced: Option<Mode>) -> Self {
        Self { chain, forced }
    }

    /// Plan from configuration.
    pub fn from_config(config: &ProxyConfig) -> Result<Self, ConfigError> {
        Ok(Self::new(config.chain_modes()?, config.forced_mode()?))
    }

    /// Mode forced by configuration.
    pub const fn forced(&self) -> Option<Mode> {
        self.forced
    }

    /// Every mode in try order, always ending with replay.
    pub fn order(&self) -> Vec<Mode> {
        let mut order: Vec<Mode> = match self.forced {
            Some(Mode::Replay) => Vec::new(),
            Some(Mode::Stopped) => return Vec::new(),
            Some(mode) => vec![mode],
            None => self
                .chain
                .iter()
                .copied()
                .filter(|m| !matches!(m, Mode::Replay | Mode::Stopped))
                .collect(),
        };
        order.push(Mode::Replay);
        order
    }
}

/// Builds a fresh adapter for a mode.
pub trait SourceFactory: Send + Sync {
    /// `None` when the mode has no adapter.
    fn build(&self, mode: Mode) -> Option<Box<dyn Source>>;
}

/// Factory wiring the real adapters from configuration.
pub struct DefaultFactory {
    config: ProxyConfig,
    client: reqwest::Client,
    tokens: Option<Arc<TokenProvider>>,
}

impl DefaultFactory {
    /// Factory sharing one HTTP client (and one token cache) across adapters.
    pub fn new(config: ProxyConfig, client: reqwest::Client) -> Self {
        let tokens = config.openf1.credentials().map(|(user, pass)| {
            Arc::new(TokenProvider::new(
                client.clone(),
                config.openf1.token_url.clone(),
                user.to_owned(),
                pass.to_owned(),
            ))
        });
        Self {
            config,
            client,
            tokens,
        }
    }
}

impl SourceFactory for DefaultFactory {
    fn build(&self, mode: Mode) -> Option<Box<dyn Source>> {
        let client = self.client.clone();
        let source: Box<dyn Source> = match mode {
            Mode::Relay => Box::new(RelaySource::new(self.config.relay.clone(), client)),
            Mode::Native => Box::new(SignalRSource::new(self.config.signalr.clone(), client)),
            Mode::PubSub => Box::new(PubSubSource::new(self.config.openf1.clone(), client, self.tokens.clone())),
            Mode::Poller => Box::new(PollerSource::new(self.config.openf1.clone(), client, self.tokens.clone())),
            Mode::Replay => Box::new(ReplaySource::new(self.config.replay.clone(), client)),
            Mode::Stopped => return None,
        };
        Some(source)
    }
}

/// Owns the active adapter and reacts to its signals.
pub struct ModeSelector {
    order: Vec<Mode>,
    forced: Option<Mode>,
    factory: Box<dyn SourceFactory>,
    feed: LiveFeed,
    status: watch::Sender<ModeStatus>,
    epoch: u64,
    mode: Option<Mode>,
    failed: Vec<Mode>,
    active: Option<Box<dyn Source>>,
    tx: mpsc::UnboundedSender<SourceSignal>,
    rx: mpsc::UnboundedReceiver<SourceSignal>,
}

impl ModeSelector {
    /// Selector for `plan`, writing into `feed`.
    pub fn new(plan: &FailoverPlan, factory: Box<dyn SourceFactory>, feed: LiveFeed) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (status, _) = watch::channel(ModeStatus::starting(plan.forced()));
        Self {
            order: plan.order(),
            forced: plan.forced(),
            factory,
            feed,
            status,
            epoch: 0,
            mode: None,
            failed: Vec::new(),
            active: None,
            tx,
            rx,
        }
    }

    /// Watch the selector's status.
    pub fn subscribe(&self) -> watch::Receiver<ModeStatus> {
        self.status.subscribe()
    }

    /// Start the first adapter and follow signals until `shutdown` fires.
    pub async fn run(mut self, shutdown: CancellationToken) {
        self.advance();
        loop {
            let signal = tokio::select! {
                () = shutdown.cancelled() => break,
                signal = self.rx.recv() => signal,
            };
            match signal {
                Some(signal) => self.handle(signal),
                None => break,
            }
        }
        self.stop_active();
        info!("mode selector stopped");
    }

    fn handle(&mut self, signal: SourceSignal) {
        let Some(mode) = self.mode else {
            return;
        };
        if signal.epoch != self.epoch || signal.mode != mode {
            debug!(
                from = %signal.mode,
                epoch = signal.epoch,
                current = self.epoch,
                "ignoring signal from replaced source"
            );
            return;
        }
        match signal.kind {
            SignalKind::NoLiveSession => {
                if mode == Mode::Replay {
                    return;
                }
                if mode == Mode::Native || self.forced.is_none() {
                    info!(from = %mode, "no live session; switching to replay");
                    if !self.activate(Mode::Replay) {
                        self.enter_stopped("replay could not start");
                    }
                } else {
                    debug!(mode = %mode, "forced mode keeps running without a live session");
                }
            }
            SignalKind::Exhausted | SignalKind::Unavailable(_) => {
                warn!(mode = %mode, kind = ?signal.kind, "source failed; moving on");
                self.mark_failed(mode);
                self.advance();
            }
            SignalKind::Fatal(reason) => {
                if mode == Mode::Replay {
                    warn!(%reason, "replay failed fatally");
                    self.mark_failed(mode);
                    self.enter_stopped(&reason);
                } else {
                    warn!(mode = %mode, %reason, "source failed fatally; moving on");
                    self.mark_failed(mode);
                    self.advance();
                }
            }
        }
    }

    /// Activate the next mode that has not failed, ending in Stopped.
    fn advance(&mut self) {
        loop {
            let next = self
                .order
                .iter()
                .copied()
                .find(|m| !self.failed.contains(m) && Some(*m) != self.mode);
            let Some(next) = next else {
                self.enter_stopped("no sources left");
                return;
            };
            if self.activate(next) {
                return;
            }
            self.mark_failed(next);
        }
    }

    /// Stop whatever runs, then start `mode`. `false` when it would not start.
    fn activate(&mut self, mode: Mode) -> bool {
        let previous = self.stop_active();
        if previous == Some(Mode::Replay) || mode == Mode::Replay {
            self.feed.clear();
        }
        self.epoch = self.epoch.saturating_add(1);
        self.mode = Some(mode);

        let Some(mut source) = self.factory.build(mode) else {
            return false;
        };
        let token = CancellationToken::new();
        let ctx = SourceContext::new(self.feed.gated(token.clone()), mode, self.epoch, self.tx.clone());
        if !source.start(ctx) {
            token.cancel();
            warn!(mode = %mode, "source is not configured");
            return false;
        }
        info!(mode = %mode, epoch = self.epoch, "source active");
        self.active = Some(source);
        self.publish();
        true
    }

    fn enter_stopped(&mut self, reason: &str) {
        self.stop_active();
        self.feed.clear();
        self.epoch = self.epoch.saturating_add(1);
        self.mode = Some(Mode::Stopped);
        warn!(%reason, "no source left to run");
        self.publish();
    }

    fn stop_active(&mut self) -> Option<Mode> {
        if let Some(mut source) = self.active.take() {
            source.stop();
        }
        self.mode.filter(|m| *m != Mode::Stopped)
    }

    fn mark_failed(&mut self, mode: Mode) {
        if !self.failed.contains(&mode) {
            self.failed.push(mode);
        }
    }

    fn publish(&self) {
        self.status.send_replace(ModeStatus {
            mode: self.mode,
            failed: self.failed.clone(),
            forced: self.forced,
        });
    }
}
