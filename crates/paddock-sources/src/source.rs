//! The capability every adapter implements, and what it is handed on start.

use std::future::Future;

use paddock_core::{GatedFeed, Mode};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Why an adapter is asking the selector to move on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalKind {
    /// Reconnect budget used up.
    Exhausted,
    /// The upstream is reachable but no session is running.
    NoLiveSession,
    /// The adapter cannot run for the rest of the process lifetime.
    Unavailable(String),
    /// Required data is missing; nothing can be served.
    Fatal(String),
}

/// A signal tagged with the activation it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceSignal {
    /// Activation counter at the time the adapter was started.
    pub epoch: u64,
    /// Mode of the sending adapter.
    pub mode: Mode,
    /// What happened.
    pub kind: SignalKind,
}

/// Everything an adapter gets when it starts.
#[derive(Debug, Clone)]
pub struct SourceContext {
    /// Write handle that goes quiet once this activation is stopped.
    pub feed: GatedFeed,
    mode: Mode,
    epoch: u64,
    signals: mpsc::UnboundedSender<SourceSignal>,
}

impl SourceContext {
    /// Bundle a gated feed with the selector's signal channel.
    pub const fn new(
        feed: GatedFeed,
        mode: Mode,
        epoch: u64,
        signals: mpsc::UnboundedSender<SourceSignal>,
    ) -> Self {
        Self {
            feed,
            mode,
            epoch,
            signals,
        }
    }

    /// Tell the selector something happened. Dropped silently once stopped.
    pub fn signal(&self, kind: SignalKind) {
        if self.is_cancelled() {
            debug!(mode = %self.mode, ?kind, "suppressing signal from stopped source");
            return;
        }
        info!(mode = %self.mode, epoch = self.epoch, ?kind, "source signalling selector");
        let _ = self.signals.send(SourceSignal {
            epoch: self.epoch,
            mode: self.mode,
            kind,
        });
    }

    /// Cancellation token of this activation.
    pub const fn token(&self) -> &CancellationToken {
        self.feed.token()
    }

    /// `true` once the selector stopped this activation.
    pub fn is_cancelled(&self) -> bool {
        self.token().is_cancelled()
    }

    /// Mode this context was created for.
    pub const fn mode(&self) -> Mode {
        self.mode
    }
}

/// One upstream adapter.
///
/// `start` spawns the adapter's work and returns at once; `false` means the
/// adapter is not configured and never will be in this process.
pub trait Source: Send {
    /// Which mode this adapter serves.
    fn mode(&self) -> Mode;

    /// Begin producing updates into `ctx.feed`.
    fn start(&mut self, ctx: SourceContext) -> bool;

    /// Cancel all pending work. Idempotent.
    fn stop(&mut self);

    /// `true` between a successful start and stop (or the task finishing).
    fn is_running(&self) -> bool;
}

/// Start/stop bookkeeping shared by the adapters.
#[derive(Debug, Default)]
pub struct TaskSlot {
    token: Option<CancellationToken>,
    handle: Option<JoinHandle<()>>,
}

impl TaskSlot {
    /// Run `task` in the background under `ctx`'s token. Any previous task
    /// is stopped first.
    pub fn spawn<F>(&mut self, ctx: &SourceContext, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.stop();
        self.token = Some(ctx.token().clone());
        self.handle = Some(tokio::spawn(task));
    }

    /// Cancel the running task. It finishes on its own at the next await.
    pub fn stop(&mut self) {
        if let Some(token) = self.token.take() {
            token.cancel();
        }
        self.handle = None;
    }

    /// `true` while the token is live and the task has not returned.
    pub fn is_running(&self) -> bool {
        let live = self.token.as_ref().is_some_and(|t| !t.is_cancelled());
        let unfinished = self.handle.as_ref().is_some_and(|h| !h.is_finished());
        live && unfinished
    }
}
