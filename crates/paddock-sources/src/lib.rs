//! Upstream adapters and the failover mode selector for the Paddock timing
//! proxy.
//!
//! Every adapter implements [`Source`] and writes into the shared feed
//! through the gated handle in its [`SourceContext`]. The [`ModeSelector`]
//! runs one adapter at a time and walks the failover chain when an adapter
//! signals that it cannot continue.
//!
//! # Modules
//!
//! - [`auth`] -- OAuth password-grant tokens for the pub/sub broker.
//! - [`backfill`] -- One-shot roster and message-log history fetch.
//! - [`error`] -- [`SourceError`].
//! - [`eventstream`] -- Incremental `text/event-stream` parser.
//! - [`failover`] -- Failover plan, adapter factory, mode selector.
//! - [`normalize`] -- Record-to-fragment conversions.
//! - [`openf1`] -- REST client and discipline catalogue.
//! - [`poller`] -- REST polling adapter.
//! - [`pubsub`] -- MQTT adapter.
//! - [`relay`] -- Upstream SSE relay adapter.
//! - [`replay`] -- Historical replay adapter.
//! - [`schedule`] -- Cancellable timers and backoff.
//! - [`signalr`] -- Native timing hub adapter.
//! - [`source`] -- The adapter trait and its start context.
//! - [`timing`] -- Per-driver timing memory shared by the record adapters.
//!
//! [`Source`]: source::Source
//! [`SourceContext`]: source::SourceContext
//! [`ModeSelector`]: failover::ModeSelector
//! [`SourceError`]: error::SourceError

pub mod auth;
pub mod backfill;
pub mod error;
pub mod eventstream;
pub mod failover;
pub mod normalize;
pub mod openf1;
pub mod poller;
pub mod pubsub;
pub mod relay;
pub mod replay;
pub mod schedule;
pub mod signalr;
pub mod source;
pub mod timing;

pub use failover::{DefaultFactory, FailoverPlan, ModeSelector, SourceFactory};
pub use source::{SignalKind, Source, SourceContext};
