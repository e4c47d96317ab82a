//! State document, broadcast hub, and shared helpers for the Paddock
//! timing proxy.
//!
//! Sources write normalized partial updates into one [`LiveFeed`]; the feed
//! merges them into the state document and fans the same partial out to
//! every stream subscriber.
//!
//! # Modules
//!
//! - [`clock`] -- Virtual race clock used by historical replay.
//! - [`config`] -- Configuration loading from `paddock.yaml` plus
//!   environment overrides.
//! - [`feed`] -- [`LiveFeed`], the cloneable state handle, and the
//!   per-source [`GatedFeed`] write handle.
//! - [`format`] -- Lap/sector/gap formatting, timestamps, track status derivation.
//! - [`hub`] -- Subscriber fan-out with per-subscriber bounded queues.
//! - [`merge`] -- Deep merge of partial updates.
//! - [`message_log`] -- Bounded, deduplicated race-control and radio logs.
//! - [`mode`] -- Source modes and the selector's published status.
//! - [`store`] -- The unsynchronized state document and domain keys.
//!
//! [`LiveFeed`]: feed::LiveFeed
//! [`GatedFeed`]: feed::GatedFeed

pub mod clock;
pub mod config;
pub mod feed;
pub mod format;
pub mod hub;
pub mod merge;
pub mod message_log;
pub mod mode;
pub mod store;

pub use feed::{GatedFeed, LiveFeed};
pub use mode::{Mode, ModeStatus};
pub use store::domain;
