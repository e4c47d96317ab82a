//! REST polling fallback for when the broker is out of reach.
//!
//! Every cadence each windowed discipline is queried for the last few
//! seconds, and every few cadences the untimed stint list is refetched.
//! Windows overlap on purpose so a record that shows up late on the
//! upstream is still caught; the timing board and message logs make the
//! duplicates harmless.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use paddock_core::config::OpenF1Config;
use paddock_core::format::record_time;
use paddock_core::{GatedFeed, Mode};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::auth::TokenProvider;
use crate::backfill::backfill;
use crate::error::SourceError;
use crate::normalize;
use crate::openf1::{Discipline, OpenF1Client, key_field, latest_per_driver, session_key, sort_by_time};
use crate::schedule::{tick_or_cancelled, ticker};
use crate::source::{SignalKind, Source, SourceContext, TaskSlot};
use crate::timing::TimingBoard;

/// A session whose end is further back than this is not live.
const ENDED_AFTER: Duration = Duration::from_secs(1800);

/// Stints carry no timestamp, so the whole list is refetched every few ticks.
const STINT_REFRESH_TICKS: u32 = 5;

#[derive(Debug, Clone, PartialEq, Eq)]
struct PolledSession {
    key: String,
    end: Option<DateTime<Utc>>,
}

/// Adapter polling the `OpenF1` REST API.
pub struct PollerSource {
    config: OpenF1Config,
    client: reqwest::Client,
    tokens: Option<Arc<TokenProvider>>,
    slot: TaskSlot,
}

impl PollerSource {
    /// Create a poller. `tokens` are sent as bearer auth when present.
    pub fn new(config: OpenF1Config, client: reqwest::Client, tokens: Option<Arc<TokenProvider>>) -> Self {
        Self {
            config,
            client,
            tokens,
            slot: TaskSlot::default(),
        }
    }
}

impl Source for PollerSource {
    fn mode(&self) -> Mode {
        Mode::Poller
    }

    fn start(&mut self, ctx: SourceContext) -> bool {
        let mut rest = OpenF1Client::new(self.client.clone(), &self.config.api_base);
        if let Some(tokens) = &self.tokens {
            rest = rest.with_tokens(Arc::clone(tokens));
        }
        info!(
            api_base = %self.config.api_base,
            interval_ms = self.config.poll_interval_ms,
            "starting REST poller"
        );
        let task = run_poller(self.config.clone(), rest, ctx.clone());
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

async fn run_poller(config: OpenF1Config, rest: OpenF1Client, ctx: SourceContext) {
    let overlap = TimeDelta::from_std(Duration::from_secs(config.overlap_secs)).unwrap_or_default();
    let mut interval = ticker(Duration::from_millis(config.poll_interval_ms));
    let mut board = TimingBoard::new();
    let mut session: Option<PolledSession> = None;
    let mut discovery_failures: u32 = 0;
    let mut ended_reported = false;
    let mut stint_countdown: u32 = 0;

    while tick_or_cancelled(&mut interval, ctx.token()).await {
        let current = match &session {
            Some(current) => current.clone(),
            None => match discover(&rest, &ctx.feed).await {
                Ok(found) => {
                    discovery_failures = 0;
                    backfill(&rest, &found.key, &ctx.feed).await;
                    session = Some(found.clone());
                    found
                }
                Err(e) => {
                    discovery_failures = discovery_failures.saturating_add(1);
                    warn!(error = %e, failures = discovery_failures, "session discovery failed");
                    if discovery_failures > config.max_reconnects {
                        ctx.signal(SignalKind::Exhausted);
                        return;
                    }
                    continue;
                }
            },
        };

        let now = Utc::now();
        if !ended_reported && has_ended(current.end, now) {
            info!(session_key = %current.key, "polled session ended a while ago");
            ctx.signal(SignalKind::NoLiveSession);
            ended_reported = true;
        }

        let from = now.checked_sub_signed(overlap).unwrap_or(now);
        for discipline in Discipline::WINDOWED {
            if ctx.is_cancelled() {
                return;
            }
            poll_discipline(&rest, &mut board, &ctx.feed, discipline, &current.key, from, now).await;
        }

        if stint_countdown == 0 {
            poll_stints(&rest, &mut board, &ctx.feed, &current.key).await;
            stint_countdown = STINT_REFRESH_TICKS;
        }
        stint_countdown = stint_countdown.saturating_sub(1);
    }
}

/// Find the latest session and write its metadata.
async fn discover(rest: &OpenF1Client, feed: &GatedFeed) -> Result<PolledSession, SourceError> {
    let record = rest
        .session("latest")
        .await?
        .ok_or_else(|| SourceError::Protocol("no latest session".to_owned()))?;
    let key = session_key(&record)
        .ok_or_else(|| SourceError::Protocol("latest session has no key".to_owned()))?;

    let meeting = match key_field(&record, "meeting_key") {
        Some(meeting_key) => rest.meeting(&meeting_key).await.unwrap_or_else(|e| {
            warn!(error = %e, "meeting lookup failed");
            None
        }),
        None => None,
    };
    feed.apply(normalize::session_info(&record, meeting.as_ref()));
    info!(session_key = %key, "polling session");
    Ok(PolledSession {
        key,
        end: record_time(&record, "date_end"),
    })
}

fn has_ended(end: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    let grace = TimeDelta::from_std(ENDED_AFTER).unwrap_or_default();
    end.and_then(|end| end.checked_add_signed(grace))
        .is_some_and(|cutoff| cutoff < now)
}

/// Fetch one window and feed it through the board. Failures skip the cycle.
async fn poll_discipline(
    rest: &OpenF1Client,
    board: &mut TimingBoard,
    feed: &GatedFeed,
    discipline: Discipline,
    session_key: &str,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
) {
    let records = match rest.window(discipline, session_key, from, to).await {
        Ok(records) => records,
        Err(e) => {
            warn!(discipline = discipline.endpoint(), error = %e, "poll failed; no new data this cycle");
            return;
        }
    };
    let records = prepare(discipline, records);
    debug!(discipline = discipline.endpoint(), records = records.len(), "polled");
    for record in &records {
        board.ingest(discipline, record).write(feed);
    }
}

/// Fetch every stint of the session. Runs after the lap poll so tyre ages
/// count the laps already seen.
async fn poll_stints(rest: &OpenF1Client, board: &mut TimingBoard, feed: &GatedFeed, session_key: &str) {
    match rest.all(Discipline::Stints, session_key).await {
        Ok(records) => {
            debug!(records = records.len(), "polled stints");
            for record in &records {
                board.ingest(Discipline::Stints, record).write(feed);
            }
        }
        Err(e) => warn!(error = %e, "stint poll failed; tyre data unchanged this cycle"),
    }
}

/// Collapse to the newest record per driver where only that matters,
/// otherwise order by time.
pub fn prepare(discipline: Discipline, mut records: Vec<Value>) -> Vec<Value> {
    match discipline.time_field() {
        Some(field) if discipline.keeps_latest_per_driver() => latest_per_driver(records, field),
        Some(field) => {
            sort_by_time(&mut records, field);
            records
        }
        None => records,
    }
}
