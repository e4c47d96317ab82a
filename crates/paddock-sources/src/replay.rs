//! Historical session replay, the fallback of last resort.
//!
//! Replay plays a finished session back through the same timing board the
//! live record sources use, driven by a [`RaceClock`]. Setup fetches the
//! session, roster and starting grid once; after that every tick asks the
//! archive only for the slice of race time that just elapsed.
//!
//! Each windowed discipline keeps its own cursor. A cursor moves only after
//! its fetch succeeded, so a failed fetch is retried as part of the next,
//! wider window and no range is ever fetched twice.
//!
//! Laps are indexed by their start time but only become known when they
//! finish, so fetched laps wait until `date_start + lap_duration` has passed
//! on the race clock.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use paddock_core::clock::RaceClock;
use paddock_core::config::ReplayConfig;
use paddock_core::format::{TrackStatus, countdown, record_time, utc_stamp};
use paddock_core::merge::merge_map;
use paddock_core::{GatedFeed, Mode, domain};
use serde_json::{Map, Value, json};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::SourceError;
use crate::normalize::{self, driver_key, fragment};
use crate::openf1::{Discipline, OpenF1Client, key_field};
use crate::poller::prepare;
use crate::schedule::{sleep_or_cancelled, tick_or_cancelled, ticker};
use crate::source::{SignalKind, Source, SourceContext, TaskSlot};
use crate::timing::TimingBoard;

const SETUP_RETRY_DELAY: Duration = Duration::from_secs(2);

/// Everything fetched once before playback starts.
#[derive(Debug, Clone)]
struct ReplaySession {
    key: String,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    anchor: DateTime<Utc>,
    opening: Map<String, Value>,
    grid: Vec<Value>,
    stints: Vec<Value>,
}

/// Adapter replaying an archived session.
pub struct ReplaySource {
    config: ReplayConfig,
    client: reqwest::Client,
    slot: TaskSlot,
}

impl ReplaySource {
    /// Create a replay adapter.
    pub fn new(config: ReplayConfig, client: reqwest::Client) -> Self {
        Self {
            config,
            client,
            slot: TaskSlot::default(),
        }
    }
}

impl Source for ReplaySource {
    fn mode(&self) -> Mode {
        Mode::Replay
    }

    fn start(&mut self, ctx: SourceContext) -> bool {
        let rest = OpenF1Client::new(self.client.clone(), &self.config.api_base);
        info!(
            session_key = %self.config.session_key,
            speed = self.config.speed,
            "starting replay"
        );
        let task = run_replay(self.config.clone(), rest, ctx.clone());
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

async fn run_replay(config: ReplayConfig, rest: OpenF1Client, ctx: SourceContext) {
    loop {
        let Some(session) = setup_with_retries(&config, &rest, &ctx).await else {
            return;
        };
        if !play(&config, &rest, &ctx, session).await {
            return;
        }
        if !config.loop_at_end {
            info!("replay finished; holding final state");
            return;
        }
        info!(delay_secs = config.restart_delay_secs, "replay finished; restarting");
        if !sleep_or_cancelled(ctx.token(), Duration::from_secs(config.restart_delay_secs)).await {
            return;
        }
        if !ctx.feed.clear() {
            return;
        }
    }
}

async fn setup_with_retries(
    config: &ReplayConfig,
    rest: &OpenF1Client,
    ctx: &SourceContext,
) -> Option<ReplaySession> {
    let attempts = config.setup_attempts.max(1);
    let mut attempt: u32 = 0;
    loop {
        attempt = attempt.saturating_add(1);
        match fetch_session(config, rest).await {
            Ok(session) => return Some(session),
            Err(e) if attempt >= attempts => {
                warn!(error = %e, attempt, "replay setup failed for good");
                ctx.signal(SignalKind::Fatal(format!(
                    "session {} unavailable: {e}",
                    config.session_key
                )));
                return None;
            }
            Err(e) => warn!(error = %e, attempt, "replay setup failed; retrying"),
        }
        if !sleep_or_cancelled(ctx.token(), SETUP_RETRY_DELAY).await {
            return None;
        }
    }
}

async fn fetch_session(config: &ReplayConfig, rest: &OpenF1Client) -> Result<ReplaySession, SourceError> {
    let key = config.session_key.as_str();
    let session = rest
        .session(key)
        .await?
        .ok_or_else(|| SourceError::Protocol(format!("session {key} not found")))?;
    let start = record_time(&session, "date_start")
        .ok_or_else(|| SourceError::Protocol("session has no date_start".to_owned()))?;
    let end = record_time(&session, "date_end")
        .ok_or_else(|| SourceError::Protocol("session has no date_end".to_owned()))?;

    let meeting = match key_field(&session, "meeting_key") {
        Some(meeting_key) => rest.meeting(&meeting_key).await.unwrap_or_else(|e| {
            warn!(error = %e, "meeting lookup failed");
            None
        }),
        None => None,
    };
    let drivers = rest.all(Discipline::Drivers, key).await?;
    let positions = rest.all(Discipline::Position, key).await?;
    let stints = rest.all(Discipline::Stints, key).await.unwrap_or_else(|e| {
        warn!(error = %e, "stint lookup failed; tyres will be missing");
        Vec::new()
    });

    let grid = starting_grid(&positions);
    let skip = TimeDelta::from_std(Duration::from_secs(config.formation_skip_secs)).unwrap_or_default();
    let first_report = positions.iter().filter_map(|p| record_time(p, "date")).min();
    let anchor = first_report
        .unwrap_or(start)
        .checked_add_signed(skip)
        .unwrap_or(start)
        .min(end);

    let mut opening = normalize::session_info(&session, meeting.as_ref());
    opening.extend(normalize::driver_list(&drivers));
    opening.extend(fragment(domain::SESSION_STATUS, json!({"Status": "Started"})));
    opening.extend(normalize::track_status(TrackStatus::AllClear));

    info!(
        session_key = key,
        drivers = drivers.len(),
        grid = grid.len(),
        anchor = %anchor,
        "replay session loaded"
    );
    Ok(ReplaySession {
        key: key.to_owned(),
        start,
        end,
        anchor,
        opening,
        grid,
        stints,
    })
}

/// Earliest position report per driver, ordered by position.
fn starting_grid(positions: &[Value]) -> Vec<Value> {
    let mut earliest: BTreeMap<String, (DateTime<Utc>, &Value)> = BTreeMap::new();
    for record in positions {
        let (Some(driver), Some(at)) = (driver_key(record), record_time(record, "date")) else {
            continue;
        };
        let earlier = earliest.get(&driver).is_none_or(|(seen, _)| at < *seen);
        if earlier {
            earliest.insert(driver, (at, record));
        }
    }
    let mut grid: Vec<Value> = earliest.into_values().map(|(_, record)| record.clone()).collect();
    grid.sort_by_key(|record| record.get("position").and_then(Value::as_u64).unwrap_or(u64::MAX));
    grid
}

/// Race time at which a lap record becomes known.
fn lap_completion(lap: &Value) -> Option<DateTime<Utc>> {
    let start = record_time(lap, "date_start")?;
    let duration = lap.get("lap_duration")?.as_f64()?;
    let millis = TimeDelta::from_std(Duration::try_from_secs_f64(duration).ok()?).ok()?;
    start.checked_add_signed(millis)
}

/// Take the laps that have finished by `now`, in completion order.
///
/// Laps without a duration are released at once; their lap number is
/// still worth showing.
fn release_laps(pending: &mut Vec<Value>, now: DateTime<Utc>) -> Vec<Value> {
    let (mut ready, waiting): (Vec<Value>, Vec<Value>) = pending
        .drain(..)
        .partition(|lap| lap_completion(lap).is_none_or(|done| done <= now));
    *pending = waiting;
    ready.sort_by_key(|lap| (lap_completion(lap), lap.get("lap_number").and_then(Value::as_u64)));
    ready
}

/// Take the stints whose drivers have reached the starting lap.
fn release_stints(pending: &mut Vec<Value>, board: &TimingBoard) -> Vec<Value> {
    let (ready, waiting): (Vec<Value>, Vec<Value>) = pending.drain(..).partition(|stint| {
        let Some(driver) = driver_key(stint) else {
            return true;
        };
        let lap_start = stint.get("lap_start").and_then(Value::as_u64).unwrap_or(1);
        board.laps_of(&driver).saturating_add(1) >= lap_start
    });
    *pending = waiting;
    ready
}

fn clock_partial(at: DateTime<Utc>, remaining: TimeDelta, extrapolating: bool) -> Map<String, Value> {
    fragment(
        domain::CLOCK,
        json!({
            "Utc": utc_stamp(at),
            "Remaining": countdown(remaining),
            "Extrapolating": extrapolating,
        }),
    )
}

/// Run one session to its end. `false` when stopped or broken.
async fn play(config: &ReplayConfig, rest: &OpenF1Client, ctx: &SourceContext, session: ReplaySession) -> bool {
    let feed: &GatedFeed = &ctx.feed;
    let mut clock = match RaceClock::new(session.anchor, config.speed) {
        Ok(clock) => clock,
        Err(e) => {
            ctx.signal(SignalKind::Fatal(e.to_string()));
            return false;
        }
    };
    let mut board = TimingBoard::new();

    let mut opening = session.opening;
    for record in &session.grid {
        merge_map(&mut opening, &board.ingest(Discipline::Position, record).partial);
    }
    merge_map(&mut opening, &clock_partial(clock.now(), clock.remaining(session.end), true));
    if !feed.replace(opening) {
        return false;
    }

    let mut cursors: BTreeMap<Discipline, DateTime<Utc>> = Discipline::WINDOWED
        .into_iter()
        .map(|d| {
            let from = match d {
                Discipline::RaceControl | Discipline::TeamRadio => session.start,
                _ => session.anchor,
            };
            (d, from)
        })
        .collect();
    let mut pending_laps: Vec<Value> = Vec::new();
    let mut pending_stints = session.stints;
    pending_stints.sort_by_key(|s| s.get("stint_number").and_then(Value::as_u64));

    let mut interval = ticker(Duration::from_millis(config.tick_interval_ms));
    let mut last_tick = Instant::now();
    while tick_or_cancelled(&mut interval, ctx.token()).await {
        let real = last_tick.elapsed();
        last_tick = Instant::now();
        if let Err(e) = clock.advance(real) {
            ctx.signal(SignalKind::Fatal(e.to_string()));
            return false;
        }
        let now = clock.now().min(session.end);

        for (&discipline, cursor) in &mut cursors {
            if *cursor >= now {
                continue;
            }
            match rest.window(discipline, &session.key, *cursor, now).await {
                Ok(records) => {
                    *cursor = now;
                    for record in prepare(discipline, records) {
                        if discipline == Discipline::Laps {
                            pending_laps.push(record);
                        } else {
                            board.ingest(discipline, &record).write(feed);
                        }
                    }
                }
                Err(e) => {
                    debug!(discipline = discipline.endpoint(), error = %e, "replay fetch failed; widening next window");
                }
            }
        }
        if ctx.is_cancelled() {
            return false;
        }

        let finished = now >= session.end;
        let laps = if finished {
            std::mem::take(&mut pending_laps)
        } else {
            release_laps(&mut pending_laps, now)
        };
        for lap in &laps {
            board.ingest(Discipline::Laps, lap).write(feed);
        }
        for stint in release_stints(&mut pending_stints, &board) {
            board.ingest(Discipline::Stints, &stint).write(feed);
        }

        if finished {
            let mut last = clock_partial(session.end, TimeDelta::zero(), false);
            last.extend(fragment(domain::SESSION_STATUS, json!({"Status": "Finalised"})));
            feed.apply(last);
            info!(session_key = %session.key, laps = board.leader_lap(), "replay reached session end");
            return true;
        }
        feed.apply(clock_partial(now, clock.remaining(session.end), true));
    }
    false
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use super::*;

    fn at(raw: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(raw).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn grid_uses_first_report_per_driver() {
        let positions = vec![
            json!({"driver_number": 16, "date": "2024-03-02T14:05:00", "position": 2}),
            json!({"driver_number": 1, "date": "2024-03-02T14:05:00", "position": 1}),
            json!({"driver_number": 16, "date": "2024-03-02T15:03:00", "position": 1}),
        ];
        let grid = starting_grid(&positions);
        assert_eq!(grid.len(), 2);
        assert_eq!(grid[0]["driver_number"], 1);
        assert_eq!(grid[1]["position"], 2);
    }

    #[test]
    fn laps_wait_for_completion() {
        let mut pending = vec![
            json!({"driver_number": 1, "lap_number": 2, "date_start": "2024-03-02T15:05:00", "lap_duration": 95.0}),
            json!({"driver_number": 1, "lap_number": 1, "date_start": "2024-03-02T15:03:00", "lap_duration": null}),
        ];
        let ready = release_laps(&mut pending, at("2024-03-02T15:06:00Z"));
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0]["lap_number"], 1);
        assert_eq!(pending.len(), 1);

        let ready = release_laps(&mut pending, at("2024-03-02T15:06:35Z"));
        assert_eq!(ready[0]["lap_number"], 2);
        assert!(pending.is_empty());
    }

    #[test]
    fn stints_start_when_driver_reaches_lap() {
        let mut board = TimingBoard::new();
        let mut pending = vec![
            json!({"driver_number": 4, "stint_number": 1, "lap_start": 1, "compound": "MEDIUM"}),
            json!({"driver_number": 4, "stint_number": 2, "lap_start": 20, "compound": "HARD"}),
        ];
        assert_eq!(release_stints(&mut pending, &board).len(), 1);
        assert_eq!(pending.len(), 1);

        board.ingest(Discipline::Laps, &json!({"driver_number": 4, "lap_number": 19}));
        let ready = release_stints(&mut pending, &board);
        assert_eq!(ready[0]["compound"], "HARD");
    }

    #[test]
    fn clock_partial_formats_countdown() {
        let partial = clock_partial(at("2024-03-02T15:10:00Z"), TimeDelta::seconds(3723), true);
        assert_eq!(partial["ExtrapolatedClock"]["Remaining"], "01:02:03");
        assert_eq!(partial["ExtrapolatedClock"]["Utc"], "2024-03-02T15:10:00.000Z");
    }
}
