//! Per-driver scratch state for the record-based sources.
//!
//! The pub/sub, poller and replay adapters all receive one record at a time
//! per discipline. [`TimingBoard`] remembers just enough per driver (lap
//! count, personal bests, pit stops) to turn each record into the partial
//! update the native feed would have sent, including the fastest-lap flags
//! that need history to compute.
//!
//! Lap counts only move forward: a lap record older than the driver's
//! current lap is dropped entirely, so a late or re-delivered record never
//! rewinds `NumberOfLaps` or replaces a newer `LastLapTime`. Re-delivery of
//! the current lap (overlapping poll windows) is idempotent: a time equal to
//! the best keeps its fastest flags.

use std::collections::{BTreeMap, BTreeSet};

use paddock_core::GatedFeed;
use paddock_core::domain;
use paddock_core::format::{gap, lap_time, sector_time};
use paddock_core::message_log::LogKind;
use serde_json::{Map, Value, json};
use tracing::debug;

use crate::normalize::{self, driver_key, line_fragment};
use crate::openf1::Discipline;

const SECTOR_FIELDS: [&str; 3] = ["duration_sector_1", "duration_sector_2", "duration_sector_3"];

/// The writes produced by one record.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Update {
    /// Partial merged into the document.
    pub partial: Map<String, Value>,
    /// Entry appended to a message log.
    pub log: Option<(LogKind, Value)>,
}

impl Update {
    const fn state(partial: Map<String, Value>) -> Self {
        Self { partial, log: None }
    }

    /// `true` when the record produced nothing.
    pub fn is_empty(&self) -> bool {
        self.partial.is_empty() && self.log.is_none()
    }

    /// Write to the feed: log first, then the partial.
    pub fn write(self, feed: &GatedFeed) {
        if let Some((kind, entry)) = self.log {
            feed.append_log(kind, vec![entry]);
        }
        feed.apply(self.partial);
    }
}

#[derive(Debug, Default)]
struct DriverScratch {
    laps: u64,
    best_lap: Option<f64>,
    best_sectors: [Option<f64>; 3],
    pit_laps: BTreeSet<u64>,
}

/// Per-driver timing memory.
#[derive(Debug, Default)]
pub struct TimingBoard {
    drivers: BTreeMap<String, DriverScratch>,
    best_lap: Option<f64>,
    best_sectors: [Option<f64>; 3],
    leader_lap: u64,
}

impl TimingBoard {
    /// Empty board.
    pub fn new() -> Self {
        Self::default()
    }

    /// Turn one record of `discipline` into the writes it implies.
    pub fn ingest(&mut self, discipline: Discipline, record: &Value) -> Update {
        let update = match discipline {
            Discipline::Position => self.position(record).map(Update::state),
            Discipline::Intervals => interval(record).map(Update::state),
            Discipline::Laps => self.lap(record).map(Update::state),
            Discipline::CarData => normalize::car_data(record).map(Update::state),
            Discipline::Stints => self.stint(record).map(Update::state),
            Discipline::Pit => self.pit(record).map(Update::state),
            Discipline::RaceControl => {
                let (entry, status) = normalize::race_control(record);
                let mut partial = status.map(normalize::track_status).unwrap_or_default();
                partial.extend(normalize::car_out(record).unwrap_or_default());
                Some(Update {
                    partial,
                    log: Some((LogKind::RaceControl, entry)),
                })
            }
            Discipline::TeamRadio => normalize::team_radio(record).map(|entry| Update {
                partial: Map::new(),
                log: Some((LogKind::TeamRadio, entry)),
            }),
            Discipline::Weather => Some(Update::state(normalize::weather(record))),
            Discipline::Drivers => Some(Update::state(normalize::driver_list(std::slice::from_ref(record)))),
            Discipline::Sessions => Some(Update::state(normalize::session_info(record, None))),
        };
        update.unwrap_or_default()
    }

    /// Laps completed by `driver` as far as the board knows.
    pub fn laps_of(&self, driver: &str) -> u64 {
        self.drivers.get(driver).map_or(0, |d| d.laps)
    }

    /// Highest lap number seen for any driver.
    pub const fn leader_lap(&self) -> u64 {
        self.leader_lap
    }

    fn position(&mut self, record: &Value) -> Option<Map<String, Value>> {
        let driver = driver_key(record)?;
        let position = record.get("position")?.as_u64()?;
        self.drivers.entry(driver.clone()).or_default();
        Some(line_fragment(
            domain::TIMING_DATA,
            &driver,
            json!({"Position": position.to_string(), "Line": position}),
        ))
    }

    fn lap(&mut self, record: &Value) -> Option<Map<String, Value>> {
        let driver = driver_key(record)?;
        let lap_number = record.get("lap_number")?.as_u64()?;
        let scratch = self.drivers.entry(driver.clone()).or_default();
        if lap_number < scratch.laps {
            debug!(driver, lap_number, current = scratch.laps, "dropping stale lap");
            return None;
        }
        scratch.laps = lap_number;

        let mut line = Map::new();
        line.insert("NumberOfLaps".to_owned(), json!(lap_number));
        if record.get("is_pit_out_lap").and_then(Value::as_bool) == Some(true) {
            line.insert("PitOut".to_owned(), Value::Bool(true));
            line.insert("InPit".to_owned(), Value::Bool(false));
        }

        if let Some((duration, value)) = record
            .get("lap_duration")
            .and_then(Value::as_f64)
            .and_then(|d| lap_time(d).map(|v| (d, v)))
        {
            let personal = scratch.best_lap.is_none_or(|best| duration <= best);
            let overall = personal && self.best_lap.is_none_or(|best| duration <= best);
            if personal {
                scratch.best_lap = Some(duration);
                line.insert("BestLapTime".to_owned(), json!({"Value": value, "Lap": lap_number}));
            }
            if overall {
                self.best_lap = Some(duration);
            }
            line.insert(
                "LastLapTime".to_owned(),
                json!({"Value": value, "PersonalFastest": personal, "OverallFastest": overall}),
            );
        }

        let mut sectors = Map::new();
        let bests = scratch.best_sectors.iter_mut().zip(self.best_sectors.iter_mut());
        for (idx, (field, (personal_best, overall_best))) in SECTOR_FIELDS.iter().zip(bests).enumerate() {
            let Some((duration, value)) = record
                .get(*field)
                .and_then(Value::as_f64)
                .and_then(|d| sector_time(d).map(|v| (d, v)))
            else {
                continue;
            };
            let personal = personal_best.is_none_or(|best| duration <= best);
            let overall = personal && overall_best.is_none_or(|best| duration <= best);
            if personal {
                *personal_best = Some(duration);
            }
            if overall {
                *overall_best = Some(duration);
            }
            sectors.insert(
                idx.to_string(),
                json!({"Value": value, "PersonalFastest": personal, "OverallFastest": overall}),
            );
        }
        if !sectors.is_empty() {
            line.insert("Sectors".to_owned(), Value::Object(sectors));
        }

        let mut partial = line_fragment(domain::TIMING_DATA, &driver, Value::Object(line));
        if lap_number > self.leader_lap {
            self.leader_lap = lap_number;
            partial.insert(domain::LAP_COUNT.to_owned(), json!({"CurrentLap": lap_number}));
        }
        Some(partial)
    }

    fn stint(&self, record: &Value) -> Option<Map<String, Value>> {
        let driver = driver_key(record)?;
        let index = record.get("stint_number")?.as_u64()?.checked_sub(1)?;
        let age = record.get("tyre_age_at_start").and_then(Value::as_u64).unwrap_or(0);
        let lap_start = record.get("lap_start").and_then(Value::as_u64).unwrap_or(1);
        let current = self.laps_of(&driver);
        let lap_end = record
            .get("lap_end")
            .and_then(Value::as_u64)
            .map_or(current, |end| end.min(current.max(lap_start)));
        let run = lap_end.saturating_add(1).saturating_sub(lap_start);

        let stint = normalize::without_nulls(json!({
            "Compound": record.get("compound").and_then(Value::as_str),
            "New": (age == 0).to_string(),
            "TotalLaps": age.saturating_add(run),
            "StartLaps": age,
        }));
        Some(line_fragment(
            domain::TIMING_APP_DATA,
            &driver,
            json!({"Stints": {index.to_string(): stint}}),
        ))
    }

    fn pit(&mut self, record: &Value) -> Option<Map<String, Value>> {
        let driver = driver_key(record)?;
        let scratch = self.drivers.entry(driver.clone()).or_default();
        let lap = record.get("lap_number").and_then(Value::as_u64).unwrap_or(scratch.laps);
        scratch.pit_laps.insert(lap);
        Some(line_fragment(
            domain::TIMING_DATA,
            &driver,
            json!({"InPit": false, "PitOut": true, "NumberOfPitStops": scratch.pit_laps.len()}),
        ))
    }
}

fn interval(record: &Value) -> Option<Map<String, Value>> {
    let driver = driver_key(record)?;
    let to_leader = record.get("gap_to_leader").unwrap_or(&Value::Null);
    let to_ahead = record.get("interval").unwrap_or(&Value::Null);
    Some(line_fragment(
        domain::TIMING_DATA,
        &driver,
        json!({
            "GapToLeader": gap(to_leader),
            "IntervalToPositionAhead": {"Value": gap(to_ahead)},
        }),
    ))
}
