//! Conversions from upstream record fields to state-document values.
//!
//! The REST-style sources report lap and sector times as float seconds,
//! gaps as numbers or text, and timestamps in a few ISO-8601 flavours. The
//! state document follows the native timing feed's conventions, so every
//! adapter that is not the native feed goes through these helpers.

use chrono::{DateTime, NaiveDateTime, SecondsFormat, TimeDelta, Utc};
use serde_json::Value;

const MILLIS_PER_MINUTE: u64 = 60_000;
const MILLIS_PER_SECOND: u64 = 1_000;

/// Round float seconds to whole milliseconds. `None` for negative,
/// non-finite or absurdly large inputs.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn to_millis(seconds: f64) -> Option<u64> {
    if !seconds.is_finite() || seconds < 0.0 || seconds > 86_400.0 {
        return None;
    }
    // Range-checked above, fits comfortably in u64.
    Some((seconds * 1000.0).round() as u64)
}

/// Format a lap time as `m:ss.mmm`.
pub fn lap_time(seconds: f64) -> Option<String> {
    let ms = to_millis(seconds)?;
    let minutes = ms / MILLIS_PER_MINUTE;
    let rest = ms % MILLIS_PER_MINUTE;
    Some(format!(
        "{minutes}:{:02}.{:03}",
        rest / MILLIS_PER_SECOND,
        rest % MILLIS_PER_SECOND
    ))
}

/// Format a sector time as `ss.mmm`, switching to `m:ss.mmm` past a minute.
pub fn sector_time(seconds: f64) -> Option<String> {
    let ms = to_millis(seconds)?;
    if ms >= MILLIS_PER_MINUTE {
        return lap_time(seconds);
    }
    Some(format!("{}.{:03}", ms / MILLIS_PER_SECOND, ms % MILLIS_PER_SECOND))
}

/// Format a gap or interval.
///
/// Numbers become `+x.xxx`, a zero gap (the leader) becomes empty, text such
/// as `+1 LAP` passes through and anything else is empty.
pub fn gap(value: &Value) -> String {
    match value {
        Value::Number(n) => match n.as_f64() {
            Some(secs) if secs.abs() < f64::EPSILON => String::new(),
            Some(secs) if secs.is_finite() => format!("+{secs:.3}"),
            _ => String::new(),
        },
        Value::String(text) => text.clone(),
        _ => String::new(),
    }
}

/// Format a remaining duration as `HH:MM:SS`. Negative durations clamp to zero.
pub fn countdown(remaining: TimeDelta) -> String {
    let total = remaining.num_seconds().max(0);
    let hours = total / 3600;
    let minutes = (total % 3600) / 60;
    let seconds = total % 60;
    format!("{hours:02}:{minutes:02}:{seconds:02}")
}

/// Normalize a team colour to bare upper-case hex.
pub fn team_colour(raw: &str) -> String {
    raw.trim().trim_start_matches('#').to_ascii_uppercase()
}

/// Parse an upstream timestamp.
///
/// Accepts RFC 3339 with any offset and the offset-less form, which is
/// taken as UTC.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

/// Timestamp of a record's `date` field (or another named field).
pub fn record_time(record: &Value, field: &str) -> Option<DateTime<Utc>> {
    record.get(field)?.as_str().and_then(parse_timestamp)
}

/// Format a timestamp for a `date>=`/`date<` query filter.
pub fn query_time(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%dT%H:%M:%S%.3f").to_string()
}

/// Format a timestamp the way the state document stores `Utc` fields.
pub fn utc_stamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Whole-track status shown by the timing board.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackStatus {
    /// Green, track clear.
    AllClear,
    /// Yellow flag.
    Yellow,
    /// Safety car on track.
    SafetyCar,
    /// Session stopped.
    Red,
    /// Virtual safety car active.
    VirtualSafetyCar,
    /// Virtual safety car about to end.
    VirtualSafetyCarEnding,
}

impl TrackStatus {
    /// Numeric status code as a string.
    pub const fn code(self) -> &'static str {
        match self {
            Self::AllClear => "1",
            Self::Yellow => "2",
            Self::SafetyCar => "4",
            Self::Red => "5",
            Self::VirtualSafetyCar => "6",
            Self::VirtualSafetyCarEnding => "7",
        }
    }

    /// Status label.
    pub const fn label(self) -> &'static str {
        match self {
            Self::AllClear => "AllClear",
            Self::Yellow => "Yellow",
            Self::SafetyCar => "SCDeployed",
            Self::Red => "Red",
            Self::VirtualSafetyCar => "VSCDeployed",
            Self::VirtualSafetyCarEnding => "VSCEnding",
        }
    }

    /// `{"Status": code, "Message": label}` as stored under `TrackStatus`.
    pub fn to_value(self) -> Value {
        serde_json::json!({"Status": self.code(), "Message": self.label()})
    }

    /// Derive the track status implied by a race-control message, if any.
    ///
    /// Sector-scoped yellows do not change the whole-track status.
    pub fn from_race_control(message: &str, flag: Option<&str>, scope: Option<&str>) -> Option<Self> {
        let text = message.to_ascii_uppercase();
        if text.contains("VIRTUAL SAFETY CAR ENDING") {
            return Some(Self::VirtualSafetyCarEnding);
        }
        if text.contains("VIRTUAL SAFETY CAR DEPLOYED") {
            return Some(Self::VirtualSafetyCar);
        }
        if text.contains("SAFETY CAR DEPLOYED") {
            return Some(Self::SafetyCar);
        }
        match flag.map(str::to_ascii_uppercase).as_deref() {
            Some("RED") => Some(Self::Red),
            Some("YELLOW" | "DOUBLE YELLOW") if !matches!(scope, Some("Sector")) => {
                Some(Self::Yellow)
            }
            Some("GREEN" | "CLEAR") if text.contains("TRACK CLEAR") || scope == Some("Track") => {
                Some(Self::AllClear)
            }
            _ => None,
        }
    }
}
