//! Stateless conversions from `OpenF1` records to state-document fragments.

use paddock_core::domain;
use paddock_core::format::{TrackStatus, parse_timestamp, team_colour, utc_stamp};
use serde_json::{Map, Value, json};

/// Racing number of a record as the string key used in the state document.
pub fn driver_key(record: &Value) -> Option<String> {
    match record.get("driver_number")? {
        Value::Number(n) => n.as_u64().map(|n| n.to_string()),
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        _ => None,
    }
}

/// Wrap `value` as `{domain: value}`.
pub fn fragment(domain: &str, value: Value) -> Map<String, Value> {
    let mut map = Map::new();
    map.insert(domain.to_owned(), value);
    map
}

/// Wrap `line` as `{domain: {Lines: {driver: line}}}`.
pub fn line_fragment(domain: &str, driver: &str, line: Value) -> Map<String, Value> {
    fragment(domain, json!({"Lines": {driver: line}}))
}

fn str_field<'a>(record: &'a Value, field: &str) -> Option<&'a str> {
    record.get(field).and_then(Value::as_str)
}

fn text(record: &Value, field: &str) -> Value {
    str_field(record, field).map_or(Value::Null, |s| Value::String(s.to_owned()))
}

/// Drop `null` members from objects, recursively.
pub fn without_nulls(value: Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .filter(|(_, v)| !v.is_null())
                .map(|(k, v)| (k, without_nulls(v)))
                .collect(),
        ),
        other => other,
    }
}

/// Re-stamp a record timestamp in the document's `Utc` format.
fn stamp(record: &Value, field: &str) -> Value {
    str_field(record, field)
        .map_or(Value::Null, |raw| {
            Value::String(parse_timestamp(raw).map_or_else(|| raw.to_owned(), utc_stamp))
        })
}

/// Number rendered as the string the native feed would send.
fn number_text(record: &Value, field: &str) -> Value {
    match record.get(field) {
        Some(Value::Number(n)) => Value::String(n.to_string()),
        Some(Value::String(s)) => Value::String(s.clone()),
        _ => Value::Null,
    }
}

/// `DriverList` entry for a roster record.
pub fn driver_entry(record: &Value) -> Option<(String, Value)> {
    let number = driver_key(record)?;
    let entry = without_nulls(json!({
        "RacingNumber": number,
        "Tla": text(record, "name_acronym"),
        "FullName": text(record, "full_name"),
        "BroadcastName": text(record, "broadcast_name"),
        "TeamName": text(record, "team_name"),
        "TeamColour": str_field(record, "team_colour").map_or(Value::Null, |c| Value::String(team_colour(c))),
        "HeadshotUrl": text(record, "headshot_url"),
    }));
    Some((number, entry))
}

/// `DriverList` partial for a batch of roster records.
pub fn driver_list(records: &[Value]) -> Map<String, Value> {
    let list: Map<String, Value> = records.iter().filter_map(driver_entry).collect();
    if list.is_empty() {
        return Map::new();
    }
    fragment(domain::DRIVER_LIST, Value::Object(list))
}

/// `WeatherData` partial.
pub fn weather(record: &Value) -> Map<String, Value> {
    fragment(
        domain::WEATHER,
        without_nulls(json!({
            "AirTemp": number_text(record, "air_temperature"),
            "TrackTemp": number_text(record, "track_temperature"),
            "Humidity": number_text(record, "humidity"),
            "Pressure": number_text(record, "pressure"),
            "Rainfall": number_text(record, "rainfall"),
            "WindDirection": number_text(record, "wind_direction"),
            "WindSpeed": number_text(record, "wind_speed"),
        })),
    )
}

/// `CarData` partial for one telemetry sample.
pub fn car_data(record: &Value) -> Option<Map<String, Value>> {
    let driver = driver_key(record)?;
    let field = |name: &str| record.get(name).cloned().unwrap_or(Value::Null);
    Some(fragment(
        domain::CAR_DATA,
        json!({"Cars": {driver: {
            "Speed": field("speed"),
            "Gear": field("n_gear"),
            "Rpm": field("rpm"),
            "Throttle": field("throttle"),
            "Brake": field("brake"),
            "Drs": field("drs"),
        }}}),
    ))
}

/// `SessionInfo` partial from a session record and its meeting, if known.
///
/// Fields the records do not carry are left out so a later partial never
/// erases what an earlier, richer one wrote.
pub fn session_info(session: &Value, meeting: Option<&Value>) -> Map<String, Value> {
    let meeting_field = |name: &str| meeting.map_or(Value::Null, |m| text(m, name));
    fragment(
        domain::SESSION_INFO,
        without_nulls(json!({
            "Meeting": {
                "Name": meeting_field("meeting_name"),
                "OfficialName": meeting_field("meeting_official_name"),
                "Location": text(session, "location"),
                "Country": {"Name": text(session, "country_name")},
                "Circuit": {
                    "Key": session.get("circuit_key").cloned().unwrap_or(Value::Null),
                    "ShortName": text(session, "circuit_short_name"),
                },
            },
            "Key": session.get("session_key").cloned().unwrap_or(Value::Null),
            "Type": text(session, "session_type"),
            "Name": text(session, "session_name"),
            "StartDate": stamp(session, "date_start"),
            "EndDate": stamp(session, "date_end"),
        })),
    )
}

/// Race-control log entry plus the whole-track status it implies.
pub fn race_control(record: &Value) -> (Value, Option<TrackStatus>) {
    let message = str_field(record, "message").unwrap_or_default();
    let status = TrackStatus::from_race_control(
        message,
        str_field(record, "flag"),
        str_field(record, "scope"),
    );
    let mut entry = json!({
        "Utc": stamp(record, "date"),
        "Category": text(record, "category"),
        "Message": message,
    });
    if let Value::Object(map) = &mut entry {
        for (from, to) in [("flag", "Flag"), ("scope", "Scope"), ("sector", "Sector")] {
            if let Some(value) = record.get(from).filter(|v| !v.is_null()) {
                map.insert(to.to_owned(), value.clone());
            }
        }
        if let Some(driver) = driver_key(record) {
            map.insert("RacingNumber".to_owned(), Value::String(driver));
        }
        if let Some(lap) = record.get("lap_number").filter(|v| !v.is_null()) {
            map.insert("Lap".to_owned(), lap.clone());
        }
    }
    (entry, status)
}

/// `TimingData` line flag for a message reporting a car out of the session,
/// such as `CAR 44 (HAM) RETIRED` or `CAR 2 (SAR) STOPPED ON TRACK`.
///
/// The car comes from `driver_number` when present, otherwise from the
/// `CAR <n>` prefix of the message.
pub fn car_out(record: &Value) -> Option<Map<String, Value>> {
    let message = str_field(record, "message")?.to_ascii_uppercase();
    let flag = if has_word(&message, "RETIRED") {
        "Retired"
    } else if has_word(&message, "STOPPED") {
        "Stopped"
    } else {
        return None;
    };
    let driver = driver_key(record).or_else(|| car_number(&message))?;
    Some(line_fragment(domain::TIMING_DATA, &driver, json!({ flag: true })))
}

fn has_word(message: &str, word: &str) -> bool {
    message
        .split(|c: char| !c.is_ascii_alphanumeric())
        .any(|w| w == word)
}

fn car_number(message: &str) -> Option<String> {
    let mut words = message.split_whitespace();
    while let Some(word) = words.next() {
        if word == "CAR" {
            let number = words.next()?;
            if number.chars().all(|c| c.is_ascii_digit()) {
                return Some(number.to_owned());
            }
        }
    }
    None
}

/// Team radio log entry.
pub fn team_radio(record: &Value) -> Option<Value> {
    let path = str_field(record, "recording_url")?;
    Some(json!({
        "Utc": stamp(record, "date"),
        "RacingNumber": driver_key(record).map_or(Value::Null, Value::String),
        "Path": path,
    }))
}

/// `TrackStatus` partial.
pub fn track_status(status: TrackStatus) -> Map<String, Value> {
    fragment(domain::TRACK_STATUS, status.to_value())
}
