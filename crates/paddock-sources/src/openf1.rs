//! `OpenF1` REST client and the per-discipline record catalogue.
//!
//! Every discipline is a REST endpoint, an MQTT topic (`v1/<endpoint>`)
//! and the name of the record field that carries its timestamp. Time
//! windows are expressed as `field>=from&field<to`; the comparison operator
//! is part of the key, so query strings are assembled by hand rather than
//! through form encoding.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use paddock_core::format::{query_time, record_time};
use reqwest::StatusCode;
use serde_json::Value;
use tracing::debug;

use crate::auth::TokenProvider;
use crate::error::SourceError;

/// One kind of `OpenF1` record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Discipline {
    /// Running order.
    Position,
    /// Gap to leader and interval to car ahead.
    Intervals,
    /// Completed laps with sector times.
    Laps,
    /// Speed, gear, throttle and friends.
    CarData,
    /// Tyre stints.
    Stints,
    /// Pit stops.
    Pit,
    /// Race-control messages.
    RaceControl,
    /// Team radio captures.
    TeamRadio,
    /// Weather station readings.
    Weather,
    /// Driver roster.
    Drivers,
    /// Session metadata.
    Sessions,
}

impl Discipline {
    /// Everything the broker publishes.
    pub const STREAMED: [Self; 11] = [
        Self::Position,
        Self::Intervals,
        Self::Laps,
        Self::CarData,
        Self::Stints,
        Self::Pit,
        Self::RaceControl,
        Self::TeamRadio,
        Self::Weather,
        Self::Drivers,
        Self::Sessions,
    ];

    /// Disciplines fetched by time window on every poll or replay tick.
    ///
    /// Car telemetry is left out of polling and replay: it runs at several
    /// hertz per car and the windows would be enormous.
    pub const WINDOWED: [Self; 7] = [
        Self::Position,
        Self::Intervals,
        Self::Laps,
        Self::Pit,
        Self::RaceControl,
        Self::TeamRadio,
        Self::Weather,
    ];

    /// REST endpoint name.
    pub const fn endpoint(self) -> &'static str {
        match self {
            Self::Position => "position",
            Self::Intervals => "intervals",
            Self::Laps => "laps",
            Self::CarData => "car_data",
            Self::Stints => "stints",
            Self::Pit => "pit",
            Self::RaceControl => "race_control",
            Self::TeamRadio => "team_radio",
            Self::Weather => "weather",
            Self::Drivers => "drivers",
            Self::Sessions => "sessions",
        }
    }

    /// MQTT topic.
    pub fn topic(self) -> String {
        format!("v1/{}", self.endpoint())
    }

    /// Discipline published on `topic`, if any.
    pub fn from_topic(topic: &str) -> Option<Self> {
        let name = topic.strip_prefix("v1/")?;
        Self::STREAMED.into_iter().find(|d| d.endpoint() == name)
    }

    /// Record field holding the record's timestamp.
    pub const fn time_field(self) -> Option<&'static str> {
        match self {
            Self::Laps => Some("date_start"),
            Self::Stints | Self::Drivers | Self::Sessions => None,
            _ => Some("date"),
        }
    }

    /// `true` when only the newest record per driver matters.
    pub const fn keeps_latest_per_driver(self) -> bool {
        matches!(
            self,
            Self::Position | Self::Intervals | Self::CarData | Self::Weather
        )
    }
}

/// Build a `key=value` query fragment.
pub fn eq(key: &str, value: &str) -> String {
    format!("{key}={value}")
}

/// Thin `OpenF1` REST client.
#[derive(Debug, Clone)]
pub struct OpenF1Client {
    client: reqwest::Client,
    base: String,
    tokens: Option<Arc<TokenProvider>>,
}

impl OpenF1Client {
    /// Client for `base` (for example `https://api.openf1.org/v1`).
    pub fn new(client: reqwest::Client, base: &str) -> Self {
        Self {
            client,
            base: base.trim_end_matches('/').to_owned(),
            tokens: None,
        }
    }

    /// Send a bearer token from `tokens` with every request.
    #[must_use]
    pub fn with_tokens(mut self, tokens: Arc<TokenProvider>) -> Self {
        self.tokens = Some(tokens);
        self
    }

    /// Fetch `endpoint?filters...`. A 404 means "no records" and is empty.
    pub async fn fetch(&self, endpoint: &str, filters: &[String]) -> Result<Vec<Value>, SourceError> {
        let url = if filters.is_empty() {
            format!("{}/{endpoint}", self.base)
        } else {
            format!("{}/{endpoint}?{}", self.base, filters.join("&"))
        };
        let mut request = self.client.get(&url);
        if let Some(tokens) = &self.tokens {
            let token = tokens.token().await?;
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        if !status.is_success() {
            return Err(SourceError::Status {
                status: status.as_u16(),
                url,
            });
        }
        match response.json::<Value>().await? {
            Value::Array(records) => {
                debug!(endpoint, records = records.len(), "fetched records");
                Ok(records)
            }
            other => Err(SourceError::Protocol(format!(
                "{endpoint}: expected a JSON array, got {}",
                type_name(&other)
            ))),
        }
    }

    /// The session with `session_key` (`latest` is accepted).
    pub async fn session(&self, session_key: &str) -> Result<Option<Value>, SourceError> {
        let mut records = self.fetch("sessions", &[eq("session_key", session_key)]).await?;
        Ok(records.pop())
    }

    /// The meeting with `meeting_key`.
    pub async fn meeting(&self, meeting_key: &str) -> Result<Option<Value>, SourceError> {
        let mut records = self.fetch("meetings", &[eq("meeting_key", meeting_key)]).await?;
        Ok(records.pop())
    }

    /// Every record of `discipline` for a session.
    pub async fn all(&self, discipline: Discipline, session_key: &str) -> Result<Vec<Value>, SourceError> {
        self.fetch(discipline.endpoint(), &[eq("session_key", session_key)])
            .await
    }

    /// Records of `discipline` whose timestamp falls in `[from, to)`.
    pub async fn window(
        &self,
        discipline: Discipline,
        session_key: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Value>, SourceError> {
        let Some(field) = discipline.time_field() else {
            return self.all(discipline, session_key).await;
        };
        let filters = [
            eq("session_key", session_key),
            format!("{field}>={}", query_time(from)),
            format!("{field}<{}", query_time(to)),
        ];
        self.fetch(discipline.endpoint(), &filters).await
    }
}

/// `session_key` of a session record, as a query value.
pub fn session_key(session: &Value) -> Option<String> {
    key_field(session, "session_key")
}

/// A numeric or string key field, as a query value.
pub fn key_field(record: &Value, field: &str) -> Option<String> {
    match record.get(field)? {
        Value::Number(n) => Some(n.to_string()),
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        _ => None,
    }
}

/// Keep only the newest record per `driver_number`, by `time_field`.
///
/// Records without a driver number (weather) collapse into one slot.
/// Output is ordered by driver number.
pub fn latest_per_driver(records: Vec<Value>, time_field: &str) -> Vec<Value> {
    let mut latest: BTreeMap<u64, (Option<DateTime<Utc>>, Value)> = BTreeMap::new();
    for record in records {
        let driver = record.get("driver_number").and_then(Value::as_u64).unwrap_or(0);
        let at = record_time(&record, time_field);
        let newer = latest.get(&driver).is_none_or(|(seen, _)| at >= *seen);
        if newer {
            latest.insert(driver, (at, record));
        }
    }
    latest.into_values().map(|(_, record)| record).collect()
}

/// Sort records by `time_field`, oldest first. Untimed records go first.
pub fn sort_by_time(records: &mut [Value], time_field: &str) {
    records.sort_by_key(|record| record_time(record, time_field));
}

const fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use axum::Router;
    use axum::extract::RawQuery;
    use axum::routing::get;
    use serde_json::json;

    use super::*;

    #[test]
    fn topics_map_back_to_disciplines() {
        for discipline in Discipline::STREAMED {
            assert_eq!(Discipline::from_topic(&discipline.topic()), Some(discipline));
        }
        assert_eq!(Discipline::from_topic("v1/unknown"), None);
        assert_eq!(Discipline::from_topic("position"), None);
    }

    #[test]
    fn newest_record_per_driver_wins() {
        let records = vec![
            json!({"driver_number": 44, "date": "2024-03-02T15:00:02", "position": 3}),
            json!({"driver_number": 1, "date": "2024-03-02T15:00:01", "position": 1}),
            json!({"driver_number": 44, "date": "2024-03-02T15:00:05", "position": 2}),
            json!({"driver_number": 44, "date": "2024-03-02T15:00:03", "position": 4}),
        ];
        let latest = latest_per_driver(records, "date");
        assert_eq!(latest.len(), 2);
        assert_eq!(latest.first().and_then(|r| r.get("position")), Some(&json!(1)));
        assert_eq!(latest.get(1).and_then(|r| r.get("position")), Some(&json!(2)));
    }

    #[tokio::test]
    async fn window_query_carries_comparison_filters() {
        let router = Router::new()
            .route(
                "/v1/position",
                get(|RawQuery(query): RawQuery| async move { axum::Json(json!([{"query": query}])) }),
            )
            .route(
                "/v1/sessions",
                get(|| async { (axum::http::StatusCode::NOT_FOUND, axum::Json(json!({"detail": "No results found."}))) }),
            );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, router).await.unwrap() });

        let client = OpenF1Client::new(reqwest::Client::new(), &format!("http://{addr}/v1/"));
        let from = DateTime::parse_from_rfc3339("2024-03-02T15:00:00Z").unwrap().with_timezone(&Utc);
        let to = DateTime::parse_from_rfc3339("2024-03-02T15:00:04.5Z").unwrap().with_timezone(&Utc);
        let records = client.window(Discipline::Position, "9472", from, to).await.unwrap();
        assert_eq!(
            records.first().and_then(|r| r.get("query")).and_then(Value::as_str),
            Some("session_key=9472&date%3E=2024-03-02T15:00:00.000&date%3C2024-03-02T15:00:04.500")
        );

        assert!(client.session("latest").await.unwrap().is_none());
    }
}
