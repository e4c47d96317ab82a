//! The unified state document.
//!
//! [`StateDocument`] is a plain, unsynchronized map from top-level domain
//! key (`TimingData`, `SessionInfo`, ...) to an arbitrarily nested JSON
//! value. Synchronization lives one level up in
//! [`LiveFeed`](crate::feed::LiveFeed), which is the only owner.

use serde_json::{Map, Value};

use crate::merge::merge_map;

/// Top-level domain keys written by the adapters.
pub mod domain {
    /// Meeting, circuit, session type and liveness.
    pub const SESSION_INFO: &str = "SessionInfo";
    /// Session lifecycle status (`Started`, `Finalised`, ...).
    pub const SESSION_STATUS: &str = "SessionStatus";
    /// Driver roster keyed by racing number.
    pub const DRIVER_LIST: &str = "DriverList";
    /// Per-driver timing lines.
    pub const TIMING_DATA: &str = "TimingData";
    /// Per-driver tyre stints.
    pub const TIMING_APP_DATA: &str = "TimingAppData";
    /// Race-control message log.
    pub const RACE_CONTROL: &str = "RaceControlMessages";
    /// Team radio capture log.
    pub const TEAM_RADIO: &str = "TeamRadio";
    /// Current track status.
    pub const TRACK_STATUS: &str = "TrackStatus";
    /// Weather readings.
    pub const WEATHER: &str = "WeatherData";
    /// Current and total laps.
    pub const LAP_COUNT: &str = "LapCount";
    /// Session countdown clock.
    pub const CLOCK: &str = "ExtrapolatedClock";
    /// Car telemetry keyed by racing number.
    pub const CAR_DATA: &str = "CarData";
}

/// The process-wide state document.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StateDocument {
    entries: Map<String, Value>,
}

impl StateDocument {
    /// Create an empty document.
    pub fn new() -> Self {
        Self::default()
    }

    /// Deep-merge a partial update into the document.
    pub fn merge(&mut self, partial: &Map<String, Value>) {
        merge_map(&mut self.entries, partial);
    }

    /// Point-in-time copy of the whole document.
    pub fn snapshot(&self) -> Value {
        Value::Object(self.entries.clone())
    }

    /// Remove every key, keeping the container.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// `true` when no domain has been written yet.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Borrow one top-level domain.
    pub fn get(&self, domain: &str) -> Option<&Value> {
        self.entries.get(domain)
    }

    /// Follow a path of object keys from the root.
    pub fn pointer(&self, path: &[&str]) -> Option<&Value> {
        let (first, rest) = path.split_first()?;
        rest.iter()
            .try_fold(self.entries.get(*first)?, |value, key| value.get(*key))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn object(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }

    #[test]
    fn merge_then_snapshot() {
        let mut doc = StateDocument::new();
        doc.merge(&object(json!({"TimingData": {"Lines": {"1": {"Position": "1"}}}})));
        doc.merge(&object(json!({"TimingData": {"Lines": {"1": {"GapToLeader": ""}}}})));
        assert_eq!(
            doc.snapshot(),
            json!({"TimingData": {"Lines": {"1": {"Position": "1", "GapToLeader": ""}}}})
        );
    }

    #[test]
    fn clear_empties_in_place() {
        let mut doc = StateDocument::new();
        doc.merge(&object(json!({"WeatherData": {"AirTemp": "20"}})));
        assert!(!doc.is_empty());
        doc.clear();
        assert!(doc.is_empty());
        assert_eq!(doc.snapshot(), json!({}));
    }

    #[test]
    fn pointer_walks_nested_keys() {
        let mut doc = StateDocument::new();
        doc.merge(&object(json!({"TimingData": {"Lines": {"44": {"NumberOfLaps": 10}}}})));
        assert_eq!(
            doc.pointer(&["TimingData", "Lines", "44", "NumberOfLaps"]),
            Some(&json!(10))
        );
        assert!(doc.pointer(&["TimingData", "Lines", "16"]).is_none());
        assert!(doc.pointer(&[]).is_none());
    }
}
