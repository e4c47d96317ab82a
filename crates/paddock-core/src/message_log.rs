//! Bounded, deduplicated message logs.
//!
//! Race-control messages and team-radio captures are append-only lists
//! inside the state document. Every adapter funnels new entries through
//! [`append`] so the same natural-key dedup and FIFO bound apply no matter
//! which upstream delivered them.

use std::collections::HashSet;

use serde_json::Value;

use crate::store::domain;

/// Separator between the parts of a composite key. Never occurs in text.
const KEY_SEPARATOR: char = '\u{1f}';

/// Which log an entry belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogKind {
    /// `RaceControlMessages.Messages`, keyed by `Utc` + `Message`.
    RaceControl,
    /// `TeamRadio.Captures`, keyed by `Path`.
    TeamRadio,
}

impl LogKind {
    /// Top-level domain holding the log.
    pub const fn domain(self) -> &'static str {
        match self {
            Self::RaceControl => domain::RACE_CONTROL,
            Self::TeamRadio => domain::TEAM_RADIO,
        }
    }

    /// Field inside the domain object holding the list.
    pub const fn list_field(self) -> &'static str {
        match self {
            Self::RaceControl => "Messages",
            Self::TeamRadio => "Captures",
        }
    }

    /// Maximum retained entries.
    pub const fn capacity(self) -> usize {
        match self {
            Self::RaceControl => 50,
            Self::TeamRadio => 30,
        }
    }

    /// Natural dedup key of an entry, if it carries the identifying fields.
    pub fn natural_key(self, entry: &Value) -> Option<String> {
        match self {
            Self::RaceControl => {
                let utc = entry.get("Utc")?.as_str()?;
                let message = entry.get("Message")?.as_str()?;
                Some(format!("{utc}{KEY_SEPARATOR}{message}"))
            }
            Self::TeamRadio => entry.get("Path")?.as_str().map(ToOwned::to_owned),
        }
    }
}

/// Append `incoming` to `existing`, skipping entries whose natural key is
/// already present, then evict from the front down to the capacity.
///
/// Returns the resulting list and the number of entries actually added.
/// Entries without a natural key cannot be deduplicated and are always
/// appended.
pub fn append<I>(kind: LogKind, existing: &[Value], incoming: I) -> (Vec<Value>, usize)
where
    I: IntoIterator<Item = Value>,
{
    let mut seen: HashSet<String> = existing
        .iter()
        .filter_map(|entry| kind.natural_key(entry))
        .collect();
    let mut entries = existing.to_vec();
    let mut added: usize = 0;

    for entry in incoming {
        if let Some(key) = kind.natural_key(&entry) {
            if !seen.insert(key) {
                continue;
            }
        }
        entries.push(entry);
        added = added.saturating_add(1);
    }

    let overflow = entries.len().saturating_sub(kind.capacity());
    if overflow > 0 {
        entries.drain(..overflow);
    }
    (entries, added)
}

/// Flatten a log payload into its entries.
///
/// Accepts either a plain array or the index-keyed object form
/// (`{"12": {...}, "13": {...}}`) used by incremental native updates, in
/// which case entries come out in index order.
pub fn collect_entries(list: &Value) -> Vec<Value> {
    match list {
        Value::Array(items) => items.clone(),
        Value::Object(map) => {
            let mut indexed: Vec<(u64, &Value)> = map
                .iter()
                .filter_map(|(k, v)| k.parse::<u64>().ok().map(|idx| (idx, v)))
                .collect();
            indexed.sort_by_key(|(idx, _)| *idx);
            indexed.into_iter().map(|(_, v)| v.clone()).collect()
        }
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn message(n: usize) -> Value {
        json!({
            "Utc": format!("2024-03-02T15:{:02}:{:02}.000Z", n / 60, n % 60),
            "Category": "Other",
            "Message": format!("MESSAGE {n}"),
        })
    }

    #[test]
    fn duplicate_message_stored_once() {
        let first = message(1);
        let (entries, added) = append(LogKind::RaceControl, &[], [first.clone(), first.clone()]);
        assert_eq!(entries.len(), 1);
        assert_eq!(added, 1);

        let (entries, added) = append(LogKind::RaceControl, &entries, [first]);
        assert_eq!(entries.len(), 1);
        assert_eq!(added, 0);
    }

    #[test]
    fn same_text_at_different_times_is_kept() {
        let a = json!({"Utc": "2024-03-02T15:00:00Z", "Message": "TRACK CLEAR"});
        let b = json!({"Utc": "2024-03-02T15:10:00Z", "Message": "TRACK CLEAR"});
        let (entries, _) = append(LogKind::RaceControl, &[], [a, b]);
        assert_eq!(entries.len(), 2);
    }

    #[test]
    fn sixty_messages_leave_the_fifty_newest() {
        let (entries, added) = append(LogKind::RaceControl, &[], (0..60).map(message));
        assert_eq!(added, 60);
        assert_eq!(entries.len(), 50);
        assert_eq!(entries.first(), Some(&message(10)));
        assert_eq!(entries.last(), Some(&message(59)));
    }

    #[test]
    fn radio_log_bounded_to_thirty_and_keyed_by_path() {
        let captures: Vec<Value> = (0..40)
            .map(|n| json!({"Utc": "2024-03-02T15:00:00Z", "RacingNumber": "1", "Path": format!("radio/{n}.mp3")}))
            .collect();
        let (entries, _) = append(LogKind::TeamRadio, &[], captures.clone());
        assert_eq!(entries.len(), 30);
        assert_eq!(entries.first(), captures.get(10));

        let (again, added) = append(LogKind::TeamRadio, &entries, captures.into_iter().skip(35));
        assert_eq!(added, 0);
        assert_eq!(again, entries);
    }

    #[test]
    fn index_keyed_payload_flattens_in_order() {
        let payload = json!({"11": {"Message": "B"}, "10": {"Message": "A"}, "x": {}});
        let entries = collect_entries(&payload);
        assert_eq!(entries, vec![json!({"Message": "A"}), json!({"Message": "B"})]);
    }
}
