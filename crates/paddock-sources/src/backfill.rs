//! One-shot history fetch for adapters that join a session in progress.
//!
//! The pub/sub and polling adapters only see what happens after they start;
//! the roster, race-control log and radio log are fetched once so the
//! document is not missing the opening laps.

use paddock_core::GatedFeed;
use paddock_core::format::TrackStatus;
use paddock_core::message_log::LogKind;
use serde_json::Value;
use tracing::{info, warn};

use crate::normalize;
use crate::openf1::{Discipline, OpenF1Client, sort_by_time};

/// What a backfill wrote.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BackfillReport {
    /// Drivers written to the roster.
    pub drivers: usize,
    /// Race-control entries added.
    pub race_control: usize,
    /// Radio captures added.
    pub team_radio: usize,
}

/// Fetch roster and message history for `session_key` into `feed`.
///
/// Each fetch failure is logged and skipped; the rest still land.
pub async fn backfill(client: &OpenF1Client, session_key: &str, feed: &GatedFeed) -> BackfillReport {
    let mut report = BackfillReport::default();

    match client.all(Discipline::Drivers, session_key).await {
        Ok(records) => {
            let roster = normalize::driver_list(&records);
            if feed.apply(roster) {
                report.drivers = records.len();
            }
        }
        Err(e) => warn!(error = %e, session_key, "roster backfill failed"),
    }

    match client.all(Discipline::RaceControl, session_key).await {
        Ok(mut records) => {
            sort_by_time(&mut records, "date");
            let mut status: Option<TrackStatus> = None;
            let entries: Vec<Value> = records
                .iter()
                .map(|record| {
                    let (entry, derived) = normalize::race_control(record);
                    status = derived.or(status);
                    entry
                })
                .collect();
            report.race_control = feed.append_log(LogKind::RaceControl, entries);
            if let Some(status) = status {
                feed.apply(normalize::track_status(status));
            }
            for flags in records.iter().filter_map(normalize::car_out) {
                feed.apply(flags);
            }
        }
        Err(e) => warn!(error = %e, session_key, "race control backfill failed"),
    }

    match client.all(Discipline::TeamRadio, session_key).await {
        Ok(mut records) => {
            sort_by_time(&mut records, "date");
            let entries = records.iter().filter_map(normalize::team_radio).collect();
            report.team_radio = feed.append_log(LogKind::TeamRadio, entries);
        }
        Err(e) => warn!(error = %e, session_key, "team radio backfill failed"),
    }

    info!(
        session_key,
        drivers = report.drivers,
        race_control = report.race_control,
        team_radio = report.team_radio,
        "backfill complete"
    );
    report
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use axum::Router;
    use axum::http::StatusCode;
    use axum::routing::get;
    use paddock_core::LiveFeed;
    use serde_json::json;
    use tokio_util::sync::CancellationToken;

    use super::*;

    #[tokio::test]
    async fn failed_fetch_does_not_block_the_rest() {
        let router = Router::new()
            .route(
                "/v1/drivers",
                get(|| async { axum::Json(json!([{"driver_number": 1, "name_acronym": "VER"}])) }),
            )
            .route(
                "/v1/race_control",
                get(|| async {
                    axum::Json(json!([
                        {"date": "2024-03-02T15:20:00", "category": "Flag", "flag": "YELLOW", "scope": "Track", "message": "YELLOW"},
                        {"date": "2024-03-02T15:05:00", "category": "Flag", "flag": "GREEN", "scope": "Track", "message": "GREEN LIGHT - PIT EXIT OPEN"}
                    ]))
                }),
            )
            .route("/v1/team_radio", get(|| async { StatusCode::INTERNAL_SERVER_ERROR }));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, router).await.unwrap() });

        let client = OpenF1Client::new(reqwest::Client::new(), &format!("http://{addr}/v1"));
        let feed = LiveFeed::new();
        let report = backfill(&client, "9472", &feed.gated(CancellationToken::new())).await;

        assert_eq!(report.drivers, 1);
        assert_eq!(report.race_control, 2);
        assert_eq!(report.team_radio, 0);
        assert_eq!(feed.pointer(&["DriverList", "1", "Tla"]), Some(json!("VER")));
        assert_eq!(feed.pointer(&["TrackStatus", "Status"]), Some(json!("2")));
        let messages = feed.pointer(&["RaceControlMessages", "Messages"]).unwrap();
        assert_eq!(messages[0]["Message"], "GREEN LIGHT - PIT EXIT OPEN");
    }
}
