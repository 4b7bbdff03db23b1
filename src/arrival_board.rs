// Arrival-time derivation and the 30-second polling engine feeding the
// signage board.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time;

use crate::selection::Selection;
use crate::siri_api_models::{self, FiveOneOneApi, Result, SignError};

pub const POLL_INTERVAL_SECS: u64 = 30;

// ============================================================================
// Predictions
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Prediction {
    pub destination: String,
    pub minutes: i64,
    pub seconds: i64,
    pub line_ref: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vehicle_ref: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub occupancy: Option<String>,
}

#[derive(Debug, Clone)]
pub struct DerivedArrivals {
    pub predictions: Vec<Prediction>,
    pub station_name: Option<String>,
}

fn parse_time(value: &Value) -> Option<DateTime<Utc>> {
    let text = value.as_str()?;
    DateTime::parse_from_rfc3339(text)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

// A vehicle already due or passed shows as 0 min 0 s, never negative.
fn countdown(target: DateTime<Utc>, now: DateTime<Utc>) -> (i64, i64) {
    let diff_ms = target.signed_duration_since(now).num_milliseconds();
    if diff_ms <= 0 {
        return (0, 0);
    }
    (diff_ms / 60_000, (diff_ms % 60_000) / 1_000)
}

// Extracts one prediction per monitored visit. Time field priority: expected
// arrival, else expected departure, else aimed (scheduled) arrival.
pub fn derive_predictions(data: &Value, now: DateTime<Utc>) -> Result<DerivedArrivals> {
    let visits_node = data
        .pointer("/ServiceDelivery/StopMonitoringDelivery/MonitoredStopVisit")
        .ok_or_else(|| {
            SignError::ShapeError("Missing expected data structure".to_string())
        })?;

    let visits: Vec<&Value> = match visits_node {
        Value::Array(list) => list.iter().collect(),
        other => vec![other],
    };

    let station_name = visits.first().and_then(|visit| {
        visit["MonitoredVehicleJourney"]["MonitoredCall"]["StopPointName"]
            .as_str()
            .map(String::from)
    });

    let mut predictions: Vec<Prediction> = visits
        .iter()
        .filter_map(|visit| {
            let journey = visit.get("MonitoredVehicleJourney")?;
            let call = &journey["MonitoredCall"];

            let (minutes, seconds) = parse_time(&call["ExpectedArrivalTime"])
                .or_else(|| parse_time(&call["ExpectedDepartureTime"]))
                .or_else(|| parse_time(&call["AimedArrivalTime"]))
                .map(|target| countdown(target, now))
                .unwrap_or((0, 0));

            Some(Prediction {
                destination: journey["DestinationName"]
                    .as_str()
                    .unwrap_or("Unknown")
                    .to_string(),
                minutes,
                seconds,
                line_ref: journey["LineRef"]
                    .as_str()
                    .or_else(|| journey["PublishedLineName"].as_str())
                    .unwrap_or("Unknown")
                    .to_string(),
                vehicle_ref: journey["VehicleRef"].as_str().map(String::from),
                occupancy: journey["Occupancy"].as_str().map(String::from),
            })
        })
        .collect();

    // Full-precision sort; ties below minute granularity break on seconds
    predictions.sort_by_key(|p| p.minutes * 60 + p.seconds);

    Ok(DerivedArrivals {
        predictions,
        station_name,
    })
}

// ============================================================================
// Board State
// ============================================================================

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BoardState {
    pub active: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line_label: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub destination: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub station_name: Option<String>,
    pub predictions: Vec<Prediction>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<i64>,
}

impl BoardState {
    pub fn idle() -> Self {
        BoardState {
            active: false,
            line_label: None,
            destination: None,
            station_name: None,
            predictions: Vec::new(),
            error: None,
            updated_at: None,
        }
    }

    pub fn for_selection(selection: &Selection) -> Self {
        BoardState {
            active: true,
            line_label: Some(selection.line.name.clone()),
            destination: Some(selection.pattern.destination.clone()),
            station_name: Some(format!(
                "{} ({})",
                selection.stop.name, selection.pattern.direction
            )),
            predictions: Vec::new(),
            error: None,
            updated_at: None,
        }
    }
}

// ============================================================================
// Polling Engine
// ============================================================================

// Cancelling the handle both stops the timer loop and guarantees a fetch
// already in flight cannot touch the board afterwards.
pub struct PollHandle {
    alive: Arc<AtomicBool>,
    task: tokio::task::JoinHandle<()>,
}

impl PollHandle {
    pub fn cancel(&self) {
        self.alive.store(false, Ordering::SeqCst);
        self.task.abort();
    }
}

fn fetch_arrivals(api_key: &str, agency: &str, stop_code: &str, line: &str) -> Result<DerivedArrivals> {
    let mut data = FiveOneOneApi::stop_monitoring(api_key, agency, Some(stop_code))?;
    if !line.is_empty() {
        siri_api_models::filter_visits_by_line(&mut data, line);
    }
    derive_predictions(&data, Utc::now())
}

pub fn spawn_poll(
    api_key: String,
    selection: Selection,
    board: Arc<Mutex<BoardState>>,
) -> PollHandle {
    let alive = Arc::new(AtomicBool::new(true));
    let flag = alive.clone();

    if let Ok(mut state) = board.lock() {
        *state = BoardState::for_selection(&selection);
    }

    let task = tokio::spawn(async move {
        let agency = selection.operator.id;
        let stop_code = selection.stop.code;
        let line = selection.line.name;
        let mut interval = time::interval(Duration::from_secs(POLL_INTERVAL_SECS));

        loop {
            interval.tick().await;

            if !flag.load(Ordering::SeqCst) {
                break;
            }

            let key = api_key.clone();
            let agency_param = agency.clone();
            let stop_param = stop_code.clone();
            let line_param = line.clone();
            let fetched = tokio::task::spawn_blocking(move || {
                fetch_arrivals(&key, &agency_param, &stop_param, &line_param)
            })
            .await;

            // Cancelled mid-flight: drop the result instead of writing it
            if !flag.load(Ordering::SeqCst) {
                break;
            }

            let Ok(mut state) = board.lock() else {
                eprintln!("❌ Failed to lock board state");
                continue;
            };

            match fetched {
                Ok(Ok(derived)) => {
                    println!(
                        "🚌 Arrivals refreshed for stop {}: {} predictions",
                        stop_code,
                        derived.predictions.len()
                    );
                    state.predictions = derived.predictions;
                    if let Some(name) = derived.station_name {
                        state.station_name = Some(name);
                    }
                    if let Some(first) = state.predictions.first() {
                        state.destination = Some(first.destination.clone());
                    }
                    state.error = None;
                    state.updated_at = Some(Utc::now().timestamp());
                }
                Ok(Err(e)) => {
                    eprintln!("⚠️  Arrival refresh failed: {}", e);
                    state.predictions.clear();
                    state.error = Some(e.to_string());
                    state.updated_at = Some(Utc::now().timestamp());
                }
                Err(e) => {
                    eprintln!("❌ Arrival refresh task panicked: {}", e);
                    state.predictions.clear();
                    state.error = Some("Arrival refresh task panicked".to_string());
                    state.updated_at = Some(Utc::now().timestamp());
                }
            }
        }
    });

    PollHandle { alive, task }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn fixed_now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()
    }

    fn envelope(visits: Value) -> Value {
        json!({
            "ServiceDelivery": {
                "StopMonitoringDelivery": { "MonitoredStopVisit": visits }
            }
        })
    }

    #[test]
    fn missing_visit_envelope_is_a_hard_error() {
        let data = json!({ "ServiceDelivery": { "StopMonitoringDelivery": {} } });
        let err = derive_predictions(&data, fixed_now()).unwrap_err();
        assert!(matches!(err, SignError::ShapeError(_)));
    }

    #[test]
    fn empty_visit_list_is_fine() {
        let derived = derive_predictions(&envelope(json!([])), fixed_now()).unwrap();
        assert!(derived.predictions.is_empty());
        assert!(derived.station_name.is_none());
    }

    #[test]
    fn past_arrivals_clamp_to_zero() {
        let data = envelope(json!([
            {
                "MonitoredVehicleJourney": {
                    "DestinationName": "Ocean Beach",
                    "LineRef": "5",
                    "MonitoredCall": { "ExpectedArrivalTime": "2025-06-01T11:58:00Z" }
                }
            }
        ]));

        let derived = derive_predictions(&data, fixed_now()).unwrap();
        assert_eq!(derived.predictions[0].minutes, 0);
        assert_eq!(derived.predictions[0].seconds, 0);
    }

    #[test]
    fn soonest_visit_sorts_first() {
        // 90s and 45s out, listed in the wrong order
        let data = envelope(json!([
            {
                "MonitoredVehicleJourney": {
                    "DestinationName": "Later",
                    "LineRef": "5",
                    "MonitoredCall": { "ExpectedArrivalTime": "2025-06-01T12:01:30Z" }
                }
            },
            {
                "MonitoredVehicleJourney": {
                    "DestinationName": "Sooner",
                    "LineRef": "5",
                    "MonitoredCall": { "ExpectedArrivalTime": "2025-06-01T12:00:45Z" }
                }
            }
        ]));

        let derived = derive_predictions(&data, fixed_now()).unwrap();
        assert_eq!(derived.predictions[0].destination, "Sooner");
        assert_eq!(derived.predictions[0].minutes, 0);
        assert_eq!(derived.predictions[0].seconds, 45);
        assert_eq!(derived.predictions[1].minutes, 1);
        assert_eq!(derived.predictions[1].seconds, 30);
    }

    #[test]
    fn time_field_priority_prefers_expected_arrival() {
        let data = envelope(json!([
            {
                "MonitoredVehicleJourney": {
                    "MonitoredCall": {
                        "ExpectedArrivalTime": "2025-06-01T12:05:00Z",
                        "ExpectedDepartureTime": "2025-06-01T12:09:00Z",
                        "AimedArrivalTime": "2025-06-01T12:10:00Z"
                    }
                }
            }
        ]));
        let derived = derive_predictions(&data, fixed_now()).unwrap();
        assert_eq!(derived.predictions[0].minutes, 5);
    }

    #[test]
    fn time_field_priority_falls_back_in_order() {
        let departure_only = envelope(json!([
            {
                "MonitoredVehicleJourney": {
                    "MonitoredCall": { "ExpectedDepartureTime": "2025-06-01T12:03:00Z" }
                }
            }
        ]));
        assert_eq!(
            derive_predictions(&departure_only, fixed_now()).unwrap().predictions[0].minutes,
            3
        );

        let aimed_only = envelope(json!([
            {
                "MonitoredVehicleJourney": {
                    "MonitoredCall": { "AimedArrivalTime": "2025-06-01T12:07:00Z" }
                }
            }
        ]));
        assert_eq!(
            derive_predictions(&aimed_only, fixed_now()).unwrap().predictions[0].minutes,
            7
        );
    }

    #[test]
    fn missing_fields_fall_back_to_unknown() {
        let data = envelope(json!([
            { "MonitoredVehicleJourney": {} },
            { "NotAJourney": true }
        ]));

        let derived = derive_predictions(&data, fixed_now()).unwrap();
        // The journeyless visit is skipped entirely
        assert_eq!(derived.predictions.len(), 1);
        assert_eq!(derived.predictions[0].destination, "Unknown");
        assert_eq!(derived.predictions[0].line_ref, "Unknown");
        assert_eq!(derived.predictions[0].minutes, 0);
    }

    #[test]
    fn line_ref_falls_back_to_published_name() {
        let data = envelope(json!([
            { "MonitoredVehicleJourney": { "PublishedLineName": "N JUDAH" } }
        ]));
        let derived = derive_predictions(&data, fixed_now()).unwrap();
        assert_eq!(derived.predictions[0].line_ref, "N JUDAH");
    }

    #[test]
    fn single_visit_is_treated_as_one_element_list() {
        let data = envelope(json!({
            "MonitoredVehicleJourney": {
                "DestinationName": "Caltrain Depot",
                "LineRef": "N",
                "MonitoredCall": {
                    "StopPointName": "King St & 4th St",
                    "ExpectedArrivalTime": "2025-06-01T12:02:00Z"
                }
            }
        }));

        let derived = derive_predictions(&data, fixed_now()).unwrap();
        assert_eq!(derived.predictions.len(), 1);
        assert_eq!(derived.station_name.as_deref(), Some("King St & 4th St"));
        assert_eq!(derived.predictions[0].minutes, 2);
    }

    #[test]
    fn countdown_splits_minutes_and_seconds() {
        let now = fixed_now();
        let target = Utc.with_ymd_and_hms(2025, 6, 1, 12, 2, 15).unwrap();
        assert_eq!(countdown(target, now), (2, 15));
        assert_eq!(countdown(now, now), (0, 0));
    }
}
