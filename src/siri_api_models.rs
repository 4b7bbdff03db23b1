// API models and normalization for the 511.org regional transit API
// 511 SF Bay Open Data portal: https://511.org/open-data/transit
//
// 511 API Endpoints:
// - Operators: https://api.511.org/transit/operators
// - Lines: https://api.511.org/transit/lines
// - Patterns (directions + journey patterns): https://api.511.org/transit/patterns
// - Stops: https://api.511.org/transit/stops
// - Stop Monitoring SIRI: https://api.511.org/transit/StopMonitoring

use reqwest::blocking;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

// ============================================================================
// Error Handling
// ============================================================================

#[derive(Debug)]
pub enum SignError {
    ConfigError,
    NetworkError(String),
    UpstreamError { status: u16, details: String },
    ShapeError(String),
    ParseError(String),
    FileError(String),
}

impl std::fmt::Display for SignError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignError::ConfigError => write!(f, "API key not configured"),
            SignError::NetworkError(e) => write!(f, "Network error: {}", e),
            SignError::UpstreamError { status, details } => {
                write!(f, "511 API error: {} ({})", status, details)
            }
            SignError::ShapeError(e) => write!(f, "Invalid API response: {}", e),
            SignError::ParseError(e) => write!(f, "Parse error: {}", e),
            SignError::FileError(e) => write!(f, "File error: {}", e),
        }
    }
}

impl std::error::Error for SignError {}

pub type Result<T> = std::result::Result<T, SignError>;

pub fn excerpt(body: &str, max: usize) -> String {
    if body.chars().count() <= max {
        body.to_string()
    } else {
        let cut: String = body.chars().take(max).collect();
        format!("{}...", cut)
    }
}

// ============================================================================
// Client-Facing Records
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Operator {
    pub id: String,
    pub name: String,
    pub short_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub primary_mode: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Line {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text_color: Option<String>,
}

impl Line {
    pub fn display_name(&self) -> String {
        self.name
            .clone()
            .or_else(|| self.public_code.clone())
            .unwrap_or_else(|| self.id.clone())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pattern {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line_ref: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub direction: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub direction_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub destination: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trip_count: Option<i64>,
    pub stops: Vec<PatternStop>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternStop {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order: Option<u32>,
}

// One record covers both stop retrieval modes; the side a mode does not
// know about stays None and is omitted from the JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Stop {
    pub code: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<StopLocation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopLocation {
    pub lat: f64,
    pub lng: f64,
}

// ============================================================================
// Upstream Shapes
// ============================================================================

// Identifier fields come back as strings or bare numbers depending on the
// operator's feed; both collapse to text.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum Stringish {
    Text(String),
    Int(i64),
    Float(f64),
}

impl Stringish {
    pub fn text(&self) -> String {
        match self {
            Stringish::Text(s) => s.clone(),
            Stringish::Int(n) => n.to_string(),
            Stringish::Float(x) => x.to_string(),
        }
    }
}

// Single records are served bare instead of as one-element lists.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany<T> {
    Many(Vec<T>),
    One(T),
}

impl<T> OneOrMany<T> {
    pub fn into_vec(self) -> Vec<T> {
        match self {
            OneOrMany::Many(v) => v,
            OneOrMany::One(x) => vec![x],
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RawOperator {
    pub id: Option<Stringish>,
    pub name: Option<String>,
    pub short_name: Option<String>,
    pub primary_mode: Option<String>,
    pub monitored: Option<bool>,
}

// The lines resource arrives in one of two shapes: a flat PascalCase array,
// or wrapped in dataObjects with a lowercase id field.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum LinesResponse {
    Flat(Vec<RawFlatLine>),
    Nested(NestedLines),
}

#[derive(Debug, Clone, Deserialize)]
pub struct NestedLines {
    #[serde(rename = "dataObjects")]
    pub data_objects: LineDataObjects,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LineDataObjects {
    #[serde(rename = "Line")]
    pub line: Option<OneOrMany<RawNestedLine>>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RawFlatLine {
    pub id: Option<Stringish>,
    pub name: Option<String>,
    pub public_code: Option<Stringish>,
    pub transport_mode: Option<String>,
    #[serde(alias = "Color")]
    pub colour: Option<String>,
    #[serde(alias = "TextColor")]
    pub text_colour: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RawNestedLine {
    #[serde(rename = "id")]
    pub id: Option<Stringish>,
    pub name: Option<String>,
    pub public_code: Option<Stringish>,
    pub transport_mode: Option<String>,
    #[serde(alias = "Color")]
    pub colour: Option<String>,
    #[serde(alias = "TextColor")]
    pub text_colour: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PatternsResponse {
    pub directions: Option<Vec<RawDirection>>,
    #[serde(rename = "journeyPatterns")]
    pub journey_patterns: Option<Vec<RawJourneyPattern>>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RawDirection {
    pub direction_id: Option<Stringish>,
    pub name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawJourneyPattern {
    #[serde(rename = "serviceJourneyPatternRef")]
    pub service_journey_pattern_ref: Option<Stringish>,
    #[serde(rename = "Name")]
    pub name: Option<String>,
    #[serde(rename = "LineRef")]
    pub line_ref: Option<Stringish>,
    #[serde(rename = "DirectionRef")]
    pub direction_ref: Option<Stringish>,
    #[serde(rename = "DestinationDisplayView")]
    pub destination_display_view: Option<RawDestinationDisplay>,
    #[serde(rename = "TripCount")]
    pub trip_count: Option<i64>,
    #[serde(rename = "PointsInSequence")]
    pub points_in_sequence: Option<RawPointsInSequence>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawDestinationDisplay {
    #[serde(rename = "FontText")]
    pub font_text: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawPointsInSequence {
    #[serde(rename = "StopPointInJourneyPattern")]
    pub stop_point_in_journey_pattern: Option<OneOrMany<RawPatternStop>>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RawPatternStop {
    pub scheduled_stop_point_ref: Option<Stringish>,
    pub name: Option<String>,
    pub order: Option<Stringish>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StopsDocument {
    #[serde(rename = "dataObjects")]
    pub data_objects: Option<StopDataObjects>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StopDataObjects {
    #[serde(rename = "ScheduledStopPoint")]
    pub scheduled_stop_point: Option<OneOrMany<RawScheduledStopPoint>>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RawScheduledStopPoint {
    #[serde(rename = "id")]
    pub id: Option<Stringish>,
    pub name: Option<String>,
    pub location: Option<RawStopLocation>,
    pub stop_type: Option<String>,
    pub url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RawStopLocation {
    pub latitude: Option<Stringish>,
    pub longitude: Option<Stringish>,
}

// ============================================================================
// Normalizers
// ============================================================================

pub fn normalize_operators(data: &Value) -> Result<Vec<Operator>> {
    let raw: Vec<RawOperator> = serde_json::from_value(data.clone())
        .map_err(|e| SignError::ParseError(format!("Expected an operator list: {}", e)))?;
    Ok(filter_operators(raw))
}

pub fn filter_operators(raw: Vec<RawOperator>) -> Vec<Operator> {
    raw.into_iter()
        .filter(|op| op.monitored != Some(false))
        .filter_map(|op| {
            let id = op.id?.text();
            let name = op.name?;
            if name.contains("Emergency") || name.contains("Test") {
                return None;
            }
            Some(Operator {
                id,
                short_name: op.short_name.unwrap_or_else(|| name.clone()),
                primary_mode: op.primary_mode,
                name,
            })
        })
        .collect()
}

pub fn normalize_lines(data: &Value) -> Vec<Line> {
    match serde_json::from_value::<LinesResponse>(data.clone()) {
        Ok(LinesResponse::Flat(raw)) => raw
            .into_iter()
            .filter_map(|line| {
                Some(Line {
                    id: line.id?.text(),
                    name: line.name,
                    public_code: line.public_code.map(|c| c.text()),
                    mode: line.transport_mode,
                    color: line.colour,
                    text_color: line.text_colour,
                })
            })
            .collect(),
        Ok(LinesResponse::Nested(nested)) => nested
            .data_objects
            .line
            .map(OneOrMany::into_vec)
            .unwrap_or_default()
            .into_iter()
            .filter_map(|line| {
                let public_code = line.public_code.map(|c| c.text());
                Some(Line {
                    id: line.id?.text(),
                    name: line.name.or_else(|| public_code.clone()),
                    public_code,
                    mode: line.transport_mode,
                    color: line.colour,
                    text_color: line.text_colour,
                })
            })
            .collect(),
        Err(_) => Vec::new(),
    }
}

pub fn normalize_patterns(data: &Value) -> Vec<Pattern> {
    let resp: PatternsResponse = match serde_json::from_value(data.clone()) {
        Ok(resp) => resp,
        Err(_) => return Vec::new(),
    };

    // Both halves are required to resolve human-readable directions.
    let (Some(directions), Some(journey_patterns)) = (resp.directions, resp.journey_patterns)
    else {
        return Vec::new();
    };

    let direction_names: HashMap<String, String> = directions
        .into_iter()
        .filter_map(|dir| Some((dir.direction_id?.text(), dir.name?)))
        .collect();

    journey_patterns
        .into_iter()
        .filter_map(|jp| {
            let id = jp.service_journey_pattern_ref?.text();
            let name = jp.name;
            let direction_id = jp.direction_ref.map(|r| r.text());
            let direction = direction_id
                .as_ref()
                .and_then(|id| direction_names.get(id).cloned())
                .or_else(|| direction_id.clone());
            let destination = jp
                .destination_display_view
                .and_then(|view| view.font_text)
                .or_else(|| name.clone());
            let stops = jp
                .points_in_sequence
                .and_then(|points| points.stop_point_in_journey_pattern)
                .map(OneOrMany::into_vec)
                .unwrap_or_default()
                .into_iter()
                .filter_map(|stop| {
                    Some(PatternStop {
                        id: stop.scheduled_stop_point_ref?.text(),
                        name: stop.name,
                        order: stop.order.and_then(|o| o.text().parse().ok()),
                    })
                })
                .collect();

            Some(Pattern {
                id,
                name,
                line_ref: jp.line_ref.map(|r| r.text()),
                direction,
                direction_id,
                destination,
                trip_count: jp.trip_count,
                stops,
            })
        })
        .collect()
}

pub fn normalize_stop_inventory(data: &Value) -> Vec<Stop> {
    let docs: Vec<StopsDocument> = match serde_json::from_value(data.clone()) {
        Ok(docs) => docs,
        Err(_) => return Vec::new(),
    };

    docs.into_iter()
        .next()
        .and_then(|doc| doc.data_objects)
        .and_then(|objects| objects.scheduled_stop_point)
        .map(OneOrMany::into_vec)
        .unwrap_or_default()
        .into_iter()
        .filter_map(|point| {
            let code = point.id?.text();
            let name = point.name.unwrap_or_else(|| format!("Stop {}", code));
            let location = point.location.and_then(|loc| {
                let lat = loc.latitude?.text().parse().ok()?;
                let lng = loc.longitude?.text().parse().ok()?;
                Some(StopLocation { lat, lng })
            });
            Some(Stop {
                code,
                name,
                order: None,
                location,
                stop_type: point.stop_type,
                url: point.url,
            })
        })
        .collect()
}

pub fn normalize_pattern_stops(data: &Value, pattern_id: &str) -> Vec<Stop> {
    let resp: PatternsResponse = match serde_json::from_value(data.clone()) {
        Ok(resp) => resp,
        Err(_) => return Vec::new(),
    };
    let Some(journey_patterns) = resp.journey_patterns else {
        return Vec::new();
    };

    let mut stops: Vec<Stop> = journey_patterns
        .into_iter()
        .find(|jp| {
            jp.service_journey_pattern_ref
                .as_ref()
                .map(|r| r.text())
                .as_deref()
                == Some(pattern_id)
        })
        .and_then(|jp| jp.points_in_sequence)
        .and_then(|points| points.stop_point_in_journey_pattern)
        .map(OneOrMany::into_vec)
        .unwrap_or_default()
        .into_iter()
        .filter_map(|stop| {
            let code = stop.scheduled_stop_point_ref?.text();
            let name = stop.name.unwrap_or_else(|| format!("Stop {}", code));
            Some(Stop {
                code,
                name,
                order: stop.order.and_then(|o| o.text().parse().ok()),
                location: None,
                stop_type: None,
                url: None,
            })
        })
        .collect();

    stops.sort_by_key(|stop| stop.order.unwrap_or(0));
    stops
}

// Narrows a raw monitoring envelope to the visits serving a given line.
// Matches the substring against either ref field; a bare single visit is
// treated as a one-element list.
pub fn filter_visits_by_line(data: &mut Value, line: &str) {
    let Some(visits_node) = data
        .pointer("/ServiceDelivery/StopMonitoringDelivery/MonitoredStopVisit")
        .cloned()
    else {
        return;
    };

    let visits = match visits_node {
        Value::Array(list) => list,
        other => vec![other],
    };

    let kept: Vec<Value> = visits
        .into_iter()
        .filter(|visit| {
            let journey = &visit["MonitoredVehicleJourney"];
            journey["LineRef"]
                .as_str()
                .map_or(false, |r| r.contains(line))
                || journey["PublishedLineName"]
                    .as_str()
                    .map_or(false, |n| n.contains(line))
        })
        .collect();

    if let Some(slot) =
        data.pointer_mut("/ServiceDelivery/StopMonitoringDelivery/MonitoredStopVisit")
    {
        *slot = Value::Array(kept);
    }
}

// ============================================================================
// Upstream Client
// ============================================================================

pub struct FiveOneOneApi;

impl FiveOneOneApi {
    pub const BASE_URL: &'static str = "https://api.511.org/transit";
    const REQUEST_TIMEOUT_SECS: u64 = 30;

    fn create_http_client() -> Result<blocking::Client> {
        blocking::Client::builder()
            .timeout(std::time::Duration::from_secs(Self::REQUEST_TIMEOUT_SECS))
            .build()
            .map_err(|e| SignError::NetworkError(format!("Failed to create HTTP client: {}", e)))
    }

    fn get_json(url: &str, api_key: &str) -> Result<Value> {
        println!("📡 GET {}", url.replace(api_key, "***"));

        let client = Self::create_http_client()?;

        let response = client
            .get(url)
            .header("Accept", "application/json")
            .send()
            .map_err(|e| SignError::NetworkError(format!("Request failed: {}", e)))?;

        let status = response.status();
        let body = response
            .text()
            .map_err(|e| SignError::NetworkError(format!("Failed to read response: {}", e)))?;

        if !status.is_success() {
            return Err(SignError::UpstreamError {
                status: status.as_u16(),
                details: excerpt(&body, 500),
            });
        }

        // 511 responses lead with a UTF-8 BOM
        let body = body.trim_start_matches('\u{feff}');

        serde_json::from_str(body)
            .map_err(|e| SignError::ParseError(format!("Invalid JSON response: {}", e)))
    }

    pub fn operators(api_key: &str) -> Result<Value> {
        let url = format!("{}/operators?api_key={}&format=json", Self::BASE_URL, api_key);
        Self::get_json(&url, api_key)
    }

    pub fn lines(api_key: &str, operator_id: &str) -> Result<Value> {
        let url = format!(
            "{}/lines?api_key={}&operator_id={}&format=json",
            Self::BASE_URL,
            api_key,
            operator_id
        );
        Self::get_json(&url, api_key)
    }

    pub fn patterns(api_key: &str, operator_id: &str, line_id: &str) -> Result<Value> {
        let url = format!(
            "{}/patterns?api_key={}&operator_id={}&line_id={}&format=json",
            Self::BASE_URL,
            api_key,
            operator_id,
            line_id
        );
        Self::get_json(&url, api_key)
    }

    pub fn pattern_stops(api_key: &str, operator_id: &str, pattern_id: &str) -> Result<Value> {
        let url = format!(
            "{}/patterns?api_key={}&operator_id={}&pattern_id={}&format=json",
            Self::BASE_URL,
            api_key,
            operator_id,
            pattern_id
        );
        Self::get_json(&url, api_key)
    }

    pub fn stop_inventory(api_key: &str, operator_id: &str) -> Result<Value> {
        let url = format!(
            "{}/stops?api_key={}&operator_id={}&format=json",
            Self::BASE_URL,
            api_key,
            operator_id
        );
        Self::get_json(&url, api_key)
    }

    pub fn stop_monitoring(api_key: &str, agency: &str, stop_code: Option<&str>) -> Result<Value> {
        let mut url = format!(
            "{}/StopMonitoring?api_key={}&agency={}",
            Self::BASE_URL,
            api_key,
            agency
        );
        if let Some(code) = stop_code {
            url.push_str(&format!("&stopCode={}", code));
        }
        Self::get_json(&url, api_key)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn operators_drop_unmonitored_and_test_entries() {
        let data = json!([
            { "Id": "SF", "Name": "San Francisco Muni", "ShortName": "Muni", "PrimaryMode": "bus", "Monitored": true },
            { "Id": "EM", "Name": "Emergency Ops", "Monitored": true },
            { "Id": "TD", "Name": "Test District", "Monitored": true },
            { "Id": "XX", "Name": "Ghost Transit", "Monitored": false },
            { "Id": "CT", "Name": "Caltrain" }
        ]);

        let operators = normalize_operators(&data).unwrap();
        let ids: Vec<&str> = operators.iter().map(|op| op.id.as_str()).collect();
        assert_eq!(ids, vec!["SF", "CT"]);
        assert_eq!(operators[0].short_name, "Muni");
        // ShortName falls back to the full name
        assert_eq!(operators[1].short_name, "Caltrain");
    }

    #[test]
    fn operators_without_monitored_flag_are_kept() {
        let data = json!([{ "Id": "GG", "Name": "Golden Gate Transit" }]);
        assert_eq!(normalize_operators(&data).unwrap().len(), 1);
    }

    #[test]
    fn operators_reject_non_list_bodies() {
        assert!(normalize_operators(&json!({ "unexpected": true })).is_err());
    }

    #[test]
    fn lines_flat_shape() {
        let data = json!([
            { "Id": "5", "Name": "5 FULTON", "PublicCode": "5", "TransportMode": "bus", "Colour": "D5103F", "TextColour": "FFFFFF" }
        ]);

        let lines = normalize_lines(&data);
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].id, "5");
        assert_eq!(lines[0].name.as_deref(), Some("5 FULTON"));
        assert_eq!(lines[0].color.as_deref(), Some("D5103F"));
    }

    #[test]
    fn lines_flat_shape_accepts_american_spelling() {
        let data = json!([{ "Id": "N", "Name": "N JUDAH", "Color": "003399" }]);
        assert_eq!(normalize_lines(&data)[0].color.as_deref(), Some("003399"));
    }

    #[test]
    fn lines_nested_shape_with_single_object() {
        let data = json!({
            "dataObjects": {
                "Line": { "id": "L1", "PublicCode": "1" }
            }
        });

        let lines = normalize_lines(&data);
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].id, "L1");
        // Name falls back to the public code in the nested shape
        assert_eq!(lines[0].name.as_deref(), Some("1"));
    }

    #[test]
    fn lines_nested_shape_with_list() {
        let data = json!({
            "dataObjects": {
                "Line": [
                    { "id": "L1", "Name": "One" },
                    { "id": "L2", "Name": "Two" }
                ]
            }
        });
        assert_eq!(normalize_lines(&data).len(), 2);
    }

    #[test]
    fn lines_unrecognized_shape_is_empty_not_error() {
        assert!(normalize_lines(&json!({ "somethingElse": 1 })).is_empty());
        assert!(normalize_lines(&json!("not even an object")).is_empty());
    }

    fn sample_patterns_response() -> Value {
        json!({
            "directions": [
                { "DirectionId": "IB", "Name": "Inbound" },
                { "DirectionId": "OB", "Name": "Outbound" }
            ],
            "journeyPatterns": [
                {
                    "serviceJourneyPatternRef": 290231,
                    "Name": "5 FULTON outbound",
                    "LineRef": "5",
                    "DirectionRef": "OB",
                    "DestinationDisplayView": { "FontText": "Ocean Beach" },
                    "TripCount": 112,
                    "PointsInSequence": {
                        "StopPointInJourneyPattern": [
                            { "ScheduledStopPointRef": "123", "Name": "Fulton & 46th Ave", "Order": "2" },
                            { "ScheduledStopPointRef": "120", "Name": "Transit Center", "Order": "1" }
                        ]
                    }
                },
                {
                    "serviceJourneyPatternRef": "290232",
                    "Name": "5 FULTON inbound",
                    "LineRef": "5",
                    "DirectionRef": "XX"
                }
            ]
        })
    }

    #[test]
    fn patterns_resolve_direction_names() {
        let patterns = normalize_patterns(&sample_patterns_response());
        assert_eq!(patterns.len(), 2);

        let outbound = &patterns[0];
        assert_eq!(outbound.id, "290231");
        assert_eq!(outbound.direction.as_deref(), Some("Outbound"));
        assert_eq!(outbound.destination.as_deref(), Some("Ocean Beach"));
        assert_eq!(outbound.stops.len(), 2);
        // Order is parsed from string form; the patterns endpoint does not sort
        assert_eq!(outbound.stops[0].order, Some(2));

        // Unmapped direction ids fall back to the raw ref
        assert_eq!(patterns[1].direction.as_deref(), Some("XX"));
        // Destination falls back to the pattern name
        assert_eq!(patterns[1].destination.as_deref(), Some("5 FULTON inbound"));
        assert!(patterns[1].stops.is_empty());
    }

    #[test]
    fn patterns_missing_directions_yield_empty_list() {
        let data = json!({ "journeyPatterns": [{ "serviceJourneyPatternRef": "1" }] });
        assert!(normalize_patterns(&data).is_empty());
    }

    #[test]
    fn patterns_missing_journey_patterns_yield_empty_list() {
        let data = json!({ "directions": [{ "DirectionId": "IB", "Name": "Inbound" }] });
        assert!(normalize_patterns(&data).is_empty());
    }

    #[test]
    fn stop_inventory_parses_string_coordinates() {
        let data = json!([
            {
                "dataObjects": {
                    "ScheduledStopPoint": [
                        {
                            "id": "13543",
                            "Name": "Market St & Castro St",
                            "Location": { "Latitude": "37.7625", "Longitude": "-122.435" },
                            "StopType": "onstreetBus",
                            "Url": "https://511.org"
                        },
                        { "id": "13544", "Name": "No Location" }
                    ]
                }
            }
        ]);

        let stops = normalize_stop_inventory(&data);
        assert_eq!(stops.len(), 2);
        let loc = stops[0].location.as_ref().unwrap();
        assert!((loc.lat - 37.7625).abs() < 1e-9);
        assert!((loc.lng + 122.435).abs() < 1e-9);
        assert!(stops[0].order.is_none());
        assert!(stops[1].location.is_none());
    }

    #[test]
    fn pattern_stops_are_sorted_with_missing_order_first() {
        let data = json!({
            "journeyPatterns": [
                {
                    "serviceJourneyPatternRef": "p1",
                    "PointsInSequence": {
                        "StopPointInJourneyPattern": [
                            { "ScheduledStopPointRef": "c", "Name": "Third", "Order": "3" },
                            { "ScheduledStopPointRef": "b", "Name": "Orderless" },
                            { "ScheduledStopPointRef": "a", "Name": "First", "Order": "1" }
                        ]
                    }
                },
                { "serviceJourneyPatternRef": "p2" }
            ]
        });

        let stops = normalize_pattern_stops(&data, "p1");
        let codes: Vec<&str> = stops.iter().map(|s| s.code.as_str()).collect();
        // Missing order defaults to 0
        assert_eq!(codes, vec!["b", "a", "c"]);
        assert!(stops.iter().all(|s| s.location.is_none()));
    }

    #[test]
    fn pattern_stops_unknown_pattern_is_empty() {
        let data = json!({ "journeyPatterns": [{ "serviceJourneyPatternRef": "p1" }] });
        assert!(normalize_pattern_stops(&data, "p9").is_empty());
    }

    fn monitoring_with_visits(visits: Value) -> Value {
        json!({
            "ServiceDelivery": {
                "StopMonitoringDelivery": { "MonitoredStopVisit": visits }
            }
        })
    }

    #[test]
    fn line_filter_matches_either_ref_field() {
        let mut data = monitoring_with_visits(json!([
            { "MonitoredVehicleJourney": { "LineRef": "SF:5", "PublishedLineName": "5 FULTON" } },
            { "MonitoredVehicleJourney": { "LineRef": "SF:N", "PublishedLineName": "N JUDAH" } },
            { "MonitoredVehicleJourney": { "PublishedLineName": "5R FULTON RAPID" } }
        ]));

        filter_visits_by_line(&mut data, "5");

        let kept = data
            .pointer("/ServiceDelivery/StopMonitoringDelivery/MonitoredStopVisit")
            .and_then(|v| v.as_array())
            .unwrap();
        assert_eq!(kept.len(), 2);
    }

    #[test]
    fn line_filter_mismatch_empties_the_list() {
        // One visit for the N while the sign filters on line 5
        let mut data = monitoring_with_visits(json!({
            "MonitoredVehicleJourney": { "PublishedLineName": "N" }
        }));

        filter_visits_by_line(&mut data, "5");

        let kept = data
            .pointer("/ServiceDelivery/StopMonitoringDelivery/MonitoredStopVisit")
            .and_then(|v| v.as_array())
            .unwrap();
        assert!(kept.is_empty());
    }

    #[test]
    fn line_filter_normalizes_single_visit_to_list() {
        let mut data = monitoring_with_visits(json!({
            "MonitoredVehicleJourney": { "LineRef": "5" }
        }));

        filter_visits_by_line(&mut data, "5");

        let kept = data
            .pointer("/ServiceDelivery/StopMonitoringDelivery/MonitoredStopVisit")
            .and_then(|v| v.as_array())
            .unwrap();
        assert_eq!(kept.len(), 1);
    }

    #[test]
    fn line_filter_leaves_missing_envelope_alone() {
        let mut data = json!({ "ServiceDelivery": {} });
        filter_visits_by_line(&mut data, "5");
        assert_eq!(data, json!({ "ServiceDelivery": {} }));
    }

    #[test]
    fn excerpt_truncates_long_bodies() {
        assert_eq!(excerpt("short", 10), "short");
        assert_eq!(excerpt("abcdefghij", 4), "abcd...");
    }
}
