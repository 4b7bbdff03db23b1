// The four-level stop selection (operator → line → pattern → stop), its
// on-disk store, and the shared-link resolver.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

use crate::siri_api_models::{self, FiveOneOneApi, Result, SignError};

// ============================================================================
// Selection Records
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperatorChoice {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineChoice {
    pub id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternChoice {
    pub id: String,
    pub name: String,
    pub direction: String,
    pub destination: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StopChoice {
    pub code: String,
    pub name: String,
}

// All four levels are required fields, so a Selection that deserializes at
// all is complete; partial payloads are rejected at the parse step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Selection {
    pub operator: OperatorChoice,
    pub line: LineChoice,
    pub pattern: PatternChoice,
    pub stop: StopChoice,
}

// ============================================================================
// Selection Store
// ============================================================================

pub struct SelectionStore {
    path: PathBuf,
}

impl SelectionStore {
    pub fn open_default() -> Self {
        let mut path = dirs::cache_dir().unwrap_or_else(|| PathBuf::from("."));
        path.push("transit-sign");
        fs::create_dir_all(&path).ok();
        path.push("selection.json");
        SelectionStore { path }
    }

    pub fn at_path(path: PathBuf) -> Self {
        SelectionStore { path }
    }

    pub fn load(&self) -> Option<Selection> {
        if !self.path.exists() {
            return None;
        }

        match fs::read_to_string(&self.path) {
            Ok(contents) => match serde_json::from_str(&contents) {
                Ok(selection) => Some(selection),
                Err(e) => {
                    println!("⚠️  Failed to parse saved selection ({}), ignoring it", e);
                    None
                }
            },
            Err(e) => {
                println!("⚠️  Failed to read saved selection ({}), ignoring it", e);
                None
            }
        }
    }

    pub fn save(&self, selection: &Selection) -> Result<()> {
        let json = serde_json::to_string_pretty(selection)
            .map_err(|e| SignError::FileError(format!("Failed to serialize selection: {}", e)))?;

        fs::write(&self.path, json)
            .map_err(|e| SignError::FileError(format!("Failed to write selection: {}", e)))?;

        println!("✓ Selection saved to {:?}", self.path);
        Ok(())
    }

    pub fn clear(&self) {
        if self.path.exists() {
            fs::remove_file(&self.path).ok();
        }
    }
}

// ============================================================================
// Shared-Link Resolver
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct SharedStopQuery {
    pub operator: String,
    pub line: String,
    pub pattern: String,
    pub stop: String,
}

// Resolves a deep link top-down against the live API. Runs once per page
// load; any lookup miss yields None and the caller falls back to whatever
// selection was persisted.
pub fn resolve_shared_stop(api_key: &str, query: &SharedStopQuery) -> Result<Option<Selection>> {
    let operators = siri_api_models::normalize_operators(&FiveOneOneApi::operators(api_key)?)?;
    let Some(operator) = operators.into_iter().find(|op| op.id == query.operator) else {
        println!("⚠️  Shared stop: operator {} not found", query.operator);
        return Ok(None);
    };

    let lines = siri_api_models::normalize_lines(&FiveOneOneApi::lines(api_key, &operator.id)?);
    let Some(line) = lines.into_iter().find(|l| l.id == query.line) else {
        println!("⚠️  Shared stop: line {} not found", query.line);
        return Ok(None);
    };

    let patterns = siri_api_models::normalize_patterns(&FiveOneOneApi::patterns(
        api_key,
        &operator.id,
        &line.id,
    )?);
    let Some(pattern) = patterns.into_iter().find(|p| p.id == query.pattern) else {
        println!("⚠️  Shared stop: pattern {} not found", query.pattern);
        return Ok(None);
    };

    let stops = siri_api_models::normalize_pattern_stops(
        &FiveOneOneApi::pattern_stops(api_key, &operator.id, &pattern.id)?,
        &pattern.id,
    );
    let Some(stop) = stops.into_iter().find(|s| s.code == query.stop) else {
        println!("⚠️  Shared stop: stop {} not found", query.stop);
        return Ok(None);
    };

    let line_name = line.display_name();
    Ok(Some(Selection {
        operator: OperatorChoice {
            id: operator.id,
            name: operator.name,
        },
        line: LineChoice {
            id: line.id,
            name: line_name,
            color: line.color,
        },
        pattern: PatternChoice {
            name: pattern.name.clone().unwrap_or_else(|| pattern.id.clone()),
            direction: pattern.direction.unwrap_or_default(),
            destination: pattern.destination.unwrap_or_default(),
            id: pattern.id,
        },
        stop: StopChoice {
            code: stop.code,
            name: stop.name,
        },
    }))
}

// ============================================================================
// Tests
// ============================================================================
