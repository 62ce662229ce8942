//! Behavioral events recorded against an experiment assignment.
//!
//! Events are immutable once appended. Timestamps are assigned at ingestion
//! by [`MonotonicClock`], never taken from the caller.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicI64, Ordering};

use crate::error::{ExperimentError, Result};

/// Event names that count as a completed flow.
pub const CONVERSION_EVENTS: [&str; 2] = ["conversion", "flow_completion"];

/// Free-form event properties. Values are JSON: null, bool, number, string,
/// or arrays/objects of the same.
pub type Properties = IndexMap<String, serde_json::Value>;

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub test_id: String,
    pub session_id: String,
    pub variant_id: String,
    pub event: String,
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub properties: Option<Properties>,
}

impl Event {
    pub fn is_conversion(&self) -> bool {
        CONVERSION_EVENTS.contains(&self.event.as_str())
    }
}

/// Caller-facing track payload. `variant` is the caller's sticky assignment.
#[derive(Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct TrackRequest {
    #[serde(default)]
    pub test_id: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub variant: Option<String>,
    #[serde(default)]
    pub event: Option<String>,
    #[serde(default)]
    pub properties: Option<Properties>,
}

/// A track request whose required fields have been checked.
#[derive(Clone, Debug)]
pub struct ValidTrack {
    pub test_id: String,
    pub session_id: String,
    pub variant_id: String,
    pub event: String,
    pub properties: Option<Properties>,
}

fn required(field: &str, value: Option<String>) -> Result<String> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(ExperimentError::Validation(format!("{field} is required"))),
    }
}

impl TrackRequest {
    pub fn from_json(value: serde_json::Value) -> Result<Self> {
        serde_json::from_value(value)
            .map_err(|e| ExperimentError::Validation(format!("invalid event body: {e}")))
    }

    pub fn validate(self) -> Result<ValidTrack> {
        Ok(ValidTrack {
            test_id: required("testId", self.test_id)?,
            session_id: required("sessionId", self.session_id)?,
            variant_id: required("variant", self.variant)?,
            event: required("event", self.event)?,
            properties: self.properties,
        })
    }
}

impl ValidTrack {
    pub fn into_event(self, timestamp: i64) -> Event {
        Event {
            test_id: self.test_id,
            session_id: self.session_id,
            variant_id: self.variant_id,
            event: self.event,
            timestamp,
            properties: self.properties,
        }
    }
}

/// Millisecond wall clock that never goes backwards within the process.
#[derive(Debug, Default)]
pub struct MonotonicClock {
    last: AtomicI64,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn now_ms(&self) -> i64 {
        self.observe(super::now_ms())
    }

    fn observe(&self, wall: i64) -> i64 {
        let prev = self.last.fetch_max(wall, Ordering::AcqRel);
        prev.max(wall)
    }
}
