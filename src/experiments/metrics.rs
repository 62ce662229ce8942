//! Per-variant descriptive metrics, recomputed from the raw event log.
//!
//! Nothing here is cached: a snapshot is a pure function of the events passed
//! in, so two calls over the same log are bit-identical.
//!
//! **Session duration:** `max(timestamp) - min(timestamp)` per session. A
//! session with a single event has duration 0 and still counts toward the
//! average, so `avg_session_duration` is the mean over *all* sessions.

use std::collections::{BTreeMap, HashMap};

use indexmap::IndexMap;
use serde::Serialize;

use super::event::Event;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VariantMetrics {
    pub test_id: String,
    pub variant_id: String,
    pub total_sessions: u64,
    pub total_events: u64,
    pub conversions: u64,
    /// Percentage, 0-100 for at most one conversion per session.
    pub conversion_rate: f64,
    /// Milliseconds.
    pub avg_session_duration: f64,
    /// Percentage of sessions with exactly one event.
    pub bounce_rate: f64,
    pub event_counts: BTreeMap<String, u64>,
}

/// Per-session raw aggregation (intermediate, before rate computation).
#[derive(Debug, Clone, Copy)]
struct SessionAgg {
    events: u64,
    first: i64,
    last: i64,
}

impl SessionAgg {
    fn new(ts: i64) -> Self {
        Self {
            events: 0,
            first: ts,
            last: ts,
        }
    }

    fn observe(&mut self, ts: i64) {
        self.events += 1;
        self.first = self.first.min(ts);
        self.last = self.last.max(ts);
    }

    fn duration(&self) -> i64 {
        if self.events < 2 {
            0
        } else {
            self.last - self.first
        }
    }
}

#[derive(Debug, Default)]
struct VariantAgg<'a> {
    sessions: HashMap<&'a str, SessionAgg>,
    total_events: u64,
    conversions: u64,
    event_counts: BTreeMap<String, u64>,
}

/// `part / whole * 100`, or 0 when `whole` is 0.
fn percentage(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64 * 100.0
    }
}

/// One entry per variant that appears in `events`, in order of first
/// appearance. Variants defined on the experiment but never seen in the log
/// produce no entry.
pub fn compute_metrics(test_id: &str, events: &[Event]) -> Vec<VariantMetrics> {
    let mut by_variant: IndexMap<&str, VariantAgg> = IndexMap::new();

    for e in events.iter().filter(|e| e.test_id == test_id) {
        let agg = by_variant.entry(e.variant_id.as_str()).or_default();
        agg.total_events += 1;
        if e.is_conversion() {
            agg.conversions += 1;
        }
        *agg.event_counts.entry(e.event.clone()).or_default() += 1;
        agg.sessions
            .entry(e.session_id.as_str())
            .or_insert_with(|| SessionAgg::new(e.timestamp))
            .observe(e.timestamp);
    }

    by_variant
        .into_iter()
        .map(|(variant_id, agg)| build_variant_metrics(test_id, variant_id, agg))
        .collect()
}

fn build_variant_metrics(test_id: &str, variant_id: &str, agg: VariantAgg<'_>) -> VariantMetrics {
    let total_sessions = agg.sessions.len() as u64;
    let bounces = agg.sessions.values().filter(|s| s.events == 1).count() as u64;

    // Summed as integers so the result does not depend on HashMap iteration order.
    let total_duration: i64 = agg.sessions.values().map(SessionAgg::duration).sum();
    let avg_session_duration = if total_sessions == 0 {
        0.0
    } else {
        total_duration as f64 / total_sessions as f64
    };

    VariantMetrics {
        test_id: test_id.to_string(),
        variant_id: variant_id.to_string(),
        total_sessions,
        total_events: agg.total_events,
        conversions: agg.conversions,
        conversion_rate: percentage(agg.conversions, total_sessions),
        avg_session_duration,
        bounce_rate: percentage(bounces, total_sessions),
        event_counts: agg.event_counts,
    }
}
