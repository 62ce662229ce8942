//! The external surface over registry, assignment, event log and metrics.
//!
//! Status guards: completed experiments reject both assignment and tracking;
//! draft and paused experiments hand out the primary variant without
//! recording a sticky assignment. Tracking against an unknown (or deleted)
//! experiment is `NotFound`.
//!
//! Trust boundary: `track` checks that the reported variant exists on the
//! experiment. Whether it is the session's real assignment is only checked
//! when this process handed out that assignment itself; sessions bucketed
//! client-side are trusted. [`TrackPolicy`] decides what a detected mismatch
//! does.

use std::sync::{Arc, Mutex};

use serde::Serialize;

use super::assignment::{AssignmentTable, BucketSource, HashBucket, RandomBucket};
use super::config::{Experiment, ExperimentPatch, ExperimentStatus, NewExperiment};
use super::event::{Event, MonotonicClock, TrackRequest};
use super::metrics::{compute_metrics, VariantMetrics};
use super::registry::Registry;
use super::store::{ExperimentFilter, ExperimentStorage, MemoryStorage};
use crate::error::{ExperimentError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TrackPolicy {
    /// Accept the caller's variant; a mismatch with a server-side assignment is logged.
    #[default]
    TrustCaller,
    /// Reject events whose variant contradicts a server-side assignment.
    RejectMismatch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Bucketing {
    #[default]
    Random,
    Hash,
    Seeded(u64),
}

impl Bucketing {
    fn source(self) -> Box<dyn BucketSource> {
        match self {
            Bucketing::Random => Box::new(RandomBucket::from_entropy()),
            Bucketing::Hash => Box::new(HashBucket),
            Bucketing::Seeded(seed) => Box::new(RandomBucket::seeded(seed)),
        }
    }
}

impl std::str::FromStr for Bucketing {
    type Err = ExperimentError;

    fn from_str(value: &str) -> Result<Self> {
        match value.to_ascii_lowercase().as_str() {
            "random" => Ok(Bucketing::Random),
            "hash" => Ok(Bucketing::Hash),
            other => other
                .strip_prefix("seeded:")
                .and_then(|s| s.parse().ok())
                .map(Bucketing::Seeded)
                .ok_or_else(|| {
                    ExperimentError::Validation(format!(
                        "invalid bucketing '{value}', expected random, hash or seeded:<u64>"
                    ))
                }),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub seed_default: bool,
    pub bucketing: Bucketing,
    pub track_policy: TrackPolicy,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            seed_default: true,
            bucketing: Bucketing::default(),
            track_policy: TrackPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AssignOutcome {
    pub test_id: String,
    pub session_id: String,
    pub variant: String,
    /// False when the experiment is not running and the default variant was served.
    pub sticky: bool,
}

pub struct ExperimentService {
    registry: Registry,
    assignments: AssignmentTable,
    bucket: Mutex<Box<dyn BucketSource>>,
    clock: MonotonicClock,
    config: ServiceConfig,
}

fn require<'a>(field: &str, value: &'a str) -> Result<&'a str> {
    if value.trim().is_empty() {
        Err(ExperimentError::Validation(format!("{field} is required")))
    } else {
        Ok(value)
    }
}

impl ExperimentService {
    pub fn new(storage: Arc<dyn ExperimentStorage>, config: ServiceConfig) -> Self {
        Self {
            registry: Registry::new(storage),
            assignments: AssignmentTable::new(),
            bucket: Mutex::new(config.bucketing.source()),
            clock: MonotonicClock::new(),
            config,
        }
    }

    pub fn in_memory(config: ServiceConfig) -> Self {
        Self::new(Arc::new(MemoryStorage::new()), config)
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    /// Seeds the default experiment when enabled and the store is empty.
    pub fn bootstrap(&self) -> Result<Option<Experiment>> {
        if !self.config.seed_default {
            return Ok(None);
        }
        self.registry.seed_default()
    }

    pub fn create_test(&self, input: NewExperiment) -> Result<Experiment> {
        self.registry.create(input)
    }

    pub fn update_test(&self, id: &str, patch: ExperimentPatch) -> Result<Experiment> {
        self.registry.update(require("testId", id)?, patch)
    }

    pub fn get_test(&self, id: &str) -> Result<Experiment> {
        self.registry.get(require("testId", id)?)
    }

    pub fn list_tests(&self, status: Option<ExperimentStatus>) -> Result<Vec<Experiment>> {
        self.registry.list(&ExperimentFilter { status })
    }

    pub fn test_count(&self) -> Result<usize> {
        self.registry.storage().experiment_count()
    }

    /// Sticky assignments this process currently holds.
    pub fn assignment_count(&self) -> usize {
        self.assignments.count()
    }

    /// Removes the experiment, its events and this process's assignments for it.
    pub fn delete_test(&self, id: &str) -> Result<()> {
        self.registry.delete(require("testId", id)?)?;
        let evicted = self.assignments.evict_test(id);
        tracing::debug!(test_id = %id, evicted, "assignments evicted");
        Ok(())
    }

    pub fn start_test(&self, id: &str) -> Result<Experiment> {
        self.transition_from(id, &[ExperimentStatus::Draft], ExperimentStatus::Active)
    }

    pub fn pause_test(&self, id: &str) -> Result<Experiment> {
        self.transition_from(id, &[ExperimentStatus::Active], ExperimentStatus::Paused)
    }

    pub fn resume_test(&self, id: &str) -> Result<Experiment> {
        self.transition_from(id, &[ExperimentStatus::Paused], ExperimentStatus::Active)
    }

    pub fn complete_test(&self, id: &str) -> Result<Experiment> {
        self.transition_from(
            id,
            &[ExperimentStatus::Active, ExperimentStatus::Paused],
            ExperimentStatus::Completed,
        )
    }

    fn transition_from(
        &self,
        id: &str,
        allowed: &[ExperimentStatus],
        next: ExperimentStatus,
    ) -> Result<Experiment> {
        self.registry.transition_from(require("testId", id)?, allowed, next)
    }

    pub fn assign(&self, test_id: &str, session_id: &str) -> Result<AssignOutcome> {
        let test_id = require("testId", test_id)?;
        let session_id = require("sessionId", session_id)?;
        let experiment = self.registry.get(test_id)?;

        match experiment.status {
            ExperimentStatus::Completed => Err(ExperimentError::InvalidStatus(format!(
                "experiment {test_id} is completed"
            ))),
            ExperimentStatus::Active => {
                let assignment = self.assignments.get_or_assign(&experiment, session_id, || {
                    // A poisoned RNG is still a usable RNG.
                    let mut bucket = self.bucket.lock().unwrap_or_else(|p| p.into_inner());
                    bucket.draw(test_id, session_id)
                });
                tracing::debug!(
                    test_id = %test_id,
                    session_id = %session_id,
                    variant = %assignment.variant_id,
                    "variant assigned"
                );
                Ok(AssignOutcome {
                    test_id: test_id.to_string(),
                    session_id: session_id.to_string(),
                    variant: assignment.variant_id,
                    sticky: true,
                })
            }
            status => {
                tracing::debug!(test_id = %test_id, %status, "experiment not running, serving default variant");
                Ok(AssignOutcome {
                    test_id: test_id.to_string(),
                    session_id: session_id.to_string(),
                    variant: experiment.primary_variant().id.clone(),
                    sticky: false,
                })
            }
        }
    }

    /// The status, variant and assignment checks run against the experiment
    /// as stored at append time; a concurrent delete or completion either
    /// precedes the event or follows it.
    pub fn track(&self, request: TrackRequest) -> Result<Event> {
        let valid = request.validate()?;
        let event = valid.into_event(self.clock.now_ms());
        let admit = |experiment: &Experiment| self.admit(experiment, &event);
        self.registry.storage().append_event(event.clone(), &admit)?;
        tracing::debug!(
            test_id = %event.test_id,
            session_id = %event.session_id,
            variant = %event.variant_id,
            event = %event.event,
            "event tracked"
        );
        Ok(event)
    }

    fn admit(&self, experiment: &Experiment, event: &Event) -> Result<()> {
        if experiment.status.is_terminal() {
            return Err(ExperimentError::InvalidStatus(format!(
                "experiment {} is completed",
                experiment.id
            )));
        }
        if experiment.variant(&event.variant_id).is_none() {
            return Err(ExperimentError::Validation(format!(
                "variant '{}' is not defined on experiment {}",
                event.variant_id, experiment.id
            )));
        }
        if let Some(known) = self.assignments.get(&event.test_id, &event.session_id) {
            if known.variant_id != event.variant_id {
                match self.config.track_policy {
                    TrackPolicy::RejectMismatch => {
                        return Err(ExperimentError::Validation(format!(
                            "session {} is assigned to '{}', not '{}'",
                            event.session_id, known.variant_id, event.variant_id
                        )));
                    }
                    TrackPolicy::TrustCaller => tracing::warn!(
                        test_id = %event.test_id,
                        session_id = %event.session_id,
                        assigned = %known.variant_id,
                        reported = %event.variant_id,
                        "tracked variant differs from server-side assignment"
                    ),
                }
            }
        }
        Ok(())
    }

    /// Recomputed from the event log on every call. Unknown ids yield an empty list.
    pub fn metrics(&self, test_id: &str) -> Result<Vec<VariantMetrics>> {
        let test_id = require("testId", test_id)?;
        let events = self.registry.storage().events_for(test_id)?;
        Ok(compute_metrics(test_id, &events))
    }
}
