use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use dashmap::DashMap;
use indexmap::IndexMap;

use super::config::{Experiment, ExperimentStatus};
use super::event::Event;
use crate::error::{ExperimentError, Result};

#[derive(Debug, Clone, Default)]
pub struct ExperimentFilter {
    pub status: Option<ExperimentStatus>,
}

impl ExperimentFilter {
    fn matches(&self, experiment: &Experiment) -> bool {
        match self.status {
            Some(status) => experiment.status == status,
            None => true,
        }
    }
}

/// Read-modify-write applied to a copy of the stored experiment. Nothing is
/// stored when it fails.
pub type ExperimentMutation<'a> = Box<dyn FnOnce(&mut Experiment) -> Result<()> + 'a>;

/// Gate run against the owning experiment before an event is appended.
pub type EventAdmission<'a> = &'a dyn Fn(&Experiment) -> Result<()>;

/// Capability set shared by every backend: experiments keyed by id, and an
/// append-only event log partitioned by experiment id.
///
/// Mutations of an experiment run under the experiment map's write lock.
/// Appends hold its read lock from the existence check to the push, so a
/// removal never interleaves with an append for the same experiment.
pub trait ExperimentStorage: Send + Sync {
    fn insert_experiment(&self, experiment: Experiment) -> Result<Experiment>;
    fn get_experiment(&self, id: &str) -> Result<Experiment>;
    /// Insertion order.
    fn list_experiments(&self, filter: &ExperimentFilter) -> Result<Vec<Experiment>>;
    fn update_experiment(&self, id: &str, apply: ExperimentMutation<'_>) -> Result<Experiment>;
    /// Removes the experiment together with its event log, returning the
    /// experiment and how many events went.
    fn remove_experiment(&self, id: &str) -> Result<(Experiment, usize)>;
    fn experiment_count(&self) -> Result<usize>;

    /// Appends `event` if its experiment exists and `admit` accepts it.
    fn append_event(&self, event: Event, admit: EventAdmission<'_>) -> Result<()>;
    /// Snapshot of every event for `test_id`, in append order.
    fn events_for(&self, test_id: &str) -> Result<Vec<Event>>;
}

/// Process-local backend. Experiments sit behind one lock; events are sharded
/// per experiment so appends to different tests do not contend.
#[derive(Default)]
pub struct MemoryStorage {
    pub(super) experiments: RwLock<IndexMap<String, Experiment>>,
    pub(super) events: DashMap<String, Vec<Event>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, IndexMap<String, Experiment>>> {
        self.experiments
            .read()
            .map_err(|_| ExperimentError::Internal("experiment map lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, IndexMap<String, Experiment>>> {
        self.experiments
            .write()
            .map_err(|_| ExperimentError::Internal("experiment map lock poisoned".to_string()))
    }

    /// Shared by every backend; `persist` runs under the write lock, before
    /// the map changes.
    pub(super) fn insert_with(
        &self,
        experiment: Experiment,
        persist: impl FnOnce(&Experiment) -> Result<()>,
    ) -> Result<Experiment> {
        let mut map = self.write()?;
        if map.contains_key(&experiment.id) {
            return Err(ExperimentError::Validation(format!(
                "experiment already exists: {}",
                experiment.id
            )));
        }
        persist(&experiment)?;
        map.insert(experiment.id.clone(), experiment.clone());
        Ok(experiment)
    }

    pub(super) fn update_with(
        &self,
        id: &str,
        apply: ExperimentMutation<'_>,
        persist: impl FnOnce(&Experiment) -> Result<()>,
    ) -> Result<Experiment> {
        let mut map = self.write()?;
        let slot = map
            .get_mut(id)
            .ok_or_else(|| ExperimentError::NotFound(id.to_string()))?;
        let mut next = slot.clone();
        apply(&mut next)?;
        persist(&next)?;
        *slot = next.clone();
        Ok(next)
    }

    pub(super) fn remove_with(
        &self,
        id: &str,
        unpersist: impl FnOnce(&str) -> Result<()>,
    ) -> Result<(Experiment, usize)> {
        let mut map = self.write()?;
        if !map.contains_key(id) {
            return Err(ExperimentError::NotFound(id.to_string()));
        }
        unpersist(id)?;
        // shift_remove keeps the remaining insertion order intact
        let removed = map
            .shift_remove(id)
            .ok_or_else(|| ExperimentError::NotFound(id.to_string()))?;
        let purged = self
            .events
            .remove(id)
            .map(|(_, log)| log.len())
            .unwrap_or(0);
        Ok((removed, purged))
    }

    pub(super) fn append_with(
        &self,
        event: Event,
        admit: EventAdmission<'_>,
        persist: impl FnOnce(&Event) -> Result<()>,
    ) -> Result<()> {
        let map = self.read()?;
        let experiment = map
            .get(&event.test_id)
            .ok_or_else(|| ExperimentError::NotFound(event.test_id.clone()))?;
        admit(experiment)?;
        // The shard guard orders persistence and the in-memory push together.
        let mut log = self.events.entry(event.test_id.clone()).or_default();
        persist(&event)?;
        log.push(event);
        Ok(())
    }
}

impl ExperimentStorage for MemoryStorage {
    fn insert_experiment(&self, experiment: Experiment) -> Result<Experiment> {
        self.insert_with(experiment, |_| Ok(()))
    }

    fn get_experiment(&self, id: &str) -> Result<Experiment> {
        self.read()?
            .get(id)
            .cloned()
            .ok_or_else(|| ExperimentError::NotFound(id.to_string()))
    }

    fn list_experiments(&self, filter: &ExperimentFilter) -> Result<Vec<Experiment>> {
        Ok(self
            .read()?
            .values()
            .filter(|e| filter.matches(e))
            .cloned()
            .collect())
    }

    fn update_experiment(&self, id: &str, apply: ExperimentMutation<'_>) -> Result<Experiment> {
        self.update_with(id, apply, |_| Ok(()))
    }

    fn remove_experiment(&self, id: &str) -> Result<(Experiment, usize)> {
        self.remove_with(id, |_| Ok(()))
    }

    fn experiment_count(&self) -> Result<usize> {
        Ok(self.read()?.len())
    }

    fn append_event(&self, event: Event, admit: EventAdmission<'_>) -> Result<()> {
        self.append_with(event, admit, |_| Ok(()))
    }

    fn events_for(&self, test_id: &str) -> Result<Vec<Event>> {
        Ok(self
            .events
            .get(test_id)
            .map(|log| log.value().clone())
            .unwrap_or_default())
    }
}
