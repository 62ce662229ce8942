use std::sync::Arc;

use super::config::{
    build_variants, generate_experiment_id, normalize_metrics, Experiment, ExperimentPatch,
    ExperimentStatus, NewExperiment, DEFAULT_TRAFFIC_SPLIT,
};
use super::now_ms;
use super::store::{ExperimentFilter, ExperimentStorage};
use crate::error::{ExperimentError, Result};

/// Owns experiment definitions and their lifecycle.
#[derive(Clone)]
pub struct Registry {
    storage: Arc<dyn ExperimentStorage>,
}

impl Registry {
    pub fn new(storage: Arc<dyn ExperimentStorage>) -> Self {
        Self { storage }
    }

    pub fn storage(&self) -> &Arc<dyn ExperimentStorage> {
        &self.storage
    }

    pub fn create(&self, input: NewExperiment) -> Result<Experiment> {
        let name = input
            .name
            .map(|n| n.trim().to_string())
            .filter(|n| !n.is_empty())
            .ok_or_else(|| ExperimentError::Validation("name is required".to_string()))?;
        let variants = input
            .variants
            .ok_or_else(|| ExperimentError::Validation("variants are required".to_string()))?;
        let variants = build_variants(variants)?;

        let now = now_ms();
        let experiment = Experiment {
            id: generate_experiment_id(now),
            name,
            description: input.description.unwrap_or_default(),
            status: ExperimentStatus::Draft,
            variants,
            traffic_split: input.traffic_split.unwrap_or(DEFAULT_TRAFFIC_SPLIT),
            start_date: now,
            end_date: None,
            target_metrics: normalize_metrics(input.target_metrics.unwrap_or_default()),
            created_at: now,
            updated_at: now,
        };
        experiment.validate()?;
        let created = self.storage.insert_experiment(experiment)?;
        tracing::info!(
            test_id = %created.id,
            variants = created.variants.len(),
            traffic_split = created.traffic_split,
            "experiment created"
        );
        Ok(created)
    }

    /// Shallow merge; the merged experiment must still be valid and any status
    /// change must be a legal transition. Runs as one locked read-modify-write.
    pub fn update(&self, id: &str, patch: ExperimentPatch) -> Result<Experiment> {
        let updated = self.storage.update_experiment(
            id,
            Box::new(move |experiment: &mut Experiment| {
                if let Some(name) = patch.name {
                    experiment.name = name.trim().to_string();
                }
                if let Some(description) = patch.description {
                    experiment.description = description;
                }
                if let Some(variants) = patch.variants {
                    experiment.variants = build_variants(variants)?;
                }
                if let Some(split) = patch.traffic_split {
                    experiment.traffic_split = split;
                }
                if let Some(metrics) = patch.target_metrics {
                    experiment.target_metrics = normalize_metrics(metrics);
                }
                if let Some(end_date) = patch.end_date {
                    experiment.end_date = Some(end_date);
                }
                if let Some(next) = patch.status {
                    apply_transition(experiment, next)?;
                }
                experiment.updated_at = now_ms();
                experiment.validate()
            }),
        )?;
        tracing::info!(test_id = %updated.id, status = %updated.status, "experiment updated");
        Ok(updated)
    }

    pub fn get(&self, id: &str) -> Result<Experiment> {
        self.storage.get_experiment(id)
    }

    pub fn list(&self, filter: &ExperimentFilter) -> Result<Vec<Experiment>> {
        self.storage.list_experiments(filter)
    }

    /// Removes the experiment and every event recorded against it.
    pub fn delete(&self, id: &str) -> Result<Experiment> {
        let (removed, purged) = self.storage.remove_experiment(id)?;
        tracing::info!(test_id = %id, events_purged = purged, "experiment deleted");
        Ok(removed)
    }

    pub fn transition(&self, id: &str, next: ExperimentStatus) -> Result<Experiment> {
        self.change_status(id, None, next)
    }

    /// Like [`Registry::transition`], but also requires the current status to
    /// be one of `allowed`. The check and the write happen under one lock.
    pub fn transition_from(
        &self,
        id: &str,
        allowed: &[ExperimentStatus],
        next: ExperimentStatus,
    ) -> Result<Experiment> {
        self.change_status(id, Some(allowed), next)
    }

    fn change_status(
        &self,
        id: &str,
        allowed: Option<&[ExperimentStatus]>,
        next: ExperimentStatus,
    ) -> Result<Experiment> {
        let updated = self.storage.update_experiment(
            id,
            Box::new(move |experiment: &mut Experiment| {
                if let Some(allowed) = allowed {
                    if !allowed.contains(&experiment.status) {
                        return Err(ExperimentError::InvalidStatus(format!(
                            "experiment {} is {}, cannot move to {}",
                            experiment.id, experiment.status, next
                        )));
                    }
                }
                apply_transition(experiment, next)?;
                experiment.updated_at = now_ms();
                Ok(())
            }),
        )?;
        tracing::info!(test_id = %id, status = %next, "experiment status changed");
        Ok(updated)
    }

    /// Inserts the default active experiment when the registry is empty.
    pub fn seed_default(&self) -> Result<Option<Experiment>> {
        if self.storage.experiment_count()? > 0 {
            return Ok(None);
        }
        let seeded = self
            .storage
            .insert_experiment(Experiment::seeded_default(now_ms()))?;
        tracing::info!(test_id = %seeded.id, "seeded default experiment");
        Ok(Some(seeded))
    }
}

fn apply_transition(experiment: &mut Experiment, next: ExperimentStatus) -> Result<()> {
    if experiment.status == next && !next.is_terminal() {
        return Ok(());
    }
    if !experiment.status.can_transition_to(next) {
        return Err(ExperimentError::InvalidStatus(format!(
            "experiment {} cannot move from {} to {}",
            experiment.id, experiment.status, next
        )));
    }
    let now = now_ms();
    match next {
        ExperimentStatus::Active if experiment.status == ExperimentStatus::Draft => {
            experiment.start_date = now;
        }
        ExperimentStatus::Completed if experiment.end_date.is_none() => {
            experiment.end_date = Some(now);
        }
        _ => {}
    }
    experiment.status = next;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::experiments::config::NewVariant;
    use crate::experiments::event::Event;
    use crate::experiments::store::MemoryStorage;

    fn registry() -> Registry {
        Registry::new(Arc::new(MemoryStorage::new()))
    }

    fn variant(name: &str, weight: f64) -> NewVariant {
        NewVariant {
            name: name.to_string(),
            weight: Some(weight),
            ..Default::default()
        }
    }

    fn new_experiment(name: &str) -> NewExperiment {
        NewExperiment {
            name: Some(name.to_string()),
            description: Some("hotel search layout".to_string()),
            variants: Some(vec![variant("Control", 50.0), variant("Map first", 50.0)]),
            traffic_split: Some(30.0),
            target_metrics: Some(vec!["conversion".to_string(), "conversion".to_string()]),
        }
    }

    #[test]
    fn create_sets_draft_and_timestamps() {
        let reg = registry();
        let e = reg.create(new_experiment("Search layout")).unwrap();
        assert_eq!(e.status, ExperimentStatus::Draft);
        assert!(e.id.starts_with("exp_"));
        assert_eq!(e.variants.len(), 2);
        assert_eq!(e.variants[1].id, "map_first");
        assert_eq!(e.traffic_split, 30.0);
        assert_eq!(e.target_metrics.len(), 1);
        assert_eq!(e.created_at, e.updated_at);
        assert_eq!(reg.get(&e.id).unwrap(), e);
    }

    #[test]
    fn create_defaults_traffic_split_to_fifty() {
        let reg = registry();
        let mut input = new_experiment("x");
        input.traffic_split = None;
        assert_eq!(reg.create(input).unwrap().traffic_split, 50.0);
    }

    #[test]
    fn create_without_variants_fails() {
        let reg = registry();
        let mut input = new_experiment("x");
        input.variants = None;
        assert!(matches!(reg.create(input), Err(ExperimentError::Validation(_))));
        let mut input = new_experiment("x");
        input.variants = Some(vec![]);
        assert!(matches!(reg.create(input), Err(ExperimentError::Validation(_))));
    }

    #[test]
    fn create_without_name_fails() {
        let reg = registry();
        let mut input = new_experiment("x");
        input.name = Some("  ".to_string());
        assert!(matches!(reg.create(input), Err(ExperimentError::Validation(_))));
    }

    #[test]
    fn update_merges_only_given_fields() {
        let reg = registry();
        let e = reg.create(new_experiment("before")).unwrap();
        let updated = reg
            .update(
                &e.id,
                ExperimentPatch {
                    name: Some("after".to_string()),
                    traffic_split: Some(10.0),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(updated.name, "after");
        assert_eq!(updated.traffic_split, 10.0);
        assert_eq!(updated.description, e.description);
        assert_eq!(updated.variants, e.variants);
        assert!(updated.updated_at >= e.updated_at);
    }

    #[test]
    fn update_unknown_is_not_found() {
        let reg = registry();
        assert!(matches!(
            reg.update("ghost", ExperimentPatch::default()),
            Err(ExperimentError::NotFound(_))
        ));
    }

    #[test]
    fn update_revalidates_merged_experiment() {
        let reg = registry();
        let e = reg.create(new_experiment("x")).unwrap();
        let bad = ExperimentPatch {
            variants: Some(vec![variant("only", 60.0)]),
            ..Default::default()
        };
        assert!(matches!(reg.update(&e.id, bad), Err(ExperimentError::Validation(_))));
        assert_eq!(reg.get(&e.id).unwrap().variants.len(), 2);
    }

    #[test]
    fn update_rejects_illegal_status_change() {
        let reg = registry();
        let e = reg.create(new_experiment("x")).unwrap();
        let patch = ExperimentPatch {
            status: Some(ExperimentStatus::Completed),
            ..Default::default()
        };
        assert!(matches!(
            reg.update(&e.id, patch),
            Err(ExperimentError::InvalidStatus(_))
        ));
    }

    #[test]
    fn lifecycle_runs_draft_active_paused_active_completed() {
        let reg = registry();
        let e = reg.create(new_experiment("x")).unwrap();
        assert_eq!(reg.transition(&e.id, ExperimentStatus::Active).unwrap().status, ExperimentStatus::Active);
        assert_eq!(reg.transition(&e.id, ExperimentStatus::Paused).unwrap().status, ExperimentStatus::Paused);
        assert_eq!(reg.transition(&e.id, ExperimentStatus::Active).unwrap().status, ExperimentStatus::Active);
        let done = reg.transition(&e.id, ExperimentStatus::Completed).unwrap();
        assert_eq!(done.status, ExperimentStatus::Completed);
        assert!(done.end_date.is_some());
        assert!(matches!(
            reg.transition(&e.id, ExperimentStatus::Active),
            Err(ExperimentError::InvalidStatus(_))
        ));
    }

    #[test]
    fn complete_keeps_explicit_end_date() {
        let reg = registry();
        let e = reg.create(new_experiment("x")).unwrap();
        reg.update(
            &e.id,
            ExperimentPatch {
                end_date: Some(42),
                status: Some(ExperimentStatus::Active),
                ..Default::default()
            },
        )
        .unwrap();
        let done = reg.transition(&e.id, ExperimentStatus::Completed).unwrap();
        assert_eq!(done.end_date, Some(42));
    }

    #[test]
    fn delete_cascades_to_events() {
        let reg = registry();
        let e = reg.create(new_experiment("x")).unwrap();
        reg.storage()
            .append_event(
                Event {
                    test_id: e.id.clone(),
                    session_id: "s1".to_string(),
                    variant_id: "control".to_string(),
                    event: "page_view".to_string(),
                    timestamp: 1,
                    properties: None,
                },
                &|_: &Experiment| Ok(()),
            )
            .unwrap();
        reg.delete(&e.id).unwrap();
        assert!(reg.storage().events_for(&e.id).unwrap().is_empty());
        assert!(matches!(reg.get(&e.id), Err(ExperimentError::NotFound(_))));
        assert!(matches!(reg.delete(&e.id), Err(ExperimentError::NotFound(_))));
    }

    #[test]
    fn transition_from_checks_source_status() {
        let reg = registry();
        let e = reg.create(new_experiment("x")).unwrap();
        assert!(matches!(
            reg.transition_from(&e.id, &[ExperimentStatus::Paused], ExperimentStatus::Active),
            Err(ExperimentError::InvalidStatus(_))
        ));
        assert_eq!(reg.get(&e.id).unwrap().status, ExperimentStatus::Draft);
        let started = reg
            .transition_from(&e.id, &[ExperimentStatus::Draft], ExperimentStatus::Active)
            .unwrap();
        assert_eq!(started.status, ExperimentStatus::Active);
    }

    #[test]
    fn list_returns_insertion_order() {
        let reg = registry();
        let a = reg.create(new_experiment("a")).unwrap();
        let b = reg.create(new_experiment("b")).unwrap();
        let ids: Vec<String> = reg
            .list(&ExperimentFilter::default())
            .unwrap()
            .into_iter()
            .map(|e| e.id)
            .collect();
        assert_eq!(ids, vec![a.id, b.id]);
    }

    #[test]
    fn seed_default_only_when_empty() {
        let reg = registry();
        let seeded = reg.seed_default().unwrap().unwrap();
        assert_eq!(seeded.status, ExperimentStatus::Active);
        assert_eq!(seeded.variants.len(), 2);
        assert!(reg.seed_default().unwrap().is_none());
        assert_eq!(reg.list(&ExperimentFilter::default()).unwrap().len(), 1);
    }
}
