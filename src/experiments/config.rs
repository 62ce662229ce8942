use indexmap::IndexSet;
use rand::{distributions::Alphanumeric, Rng};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::error::{ExperimentError, Result};

pub const DEFAULT_TRAFFIC_SPLIT: f64 = 50.0;
pub const DEFAULT_EXPERIMENT_ID: &str = "default_experiment";

const WEIGHT_SUM_TOLERANCE: f64 = 1e-6;

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Experiment {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub status: ExperimentStatus,
    pub variants: Vec<Variant>,
    /// Percentage (0-100) of sessions routed to the secondary variant.
    pub traffic_split: f64,
    pub start_date: i64,
    pub end_date: Option<i64>,
    #[serde(default)]
    pub target_metrics: IndexSet<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ExperimentStatus {
    Draft,
    Active,
    Paused,
    Completed,
}

impl ExperimentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExperimentStatus::Draft => "draft",
            ExperimentStatus::Active => "active",
            ExperimentStatus::Paused => "paused",
            ExperimentStatus::Completed => "completed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        *self == ExperimentStatus::Completed
    }

    /// draft -> active -> {paused <-> active} -> completed. Staying put is allowed.
    pub fn can_transition_to(&self, next: ExperimentStatus) -> bool {
        use ExperimentStatus::*;
        if *self == next {
            return !self.is_terminal();
        }
        matches!(
            (*self, next),
            (Draft, Active) | (Active, Paused) | (Paused, Active) | (Active, Completed) | (Paused, Completed)
        )
    }
}

impl std::fmt::Display for ExperimentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ExperimentStatus {
    type Err = ExperimentError;

    fn from_str(value: &str) -> Result<Self> {
        match value.to_ascii_lowercase().as_str() {
            "draft" => Ok(ExperimentStatus::Draft),
            "active" => Ok(ExperimentStatus::Active),
            "paused" => Ok(ExperimentStatus::Paused),
            "completed" => Ok(ExperimentStatus::Completed),
            _ => Err(ExperimentError::Validation(format!(
                "invalid status: {value}"
            ))),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Variant {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub weight: f64,
}

/// Variant as supplied by a caller; the id is derived from the name when absent.
#[derive(Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct NewVariant {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub weight: Option<f64>,
}

#[derive(Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct NewExperiment {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub variants: Option<Vec<NewVariant>>,
    #[serde(default)]
    pub traffic_split: Option<f64>,
    #[serde(default)]
    pub target_metrics: Option<Vec<String>>,
}

/// Shallow partial update. Absent fields keep their stored value.
#[derive(Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct ExperimentPatch {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub status: Option<ExperimentStatus>,
    #[serde(default)]
    pub variants: Option<Vec<NewVariant>>,
    #[serde(default)]
    pub traffic_split: Option<f64>,
    #[serde(default)]
    pub target_metrics: Option<Vec<String>>,
    #[serde(default)]
    pub end_date: Option<i64>,
}

impl NewExperiment {
    /// Parses a raw request body, reporting shape problems as validation errors.
    pub fn from_json(value: serde_json::Value) -> Result<Self> {
        serde_json::from_value(value)
            .map_err(|e| ExperimentError::Validation(format!("invalid experiment body: {e}")))
    }
}

impl ExperimentPatch {
    pub fn from_json(value: serde_json::Value) -> Result<Self> {
        serde_json::from_value(value)
            .map_err(|e| ExperimentError::Validation(format!("invalid update body: {e}")))
    }
}

impl Experiment {
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(ExperimentError::Validation("id must not be empty".to_string()));
        }
        if self.name.trim().is_empty() {
            return Err(ExperimentError::Validation("name is required".to_string()));
        }
        if self.variants.is_empty() {
            return Err(ExperimentError::Validation(
                "at least one variant is required".to_string(),
            ));
        }
        if !(0.0..=100.0).contains(&self.traffic_split) {
            return Err(ExperimentError::Validation(
                "trafficSplit must be within [0, 100]".to_string(),
            ));
        }
        let mut seen = HashSet::new();
        for variant in &self.variants {
            if variant.id.trim().is_empty() {
                return Err(ExperimentError::Validation(
                    "variant id must not be empty".to_string(),
                ));
            }
            if !seen.insert(variant.id.as_str()) {
                return Err(ExperimentError::Validation(format!(
                    "duplicate variant id: {}",
                    variant.id
                )));
            }
            if !(0.0..=100.0).contains(&variant.weight) {
                return Err(ExperimentError::Validation(format!(
                    "variant '{}' weight must be within [0, 100]",
                    variant.id
                )));
            }
        }
        let total: f64 = self.variants.iter().map(|v| v.weight).sum();
        if (total - 100.0).abs() > WEIGHT_SUM_TOLERANCE {
            return Err(ExperimentError::Validation(format!(
                "variant weights must sum to 100, got {total}"
            )));
        }
        Ok(())
    }

    pub fn variant(&self, id: &str) -> Option<&Variant> {
        self.variants.iter().find(|v| v.id == id)
    }

    /// The control arm; also the fallback when experimentation is off.
    pub fn primary_variant(&self) -> &Variant {
        &self.variants[0]
    }

    /// The arm that receives `traffic_split` percent; single-variant tests route
    /// everything to the primary.
    pub fn secondary_variant(&self) -> &Variant {
        self.variants.get(1).unwrap_or(&self.variants[0])
    }

    /// The test every fresh registry starts with.
    pub fn seeded_default(now: i64) -> Self {
        Experiment {
            id: DEFAULT_EXPERIMENT_ID.to_string(),
            name: "Default experiment".to_string(),
            description: "Baseline 50/50 split available before any experiment is created"
                .to_string(),
            status: ExperimentStatus::Active,
            variants: vec![
                Variant {
                    id: "control".to_string(),
                    name: "Control".to_string(),
                    description: "Current experience".to_string(),
                    weight: 50.0,
                },
                Variant {
                    id: "variant".to_string(),
                    name: "Variant".to_string(),
                    description: "Alternative experience".to_string(),
                    weight: 50.0,
                },
            ],
            traffic_split: DEFAULT_TRAFFIC_SPLIT,
            start_date: now,
            end_date: None,
            target_metrics: ["conversion".to_string(), "flow_completion".to_string()]
                .into_iter()
                .collect(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// `exp_<ms>_<8 alphanumerics>`.
pub fn generate_experiment_id(now: i64) -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(8)
        .map(char::from)
        .collect::<String>()
        .to_ascii_lowercase();
    format!("exp_{now}_{suffix}")
}

/// Lowercase, non-alphanumerics collapsed to `_`.
fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    let mut last_underscore = false;
    for c in name.trim().chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
            last_underscore = false;
        } else if !last_underscore {
            slug.push('_');
            last_underscore = true;
        }
    }
    let slug = slug.trim_matches('_').to_string();
    if slug.is_empty() {
        "variant".to_string()
    } else {
        slug
    }
}

pub fn build_variants(input: Vec<NewVariant>) -> Result<Vec<Variant>> {
    if input.is_empty() {
        return Err(ExperimentError::Validation(
            "variants must be a non-empty array".to_string(),
        ));
    }
    let mut taken: HashSet<String> = input
        .iter()
        .filter_map(|v| v.id.as_deref())
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty())
        .collect();
    let mut variants = Vec::with_capacity(input.len());
    for (i, v) in input.into_iter().enumerate() {
        if v.name.trim().is_empty() {
            return Err(ExperimentError::Validation(format!(
                "variants[{i}].name is required"
            )));
        }
        let weight = v.weight.ok_or_else(|| {
            ExperimentError::Validation(format!("variants[{i}].weight is required"))
        })?;
        let id = match v.id.map(|id| id.trim().to_string()).filter(|id| !id.is_empty()) {
            Some(id) => id,
            None => {
                let base = slugify(&v.name);
                let mut candidate = base.clone();
                let mut n = 2;
                while taken.contains(&candidate) {
                    candidate = format!("{base}_{n}");
                    n += 1;
                }
                taken.insert(candidate.clone());
                candidate
            }
        };
        variants.push(Variant {
            id,
            name: v.name.trim().to_string(),
            description: v.description.unwrap_or_default(),
            weight,
        });
    }
    Ok(variants)
}

pub(crate) fn normalize_metrics(metrics: Vec<String>) -> IndexSet<String> {
    metrics
        .into_iter()
        .map(|m| m.trim().to_string())
        .filter(|m| !m.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_experiment() -> Experiment {
        Experiment::seeded_default(1_700_000_000_000)
    }

    fn new_variant(name: &str, weight: f64) -> NewVariant {
        NewVariant {
            name: name.to_string(),
            weight: Some(weight),
            ..Default::default()
        }
    }

    #[test]
    fn validate_seeded_default_succeeds() {
        assert!(valid_experiment().validate().is_ok());
    }

    #[test]
    fn validate_empty_variants_fails() {
        let mut e = valid_experiment();
        e.variants.clear();
        assert!(matches!(e.validate(), Err(ExperimentError::Validation(_))));
    }

    #[test]
    fn validate_weights_not_summing_to_100_fails() {
        let mut e = valid_experiment();
        e.variants[1].weight = 40.0;
        let err = e.validate().unwrap_err();
        assert!(err.to_string().contains("sum to 100"));
    }

    #[test]
    fn validate_traffic_split_out_of_range_fails() {
        let mut e = valid_experiment();
        e.traffic_split = 100.5;
        assert!(e.validate().is_err());
        e.traffic_split = -1.0;
        assert!(e.validate().is_err());
    }

    #[test]
    fn validate_traffic_split_bounds_pass() {
        let mut e = valid_experiment();
        e.traffic_split = 0.0;
        assert!(e.validate().is_ok());
        e.traffic_split = 100.0;
        assert!(e.validate().is_ok());
    }

    #[test]
    fn validate_duplicate_variant_ids_fails() {
        let mut e = valid_experiment();
        e.variants[1].id = "control".to_string();
        assert!(e.validate().is_err());
    }

    #[test]
    fn validate_blank_name_fails() {
        let mut e = valid_experiment();
        e.name = "   ".to_string();
        assert!(e.validate().is_err());
    }

    #[test]
    fn status_transitions_follow_lifecycle() {
        use ExperimentStatus::*;
        assert!(Draft.can_transition_to(Active));
        assert!(Active.can_transition_to(Paused));
        assert!(Paused.can_transition_to(Active));
        assert!(Active.can_transition_to(Completed));
        assert!(Paused.can_transition_to(Completed));
        assert!(!Draft.can_transition_to(Completed));
        assert!(!Active.can_transition_to(Draft));
        assert!(!Completed.can_transition_to(Active));
        assert!(!Completed.can_transition_to(Completed));
    }

    #[test]
    fn status_parses_case_insensitively() {
        assert_eq!("Paused".parse::<ExperimentStatus>().unwrap(), ExperimentStatus::Paused);
        assert!("running".parse::<ExperimentStatus>().is_err());
    }

    #[test]
    fn build_variants_derives_ids_from_names() {
        let variants = build_variants(vec![
            new_variant("Classic Flow", 50.0),
            new_variant("Classic flow!", 50.0),
        ])
        .unwrap();
        assert_eq!(variants[0].id, "classic_flow");
        assert_eq!(variants[1].id, "classic_flow_2");
    }

    #[test]
    fn build_variants_keeps_explicit_ids() {
        let mut v = new_variant("Guided", 100.0);
        v.id = Some("guided".to_string());
        let variants = build_variants(vec![v]).unwrap();
        assert_eq!(variants[0].id, "guided");
        assert_eq!(variants[0].description, "");
    }

    #[test]
    fn build_variants_generated_id_avoids_explicit_ids() {
        let mut explicit = new_variant("Other", 50.0);
        explicit.id = Some("control".to_string());
        let variants = build_variants(vec![new_variant("Control", 50.0), explicit]).unwrap();
        assert_eq!(variants[0].id, "control_2");
        assert_eq!(variants[1].id, "control");
    }

    #[test]
    fn build_variants_requires_name_and_weight() {
        assert!(build_variants(vec![new_variant("", 100.0)]).is_err());
        let no_weight = NewVariant {
            name: "a".to_string(),
            ..Default::default()
        };
        assert!(build_variants(vec![no_weight]).is_err());
        assert!(build_variants(vec![]).is_err());
    }

    #[test]
    fn generated_ids_have_prefix_and_differ() {
        let a = generate_experiment_id(1_700_000_000_000);
        let b = generate_experiment_id(1_700_000_000_000);
        assert!(a.starts_with("exp_1700000000000_"));
        assert_eq!(a.len(), "exp_1700000000000_".len() + 8);
        assert_ne!(a, b);
    }

    #[test]
    fn new_experiment_rejects_non_array_variants() {
        let body = serde_json::json!({ "name": "x", "variants": "control" });
        assert!(matches!(
            NewExperiment::from_json(body),
            Err(ExperimentError::Validation(_))
        ));
    }

    #[test]
    fn experiment_serializes_to_camel_case() {
        let json = serde_json::to_string(&valid_experiment()).unwrap();
        assert!(json.contains("trafficSplit"));
        assert!(json.contains("targetMetrics"));
        assert!(json.contains("\"status\":\"active\""));
        assert!(!json.contains("traffic_split"));
    }

    #[test]
    fn single_variant_secondary_is_primary() {
        let mut e = valid_experiment();
        e.variants.truncate(1);
        assert_eq!(e.secondary_variant().id, "control");
    }
}
