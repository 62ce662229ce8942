use axum::extract::rejection::JsonRejection;
use axum::Json;
use compass::{ExperimentError, ExperimentService};
use std::sync::Arc;

pub mod experiments;
pub mod health;

pub struct AppState {
    pub service: Arc<ExperimentService>,
    pub start_time: std::time::Instant,
}

impl AppState {
    pub fn new(service: Arc<ExperimentService>) -> Self {
        Self {
            service,
            start_time: std::time::Instant::now(),
        }
    }
}

/// Malformed JSON becomes a `Validation` error so every 4xx shares one body shape.
pub(crate) fn json_body(
    payload: Result<Json<serde_json::Value>, JsonRejection>,
) -> Result<serde_json::Value, ExperimentError> {
    payload
        .map(|Json(value)| value)
        .map_err(|rejection| ExperimentError::Validation(rejection.body_text()))
}

pub use experiments::{
    assign_variant, complete_experiment, create_experiment, delete_experiment, get_experiment,
    get_metrics, list_experiments, pause_experiment, resume_experiment, start_experiment,
    track_event, update_experiment,
};
pub use health::health;
