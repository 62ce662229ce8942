use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    response::Response,
    Json,
};
use compass::experiments::{
    config::{Experiment, ExperimentPatch, ExperimentStatus, NewExperiment},
    event::TrackRequest,
    metrics::VariantMetrics,
};
use compass::ExperimentError;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::{json_body, AppState};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListExperimentsQuery {
    #[serde(default)]
    pub status: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsQuery {
    #[serde(default)]
    pub test_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssignRequest {
    #[serde(default)]
    pub session_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ExperimentResponse {
    pub test: Experiment,
}

#[derive(Debug, Serialize)]
pub struct ListExperimentsResponse {
    pub tests: Vec<Experiment>,
    pub count: usize,
}

#[derive(Debug, Serialize)]
pub struct MetricsResponse {
    pub metrics: Vec<VariantMetrics>,
}

fn ok_response() -> Response {
    Json(serde_json::json!({ "ok": true })).into_response()
}

fn test_response(result: Result<Experiment, ExperimentError>) -> Response {
    match result {
        Ok(test) => Json(ExperimentResponse { test }).into_response(),
        Err(err) => err.into_response(),
    }
}

fn parse_status_filter(value: Option<&str>) -> Result<Option<ExperimentStatus>, ExperimentError> {
    value
        .filter(|s| !s.trim().is_empty())
        .map(str::parse)
        .transpose()
}

pub async fn create_experiment(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<serde_json::Value>, JsonRejection>,
) -> Response {
    let input = match json_body(payload).and_then(NewExperiment::from_json) {
        Ok(input) => input,
        Err(err) => return err.into_response(),
    };

    match state.service.create_test(input) {
        Ok(test) => (StatusCode::CREATED, Json(ExperimentResponse { test })).into_response(),
        Err(err) => err.into_response(),
    }
}

pub async fn list_experiments(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ListExperimentsQuery>,
) -> Response {
    let status = match parse_status_filter(params.status.as_deref()) {
        Ok(status) => status,
        Err(err) => return err.into_response(),
    };

    match state.service.list_tests(status) {
        Ok(tests) => {
            let count = tests.len();
            Json(ListExperimentsResponse { tests, count }).into_response()
        }
        Err(err) => err.into_response(),
    }
}

pub async fn get_experiment(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Response {
    test_response(state.service.get_test(&id))
}

pub async fn update_experiment(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    payload: Result<Json<serde_json::Value>, JsonRejection>,
) -> Response {
    let patch = match json_body(payload).and_then(ExperimentPatch::from_json) {
        Ok(patch) => patch,
        Err(err) => return err.into_response(),
    };
    test_response(state.service.update_test(&id, patch))
}

pub async fn delete_experiment(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Response {
    match state.service.delete_test(&id) {
        Ok(()) => ok_response(),
        Err(err) => err.into_response(),
    }
}

pub async fn start_experiment(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Response {
    test_response(state.service.start_test(&id))
}

pub async fn pause_experiment(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Response {
    test_response(state.service.pause_test(&id))
}

pub async fn resume_experiment(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Response {
    test_response(state.service.resume_test(&id))
}

pub async fn complete_experiment(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Response {
    test_response(state.service.complete_test(&id))
}

pub async fn assign_variant(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    payload: Result<Json<serde_json::Value>, JsonRejection>,
) -> Response {
    let request = match json_body(payload).and_then(|value| {
        serde_json::from_value::<AssignRequest>(value)
            .map_err(|e| ExperimentError::Validation(format!("invalid assign body: {e}")))
    }) {
        Ok(request) => request,
        Err(err) => return err.into_response(),
    };
    let session_id = request.session_id.unwrap_or_default();

    match state.service.assign(&id, &session_id) {
        Ok(outcome) => Json(outcome).into_response(),
        Err(err) => err.into_response(),
    }
}

pub async fn track_event(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<serde_json::Value>, JsonRejection>,
) -> Response {
    let request = match json_body(payload).and_then(TrackRequest::from_json) {
        Ok(request) => request,
        Err(err) => return err.into_response(),
    };

    match state.service.track(request) {
        Ok(_) => ok_response(),
        Err(err) => err.into_response(),
    }
}

pub async fn get_metrics(
    State(state): State<Arc<AppState>>,
    Query(params): Query<MetricsQuery>,
) -> Response {
    let test_id = params.test_id.unwrap_or_default();
    match state.service.metrics(&test_id) {
        Ok(metrics) => Json(MetricsResponse { metrics }).into_response(),
        Err(err) => err.into_response(),
    }
}
