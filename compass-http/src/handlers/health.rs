use axum::{extract::State, Json};
use std::sync::Arc;

use super::AppState;

/// Liveness plus a cheap view of the registry.
pub async fn health(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let experiments = match state.service.test_count() {
        Ok(count) => serde_json::json!(count),
        Err(err) => {
            tracing::warn!("health: experiment count unavailable: {}", err);
            serde_json::Value::Null
        }
    };

    Json(serde_json::json!({
        "status": "ok",
        "experiments": experiments,
        "assignments": state.service.assignment_count(),
        "uptimeSecs": state.start_time.elapsed().as_secs(),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
