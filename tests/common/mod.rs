use axum::{
    body::Body,
    http::{Method, Request},
    Router,
};
use compass::experiments::service::Bucketing;
use compass::ServiceConfig;
use compass_http::handlers::AppState;
use compass_http::{build_router, build_service, ServerConfig};
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use tower::ServiceExt;

pub const DEFAULT_ID: &str = "default_experiment";

pub fn app_with(config: ServerConfig) -> Router {
    let service = build_service(&config).unwrap();
    build_router(Arc::new(AppState::new(service)))
}

#[allow(dead_code)]
pub fn seeded_app(seed: u64) -> Router {
    app_with(ServerConfig {
        service: ServiceConfig {
            bucketing: Bucketing::Seeded(seed),
            ..Default::default()
        },
        ..Default::default()
    })
}

#[allow(dead_code)]
pub fn file_backed_app(data_dir: &Path) -> Router {
    app_with(ServerConfig {
        data_dir: Some(data_dir.to_path_buf()),
        ..Default::default()
    })
}

pub async fn send(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (u16, Value) {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    let resp = app.clone().oneshot(request).await.unwrap();
    let status = resp.status().as_u16();
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
        .await
        .unwrap();
    let json = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, json)
}

#[allow(dead_code)]
pub async fn track(app: &Router, test_id: &str, session: &str, variant: &str, event: &str) -> u16 {
    let body = serde_json::json!({
        "testId": test_id,
        "sessionId": session,
        "variant": variant,
        "event": event,
    });
    send(app, Method::POST, "/1/events", Some(body)).await.0
}
