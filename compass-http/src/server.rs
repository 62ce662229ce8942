use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use compass::experiments::file_store::FileStorage;
use compass::experiments::store::{ExperimentStorage, MemoryStorage};
use compass::{ExperimentService, ServiceConfig};
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::handlers::{
    assign_variant, complete_experiment, create_experiment, delete_experiment, get_experiment,
    get_metrics, health, list_experiments, pause_experiment, resume_experiment, start_experiment,
    track_event, update_experiment, AppState,
};

const DEFAULT_MAX_BODY_KB: usize = 256;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: String,
    /// Durable storage root; in-memory when `None`.
    pub data_dir: Option<PathBuf>,
    pub service: ServiceConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:7700".to_string(),
            data_dir: None,
            service: ServiceConfig::default(),
        }
    }
}

/// Opens storage, builds the service and seeds the default experiment if needed.
pub fn build_service(config: &ServerConfig) -> compass::Result<Arc<ExperimentService>> {
    let storage: Arc<dyn ExperimentStorage> = match &config.data_dir {
        Some(dir) => Arc::new(FileStorage::open(dir)?),
        None => Arc::new(MemoryStorage::new()),
    };
    let service = ExperimentService::new(storage, config.service.clone());
    service.bootstrap()?;
    Ok(Arc::new(service))
}

pub fn build_router(state: Arc<AppState>) -> Router {
    let experiment_routes = Router::new()
        .route(
            "/1/experiments",
            post(create_experiment).get(list_experiments),
        )
        .route(
            "/1/experiments/:testId",
            get(get_experiment)
                .put(update_experiment)
                .delete(delete_experiment),
        )
        .route("/1/experiments/:testId/start", post(start_experiment))
        .route("/1/experiments/:testId/pause", post(pause_experiment))
        .route("/1/experiments/:testId/resume", post(resume_experiment))
        .route("/1/experiments/:testId/complete", post(complete_experiment))
        .route("/1/experiments/:testId/assign", post(assign_variant))
        .route("/1/events", post(track_event))
        .route("/1/metrics", get(get_metrics));

    Router::new()
        .route("/health", get(health))
        .merge(experiment_routes)
        .with_state(state)
}

pub async fn serve(config: ServerConfig) -> Result<(), Box<dyn std::error::Error>> {
    let startup_start = std::time::Instant::now();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let service = build_service(&config)?;
    tracing::info!(
        data_dir = ?config.data_dir,
        bucketing = ?config.service.bucketing,
        track_policy = ?config.service.track_policy,
        experiments = service.test_count()?,
        "experiment service ready"
    );
    let state = Arc::new(AppState::new(service));

    let max_body_kb: usize = std::env::var("COMPASS_MAX_BODY_KB")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(DEFAULT_MAX_BODY_KB);

    let app = build_router(state)
        .layer(DefaultBodyLimit::max(max_body_kb * 1024))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::very_permissive().max_age(std::time::Duration::from_secs(86400)));

    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    let local_addr = listener.local_addr()?;

    print_startup_banner(
        &local_addr.to_string(),
        startup_start.elapsed().as_millis(),
        &config,
    );

    axum::serve(listener, app).await?;

    Ok(())
}

fn print_startup_banner(bind_addr: &str, startup_ms: u128, config: &ServerConfig) {
    use colored::Colorize;

    let url = format!("http://{}", bind_addr);
    let version = format!("v{}", env!("CARGO_PKG_VERSION"));
    let timing = format!("ready in {}ms", startup_ms);
    let storage = match &config.data_dir {
        Some(dir) => dir.display().to_string(),
        None => "in-memory".to_string(),
    };

    println!();
    println!(
        "  {} {}  {}",
        "Compass".bold().bright_green(),
        version.as_str().dimmed(),
        timing.as_str().dimmed(),
    );
    println!();
    println!("  {}  Local:      {}", "➜".green(), url.as_str().cyan());
    println!("  {}  Storage:    {}", "➜".green(), storage.as_str().cyan());
    let bucketing = format!("{:?}", config.service.bucketing).to_lowercase();
    println!("  {}  Bucketing:  {}", "➜".green(), bucketing.as_str().cyan());
    println!();
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tempfile::TempDir;
    use tower::ServiceExt;

    #[test]
    fn build_service_seeds_in_memory_store() {
        let service = build_service(&ServerConfig::default()).unwrap();
        assert_eq!(service.test_count().unwrap(), 1);
    }

    #[test]
    fn build_service_respects_no_seed() {
        let mut config = ServerConfig::default();
        config.service.seed_default = false;
        let service = build_service(&config).unwrap();
        assert_eq!(service.test_count().unwrap(), 0);
    }

    #[test]
    fn build_service_with_data_dir_does_not_reseed_on_restart() {
        let tmp = TempDir::new().unwrap();
        let config = ServerConfig {
            data_dir: Some(tmp.path().to_path_buf()),
            ..Default::default()
        };
        let first = build_service(&config).unwrap();
        first.delete_test("default_experiment").unwrap();
        first
            .create_test(
                compass::experiments::config::NewExperiment::from_json(serde_json::json!({
                    "name": "kept",
                    "variants": [{ "name": "a", "weight": 100 }]
                }))
                .unwrap(),
            )
            .unwrap();
        drop(first);

        let second = build_service(&config).unwrap();
        let tests = second.list_tests(None).unwrap();
        assert_eq!(tests.len(), 1);
        assert_eq!(tests[0].name, "kept");
    }

    #[tokio::test]
    async fn router_serves_health_and_experiment_routes() {
        let service = build_service(&ServerConfig::default()).unwrap();
        let app = build_router(Arc::new(AppState::new(service)));

        let resp = app
            .clone()
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = app
            .oneshot(
                Request::builder()
                    .uri("/1/experiments/default_experiment")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }
}
