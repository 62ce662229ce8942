pub mod assignment;
pub mod config;
pub mod event;
pub mod file_store;
pub mod metrics;
pub mod registry;
pub mod service;
pub mod store;

pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
