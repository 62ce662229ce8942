pub mod handlers;
pub mod server;

pub use server::{build_router, build_service, serve, ServerConfig};
