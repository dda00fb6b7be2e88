pub mod app;
pub mod config;
pub mod handlers;
pub mod metrics;
pub mod pg;

pub use app::{build_router, AppState};
