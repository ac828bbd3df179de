//! API route registration.

use axum::Router;

use crate::api::server::AppState;

pub mod activity;
pub mod health;
pub mod history;
pub mod rip;

/// Assemble the full API router.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .nest("/api/health", health::router())
        .nest("/api/rip", rip::router())
        .nest("/api/history", history::router())
        .nest("/api/activity", activity::router())
        .with_state(state)
}
