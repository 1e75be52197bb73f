//! API routes

pub mod health;
pub mod webhooks;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use tower_http::trace::TraceLayer;

use crate::state::AppState;

/// Create all API routes
pub fn create_router(state: AppState) -> Router {
    // Health check routes (at root level for infrastructure monitoring)
    let health_routes = Router::new()
        .route("/health", get(health::health))
        .route("/health/live", get(health::liveness))
        .route("/health/ready", get(health::readiness));

    // Provider webhooks carry small bodies; anything larger is refused before buffering
    let webhook_routes = Router::new()
        .route("/webhooks/stripe", post(webhooks::stripe_webhook))
        .layer(DefaultBodyLimit::max(state.webhooks.config().max_body_bytes));

    Router::new()
        .merge(health_routes)
        .merge(webhook_routes)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
