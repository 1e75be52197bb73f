//! Application state

use std::sync::Arc;

use paymirror_billing::WebhookProcessor;
use sqlx::PgPool;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    /// Webhook intake; the consumer half is owned by `main`
    pub webhooks: Arc<WebhookProcessor>,
    /// `None` when the mirror runs without Postgres (tests, local tooling)
    pub pool: Option<PgPool>,
}

impl AppState {
    pub fn new(webhooks: WebhookProcessor, pool: Option<PgPool>) -> Self {
        Self {
            webhooks: Arc::new(webhooks),
            pool,
        }
    }
}
