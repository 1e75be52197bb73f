//! Provider webhook endpoint

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    Json,
};
use paymirror_billing::Acknowledgement;
use serde::Serialize;

use crate::{error::ApiError, state::AppState};

pub const STRIPE_SIGNATURE_HEADER: &str = "stripe-signature";

#[derive(Debug, Serialize)]
pub struct WebhookResponse {
    pub received: bool,
    pub duplicate: bool,
}

/// Handle Stripe webhooks
///
/// Returns 200 once the event is ledgered and queued (or was already received).
/// Signature and envelope problems are 400s, which Stripe does not retry; a full
/// queue or storage failure is a 5xx, which it does.
pub async fn stripe_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<WebhookResponse>), ApiError> {
    tracing::info!(body_len = body.len(), "Stripe webhook received");

    let signature = headers
        .get(STRIPE_SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| {
            tracing::warn!("Stripe webhook missing signature header");
            ApiError::BadRequest("Missing Stripe signature".to_string())
        })?;

    let ack = state.webhooks.receive(&body, signature).await.map_err(|e| {
        tracing::warn!(error = %e, "Stripe webhook rejected");
        ApiError::from(e)
    })?;

    Ok((
        StatusCode::OK,
        Json(WebhookResponse {
            received: true,
            duplicate: ack == Acknowledgement::Duplicate,
        }),
    ))
}
