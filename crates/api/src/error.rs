//! API error types and handling

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use paymirror_billing::BillingError;
use serde_json::json;

/// Application error type
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    // Request errors
    #[error("Invalid request: {0}")]
    BadRequest(String),
    #[error("Invalid webhook signature")]
    InvalidSignature,
    #[error("Payload too large: {0}")]
    PayloadTooLarge(String),

    // Internal errors
    #[error("Database error: {0}")]
    Database(String),
    #[error("Internal server error")]
    Internal,
    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg.clone()),
            ApiError::InvalidSignature => {
                (StatusCode::BAD_REQUEST, "INVALID_SIGNATURE", self.to_string())
            }
            ApiError::PayloadTooLarge(msg) => {
                (StatusCode::PAYLOAD_TOO_LARGE, "PAYLOAD_TOO_LARGE", msg.clone())
            }

            // Details of internal failures stay in the logs
            ApiError::Database(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "DATABASE_ERROR",
                "Database error".to_string(),
            ),
            ApiError::Internal => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_ERROR",
                self.to_string(),
            ),
            ApiError::ServiceUnavailable(msg) => {
                (StatusCode::SERVICE_UNAVAILABLE, "SERVICE_UNAVAILABLE", msg.clone())
            }
        };

        let body = Json(json!({
            "error": {
                "code": code,
                "message": message,
            }
        }));

        (status, body).into_response()
    }
}

impl From<BillingError> for ApiError {
    fn from(err: BillingError) -> Self {
        match err {
            BillingError::WebhookSignatureInvalid => ApiError::InvalidSignature,
            BillingError::PayloadTooLarge { .. } => ApiError::PayloadTooLarge(err.to_string()),
            BillingError::Conversion(msg) => ApiError::BadRequest(msg),
            BillingError::QueueUnavailable(msg) => ApiError::ServiceUnavailable(msg),
            BillingError::Database(msg) => {
                tracing::error!("Database error: {}", msg);
                ApiError::Database(msg)
            }
            other => {
                tracing::error!(error = %other, "Billing error");
                ApiError::Internal
            }
        }
    }
}

/// Result type alias for API handlers
pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_billing_error_status_mapping() {
        let cases = [
            (BillingError::WebhookSignatureInvalid, StatusCode::BAD_REQUEST),
            (
                BillingError::PayloadTooLarge { size: 10, limit: 5 },
                StatusCode::PAYLOAD_TOO_LARGE,
            ),
            (
                BillingError::Conversion("bad envelope".into()),
                StatusCode::BAD_REQUEST,
            ),
            (
                BillingError::QueueUnavailable("full".into()),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (
                BillingError::Database("down".into()),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
            (
                BillingError::Internal("boom".into()),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];

        for (err, status) in cases {
            let label = err.to_string();
            let response = ApiError::from(err).into_response();
            assert_eq!(response.status(), status, "{label}");
        }
    }
}
