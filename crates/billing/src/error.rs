//! Billing error types

use std::fmt;

use thiserror::Error;

use crate::entities::EntityKind;
use crate::reconcile::SyncReport;

/// Billing mirror errors
#[derive(Debug, Error)]
pub enum BillingError {
    /// Provider unreachable, or a page that could not be read
    #[error("Provider transport error: {0}")]
    Transport(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// Duplicate external identity on insert
    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    /// Remote record that cannot be expressed in the mirror
    #[error("Conversion error: {0}")]
    Conversion(String),

    #[error("Webhook signature verification failed")]
    WebhookSignatureInvalid,

    #[error("Webhook payload too large: {size} bytes (limit {limit})")]
    PayloadTooLarge { size: usize, limit: usize },

    #[error("Webhook queue unavailable: {0}")]
    QueueUnavailable(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl BillingError {
    /// Whether the provider should redeliver the request that produced this error.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BillingError::Transport(_)
                | BillingError::Database(_)
                | BillingError::QueueUnavailable(_)
                | BillingError::Internal(_)
        )
    }
}

impl From<stripe::StripeError> for BillingError {
    fn from(err: stripe::StripeError) -> Self {
        BillingError::Transport(err.to_string())
    }
}

impl From<sqlx::Error> for BillingError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db_err) = &err {
            if let Some(code) = db_err.code() {
                // PostgreSQL unique violation
                if code == "23505" {
                    return BillingError::ConstraintViolation(db_err.message().to_string());
                }
            }
        }
        BillingError::Database(err.to_string())
    }
}

pub type BillingResult<T> = Result<T, BillingError>;

/// Aggregate failure of a reconciliation pass.
///
/// Entity kinds that synced cleanly stay committed; their counts are in `report`.
#[derive(Debug)]
pub struct SyncError {
    pub failures: Vec<(EntityKind, BillingError)>,
    pub report: SyncReport,
}

impl SyncError {
    pub fn failed_kinds(&self) -> Vec<EntityKind> {
        self.failures.iter().map(|(kind, _)| *kind).collect()
    }
}

impl fmt::Display for SyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sync failed for")?;
        for (i, (kind, err)) in self.failures.iter().enumerate() {
            let sep = if i == 0 { " " } else { "; " };
            write!(f, "{sep}{kind}: {err}")?;
        }
        Ok(())
    }
}

impl std::error::Error for SyncError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sync_error_lists_every_failed_kind() {
        let err = SyncError {
            failures: vec![
                (EntityKind::Customer, BillingError::Transport("timeout".into())),
                (EntityKind::Price, BillingError::Transport("bad page".into())),
            ],
            report: SyncReport::default(),
        };
        assert_eq!(err.failed_kinds(), vec![EntityKind::Customer, EntityKind::Price]);
        let msg = err.to_string();
        assert!(msg.contains("customer: Provider transport error: timeout"));
        assert!(msg.contains("price: Provider transport error: bad page"));
    }

    #[test]
    fn test_transient_classification() {
        assert!(BillingError::Database("down".into()).is_transient());
        assert!(!BillingError::WebhookSignatureInvalid.is_transient());
        assert!(!BillingError::Conversion("no price".into()).is_transient());
    }
}
