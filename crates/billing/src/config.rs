//! Mirror configuration

use std::time::Duration;

use crate::error::{BillingError, BillingResult};
use crate::reconcile::OrphanPolicy;
use crate::webhooks::{WebhookConfig, DEFAULT_MAX_BODY_BYTES};

#[derive(Debug, Clone, Default)]
pub struct MirrorConfig {
    pub orphan_policy: OrphanPolicy,
    pub webhook: WebhookConfig,
}

impl MirrorConfig {
    /// Create config from environment variables
    pub fn from_env() -> BillingResult<Self> {
        let orphan_policy = match std::env::var("MIRROR_ORPHAN_POLICY") {
            Ok(value) => value.parse()?,
            Err(_) => OrphanPolicy::default(),
        };

        let queue_capacity: usize = env_or("WEBHOOK_QUEUE_CAPACITY", 1024)?;
        if queue_capacity == 0 {
            return Err(BillingError::Config(
                "WEBHOOK_QUEUE_CAPACITY must be at least 1".to_string(),
            ));
        }

        Ok(Self {
            orphan_policy,
            webhook: WebhookConfig {
                queue_capacity,
                enqueue_timeout: Duration::from_millis(env_or("WEBHOOK_ENQUEUE_TIMEOUT_MS", 5000)?),
                max_body_bytes: env_or("WEBHOOK_MAX_BODY_BYTES", DEFAULT_MAX_BODY_BYTES)?,
                backfill: env_or("WEBHOOK_BACKFILL", true)?,
            },
        })
    }
}

pub(crate) fn env_or<T: std::str::FromStr>(key: &str, default: T) -> BillingResult<T> {
    match std::env::var(key) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| BillingError::Config(format!("{key} has an invalid value: {raw}"))),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = MirrorConfig::default();
        assert_eq!(config.orphan_policy, OrphanPolicy::RetainUnconvertible);
        assert_eq!(config.webhook.max_body_bytes, 65536);
        assert_eq!(config.webhook.queue_capacity, 1024);
        assert!(config.webhook.backfill);
    }

    #[test]
    fn test_env_or_rejects_garbage() {
        std::env::set_var("PAYMIRROR_TEST_ENV_OR", "lots");
        let parsed: BillingResult<usize> = env_or("PAYMIRROR_TEST_ENV_OR", 1);
        assert!(matches!(parsed, Err(BillingError::Config(_))));
        let missing: usize = env_or("PAYMIRROR_TEST_ENV_OR_MISSING", 7).unwrap();
        assert_eq!(missing, 7);
    }
}
