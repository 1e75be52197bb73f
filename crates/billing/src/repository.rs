//! Entity mirror storage contracts
//!
//! One generic [`Repository`] covers all four entity types. The webhook ledger and
//! the subscription/user join table have their own small traits. Postgres and
//! in-memory implementations live in [`crate::postgres`] and [`crate::memory`].

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::PgPool;
use time::OffsetDateTime;

use crate::entities::{Customer, InternalId, MirrorEntity, Plan, Price, Subscription};
use crate::error::BillingResult;

#[async_trait]
pub trait Repository<E: MirrorEntity>: Send + Sync {
    /// Inserts a new row and returns it with its assigned internal id.
    ///
    /// Fails with `ConstraintViolation` if the external identity is taken.
    async fn insert(&self, entity: &E) -> BillingResult<E>;

    /// Overwrites the business columns of the row with `entity.id()`.
    async fn update(&self, entity: &E) -> BillingResult<E>;

    async fn get(&self, id: InternalId) -> BillingResult<Option<E>>;

    async fn get_by_external(&self, provider: &str, provider_id: &str)
        -> BillingResult<Option<E>>;

    /// Deletes by external identity, returning the deleted row.
    async fn delete_by_external(&self, provider: &str, provider_id: &str)
        -> BillingResult<Option<E>>;

    /// Deletes every row of `provider` whose external id is not in `seen`.
    ///
    /// Only call this after a complete enumeration of the remote collection.
    async fn remove_orphans(&self, provider: &str, seen: &HashSet<String>)
        -> BillingResult<Vec<E>>;

    /// All rows of `provider`, ordered by internal id.
    async fn list(&self, provider: &str) -> BillingResult<Vec<E>>;
}

/// A row of the webhook event ledger
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct LedgerEntry {
    pub provider: String,
    pub event_id: String,
    pub event_type: String,
    pub payload: Value,
    pub processed: bool,
    pub received_at: OffsetDateTime,
}

/// Append-only idempotency record of received webhook events
#[async_trait]
pub trait WebhookLedger: Send + Sync {
    async fn contains(&self, provider: &str, event_id: &str) -> BillingResult<bool>;

    /// Inserts the entry unless one exists. Returns `true` if this call inserted it.
    async fn record(
        &self,
        provider: &str,
        event_id: &str,
        event_type: &str,
        payload: &Value,
    ) -> BillingResult<bool>;

    async fn get(&self, provider: &str, event_id: &str) -> BillingResult<Option<LedgerEntry>>;
}

/// Many-to-many link between subscriptions and application users
#[async_trait]
pub trait SubscriptionUsers: Send + Sync {
    /// Idempotent
    async fn link(&self, subscription_id: InternalId, user_id: i64) -> BillingResult<()>;

    async fn users_of(&self, subscription_id: InternalId) -> BillingResult<Vec<i64>>;
}

/// Handles to every store the mirror is made of
#[derive(Clone)]
pub struct EntityMirror {
    pub customers: Arc<dyn Repository<Customer>>,
    pub plans: Arc<dyn Repository<Plan>>,
    pub prices: Arc<dyn Repository<Price>>,
    pub subscriptions: Arc<dyn Repository<Subscription>>,
    pub subscription_users: Arc<dyn SubscriptionUsers>,
    pub ledger: Arc<dyn WebhookLedger>,
}

impl EntityMirror {
    pub fn postgres(pool: PgPool) -> Self {
        use crate::postgres::{PgLedger, PgRepository, PgSubscriptionUsers};

        Self {
            customers: Arc::new(PgRepository::<Customer>::new(pool.clone())),
            plans: Arc::new(PgRepository::<Plan>::new(pool.clone())),
            prices: Arc::new(PgRepository::<Price>::new(pool.clone())),
            subscriptions: Arc::new(PgRepository::<Subscription>::new(pool.clone())),
            subscription_users: Arc::new(PgSubscriptionUsers::new(pool.clone())),
            ledger: Arc::new(PgLedger::new(pool)),
        }
    }

    pub fn in_memory() -> Self {
        crate::memory::MemoryMirror::default().mirror()
    }
}
