//! Postgres-backed mirror
//!
//! The repository is written once over [`PgEntity`]; each entity type only
//! names its table and binds its business columns.

use std::collections::HashSet;
use std::marker::PhantomData;

use async_trait::async_trait;
use serde_json::Value;
use sqlx::postgres::{PgArguments, PgRow};
use sqlx::query::QueryAs;
use sqlx::{FromRow, PgPool, Postgres};

use crate::entities::{Customer, InternalId, MirrorEntity, Plan, Price, Subscription};
use crate::error::{BillingError, BillingResult};
use crate::repository::{LedgerEntry, Repository, SubscriptionUsers, WebhookLedger};

type PgQueryAs<'q, E> = QueryAs<'q, Postgres, E, PgArguments>;

/// Table mapping of a mirrored entity
pub trait PgEntity: MirrorEntity + for<'r> FromRow<'r, PgRow> + Unpin {
    const TABLE: &'static str;
    /// Business columns, in the order [`PgEntity::bind_business`] binds them
    const COLUMNS: &'static [&'static str];

    fn bind_business<'q>(&'q self, query: PgQueryAs<'q, Self>) -> PgQueryAs<'q, Self>;
}

impl PgEntity for Customer {
    const TABLE: &'static str = "billing_customers";
    const COLUMNS: &'static [&'static str] = &["user_id", "name", "email"];

    fn bind_business<'q>(&'q self, query: PgQueryAs<'q, Self>) -> PgQueryAs<'q, Self> {
        query.bind(self.user_id).bind(&self.name).bind(&self.email)
    }
}

impl PgEntity for Plan {
    const TABLE: &'static str = "billing_plans";
    const COLUMNS: &'static [&'static str] = &["name", "description", "active"];

    fn bind_business<'q>(&'q self, query: PgQueryAs<'q, Self>) -> PgQueryAs<'q, Self> {
        query
            .bind(&self.name)
            .bind(&self.description)
            .bind(self.active)
    }
}

impl PgEntity for Price {
    const TABLE: &'static str = "billing_prices";
    const COLUMNS: &'static [&'static str] =
        &["plan_id", "amount", "currency", "schedule", "trial_days"];

    fn bind_business<'q>(&'q self, query: PgQueryAs<'q, Self>) -> PgQueryAs<'q, Self> {
        query
            .bind(self.plan_id)
            .bind(self.amount)
            .bind(&self.currency)
            .bind(self.schedule.as_str())
            .bind(self.trial_days)
    }
}

impl PgEntity for Subscription {
    const TABLE: &'static str = "billing_subscriptions";
    const COLUMNS: &'static [&'static str] = &["customer_id", "price_id", "active"];

    fn bind_business<'q>(&'q self, query: PgQueryAs<'q, Self>) -> PgQueryAs<'q, Self> {
        query
            .bind(self.customer_id)
            .bind(self.price_id)
            .bind(self.active)
    }
}

/// Statements of one table, built once
#[derive(Debug, Clone)]
struct Statements {
    insert: String,
    update: String,
    get: String,
    get_by_external: String,
    delete_by_external: String,
    remove_orphans: String,
    list: String,
}

impl Statements {
    fn for_table(table: &str, columns: &[&str]) -> Self {
        let insert_placeholders = (0..columns.len())
            .map(|i| format!("${}", i + 3))
            .collect::<Vec<_>>()
            .join(", ");
        let assignments = columns
            .iter()
            .enumerate()
            .map(|(i, column)| format!("{column} = ${}", i + 2))
            .collect::<Vec<_>>()
            .join(", ");

        Self {
            insert: format!(
                "INSERT INTO {table} (provider, provider_id, {}) VALUES ($1, $2, {insert_placeholders}) RETURNING *",
                columns.join(", ")
            ),
            update: format!(
                "UPDATE {table} SET {assignments}, updated_at = NOW() WHERE id = $1 RETURNING *"
            ),
            get: format!("SELECT * FROM {table} WHERE id = $1"),
            get_by_external: format!(
                "SELECT * FROM {table} WHERE provider = $1 AND provider_id = $2"
            ),
            delete_by_external: format!(
                "DELETE FROM {table} WHERE provider = $1 AND provider_id = $2 RETURNING *"
            ),
            remove_orphans: format!(
                "DELETE FROM {table} WHERE provider = $1 AND NOT (provider_id = ANY($2)) RETURNING *"
            ),
            list: format!("SELECT * FROM {table} WHERE provider = $1 ORDER BY id"),
        }
    }
}

/// Postgres repository for any [`PgEntity`]
pub struct PgRepository<E> {
    pool: PgPool,
    sql: Statements,
    _entity: PhantomData<fn() -> E>,
}

impl<E: PgEntity> PgRepository<E> {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            sql: Statements::for_table(E::TABLE, E::COLUMNS),
            _entity: PhantomData,
        }
    }
}

#[async_trait]
impl<E: PgEntity> Repository<E> for PgRepository<E> {
    async fn insert(&self, entity: &E) -> BillingResult<E> {
        let query = sqlx::query_as::<_, E>(&self.sql.insert)
            .bind(entity.provider())
            .bind(entity.provider_id());
        let row = entity.bind_business(query).fetch_one(&self.pool).await?;
        tracing::debug!(
            kind = %E::KIND,
            id = row.id(),
            provider_id = %row.provider_id(),
            "Inserted mirror row"
        );
        Ok(row)
    }

    async fn update(&self, entity: &E) -> BillingResult<E> {
        let query = sqlx::query_as::<_, E>(&self.sql.update).bind(entity.id());
        entity
            .bind_business(query)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("{} {}", E::KIND, entity.id())))
    }

    async fn get(&self, id: InternalId) -> BillingResult<Option<E>> {
        Ok(sqlx::query_as::<_, E>(&self.sql.get)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn get_by_external(
        &self,
        provider: &str,
        provider_id: &str,
    ) -> BillingResult<Option<E>> {
        Ok(sqlx::query_as::<_, E>(&self.sql.get_by_external)
            .bind(provider)
            .bind(provider_id)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn delete_by_external(
        &self,
        provider: &str,
        provider_id: &str,
    ) -> BillingResult<Option<E>> {
        Ok(sqlx::query_as::<_, E>(&self.sql.delete_by_external)
            .bind(provider)
            .bind(provider_id)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn remove_orphans(
        &self,
        provider: &str,
        seen: &HashSet<String>,
    ) -> BillingResult<Vec<E>> {
        let seen: Vec<String> = seen.iter().cloned().collect();
        let mut removed = sqlx::query_as::<_, E>(&self.sql.remove_orphans)
            .bind(provider)
            .bind(seen)
            .fetch_all(&self.pool)
            .await?;
        removed.sort_by_key(|row| row.id());
        Ok(removed)
    }

    async fn list(&self, provider: &str) -> BillingResult<Vec<E>> {
        Ok(sqlx::query_as::<_, E>(&self.sql.list)
            .bind(provider)
            .fetch_all(&self.pool)
            .await?)
    }
}

/// Ledger in `billing_webhook_events`
pub struct PgLedger {
    pool: PgPool,
}

impl PgLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl WebhookLedger for PgLedger {
    async fn contains(&self, provider: &str, event_id: &str) -> BillingResult<bool> {
        let exists: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS(
                SELECT 1 FROM billing_webhook_events WHERE provider = $1 AND event_id = $2
            )
            "#,
        )
        .bind(provider)
        .bind(event_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    async fn record(
        &self,
        provider: &str,
        event_id: &str,
        event_type: &str,
        payload: &Value,
    ) -> BillingResult<bool> {
        // Atomic claim: concurrent deliveries of one event id insert at most one row
        let inserted: Option<String> = sqlx::query_scalar(
            r#"
            INSERT INTO billing_webhook_events (provider, event_id, event_type, payload)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (provider, event_id) DO NOTHING
            RETURNING event_id
            "#,
        )
        .bind(provider)
        .bind(event_id)
        .bind(event_type)
        .bind(sqlx::types::Json(payload))
        .fetch_optional(&self.pool)
        .await?;
        Ok(inserted.is_some())
    }

    async fn get(&self, provider: &str, event_id: &str) -> BillingResult<Option<LedgerEntry>> {
        Ok(sqlx::query_as::<_, LedgerEntry>(
            r#"
            SELECT provider, event_id, event_type, payload, processed, received_at
            FROM billing_webhook_events
            WHERE provider = $1 AND event_id = $2
            "#,
        )
        .bind(provider)
        .bind(event_id)
        .fetch_optional(&self.pool)
        .await?)
    }
}

pub struct PgSubscriptionUsers {
    pool: PgPool,
}

impl PgSubscriptionUsers {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SubscriptionUsers for PgSubscriptionUsers {
    async fn link(&self, subscription_id: InternalId, user_id: i64) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO billing_subscription_users (subscription_id, user_id)
            VALUES ($1, $2)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(subscription_id)
        .bind(user_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn users_of(&self, subscription_id: InternalId) -> BillingResult<Vec<i64>> {
        Ok(sqlx::query_scalar(
            "SELECT user_id FROM billing_subscription_users WHERE subscription_id = $1 ORDER BY user_id",
        )
        .bind(subscription_id)
        .fetch_all(&self.pool)
        .await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_statements_bind_in_column_order() {
        let sql = Statements::for_table(Price::TABLE, Price::COLUMNS);
        assert_eq!(
            sql.insert,
            "INSERT INTO billing_prices (provider, provider_id, plan_id, amount, currency, schedule, trial_days) \
             VALUES ($1, $2, $3, $4, $5, $6, $7) RETURNING *"
        );
        assert_eq!(
            sql.update,
            "UPDATE billing_prices SET plan_id = $2, amount = $3, currency = $4, schedule = $5, \
             trial_days = $6, updated_at = NOW() WHERE id = $1 RETURNING *"
        );
    }

    async fn pool() -> PgPool {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL required");
        let pool = PgPool::connect(&url).await.expect("Failed to connect");
        sqlx::migrate!("../../migrations")
            .run(&pool)
            .await
            .expect("Failed to migrate");
        pool
    }

    #[tokio::test]
    #[ignore] // Requires database
    async fn test_duplicate_external_id_is_constraint_violation() {
        let repo = PgRepository::<Plan>::new(pool().await);
        let provider_id = format!("prod_test_{}", std::process::id());
        let plan = Plan {
            id: 0,
            provider: "test".into(),
            provider_id: provider_id.clone(),
            name: "Pro".into(),
            description: None,
            active: true,
        };
        let stored = repo.insert(&plan).await.unwrap();
        assert!(stored.id > 0);
        assert!(matches!(
            repo.insert(&plan).await,
            Err(BillingError::ConstraintViolation(_))
        ));
        let removed = repo.delete_by_external("test", &provider_id).await.unwrap();
        assert_eq!(removed.map(|p| p.id), Some(stored.id));
    }

    #[tokio::test]
    #[ignore] // Requires database
    async fn test_ledger_records_once() {
        let ledger = PgLedger::new(pool().await);
        let event_id = format!("evt_test_{}", std::process::id());
        let payload = json!({ "id": event_id });
        assert!(ledger.record("test", &event_id, "customer.created", &payload).await.unwrap());
        assert!(!ledger.record("test", &event_id, "customer.created", &payload).await.unwrap());
        assert!(ledger.contains("test", &event_id).await.unwrap());
        let entry = ledger.get("test", &event_id).await.unwrap().unwrap();
        assert!(!entry.processed);
        assert_eq!(entry.payload, payload);
    }
}
