//! In-memory mirror for tests and local tooling.
//!
//! Enforces the same `(provider, provider_id)` uniqueness as the Postgres schema
//! and counts writes so callers can assert that nothing was touched. Through
//! [`MemoryMirror::mirror`] the tables also enforce the schema's foreign keys:
//! a row can only point at existing parents, a referenced parent cannot be
//! deleted, and deleting a subscription drops its user links.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use time::OffsetDateTime;
use tokio::sync::RwLock;

use crate::entities::{Customer, EntityKind, InternalId, MirrorEntity, Plan, Price, Subscription};
use crate::error::{BillingError, BillingResult};
use crate::repository::{EntityMirror, LedgerEntry, Repository, SubscriptionUsers, WebhookLedger};

struct Table<E> {
    rows: BTreeMap<InternalId, E>,
    next_id: InternalId,
}

impl<E: MirrorEntity> Table<E> {
    fn find_external(&self, provider: &str, provider_id: &str) -> Option<&E> {
        self.rows
            .values()
            .find(|row| row.provider() == provider && row.provider_id() == provider_id)
    }
}

pub struct MemoryRepository<E> {
    table: RwLock<Table<E>>,
    writes: AtomicU64,
}

impl<E> Default for MemoryRepository<E> {
    fn default() -> Self {
        Self {
            table: RwLock::new(Table {
                rows: BTreeMap::new(),
                next_id: 1,
            }),
            writes: AtomicU64::new(0),
        }
    }
}

impl<E: MirrorEntity> MemoryRepository<E> {
    /// Inserts, updates and deletes performed so far
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    pub async fn len(&self) -> usize {
        self.table.read().await.rows.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    fn count_write(&self) {
        self.writes.fetch_add(1, Ordering::SeqCst);
    }

    async fn contains_id(&self, id: InternalId) -> bool {
        self.table.read().await.rows.contains_key(&id)
    }

    /// Whether any row, of any provider, references `(kind, id)`
    async fn any_references(&self, kind: EntityKind, id: InternalId) -> bool {
        self.table
            .read()
            .await
            .rows
            .values()
            .any(|row| row.references(kind, id))
    }
}

#[async_trait]
impl<E: MirrorEntity> Repository<E> for MemoryRepository<E> {
    async fn insert(&self, entity: &E) -> BillingResult<E> {
        let mut table = self.table.write().await;
        if table
            .find_external(entity.provider(), entity.provider_id())
            .is_some()
        {
            return Err(BillingError::ConstraintViolation(format!(
                "{} ({}, {}) already exists",
                E::KIND,
                entity.provider(),
                entity.provider_id()
            )));
        }
        let mut row = entity.clone();
        row.set_id(table.next_id);
        table.next_id += 1;
        table.rows.insert(row.id(), row.clone());
        self.count_write();
        Ok(row)
    }

    async fn update(&self, entity: &E) -> BillingResult<E> {
        let mut table = self.table.write().await;
        let clash = table
            .find_external(entity.provider(), entity.provider_id())
            .is_some_and(|other| other.id() != entity.id());
        if clash {
            return Err(BillingError::ConstraintViolation(format!(
                "{} ({}, {}) already exists",
                E::KIND,
                entity.provider(),
                entity.provider_id()
            )));
        }
        let slot = table
            .rows
            .get_mut(&entity.id())
            .ok_or_else(|| BillingError::NotFound(format!("{} {}", E::KIND, entity.id())))?;
        *slot = entity.clone();
        self.count_write();
        Ok(entity.clone())
    }

    async fn get(&self, id: InternalId) -> BillingResult<Option<E>> {
        Ok(self.table.read().await.rows.get(&id).cloned())
    }

    async fn get_by_external(
        &self,
        provider: &str,
        provider_id: &str,
    ) -> BillingResult<Option<E>> {
        Ok(self
            .table
            .read()
            .await
            .find_external(provider, provider_id)
            .cloned())
    }

    async fn delete_by_external(
        &self,
        provider: &str,
        provider_id: &str,
    ) -> BillingResult<Option<E>> {
        let mut table = self.table.write().await;
        let Some(id) = table.find_external(provider, provider_id).map(|row| row.id()) else {
            return Ok(None);
        };
        let removed = table.rows.remove(&id);
        self.count_write();
        Ok(removed)
    }

    async fn remove_orphans(
        &self,
        provider: &str,
        seen: &HashSet<String>,
    ) -> BillingResult<Vec<E>> {
        let mut table = self.table.write().await;
        let orphan_ids: Vec<InternalId> = table
            .rows
            .values()
            .filter(|row| row.provider() == provider && !seen.contains(row.provider_id()))
            .map(|row| row.id())
            .collect();
        let removed: Vec<E> = orphan_ids
            .iter()
            .filter_map(|id| table.rows.remove(id))
            .collect();
        if !removed.is_empty() {
            self.count_write();
        }
        Ok(removed)
    }

    async fn list(&self, provider: &str) -> BillingResult<Vec<E>> {
        Ok(self
            .table
            .read()
            .await
            .rows
            .values()
            .filter(|row| row.provider() == provider)
            .cloned()
            .collect())
    }
}

#[derive(Default)]
pub struct MemoryLedger {
    entries: RwLock<HashMap<(String, String), LedgerEntry>>,
}

impl MemoryLedger {
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl WebhookLedger for MemoryLedger {
    async fn contains(&self, provider: &str, event_id: &str) -> BillingResult<bool> {
        Ok(self
            .entries
            .read()
            .await
            .contains_key(&(provider.to_string(), event_id.to_string())))
    }

    async fn record(
        &self,
        provider: &str,
        event_id: &str,
        event_type: &str,
        payload: &Value,
    ) -> BillingResult<bool> {
        let mut entries = self.entries.write().await;
        let key = (provider.to_string(), event_id.to_string());
        if entries.contains_key(&key) {
            return Ok(false);
        }
        entries.insert(
            key,
            LedgerEntry {
                provider: provider.to_string(),
                event_id: event_id.to_string(),
                event_type: event_type.to_string(),
                payload: payload.clone(),
                processed: false,
                received_at: OffsetDateTime::now_utc(),
            },
        );
        Ok(true)
    }

    async fn get(&self, provider: &str, event_id: &str) -> BillingResult<Option<LedgerEntry>> {
        Ok(self
            .entries
            .read()
            .await
            .get(&(provider.to_string(), event_id.to_string()))
            .cloned())
    }
}

#[derive(Default)]
pub struct MemorySubscriptionUsers {
    links: RwLock<BTreeSet<(InternalId, i64)>>,
}

impl MemorySubscriptionUsers {
    async fn unlink_all(&self, subscription_id: InternalId) {
        self.links
            .write()
            .await
            .retain(|(sub, _)| *sub != subscription_id);
    }
}

#[async_trait]
impl SubscriptionUsers for MemorySubscriptionUsers {
    async fn link(&self, subscription_id: InternalId, user_id: i64) -> BillingResult<()> {
        self.links.write().await.insert((subscription_id, user_id));
        Ok(())
    }

    async fn users_of(&self, subscription_id: InternalId) -> BillingResult<Vec<i64>> {
        Ok(self
            .links
            .read()
            .await
            .iter()
            .filter(|(sub, _)| *sub == subscription_id)
            .map(|(_, user)| *user)
            .collect())
    }
}

/// Concrete in-memory stores, kept so tests can inspect them
#[derive(Clone, Default)]
pub struct MemoryMirror {
    pub customers: Arc<MemoryRepository<Customer>>,
    pub plans: Arc<MemoryRepository<Plan>>,
    pub prices: Arc<MemoryRepository<Price>>,
    pub subscriptions: Arc<MemoryRepository<Subscription>>,
    pub subscription_users: Arc<MemorySubscriptionUsers>,
    pub ledger: Arc<MemoryLedger>,
}

impl MemoryMirror {
    /// Repository handles over these tables, foreign keys enforced
    pub fn mirror(&self) -> EntityMirror {
        EntityMirror {
            customers: Arc::new(Constrained::new(self.customers.clone(), self.clone())),
            plans: Arc::new(Constrained::new(self.plans.clone(), self.clone())),
            prices: Arc::new(Constrained::new(self.prices.clone(), self.clone())),
            subscriptions: Arc::new(Constrained::new(self.subscriptions.clone(), self.clone())),
            subscription_users: self.subscription_users.clone(),
            ledger: self.ledger.clone(),
        }
    }

    async fn row_exists(&self, kind: EntityKind, id: InternalId) -> bool {
        match kind {
            EntityKind::Customer => self.customers.contains_id(id).await,
            EntityKind::Plan => self.plans.contains_id(id).await,
            EntityKind::Price => self.prices.contains_id(id).await,
            EntityKind::Subscription => self.subscriptions.contains_id(id).await,
        }
    }

    async fn is_referenced(&self, kind: EntityKind, id: InternalId) -> bool {
        match kind {
            EntityKind::Plan => self.prices.any_references(kind, id).await,
            EntityKind::Customer | EntityKind::Price => {
                self.subscriptions.any_references(kind, id).await
            }
            EntityKind::Subscription => false,
        }
    }

    /// Entity writes across all four tables
    pub fn write_count(&self) -> u64 {
        self.customers.write_count()
            + self.plans.write_count()
            + self.prices.write_count()
            + self.subscriptions.write_count()
    }
}

/// One table seen through its foreign keys into the rest of a [`MemoryMirror`]
struct Constrained<E> {
    table: Arc<MemoryRepository<E>>,
    tables: MemoryMirror,
}

impl<E: MirrorEntity> Constrained<E> {
    fn new(table: Arc<MemoryRepository<E>>, tables: MemoryMirror) -> Self {
        Self { table, tables }
    }

    async fn check_parents(&self, entity: &E) -> BillingResult<()> {
        for (kind, id) in entity.parents() {
            if !self.tables.row_exists(kind, id).await {
                return Err(BillingError::Database(format!(
                    "{} ({}, {}) violates foreign key: {kind} {id} does not exist",
                    E::KIND,
                    entity.provider(),
                    entity.provider_id()
                )));
            }
        }
        Ok(())
    }

    async fn check_unreferenced(&self, row: &E) -> BillingResult<()> {
        if self.tables.is_referenced(E::KIND, row.id()).await {
            return Err(BillingError::Database(format!(
                "{} ({}, {}) is still referenced",
                E::KIND,
                row.provider(),
                row.provider_id()
            )));
        }
        Ok(())
    }

    async fn drop_links(&self, row: &E) {
        if E::KIND == EntityKind::Subscription {
            self.tables.subscription_users.unlink_all(row.id()).await;
        }
    }
}

#[async_trait]
impl<E: MirrorEntity> Repository<E> for Constrained<E> {
    async fn insert(&self, entity: &E) -> BillingResult<E> {
        self.check_parents(entity).await?;
        self.table.insert(entity).await
    }

    async fn update(&self, entity: &E) -> BillingResult<E> {
        self.check_parents(entity).await?;
        self.table.update(entity).await
    }

    async fn get(&self, id: InternalId) -> BillingResult<Option<E>> {
        self.table.get(id).await
    }

    async fn get_by_external(
        &self,
        provider: &str,
        provider_id: &str,
    ) -> BillingResult<Option<E>> {
        self.table.get_by_external(provider, provider_id).await
    }

    async fn delete_by_external(
        &self,
        provider: &str,
        provider_id: &str,
    ) -> BillingResult<Option<E>> {
        if let Some(row) = self.table.get_by_external(provider, provider_id).await? {
            self.check_unreferenced(&row).await?;
        }
        let removed = self.table.delete_by_external(provider, provider_id).await?;
        if let Some(row) = &removed {
            self.drop_links(row).await;
        }
        Ok(removed)
    }

    async fn remove_orphans(
        &self,
        provider: &str,
        seen: &HashSet<String>,
    ) -> BillingResult<Vec<E>> {
        // All or nothing, like the single DELETE statement in Postgres
        for row in self.table.list(provider).await? {
            if !seen.contains(row.provider_id()) {
                self.check_unreferenced(&row).await?;
            }
        }
        let removed = self.table.remove_orphans(provider, seen).await?;
        for row in &removed {
            self.drop_links(row).await;
        }
        Ok(removed)
    }

    async fn list(&self, provider: &str) -> BillingResult<Vec<E>> {
        self.table.list(provider).await
    }
}
