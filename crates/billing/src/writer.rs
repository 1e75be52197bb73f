//! The single write path into the mirror.
//!
//! Reconciliation and webhook application both go through [`MirrorWriter`], so a
//! remote record is converted, diffed and announced the same way whichever path
//! delivered it.

use std::collections::HashSet;
use std::sync::Arc;

use futures::future::BoxFuture;

use crate::entities::{EntityKind, InternalId, MirrorEntity, Price, Subscription};
use crate::error::{BillingError, BillingResult};
use crate::events::EventBus;
use crate::provider::BillingProvider;
use crate::repository::{EntityMirror, Repository};
use crate::sync::{ConvertContext, SyncEntity};

/// What an upsert did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome<E> {
    Added(E),
    Updated { previous: E, current: E },
    Unchanged(E),
}

impl<E> WriteOutcome<E> {
    /// The row as stored after the write
    pub fn row(&self) -> &E {
        match self {
            WriteOutcome::Added(row) | WriteOutcome::Unchanged(row) => row,
            WriteOutcome::Updated { current, .. } => current,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            WriteOutcome::Added(_) => "added",
            WriteOutcome::Updated { .. } => "updated",
            WriteOutcome::Unchanged(_) => "unchanged",
        }
    }
}

#[derive(Clone)]
pub struct MirrorWriter {
    mirror: EntityMirror,
    bus: Arc<EventBus>,
    provider: String,
}

impl MirrorWriter {
    pub fn new(mirror: EntityMirror, bus: Arc<EventBus>, provider: impl Into<String>) -> Self {
        Self {
            mirror,
            bus,
            provider: provider.into(),
        }
    }

    pub fn mirror(&self) -> &EntityMirror {
        &self.mirror
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }

    /// Converts `remote` and inserts or updates its row.
    ///
    /// With `backfill`, parents missing from the mirror are fetched from the
    /// provider and written first. Without it a missing parent is a
    /// `Conversion` error.
    pub async fn upsert<E: SyncEntity>(
        &self,
        remote: &E::Remote,
        backfill: Option<&dyn BillingProvider>,
    ) -> BillingResult<WriteOutcome<E>> {
        let ctx = ConvertContext::new(self, backfill);
        let converted = E::convert(remote, &ctx).await?;
        let repo = E::repository(&self.mirror);
        let provider_id = E::identify(remote);

        let outcome = match repo.get_by_external(&self.provider, provider_id).await? {
            Some(stored) => self.apply_update(repo, stored, converted).await?,
            None => match repo.insert(&converted).await {
                Ok(row) => {
                    self.bus.added(&row);
                    WriteOutcome::Added(row)
                }
                Err(BillingError::ConstraintViolation(reason)) => {
                    // Someone else inserted it between our lookup and insert
                    tracing::debug!(
                        kind = %E::KIND,
                        provider_id = %provider_id,
                        "Concurrent insert detected, updating instead"
                    );
                    let stored = repo
                        .get_by_external(&self.provider, provider_id)
                        .await?
                        .ok_or(BillingError::ConstraintViolation(reason))?;
                    self.apply_update(repo, stored, converted).await?
                }
                Err(err) => return Err(err),
            },
        };

        E::after_write(remote, outcome.row(), &self.mirror).await?;
        Ok(outcome)
    }

    async fn apply_update<E: SyncEntity>(
        &self,
        repo: &dyn Repository<E>,
        stored: E,
        mut converted: E,
    ) -> BillingResult<WriteOutcome<E>> {
        converted.carry_local(&stored);
        if converted.same_business_fields(&stored) {
            return Ok(WriteOutcome::Unchanged(stored));
        }
        let current = repo.update(&converted).await?;
        self.bus.updated(&stored, &current);
        Ok(WriteOutcome::Updated {
            previous: stored,
            current,
        })
    }

    /// Deletes one row by external id, together with the rows that reference it.
    pub async fn remove<E: SyncEntity>(&self, provider_id: &str) -> BillingResult<Option<E>> {
        let repo = E::repository(&self.mirror);
        let Some(stored) = repo.get_by_external(&self.provider, provider_id).await? else {
            return Ok(None);
        };
        self.remove_dependents(E::KIND, stored.id()).await?;

        let removed = repo.delete_by_external(&self.provider, provider_id).await?;
        if let Some(row) = &removed {
            self.bus.removed(row);
        }
        Ok(removed)
    }

    /// Deletes rows whose external id is not in `seen` and announces each one.
    ///
    /// Rows that still reference an orphan go first, as with [`Self::remove`].
    /// They may belong to a kind whose own listing failed in this pass.
    pub async fn remove_orphans<E: SyncEntity>(
        &self,
        seen: &HashSet<String>,
    ) -> BillingResult<Vec<E>> {
        let repo = E::repository(&self.mirror);
        for orphan in repo.list(&self.provider).await? {
            if !seen.contains(orphan.provider_id()) {
                self.remove_dependents(E::KIND, orphan.id()).await?;
            }
        }

        let removed = repo.remove_orphans(&self.provider, seen).await?;
        for row in &removed {
            self.bus.removed(row);
        }
        Ok(removed)
    }

    fn remove_dependents(&self, kind: EntityKind, id: InternalId) -> BoxFuture<'_, BillingResult<()>> {
        Box::pin(async move {
            match kind {
                EntityKind::Customer | EntityKind::Price => {
                    for subscription in self.referencing::<Subscription>(kind, id).await? {
                        self.delete_row(&subscription).await?;
                    }
                }
                EntityKind::Plan => {
                    for price in self.referencing::<Price>(kind, id).await? {
                        self.remove_dependents(EntityKind::Price, price.id).await?;
                        self.delete_row(&price).await?;
                    }
                }
                EntityKind::Subscription => {}
            }
            Ok(())
        })
    }

    async fn referencing<E: SyncEntity>(
        &self,
        kind: EntityKind,
        id: InternalId,
    ) -> BillingResult<Vec<E>> {
        Ok(E::repository(&self.mirror)
            .list(&self.provider)
            .await?
            .into_iter()
            .filter(|row| row.references(kind, id))
            .collect())
    }

    async fn delete_row<E: SyncEntity>(&self, row: &E) -> BillingResult<()> {
        let removed = E::repository(&self.mirror)
            .delete_by_external(&self.provider, row.provider_id())
            .await?;
        if let Some(removed) = removed {
            tracing::info!(
                kind = %E::KIND,
                provider_id = %removed.provider_id(),
                "Removed dependent row"
            );
            self.bus.removed(&removed);
        }
        Ok(())
    }
}
