//! Full reconciliation against the provider
//!
//! A pass has two phases:
//!
//! 1. For each entity type in dependency order (customer, plan, price,
//!    subscription) enumerate the remote collection and upsert every record.
//! 2. For each type whose enumeration completed, in reverse dependency order,
//!    remove the mirror rows that were not seen. Children go first so a removed
//!    parent is never still referenced.
//!
//! A transport error while enumerating one type fails that type only; later
//! types are still attempted. Passes are not reentrant: callers serialize them.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use futures::StreamExt;
use serde::Serialize;

use crate::entities::{Customer, EntityKind, Plan, Price, Subscription};
use crate::error::{BillingError, BillingResult, SyncError};
use crate::provider::BillingProvider;
use crate::sync::SyncEntity;
use crate::writer::{MirrorWriter, WriteOutcome};

/// What a pass does about remote records that could not be converted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OrphanPolicy {
    /// Unconvertible records still count as seen, so their stale mirror rows are
    /// kept; orphan removal runs for everything else.
    #[default]
    RetainUnconvertible,
    /// Any failed record skips orphan removal for its entity type in this pass.
    SkipOnConversionFailure,
}

impl FromStr for OrphanPolicy {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "retain-unconvertible" => Ok(OrphanPolicy::RetainUnconvertible),
            "skip-on-conversion-failure" => Ok(OrphanPolicy::SkipOnConversionFailure),
            other => Err(BillingError::Config(format!("Unknown orphan policy: {other}"))),
        }
    }
}

/// Counts for one entity type in one pass
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntitySyncReport {
    pub kind: EntityKind,
    pub seen: usize,
    pub added: usize,
    pub updated: usize,
    pub unchanged: usize,
    /// Records skipped because they could not be converted or written
    pub failed: usize,
    pub removed: usize,
    /// Whether orphan removal ran
    pub orphans_checked: bool,
}

impl EntitySyncReport {
    pub fn new(kind: EntityKind) -> Self {
        Self {
            kind,
            seen: 0,
            added: 0,
            updated: 0,
            unchanged: 0,
            failed: 0,
            removed: 0,
            orphans_checked: false,
        }
    }

    /// Whether the pass wrote anything for this type
    pub fn has_changes(&self) -> bool {
        self.added + self.updated + self.removed > 0
    }
}

impl fmt::Display for EntitySyncReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: seen={} added={} updated={} unchanged={} failed={} removed={}",
            self.kind, self.seen, self.added, self.updated, self.unchanged, self.failed, self.removed
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub entities: Vec<EntitySyncReport>,
}

impl SyncReport {
    pub fn get(&self, kind: EntityKind) -> Option<&EntitySyncReport> {
        self.entities.iter().find(|e| e.kind == kind)
    }

    pub fn has_changes(&self) -> bool {
        self.entities.iter().any(EntitySyncReport::has_changes)
    }
}

/// Result of phase 1 for one type
struct Enumeration {
    report: EntitySyncReport,
    seen: HashSet<String>,
}

pub struct Reconciler {
    provider: Arc<dyn BillingProvider>,
    writer: MirrorWriter,
    orphan_policy: OrphanPolicy,
}

impl Reconciler {
    pub fn new(provider: Arc<dyn BillingProvider>, writer: MirrorWriter) -> Self {
        Self {
            provider,
            writer,
            orphan_policy: OrphanPolicy::default(),
        }
    }

    pub fn with_orphan_policy(mut self, policy: OrphanPolicy) -> Self {
        self.orphan_policy = policy;
        self
    }

    pub fn orphan_policy(&self) -> OrphanPolicy {
        self.orphan_policy
    }

    /// Reconciles all four entity types.
    pub async fn sync(&self) -> Result<SyncReport, SyncError> {
        tracing::info!(provider = %self.writer.provider(), "Starting billing mirror sync");

        let mut report = SyncReport::default();
        let mut failures = Vec::new();
        let mut enumerated = Vec::new();

        for kind in EntityKind::DEPENDENCY_ORDER {
            match self.enumerate_kind(kind).await {
                Ok(enumeration) => enumerated.push(enumeration),
                Err((partial, err)) => {
                    report.entities.push(partial);
                    failures.push((kind, err));
                }
            }
        }

        for mut enumeration in enumerated.into_iter().rev() {
            let kind = enumeration.report.kind;
            if let Err(err) = self.finish_kind(&mut enumeration).await {
                tracing::error!(kind = %kind, error = %err, "Orphan removal failed");
                failures.push((kind, err));
            }
            report.entities.push(enumeration.report);
        }

        report.entities.sort_by_key(|e| e.kind);
        failures.sort_by_key(|(kind, _)| *kind);

        for entity in &report.entities {
            tracing::info!(
                kind = %entity.kind,
                seen = entity.seen,
                added = entity.added,
                updated = entity.updated,
                unchanged = entity.unchanged,
                failed = entity.failed,
                removed = entity.removed,
                orphans_checked = entity.orphans_checked,
                "Entity sync complete"
            );
        }

        if failures.is_empty() {
            Ok(report)
        } else {
            Err(SyncError { failures, report })
        }
    }

    /// Reconciles one entity type, orphan removal included.
    pub async fn sync_kind(&self, kind: EntityKind) -> BillingResult<EntitySyncReport> {
        let mut enumeration = self.enumerate_kind(kind).await.map_err(|(_, err)| err)?;
        self.finish_kind(&mut enumeration).await?;
        Ok(enumeration.report)
    }

    async fn enumerate_kind(
        &self,
        kind: EntityKind,
    ) -> Result<Enumeration, (EntitySyncReport, BillingError)> {
        match kind {
            EntityKind::Customer => self.enumerate::<Customer>().await,
            EntityKind::Plan => self.enumerate::<Plan>().await,
            EntityKind::Price => self.enumerate::<Price>().await,
            EntityKind::Subscription => self.enumerate::<Subscription>().await,
        }
    }

    async fn enumerate<E: SyncEntity>(
        &self,
    ) -> Result<Enumeration, (EntitySyncReport, BillingError)> {
        let mut report = EntitySyncReport::new(E::KIND);
        let mut seen = HashSet::new();
        let mut remote_records = E::enumerate(self.provider.as_ref());

        while let Some(next) = remote_records.next().await {
            let remote = match next {
                Ok(remote) => remote,
                Err(err) => {
                    tracing::error!(
                        kind = %E::KIND,
                        seen = report.seen,
                        error = %err,
                        "Enumeration failed, skipping orphan removal"
                    );
                    return Err((report, err));
                }
            };

            let provider_id = E::identify(&remote).to_string();
            report.seen += 1;

            match self.writer.upsert::<E>(&remote, None).await {
                Ok(WriteOutcome::Added(_)) => report.added += 1,
                Ok(WriteOutcome::Updated { .. }) => report.updated += 1,
                Ok(WriteOutcome::Unchanged(_)) => report.unchanged += 1,
                Err(err) => {
                    report.failed += 1;
                    tracing::warn!(
                        kind = %E::KIND,
                        provider_id = %provider_id,
                        error = %err,
                        "Skipping record that could not be mirrored"
                    );
                }
            }

            seen.insert(provider_id);
        }

        Ok(Enumeration { report, seen })
    }

    async fn finish_kind(&self, enumeration: &mut Enumeration) -> BillingResult<()> {
        let report = &mut enumeration.report;
        if report.failed > 0 && self.orphan_policy == OrphanPolicy::SkipOnConversionFailure {
            tracing::warn!(
                kind = %report.kind,
                failed = report.failed,
                "Skipping orphan removal after record failures"
            );
            return Ok(());
        }

        let seen = &enumeration.seen;
        report.removed = match report.kind {
            EntityKind::Customer => self.writer.remove_orphans::<Customer>(seen).await?.len(),
            EntityKind::Plan => self.writer.remove_orphans::<Plan>(seen).await?.len(),
            EntityKind::Price => self.writer.remove_orphans::<Price>(seen).await?.len(),
            EntityKind::Subscription => {
                self.writer.remove_orphans::<Subscription>(seen).await?.len()
            }
        };
        report.orphans_checked = true;
        Ok(())
    }
}
