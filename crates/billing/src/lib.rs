// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Paymirror Billing Module
//!
//! Keeps a local, queryable mirror of provider-owned billing state (customers,
//! plans, prices, subscriptions).
//!
//! ## Features
//!
//! - **Entity Mirror**: generic repository over Postgres or memory, unique on
//!   `(provider, provider_id)`
//! - **Reconciler**: full pull in dependency order, diff-and-update, orphan removal
//! - **Webhooks**: signature check, ledger dedup, bounded queue, single ordered consumer
//! - **Event Bus**: typed added/updated/removed observers per entity type
//! - **Stripe**: paginated listing, single-record reads, signature verification

pub mod client;
pub mod config;
pub mod convert;
pub mod entities;
pub mod error;
pub mod events;
pub mod memory;
pub mod postgres;
pub mod provider;
pub mod reconcile;
pub mod repository;
pub mod signature;
pub mod sync;
pub mod webhooks;
pub mod writer;

#[cfg(test)]
mod testing;

// Client
pub use client::{StripeClient, StripeConfig, STRIPE_PROVIDER};

// Config
pub use config::MirrorConfig;

// Entities
pub use entities::{
    Customer, EntityKind, InternalId, MirrorEntity, Plan, Price, PricingSchedule, Subscription,
};

// Error
pub use error::{BillingError, BillingResult, SyncError};

// Events
pub use events::{ChangeLogger, EventBus, MirrorObserver, Observed};

// Provider
pub use provider::{
    BillingProvider, ProviderEvent, RemoteCustomer, RemotePlan, RemotePrice, RemoteRecord,
    RemoteStream, RemoteSubscription,
};

// Reconciler
pub use reconcile::{EntitySyncReport, OrphanPolicy, Reconciler, SyncReport};

// Repositories
pub use memory::MemoryMirror;
pub use repository::{EntityMirror, LedgerEntry, Repository, SubscriptionUsers, WebhookLedger};

// Sync
pub use sync::SyncEntity;
pub use writer::{MirrorWriter, WriteOutcome};

// Webhooks
pub use webhooks::{
    Acknowledgement, HandlerTable, WebhookAction, WebhookConfig, WebhookConsumer,
    WebhookProcessor,
};

use std::sync::Arc;

use sqlx::PgPool;

/// Main billing mirror service that wires the provider, storage and event bus together
pub struct BillingMirror {
    provider: Arc<dyn BillingProvider>,
    writer: MirrorWriter,
    config: MirrorConfig,
}

impl BillingMirror {
    /// Stripe provider and Postgres mirror, configured from environment variables
    pub fn from_env(pool: PgPool, bus: EventBus) -> BillingResult<Self> {
        let provider = Arc::new(StripeClient::from_env()?);
        let config = MirrorConfig::from_env()?;
        Ok(Self::new(provider, EntityMirror::postgres(pool), bus, config))
    }

    /// As [`Self::from_env`] for processes that never receive webhooks
    pub fn read_only_from_env(pool: PgPool, bus: EventBus) -> BillingResult<Self> {
        let provider = Arc::new(StripeClient::new(StripeConfig::read_only_from_env()?));
        let config = MirrorConfig::from_env()?;
        Ok(Self::new(provider, EntityMirror::postgres(pool), bus, config))
    }

    pub fn new(
        provider: Arc<dyn BillingProvider>,
        mirror: EntityMirror,
        bus: EventBus,
        config: MirrorConfig,
    ) -> Self {
        let writer = MirrorWriter::new(mirror, Arc::new(bus), provider.name());
        Self {
            provider,
            writer,
            config,
        }
    }

    pub fn provider(&self) -> &Arc<dyn BillingProvider> {
        &self.provider
    }

    pub fn mirror(&self) -> &EntityMirror {
        self.writer.mirror()
    }

    pub fn writer(&self) -> &MirrorWriter {
        &self.writer
    }

    pub fn config(&self) -> &MirrorConfig {
        &self.config
    }

    pub fn reconciler(&self) -> Reconciler {
        Reconciler::new(self.provider.clone(), self.writer.clone())
            .with_orphan_policy(self.config.orphan_policy)
    }

    /// Starts the webhook consumer with the Stripe handler table.
    pub fn start_webhooks(&self) -> (WebhookProcessor, WebhookConsumer) {
        self.start_webhooks_with(HandlerTable::stripe())
    }

    pub fn start_webhooks_with(&self, handlers: HandlerTable) -> (WebhookProcessor, WebhookConsumer) {
        WebhookProcessor::start(
            self.provider.clone(),
            self.writer.clone(),
            handlers,
            self.config.webhook.clone(),
        )
    }
}
