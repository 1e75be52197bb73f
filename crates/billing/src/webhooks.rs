//! Webhook intake and application
//!
//! The request path verifies the signature, checks the ledger, records the event
//! and hands it to a bounded queue. A single consumer task applies queued events
//! in arrival order through [`MirrorWriter`], the same path reconciliation uses.
//!
//! Queue space is reserved before the ledger row is written. Once an event is in
//! the ledger it is guaranteed a slot, and a full queue is reported to the
//! provider (which retries) without leaving a ledger row behind for an event that
//! was never applied.
//!
//! Handler failures are logged and dropped. Recovery is the provider's
//! redelivery, deduplicated by the ledger.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::entities::{Customer, EntityKind, MirrorEntity, Plan, Price, Subscription};
use crate::error::{BillingError, BillingResult};
use crate::provider::{BillingProvider, ProviderEvent, RemoteRecord};
use crate::repository::WebhookLedger;
use crate::writer::{MirrorWriter, WriteOutcome};

/// Default body cap
pub const DEFAULT_MAX_BODY_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookAction {
    /// Created or updated: convert and upsert the carried object
    Upsert,
    /// Remove the row with the carried object's id
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Route {
    pub kind: EntityKind,
    pub action: WebhookAction,
}

/// Maps provider event types to mirror operations
#[derive(Debug, Clone, Default)]
pub struct HandlerTable {
    routes: HashMap<String, Route>,
}

impl HandlerTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, event_type: impl Into<String>, kind: EntityKind, action: WebhookAction) -> Self {
        self.routes.insert(event_type.into(), Route { kind, action });
        self
    }

    /// Product, price, customer and subscription lifecycle events
    pub fn stripe() -> Self {
        use WebhookAction::{Delete, Upsert};

        Self::new()
            .with("product.created", EntityKind::Plan, Upsert)
            .with("product.updated", EntityKind::Plan, Upsert)
            .with("product.deleted", EntityKind::Plan, Delete)
            .with("price.created", EntityKind::Price, Upsert)
            .with("price.updated", EntityKind::Price, Upsert)
            .with("price.deleted", EntityKind::Price, Delete)
            .with("customer.created", EntityKind::Customer, Upsert)
            .with("customer.updated", EntityKind::Customer, Upsert)
            .with("customer.deleted", EntityKind::Customer, Delete)
            .with("customer.subscription.created", EntityKind::Subscription, Upsert)
            .with("customer.subscription.updated", EntityKind::Subscription, Upsert)
            .with("customer.subscription.deleted", EntityKind::Subscription, Delete)
    }

    pub fn route(&self, event_type: &str) -> Option<Route> {
        self.routes.get(event_type).copied()
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct WebhookConfig {
    /// Events accepted but not yet applied
    pub queue_capacity: usize,
    /// How long a request waits for queue space before failing with 503
    pub enqueue_timeout: Duration,
    pub max_body_bytes: usize,
    /// Fetch parents missing from the mirror instead of failing the event
    pub backfill: bool,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
            enqueue_timeout: Duration::from_secs(5),
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            backfill: true,
        }
    }
}

/// Successful outcomes of [`WebhookProcessor::receive`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acknowledgement {
    /// Ledgered and queued for application
    Queued,
    /// Already in the ledger; nothing queued
    Duplicate,
}

pub struct WebhookProcessor {
    provider: Arc<dyn BillingProvider>,
    ledger: Arc<dyn WebhookLedger>,
    queue: mpsc::Sender<ProviderEvent>,
    config: WebhookConfig,
}

impl WebhookProcessor {
    /// Spawns the consumer task and returns the intake side with its handle.
    pub fn start(
        provider: Arc<dyn BillingProvider>,
        writer: MirrorWriter,
        handlers: HandlerTable,
        config: WebhookConfig,
    ) -> (Self, WebhookConsumer) {
        let (queue, events) = mpsc::channel(config.queue_capacity.max(1));
        let (shutdown, shutdown_rx) = watch::channel(false);

        let applier = EventApplier {
            provider: provider.clone(),
            writer: writer.clone(),
            handlers,
            backfill: config.backfill,
        };
        let handle = tokio::spawn(applier.run(events, shutdown_rx));

        let processor = Self {
            provider,
            ledger: writer.mirror().ledger.clone(),
            queue,
            config,
        };
        (processor, WebhookConsumer { shutdown, handle })
    }

    pub fn config(&self) -> &WebhookConfig {
        &self.config
    }

    /// False once the consumer has stopped
    pub fn is_accepting(&self) -> bool {
        !self.queue.is_closed()
    }

    /// Request path: verify, deduplicate, ledger, enqueue.
    pub async fn receive(&self, payload: &[u8], signature: &str) -> BillingResult<Acknowledgement> {
        if payload.len() > self.config.max_body_bytes {
            return Err(BillingError::PayloadTooLarge {
                size: payload.len(),
                limit: self.config.max_body_bytes,
            });
        }

        let event = self.provider.verify_event(payload, signature)?;
        let provider = self.provider.name();

        if self.ledger.contains(provider, &event.id).await? {
            tracing::info!(
                event_id = %event.id,
                event_type = %event.event_type,
                "Webhook event already received, skipping"
            );
            return Ok(Acknowledgement::Duplicate);
        }

        let permit = match tokio::time::timeout(self.config.enqueue_timeout, self.queue.reserve()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => {
                return Err(BillingError::QueueUnavailable(
                    "webhook consumer has stopped".to_string(),
                ))
            }
            Err(_) => {
                tracing::warn!(event_id = %event.id, "Webhook queue full");
                return Err(BillingError::QueueUnavailable(
                    "webhook queue is full".to_string(),
                ));
            }
        };

        let inserted = self
            .ledger
            .record(provider, &event.id, &event.event_type, &event.payload)
            .await?;
        if !inserted {
            // A concurrent delivery of the same event won the insert
            tracing::info!(event_id = %event.id, "Webhook event recorded concurrently, skipping");
            return Ok(Acknowledgement::Duplicate);
        }

        tracing::info!(
            event_id = %event.id,
            event_type = %event.event_type,
            "Webhook event queued"
        );
        permit.send(event);
        Ok(Acknowledgement::Queued)
    }
}

/// Handle to the consumer task
pub struct WebhookConsumer {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<u64>,
}

impl WebhookConsumer {
    /// Stops intake, applies every event already queued, and returns how many
    /// events the consumer handled over its lifetime.
    pub async fn shutdown(self) -> BillingResult<u64> {
        // Err only if the task already exited, which the join below reports
        let _ = self.shutdown.send(true);
        self.handle
            .await
            .map_err(|e| BillingError::Internal(format!("Webhook consumer failed: {e}")))
    }
}

struct EventApplier {
    provider: Arc<dyn BillingProvider>,
    writer: MirrorWriter,
    handlers: HandlerTable,
    backfill: bool,
}

impl EventApplier {
    async fn run(
        self,
        mut events: mpsc::Receiver<ProviderEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) -> u64 {
        let mut handled = 0u64;

        loop {
            tokio::select! {
                biased;

                next = events.recv() => match next {
                    Some(event) => {
                        self.apply_logged(event).await;
                        handled += 1;
                    }
                    None => break,
                },

                changed = shutdown.changed() => {
                    let requested = changed.is_ok();
                    if requested && !*shutdown.borrow() {
                        continue;
                    }
                    if requested {
                        tracing::info!("Webhook consumer draining queue");
                        events.close();
                    }
                    while let Some(event) = events.recv().await {
                        self.apply_logged(event).await;
                        handled += 1;
                    }
                    break;
                }
            }
        }

        tracing::info!(handled = handled, "Webhook consumer stopped");
        handled
    }

    async fn apply_logged(&self, event: ProviderEvent) {
        if let Err(err) = self.apply(&event).await {
            tracing::error!(
                event_id = %event.id,
                event_type = %event.event_type,
                error = %err,
                "Failed to apply webhook event"
            );
        }
    }

    async fn apply(&self, event: &ProviderEvent) -> BillingResult<()> {
        let Some(route) = self.handlers.route(&event.event_type) else {
            tracing::debug!(event_type = %event.event_type, "No handler for webhook event type");
            return Ok(());
        };

        match route.action {
            WebhookAction::Upsert => {
                let backfill = self.backfill.then_some(self.provider.as_ref());
                match self.provider.decode(route.kind, &event.object)? {
                    RemoteRecord::Customer(remote) => {
                        log_write(event, &self.writer.upsert::<Customer>(&remote, backfill).await?)
                    }
                    RemoteRecord::Plan(remote) => {
                        log_write(event, &self.writer.upsert::<Plan>(&remote, backfill).await?)
                    }
                    RemoteRecord::Price(remote) => {
                        log_write(event, &self.writer.upsert::<Price>(&remote, backfill).await?)
                    }
                    RemoteRecord::Subscription(remote) => log_write(
                        event,
                        &self.writer.upsert::<Subscription>(&remote, backfill).await?,
                    ),
                }
            }
            WebhookAction::Delete => {
                let provider_id = event.object_id().ok_or_else(|| {
                    BillingError::Conversion(format!("Event {} carries no object id", event.id))
                })?;
                let removed = match route.kind {
                    EntityKind::Customer => self.writer.remove::<Customer>(provider_id).await?.is_some(),
                    EntityKind::Plan => self.writer.remove::<Plan>(provider_id).await?.is_some(),
                    EntityKind::Price => self.writer.remove::<Price>(provider_id).await?.is_some(),
                    EntityKind::Subscription => {
                        self.writer.remove::<Subscription>(provider_id).await?.is_some()
                    }
                };
                if !removed {
                    tracing::debug!(
                        event_id = %event.id,
                        kind = %route.kind,
                        provider_id = %provider_id,
                        "Delete for a row that is not mirrored"
                    );
                }
            }
        }
        Ok(())
    }
}

fn log_write<E: MirrorEntity>(event: &ProviderEvent, outcome: &WriteOutcome<E>) {
    tracing::debug!(
        event_id = %event.id,
        kind = %E::KIND,
        id = outcome.row().id(),
        outcome = outcome.label(),
        "Applied webhook event"
    );
}
