//! Per-entity sync capabilities
//!
//! Each entity type says how to identify a remote record (external id only),
//! how to enumerate the remote collection, and how to convert a record into a
//! mirror row. The reconciler and the webhook consumer are written once over
//! [`SyncEntity`].

use std::fmt;

use async_trait::async_trait;

use crate::entities::{Customer, InternalId, Plan, Price, Subscription};
use crate::error::{BillingError, BillingResult};
use crate::events::Observed;
use crate::provider::{
    BillingProvider, RemoteCustomer, RemotePlan, RemotePrice, RemoteRecord, RemoteStream,
    RemoteSubscription,
};
use crate::repository::{EntityMirror, Repository};
use crate::writer::MirrorWriter;

/// Lookup context handed to [`SyncEntity::convert`]
pub struct ConvertContext<'a> {
    writer: &'a MirrorWriter,
    backfill: Option<&'a dyn BillingProvider>,
}

impl<'a> ConvertContext<'a> {
    pub(crate) fn new(writer: &'a MirrorWriter, backfill: Option<&'a dyn BillingProvider>) -> Self {
        Self { writer, backfill }
    }

    pub fn provider(&self) -> &str {
        self.writer.provider()
    }

    /// Internal id of the mirrored `P` with external id `provider_id`.
    pub async fn resolve<P: SyncEntity>(&self, provider_id: &str) -> BillingResult<InternalId> {
        let repo = P::repository(self.writer.mirror());
        if let Some(row) = repo.get_by_external(self.provider(), provider_id).await? {
            return Ok(row.id());
        }

        let Some(provider) = self.backfill else {
            return Err(BillingError::Conversion(format!(
                "{} {provider_id} is not mirrored",
                P::KIND
            )));
        };

        let record = provider.fetch(P::KIND, provider_id).await?.ok_or_else(|| {
            BillingError::Conversion(format!(
                "{} {provider_id} does not exist at the provider",
                P::KIND
            ))
        })?;
        tracing::info!(kind = %P::KIND, provider_id = %provider_id, "Backfilling missing parent");
        let outcome = self
            .writer
            .upsert::<P>(&P::from_record(record)?, Some(provider))
            .await?;
        Ok(outcome.row().id())
    }
}

#[async_trait]
pub trait SyncEntity: Observed {
    type Remote: fmt::Debug + Send + Sync;

    fn repository(mirror: &EntityMirror) -> &dyn Repository<Self>;

    /// External id of a remote record. Never fails, even for records that
    /// cannot be converted.
    fn identify(remote: &Self::Remote) -> &str;

    fn enumerate(provider: &dyn BillingProvider) -> RemoteStream<'_, Self::Remote>;

    fn from_record(record: RemoteRecord) -> BillingResult<Self::Remote>;

    /// Builds the mirror row for `remote`. Parent references are resolved
    /// through `ctx`; the internal id is left at 0.
    async fn convert(remote: &Self::Remote, ctx: &ConvertContext<'_>) -> BillingResult<Self>;

    /// Runs after every successful upsert, including no-op ones.
    async fn after_write(
        _remote: &Self::Remote,
        _row: &Self,
        _mirror: &EntityMirror,
    ) -> BillingResult<()> {
        Ok(())
    }
}

fn wrong_record<T>(expected: &str, record: &RemoteRecord) -> BillingResult<T> {
    Err(BillingError::Conversion(format!(
        "expected a {expected} record, got {} {}",
        record.kind(),
        record.id()
    )))
}

#[async_trait]
impl SyncEntity for Customer {
    type Remote = RemoteCustomer;

    fn repository(mirror: &EntityMirror) -> &dyn Repository<Self> {
        mirror.customers.as_ref()
    }

    fn identify(remote: &RemoteCustomer) -> &str {
        &remote.id
    }

    fn enumerate(provider: &dyn BillingProvider) -> RemoteStream<'_, RemoteCustomer> {
        provider.customers()
    }

    fn from_record(record: RemoteRecord) -> BillingResult<RemoteCustomer> {
        match record {
            RemoteRecord::Customer(remote) => Ok(remote),
            other => wrong_record("customer", &other),
        }
    }

    async fn convert(remote: &RemoteCustomer, ctx: &ConvertContext<'_>) -> BillingResult<Self> {
        Ok(Customer {
            id: 0,
            user_id: remote.user_id,
            provider: ctx.provider().to_string(),
            provider_id: remote.id.clone(),
            name: remote.name.clone(),
            email: remote.email.clone(),
        })
    }
}

#[async_trait]
impl SyncEntity for Plan {
    type Remote = RemotePlan;

    fn repository(mirror: &EntityMirror) -> &dyn Repository<Self> {
        mirror.plans.as_ref()
    }

    fn identify(remote: &RemotePlan) -> &str {
        &remote.id
    }

    fn enumerate(provider: &dyn BillingProvider) -> RemoteStream<'_, RemotePlan> {
        provider.plans()
    }

    fn from_record(record: RemoteRecord) -> BillingResult<RemotePlan> {
        match record {
            RemoteRecord::Plan(remote) => Ok(remote),
            other => wrong_record("plan", &other),
        }
    }

    async fn convert(remote: &RemotePlan, ctx: &ConvertContext<'_>) -> BillingResult<Self> {
        Ok(Plan {
            id: 0,
            provider: ctx.provider().to_string(),
            provider_id: remote.id.clone(),
            name: remote.name.clone(),
            description: remote.description.clone(),
            active: remote.active,
        })
    }
}

#[async_trait]
impl SyncEntity for Price {
    type Remote = RemotePrice;

    fn repository(mirror: &EntityMirror) -> &dyn Repository<Self> {
        mirror.prices.as_ref()
    }

    fn identify(remote: &RemotePrice) -> &str {
        &remote.id
    }

    fn enumerate(provider: &dyn BillingProvider) -> RemoteStream<'_, RemotePrice> {
        provider.prices()
    }

    fn from_record(record: RemoteRecord) -> BillingResult<RemotePrice> {
        match record {
            RemoteRecord::Price(remote) => Ok(remote),
            other => wrong_record("price", &other),
        }
    }

    async fn convert(remote: &RemotePrice, ctx: &ConvertContext<'_>) -> BillingResult<Self> {
        let product_id = remote.product_id.as_deref().ok_or_else(|| {
            BillingError::Conversion(format!("price {} has no product", remote.id))
        })?;
        let schedule = remote.schedule.ok_or_else(|| {
            BillingError::Conversion(format!(
                "price {} has an unsupported billing schedule",
                remote.id
            ))
        })?;
        let plan_id = ctx.resolve::<Plan>(product_id).await?;

        Ok(Price {
            id: 0,
            plan_id,
            provider: ctx.provider().to_string(),
            provider_id: remote.id.clone(),
            amount: remote.amount,
            currency: remote.currency.clone(),
            schedule,
            trial_days: remote.trial_days,
        })
    }
}

#[async_trait]
impl SyncEntity for Subscription {
    type Remote = RemoteSubscription;

    fn repository(mirror: &EntityMirror) -> &dyn Repository<Self> {
        mirror.subscriptions.as_ref()
    }

    fn identify(remote: &RemoteSubscription) -> &str {
        &remote.id
    }

    fn enumerate(provider: &dyn BillingProvider) -> RemoteStream<'_, RemoteSubscription> {
        provider.subscriptions()
    }

    fn from_record(record: RemoteRecord) -> BillingResult<RemoteSubscription> {
        match record {
            RemoteRecord::Subscription(remote) => Ok(remote),
            other => wrong_record("subscription", &other),
        }
    }

    async fn convert(
        remote: &RemoteSubscription,
        ctx: &ConvertContext<'_>,
    ) -> BillingResult<Self> {
        let price_provider_id = remote.price_id.as_deref().ok_or_else(|| {
            BillingError::Conversion(format!(
                "unable to get price id from subscription {}",
                remote.id
            ))
        })?;
        let customer_id = ctx.resolve::<Customer>(&remote.customer_id).await?;
        let price_id = ctx.resolve::<Price>(price_provider_id).await?;

        Ok(Subscription {
            id: 0,
            customer_id,
            price_id,
            provider: ctx.provider().to_string(),
            provider_id: remote.id.clone(),
            active: remote.active,
        })
    }

    async fn after_write(
        remote: &RemoteSubscription,
        row: &Self,
        mirror: &EntityMirror,
    ) -> BillingResult<()> {
        if let Some(user_id) = remote.user_id {
            mirror.subscription_users.link(row.id, user_id).await?;
        }
        Ok(())
    }
}
