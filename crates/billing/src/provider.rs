//! Billing provider contract
//!
//! A provider exposes each remote collection as a lazy, finite stream (paging
//! stays inside the implementation), single-record reads, and webhook
//! verification. Remote records are provider-neutral; turning them into mirror
//! rows happens in [`crate::sync`].

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::entities::{EntityKind, PricingSchedule};
use crate::error::{BillingError, BillingResult};

pub type RemoteStream<'a, T> = BoxStream<'a, BillingResult<T>>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteCustomer {
    pub id: String,
    pub name: String,
    pub email: String,
    pub user_id: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemotePlan {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub active: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemotePrice {
    pub id: String,
    pub product_id: Option<String>,
    pub amount: i64,
    pub currency: String,
    /// `None` when the provider uses a schedule the mirror does not model
    pub schedule: Option<PricingSchedule>,
    pub trial_days: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteSubscription {
    pub id: String,
    pub customer_id: String,
    /// Price of the first line item
    pub price_id: Option<String>,
    pub active: bool,
    pub user_id: Option<i64>,
}

/// A remote record of any kind
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteRecord {
    Customer(RemoteCustomer),
    Plan(RemotePlan),
    Price(RemotePrice),
    Subscription(RemoteSubscription),
}

impl RemoteRecord {
    pub fn kind(&self) -> EntityKind {
        match self {
            RemoteRecord::Customer(_) => EntityKind::Customer,
            RemoteRecord::Plan(_) => EntityKind::Plan,
            RemoteRecord::Price(_) => EntityKind::Price,
            RemoteRecord::Subscription(_) => EntityKind::Subscription,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            RemoteRecord::Customer(r) => &r.id,
            RemoteRecord::Plan(r) => &r.id,
            RemoteRecord::Price(r) => &r.id,
            RemoteRecord::Subscription(r) => &r.id,
        }
    }
}

/// An authenticated webhook event
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderEvent {
    pub id: String,
    pub event_type: String,
    /// Unix seconds, as reported by the provider
    pub created: i64,
    /// The object the event is about (`data.object`)
    pub object: Value,
    /// The full event body
    pub payload: Value,
}

impl ProviderEvent {
    /// Parses a verified event body.
    pub fn from_payload(payload: &[u8]) -> BillingResult<Self> {
        #[derive(Deserialize)]
        struct Envelope {
            id: String,
            #[serde(rename = "type")]
            event_type: String,
            #[serde(default)]
            created: i64,
            data: EnvelopeData,
        }

        #[derive(Deserialize)]
        struct EnvelopeData {
            object: Value,
        }

        let payload: Value = serde_json::from_slice(payload)
            .map_err(|e| BillingError::Conversion(format!("Invalid event payload: {e}")))?;
        let envelope: Envelope = serde_json::from_value(payload.clone())
            .map_err(|e| BillingError::Conversion(format!("Invalid event envelope: {e}")))?;

        Ok(Self {
            id: envelope.id,
            event_type: envelope.event_type,
            created: envelope.created,
            object: envelope.data.object,
            payload,
        })
    }

    /// External id of the object the event is about
    pub fn object_id(&self) -> Option<&str> {
        self.object.get("id").and_then(Value::as_str)
    }
}

#[async_trait]
pub trait BillingProvider: Send + Sync {
    /// Provider name stored alongside every external id
    fn name(&self) -> &str;

    fn customers(&self) -> RemoteStream<'_, RemoteCustomer>;
    fn plans(&self) -> RemoteStream<'_, RemotePlan>;
    fn prices(&self) -> RemoteStream<'_, RemotePrice>;
    fn subscriptions(&self) -> RemoteStream<'_, RemoteSubscription>;

    /// Single-record read; `Ok(None)` if the provider no longer has it.
    async fn fetch(&self, kind: EntityKind, id: &str) -> BillingResult<Option<RemoteRecord>>;

    /// Authenticates a raw webhook body against its signature header.
    fn verify_event(&self, payload: &[u8], signature: &str) -> BillingResult<ProviderEvent>;

    /// Reads the object carried by a webhook event as a remote record.
    fn decode(&self, kind: EntityKind, object: &Value) -> BillingResult<RemoteRecord>;
}
