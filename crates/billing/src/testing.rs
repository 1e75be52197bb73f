//! Scripted provider and fixtures shared by the crate's tests

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::{stream, StreamExt};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::Notify;

use crate::entities::{EntityKind, MirrorEntity, PricingSchedule};
use crate::error::{BillingError, BillingResult};
use crate::events::{EventBus, MirrorObserver};
use crate::memory::MemoryMirror;
use crate::provider::{
    BillingProvider, ProviderEvent, RemoteCustomer, RemotePlan, RemotePrice, RemoteRecord,
    RemoteStream, RemoteSubscription,
};
use crate::reconcile::Reconciler;
use crate::signature;
use crate::webhooks::{HandlerTable, WebhookConfig, WebhookConsumer, WebhookProcessor};
use crate::writer::MirrorWriter;

pub const FAKE_PROVIDER: &str = "fake";
pub const TEST_SECRET: &str = "whsec_fake_secret";

/// Remote collections as the provider currently reports them
#[derive(Debug, Default, Clone)]
pub struct RemoteState {
    pub customers: Vec<RemoteCustomer>,
    pub plans: Vec<RemotePlan>,
    pub prices: Vec<RemotePrice>,
    pub subscriptions: Vec<RemoteSubscription>,
}

#[derive(Default)]
pub struct FakeProvider {
    state: Mutex<RemoteState>,
    /// Listing of a kind fails with a transport error after this many records
    failures: Mutex<HashMap<EntityKind, usize>>,
    fetches: AtomicUsize,
    /// While set, every `fetch` waits for a permit
    gate: Mutex<Option<Arc<Notify>>>,
}

impl FakeProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn edit(&self, f: impl FnOnce(&mut RemoteState)) {
        f(&mut self.state.lock().unwrap());
    }

    pub fn fail_after(&self, kind: EntityKind, records: usize) {
        self.failures.lock().unwrap().insert(kind, records);
    }

    pub fn heal(&self, kind: EntityKind) {
        self.failures.lock().unwrap().remove(&kind);
    }

    /// Makes `fetch` block until the returned gate is notified, once per call
    pub fn hold_fetches(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.gate.lock().unwrap() = Some(gate.clone());
        gate
    }

    /// Single-record reads started so far
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    fn listing<T: Send + 'static>(&self, kind: EntityKind, items: Vec<T>) -> RemoteStream<'_, T> {
        match self.failures.lock().unwrap().get(&kind).copied() {
            None => stream::iter(items.into_iter().map(Ok::<T, BillingError>)).boxed(),
            Some(limit) => {
                let failure = BillingError::Transport(format!("{kind} listing interrupted"));
                stream::iter(
                    items
                        .into_iter()
                        .take(limit)
                        .map(Ok::<T, BillingError>)
                        .chain(std::iter::once(Err(failure))),
                )
                .boxed()
            }
        }
    }
}

fn decode_as<T: DeserializeOwned>(object: &Value) -> BillingResult<T> {
    serde_json::from_value(object.clone())
        .map_err(|e| BillingError::Conversion(format!("Malformed object: {e}")))
}

#[async_trait]
impl BillingProvider for FakeProvider {
    fn name(&self) -> &str {
        FAKE_PROVIDER
    }

    fn customers(&self) -> RemoteStream<'_, RemoteCustomer> {
        let items = self.state.lock().unwrap().customers.clone();
        self.listing(EntityKind::Customer, items)
    }

    fn plans(&self) -> RemoteStream<'_, RemotePlan> {
        let items = self.state.lock().unwrap().plans.clone();
        self.listing(EntityKind::Plan, items)
    }

    fn prices(&self) -> RemoteStream<'_, RemotePrice> {
        let items = self.state.lock().unwrap().prices.clone();
        self.listing(EntityKind::Price, items)
    }

    fn subscriptions(&self) -> RemoteStream<'_, RemoteSubscription> {
        let items = self.state.lock().unwrap().subscriptions.clone();
        self.listing(EntityKind::Subscription, items)
    }

    async fn fetch(&self, kind: EntityKind, id: &str) -> BillingResult<Option<RemoteRecord>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let gate = self.gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        let state = self.state.lock().unwrap();
        Ok(match kind {
            EntityKind::Customer => state
                .customers
                .iter()
                .find(|r| r.id == id)
                .cloned()
                .map(RemoteRecord::Customer),
            EntityKind::Plan => state
                .plans
                .iter()
                .find(|r| r.id == id)
                .cloned()
                .map(RemoteRecord::Plan),
            EntityKind::Price => state
                .prices
                .iter()
                .find(|r| r.id == id)
                .cloned()
                .map(RemoteRecord::Price),
            EntityKind::Subscription => state
                .subscriptions
                .iter()
                .find(|r| r.id == id)
                .cloned()
                .map(RemoteRecord::Subscription),
        })
    }

    fn verify_event(&self, payload: &[u8], signature: &str) -> BillingResult<ProviderEvent> {
        signature::verify_signature(
            payload,
            signature,
            TEST_SECRET,
            signature::DEFAULT_TOLERANCE_SECS,
            signature::unix_now()?,
        )?;
        ProviderEvent::from_payload(payload)
    }

    fn decode(&self, kind: EntityKind, object: &Value) -> BillingResult<RemoteRecord> {
        Ok(match kind {
            EntityKind::Customer => RemoteRecord::Customer(decode_as(object)?),
            EntityKind::Plan => RemoteRecord::Plan(decode_as(object)?),
            EntityKind::Price => RemoteRecord::Price(decode_as(object)?),
            EntityKind::Subscription => RemoteRecord::Subscription(decode_as(object)?),
        })
    }
}

pub fn customer(id: &str, email: &str) -> RemoteCustomer {
    RemoteCustomer {
        id: id.into(),
        name: "Ada Lovelace".into(),
        email: email.into(),
        user_id: None,
    }
}

pub fn plan(id: &str, name: &str) -> RemotePlan {
    RemotePlan {
        id: id.into(),
        name: name.into(),
        description: None,
        active: true,
    }
}

pub fn price(id: &str, product_id: &str, amount: i64) -> RemotePrice {
    RemotePrice {
        id: id.into(),
        product_id: Some(product_id.into()),
        amount,
        currency: "usd".into(),
        schedule: Some(PricingSchedule::Monthly),
        trial_days: 0,
    }
}

pub fn subscription(id: &str, customer_id: &str, price_id: &str) -> RemoteSubscription {
    RemoteSubscription {
        id: id.into(),
        customer_id: customer_id.into(),
        price_id: Some(price_id.into()),
        active: true,
        user_id: None,
    }
}

/// One customer subscribed to the monthly price of one plan
pub fn catalog() -> RemoteState {
    RemoteState {
        customers: vec![customer("cus_1", "a@x.com")],
        plans: vec![plan("prod_1", "Pro")],
        prices: vec![price("price_1", "prod_1", 2900)],
        subscriptions: vec![subscription("sub_1", "cus_1", "price_1")],
    }
}

/// Signed webhook body carrying `object`
pub fn signed_event(id: &str, event_type: &str, object: Value) -> (Vec<u8>, String) {
    let body = serde_json::to_vec(&serde_json::json!({
        "id": id,
        "type": event_type,
        "created": 1_700_000_000,
        "data": { "object": object },
    }))
    .unwrap();
    let header = signature::sign_payload(&body, TEST_SECRET, signature::unix_now().unwrap())
        .unwrap();
    (body, header)
}

/// Records every change as `"<transition> <kind> <provider id>"`
#[derive(Default)]
pub struct Recorder {
    log: Mutex<Vec<String>>,
}

impl Recorder {
    pub fn attach(bus: &mut EventBus) -> Arc<Self> {
        let recorder = Arc::new(Self::default());
        bus.subscribe::<crate::entities::Customer>(recorder.clone())
            .subscribe::<crate::entities::Plan>(recorder.clone())
            .subscribe::<crate::entities::Price>(recorder.clone())
            .subscribe::<crate::entities::Subscription>(recorder.clone());
        recorder
    }

    pub fn take(&self) -> Vec<String> {
        std::mem::take(&mut *self.log.lock().unwrap())
    }

    fn push<E: MirrorEntity>(&self, transition: &str, row: &E) {
        self.log
            .lock()
            .unwrap()
            .push(format!("{transition} {} {}", E::KIND, row.provider_id()));
    }
}

impl<E: MirrorEntity> MirrorObserver<E> for Recorder {
    fn on_added(&self, current: &E) {
        self.push("added", current);
    }

    fn on_updated(&self, _previous: &E, current: &E) {
        self.push("updated", current);
    }

    fn on_removed(&self, last: &E) {
        self.push("removed", last);
    }
}

/// Fake provider, in-memory mirror and a recording bus wired together
pub struct Harness {
    pub provider: Arc<FakeProvider>,
    pub store: MemoryMirror,
    pub recorder: Arc<Recorder>,
    pub writer: MirrorWriter,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_bus(EventBus::new())
    }

    pub fn with_bus(mut bus: EventBus) -> Self {
        let provider = Arc::new(FakeProvider::new());
        let store = MemoryMirror::default();
        let recorder = Recorder::attach(&mut bus);
        let writer = MirrorWriter::new(store.mirror(), Arc::new(bus), FAKE_PROVIDER);
        Self {
            provider,
            store,
            recorder,
            writer,
        }
    }

    pub fn reconciler(&self) -> Reconciler {
        Reconciler::new(self.provider.clone(), self.writer.clone())
    }

    pub fn start_webhooks(&self, config: WebhookConfig) -> (WebhookProcessor, WebhookConsumer) {
        WebhookProcessor::start(
            self.provider.clone(),
            self.writer.clone(),
            HandlerTable::stripe(),
            config,
        )
    }
}
