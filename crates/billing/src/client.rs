//! Stripe client configuration and the Stripe provider

use std::future::Future;
use std::str::FromStr;

use async_trait::async_trait;
use futures::stream::{self, StreamExt, TryStreamExt};
use serde::de::DeserializeOwned;
use serde_json::Value;
use stripe::{
    Client, Customer, CustomerId, ListCustomers, ListPrices, ListProducts, ListSubscriptions,
    Price, PriceId, Product, ProductId, StripeError, Subscription, SubscriptionId,
};

use crate::config::env_or;
use crate::convert;
use crate::entities::EntityKind;
use crate::error::{BillingError, BillingResult};
use crate::provider::{
    BillingProvider, ProviderEvent, RemoteCustomer, RemotePlan, RemotePrice, RemoteRecord,
    RemoteStream, RemoteSubscription,
};
use crate::signature::{self, DEFAULT_TOLERANCE_SECS};

/// Name stored in the `provider` column for Stripe rows
pub const STRIPE_PROVIDER: &str = "stripe";

/// Largest page Stripe serves
const MAX_PAGE_SIZE: u64 = 100;

/// Configuration for the Stripe provider
#[derive(Debug, Clone)]
pub struct StripeConfig {
    /// Stripe secret API key
    pub secret_key: String,
    /// Stripe webhook signing secret; `None` in processes that only read from Stripe
    pub webhook_secret: Option<String>,
    /// Accepted clock skew for webhook signatures
    pub signature_tolerance_secs: u64,
    /// Records requested per list call
    pub page_size: u64,
}

impl StripeConfig {
    pub fn new(secret_key: impl Into<String>, webhook_secret: impl Into<String>) -> Self {
        Self {
            webhook_secret: Some(webhook_secret.into()),
            ..Self::read_only(secret_key)
        }
    }

    /// Config that can list and fetch but not verify webhooks
    pub fn read_only(secret_key: impl Into<String>) -> Self {
        Self {
            secret_key: secret_key.into(),
            webhook_secret: None,
            signature_tolerance_secs: DEFAULT_TOLERANCE_SECS,
            page_size: MAX_PAGE_SIZE,
        }
    }

    /// Create config from environment variables
    pub fn from_env() -> BillingResult<Self> {
        let config = Self::read_only_from_env()?;
        if config.webhook_secret.is_none() {
            return Err(BillingError::Config("STRIPE_WEBHOOK_SECRET not set".to_string()));
        }
        Ok(config)
    }

    /// Like [`Self::from_env`], with `STRIPE_WEBHOOK_SECRET` optional
    pub fn read_only_from_env() -> BillingResult<Self> {
        let page_size: u64 = env_or("STRIPE_PAGE_SIZE", MAX_PAGE_SIZE)?;
        if page_size == 0 || page_size > MAX_PAGE_SIZE {
            return Err(BillingError::Config(format!(
                "STRIPE_PAGE_SIZE must be between 1 and {MAX_PAGE_SIZE}"
            )));
        }

        Ok(Self {
            secret_key: std::env::var("STRIPE_SECRET_KEY")
                .map_err(|_| BillingError::Config("STRIPE_SECRET_KEY not set".to_string()))?,
            webhook_secret: std::env::var("STRIPE_WEBHOOK_SECRET").ok(),
            signature_tolerance_secs: env_or(
                "STRIPE_WEBHOOK_TOLERANCE_SECS",
                DEFAULT_TOLERANCE_SECS,
            )?,
            page_size,
        })
    }
}

/// Stripe billing client
#[derive(Clone)]
pub struct StripeClient {
    client: Client,
    config: StripeConfig,
}

impl StripeClient {
    /// Create a new Stripe client from config
    pub fn new(config: StripeConfig) -> Self {
        let client = Client::new(&config.secret_key);
        Self { client, config }
    }

    /// Create a new Stripe client from environment variables
    pub fn from_env() -> BillingResult<Self> {
        let config = StripeConfig::from_env()?;
        Ok(Self::new(config))
    }

    /// Get the inner Stripe client
    pub fn inner(&self) -> &Client {
        &self.client
    }

    /// Get the config
    pub fn config(&self) -> &StripeConfig {
        &self.config
    }
}

/// One page of a list call
struct Page<T> {
    items: Vec<T>,
    /// Cursor for the next page, `None` on the last page
    next: Option<String>,
}

/// Flattens cursor-paged list calls into one lazy stream.
fn paginate<'a, T, F, Fut>(fetch_page: F) -> RemoteStream<'a, T>
where
    T: Send + 'a,
    F: Fn(Option<String>) -> Fut + Send + 'a,
    Fut: Future<Output = BillingResult<Page<T>>> + Send + 'a,
{
    enum Cursor {
        Start,
        After(String),
        Done,
    }

    stream::try_unfold(Cursor::Start, move |cursor| {
        let request = match cursor {
            Cursor::Start => Some(fetch_page(None)),
            Cursor::After(id) => Some(fetch_page(Some(id))),
            Cursor::Done => None,
        };
        async move {
            let Some(request) = request else {
                return Ok::<_, BillingError>(None);
            };
            let page = request.await?;
            let next = page.next.map_or(Cursor::Done, Cursor::After);
            let items = stream::iter(page.items.into_iter().map(Ok::<T, BillingError>));
            Ok(Some((items, next)))
        }
    })
    .try_flatten()
    .boxed()
}

fn next_cursor<S>(list: &stripe::List<S>, id: impl Fn(&S) -> String) -> Option<String> {
    if list.has_more {
        list.data.last().map(id)
    } else {
        None
    }
}

fn parse_id<I>(raw: &str) -> BillingResult<I>
where
    I: FromStr,
    I::Err: std::fmt::Display,
{
    raw.parse()
        .map_err(|e| BillingError::Conversion(format!("Invalid provider id {raw}: {e}")))
}

fn decode_object<T: DeserializeOwned>(kind: EntityKind, object: &Value) -> BillingResult<T> {
    serde_json::from_value(object.clone())
        .map_err(|e| BillingError::Conversion(format!("Malformed {kind} object: {e}")))
}

/// 404 from Stripe means the record is gone
fn missing_as_none<T>(result: Result<Option<T>, StripeError>) -> BillingResult<Option<T>> {
    match result {
        Ok(found) => Ok(found),
        Err(StripeError::Stripe(err)) if err.http_status == 404 => Ok(None),
        Err(err) => Err(err.into()),
    }
}

#[async_trait]
impl BillingProvider for StripeClient {
    fn name(&self) -> &str {
        STRIPE_PROVIDER
    }

    fn customers(&self) -> RemoteStream<'_, RemoteCustomer> {
        let page_size = self.config.page_size;
        paginate(move |after: Option<String>| async move {
            let mut params = ListCustomers::new();
            params.limit = Some(page_size);
            params.starting_after = after.map(|id| parse_id::<CustomerId>(&id)).transpose()?;
            let list = Customer::list(&self.client, &params).await?;
            Ok::<_, BillingError>(Page {
                items: list.data.iter().map(convert::customer).collect(),
                next: next_cursor(&list, |c| c.id.to_string()),
            })
        })
    }

    fn plans(&self) -> RemoteStream<'_, RemotePlan> {
        let page_size = self.config.page_size;
        paginate(move |after: Option<String>| async move {
            let mut params = ListProducts::new();
            params.limit = Some(page_size);
            params.starting_after = after.map(|id| parse_id::<ProductId>(&id)).transpose()?;
            let list = Product::list(&self.client, &params).await?;
            Ok::<_, BillingError>(Page {
                items: list.data.iter().map(convert::plan).collect(),
                next: next_cursor(&list, |p| p.id.to_string()),
            })
        })
    }

    fn prices(&self) -> RemoteStream<'_, RemotePrice> {
        let page_size = self.config.page_size;
        paginate(move |after: Option<String>| async move {
            let mut params = ListPrices::new();
            params.limit = Some(page_size);
            params.starting_after = after.map(|id| parse_id::<PriceId>(&id)).transpose()?;
            let list = Price::list(&self.client, &params).await?;
            Ok::<_, BillingError>(Page {
                items: list.data.iter().map(convert::price).collect(),
                next: next_cursor(&list, |p| p.id.to_string()),
            })
        })
    }

    fn subscriptions(&self) -> RemoteStream<'_, RemoteSubscription> {
        let page_size = self.config.page_size;
        paginate(move |after: Option<String>| async move {
            let mut params = ListSubscriptions::new();
            params.limit = Some(page_size);
            params.starting_after = after
                .map(|id| parse_id::<SubscriptionId>(&id))
                .transpose()?;
            let list = Subscription::list(&self.client, &params).await?;
            Ok::<_, BillingError>(Page {
                items: list.data.iter().map(convert::subscription).collect(),
                next: next_cursor(&list, |s| s.id.to_string()),
            })
        })
    }

    async fn fetch(&self, kind: EntityKind, id: &str) -> BillingResult<Option<RemoteRecord>> {
        tracing::debug!(kind = %kind, provider_id = %id, "Fetching record from Stripe");
        match kind {
            EntityKind::Customer => {
                let id: CustomerId = parse_id(id)?;
                let result = Customer::retrieve(&self.client, &id, &[])
                    .await
                    .map(|c| (!c.deleted).then(|| RemoteRecord::Customer(convert::customer(&c))));
                missing_as_none(result)
            }
            EntityKind::Plan => {
                let id: ProductId = parse_id(id)?;
                let result = Product::retrieve(&self.client, &id, &[])
                    .await
                    .map(|p| Some(RemoteRecord::Plan(convert::plan(&p))));
                missing_as_none(result)
            }
            EntityKind::Price => {
                let id: PriceId = parse_id(id)?;
                let result = Price::retrieve(&self.client, &id, &[])
                    .await
                    .map(|p| Some(RemoteRecord::Price(convert::price(&p))));
                missing_as_none(result)
            }
            EntityKind::Subscription => {
                let id: SubscriptionId = parse_id(id)?;
                let result = Subscription::retrieve(&self.client, &id, &[])
                    .await
                    .map(|s| Some(RemoteRecord::Subscription(convert::subscription(&s))));
                missing_as_none(result)
            }
        }
    }

    fn verify_event(&self, payload: &[u8], signature: &str) -> BillingResult<ProviderEvent> {
        let secret = self
            .config
            .webhook_secret
            .as_deref()
            .ok_or_else(|| BillingError::Config("STRIPE_WEBHOOK_SECRET not set".to_string()))?;
        signature::verify_signature(
            payload,
            signature,
            secret,
            self.config.signature_tolerance_secs,
            signature::unix_now()?,
        )?;
        ProviderEvent::from_payload(payload)
    }

    fn decode(&self, kind: EntityKind, object: &Value) -> BillingResult<RemoteRecord> {
        Ok(match kind {
            EntityKind::Customer => {
                RemoteRecord::Customer(convert::customer(&decode_object(kind, object)?))
            }
            EntityKind::Plan => RemoteRecord::Plan(convert::plan(&decode_object(kind, object)?)),
            EntityKind::Price => RemoteRecord::Price(convert::price(&decode_object(kind, object)?)),
            EntityKind::Subscription => {
                RemoteRecord::Subscription(convert::subscription(&decode_object(kind, object)?))
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    fn client() -> StripeClient {
        StripeClient::new(StripeConfig::new("sk_test_123", "whsec_test"))
    }

    #[test]
    fn test_verify_event_roundtrip() {
        let client = client();
        let body = serde_json::to_vec(&json!({
            "id": "evt_1",
            "type": "product.created",
            "created": 1,
            "data": { "object": { "id": "prod_1", "object": "product" } }
        }))
        .unwrap();
        let header = signature::sign_payload(&body, "whsec_test", signature::unix_now().unwrap())
            .unwrap();
        let event = client.verify_event(&body, &header).unwrap();
        assert_eq!(event.id, "evt_1");
        assert_eq!(event.object_id(), Some("prod_1"));
    }

    #[test]
    fn test_verify_event_rejects_bad_signature() {
        let client = client();
        let result = client.verify_event(b"{}", "t=1,v1=00");
        assert!(matches!(result, Err(BillingError::WebhookSignatureInvalid)));
    }

    #[test]
    fn test_decode_rejects_malformed_object() {
        let client = client();
        let result = client.decode(EntityKind::Customer, &json!({ "name": "no id" }));
        assert!(matches!(result, Err(BillingError::Conversion(_))));
    }

    #[test]
    fn test_config_defaults() {
        let config = StripeConfig::new("sk", "whsec");
        assert_eq!(config.signature_tolerance_secs, 300);
        assert_eq!(config.page_size, 100);
        assert_eq!(config.webhook_secret.as_deref(), Some("whsec"));
    }

    #[test]
    fn test_read_only_client_cannot_verify() {
        let client = StripeClient::new(StripeConfig::read_only("sk_test_123"));
        let body = b"{}";
        let header = signature::sign_payload(body, "", signature::unix_now().unwrap()).unwrap();
        assert!(matches!(
            client.verify_event(body, &header),
            Err(BillingError::Config(_))
        ));
    }

    // Config tests modify shared env vars
    static STRIPE_ENV_MUTEX: Mutex<()> = Mutex::new(());

    fn cleanup_env() {
        for key in [
            "STRIPE_SECRET_KEY",
            "STRIPE_WEBHOOK_SECRET",
            "STRIPE_WEBHOOK_TOLERANCE_SECS",
            "STRIPE_PAGE_SIZE",
        ] {
            std::env::remove_var(key);
        }
    }

    #[test]
    fn test_config_from_env() {
        let _guard = STRIPE_ENV_MUTEX.lock().unwrap();
        cleanup_env();

        // === Only the API key is needed to read ===
        std::env::set_var("STRIPE_SECRET_KEY", "sk_test_123");
        let config = StripeConfig::read_only_from_env().unwrap();
        assert!(config.webhook_secret.is_none());
        assert!(matches!(StripeConfig::from_env(), Err(BillingError::Config(_))));

        std::env::set_var("STRIPE_WEBHOOK_SECRET", "whsec_test");
        std::env::set_var("STRIPE_WEBHOOK_TOLERANCE_SECS", "60");
        let config = StripeConfig::from_env().unwrap();
        assert_eq!(config.signature_tolerance_secs, 60);

        // === Garbage is rejected, not defaulted ===
        for bad in ["-5", "soon"] {
            std::env::set_var("STRIPE_WEBHOOK_TOLERANCE_SECS", bad);
            assert!(
                matches!(StripeConfig::from_env(), Err(BillingError::Config(_))),
                "accepted tolerance {bad}"
            );
        }
        std::env::remove_var("STRIPE_WEBHOOK_TOLERANCE_SECS");

        std::env::set_var("STRIPE_PAGE_SIZE", "0");
        assert!(matches!(StripeConfig::from_env(), Err(BillingError::Config(_))));

        cleanup_env();
    }
}
