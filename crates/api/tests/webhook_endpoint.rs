// Test file - these are expected patterns in test code
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

//! End-to-end tests of the webhook endpoint over an in-memory mirror

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use axum::{
    body::{to_bytes, Body},
    http::{Request, StatusCode},
    Router,
};
use paymirror_api::{create_router, AppState};
use paymirror_billing::memory::MemoryMirror;
use paymirror_billing::signature::sign_payload;
use async_trait::async_trait;
use paymirror_billing::{
    BillingError, BillingMirror, BillingResult, EntityMirror, EventBus, LedgerEntry, MirrorConfig,
    StripeClient, StripeConfig, WebhookConfig, WebhookConsumer, WebhookLedger,
};
use serde_json::{json, Value};
use tower::ServiceExt;

const WEBHOOK_SECRET: &str = "whsec_endpoint_test";

struct TestApp {
    router: Router,
    store: MemoryMirror,
    consumer: WebhookConsumer,
}

fn test_app(max_body_bytes: usize) -> TestApp {
    let store = MemoryMirror::default();
    let mirror = store.mirror();
    test_app_with(store, mirror, max_body_bytes)
}

fn test_app_with(store: MemoryMirror, mirror: EntityMirror, max_body_bytes: usize) -> TestApp {
    let client = StripeClient::new(StripeConfig::new("sk_test_endpoint", WEBHOOK_SECRET));
    let config = MirrorConfig {
        webhook: WebhookConfig {
            max_body_bytes,
            ..WebhookConfig::default()
        },
        ..MirrorConfig::default()
    };
    let billing = BillingMirror::new(Arc::new(client), mirror, EventBus::new(), config);
    let (webhooks, consumer) = billing.start_webhooks();
    TestApp {
        router: create_router(AppState::new(webhooks, None)),
        store,
        consumer,
    }
}

fn event_body(id: &str, event_type: &str, object: Value) -> Vec<u8> {
    serde_json::to_vec(&json!({
        "id": id,
        "object": "event",
        "type": event_type,
        "created": 1_700_000_000,
        "data": { "object": object },
    }))
    .unwrap()
}

fn sign(body: &[u8]) -> String {
    let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs() as i64;
    sign_payload(body, WEBHOOK_SECRET, now).unwrap()
}

fn webhook_request(body: Vec<u8>, signature: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri("/webhooks/stripe")
        .header("content-type", "application/json");
    if let Some(signature) = signature {
        builder = builder.header("stripe-signature", signature);
    }
    builder.body(Body::from(body)).unwrap()
}

async fn json_body(response: axum::response::Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn test_signed_event_is_acknowledged_then_deduplicated() {
    let app = test_app(64 * 1024);
    let body = event_body(
        "evt_endpoint_1",
        "customer.deleted",
        json!({ "id": "cus_gone", "object": "customer" }),
    );
    let signature = sign(&body);

    let first = app
        .router
        .clone()
        .oneshot(webhook_request(body.clone(), Some(&signature)))
        .await
        .unwrap();
    assert_eq!(first.status(), StatusCode::OK);
    assert_eq!(json_body(first).await, json!({ "received": true, "duplicate": false }));

    let second = app
        .router
        .clone()
        .oneshot(webhook_request(body, Some(&signature)))
        .await
        .unwrap();
    assert_eq!(second.status(), StatusCode::OK);
    assert_eq!(json_body(second).await["duplicate"], true);

    assert_eq!(app.consumer.shutdown().await.unwrap(), 1);
    assert!(app.store.ledger.contains("stripe", "evt_endpoint_1").await.unwrap());
}

#[tokio::test]
async fn test_missing_signature_is_bad_request() {
    let app = test_app(64 * 1024);
    let body = event_body("evt_1", "customer.deleted", json!({ "id": "cus_1" }));

    let response = app.router.oneshot(webhook_request(body, None)).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(json_body(response).await["error"]["code"], "BAD_REQUEST");
}

#[tokio::test]
async fn test_invalid_signature_is_rejected_and_not_ledgered() {
    let app = test_app(64 * 1024);
    let body = event_body("evt_forged", "customer.deleted", json!({ "id": "cus_1" }));
    let signature = sign(b"some other body");

    let response = app
        .router
        .oneshot(webhook_request(body, Some(&signature)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(json_body(response).await["error"]["code"], "INVALID_SIGNATURE");
    assert!(app.store.ledger.is_empty().await);
}

#[tokio::test]
async fn test_malformed_envelope_is_bad_request() {
    let app = test_app(64 * 1024);
    let body = br#"{"id":"evt_1","type":"customer.deleted"}"#.to_vec();
    let signature = sign(&body);

    let response = app
        .router
        .oneshot(webhook_request(body, Some(&signature)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(app.store.ledger.is_empty().await);
}

#[tokio::test]
async fn test_oversized_body_is_payload_too_large() {
    let app = test_app(256);
    let body = event_body(
        "evt_big",
        "customer.updated",
        json!({ "id": "cus_1", "name": "x".repeat(1024) }),
    );
    let signature = sign(&body);

    let response = app
        .router
        .oneshot(webhook_request(body, Some(&signature)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    assert!(app.store.ledger.is_empty().await);
}

#[tokio::test]
async fn test_stopped_consumer_is_service_unavailable() {
    let app = test_app(64 * 1024);
    app.consumer.shutdown().await.unwrap();

    let ready = app
        .router
        .clone()
        .oneshot(Request::get("/health/ready").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(ready.status(), StatusCode::SERVICE_UNAVAILABLE);

    let body = event_body("evt_late", "customer.deleted", json!({ "id": "cus_1" }));
    let signature = sign(&body);
    let response = app
        .router
        .oneshot(webhook_request(body, Some(&signature)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert!(app.store.ledger.is_empty().await);
}

/// Ledger that cannot be written, as when the database is down
struct UnwritableLedger;

#[async_trait]
impl WebhookLedger for UnwritableLedger {
    async fn contains(&self, _provider: &str, _event_id: &str) -> BillingResult<bool> {
        Ok(false)
    }

    async fn record(
        &self,
        _provider: &str,
        _event_id: &str,
        _event_type: &str,
        _payload: &Value,
    ) -> BillingResult<bool> {
        Err(BillingError::Database("connection refused".into()))
    }

    async fn get(&self, _provider: &str, _event_id: &str) -> BillingResult<Option<LedgerEntry>> {
        Ok(None)
    }
}

#[tokio::test]
async fn test_ledger_write_failure_is_server_error() {
    let store = MemoryMirror::default();
    let mirror = EntityMirror {
        ledger: Arc::new(UnwritableLedger),
        ..store.mirror()
    };
    let app = test_app_with(store, mirror, 64 * 1024);
    let body = event_body("evt_retry_me", "customer.deleted", json!({ "id": "cus_1" }));
    let signature = sign(&body);

    let response = app
        .router
        .oneshot(webhook_request(body, Some(&signature)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let error = json_body(response).await;
    assert_eq!(error["error"]["code"], "DATABASE_ERROR");
    assert_eq!(error["error"]["message"], "Database error");

    // Nothing was queued, so the provider's retry is the only delivery
    assert_eq!(app.consumer.shutdown().await.unwrap(), 0);
}

#[tokio::test]
async fn test_health_without_database() {
    let app = test_app(64 * 1024);

    let response = app
        .router
        .clone()
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["database"], "not configured");

    let live = app
        .router
        .clone()
        .oneshot(Request::get("/health/live").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(live.status(), StatusCode::OK);

    let ready = app
        .router
        .oneshot(Request::get("/health/ready").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(ready.status(), StatusCode::OK);
    app.consumer.shutdown().await.unwrap();
}
