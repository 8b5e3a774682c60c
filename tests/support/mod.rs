#![allow(dead_code)]

use async_trait::async_trait;
use boutique_checkout::domain::aggregates::{Coupon, DiscountKind, IntentState, NewCoupon, Notification, Product, ProviderKind};
use boutique_checkout::domain::value_objects::Money;
use boutique_checkout::providers::{
    IntentRequest, PaymentProvider, ProviderCapture, ProviderError, ProviderIntent, ProviderRefund, ProviderRegistry,
};
use boutique_checkout::services::{PushChannel, PushError};
use boutique_checkout::store::{CatalogRepository, CheckoutStore, CouponRepository, MemoryStore};
use boutique_checkout::{CheckoutSettings, Storefront};
use chrono::Utc;
use rust_decimal_macros::dec;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

/// Scriptable provider: confirmations succeed unless an outcome was queued.
pub struct FakeProvider {
    kind: ProviderKind,
    confirms: Mutex<VecDeque<Result<ProviderCapture, ProviderError>>>,
    pub idempotency_keys: Mutex<Vec<String>>,
    pub cancelled: Mutex<Vec<String>>,
    pub refunds: Mutex<Vec<(String, Money)>>,
    refund_delay: Mutex<Option<Duration>>,
}

impl FakeProvider {
    pub fn new(kind: ProviderKind) -> Arc<Self> {
        Arc::new(Self {
            kind,
            confirms: Mutex::new(VecDeque::new()),
            idempotency_keys: Mutex::new(vec![]),
            cancelled: Mutex::new(vec![]),
            refunds: Mutex::new(vec![]),
            refund_delay: Mutex::new(None),
        })
    }

    pub fn script(&self, outcome: Result<ProviderCapture, ProviderError>) { self.confirms.lock().unwrap().push_back(outcome); }

    pub fn slow_refunds(&self, delay: Duration) { *self.refund_delay.lock().unwrap() = Some(delay); }

    pub fn created(&self) -> usize { self.idempotency_keys.lock().unwrap().len() }
    pub fn cancel_calls(&self) -> usize { self.cancelled.lock().unwrap().len() }
}

#[async_trait]
impl PaymentProvider for FakeProvider {
    fn kind(&self) -> ProviderKind { self.kind }

    async fn create_intent(&self, request: &IntentRequest) -> Result<ProviderIntent, ProviderError> {
        let mut keys = self.idempotency_keys.lock().unwrap();
        keys.push(request.idempotency_key.clone());
        Ok(ProviderIntent {
            provider_ref: format!("{}_{}", self.kind, keys.len()),
            state: IntentState::RequiresPaymentMethod,
            client_secret: Some(format!("secret_{}", keys.len())),
            approval_url: None,
        })
    }

    async fn confirm(&self, provider_ref: &str) -> Result<ProviderCapture, ProviderError> {
        if let Some(outcome) = self.confirms.lock().unwrap().pop_front() {
            return outcome;
        }
        Ok(ProviderCapture {
            state: IntentState::Succeeded,
            capture_ref: Some(format!("ch_{provider_ref}")),
            amount: None,
            failure_reason: None,
            metadata: serde_json::json!({ "provider_ref": provider_ref }),
        })
    }

    async fn cancel(&self, provider_ref: &str) -> Result<(), ProviderError> {
        self.cancelled.lock().unwrap().push(provider_ref.to_string());
        Ok(())
    }

    async fn refund(&self, capture_ref: &str, amount: &Money, _idempotency_key: &str) -> Result<ProviderRefund, ProviderError> {
        let delay = *self.refund_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut refunds = self.refunds.lock().unwrap();
        refunds.push((capture_ref.to_string(), amount.clone()));
        Ok(ProviderRefund { refund_ref: format!("re_{}", refunds.len()), amount: amount.clone(), status: "succeeded".into() })
    }
}

/// Keeps every pushed notification.
#[derive(Default)]
pub struct RecordingPush {
    pub pushed: Mutex<Vec<Notification>>,
}

#[async_trait]
impl PushChannel for RecordingPush {
    async fn push(&self, note: &Notification) -> Result<(), PushError> {
        self.pushed.lock().unwrap().push(note.clone());
        Ok(())
    }
}

pub struct FailingPush;

#[async_trait]
impl PushChannel for FailingPush {
    async fn push(&self, _note: &Notification) -> Result<(), PushError> { Err(PushError::Publish("broker down".into())) }
}

/// Never answers; only the emitter's timeout ends the push.
pub struct HangingPush;

#[async_trait]
impl PushChannel for HangingPush {
    async fn push(&self, _note: &Notification) -> Result<(), PushError> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(())
    }
}

pub fn coupon(code: &str, kind: DiscountKind, value: rust_decimal::Decimal, minimum: Option<rust_decimal::Decimal>, limit: Option<i32>) -> Coupon {
    Coupon::create(
        NewCoupon { code: code.into(), kind, value, minimum_amount: minimum, usage_limit: limit, starts_at: None, expires_at: None },
        Utc::now(),
    )
    .unwrap()
}

pub struct Shop {
    pub store: Arc<MemoryStore>,
    pub front: Storefront,
    pub card: Arc<FakeProvider>,
    pub admin: Uuid,
    pub customer: Uuid,
    /// 50.00 EUR, 20 in stock
    pub widget: Product,
    /// 10% off from 50.00 EUR
    pub summer: Coupon,
}

impl Shop {
    pub async fn open() -> Self { Self::with_push(Arc::new(RecordingPush::default())).await }

    pub async fn with_push(push: Arc<dyn PushChannel>) -> Self {
        let store = Arc::new(MemoryStore::new());
        let admin = Uuid::now_v7();
        store.add_admin(admin).await;
        let widget = Product::create("WID-001", "Théière en fonte", Money::eur(dec!(50.00)), 20);
        store.add_product(widget.clone()).await;
        let summer = coupon("SUMMER10", DiscountKind::Percentage, dec!(10), Some(dec!(50)), None);
        store.add_coupon(summer.clone()).await;

        let card = FakeProvider::new(ProviderKind::Stripe);
        let providers = ProviderRegistry::new().register(card.clone());
        let settings = CheckoutSettings { push_timeout: Duration::from_millis(100), ..CheckoutSettings::default() };
        let front = Storefront::new(store.clone() as Arc<dyn CheckoutStore>, providers, push, settings);
        Self { store, front, card, admin, customer: Uuid::now_v7(), widget, summer }
    }

    pub async fn product(&self, sku: &str, price: rust_decimal::Decimal, stock: i32) -> Product {
        let product = Product::create(sku, format!("Article {sku}"), Money::eur(price), stock);
        self.store.add_product(product.clone()).await;
        product
    }

    /// Cart of `quantity` widgets for the customer; returns the order id.
    pub async fn cart(&self, quantity: u32) -> Uuid {
        self.front.orders.add_to_cart(self.customer, self.widget.id(), quantity).await.unwrap().id()
    }

    pub async fn stock_of(&self, product_id: Uuid) -> i32 {
        self.store.find_product(product_id).await.unwrap().unwrap().stock()
    }

    pub async fn used_count(&self, coupon_id: Uuid) -> i32 {
        self.store.find_coupon(coupon_id).await.unwrap().unwrap().used_count
    }
}

/// Serve `app` on an ephemeral local port; returns its base URL.
pub async fn serve(app: axum::Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
    format!("http://{addr}")
}
