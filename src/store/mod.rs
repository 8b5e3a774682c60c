//! Persistence seams.
//!
//! Each trait covers one aggregate; methods that change several rows run as
//! one unit of work in every implementation.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use thiserror::Error;
use uuid::Uuid;

use crate::domain::aggregates::{CancelEffects, Coupon, Notification, Order, Payment, PaymentIntent, Product, StockLevel};

pub use memory::MemoryStore;
pub use postgres::PgStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("stored row is invalid: {0}")]
    Corrupt(String),
    /// A unique value (coupon code, order number) is taken.
    #[error("{0} already exists")]
    Duplicate(String),
    #[error("concurrent update: {0}")]
    Conflict(String),
}

impl StoreError {
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Database(err) => matches!(err, sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) | sqlx::Error::PoolClosed),
            Self::Conflict(_) => true,
            Self::Corrupt(_) | Self::Duplicate(_) => false,
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Result of the guarded coupon claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    Claimed,
    /// Usage limit hit by a concurrent checkout
    LimitReached,
    /// The order picked up a coupon in the meantime
    AlreadyApplied,
}

/// What `record_capture` wrote.
#[derive(Debug, Clone)]
pub struct CaptureRecord {
    pub payment: Payment,
    /// False when the intent already had a payment; nothing else was written.
    pub newly_recorded: bool,
    pub stock: Vec<StockLevel>,
}

/// What `record_refund` wrote.
#[derive(Debug, Clone)]
pub struct RefundRecord {
    pub payment: Payment,
    /// False when this refund reference was already on the payment.
    pub newly_recorded: bool,
    pub released_coupon: Option<Uuid>,
}

#[async_trait]
pub trait CatalogRepository: Send + Sync {
    async fn find_product(&self, id: Uuid) -> StoreResult<Option<Product>>;
    async fn admin_ids(&self) -> StoreResult<Vec<Uuid>>;
}

#[async_trait]
pub trait OrderRepository: Send + Sync {
    /// The order with all of its lines.
    async fn load_order(&self, id: Uuid) -> StoreResult<Option<Order>>;
    /// The user's open cart, if any.
    async fn find_cart(&self, user_id: Uuid) -> StoreResult<Option<Order>>;
    /// Insert a new order or overwrite the stored one.
    ///
    /// Every write of an order, here and in the other repositories, is guarded
    /// by `Order::version`: a copy loaded before a concurrent write fails with
    /// `Conflict` instead of overwriting it. A taken order number on insert
    /// fails with `Duplicate`.
    async fn save_order(&self, order: &Order) -> StoreResult<()>;
    /// Persist a cancelled order, release its coupon use and restock its lines.
    ///
    /// The coupon use is kept when a payment of the order was already fully
    /// refunded, since that refund gave it back.
    async fn cancel_order(&self, order: &Order, effects: &CancelEffects) -> StoreResult<()>;
}

#[async_trait]
pub trait CouponRepository: Send + Sync {
    async fn find_coupon(&self, id: Uuid) -> StoreResult<Option<Coupon>>;
    async fn find_coupon_by_code(&self, code: &str) -> StoreResult<Option<Coupon>>;
    async fn insert_coupon(&self, coupon: &Coupon) -> StoreResult<()>;
    /// Claim one use of the coupon and save the discounted order together.
    /// `order` must already carry the applied coupon.
    async fn claim_coupon(&self, coupon_id: Uuid, order: &Order) -> StoreResult<ClaimOutcome>;
    /// Give one use back, never going below zero.
    async fn release_coupon(&self, coupon_id: Uuid) -> StoreResult<()>;
}

#[async_trait]
pub trait PaymentRepository: Send + Sync {
    async fn find_intent(&self, id: Uuid) -> StoreResult<Option<PaymentIntent>>;
    /// Oldest first.
    async fn intents_for_order(&self, order_id: Uuid) -> StoreResult<Vec<PaymentIntent>>;
    async fn save_intent(&self, intent: &PaymentIntent) -> StoreResult<()>;
    async fn find_payment(&self, id: Uuid) -> StoreResult<Option<Payment>>;
    async fn find_payment_by_intent(&self, intent_id: Uuid) -> StoreResult<Option<Payment>>;
    /// Insert the payment, mark the intent, confirm the order and take its lines out of stock.
    async fn record_capture(&self, payment: &Payment, intent: &PaymentIntent, order: &Order) -> StoreResult<CaptureRecord>;
    /// Apply a provider-confirmed refund to the current payment row under a lock.
    ///
    /// A refund reference already on the payment is not applied twice. The
    /// refund that empties the balance gives the order's coupon use back
    /// unless the order was cancelled.
    async fn record_refund(&self, payment_id: Uuid, refund_ref: &str, amount: Decimal, at: DateTime<Utc>) -> StoreResult<RefundRecord>;
}

#[async_trait]
pub trait NotificationRepository: Send + Sync {
    async fn insert_notifications(&self, notes: &[Notification]) -> StoreResult<()>;
    /// Newest first.
    async fn list_notifications(&self, user_id: Uuid, unread_only: bool) -> StoreResult<Vec<Notification>>;
    async fn mark_notification_read(&self, user_id: Uuid, id: Uuid, at: DateTime<Utc>) -> StoreResult<Option<Notification>>;
}

pub trait CheckoutStore: CatalogRepository + OrderRepository + CouponRepository + PaymentRepository + NotificationRepository {}

impl<T> CheckoutStore for T where T: CatalogRepository + OrderRepository + CouponRepository + PaymentRepository + NotificationRepository {}
