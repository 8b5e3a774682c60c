//! Postgres-backed store

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::{FromRow, PgPool, Postgres, Transaction};
use std::str::FromStr;
use tracing::warn;
use uuid::Uuid;

use super::{
    CaptureRecord, CatalogRepository, ClaimOutcome, CouponRepository, NotificationRepository, OrderRepository, PaymentRepository,
    RefundRecord, StoreError, StoreResult,
};
use crate::domain::aggregates::{
    AppliedCoupon, CancelEffects, Cancellation, Coupon, LineItem, Notification, Order, OrderParts, Payment, PaymentIntent, Product,
    StockLevel,
};
use crate::domain::value_objects::{Money, OrderNumber};

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self { Self { pool } }
}

fn parse<T: FromStr<Err = String>>(raw: &str) -> StoreResult<T> { raw.parse().map_err(StoreError::Corrupt) }

fn parse_opt<T: FromStr<Err = String>>(raw: Option<&str>) -> StoreResult<Option<T>> { raw.map(parse).transpose() }

#[derive(FromRow)]
struct ProductRow { id: Uuid, sku: String, name: String, price: Decimal, currency: String, stock: i32, is_active: bool, updated_at: DateTime<Utc> }

impl From<ProductRow> for Product {
    fn from(r: ProductRow) -> Self {
        Product::restore(r.id, r.sku, r.name, Money::new(r.price, &r.currency), r.stock, r.is_active, r.updated_at)
    }
}

#[derive(FromRow)]
struct OrderRow {
    id: Uuid, number: String, user_id: Uuid, status: String, currency: String, discount: Decimal,
    coupon_id: Option<Uuid>, coupon_code: Option<String>, coupon_kind: Option<String>, coupon_value: Option<Decimal>,
    coupon_minimum: Option<Decimal>, cancel_actor: Option<String>, cancel_reason: Option<String>, cancelled_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>, placed_at: Option<DateTime<Utc>>, updated_at: DateTime<Utc>, version: i64,
}

#[derive(FromRow)]
struct LineRow { product_id: Uuid, sku: String, name: String, quantity: i32, unit_price: Decimal, line_total: Decimal }

impl OrderRow {
    fn into_order(self, lines: Vec<LineRow>) -> StoreResult<Order> {
        let coupon = match (self.coupon_id, self.coupon_code, self.coupon_kind.as_deref(), self.coupon_value) {
            (Some(coupon_id), Some(code), Some(kind), Some(value)) => {
                Some(AppliedCoupon { coupon_id, code, kind: parse(kind)?, value, minimum_amount: self.coupon_minimum })
            }
            (None, ..) => None,
            _ => return Err(StoreError::Corrupt(format!("order {} has a partial coupon", self.id))),
        };
        let cancellation = match (parse_opt(self.cancel_actor.as_deref())?, self.cancelled_at) {
            (Some(actor), Some(cancelled_at)) => Some(Cancellation { actor, reason: self.cancel_reason, cancelled_at }),
            _ => None,
        };
        let lines = lines
            .into_iter()
            .map(|l| {
                let quantity = u32::try_from(l.quantity).map_err(|_| StoreError::Corrupt(format!("negative quantity on order {}", self.id)))?;
                Ok(LineItem { product_id: l.product_id, sku: l.sku, name: l.name, quantity, unit_price: l.unit_price, line_total: l.line_total })
            })
            .collect::<StoreResult<Vec<_>>>()?;
        Ok(Order::from_parts(OrderParts {
            id: self.id, number: OrderNumber::from(self.number), user_id: self.user_id, status: parse(&self.status)?,
            currency: self.currency, lines, coupon, discount: self.discount, cancellation,
            created_at: self.created_at, placed_at: self.placed_at, updated_at: self.updated_at, version: self.version,
        }))
    }
}

#[derive(FromRow)]
struct CouponRow {
    id: Uuid, code: String, kind: String, value: Decimal, minimum_amount: Option<Decimal>, usage_limit: Option<i32>,
    used_count: i32, starts_at: Option<DateTime<Utc>>, expires_at: Option<DateTime<Utc>>, is_active: bool, created_at: DateTime<Utc>,
}

impl TryFrom<CouponRow> for Coupon {
    type Error = StoreError;
    fn try_from(r: CouponRow) -> StoreResult<Self> {
        Ok(Coupon {
            id: r.id, code: r.code, kind: parse(&r.kind)?, value: r.value, minimum_amount: r.minimum_amount,
            usage_limit: r.usage_limit, used_count: r.used_count, starts_at: r.starts_at, expires_at: r.expires_at,
            is_active: r.is_active, created_at: r.created_at,
        })
    }
}

#[derive(FromRow)]
struct IntentRow {
    id: Uuid, order_id: Uuid, provider: String, provider_ref: String, amount: Decimal, currency: String, state: String,
    client_secret: Option<String>, approval_url: Option<String>, created_at: DateTime<Utc>, updated_at: DateTime<Utc>,
}

impl TryFrom<IntentRow> for PaymentIntent {
    type Error = StoreError;
    fn try_from(r: IntentRow) -> StoreResult<Self> {
        Ok(PaymentIntent {
            id: r.id, order_id: r.order_id, provider: parse(&r.provider)?, provider_ref: r.provider_ref, amount: r.amount,
            currency: r.currency, state: parse(&r.state)?, client_secret: r.client_secret, approval_url: r.approval_url,
            created_at: r.created_at, updated_at: r.updated_at,
        })
    }
}

#[derive(FromRow)]
struct PaymentRow {
    id: Uuid, reference: String, order_id: Uuid, user_id: Uuid, intent_id: Uuid, provider: String, amount: Decimal,
    currency: String, refunded_amount: Decimal, status: String, metadata: serde_json::Value, paid_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<PaymentRow> for Payment {
    type Error = StoreError;
    fn try_from(r: PaymentRow) -> StoreResult<Self> {
        Ok(Payment {
            id: r.id, reference: r.reference, order_id: r.order_id, user_id: r.user_id, intent_id: r.intent_id,
            provider: parse(&r.provider)?, amount: r.amount, currency: r.currency, refunded_amount: r.refunded_amount,
            status: parse(&r.status)?, metadata: r.metadata, paid_at: r.paid_at, updated_at: r.updated_at,
        })
    }
}

#[derive(FromRow)]
struct NotificationRow {
    id: Uuid, user_id: Uuid, kind: String, title: String, message: String, data: serde_json::Value,
    read_at: Option<DateTime<Utc>>, created_at: DateTime<Utc>,
}

impl TryFrom<NotificationRow> for Notification {
    type Error = StoreError;
    fn try_from(r: NotificationRow) -> StoreResult<Self> {
        Ok(Notification {
            id: r.id, user_id: r.user_id, kind: parse(&r.kind)?, title: r.title, message: r.message, data: r.data,
            read_at: r.read_at, created_at: r.created_at,
        })
    }
}

const ORDER_COLUMNS: &str = "id, number, user_id, status, currency, discount, coupon_id, coupon_code, coupon_kind, coupon_value, \
     coupon_minimum, cancel_actor, cancel_reason, cancelled_at, created_at, placed_at, updated_at, version";
const COUPON_COLUMNS: &str =
    "id, code, kind, value, minimum_amount, usage_limit, used_count, starts_at, expires_at, is_active, created_at";
const INTENT_COLUMNS: &str =
    "id, order_id, provider, provider_ref, amount, currency, state, client_secret, approval_url, created_at, updated_at";
const PAYMENT_COLUMNS: &str = "id, reference, order_id, user_id, intent_id, provider, amount, currency, refunded_amount, status, \
     metadata, paid_at, updated_at";

fn changed_since_loaded(order: &Order) -> StoreError {
    StoreError::Conflict(format!("order {} changed since it was loaded", order.id()))
}

/// Insert a never-stored order, or update the row still at `order.version()`.
async fn write_order(tx: &mut Transaction<'_, Postgres>, order: &Order) -> StoreResult<()> {
    let coupon = order.coupon();
    let cancellation = order.cancellation();
    // identity columns never change; the update matches them with the version
    let sql = if order.version() == 0 {
        "INSERT INTO orders (id, number, user_id, status, currency, subtotal, discount, total, coupon_id, coupon_code, coupon_kind, \
         coupon_value, coupon_minimum, cancel_actor, cancel_reason, cancelled_at, created_at, placed_at, updated_at, version) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19, $20 + 1)"
    } else {
        "UPDATE orders SET status = $4, subtotal = $6, discount = $7, total = $8, coupon_id = $9, coupon_code = $10, \
         coupon_kind = $11, coupon_value = $12, coupon_minimum = $13, cancel_actor = $14, cancel_reason = $15, cancelled_at = $16, \
         placed_at = $18, updated_at = $19, version = version + 1 \
         WHERE id = $1 AND version = $20 AND number = $2 AND user_id = $3 AND currency = $5 AND created_at = $17"
    };
    let written = sqlx::query(sql)
        .bind(order.id())
        .bind(order.number().as_str())
        .bind(order.user_id())
        .bind(order.status().as_str())
        .bind(order.currency())
        .bind(order.subtotal().amount())
        .bind(order.discount().amount())
        .bind(order.total().amount())
        .bind(coupon.map(|c| c.coupon_id))
        .bind(coupon.map(|c| c.code.clone()))
        .bind(coupon.map(|c| c.kind.as_str()))
        .bind(coupon.map(|c| c.value))
        .bind(coupon.and_then(|c| c.minimum_amount))
        .bind(cancellation.map(|c| c.actor.as_str()))
        .bind(cancellation.and_then(|c| c.reason.clone()))
        .bind(cancellation.map(|c| c.cancelled_at))
        .bind(order.created_at())
        .bind(order.placed_at())
        .bind(order.updated_at())
        .bind(order.version())
        .execute(&mut **tx)
        .await;
    match written {
        Ok(done) if done.rows_affected() == 0 => return Err(changed_since_loaded(order)),
        Ok(_) => {}
        Err(sqlx::Error::Database(db)) if db.constraint() == Some("orders_number_key") => {
            return Err(StoreError::Duplicate(format!("order number {}", order.number())));
        }
        Err(sqlx::Error::Database(db)) if db.is_unique_violation() => return Err(changed_since_loaded(order)),
        Err(e) => return Err(e.into()),
    }

    sqlx::query("DELETE FROM order_lines WHERE order_id = $1").bind(order.id()).execute(&mut **tx).await?;
    for (position, line) in order.lines().iter().enumerate() {
        sqlx::query(
            "INSERT INTO order_lines (order_id, position, product_id, sku, name, quantity, unit_price, line_total) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(order.id())
        .bind(position as i32)
        .bind(line.product_id)
        .bind(&line.sku)
        .bind(&line.name)
        .bind(line.quantity as i32)
        .bind(line.unit_price)
        .bind(line.line_total)
        .execute(&mut **tx)
        .await?;
    }
    Ok(())
}

async fn release_in(tx: &mut Transaction<'_, Postgres>, coupon_id: Uuid) -> StoreResult<()> {
    sqlx::query("UPDATE coupons SET used_count = GREATEST(used_count - 1, 0) WHERE id = $1").bind(coupon_id).execute(&mut **tx).await?;
    Ok(())
}

#[async_trait]
impl CatalogRepository for PgStore {
    async fn find_product(&self, id: Uuid) -> StoreResult<Option<Product>> {
        let row = sqlx::query_as::<_, ProductRow>("SELECT id, sku, name, price, currency, stock, is_active, updated_at FROM products WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(Product::from))
    }

    async fn admin_ids(&self) -> StoreResult<Vec<Uuid>> {
        let rows: Vec<(Uuid,)> = sqlx::query_as("SELECT id FROM users WHERE is_admin ORDER BY id").fetch_all(&self.pool).await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }
}

#[async_trait]
impl OrderRepository for PgStore {
    async fn load_order(&self, id: Uuid) -> StoreResult<Option<Order>> {
        let sql = format!("SELECT {ORDER_COLUMNS} FROM orders WHERE id = $1");
        let Some(row) = sqlx::query_as::<_, OrderRow>(&sql).bind(id).fetch_optional(&self.pool).await? else {
            return Ok(None);
        };
        let lines = sqlx::query_as::<_, LineRow>(
            "SELECT product_id, sku, name, quantity, unit_price, line_total FROM order_lines WHERE order_id = $1 ORDER BY position",
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?;
        row.into_order(lines).map(Some)
    }

    async fn find_cart(&self, user_id: Uuid) -> StoreResult<Option<Order>> {
        let id: Option<(Uuid,)> =
            sqlx::query_as("SELECT id FROM orders WHERE user_id = $1 AND status = 'panier' ORDER BY created_at DESC LIMIT 1")
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?;
        match id {
            Some((id,)) => self.load_order(id).await,
            None => Ok(None),
        }
    }

    async fn save_order(&self, order: &Order) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;
        write_order(&mut tx, order).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn cancel_order(&self, order: &Order, effects: &CancelEffects) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;
        let locked: Option<(String,)> = sqlx::query_as("SELECT status FROM orders WHERE id = $1 FOR UPDATE")
            .bind(order.id())
            .fetch_optional(&mut *tx)
            .await?;
        match locked {
            Some((status,)) if status == "en_attente" || status == "confirmee" => {}
            Some((status,)) => return Err(StoreError::Conflict(format!("order {} is now {status}", order.id()))),
            None => return Err(StoreError::Conflict(format!("order {} vanished", order.id()))),
        }
        write_order(&mut tx, order).await?;
        if let Some(coupon_id) = effects.release_coupon {
            let (refunded,): (bool,) =
                sqlx::query_as("SELECT EXISTS (SELECT 1 FROM payments WHERE order_id = $1 AND refunded_amount >= amount)")
                    .bind(order.id())
                    .fetch_one(&mut *tx)
                    .await?;
            if !refunded {
                release_in(&mut tx, coupon_id).await?;
            }
        }
        for (product_id, quantity) in &effects.restock {
            sqlx::query("UPDATE products SET stock = stock + $2, updated_at = NOW() WHERE id = $1")
                .bind(product_id)
                .bind(*quantity as i32)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl CouponRepository for PgStore {
    async fn find_coupon(&self, id: Uuid) -> StoreResult<Option<Coupon>> {
        sqlx::query_as::<_, CouponRow>(&format!("SELECT {COUPON_COLUMNS} FROM coupons WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .map(Coupon::try_from)
            .transpose()
    }

    async fn find_coupon_by_code(&self, code: &str) -> StoreResult<Option<Coupon>> {
        sqlx::query_as::<_, CouponRow>(&format!("SELECT {COUPON_COLUMNS} FROM coupons WHERE code = $1"))
            .bind(code)
            .fetch_optional(&self.pool)
            .await?
            .map(Coupon::try_from)
            .transpose()
    }

    async fn insert_coupon(&self, coupon: &Coupon) -> StoreResult<()> {
        let result = sqlx::query(&format!("INSERT INTO coupons ({COUPON_COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)"))
            .bind(coupon.id)
            .bind(&coupon.code)
            .bind(coupon.kind.as_str())
            .bind(coupon.value)
            .bind(coupon.minimum_amount)
            .bind(coupon.usage_limit)
            .bind(coupon.used_count)
            .bind(coupon.starts_at)
            .bind(coupon.expires_at)
            .bind(coupon.is_active)
            .bind(coupon.created_at)
            .execute(&self.pool)
            .await;
        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => Err(StoreError::Duplicate(format!("coupon {}", coupon.code))),
            Err(e) => Err(e.into()),
        }
    }

    async fn claim_coupon(&self, coupon_id: Uuid, order: &Order) -> StoreResult<ClaimOutcome> {
        let Some(coupon) = order.coupon() else {
            return Err(StoreError::Conflict(format!("order {} carries no coupon to save", order.id())));
        };
        let mut tx = self.pool.begin().await?;
        let stored: Option<(Option<Uuid>, i64)> = sqlx::query_as("SELECT coupon_id, version FROM orders WHERE id = $1 FOR UPDATE")
            .bind(order.id())
            .fetch_optional(&mut *tx)
            .await?;
        match stored {
            Some((Some(_), _)) => {
                tx.rollback().await?;
                return Ok(ClaimOutcome::AlreadyApplied);
            }
            Some((None, version)) if version == order.version() => {}
            _ => {
                tx.rollback().await?;
                return Err(changed_since_loaded(order));
            }
        }
        let claimed = sqlx::query(
            "UPDATE coupons SET used_count = used_count + 1 \
             WHERE id = $1 AND is_active AND (usage_limit IS NULL OR used_count < usage_limit)",
        )
        .bind(coupon_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        if claimed == 0 {
            tx.rollback().await?;
            return Ok(ClaimOutcome::LimitReached);
        }
        let updated = sqlx::query(
            "UPDATE orders SET coupon_id = $2, coupon_code = $3, coupon_kind = $4, coupon_value = $5, coupon_minimum = $6, \
             subtotal = $7, discount = $8, total = $9, updated_at = $10, version = version + 1 \
             WHERE id = $1 AND version = $11 AND status IN ('panier', 'en_attente')",
        )
        .bind(order.id())
        .bind(coupon.coupon_id)
        .bind(&coupon.code)
        .bind(coupon.kind.as_str())
        .bind(coupon.value)
        .bind(coupon.minimum_amount)
        .bind(order.subtotal().amount())
        .bind(order.discount().amount())
        .bind(order.total().amount())
        .bind(order.updated_at())
        .bind(order.version())
        .execute(&mut *tx)
        .await?
        .rows_affected();
        if updated == 0 {
            tx.rollback().await?;
            return Err(changed_since_loaded(order));
        }
        tx.commit().await?;
        Ok(ClaimOutcome::Claimed)
    }

    async fn release_coupon(&self, coupon_id: Uuid) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;
        release_in(&mut tx, coupon_id).await?;
        tx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl PaymentRepository for PgStore {
    async fn find_intent(&self, id: Uuid) -> StoreResult<Option<PaymentIntent>> {
        sqlx::query_as::<_, IntentRow>(&format!("SELECT {INTENT_COLUMNS} FROM payment_intents WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .map(PaymentIntent::try_from)
            .transpose()
    }

    async fn intents_for_order(&self, order_id: Uuid) -> StoreResult<Vec<PaymentIntent>> {
        sqlx::query_as::<_, IntentRow>(&format!("SELECT {INTENT_COLUMNS} FROM payment_intents WHERE order_id = $1 ORDER BY created_at, id"))
            .bind(order_id)
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(PaymentIntent::try_from)
            .collect()
    }

    async fn save_intent(&self, intent: &PaymentIntent) -> StoreResult<()> {
        sqlx::query(&format!(
            "INSERT INTO payment_intents ({INTENT_COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11) \
             ON CONFLICT (id) DO UPDATE SET state = $7, client_secret = $8, approval_url = $9, updated_at = $11"
        ))
        .bind(intent.id)
        .bind(intent.order_id)
        .bind(intent.provider.as_str())
        .bind(&intent.provider_ref)
        .bind(intent.amount)
        .bind(&intent.currency)
        .bind(intent.state.as_str())
        .bind(&intent.client_secret)
        .bind(&intent.approval_url)
        .bind(intent.created_at)
        .bind(intent.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_payment(&self, id: Uuid) -> StoreResult<Option<Payment>> {
        sqlx::query_as::<_, PaymentRow>(&format!("SELECT {PAYMENT_COLUMNS} FROM payments WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .map(Payment::try_from)
            .transpose()
    }

    async fn find_payment_by_intent(&self, intent_id: Uuid) -> StoreResult<Option<Payment>> {
        sqlx::query_as::<_, PaymentRow>(&format!("SELECT {PAYMENT_COLUMNS} FROM payments WHERE intent_id = $1"))
            .bind(intent_id)
            .fetch_optional(&self.pool)
            .await?
            .map(Payment::try_from)
            .transpose()
    }

    async fn record_capture(&self, payment: &Payment, intent: &PaymentIntent, order: &Order) -> StoreResult<CaptureRecord> {
        let mut tx = self.pool.begin().await?;
        let inserted = sqlx::query(&format!(
            "INSERT INTO payments ({PAYMENT_COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13) \
             ON CONFLICT (intent_id) DO NOTHING"
        ))
        .bind(payment.id)
        .bind(&payment.reference)
        .bind(payment.order_id)
        .bind(payment.user_id)
        .bind(payment.intent_id)
        .bind(payment.provider.as_str())
        .bind(payment.amount)
        .bind(&payment.currency)
        .bind(payment.refunded_amount)
        .bind(payment.status.as_str())
        .bind(&payment.metadata)
        .bind(payment.paid_at)
        .bind(payment.updated_at)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        if inserted == 0 {
            tx.rollback().await?;
            let existing = self
                .find_payment_by_intent(intent.id)
                .await?
                .ok_or_else(|| StoreError::Conflict(format!("payment for intent {} disappeared", intent.id)))?;
            return Ok(CaptureRecord { payment: existing, newly_recorded: false, stock: vec![] });
        }

        sqlx::query("UPDATE payment_intents SET state = $2, updated_at = $3 WHERE id = $1")
            .bind(intent.id)
            .bind(intent.state.as_str())
            .bind(intent.updated_at)
            .execute(&mut *tx)
            .await?;

        let confirmed = sqlx::query(
            "UPDATE orders SET status = $2, updated_at = $3, version = version + 1 \
             WHERE id = $1 AND status = 'en_attente' AND version = $4",
        )
        .bind(order.id())
        .bind(order.status().as_str())
        .bind(order.updated_at())
        .bind(order.version())
        .execute(&mut *tx)
            .await?
            .rows_affected();
        if confirmed == 0 {
            tx.rollback().await?;
            return Err(StoreError::Conflict(format!("order {} changed while the payment was confirmed", order.id())));
        }

        let mut stock = Vec::with_capacity(order.lines().len());
        for line in order.lines() {
            let current: Option<(String, String, i32)> =
                sqlx::query_as("SELECT sku, name, stock FROM products WHERE id = $1 FOR UPDATE")
                    .bind(line.product_id)
                    .fetch_optional(&mut *tx)
                    .await?;
            let Some((sku, name, previous)) = current else {
                warn!(product_id = %line.product_id, order_id = %order.id(), "ordered product no longer exists");
                continue;
            };
            let (current,): (i32,) =
                sqlx::query_as("UPDATE products SET stock = GREATEST(stock - $2, 0), updated_at = NOW() WHERE id = $1 RETURNING stock")
                    .bind(line.product_id)
                    .bind(line.quantity as i32)
                    .fetch_one(&mut *tx)
                    .await?;
            stock.push(StockLevel { product_id: line.product_id, sku, name, previous, current });
        }
        tx.commit().await?;
        Ok(CaptureRecord { payment: payment.clone(), newly_recorded: true, stock })
    }

    async fn record_refund(&self, payment_id: Uuid, refund_ref: &str, amount: Decimal, at: DateTime<Utc>) -> StoreResult<RefundRecord> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query_as::<_, PaymentRow>(&format!("SELECT {PAYMENT_COLUMNS} FROM payments WHERE id = $1 FOR UPDATE"))
            .bind(payment_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| StoreError::Conflict(format!("payment {payment_id} vanished")))?;
        let mut payment = Payment::try_from(row)?;
        if payment.has_refund(refund_ref) {
            tx.rollback().await?;
            return Ok(RefundRecord { payment, newly_recorded: false, released_coupon: None });
        }
        payment
            .apply_refund(refund_ref, amount, at)
            .map_err(|e| StoreError::Conflict(format!("refund {refund_ref} on payment {payment_id}: {e}")))?;
        sqlx::query("UPDATE payments SET refunded_amount = $2, status = $3, metadata = $4, updated_at = $5 WHERE id = $1")
            .bind(payment.id)
            .bind(payment.refunded_amount)
            .bind(payment.status.as_str())
            .bind(&payment.metadata)
            .bind(payment.updated_at)
            .execute(&mut *tx)
            .await?;

        let mut released_coupon = None;
        if payment.is_fully_refunded() {
            let order: Option<(Option<Uuid>, String)> = sqlx::query_as("SELECT coupon_id, status FROM orders WHERE id = $1 FOR UPDATE")
                .bind(payment.order_id)
                .fetch_optional(&mut *tx)
                .await?;
            if let Some((Some(coupon_id), status)) = order {
                if status != "annulee" {
                    release_in(&mut tx, coupon_id).await?;
                    released_coupon = Some(coupon_id);
                }
            }
        }
        tx.commit().await?;
        Ok(RefundRecord { payment, newly_recorded: true, released_coupon })
    }
}

#[async_trait]
impl NotificationRepository for PgStore {
    async fn insert_notifications(&self, notes: &[Notification]) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;
        for n in notes {
            sqlx::query(
                "INSERT INTO notifications (id, user_id, kind, title, message, data, read_at, created_at) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
            )
            .bind(n.id)
            .bind(n.user_id)
            .bind(n.kind.as_str())
            .bind(&n.title)
            .bind(&n.message)
            .bind(&n.data)
            .bind(n.read_at)
            .bind(n.created_at)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn list_notifications(&self, user_id: Uuid, unread_only: bool) -> StoreResult<Vec<Notification>> {
        sqlx::query_as::<_, NotificationRow>(
            "SELECT id, user_id, kind, title, message, data, read_at, created_at FROM notifications \
             WHERE user_id = $1 AND (NOT $2 OR read_at IS NULL) ORDER BY created_at DESC, id DESC",
        )
        .bind(user_id)
        .bind(unread_only)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(Notification::try_from)
        .collect()
    }

    async fn mark_notification_read(&self, user_id: Uuid, id: Uuid, at: DateTime<Utc>) -> StoreResult<Option<Notification>> {
        sqlx::query_as::<_, NotificationRow>(
            "UPDATE notifications SET read_at = COALESCE(read_at, $3) WHERE id = $1 AND user_id = $2 \
             RETURNING id, user_id, kind, title, message, data, read_at, created_at",
        )
        .bind(id)
        .bind(user_id)
        .bind(at)
        .fetch_optional(&self.pool)
        .await?
        .map(Notification::try_from)
        .transpose()
    }
}
