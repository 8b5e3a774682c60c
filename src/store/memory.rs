//! In-process store for tests and local runs.
//!
//! A single mutex guards all state and is held for the whole of each method,
//! so every multi-row change is atomic with respect to concurrent callers.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{
    CaptureRecord, CatalogRepository, ClaimOutcome, CouponRepository, NotificationRepository, OrderRepository, PaymentRepository,
    RefundRecord, StoreError, StoreResult,
};
use crate::domain::aggregates::{
    CancelEffects, Coupon, Notification, Order, OrderParts, OrderStatus, Payment, PaymentIntent, Product, StockLevel,
};

#[derive(Default)]
struct State {
    products: HashMap<Uuid, Product>,
    admins: HashSet<Uuid>,
    orders: HashMap<Uuid, OrderParts>,
    coupons: HashMap<Uuid, Coupon>,
    intents: HashMap<Uuid, PaymentIntent>,
    payments: HashMap<Uuid, Payment>,
    notifications: Vec<Notification>,
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self { Self::default() }

    pub async fn add_product(&self, product: Product) { self.state.lock().await.products.insert(product.id(), product); }

    pub async fn add_admin(&self, user_id: Uuid) { self.state.lock().await.admins.insert(user_id); }

    pub async fn add_coupon(&self, coupon: Coupon) { self.state.lock().await.coupons.insert(coupon.id, coupon); }

    pub async fn notifications(&self) -> Vec<Notification> { self.state.lock().await.notifications.clone() }
}

/// Write `order` if nobody wrote it since it was loaded.
fn put_order(orders: &mut HashMap<Uuid, OrderParts>, order: &Order) -> StoreResult<()> {
    let stored = orders.get(&order.id()).map_or(0, |o| o.version);
    if stored != order.version() {
        return Err(StoreError::Conflict(format!("order {} changed since it was loaded", order.id())));
    }
    if stored == 0 && orders.values().any(|o| &o.number == order.number()) {
        return Err(StoreError::Duplicate(format!("order number {}", order.number())));
    }
    let mut parts = order.to_parts();
    parts.version = stored + 1;
    orders.insert(order.id(), parts);
    Ok(())
}

fn release_use(coupons: &mut HashMap<Uuid, Coupon>, coupon_id: Uuid) {
    if let Some(coupon) = coupons.get_mut(&coupon_id) {
        coupon.used_count = (coupon.used_count - 1).max(0);
    }
}

fn take_stock(product: &mut Product, quantity: u32) -> StockLevel {
    match product.remove_stock(quantity) {
        Ok(level) => level,
        Err(_) => {
            // oversold: payment is already captured, floor at zero
            let previous = product.stock();
            let mut level = product.remove_stock(previous.max(0) as u32).unwrap_or_else(|_| product.add_stock(0));
            level.previous = previous;
            level
        }
    }
}

#[async_trait]
impl CatalogRepository for MemoryStore {
    async fn find_product(&self, id: Uuid) -> StoreResult<Option<Product>> { Ok(self.state.lock().await.products.get(&id).cloned()) }

    async fn admin_ids(&self) -> StoreResult<Vec<Uuid>> {
        let mut ids: Vec<Uuid> = self.state.lock().await.admins.iter().copied().collect();
        ids.sort();
        Ok(ids)
    }
}

#[async_trait]
impl OrderRepository for MemoryStore {
    async fn load_order(&self, id: Uuid) -> StoreResult<Option<Order>> {
        Ok(self.state.lock().await.orders.get(&id).cloned().map(Order::from_parts))
    }

    async fn find_cart(&self, user_id: Uuid) -> StoreResult<Option<Order>> {
        let state = self.state.lock().await;
        Ok(state
            .orders
            .values()
            .filter(|o| o.user_id == user_id && o.status == OrderStatus::Panier)
            .max_by_key(|o| o.created_at)
            .cloned()
            .map(Order::from_parts))
    }

    async fn save_order(&self, order: &Order) -> StoreResult<()> { put_order(&mut self.state.lock().await.orders, order) }

    async fn cancel_order(&self, order: &Order, effects: &CancelEffects) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        let stored = state.orders.get(&order.id()).ok_or_else(|| StoreError::Conflict(format!("order {} vanished", order.id())))?;
        if !stored.status.is_cancellable() {
            return Err(StoreError::Conflict(format!("order {} is now {}", order.id(), stored.status)));
        }
        put_order(&mut state.orders, order)?;
        let refunded = state.payments.values().any(|p| p.order_id == order.id() && p.is_fully_refunded());
        if let Some(coupon_id) = effects.release_coupon.filter(|_| !refunded) {
            release_use(&mut state.coupons, coupon_id);
        }
        for (product_id, quantity) in &effects.restock {
            if let Some(product) = state.products.get_mut(product_id) {
                product.add_stock(*quantity);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl CouponRepository for MemoryStore {
    async fn find_coupon(&self, id: Uuid) -> StoreResult<Option<Coupon>> { Ok(self.state.lock().await.coupons.get(&id).cloned()) }

    async fn find_coupon_by_code(&self, code: &str) -> StoreResult<Option<Coupon>> {
        Ok(self.state.lock().await.coupons.values().find(|c| c.code == code).cloned())
    }

    async fn insert_coupon(&self, coupon: &Coupon) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        if state.coupons.values().any(|c| c.code == coupon.code) {
            return Err(StoreError::Duplicate(format!("coupon {}", coupon.code)));
        }
        state.coupons.insert(coupon.id, coupon.clone());
        Ok(())
    }

    async fn claim_coupon(&self, coupon_id: Uuid, order: &Order) -> StoreResult<ClaimOutcome> {
        if order.coupon().is_none() {
            return Err(StoreError::Conflict(format!("order {} carries no coupon to save", order.id())));
        }
        let mut state = self.state.lock().await;
        match state.orders.get(&order.id()) {
            Some(stored) if stored.coupon.is_some() => return Ok(ClaimOutcome::AlreadyApplied),
            Some(stored) if stored.version == order.version() => {}
            _ => return Err(StoreError::Conflict(format!("order {} changed since it was loaded", order.id()))),
        }
        let Some(coupon) = state.coupons.get_mut(&coupon_id) else { return Ok(ClaimOutcome::LimitReached) };
        if !coupon.is_active || coupon.is_exhausted() {
            return Ok(ClaimOutcome::LimitReached);
        }
        coupon.used_count += 1;
        put_order(&mut state.orders, order)?;
        Ok(ClaimOutcome::Claimed)
    }

    async fn release_coupon(&self, coupon_id: Uuid) -> StoreResult<()> {
        release_use(&mut self.state.lock().await.coupons, coupon_id);
        Ok(())
    }
}

#[async_trait]
impl PaymentRepository for MemoryStore {
    async fn find_intent(&self, id: Uuid) -> StoreResult<Option<PaymentIntent>> { Ok(self.state.lock().await.intents.get(&id).cloned()) }

    async fn intents_for_order(&self, order_id: Uuid) -> StoreResult<Vec<PaymentIntent>> {
        let state = self.state.lock().await;
        let mut intents: Vec<_> = state.intents.values().filter(|i| i.order_id == order_id).cloned().collect();
        intents.sort_by_key(|i| (i.created_at, i.id));
        Ok(intents)
    }

    async fn save_intent(&self, intent: &PaymentIntent) -> StoreResult<()> {
        self.state.lock().await.intents.insert(intent.id, intent.clone());
        Ok(())
    }

    async fn find_payment(&self, id: Uuid) -> StoreResult<Option<Payment>> { Ok(self.state.lock().await.payments.get(&id).cloned()) }

    async fn find_payment_by_intent(&self, intent_id: Uuid) -> StoreResult<Option<Payment>> {
        Ok(self.state.lock().await.payments.values().find(|p| p.intent_id == intent_id).cloned())
    }

    async fn record_capture(&self, payment: &Payment, intent: &PaymentIntent, order: &Order) -> StoreResult<CaptureRecord> {
        let mut state = self.state.lock().await;
        if let Some(existing) = state.payments.values().find(|p| p.intent_id == intent.id) {
            return Ok(CaptureRecord { payment: existing.clone(), newly_recorded: false, stock: vec![] });
        }
        match state.orders.get(&order.id()) {
            Some(stored) if stored.status == OrderStatus::EnAttente => {}
            Some(stored) => return Err(StoreError::Conflict(format!("order {} is now {}", order.id(), stored.status))),
            None => return Err(StoreError::Conflict(format!("order {} vanished", order.id()))),
        }
        put_order(&mut state.orders, order)?;
        state.payments.insert(payment.id, payment.clone());
        state.intents.insert(intent.id, intent.clone());
        let mut stock = Vec::with_capacity(order.lines().len());
        for line in order.lines() {
            if let Some(product) = state.products.get_mut(&line.product_id) {
                stock.push(take_stock(product, line.quantity));
            }
        }
        Ok(CaptureRecord { payment: payment.clone(), newly_recorded: true, stock })
    }

    async fn record_refund(&self, payment_id: Uuid, refund_ref: &str, amount: Decimal, at: DateTime<Utc>) -> StoreResult<RefundRecord> {
        let mut state = self.state.lock().await;
        let payment = state.payments.get_mut(&payment_id).ok_or_else(|| StoreError::Conflict(format!("payment {payment_id} vanished")))?;
        if payment.has_refund(refund_ref) {
            return Ok(RefundRecord { payment: payment.clone(), newly_recorded: false, released_coupon: None });
        }
        payment
            .apply_refund(refund_ref, amount, at)
            .map_err(|e| StoreError::Conflict(format!("refund {refund_ref} on payment {payment_id}: {e}")))?;
        let payment = payment.clone();
        let released_coupon = if payment.is_fully_refunded() {
            state
                .orders
                .get(&payment.order_id)
                .filter(|o| o.status != OrderStatus::Annulee)
                .and_then(|o| o.coupon.as_ref().map(|c| c.coupon_id))
        } else {
            None
        };
        if let Some(coupon_id) = released_coupon {
            release_use(&mut state.coupons, coupon_id);
        }
        Ok(RefundRecord { payment, newly_recorded: true, released_coupon })
    }
}

#[async_trait]
impl NotificationRepository for MemoryStore {
    async fn insert_notifications(&self, notes: &[Notification]) -> StoreResult<()> {
        self.state.lock().await.notifications.extend_from_slice(notes);
        Ok(())
    }

    async fn list_notifications(&self, user_id: Uuid, unread_only: bool) -> StoreResult<Vec<Notification>> {
        let state = self.state.lock().await;
        let mut notes: Vec<_> =
            state.notifications.iter().filter(|n| n.user_id == user_id && !(unread_only && n.is_read())).cloned().collect();
        notes.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(notes)
    }

    async fn mark_notification_read(&self, user_id: Uuid, id: Uuid, at: DateTime<Utc>) -> StoreResult<Option<Notification>> {
        let mut state = self.state.lock().await;
        Ok(state.notifications.iter_mut().find(|n| n.id == id && n.user_id == user_id).map(|n| {
            n.mark_read(at);
            n.clone()
        }))
    }
}
