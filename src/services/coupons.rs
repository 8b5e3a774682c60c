//! Coupon engine

use chrono::Utc;
use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, instrument};
use uuid::Uuid;

use super::notifications::NotificationEmitter;
use crate::domain::aggregates::coupon::normalize_code;
use crate::domain::aggregates::{AppliedCoupon, Coupon, CouponRejection, NewCoupon, Order, OrderError};
use crate::store::{CheckoutStore, ClaimOutcome, StoreError};
use crate::{CheckoutError, Result};

/// A coupon that passed every check for a given amount.
#[derive(Debug, Clone, Serialize)]
pub struct CouponQuote {
    pub coupon: Coupon,
    pub discount: Decimal,
}

#[derive(Clone)]
pub struct CouponEngine {
    store: Arc<dyn CheckoutStore>,
    notifier: NotificationEmitter,
}

impl CouponEngine {
    pub fn new(store: Arc<dyn CheckoutStore>, notifier: NotificationEmitter) -> Self { Self { store, notifier } }

    pub async fn validate(&self, code: &str, order_amount: Decimal) -> Result<CouponQuote> {
        let coupon = self.store.find_coupon_by_code(&normalize_code(code)).await?.ok_or(CouponRejection::NotFound)?;
        let now = Utc::now();
        coupon.check(order_amount, now)?;
        let discount = coupon.calculate_discount(order_amount, now);
        Ok(CouponQuote { coupon, discount })
    }

    /// Apply a coupon to an open order, claiming one use of it.
    #[instrument(skip_all, fields(order_id = %order_id, code = %code))]
    pub async fn apply(&self, order_id: Uuid, code: &str) -> Result<Order> {
        let mut order = self.store.load_order(order_id).await?.ok_or(CheckoutError::OrderNotFound(order_id))?;
        if order.coupon().is_some() {
            return Err(OrderError::CouponAlreadyApplied.into());
        }
        let quote = self.validate(code, order.subtotal().amount()).await?;
        let coupon = quote.coupon;
        order.apply_coupon(AppliedCoupon {
            coupon_id: coupon.id,
            code: coupon.code.clone(),
            kind: coupon.kind,
            value: coupon.value,
            minimum_amount: coupon.minimum_amount,
        })?;
        let events = order.take_events();
        match self.store.claim_coupon(coupon.id, &order).await? {
            ClaimOutcome::Claimed => {}
            ClaimOutcome::LimitReached => return Err(CouponRejection::LimitReached.into()),
            ClaimOutcome::AlreadyApplied => return Err(OrderError::CouponAlreadyApplied.into()),
        }
        info!(code = %coupon.code, discount = %order.discount().amount(), total = %order.total().amount(), "coupon applied");
        self.notifier.emit(events).await;
        Ok(order)
    }

    pub async fn release(&self, coupon_id: Uuid) -> Result<()> {
        self.store.release_coupon(coupon_id).await?;
        Ok(())
    }

    pub async fn create(&self, new: NewCoupon) -> Result<Coupon> {
        let coupon = Coupon::create(new, Utc::now())?;
        match self.store.insert_coupon(&coupon).await {
            Ok(()) => {
                info!(code = %coupon.code, kind = coupon.kind.as_str(), value = %coupon.value, "coupon created");
                Ok(coupon)
            }
            Err(StoreError::Duplicate(_)) => Err(CheckoutError::DuplicateCoupon(coupon.code)),
            Err(e) => Err(e.into()),
        }
    }
}
