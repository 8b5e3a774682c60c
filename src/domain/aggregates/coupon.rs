//! Coupon Aggregate

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

use crate::domain::value_objects::round_money;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscountKind { Fixed, Percentage }

impl DiscountKind {
    pub fn as_str(&self) -> &'static str {
        match self { Self::Fixed => "fixed", Self::Percentage => "percentage" }
    }
}

impl FromStr for DiscountKind {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fixed" => Ok(Self::Fixed),
            "percentage" => Ok(Self::Percentage),
            other => Err(format!("unknown discount type '{other}'")),
        }
    }
}

/// Discount for `amount` under a coupon of the given kind and value.
///
/// Never negative and never above `amount`.
pub fn discount_for(kind: DiscountKind, value: Decimal, amount: Decimal) -> Decimal {
    if amount <= Decimal::ZERO || value <= Decimal::ZERO {
        return Decimal::ZERO;
    }
    let raw = match kind {
        DiscountKind::Fixed => value,
        DiscountKind::Percentage => round_money(amount * value / Decimal::ONE_HUNDRED),
    };
    raw.min(amount)
}

/// Why a coupon could not be used.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum CouponRejection {
    #[error("coupon not found")]
    NotFound,
    #[error("coupon is not active")]
    Inactive,
    #[error("coupon is not valid yet")]
    NotYetStarted,
    #[error("coupon has expired")]
    Expired,
    #[error("coupon usage limit reached")]
    LimitReached,
    #[error("order is below the minimum amount of {minimum} for this coupon")]
    BelowMinimum { minimum: Decimal },
}

impl CouponRejection {
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound => "coupon_not_found",
            Self::Inactive => "coupon_inactive",
            Self::NotYetStarted => "coupon_not_started",
            Self::Expired => "coupon_expired",
            Self::LimitReached => "coupon_limit_reached",
            Self::BelowMinimum { .. } => "coupon_below_minimum",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Coupon {
    pub id: Uuid,
    pub code: String,
    pub kind: DiscountKind,
    pub value: Decimal,
    pub minimum_amount: Option<Decimal>,
    pub usage_limit: Option<i32>,
    pub used_count: i32,
    pub starts_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

/// Admin input for a new coupon.
#[derive(Clone, Debug, Deserialize)]
pub struct NewCoupon {
    pub code: String,
    pub kind: DiscountKind,
    pub value: Decimal,
    pub minimum_amount: Option<Decimal>,
    pub usage_limit: Option<i32>,
    pub starts_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CouponDefinitionError {
    #[error("coupon code must be 1 to 50 characters")]
    BadCode,
    #[error("coupon value must be positive")]
    NonPositiveValue,
    #[error("percentage coupons cannot exceed 100")]
    PercentageTooLarge,
    #[error("minimum amount cannot be negative")]
    NegativeMinimum,
    #[error("usage limit must be at least 1")]
    BadUsageLimit,
    #[error("coupon expires before it starts")]
    WindowInverted,
}

pub fn normalize_code(code: &str) -> String { code.trim().to_uppercase() }

impl Coupon {
    pub fn create(new: NewCoupon, now: DateTime<Utc>) -> Result<Self, CouponDefinitionError> {
        let code = normalize_code(&new.code);
        if code.is_empty() || code.chars().count() > 50 { return Err(CouponDefinitionError::BadCode); }
        if new.value <= Decimal::ZERO { return Err(CouponDefinitionError::NonPositiveValue); }
        if new.kind == DiscountKind::Percentage && new.value > Decimal::ONE_HUNDRED {
            return Err(CouponDefinitionError::PercentageTooLarge);
        }
        if new.minimum_amount.is_some_and(|m| m < Decimal::ZERO) { return Err(CouponDefinitionError::NegativeMinimum); }
        if new.usage_limit.is_some_and(|l| l < 1) { return Err(CouponDefinitionError::BadUsageLimit); }
        if let (Some(start), Some(end)) = (new.starts_at, new.expires_at) {
            if end < start { return Err(CouponDefinitionError::WindowInverted); }
        }
        Ok(Self {
            id: Uuid::now_v7(), code, kind: new.kind, value: new.value, minimum_amount: new.minimum_amount,
            usage_limit: new.usage_limit, used_count: 0, starts_at: new.starts_at, expires_at: new.expires_at,
            is_active: true, created_at: now,
        })
    }

    /// Run the eligibility checks in order; the first failure wins.
    pub fn check(&self, order_amount: Decimal, now: DateTime<Utc>) -> Result<(), CouponRejection> {
        if !self.is_active { return Err(CouponRejection::Inactive); }
        if self.starts_at.is_some_and(|s| s > now) { return Err(CouponRejection::NotYetStarted); }
        if self.expires_at.is_some_and(|e| e < now) { return Err(CouponRejection::Expired); }
        if self.is_exhausted() { return Err(CouponRejection::LimitReached); }
        if let Some(minimum) = self.minimum_amount {
            if order_amount < minimum { return Err(CouponRejection::BelowMinimum { minimum }); }
        }
        Ok(())
    }

    pub fn is_valid(&self, order_amount: Decimal, now: DateTime<Utc>) -> bool { self.check(order_amount, now).is_ok() }

    pub fn is_exhausted(&self) -> bool { self.usage_limit.is_some_and(|limit| self.used_count >= limit) }

    pub fn calculate_discount(&self, order_amount: Decimal, now: DateTime<Utc>) -> Decimal {
        if !self.is_valid(order_amount, now) { return Decimal::ZERO; }
        discount_for(self.kind, self.value, order_amount)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use proptest::prelude::*;
    use rust_decimal_macros::dec;

    fn summer10() -> Coupon {
        Coupon::create(NewCoupon {
            code: "summer10".into(), kind: DiscountKind::Percentage, value: dec!(10), minimum_amount: Some(dec!(50)),
            usage_limit: None, starts_at: None, expires_at: None,
        }, Utc::now()).unwrap()
    }

    #[test]
    fn test_percentage_discount_scenario() {
        let c = summer10();
        assert_eq!(c.code, "SUMMER10");
        let discount = c.calculate_discount(dec!(100.00), Utc::now());
        assert_eq!(discount, dec!(10.00));
        assert_eq!(dec!(100.00) - discount, dec!(90.00));
    }

    #[test]
    fn test_below_minimum_scenario() {
        let c = summer10();
        assert_eq!(c.check(dec!(40.00), Utc::now()), Err(CouponRejection::BelowMinimum { minimum: dec!(50) }));
        assert_eq!(c.calculate_discount(dec!(40.00), Utc::now()), Decimal::ZERO);
    }

    #[test]
    fn test_fixed_discount_is_capped() {
        assert_eq!(discount_for(DiscountKind::Fixed, dec!(30), dec!(20)), dec!(20));
        assert_eq!(discount_for(DiscountKind::Fixed, dec!(5), dec!(20)), dec!(5));
    }

    #[test]
    fn test_checks_run_in_order() {
        let now = Utc::now();
        let mut c = summer10();
        c.is_active = false;
        c.expires_at = Some(now - Duration::days(1));
        assert_eq!(c.check(dec!(10), now), Err(CouponRejection::Inactive));

        c.is_active = true;
        c.starts_at = Some(now + Duration::days(1));
        assert_eq!(c.check(dec!(10), now), Err(CouponRejection::NotYetStarted));

        c.starts_at = None;
        assert_eq!(c.check(dec!(10), now), Err(CouponRejection::Expired));

        c.expires_at = None;
        c.usage_limit = Some(2);
        c.used_count = 2;
        assert_eq!(c.check(dec!(10), now), Err(CouponRejection::LimitReached));

        c.used_count = 1;
        assert!(matches!(c.check(dec!(10), now), Err(CouponRejection::BelowMinimum { .. })));
        assert!(c.check(dec!(60), now).is_ok());
    }

    #[test]
    fn test_create_rejects_bad_definitions() {
        let base = NewCoupon {
            code: "X".into(), kind: DiscountKind::Percentage, value: dec!(150), minimum_amount: None,
            usage_limit: None, starts_at: None, expires_at: None,
        };
        assert_eq!(Coupon::create(base.clone(), Utc::now()), Err(CouponDefinitionError::PercentageTooLarge));
        assert_eq!(Coupon::create(NewCoupon { code: "  ".into(), ..base.clone() }, Utc::now()), Err(CouponDefinitionError::BadCode));
        assert_eq!(
            Coupon::create(NewCoupon { value: dec!(10), usage_limit: Some(0), ..base }, Utc::now()),
            Err(CouponDefinitionError::BadUsageLimit)
        );
    }

    fn any_coupon() -> impl Strategy<Value = (Coupon, Decimal)> {
        (
            prop_oneof![Just(DiscountKind::Fixed), Just(DiscountKind::Percentage)],
            0i64..20_000,
            proptest::option::of(0i64..50_000),
            proptest::option::of(0i32..5),
            0i32..6,
            any::<bool>(),
            0i64..100_000,
        )
            .prop_map(|(kind, value_cents, min_cents, limit, used, active, amount_cents)| {
                let value = match kind {
                    DiscountKind::Fixed => Decimal::new(value_cents, 2),
                    DiscountKind::Percentage => Decimal::new(value_cents % 10_001, 2),
                };
                let coupon = Coupon {
                    id: Uuid::nil(), code: "PROP".into(), kind, value,
                    minimum_amount: min_cents.map(|c| Decimal::new(c, 2)), usage_limit: limit, used_count: used,
                    starts_at: None, expires_at: None, is_active: active, created_at: Utc::now(),
                };
                (coupon, Decimal::new(amount_cents, 2))
            })
    }

    proptest! {
        #[test]
        fn discount_never_exceeds_amount((coupon, amount) in any_coupon()) {
            let now = Utc::now();
            let discount = coupon.calculate_discount(amount, now);
            prop_assert!(discount <= amount);
            prop_assert!(discount >= Decimal::ZERO);
            if !coupon.is_valid(amount, now) {
                prop_assert_eq!(discount, Decimal::ZERO);
            }
        }
    }
}
