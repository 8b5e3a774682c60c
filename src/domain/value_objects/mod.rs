//! Value objects for the checkout workflow

use chrono::{DateTime, Utc};
use rand::Rng;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Currencies whose smallest unit is the major unit (no cents).
const ZERO_DECIMAL_CURRENCIES: &[&str] = &[
    "BIF", "CLP", "DJF", "GNF", "JPY", "KMF", "KRW", "MGA", "PYG", "RWF", "UGX", "VND", "VUV", "XAF", "XOF", "XPF",
];

pub fn is_zero_decimal_currency(currency: &str) -> bool {
    ZERO_DECIMAL_CURRENCIES.contains(&currency.to_ascii_uppercase().as_str())
}

/// Round a monetary amount to cents, half away from zero.
pub fn round_money(amount: Decimal) -> Decimal {
    amount.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

/// Money value object
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Money { amount: Decimal, currency: String }

impl Money {
    pub fn new(amount: Decimal, currency: &str) -> Self { Self { amount: round_money(amount), currency: currency.to_ascii_uppercase() } }
    pub fn eur(amount: Decimal) -> Self { Self::new(amount, "EUR") }
    pub fn zero(currency: &str) -> Self { Self::new(Decimal::ZERO, currency) }
    pub fn amount(&self) -> Decimal { self.amount }
    pub fn currency(&self) -> &str { &self.currency }
    pub fn is_zero(&self) -> bool { self.amount.is_zero() }

    /// Amount expressed in the provider's smallest currency unit (2550 for 25.50 EUR).
    pub fn to_minor_units(&self) -> Result<i64, MoneyError> {
        if self.amount.is_sign_negative() { return Err(MoneyError::Negative(self.amount)); }
        let scaled = if is_zero_decimal_currency(&self.currency) { self.amount } else { self.amount * Decimal::ONE_HUNDRED };
        scaled.round().to_i64().ok_or(MoneyError::Overflow(self.amount))
    }

    pub fn from_minor_units(units: i64, currency: &str) -> Money {
        let scale = if is_zero_decimal_currency(currency) { 0 } else { 2 };
        Money::new(Decimal::new(units, scale), currency)
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "{} {}", self.amount, self.currency) }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MoneyError {
    #[error("negative amount {0}")]
    Negative(Decimal),
    #[error("amount {0} does not fit in minor units")]
    Overflow(Decimal),
}

/// Human-readable order number, e.g. `CMD-20261019-004213`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OrderNumber(String);

impl OrderNumber {
    pub fn generate(at: DateTime<Utc>) -> Self {
        let suffix: u32 = rand::thread_rng().gen_range(0..1_000_000);
        Self(format!("CMD-{}-{:06}", at.format("%Y%m%d"), suffix))
    }
    pub fn as_str(&self) -> &str { &self.0 }
}

impl From<String> for OrderNumber {
    fn from(value: String) -> Self { Self(value) }
}

impl fmt::Display for OrderNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "{}", self.0) }
}

/// Line quantity, 1..=999
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quantity(u32);

impl Quantity {
    pub const MAX: u32 = 999;

    pub fn new(value: u32) -> Result<Self, QuantityError> {
        if value == 0 { return Err(QuantityError::Zero); }
        if value > Self::MAX { return Err(QuantityError::TooLarge(value)); }
        Ok(Self(value))
    }
    pub fn value(&self) -> u32 { self.0 }
    pub fn add(&self, other: Quantity) -> Result<Self, QuantityError> { Self::new(self.0.saturating_add(other.0)) }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QuantityError {
    #[error("quantity must be at least 1")]
    Zero,
    #[error("quantity {0} exceeds the maximum of 999")]
    TooLarge(u32),
}
