//! Order Aggregate
//!
//! A cart is an order in `panier` status. Lines snapshot the product price at
//! the time they are added; totals are recomputed from lines and any applied
//! coupon on every change.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

use crate::domain::aggregates::coupon::{discount_for, DiscountKind};
use crate::domain::aggregates::product::Product;
use crate::domain::events::{DomainEvent, OrderEvent};
use crate::domain::value_objects::{Money, OrderNumber, Quantity, QuantityError};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus { Panier, EnAttente, Confirmee, Expediee, Livree, Annulee }

impl OrderStatus {
    pub const ALL: [OrderStatus; 6] = [Self::Panier, Self::EnAttente, Self::Confirmee, Self::Expediee, Self::Livree, Self::Annulee];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Panier => "panier",
            Self::EnAttente => "en_attente",
            Self::Confirmee => "confirmee",
            Self::Expediee => "expediee",
            Self::Livree => "livree",
            Self::Annulee => "annulee",
        }
    }

    pub fn is_cancellable(&self) -> bool { matches!(self, Self::EnAttente | Self::Confirmee) }

    pub fn can_transition_to(&self, to: OrderStatus) -> bool {
        use OrderStatus::*;
        matches!(
            (*self, to),
            (Panier, EnAttente) | (EnAttente, Confirmee) | (Confirmee, Expediee) | (Expediee, Livree)
                | (EnAttente, Annulee) | (Confirmee, Annulee)
        )
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

impl FromStr for OrderStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL.into_iter().find(|st| st.as_str() == s).ok_or_else(|| format!("unknown order status '{s}'"))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelActor { Client, Admin }

impl CancelActor {
    pub fn as_str(&self) -> &'static str { match self { Self::Client => "client", Self::Admin => "admin" } }
}

impl FromStr for CancelActor {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s { "client" => Ok(Self::Client), "admin" => Ok(Self::Admin), other => Err(format!("unknown actor '{other}'")) }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LineItem {
    pub product_id: Uuid,
    pub sku: String,
    pub name: String,
    pub quantity: u32,
    pub unit_price: Decimal,
    pub line_total: Decimal,
}

impl LineItem {
    fn snapshot(product: &Product, quantity: Quantity) -> Self {
        let unit = product.price().amount();
        Self {
            product_id: product.id(), sku: product.sku().to_string(), name: product.name().to_string(),
            quantity: quantity.value(), unit_price: unit, line_total: unit * Decimal::from(quantity.value()),
        }
    }
}

/// Coupon terms frozen onto the order when applied.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AppliedCoupon {
    pub coupon_id: Uuid,
    pub code: String,
    pub kind: DiscountKind,
    pub value: Decimal,
    pub minimum_amount: Option<Decimal>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Cancellation {
    pub actor: CancelActor,
    pub reason: Option<String>,
    pub cancelled_at: DateTime<Utc>,
}

/// What a cancellation leaves for the caller to undo.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CancelEffects {
    pub release_coupon: Option<Uuid>,
    pub restock: Vec<(Uuid, u32)>,
}

/// Everything needed to rebuild an order from storage.
#[derive(Clone, Debug)]
pub struct OrderParts {
    pub id: Uuid,
    pub number: OrderNumber,
    pub user_id: Uuid,
    pub status: OrderStatus,
    pub currency: String,
    pub lines: Vec<LineItem>,
    pub coupon: Option<AppliedCoupon>,
    pub discount: Decimal,
    pub cancellation: Option<Cancellation>,
    pub created_at: DateTime<Utc>,
    pub placed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    pub version: i64,
}

#[derive(Clone, Debug)]
pub struct Order {
    id: Uuid,
    number: OrderNumber,
    user_id: Uuid,
    status: OrderStatus,
    lines: Vec<LineItem>,
    subtotal: Money,
    discount: Money,
    total: Money,
    coupon: Option<AppliedCoupon>,
    cancellation: Option<Cancellation>,
    created_at: DateTime<Utc>,
    placed_at: Option<DateTime<Utc>>,
    updated_at: DateTime<Utc>,
    /// Store revision this copy was loaded at; 0 until first saved.
    version: i64,
    events: Vec<DomainEvent>,
}

impl Order {
    pub fn open_cart(user_id: Uuid, currency: &str, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::now_v7(), number: OrderNumber::generate(now), user_id, status: OrderStatus::Panier,
            lines: vec![], subtotal: Money::zero(currency), discount: Money::zero(currency), total: Money::zero(currency),
            coupon: None, cancellation: None, created_at: now, placed_at: None, updated_at: now, version: 0, events: vec![],
        }
    }

    pub fn from_parts(parts: OrderParts) -> Self {
        let currency = parts.currency.clone();
        let updated_at = parts.updated_at;
        let mut order = Self {
            id: parts.id, number: parts.number, user_id: parts.user_id, status: parts.status, lines: parts.lines,
            subtotal: Money::zero(&currency), discount: Money::new(parts.discount, &currency), total: Money::zero(&currency),
            coupon: parts.coupon, cancellation: parts.cancellation, created_at: parts.created_at,
            placed_at: parts.placed_at, updated_at: parts.updated_at, version: parts.version, events: vec![],
        };
        order.recalculate_totals();
        order.updated_at = updated_at;
        order
    }

    pub fn to_parts(&self) -> OrderParts {
        OrderParts {
            id: self.id, number: self.number.clone(), user_id: self.user_id, status: self.status,
            currency: self.currency().to_string(), lines: self.lines.clone(), coupon: self.coupon.clone(),
            discount: self.discount.amount(), cancellation: self.cancellation.clone(), created_at: self.created_at,
            placed_at: self.placed_at, updated_at: self.updated_at, version: self.version,
        }
    }

    pub fn id(&self) -> Uuid { self.id }
    pub fn number(&self) -> &OrderNumber { &self.number }
    pub fn user_id(&self) -> Uuid { self.user_id }
    pub fn status(&self) -> OrderStatus { self.status }
    pub fn currency(&self) -> &str { self.total.currency() }
    pub fn lines(&self) -> &[LineItem] { &self.lines }
    pub fn subtotal(&self) -> &Money { &self.subtotal }
    pub fn discount(&self) -> &Money { &self.discount }
    pub fn total(&self) -> &Money { &self.total }
    pub fn coupon(&self) -> Option<&AppliedCoupon> { self.coupon.as_ref() }
    pub fn cancellation(&self) -> Option<&Cancellation> { self.cancellation.as_ref() }
    pub fn created_at(&self) -> DateTime<Utc> { self.created_at }
    pub fn placed_at(&self) -> Option<DateTime<Utc>> { self.placed_at }
    pub fn updated_at(&self) -> DateTime<Utc> { self.updated_at }
    pub fn version(&self) -> i64 { self.version }

    /// Draw another number for a cart that was never stored.
    pub fn renumber(&mut self, now: DateTime<Utc>) {
        if self.version == 0 { self.number = OrderNumber::generate(now); }
    }

    pub fn add_line(&mut self, product: &Product, quantity: Quantity) -> Result<(), OrderError> {
        self.ensure_cart()?;
        if product.price().currency() != self.currency() {
            return Err(OrderError::CurrencyMismatch { expected: self.currency().to_string(), got: product.price().currency().to_string() });
        }
        if let Some(existing) = self.lines.iter_mut().find(|l| l.product_id == product.id()) {
            let merged = Quantity::new(existing.quantity)?.add(quantity)?;
            existing.quantity = merged.value();
            existing.line_total = existing.unit_price * Decimal::from(merged.value());
        } else {
            self.lines.push(LineItem::snapshot(product, quantity));
        }
        self.recalculate_totals();
        Ok(())
    }

    /// Set a line's quantity; zero removes the line.
    pub fn set_line_quantity(&mut self, product_id: Uuid, quantity: u32) -> Result<(), OrderError> {
        self.ensure_cart()?;
        if quantity == 0 { return self.remove_line(product_id); }
        let quantity = Quantity::new(quantity)?;
        let index = self.line_index(product_id)?;
        let line_total = self.lines[index].unit_price * Decimal::from(quantity.value());
        self.ensure_coupon_minimum(self.subtotal.amount() - self.lines[index].line_total + line_total)?;
        let line = &mut self.lines[index];
        line.quantity = quantity.value();
        line.line_total = line_total;
        self.recalculate_totals();
        Ok(())
    }

    pub fn remove_line(&mut self, product_id: Uuid) -> Result<(), OrderError> {
        self.ensure_cart()?;
        let index = self.line_index(product_id)?;
        self.ensure_coupon_minimum(self.subtotal.amount() - self.lines[index].line_total)?;
        self.lines.remove(index);
        self.recalculate_totals();
        Ok(())
    }

    fn line_index(&self, product_id: Uuid) -> Result<usize, OrderError> {
        self.lines.iter().position(|l| l.product_id == product_id).ok_or(OrderError::LineNotFound(product_id))
    }

    /// An applied coupon keeps holding only while the subtotal meets its minimum.
    fn ensure_coupon_minimum(&self, subtotal: Decimal) -> Result<(), OrderError> {
        match &self.coupon {
            Some(c) => match c.minimum_amount {
                Some(minimum) if subtotal < minimum => Err(OrderError::BelowCouponMinimum { code: c.code.clone(), minimum }),
                _ => Ok(()),
            },
            None => Ok(()),
        }
    }

    /// Enter payment: a cart is submitted, a pending order is left as is.
    pub fn begin_checkout(&mut self, now: DateTime<Utc>) -> Result<(), OrderError> {
        match self.status {
            OrderStatus::Panier | OrderStatus::EnAttente => {}
            other => return Err(OrderError::NotPayable(other)),
        }
        if self.lines.is_empty() { return Err(OrderError::EmptyOrder); }
        if self.total.is_zero() { return Err(OrderError::NothingToPay); }
        if self.status == OrderStatus::Panier { self.submit(now)?; }
        Ok(())
    }

    /// Checkout submitted: `panier -> en_attente`.
    pub fn submit(&mut self, now: DateTime<Utc>) -> Result<(), OrderError> {
        if self.lines.is_empty() { return Err(OrderError::EmptyOrder); }
        self.transition(OrderStatus::EnAttente)?;
        self.placed_at = Some(now);
        self.raise_event(DomainEvent::Order(OrderEvent::Placed {
            order_id: self.id, order_number: self.number.clone(), user_id: self.user_id,
            total: self.total.amount(), currency: self.currency().to_string(),
        }));
        Ok(())
    }

    pub fn apply_coupon(&mut self, coupon: AppliedCoupon) -> Result<Decimal, OrderError> {
        if !matches!(self.status, OrderStatus::Panier | OrderStatus::EnAttente) {
            return Err(OrderError::CouponNotApplicable(self.status));
        }
        if self.coupon.is_some() { return Err(OrderError::CouponAlreadyApplied); }
        let code = coupon.code.clone();
        self.coupon = Some(coupon);
        self.recalculate_totals();
        let discount = self.discount.amount();
        self.raise_event(DomainEvent::Order(OrderEvent::CouponApplied { order_id: self.id, code, discount }));
        Ok(discount)
    }

    pub fn confirm_payment(&mut self) -> Result<(), OrderError> { self.advance(OrderStatus::Confirmee) }
    pub fn ship(&mut self) -> Result<(), OrderError> { self.advance(OrderStatus::Expediee) }
    pub fn deliver(&mut self) -> Result<(), OrderError> { self.advance(OrderStatus::Livree) }

    pub fn can_cancel(&self) -> bool { self.status.is_cancellable() }

    pub fn cancel(&mut self, actor: CancelActor, reason: Option<String>, now: DateTime<Utc>) -> Result<CancelEffects, OrderError> {
        if !self.can_cancel() { return Err(OrderError::NotCancellable(self.status)); }
        let restock = if self.status == OrderStatus::Confirmee {
            self.lines.iter().map(|l| (l.product_id, l.quantity)).collect()
        } else {
            vec![]
        };
        self.status = OrderStatus::Annulee;
        self.cancellation = Some(Cancellation { actor, reason: reason.clone(), cancelled_at: now });
        self.touch();
        self.raise_event(DomainEvent::Order(OrderEvent::Cancelled {
            order_id: self.id, order_number: self.number.clone(), user_id: self.user_id, actor, reason,
        }));
        Ok(CancelEffects { release_coupon: self.coupon.as_ref().map(|c| c.coupon_id), restock })
    }

    fn advance(&mut self, to: OrderStatus) -> Result<(), OrderError> {
        let from = self.status;
        self.transition(to)?;
        self.raise_event(DomainEvent::Order(OrderEvent::StatusChanged {
            order_id: self.id, order_number: self.number.clone(), user_id: self.user_id, from, to,
        }));
        Ok(())
    }

    fn transition(&mut self, to: OrderStatus) -> Result<(), OrderError> {
        if !self.status.can_transition_to(to) { return Err(OrderError::InvalidTransition { from: self.status, to }); }
        self.status = to;
        self.touch();
        Ok(())
    }

    fn ensure_cart(&self) -> Result<(), OrderError> {
        if self.status != OrderStatus::Panier { return Err(OrderError::NotInCart(self.status)); }
        Ok(())
    }

    fn recalculate_totals(&mut self) {
        let currency = self.total.currency().to_string();
        let subtotal: Decimal = self.lines.iter().map(|l| l.line_total).sum();
        self.subtotal = Money::new(subtotal, &currency);
        let discount = match &self.coupon {
            Some(c) => discount_for(c.kind, c.value, self.subtotal.amount()),
            None => self.discount.amount().min(self.subtotal.amount()),
        };
        self.discount = Money::new(discount, &currency);
        self.total = Money::new((self.subtotal.amount() - discount).max(Decimal::ZERO), &currency);
        self.touch();
    }

    pub fn take_events(&mut self) -> Vec<DomainEvent> { std::mem::take(&mut self.events) }
    fn raise_event(&mut self, e: DomainEvent) { self.events.push(e); }
    fn touch(&mut self) { self.updated_at = Utc::now(); }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OrderError {
    #[error("order lines can only change while the order is a cart (status {0})")]
    NotInCart(OrderStatus),
    #[error("order has no items")]
    EmptyOrder,
    #[error("no line for product {0}")]
    LineNotFound(Uuid),
    #[error("cannot move order from {from} to {to}")]
    InvalidTransition { from: OrderStatus, to: OrderStatus },
    #[error("order in status {0} cannot be cancelled")]
    NotCancellable(OrderStatus),
    #[error("order in status {0} is not awaiting payment")]
    NotPayable(OrderStatus),
    #[error("order total is zero, nothing to pay")]
    NothingToPay,
    #[error("a coupon is already applied to this order")]
    CouponAlreadyApplied,
    #[error("coupons cannot be applied to an order in status {0}")]
    CouponNotApplicable(OrderStatus),
    #[error("coupon {code} requires a subtotal of at least {minimum}")]
    BelowCouponMinimum { code: String, minimum: Decimal },
    #[error("currency mismatch: order is {expected}, product is {got}")]
    CurrencyMismatch { expected: String, got: String },
    #[error(transparent)]
    Quantity(#[from] QuantityError),
}
