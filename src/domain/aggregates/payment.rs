//! Payment and payment-intent records

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

use crate::domain::value_objects::Money;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind { Stripe, Paypal }

impl ProviderKind {
    pub fn as_str(&self) -> &'static str { match self { Self::Stripe => "stripe", Self::Paypal => "paypal" } }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

impl FromStr for ProviderKind {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s { "stripe" => Ok(Self::Stripe), "paypal" => Ok(Self::Paypal), other => Err(format!("unknown provider '{other}'")) }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus { EnAttente, Paye, Echec, Rembourse }

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self { Self::EnAttente => "en_attente", Self::Paye => "paye", Self::Echec => "echec", Self::Rembourse => "rembourse" }
    }
}

impl FromStr for PaymentStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "en_attente" => Ok(Self::EnAttente),
            "paye" => Ok(Self::Paye),
            "echec" => Ok(Self::Echec),
            "rembourse" => Ok(Self::Rembourse),
            other => Err(format!("unknown payment status '{other}'")),
        }
    }
}

/// Provider-side charge attempt state, independent of the order status.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentState { RequiresPaymentMethod, Processing, Succeeded, Failed, Canceled }

impl IntentState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RequiresPaymentMethod => "requires_payment_method",
            Self::Processing => "processing",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        }
    }

    pub fn is_open(&self) -> bool { matches!(self, Self::RequiresPaymentMethod | Self::Processing) }
}

impl FromStr for IntentState {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        [Self::RequiresPaymentMethod, Self::Processing, Self::Succeeded, Self::Failed, Self::Canceled]
            .into_iter()
            .find(|st| st.as_str() == s)
            .ok_or_else(|| format!("unknown intent state '{s}'"))
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PaymentIntent {
    pub id: Uuid,
    pub order_id: Uuid,
    pub provider: ProviderKind,
    pub provider_ref: String,
    pub amount: Decimal,
    pub currency: String,
    pub state: IntentState,
    pub client_secret: Option<String>,
    pub approval_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PaymentIntent {
    pub fn is_open(&self) -> bool { self.state.is_open() }

    /// An open intent can be reused when it charges exactly `amount`.
    pub fn reusable_for(&self, provider: ProviderKind, amount: &Money) -> bool {
        self.is_open() && self.provider == provider && self.amount == amount.amount() && self.currency == amount.currency()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Payment {
    pub id: Uuid,
    pub reference: String,
    pub order_id: Uuid,
    pub user_id: Uuid,
    pub intent_id: Uuid,
    pub provider: ProviderKind,
    pub amount: Decimal,
    pub currency: String,
    pub refunded_amount: Decimal,
    pub status: PaymentStatus,
    pub metadata: serde_json::Value,
    pub paid_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Payment {
    pub fn captured(intent: &PaymentIntent, user_id: Uuid, reference: String, amount: Money, metadata: serde_json::Value, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::now_v7(), reference, order_id: intent.order_id, user_id, intent_id: intent.id, provider: intent.provider,
            amount: amount.amount(), currency: amount.currency().to_string(), refunded_amount: Decimal::ZERO,
            status: PaymentStatus::Paye, metadata, paid_at: now, updated_at: now,
        }
    }

    pub fn refundable(&self) -> Decimal { (self.amount - self.refunded_amount).max(Decimal::ZERO) }
    pub fn is_fully_refunded(&self) -> bool { self.refundable().is_zero() }

    pub fn has_refund(&self, refund_id: &str) -> bool {
        self.metadata["refunds"].as_array().is_some_and(|list| list.iter().any(|r| r["id"] == refund_id))
    }

    pub fn ensure_refundable(&self, amount: Decimal) -> Result<(), PaymentError> {
        if !matches!(self.status, PaymentStatus::Paye | PaymentStatus::Rembourse) {
            return Err(PaymentError::NotRefundable(self.status));
        }
        if amount <= Decimal::ZERO { return Err(PaymentError::NonPositiveRefund); }
        if amount > self.refundable() { return Err(PaymentError::ExceedsBalance { requested: amount, available: self.refundable() }); }
        Ok(())
    }

    /// Record a provider-confirmed refund; the reference and the row are kept.
    pub fn apply_refund(&mut self, refund_id: &str, amount: Decimal, now: DateTime<Utc>) -> Result<(), PaymentError> {
        self.ensure_refundable(amount)?;
        self.refunded_amount += amount;
        self.status = PaymentStatus::Rembourse;
        self.updated_at = now;
        let entry = json!({ "id": refund_id, "amount": amount.to_string(), "refunded_at": now.to_rfc3339() });
        if !self.metadata.is_object() {
            self.metadata = json!({});
        }
        if let Some(map) = self.metadata.as_object_mut() {
            let refunds = map.entry("refunds").or_insert_with(|| json!([]));
            if let Some(list) = refunds.as_array_mut() {
                list.push(entry);
            } else {
                *refunds = json!([entry]);
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PaymentError {
    #[error("payment in status {} cannot be refunded", .0.as_str())]
    NotRefundable(PaymentStatus),
    #[error("refund amount must be positive")]
    NonPositiveRefund,
    #[error("refund of {requested} exceeds the refundable balance of {available}")]
    ExceedsBalance { requested: Decimal, available: Decimal },
}
