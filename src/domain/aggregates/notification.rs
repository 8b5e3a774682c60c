//! Notification Aggregate

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind { OrderCreated, NewOrder, OrderStatusChanged, OrderCancelled, PaymentReceived, PaymentRefunded, LowStock }

impl NotificationKind {
    const ALL: [NotificationKind; 7] = [
        Self::OrderCreated, Self::NewOrder, Self::OrderStatusChanged, Self::OrderCancelled,
        Self::PaymentReceived, Self::PaymentRefunded, Self::LowStock,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OrderCreated => "order_created",
            Self::NewOrder => "new_order",
            Self::OrderStatusChanged => "order_status_changed",
            Self::OrderCancelled => "order_cancelled",
            Self::PaymentReceived => "payment_received",
            Self::PaymentRefunded => "payment_refunded",
            Self::LowStock => "low_stock",
        }
    }
}

impl FromStr for NotificationKind {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL.into_iter().find(|k| k.as_str() == s).ok_or_else(|| format!("unknown notification type '{s}'"))
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub id: Uuid,
    pub user_id: Uuid,
    pub kind: NotificationKind,
    pub title: String,
    pub message: String,
    pub data: serde_json::Value,
    pub read_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Notification {
    pub fn new(user_id: Uuid, kind: NotificationKind, title: impl Into<String>, message: impl Into<String>, data: serde_json::Value, now: DateTime<Utc>) -> Self {
        Self { id: Uuid::now_v7(), user_id, kind, title: title.into(), message: message.into(), data, read_at: None, created_at: now }
    }

    pub fn is_read(&self) -> bool { self.read_at.is_some() }

    /// Keeps the first read timestamp.
    pub fn mark_read(&mut self, now: DateTime<Utc>) {
        if self.read_at.is_none() { self.read_at = Some(now); }
    }
}
