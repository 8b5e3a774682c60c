//! Notification emitter.
//!
//! Turns domain events into inbox entries and live pushes. Delivery is
//! fire-and-forget: every failure here is logged and swallowed, never
//! returned to the operation that raised the events.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::domain::aggregates::{Notification, NotificationKind, OrderStatus};
use crate::domain::events::{DomainEvent, OrderEvent, PaymentEvent, ProductEvent};
use crate::store::CheckoutStore;
use crate::{CheckoutError, Result};

#[derive(Debug, Error)]
pub enum PushError {
    #[error("could not encode notification: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("publish failed: {0}")]
    Publish(String),
}

/// Live delivery channel for freshly stored notifications.
#[async_trait]
pub trait PushChannel: Send + Sync {
    async fn push(&self, note: &Notification) -> std::result::Result<(), PushError>;
}

/// Publishes to `notifications.user.<id>` on NATS.
pub struct NatsPush {
    client: async_nats::Client,
}

impl NatsPush {
    pub fn new(client: async_nats::Client) -> Self { Self { client } }

    pub fn subject_for(user_id: Uuid) -> String { format!("notifications.user.{user_id}") }
}

#[async_trait]
impl PushChannel for NatsPush {
    async fn push(&self, note: &Notification) -> std::result::Result<(), PushError> {
        let payload = serde_json::to_vec(note)?;
        self.client
            .publish(Self::subject_for(note.user_id), payload.into())
            .await
            .map_err(|e| PushError::Publish(e.to_string()))
    }
}

/// Used when no broker is configured.
pub struct NullPush;

#[async_trait]
impl PushChannel for NullPush {
    async fn push(&self, _note: &Notification) -> std::result::Result<(), PushError> { Ok(()) }
}

fn status_label(status: OrderStatus) -> &'static str {
    match status {
        OrderStatus::Panier => "panier",
        OrderStatus::EnAttente => "en attente de paiement",
        OrderStatus::Confirmee => "confirmée",
        OrderStatus::Expediee => "expédiée",
        OrderStatus::Livree => "livrée",
        OrderStatus::Annulee => "annulée",
    }
}

fn needs_admins(event: &DomainEvent) -> bool {
    matches!(event, DomainEvent::Order(OrderEvent::Placed { .. }) | DomainEvent::Product(ProductEvent::LowStock { .. }))
}

/// Notifications an event produces; `admins` receive shop-wide alerts.
pub fn notifications_for(event: &DomainEvent, admins: &[Uuid], now: DateTime<Utc>) -> Vec<Notification> {
    match event {
        DomainEvent::Order(OrderEvent::Placed { order_id, order_number, user_id, total, currency }) => {
            let data = json!({ "order_id": order_id, "order_number": order_number, "total": total.to_string(), "currency": currency });
            let mut notes = vec![Notification::new(
                *user_id,
                NotificationKind::OrderCreated,
                "Commande enregistrée",
                format!("Votre commande {order_number} de {total} {currency} a bien été enregistrée."),
                data.clone(),
                now,
            )];
            notes.extend(admins.iter().map(|admin| {
                Notification::new(
                    *admin,
                    NotificationKind::NewOrder,
                    "Nouvelle commande",
                    format!("Nouvelle commande {order_number} ({total} {currency})."),
                    data.clone(),
                    now,
                )
            }));
            notes
        }
        DomainEvent::Order(OrderEvent::StatusChanged { order_id, order_number, user_id, from, to }) => vec![Notification::new(
            *user_id,
            NotificationKind::OrderStatusChanged,
            "Suivi de commande",
            format!("Votre commande {order_number} est maintenant {}.", status_label(*to)),
            json!({ "order_id": order_id, "order_number": order_number, "from": from, "to": to }),
            now,
        )],
        DomainEvent::Order(OrderEvent::Cancelled { order_id, order_number, user_id, actor, reason }) => vec![Notification::new(
            *user_id,
            NotificationKind::OrderCancelled,
            "Commande annulée",
            match reason {
                Some(reason) => format!("Votre commande {order_number} a été annulée : {reason}"),
                None => format!("Votre commande {order_number} a été annulée."),
            },
            json!({ "order_id": order_id, "order_number": order_number, "actor": actor, "reason": reason }),
            now,
        )],
        DomainEvent::Order(OrderEvent::CouponApplied { .. }) => vec![],
        DomainEvent::Payment(PaymentEvent::Received { payment_id, order_id, order_number, user_id, amount, currency }) => {
            vec![Notification::new(
                *user_id,
                NotificationKind::PaymentReceived,
                "Paiement reçu",
                format!("Nous avons bien reçu votre paiement de {amount} {currency} pour la commande {order_number}."),
                json!({ "payment_id": payment_id, "order_id": order_id, "amount": amount.to_string(), "currency": currency }),
                now,
            )]
        }
        DomainEvent::Payment(PaymentEvent::Refunded { payment_id, order_id, user_id, amount, currency }) => vec![Notification::new(
            *user_id,
            NotificationKind::PaymentRefunded,
            "Remboursement effectué",
            format!("Un remboursement de {amount} {currency} a été effectué."),
            json!({ "payment_id": payment_id, "order_id": order_id, "amount": amount.to_string(), "currency": currency }),
            now,
        )],
        DomainEvent::Product(ProductEvent::LowStock { product_id, sku, name, stock, threshold }) => admins
            .iter()
            .map(|admin| {
                Notification::new(
                    *admin,
                    NotificationKind::LowStock,
                    "Stock faible",
                    format!("Le produit {name} ({sku}) n'a plus que {stock} unité(s) en stock."),
                    json!({ "product_id": product_id, "sku": sku, "stock": stock, "threshold": threshold }),
                    now,
                )
            })
            .collect(),
    }
}

#[derive(Clone)]
pub struct NotificationEmitter {
    store: Arc<dyn CheckoutStore>,
    push: Arc<dyn PushChannel>,
    push_timeout: Duration,
}

impl NotificationEmitter {
    pub fn new(store: Arc<dyn CheckoutStore>, push: Arc<dyn PushChannel>, push_timeout: Duration) -> Self {
        Self { store, push, push_timeout }
    }

    /// Persist and push notifications for committed events. Never fails.
    pub async fn emit(&self, events: Vec<DomainEvent>) {
        if events.is_empty() {
            return;
        }
        let admins = if events.iter().any(needs_admins) {
            self.store.admin_ids().await.unwrap_or_else(|e| {
                warn!(error = %e, "could not load admins, shop-wide notifications skipped");
                vec![]
            })
        } else {
            vec![]
        };
        let now = Utc::now();
        let notes: Vec<Notification> = events.iter().flat_map(|e| notifications_for(e, &admins, now)).collect();
        if notes.is_empty() {
            return;
        }
        if let Err(e) = self.store.insert_notifications(&notes).await {
            warn!(error = %e, count = notes.len(), "failed to store notifications");
        }
        for note in &notes {
            match tokio::time::timeout(self.push_timeout, self.push.push(note)).await {
                Ok(Ok(())) => debug!(notification_id = %note.id, kind = note.kind.as_str(), "notification pushed"),
                Ok(Err(e)) => warn!(notification_id = %note.id, error = %e, "notification push failed"),
                Err(_) => warn!(notification_id = %note.id, timeout_ms = self.push_timeout.as_millis() as u64, "notification push timed out"),
            }
        }
    }

    pub async fn list(&self, user_id: Uuid, unread_only: bool) -> Result<Vec<Notification>> {
        Ok(self.store.list_notifications(user_id, unread_only).await?)
    }

    pub async fn mark_read(&self, user_id: Uuid, id: Uuid) -> Result<Notification> {
        self.store.mark_notification_read(user_id, id, Utc::now()).await?.ok_or(CheckoutError::NotificationNotFound(id))
    }
}
