//! Payment orchestrator
//!
//! Drives a provider-side intent through creation, confirmation and refunds,
//! and keeps the order in step. Provider state (`IntentState`) and order
//! status evolve separately; only a confirmed capture moves the order.

use chrono::Utc;
use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use super::notifications::NotificationEmitter;
use crate::config::CheckoutSettings;
use crate::domain::aggregates::{IntentState, OrderError, OrderStatus, Payment, PaymentIntent, ProviderKind};
use crate::domain::events::{DomainEvent, PaymentEvent};
use crate::domain::value_objects::Money;
use crate::providers::{IntentRequest, PaymentProvider, ProviderRegistry};
use crate::store::CheckoutStore;
use crate::{CheckoutError, Result};

/// Where a confirmation attempt left the payment.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ConfirmOutcome {
    Paid { payment: Payment },
    /// Provider has not settled yet; confirm again later.
    Pending { state: IntentState },
}

#[derive(Clone)]
pub struct PaymentOrchestrator {
    store: Arc<dyn CheckoutStore>,
    providers: ProviderRegistry,
    notifier: NotificationEmitter,
    settings: CheckoutSettings,
}

impl PaymentOrchestrator {
    pub fn new(store: Arc<dyn CheckoutStore>, providers: ProviderRegistry, notifier: NotificationEmitter, settings: CheckoutSettings) -> Self {
        Self { store, providers, notifier, settings }
    }

    fn provider(&self, kind: ProviderKind) -> Result<Arc<dyn PaymentProvider>> {
        self.providers.get(kind).ok_or(CheckoutError::ProviderNotConfigured(kind))
    }

    /// Open (or reuse) a provider intent for the order's current total.
    ///
    /// A cart is submitted first. An open intent for the same provider and
    /// amount is returned as is; any other open intent is abandoned.
    #[instrument(skip_all, fields(order_id = %order_id, provider = %kind))]
    pub async fn create_intent(&self, order_id: Uuid, kind: ProviderKind) -> Result<PaymentIntent> {
        let provider = self.provider(kind)?;
        let mut order = self.store.load_order(order_id).await?.ok_or(CheckoutError::OrderNotFound(order_id))?;
        let was_cart = order.status() == OrderStatus::Panier;
        order.begin_checkout(Utc::now())?;
        if was_cart {
            let events = order.take_events();
            self.store.save_order(&order).await?;
            info!(order_number = %order.number(), total = %order.total(), "checkout submitted");
            self.notifier.emit(events).await;
        }

        let amount = order.total().clone();
        let existing = self.store.intents_for_order(order_id).await?;
        if let Some(open) = existing.iter().rev().find(|i| i.reusable_for(kind, &amount)) {
            info!(intent_id = %open.id, "reusing open payment intent");
            return Ok(open.clone());
        }
        for stale in existing.iter().filter(|i| i.is_open()) {
            self.abandon(stale.clone()).await;
        }

        let request = IntentRequest {
            order_id,
            order_number: order.number().to_string(),
            amount: amount.clone(),
            description: format!("Commande {}", order.number()),
            idempotency_key: IntentRequest::idempotency_key_for(order_id, &amount, existing.len()),
        };
        let created = provider.create_intent(&request).await?;
        let now = Utc::now();
        let intent = PaymentIntent {
            id: Uuid::now_v7(),
            order_id,
            provider: kind,
            provider_ref: created.provider_ref,
            amount: amount.amount(),
            currency: amount.currency().to_string(),
            state: created.state,
            client_secret: created.client_secret,
            approval_url: created.approval_url,
            created_at: now,
            updated_at: now,
        };
        self.store.save_intent(&intent).await?;
        info!(intent_id = %intent.id, provider_ref = %intent.provider_ref, amount = %amount, "payment intent created");
        Ok(intent)
    }

    async fn abandon(&self, mut intent: PaymentIntent) {
        if let Some(provider) = self.providers.get(intent.provider) {
            if let Err(e) = provider.cancel(&intent.provider_ref).await {
                warn!(intent_id = %intent.id, error = %e, "could not cancel superseded intent at provider");
            }
        }
        intent.state = IntentState::Canceled;
        intent.updated_at = Utc::now();
        if let Err(e) = self.store.save_intent(&intent).await {
            warn!(intent_id = %intent.id, error = %e, "could not mark superseded intent canceled");
        }
    }

    /// Ask the provider where the intent stands and record a successful capture.
    #[instrument(skip_all, fields(order_id = %order_id, intent_id = %intent_id))]
    pub async fn confirm(&self, order_id: Uuid, intent_id: Uuid) -> Result<ConfirmOutcome> {
        let mut intent = self
            .store
            .find_intent(intent_id)
            .await?
            .filter(|i| i.order_id == order_id)
            .ok_or(CheckoutError::IntentNotFound(intent_id))?;
        if let Some(payment) = self.store.find_payment_by_intent(intent.id).await? {
            return Ok(ConfirmOutcome::Paid { payment });
        }
        let provider = self.provider(intent.provider)?;
        let mut order = self.store.load_order(order_id).await?.ok_or(CheckoutError::OrderNotFound(order_id))?;
        if order.status() != OrderStatus::EnAttente {
            return Err(OrderError::NotPayable(order.status()).into());
        }

        let capture = provider.confirm(&intent.provider_ref).await?;
        let now = Utc::now();
        match capture.state {
            IntentState::Succeeded => {}
            IntentState::Failed | IntentState::Canceled => {
                let reason = capture.failure_reason.unwrap_or_else(|| format!("intent {}", capture.state.as_str()));
                intent.state = IntentState::Failed;
                intent.updated_at = now;
                self.store.save_intent(&intent).await?;
                warn!(provider_ref = %intent.provider_ref, reason = %reason, "payment declined");
                return Err(CheckoutError::PaymentDeclined(reason));
            }
            pending => {
                if intent.state != pending {
                    intent.state = pending;
                    intent.updated_at = now;
                    self.store.save_intent(&intent).await?;
                }
                return Ok(ConfirmOutcome::Pending { state: pending });
            }
        }

        intent.state = IntentState::Succeeded;
        intent.updated_at = now;
        let captured = capture.amount.unwrap_or_else(|| Money::new(intent.amount, &intent.currency));
        if captured.currency() != order.currency() || captured.amount() < order.total().amount() {
            self.store.save_intent(&intent).await?;
            error!(captured = %captured, expected = %order.total(), "captured amount does not cover the order");
            return Err(CheckoutError::AmountMismatch { captured, expected: order.total().clone() });
        }

        let reference = capture.capture_ref.unwrap_or_else(|| intent.provider_ref.clone());
        let payment = Payment::captured(&intent, order.user_id(), reference, captured, capture.metadata, now);
        order.confirm_payment()?;
        let mut events = order.take_events();
        let record = self.store.record_capture(&payment, &intent, &order).await?;
        if !record.newly_recorded {
            return Ok(ConfirmOutcome::Paid { payment: record.payment });
        }
        info!(payment_id = %record.payment.id, reference = %record.payment.reference, amount = %record.payment.amount, "payment recorded");

        events.push(DomainEvent::Payment(PaymentEvent::Received {
            payment_id: payment.id,
            order_id,
            order_number: order.number().clone(),
            user_id: order.user_id(),
            amount: payment.amount,
            currency: payment.currency.clone(),
        }));
        let threshold = self.settings.low_stock_threshold;
        for level in &record.stock {
            let ordered = order.lines().iter().find(|l| l.product_id == level.product_id).map_or(0, |l| l.quantity);
            if i64::from(level.previous) < i64::from(ordered) {
                warn!(product_id = %level.product_id, sku = %level.sku, available = level.previous, ordered, "stock oversold");
            }
            events.extend(level.low_stock_event(threshold));
        }
        self.notifier.emit(events).await;
        Ok(ConfirmOutcome::Paid { payment: record.payment })
    }

    /// Refund part or all of a payment; `None` refunds the remaining balance.
    #[instrument(skip_all, fields(payment_id = %payment_id))]
    pub async fn refund(&self, payment_id: Uuid, amount: Option<Decimal>) -> Result<Payment> {
        let payment = self.store.find_payment(payment_id).await?.ok_or(CheckoutError::PaymentNotFound(payment_id))?;
        let amount = amount.unwrap_or_else(|| payment.refundable());
        payment.ensure_refundable(amount)?;
        let provider = self.provider(payment.provider)?;

        let key = format!("refund-{}-{}-{}", payment.id, payment.refunded_amount, amount);
        let refund = provider.refund(&payment.reference, &Money::new(amount, &payment.currency), &key).await?;
        let record = match self.store.record_refund(payment.id, &refund.refund_ref, amount, Utc::now()).await {
            Ok(record) => record,
            Err(e) => {
                error!(refund_ref = %refund.refund_ref, amount = %amount, error = %e, "provider refunded but the refund was not recorded");
                return Err(e.into());
            }
        };
        let payment = record.payment;
        if !record.newly_recorded {
            info!(refund_ref = %refund.refund_ref, "refund already recorded");
            return Ok(payment);
        }
        info!(
            refund_ref = %refund.refund_ref,
            amount = %amount,
            remaining = %payment.refundable(),
            coupon_released = record.released_coupon.is_some(),
            "payment refunded"
        );

        self.notifier
            .emit(vec![DomainEvent::Payment(PaymentEvent::Refunded {
                payment_id: payment.id,
                order_id: payment.order_id,
                user_id: payment.user_id,
                amount,
                currency: payment.currency.clone(),
            })])
            .await;
        Ok(payment)
    }
}
