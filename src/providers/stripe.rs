//! Card processor client (Stripe-compatible payment-intent API).
//!
//! Amounts travel in minor units; requests are form-encoded and authenticated
//! with the secret key as a bearer token.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, instrument};

use super::{HttpTransport, IntentRequest, PaymentProvider, ProviderCapture, ProviderError, ProviderHttpSettings, ProviderIntent, ProviderRefund};
use crate::domain::aggregates::{IntentState, ProviderKind};
use crate::domain::value_objects::Money;

pub const DEFAULT_API_BASE: &str = "https://api.stripe.com";

#[derive(Debug, Clone)]
pub struct StripeSettings {
    pub secret_key: String,
    pub api_base: String,
}

#[derive(Clone)]
pub struct StripeClient {
    http: HttpTransport,
    settings: StripeSettings,
}

#[derive(Debug, Deserialize)]
struct StripeIntent {
    id: String,
    status: String,
    #[serde(default)]
    client_secret: Option<String>,
    amount: i64,
    #[serde(default)]
    amount_received: Option<i64>,
    currency: String,
    #[serde(default)]
    latest_charge: Option<String>,
    #[serde(default)]
    last_payment_error: Option<StripeLastError>,
}

#[derive(Debug, Deserialize)]
struct StripeLastError {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    code: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StripeRefund {
    id: String,
    amount: i64,
    currency: String,
    status: String,
}

impl StripeIntent {
    fn state(&self) -> IntentState {
        match self.status.as_str() {
            "succeeded" => IntentState::Succeeded,
            "processing" | "requires_capture" => IntentState::Processing,
            "canceled" => IntentState::Canceled,
            // a declined attempt sends the intent back to requires_payment_method with the error attached
            "requires_payment_method" if self.last_payment_error.is_some() => IntentState::Failed,
            _ => IntentState::RequiresPaymentMethod,
        }
    }
}

impl StripeClient {
    pub fn new(settings: StripeSettings, http: &ProviderHttpSettings) -> Result<Self, ProviderError> {
        Ok(Self { http: HttpTransport::new(ProviderKind::Stripe, http)?, settings })
    }

    fn url(&self, path: &str) -> String { format!("{}{}", self.settings.api_base.trim_end_matches('/'), path) }
}

/// Form fields for a new payment intent.
pub(crate) fn intent_form(request: &IntentRequest) -> Result<Vec<(String, String)>, ProviderError> {
    let minor = request.amount.to_minor_units().map_err(|e| ProviderError::Decode { provider: ProviderKind::Stripe, message: e.to_string() })?;
    Ok(vec![
        ("amount".into(), minor.to_string()),
        ("currency".into(), request.amount.currency().to_ascii_lowercase()),
        ("description".into(), request.description.clone()),
        ("metadata[order_id]".into(), request.order_id.to_string()),
        ("metadata[order_number]".into(), request.order_number.clone()),
        ("automatic_payment_methods[enabled]".into(), "true".into()),
    ])
}

#[async_trait]
impl PaymentProvider for StripeClient {
    fn kind(&self) -> ProviderKind { ProviderKind::Stripe }

    #[instrument(name = "stripe_create_intent", skip(self, request), fields(order_id = %request.order_id))]
    async fn create_intent(&self, request: &IntentRequest) -> Result<ProviderIntent, ProviderError> {
        let form = intent_form(request)?;
        let url = self.url("/v1/payment_intents");
        let intent: StripeIntent = self
            .http
            .send_json(true, |c| {
                c.post(&url)
                    .bearer_auth(&self.settings.secret_key)
                    .header("Idempotency-Key", &request.idempotency_key)
                    .form(&form)
            })
            .await?;
        debug!(intent_id = %intent.id, status = %intent.status, "payment intent created");
        Ok(ProviderIntent { state: intent.state(), provider_ref: intent.id, client_secret: intent.client_secret, approval_url: None })
    }

    #[instrument(name = "stripe_retrieve_intent", skip(self))]
    async fn confirm(&self, provider_ref: &str) -> Result<ProviderCapture, ProviderError> {
        let url = self.url(&format!("/v1/payment_intents/{provider_ref}"));
        let intent: StripeIntent = self.http.send_json(true, |c| c.get(&url).bearer_auth(&self.settings.secret_key)).await?;
        let state = intent.state();
        let currency = intent.currency.to_ascii_uppercase();
        Ok(match state {
            IntentState::Succeeded => {
                let received = intent.amount_received.unwrap_or(intent.amount);
                ProviderCapture {
                    state,
                    capture_ref: Some(intent.latest_charge.clone().unwrap_or_else(|| intent.id.clone())),
                    amount: Some(Money::from_minor_units(received, &currency)),
                    failure_reason: None,
                    metadata: json!({
                        "intent_id": intent.id,
                        "charge_id": intent.latest_charge,
                        "currency": currency,
                        "amount_minor": received,
                    }),
                }
            }
            IntentState::Failed => {
                let err = intent.last_payment_error.as_ref();
                let reason = err.and_then(|e| e.message.clone()).or_else(|| err.and_then(|e| e.code.clone()));
                ProviderCapture::failed(reason.unwrap_or_else(|| "payment failed".into()))
            }
            IntentState::Canceled => ProviderCapture::failed("payment intent was canceled"),
            other => ProviderCapture::pending(other),
        })
    }

    #[instrument(name = "stripe_cancel_intent", skip(self))]
    async fn cancel(&self, provider_ref: &str) -> Result<(), ProviderError> {
        let url = self.url(&format!("/v1/payment_intents/{provider_ref}/cancel"));
        let key = format!("cancel-{provider_ref}");
        let _: StripeIntent = self
            .http
            .send_json(true, |c| {
                c.post(&url)
                    .bearer_auth(&self.settings.secret_key)
                    .header("Idempotency-Key", &key)
                    .form(&[("cancellation_reason", "abandoned")])
            })
            .await?;
        Ok(())
    }

    #[instrument(name = "stripe_refund", skip(self, amount), fields(value = %amount))]
    async fn refund(&self, capture_ref: &str, amount: &Money, idempotency_key: &str) -> Result<ProviderRefund, ProviderError> {
        let minor = amount.to_minor_units().map_err(|e| ProviderError::Decode { provider: ProviderKind::Stripe, message: e.to_string() })?;
        let target = if capture_ref.starts_with("pi_") { "payment_intent" } else { "charge" };
        let form = vec![(target.to_string(), capture_ref.to_string()), ("amount".to_string(), minor.to_string())];
        let url = self.url("/v1/refunds");
        let refund: StripeRefund = self
            .http
            .send_json(true, |c| {
                c.post(&url)
                    .bearer_auth(&self.settings.secret_key)
                    .header("Idempotency-Key", idempotency_key)
                    .form(&form)
            })
            .await?;
        Ok(ProviderRefund {
            amount: Money::from_minor_units(refund.amount, &refund.currency.to_ascii_uppercase()),
            refund_ref: refund.id,
            status: refund.status,
        })
    }
}
