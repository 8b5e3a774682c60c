//! Wallet client (PayPal-compatible orders API).
//!
//! The payer approves the order on the wallet's site; `confirm` then captures
//! it. Amounts travel as decimal strings. Access tokens come from the OAuth2
//! client-credentials grant and are cached until shortly before expiry.

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::json;
use std::str::FromStr;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, instrument, warn};

use super::{HttpTransport, IntentRequest, PaymentProvider, ProviderCapture, ProviderError, ProviderHttpSettings, ProviderIntent, ProviderRefund};
use crate::domain::aggregates::{IntentState, ProviderKind};
use crate::domain::value_objects::{is_zero_decimal_currency, Money};

pub const DEFAULT_API_BASE: &str = "https://api-m.sandbox.paypal.com";
const TOKEN_SAFETY_MARGIN: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct PaypalSettings {
    pub client_id: String,
    pub client_secret: String,
    pub api_base: String,
    pub return_url: String,
    pub cancel_url: String,
}

struct CachedToken {
    value: String,
    expires_at: Instant,
}

pub struct PaypalClient {
    http: HttpTransport,
    settings: PaypalSettings,
    token: Mutex<Option<CachedToken>>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

#[derive(Debug, Deserialize)]
struct Link {
    href: String,
    rel: String,
}

#[derive(Debug, Deserialize)]
struct WalletAmount {
    currency_code: String,
    value: String,
}

#[derive(Debug, Deserialize)]
struct WalletCapture {
    id: String,
    status: String,
    #[serde(default)]
    amount: Option<WalletAmount>,
}

#[derive(Debug, Default, Deserialize)]
struct WalletPayments {
    #[serde(default)]
    captures: Vec<WalletCapture>,
}

#[derive(Debug, Deserialize)]
struct PurchaseUnit {
    #[serde(default)]
    payments: Option<WalletPayments>,
}

#[derive(Debug, Deserialize)]
struct WalletOrder {
    id: String,
    status: String,
    #[serde(default)]
    links: Vec<Link>,
    #[serde(default)]
    purchase_units: Vec<PurchaseUnit>,
}

#[derive(Debug, Deserialize)]
struct WalletRefund {
    id: String,
    status: String,
    #[serde(default)]
    amount: Option<WalletAmount>,
}

/// Decimal string with the currency's number of decimals ("25.50", "1500").
pub(crate) fn wallet_value(amount: &Money) -> String {
    let mut value = amount.amount();
    value.rescale(if is_zero_decimal_currency(amount.currency()) { 0 } else { 2 });
    value.to_string()
}

fn order_state(status: &str) -> IntentState {
    match status {
        "COMPLETED" => IntentState::Succeeded,
        "APPROVED" => IntentState::Processing,
        "VOIDED" => IntentState::Canceled,
        _ => IntentState::RequiresPaymentMethod,
    }
}

impl WalletOrder {
    fn first_capture(&self) -> Option<&WalletCapture> {
        self.purchase_units.iter().filter_map(|u| u.payments.as_ref()).flat_map(|p| p.captures.iter()).next()
    }

    fn into_capture(self) -> Result<ProviderCapture, ProviderError> {
        let Some(capture) = self.first_capture() else {
            return Ok(ProviderCapture::pending(order_state(&self.status)));
        };
        let state = match capture.status.as_str() {
            "COMPLETED" => IntentState::Succeeded,
            "PENDING" => IntentState::Processing,
            "DECLINED" | "FAILED" => return Ok(ProviderCapture::failed(format!("capture {}", capture.status.to_lowercase()))),
            _ => order_state(&self.status),
        };
        let amount = capture.amount.as_ref().map(parse_amount).transpose()?;
        Ok(ProviderCapture {
            state,
            capture_ref: Some(capture.id.clone()),
            metadata: json!({
                "order_id": self.id,
                "capture_id": capture.id,
                "currency": amount.as_ref().map(|m| m.currency().to_string()),
            }),
            amount,
            failure_reason: None,
        })
    }
}

fn parse_amount(amount: &WalletAmount) -> Result<Money, ProviderError> {
    let value = Decimal::from_str(&amount.value)
        .map_err(|e| ProviderError::Decode { provider: ProviderKind::Paypal, message: format!("bad amount '{}': {e}", amount.value) })?;
    Ok(Money::new(value, &amount.currency_code))
}

impl PaypalClient {
    pub fn new(settings: PaypalSettings, http: &ProviderHttpSettings) -> Result<Self, ProviderError> {
        Ok(Self { http: HttpTransport::new(ProviderKind::Paypal, http)?, settings, token: Mutex::new(None) })
    }

    fn url(&self, path: &str) -> String { format!("{}{}", self.settings.api_base.trim_end_matches('/'), path) }

    async fn access_token(&self) -> Result<String, ProviderError> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref() {
            if token.expires_at > Instant::now() {
                return Ok(token.value.clone());
            }
        }
        let url = self.url("/v1/oauth2/token");
        let fresh: TokenResponse = self
            .http
            .send_json(true, |c| {
                c.post(&url)
                    .basic_auth(&self.settings.client_id, Some(&self.settings.client_secret))
                    .form(&[("grant_type", "client_credentials")])
            })
            .await?;
        let lifetime = Duration::from_secs(fresh.expires_in).saturating_sub(TOKEN_SAFETY_MARGIN);
        *cached = Some(CachedToken { value: fresh.access_token.clone(), expires_at: Instant::now() + lifetime });
        Ok(fresh.access_token)
    }

    async fn fetch_order(&self, order_ref: &str, token: &str) -> Result<WalletOrder, ProviderError> {
        let url = self.url(&format!("/v2/checkout/orders/{order_ref}"));
        self.http.send_json(true, |c| c.get(&url).bearer_auth(token)).await
    }
}

#[async_trait]
impl PaymentProvider for PaypalClient {
    fn kind(&self) -> ProviderKind { ProviderKind::Paypal }

    #[instrument(name = "paypal_create_order", skip(self, request), fields(order_id = %request.order_id))]
    async fn create_intent(&self, request: &IntentRequest) -> Result<ProviderIntent, ProviderError> {
        let token = self.access_token().await?;
        let body = json!({
            "intent": "CAPTURE",
            "purchase_units": [{
                "reference_id": request.order_id.to_string(),
                "invoice_id": request.order_number,
                "description": request.description,
                "amount": { "currency_code": request.amount.currency(), "value": wallet_value(&request.amount) },
            }],
            "application_context": {
                "return_url": self.settings.return_url,
                "cancel_url": self.settings.cancel_url,
                "user_action": "PAY_NOW",
            },
        });
        let url = self.url("/v2/checkout/orders");
        let order: WalletOrder = self
            .http
            .send_json(true, |c| {
                c.post(&url).bearer_auth(&token).header("PayPal-Request-Id", &request.idempotency_key).json(&body)
            })
            .await?;
        let approval_url = order.links.iter().find(|l| l.rel == "approve" || l.rel == "payer-action").map(|l| l.href.clone());
        debug!(wallet_order = %order.id, status = %order.status, "wallet order created");
        Ok(ProviderIntent { state: order_state(&order.status), provider_ref: order.id, client_secret: None, approval_url })
    }

    #[instrument(name = "paypal_capture_order", skip(self))]
    async fn confirm(&self, provider_ref: &str) -> Result<ProviderCapture, ProviderError> {
        let token = self.access_token().await?;
        let url = self.url(&format!("/v2/checkout/orders/{provider_ref}/capture"));
        let request_id = format!("capture-{provider_ref}");
        let captured: Result<WalletOrder, ProviderError> = self
            .http
            .send_json(true, |c| c.post(&url).bearer_auth(&token).header("PayPal-Request-Id", &request_id).json(&json!({})))
            .await;
        match captured {
            Ok(order) => order.into_capture(),
            Err(err) => match err.api_code() {
                Some("ORDER_ALREADY_CAPTURED") => self.fetch_order(provider_ref, &token).await?.into_capture(),
                Some("ORDER_NOT_APPROVED") => Ok(ProviderCapture::pending(IntentState::RequiresPaymentMethod)),
                Some("INSTRUMENT_DECLINED") => Ok(ProviderCapture::failed("payment instrument declined")),
                _ => Err(err),
            },
        }
    }

    async fn cancel(&self, provider_ref: &str) -> Result<(), ProviderError> {
        // wallet orders that are never captured expire on the provider side
        warn!(wallet_order = %provider_ref, "wallet order abandoned locally; nothing to cancel remotely");
        Ok(())
    }

    #[instrument(name = "paypal_refund_capture", skip(self, amount), fields(value = %amount))]
    async fn refund(&self, capture_ref: &str, amount: &Money, idempotency_key: &str) -> Result<ProviderRefund, ProviderError> {
        let token = self.access_token().await?;
        let url = self.url(&format!("/v2/payments/captures/{capture_ref}/refund"));
        let body = json!({ "amount": { "value": wallet_value(amount), "currency_code": amount.currency() } });
        let refund: WalletRefund = self
            .http
            .send_json(true, |c| c.post(&url).bearer_auth(&token).header("PayPal-Request-Id", idempotency_key).json(&body))
            .await?;
        let refunded = match refund.amount.as_ref() {
            Some(a) => parse_amount(a)?,
            None => amount.clone(),
        };
        Ok(ProviderRefund { refund_ref: refund.id, amount: refunded, status: refund.status })
    }
}
