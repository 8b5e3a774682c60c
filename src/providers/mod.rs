//! Payment provider clients.
//!
//! Two providers sit behind [`PaymentProvider`]: a card processor speaking a
//! payment-intent API and a redirect-based wallet speaking an orders/capture
//! API. Neither has a simulated fallback; a provider without credentials is
//! simply not registered.

pub mod http;
pub mod paypal;
pub mod stripe;

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

use crate::domain::aggregates::{IntentState, ProviderKind};
use crate::domain::value_objects::Money;

pub use http::{HttpTransport, ProviderHttpSettings, RetryPolicy};
pub use paypal::{PaypalClient, PaypalSettings};
pub use stripe::{StripeClient, StripeSettings};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProviderError {
    #[error("{provider} did not answer in time")]
    Timeout { provider: ProviderKind },
    #[error("{provider} could not be reached: {message}")]
    Transport { provider: ProviderKind, message: String },
    #[error("{provider} rejected our credentials: {message}")]
    Auth { provider: ProviderKind, message: String },
    #[error("{provider} returned {status}: {message}")]
    Api { provider: ProviderKind, status: u16, code: Option<String>, message: String },
    #[error("{provider} sent an unexpected response: {message}")]
    Decode { provider: ProviderKind, message: String },
}

impl ProviderError {
    pub fn provider(&self) -> ProviderKind {
        match self {
            Self::Timeout { provider }
            | Self::Transport { provider, .. }
            | Self::Auth { provider, .. }
            | Self::Api { provider, .. }
            | Self::Decode { provider, .. } => *provider,
        }
    }

    /// Whether the same call may succeed if tried again later.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout { .. } | Self::Transport { .. } => true,
            Self::Api { status, .. } => *status >= 500 || *status == 429,
            Self::Auth { .. } | Self::Decode { .. } => false,
        }
    }

    pub fn api_code(&self) -> Option<&str> {
        match self {
            Self::Api { code, .. } => code.as_deref(),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct IntentRequest {
    pub order_id: Uuid,
    pub order_number: String,
    pub amount: Money,
    pub description: String,
    /// Same key for the same order, amount and attempt, so retries never create a second charge.
    pub idempotency_key: String,
}

impl IntentRequest {
    /// `attempt` counts the intents already created for the order.
    pub fn idempotency_key_for(order_id: Uuid, amount: &Money, attempt: usize) -> String {
        format!("order-{order_id}-{}-{}-{attempt}", amount.currency(), amount.amount())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProviderIntent {
    pub provider_ref: String,
    pub state: IntentState,
    pub client_secret: Option<String>,
    pub approval_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProviderCapture {
    pub state: IntentState,
    /// Reference later used for refunds
    pub capture_ref: Option<String>,
    pub amount: Option<Money>,
    pub failure_reason: Option<String>,
    pub metadata: serde_json::Value,
}

impl ProviderCapture {
    pub fn pending(state: IntentState) -> Self {
        Self { state, capture_ref: None, amount: None, failure_reason: None, metadata: serde_json::Value::Null }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self { failure_reason: Some(reason.into()), ..Self::pending(IntentState::Failed) }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProviderRefund {
    pub refund_ref: String,
    pub amount: Money,
    pub status: String,
}

#[async_trait]
pub trait PaymentProvider: Send + Sync {
    fn kind(&self) -> ProviderKind;

    async fn create_intent(&self, request: &IntentRequest) -> Result<ProviderIntent, ProviderError>;

    /// Retrieve (card) or capture (wallet) the intent and report where it stands.
    async fn confirm(&self, provider_ref: &str) -> Result<ProviderCapture, ProviderError>;

    async fn cancel(&self, provider_ref: &str) -> Result<(), ProviderError>;

    async fn refund(&self, capture_ref: &str, amount: &Money, idempotency_key: &str) -> Result<ProviderRefund, ProviderError>;
}

#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: HashMap<ProviderKind, Arc<dyn PaymentProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self { Self::default() }

    pub fn register(mut self, provider: Arc<dyn PaymentProvider>) -> Self {
        self.providers.insert(provider.kind(), provider);
        self
    }

    pub fn get(&self, kind: ProviderKind) -> Option<Arc<dyn PaymentProvider>> { self.providers.get(&kind).cloned() }

    pub fn configured(&self) -> Vec<ProviderKind> {
        let mut kinds: Vec<_> = self.providers.keys().copied().collect();
        kinds.sort_by_key(|k| k.as_str());
        kinds
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_retryable_classification() {
        let p = ProviderKind::Stripe;
        assert!(ProviderError::Timeout { provider: p }.is_retryable());
        assert!(ProviderError::Api { provider: p, status: 503, code: None, message: String::new() }.is_retryable());
        assert!(ProviderError::Api { provider: p, status: 429, code: None, message: String::new() }.is_retryable());
        assert!(!ProviderError::Api { provider: p, status: 402, code: None, message: String::new() }.is_retryable());
        assert!(!ProviderError::Auth { provider: p, message: String::new() }.is_retryable());
    }

    #[test]
    fn test_idempotency_key_tracks_amount() {
        let id = Uuid::now_v7();
        let a = IntentRequest::idempotency_key_for(id, &Money::eur(dec!(25.50)), 0);
        let b = IntentRequest::idempotency_key_for(id, &Money::eur(dec!(25.50)), 0);
        let c = IntentRequest::idempotency_key_for(id, &Money::eur(dec!(20.00)), 0);
        let d = IntentRequest::idempotency_key_for(id, &Money::eur(dec!(25.50)), 1);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
    }
}
