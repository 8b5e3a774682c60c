//! Shared HTTP transport for payment providers: one client with an explicit
//! timeout, error classification, and retry for idempotent calls only.

use reqwest::{RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::warn;

use super::ProviderError;
use crate::domain::aggregates::ProviderKind;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_attempts: 3, base_backoff: Duration::from_millis(200), max_backoff: Duration::from_secs(5) }
    }
}

impl RetryPolicy {
    pub fn none() -> Self { Self { max_attempts: 1, ..Self::default() } }

    /// Exponential backoff after the given (1-based) failed attempt.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_backoff.saturating_mul(factor).min(self.max_backoff)
    }
}

#[derive(Debug, Clone)]
pub struct ProviderHttpSettings {
    pub timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for ProviderHttpSettings {
    fn default() -> Self { Self { timeout: Duration::from_secs(15), retry: RetryPolicy::default() } }
}

#[derive(Clone)]
pub struct HttpTransport {
    provider: ProviderKind,
    client: reqwest::Client,
    retry: RetryPolicy,
}

impl HttpTransport {
    pub fn new(provider: ProviderKind, settings: &ProviderHttpSettings) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder()
            .timeout(settings.timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| ProviderError::Transport { provider, message: format!("client setup failed: {e}") })?;
        Ok(Self { provider, client, retry: settings.retry.clone() })
    }

    /// Send a request built by `build`, retrying transient failures when `idempotent`.
    pub async fn send<F>(&self, idempotent: bool, build: F) -> Result<Response, ProviderError>
    where
        F: Fn(&reqwest::Client) -> RequestBuilder,
    {
        let attempts = if idempotent { self.retry.max_attempts.max(1) } else { 1 };
        let mut attempt = 0;
        loop {
            attempt += 1;
            let err = match build(&self.client).send().await {
                Ok(resp) if resp.status().is_success() => return Ok(resp),
                Ok(resp) => self.api_error(resp).await,
                Err(e) => self.transport_error(e),
            };
            if attempt >= attempts || !err.is_retryable() {
                return Err(err);
            }
            let delay = self.retry.delay_for(attempt);
            warn!(provider = %self.provider, attempt, error = %err, delay_ms = delay.as_millis() as u64, "provider call failed, retrying");
            tokio::time::sleep(delay).await;
        }
    }

    pub async fn send_json<T, F>(&self, idempotent: bool, build: F) -> Result<T, ProviderError>
    where
        T: DeserializeOwned,
        F: Fn(&reqwest::Client) -> RequestBuilder,
    {
        let resp = self.send(idempotent, build).await?;
        let bytes = resp.bytes().await.map_err(|e| self.transport_error(e))?;
        serde_json::from_slice(&bytes).map_err(|e| ProviderError::Decode { provider: self.provider, message: e.to_string() })
    }

    fn transport_error(&self, e: reqwest::Error) -> ProviderError {
        if e.is_timeout() {
            ProviderError::Timeout { provider: self.provider }
        } else {
            ProviderError::Transport { provider: self.provider, message: e.to_string() }
        }
    }

    async fn api_error(&self, resp: Response) -> ProviderError {
        let status = resp.status();
        let body = resp.bytes().await.map(|b| b.to_vec()).unwrap_or_default();
        let (code, message) = extract_error(&body).unwrap_or_else(|| {
            (None, status.canonical_reason().unwrap_or("unexpected status").to_string())
        });
        if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
            return ProviderError::Auth { provider: self.provider, message };
        }
        ProviderError::Api { provider: self.provider, status: status.as_u16(), code, message }
    }
}

/// Pull `(code, message)` out of the error bodies both providers use:
/// `{"error": {"code", "message"}}`, `{"name", "message", "details": [{"issue"}]}`,
/// and OAuth's `{"error", "error_description"}`.
fn extract_error(body: &[u8]) -> Option<(Option<String>, String)> {
    let value: serde_json::Value = serde_json::from_slice(body).ok()?;
    if let Some(err) = value.get("error").filter(|e| e.is_object()) {
        let code = err.get("code").or_else(|| err.get("decline_code")).and_then(|c| c.as_str()).map(str::to_string);
        let message = err.get("message").and_then(|m| m.as_str()).unwrap_or("provider error").to_string();
        return Some((code, message));
    }
    if let Some(desc) = value.get("error_description").and_then(|d| d.as_str()) {
        let code = value.get("error").and_then(|c| c.as_str()).map(str::to_string);
        return Some((code, desc.to_string()));
    }
    let issue = value
        .get("details")
        .and_then(|d| d.as_array())
        .and_then(|d| d.first())
        .and_then(|d| d.get("issue"))
        .and_then(|i| i.as_str());
    let code = issue.or_else(|| value.get("name").and_then(|n| n.as_str())).map(str::to_string);
    let message = value.get("message").and_then(|m| m.as_str())?.to_string();
    Some((code, message))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = RetryPolicy { max_attempts: 5, base_backoff: Duration::from_millis(100), max_backoff: Duration::from_millis(300) };
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(300));
        assert_eq!(policy.delay_for(10), Duration::from_millis(300));
    }

    #[test]
    fn test_extracts_card_provider_error() {
        let body = br#"{"error": {"code": "card_declined", "message": "Your card was declined."}}"#;
        assert_eq!(extract_error(body), Some((Some("card_declined".into()), "Your card was declined.".into())));
    }

    #[test]
    fn test_extracts_wallet_error_issue() {
        let body = br#"{"name": "UNPROCESSABLE_ENTITY", "message": "The requested action could not be performed.", "details": [{"issue": "ORDER_ALREADY_CAPTURED"}]}"#;
        let (code, _) = extract_error(body).unwrap();
        assert_eq!(code.as_deref(), Some("ORDER_ALREADY_CAPTURED"));
    }

    #[test]
    fn test_extracts_oauth_error() {
        let body = br#"{"error": "invalid_client", "error_description": "Client Authentication failed"}"#;
        assert_eq!(extract_error(body), Some((Some("invalid_client".into()), "Client Authentication failed".into())));
    }
}
