//! Runtime configuration, read from the environment (after `.env` via dotenvy).

use std::time::Duration;
use thiserror::Error;

use crate::providers::{paypal, stripe, PaypalSettings, ProviderHttpSettings, RetryPolicy, StripeSettings};

/// Shop parameters the checkout workflow needs at construction.
#[derive(Debug, Clone)]
pub struct CheckoutSettings {
    pub currency: String,
    /// Admins are notified when stock drops below this level.
    pub low_stock_threshold: i32,
    pub push_timeout: Duration,
}

impl Default for CheckoutSettings {
    fn default() -> Self { Self { currency: "EUR".into(), low_stock_threshold: 5, push_timeout: Duration::from_secs(2) } }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub nats_url: Option<String>,
    pub port: u16,
    pub checkout: CheckoutSettings,
    pub provider_http: ProviderHttpSettings,
    pub stripe: Option<StripeSettings>,
    pub paypal: Option<PaypalSettings>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required setting {0}")]
    Missing(&'static str),
    #[error("invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> { Self::from_lookup(|key| std::env::var(key).ok()) }

    /// Build from any key lookup; empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let database_url = get("DATABASE_URL").ok_or(ConfigError::Missing("DATABASE_URL"))?;
        let port = parse_or(get("PORT"), "PORT", 8083u16)?;
        let currency = get("STORE_CURRENCY").unwrap_or_else(|| "EUR".into()).to_ascii_uppercase();
        if currency.len() != 3 || !currency.chars().all(|c| c.is_ascii_alphabetic()) {
            return Err(ConfigError::Invalid { key: "STORE_CURRENCY", reason: format!("'{currency}' is not an ISO 4217 code") });
        }
        let low_stock_threshold = parse_or(get("LOW_STOCK_THRESHOLD"), "LOW_STOCK_THRESHOLD", 5i32)?;
        let timeout_secs = parse_or(get("PROVIDER_TIMEOUT_SECS"), "PROVIDER_TIMEOUT_SECS", 15u64)?;
        if timeout_secs == 0 {
            return Err(ConfigError::Invalid { key: "PROVIDER_TIMEOUT_SECS", reason: "must be at least 1".into() });
        }
        let max_attempts = parse_or(get("PROVIDER_MAX_ATTEMPTS"), "PROVIDER_MAX_ATTEMPTS", 3u32)?.max(1);

        let stripe = get("STRIPE_SECRET_KEY").map(|secret_key| StripeSettings {
            secret_key,
            api_base: get("STRIPE_API_BASE").unwrap_or_else(|| stripe::DEFAULT_API_BASE.into()),
        });

        let paypal = match (get("PAYPAL_CLIENT_ID"), get("PAYPAL_CLIENT_SECRET")) {
            (Some(client_id), Some(client_secret)) => Some(PaypalSettings {
                client_id,
                client_secret,
                api_base: get("PAYPAL_API_BASE").unwrap_or_else(|| paypal::DEFAULT_API_BASE.into()),
                return_url: get("PAYPAL_RETURN_URL").ok_or(ConfigError::Missing("PAYPAL_RETURN_URL"))?,
                cancel_url: get("PAYPAL_CANCEL_URL").ok_or(ConfigError::Missing("PAYPAL_CANCEL_URL"))?,
            }),
            (None, None) => None,
            (Some(_), None) => return Err(ConfigError::Missing("PAYPAL_CLIENT_SECRET")),
            (None, Some(_)) => return Err(ConfigError::Missing("PAYPAL_CLIENT_ID")),
        };

        Ok(Self {
            database_url,
            nats_url: get("NATS_URL"),
            port,
            checkout: CheckoutSettings { currency, low_stock_threshold, ..CheckoutSettings::default() },
            provider_http: ProviderHttpSettings {
                timeout: Duration::from_secs(timeout_secs),
                retry: RetryPolicy { max_attempts, ..RetryPolicy::default() },
            },
            stripe,
            paypal,
        })
    }
}

fn parse_or<T: std::str::FromStr>(raw: Option<String>, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match raw {
        None => Ok(default),
        Some(v) => v.parse().map_err(|e: T::Err| ConfigError::Invalid { key, reason: format!("'{v}': {e}") }),
    }
}
