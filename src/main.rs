//! Boutique checkout - order, coupon and payment service

use anyhow::Result;
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use boutique_checkout::providers::{PaypalClient, ProviderRegistry, StripeClient};
use boutique_checkout::services::{NatsPush, NullPush, PushChannel};
use boutique_checkout::store::PgStore;
use boutique_checkout::{api, AppConfig, Storefront};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = AppConfig::from_env()?;
    let db = PgPoolOptions::new().max_connections(10).connect(&config.database_url).await?;
    sqlx::migrate!("./migrations").run(&db).await?;

    let mut providers = ProviderRegistry::new();
    if let Some(stripe) = config.stripe.clone() {
        providers = providers.register(Arc::new(StripeClient::new(stripe, &config.provider_http)?));
    }
    if let Some(paypal) = config.paypal.clone() {
        providers = providers.register(Arc::new(PaypalClient::new(paypal, &config.provider_http)?));
    }
    if providers.configured().is_empty() {
        tracing::warn!("no payment provider configured; payment intents will be refused");
    }

    let push: Arc<dyn PushChannel> = match &config.nats_url {
        Some(url) => match async_nats::connect(url.as_str()).await {
            Ok(client) => Arc::new(NatsPush::new(client)),
            Err(e) => {
                tracing::warn!(error = %e, "NATS unavailable, live notifications disabled");
                Arc::new(NullPush)
            }
        },
        None => Arc::new(NullPush),
    };

    let storefront = Storefront::new(Arc::new(PgStore::new(db)), providers.clone(), push, config.checkout.clone());
    let app = api::router(storefront).layer(TraceLayer::new_for_http()).layer(CorsLayer::permissive());

    let configured: Vec<&str> = providers.configured().iter().map(|k| k.as_str()).collect();
    tracing::info!(port = config.port, providers = ?configured, currency = %config.checkout.currency, "boutique checkout listening");
    axum::serve(tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.port)).await?, app).await?;
    Ok(())
}
