//! creator-server
//!
//! Axum server for creator monetization: credit spends, hosted checkout,
//! Stripe webhooks and creator status reads.

mod handlers;
mod routes;
mod state;

use std::sync::Arc;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use creator_payments::{
    PaymentsConfig, StripeAccountLookup, StripeApiClient, StripeCheckoutGateway, WebhookVerifier,
};

use crate::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,tower_http=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load environment
    dotenvy::dotenv().ok();

    // Initialize payments
    let state = match PaymentsConfig::from_env() {
        Ok(config) => {
            let client = StripeApiClient::new(config.stripe_secret_key.clone());
            tracing::info!(
                platform_fee_bps = config.platform_fee_bps,
                public_base_url = %config.public_base_url,
                "✓ Stripe configured"
            );
            AppState::in_memory(config.platform_fee_bps).with_stripe(
                Arc::new(StripeCheckoutGateway::new(client.clone())),
                Arc::new(StripeAccountLookup::new(client, config.checkout_timeout)),
                WebhookVerifier::new(config.stripe_webhook_secret, config.webhook_tolerance),
                config.public_base_url,
                config.checkout_timeout,
            )
        }
        Err(e) => {
            tracing::warn!(error = %e, "⚠ Stripe not configured - checkout and webhooks disabled");
            tracing::warn!("  Set STRIPE_SECRET_KEY and STRIPE_WEBHOOK_SECRET in .env");
            AppState::in_memory(PaymentsConfig::platform_fee_from_env())
        }
    };

    let app = routes::app(state);

    // Start server
    let addr = std::env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:3000".into());
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!("══════════════════════════════════════════════════");
    tracing::info!("🚀 creator-server running on http://{}", addr);
    tracing::info!("══════════════════════════════════════════════════");
    tracing::info!("Endpoints:");
    tracing::info!("  GET  /health             - Health check");
    tracing::info!("  POST /spend              - Spend a credit");
    tracing::info!("  GET  /balance            - Credit balance");
    tracing::info!("  POST /checkout           - Create Stripe checkout");
    tracing::info!("  POST /webhook            - Stripe webhook");
    tracing::info!("  POST /creators           - Activate creator");
    tracing::info!("  GET  /verification       - Verification status");
    tracing::info!("  GET  /payout-status      - Payout onboarding status");
    tracing::info!("  GET  /support/aggregate  - Per-sub-key totals");
    tracing::info!("  GET  /targets/counters   - Boost/spin counters");

    axum::serve(listener, app).await?;

    Ok(())
}
