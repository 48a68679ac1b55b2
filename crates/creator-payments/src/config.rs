//! Service Configuration

use std::time::Duration;

use crate::error::{PaymentError, Result};

/// Default platform share of each payment, in basis points
pub const DEFAULT_PLATFORM_FEE_BPS: u32 = 2000;

/// Settings for Stripe access, pricing splits and webhook verification
#[derive(Clone, Debug)]
pub struct PaymentsConfig {
    pub stripe_secret_key: String,
    pub stripe_webhook_secret: String,
    /// Origin that checkout success/cancel URLs are built on
    pub public_base_url: String,
    pub platform_fee_bps: u32,
    pub checkout_timeout: Duration,
    pub webhook_tolerance: Duration,
}

impl PaymentsConfig {
    /// Create from environment variables
    pub fn from_env() -> Result<Self> {
        let stripe_secret_key = required("STRIPE_SECRET_KEY")?;
        let stripe_webhook_secret = required("STRIPE_WEBHOOK_SECRET")?;

        let public_base_url = std::env::var("PUBLIC_BASE_URL")
            .unwrap_or_else(|_| "http://localhost:3000".to_string())
            .trim_end_matches('/')
            .to_string();

        let platform_fee_bps = parsed("PLATFORM_FEE_BPS", DEFAULT_PLATFORM_FEE_BPS)?;
        if platform_fee_bps > 10_000 {
            return Err(PaymentError::Config(format!(
                "PLATFORM_FEE_BPS must be at most 10000, got {platform_fee_bps}"
            )));
        }

        Ok(Self {
            stripe_secret_key,
            stripe_webhook_secret,
            public_base_url,
            platform_fee_bps,
            checkout_timeout: Duration::from_secs(parsed("CHECKOUT_TIMEOUT_SECS", 10)?),
            webhook_tolerance: Duration::from_secs(parsed("WEBHOOK_TOLERANCE_SECS", 300)?),
        })
    }

    /// Platform fee alone, for running without Stripe
    pub fn platform_fee_from_env() -> u32 {
        parsed("PLATFORM_FEE_BPS", DEFAULT_PLATFORM_FEE_BPS).unwrap_or(DEFAULT_PLATFORM_FEE_BPS)
    }
}

fn required(name: &str) -> Result<String> {
    match std::env::var(name) {
        Ok(value) if !value.trim().is_empty() => Ok(value),
        _ => Err(PaymentError::Config(format!("{name} not set"))),
    }
}

fn parsed<T: std::str::FromStr>(name: &str, default: T) -> Result<T> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| PaymentError::Config(format!("{name} is not a valid number: '{raw}'"))),
        Err(_) => Ok(default),
    }
}
