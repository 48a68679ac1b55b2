//! Stripe Webhook Verification
//!
//! Verifies the `Stripe-Signature` header against the raw request body and
//! turns the verified payload into a typed [`WebhookEvent`].
//!
//! Signature scheme: `t=<unix seconds>,v1=<hex>` where `<hex>` is
//! HMAC-SHA256 over `"<t>.<raw body>"` keyed with the endpoint secret.
//! Several `v1` entries may be present during secret rotation.

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use std::collections::HashMap;
use std::time::Duration;

use crate::checkout::CheckoutMetadata;
use crate::error::{PaymentError, Result};
use crate::verification::VerificationTier;

type HmacSha256 = Hmac<Sha256>;

/// Default age limit for a signed payload
pub const DEFAULT_TOLERANCE: Duration = Duration::from_secs(300);

/// Event envelope as delivered by Stripe
#[derive(Clone, Debug, Deserialize)]
pub struct ProcessorEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub created: i64,
    pub data: EventData,
}

#[derive(Clone, Debug, Deserialize)]
pub struct EventData {
    pub object: serde_json::Value,
}

impl ProcessorEvent {
    pub fn created_at(&self) -> DateTime<Utc> {
        DateTime::from_timestamp(self.created, 0).unwrap_or_default()
    }
}

/// Verifies raw webhook deliveries
#[derive(Clone, Debug)]
pub struct WebhookVerifier {
    secret: String,
    tolerance: Duration,
}

impl WebhookVerifier {
    pub fn new(secret: impl Into<String>, tolerance: Duration) -> Self {
        Self {
            secret: secret.into(),
            tolerance,
        }
    }

    /// Verify and parse, using the current time for the tolerance check
    pub fn verify(&self, payload: &[u8], signature: &str) -> Result<ProcessorEvent> {
        verify(payload, signature, &self.secret, self.tolerance, Utc::now())
    }
}

/// Verify `signature` over the raw `payload` and parse the event.
///
/// Fails closed: any problem with the secret, header, timestamp, signature or
/// payload yields [`PaymentError::InvalidSignature`].
pub fn verify(
    payload: &[u8],
    signature: &str,
    secret: &str,
    tolerance: Duration,
    now: DateTime<Utc>,
) -> Result<ProcessorEvent> {
    if secret.is_empty() {
        return Err(PaymentError::InvalidSignature("no webhook secret configured".into()));
    }

    let mut timestamp = None;
    let mut candidates = Vec::new();
    for part in signature.split(',') {
        match part.trim().split_once('=') {
            Some(("t", value)) => timestamp = value.parse::<i64>().ok(),
            Some(("v1", value)) => candidates.push(value),
            _ => {}
        }
    }

    let timestamp =
        timestamp.ok_or_else(|| PaymentError::InvalidSignature("missing timestamp".into()))?;
    if candidates.is_empty() {
        return Err(PaymentError::InvalidSignature("missing v1 signature".into()));
    }

    let age = (now.timestamp() - timestamp).unsigned_abs();
    if age > tolerance.as_secs() {
        return Err(PaymentError::InvalidSignature(format!(
            "timestamp outside tolerance ({age}s)"
        )));
    }

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| PaymentError::InvalidSignature("invalid webhook secret".into()))?;
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload);

    let matched = candidates.iter().any(|candidate| {
        hex::decode(candidate)
            .map(|expected| mac.clone().verify_slice(&expected).is_ok())
            .unwrap_or(false)
    });
    if !matched {
        return Err(PaymentError::InvalidSignature("no matching signature".into()));
    }

    serde_json::from_slice(payload)
        .map_err(|e| PaymentError::InvalidSignature(format!("malformed payload: {e}")))
}

/// Typed view of the events the reconciler acts on
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WebhookEvent {
    /// Checkout finished and the money is collected
    CheckoutCompleted {
        session_id: String,
        metadata: CheckoutMetadata,
        customer_id: Option<String>,
        subscription_id: Option<String>,
        amount_total: Option<i64>,
    },

    /// Checkout finished but an asynchronous payment method is still settling
    CheckoutAwaitingPayment { session_id: String },

    /// Subscription invoice paid
    InvoicePaid {
        subscription_id: Option<String>,
        customer_id: Option<String>,
        creator_email: Option<String>,
        tier: Option<VerificationTier>,
        period_end: Option<DateTime<Utc>>,
    },

    /// Subscription created, updated or deleted
    SubscriptionChanged {
        subscription_id: String,
        customer_id: Option<String>,
        creator_email: Option<String>,
        tier: Option<VerificationTier>,
        status: String,
        current_period_end: Option<DateTime<Utc>>,
        deleted: bool,
    },

    /// Connected account capabilities changed
    AccountUpdated {
        account_id: String,
        creator_email: Option<String>,
        charges_enabled: bool,
        payouts_enabled: bool,
    },

    /// Unhandled event type
    Other { event_type: String },
}

/// Ids may arrive bare or as expanded objects
#[derive(Clone, Debug, Deserialize)]
#[serde(untagged)]
enum Expandable {
    Id(String),
    Object { id: String },
}

impl Expandable {
    fn into_id(self) -> String {
        match self {
            Expandable::Id(id) | Expandable::Object { id } => id,
        }
    }
}

#[derive(Deserialize)]
struct SessionObject {
    id: String,
    customer: Option<Expandable>,
    subscription: Option<Expandable>,
    #[serde(default)]
    metadata: HashMap<String, String>,
    amount_total: Option<i64>,
    payment_status: Option<String>,
}

#[derive(Deserialize)]
struct InvoiceObject {
    customer: Option<Expandable>,
    subscription: Option<Expandable>,
    subscription_details: Option<SubscriptionDetails>,
    parent: Option<InvoiceParent>,
    lines: Option<InvoiceLines>,
}

#[derive(Deserialize)]
struct InvoiceParent {
    subscription_details: Option<SubscriptionDetails>,
}

#[derive(Deserialize)]
struct SubscriptionDetails {
    subscription: Option<Expandable>,
    #[serde(default)]
    metadata: HashMap<String, String>,
}

#[derive(Deserialize)]
struct InvoiceLines {
    #[serde(default)]
    data: Vec<InvoiceLine>,
}

#[derive(Deserialize)]
struct InvoiceLine {
    period: Option<Period>,
}

#[derive(Deserialize)]
struct Period {
    end: Option<i64>,
}

#[derive(Deserialize)]
struct SubscriptionObject {
    id: String,
    customer: Option<Expandable>,
    status: String,
    current_period_end: Option<i64>,
    #[serde(default)]
    metadata: HashMap<String, String>,
    items: Option<SubscriptionItems>,
}

#[derive(Deserialize)]
struct SubscriptionItems {
    #[serde(default)]
    data: Vec<SubscriptionItem>,
}

#[derive(Deserialize)]
struct SubscriptionItem {
    current_period_end: Option<i64>,
}

#[derive(Deserialize)]
struct AccountObject {
    id: String,
    email: Option<String>,
    #[serde(default)]
    charges_enabled: bool,
    #[serde(default)]
    payouts_enabled: bool,
    #[serde(default)]
    metadata: HashMap<String, String>,
}

fn object<T: serde::de::DeserializeOwned>(event: &ProcessorEvent) -> Result<T> {
    serde_json::from_value(event.data.object.clone()).map_err(|e| {
        PaymentError::WebhookParse(format!("{} object: {e}", event.event_type))
    })
}

fn timestamp(secs: Option<i64>) -> Option<DateTime<Utc>> {
    secs.and_then(|s| DateTime::from_timestamp(s, 0))
}

fn tier_from(metadata: &HashMap<String, String>) -> Option<VerificationTier> {
    metadata.get("tier").and_then(|t| t.parse().ok())
}

impl WebhookEvent {
    /// Parse Stripe event into our event type
    pub fn from_processor(event: &ProcessorEvent) -> Result<Self> {
        match event.event_type.as_str() {
            "checkout.session.completed" | "checkout.session.async_payment_succeeded" => {
                let session: SessionObject = object(event)?;
                let paid = matches!(
                    session.payment_status.as_deref(),
                    Some("paid" | "no_payment_required")
                );
                if !paid {
                    return Ok(WebhookEvent::CheckoutAwaitingPayment {
                        session_id: session.id,
                    });
                }

                Ok(WebhookEvent::CheckoutCompleted {
                    metadata: CheckoutMetadata::from_map(&session.metadata)?,
                    session_id: session.id,
                    customer_id: session.customer.map(Expandable::into_id),
                    subscription_id: session.subscription.map(Expandable::into_id),
                    amount_total: session.amount_total,
                })
            }

            "invoice.paid" => {
                let invoice: InvoiceObject = object(event)?;
                let details = invoice
                    .parent
                    .and_then(|p| p.subscription_details)
                    .or(invoice.subscription_details);
                let subscription_id = invoice
                    .subscription
                    .or_else(|| details.as_ref().and_then(|d| d.subscription.clone()))
                    .map(Expandable::into_id);
                let metadata = details.map(|d| d.metadata).unwrap_or_default();
                let period_end = invoice
                    .lines
                    .and_then(|l| l.data.into_iter().find_map(|line| line.period))
                    .and_then(|p| timestamp(p.end));

                Ok(WebhookEvent::InvoicePaid {
                    subscription_id,
                    customer_id: invoice.customer.map(Expandable::into_id),
                    creator_email: metadata.get("creator_email").cloned(),
                    tier: tier_from(&metadata),
                    period_end,
                })
            }

            "customer.subscription.created"
            | "customer.subscription.updated"
            | "customer.subscription.deleted" => {
                let sub: SubscriptionObject = object(event)?;
                let current_period_end = sub.current_period_end.or_else(|| {
                    sub.items
                        .as_ref()
                        .and_then(|items| items.data.iter().find_map(|i| i.current_period_end))
                });

                Ok(WebhookEvent::SubscriptionChanged {
                    creator_email: sub.metadata.get("creator_email").cloned(),
                    tier: tier_from(&sub.metadata),
                    subscription_id: sub.id,
                    customer_id: sub.customer.map(Expandable::into_id),
                    status: sub.status,
                    current_period_end: timestamp(current_period_end),
                    deleted: event.event_type == "customer.subscription.deleted",
                })
            }

            "account.updated" => {
                let account: AccountObject = object(event)?;
                Ok(WebhookEvent::AccountUpdated {
                    creator_email: account
                        .metadata
                        .get("creator_email")
                        .cloned()
                        .or(account.email),
                    account_id: account.id,
                    charges_enabled: account.charges_enabled,
                    payouts_enabled: account.payouts_enabled,
                })
            }

            other => Ok(WebhookEvent::Other {
                event_type: other.to_string(),
            }),
        }
    }
}

/// Produce a `Stripe-Signature` header value for `payload`
#[cfg(test)]
pub(crate) fn sign(payload: &[u8], secret: &str, timestamp: i64) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC can take key of any size");
    mac.update(format!("{timestamp}.").as_bytes());
    mac.update(payload);
    format!("t={timestamp},v1={}", hex::encode(mac.finalize().into_bytes()))
}
