//! Stripe Checkout Integration
//!
//! Turns a monetization selection into a hosted Stripe Checkout session.
//! The charged amount always comes from the fixed price table below; the
//! only client-influenced amount is a custom tip, bounded server-side.
//!
//! Everything the reconciler needs to book the payment later travels in the
//! session metadata, so webhook handling never has to look anything up.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use stripe::{
    CheckoutSession as StripeCheckoutSession, CheckoutSessionMode, Client,
    CreateCheckoutSession, CreateCheckoutSessionLineItems,
    CreateCheckoutSessionLineItemsPriceData,
    CreateCheckoutSessionLineItemsPriceDataProductData,
    CreateCheckoutSessionLineItemsPriceDataRecurring,
    CreateCheckoutSessionLineItemsPriceDataRecurringInterval,
    CreateCheckoutSessionPaymentIntentData, CreateCheckoutSessionSubscriptionData, Currency,
    RequestStrategy,
};

use crate::action::{ActionKind, CreditKind, Source};
use crate::error::{PaymentError, Result};
use crate::profiles::ProfileStore;
use crate::support::SupportLedger;
use crate::verification::{VerificationTier, ensure_tier_change_allowed};

/// Credits granted by one pack purchase
pub const PACK_SIZE: u32 = 10;

/// Inclusive bounds for a custom tip amount
pub const MIN_CUSTOM_TIP_CENTS: i64 = 100;
pub const MAX_CUSTOM_TIP_CENTS: i64 = 50_000;

/// Upper bound on one session-creation round trip
pub const DEFAULT_CHECKOUT_TIMEOUT: Duration = Duration::from_secs(10);

/// What is being bought
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CheckoutMode {
    /// One paid action against a target
    Single(ActionKind),
    /// A pack of [`PACK_SIZE`] credits
    Pack(CreditKind),
    /// Monthly verification subscription
    Verification(VerificationTier),
}

impl CheckoutMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckoutMode::Single(ActionKind::Tip) => "tip",
            CheckoutMode::Single(ActionKind::Boost) => "boost",
            CheckoutMode::Single(ActionKind::Spin) => "spin",
            CheckoutMode::Single(ActionKind::Reaction) => "reaction",
            CheckoutMode::Single(ActionKind::Vote) => "vote",
            CheckoutMode::Pack(CreditKind::Tips) => "tip-pack",
            CheckoutMode::Pack(CreditKind::Boosts) => "boost-pack",
            CheckoutMode::Pack(CreditKind::Spins) => "spin-pack",
            CheckoutMode::Verification(VerificationTier::Blue) => "verification-blue",
            CheckoutMode::Verification(VerificationTier::Gold) => "verification-gold",
        }
    }

    pub fn payment_type(&self) -> PaymentType {
        match self {
            CheckoutMode::Single(_) => PaymentType::OneTime,
            CheckoutMode::Pack(_) => PaymentType::CreditPack,
            CheckoutMode::Verification(_) => PaymentType::Subscription,
        }
    }

    pub fn action(&self) -> Option<ActionKind> {
        match self {
            CheckoutMode::Single(kind) => Some(*kind),
            CheckoutMode::Pack(credit) => Some(credit.action()),
            CheckoutMode::Verification(_) => None,
        }
    }

    /// Canonical price for this mode
    pub fn price(&self) -> Price {
        let (name, cents) = match self {
            CheckoutMode::Single(ActionKind::Tip) => ("Tip", 100),
            CheckoutMode::Single(ActionKind::Boost) => ("Boost", 200),
            CheckoutMode::Single(ActionKind::Spin) => ("Spin", 100),
            CheckoutMode::Single(ActionKind::Reaction) => ("Paid reaction", 50),
            CheckoutMode::Single(ActionKind::Vote) => ("Paid vote", 25),
            CheckoutMode::Pack(CreditKind::Tips) => ("10 Tips", 800),
            CheckoutMode::Pack(CreditKind::Boosts) => ("10 Boosts", 1500),
            CheckoutMode::Pack(CreditKind::Spins) => ("10 Spins", 800),
            CheckoutMode::Verification(VerificationTier::Blue) => ("Blue verification", 499),
            CheckoutMode::Verification(VerificationTier::Gold) => ("Gold verification", 1999),
        };
        Price {
            name: name.to_string(),
            cents,
            recurring: matches!(self, CheckoutMode::Verification(_)),
        }
    }
}

impl FromStr for CheckoutMode {
    type Err = PaymentError;

    fn from_str(s: &str) -> Result<Self> {
        let mode = match s {
            "tip" => CheckoutMode::Single(ActionKind::Tip),
            "boost" => CheckoutMode::Single(ActionKind::Boost),
            "spin" => CheckoutMode::Single(ActionKind::Spin),
            "reaction" => CheckoutMode::Single(ActionKind::Reaction),
            "vote" => CheckoutMode::Single(ActionKind::Vote),
            "tip-pack" => CheckoutMode::Pack(CreditKind::Tips),
            "boost-pack" => CheckoutMode::Pack(CreditKind::Boosts),
            "spin-pack" => CheckoutMode::Pack(CreditKind::Spins),
            "verification-blue" => CheckoutMode::Verification(VerificationTier::Blue),
            "verification-gold" => CheckoutMode::Verification(VerificationTier::Gold),
            other => return Err(PaymentError::UnknownMode(other.to_string())),
        };
        Ok(mode)
    }
}

/// How the payment is settled
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentType {
    OneTime,
    CreditPack,
    Subscription,
}

impl PaymentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentType::OneTime => "one_time",
            PaymentType::CreditPack => "credit_pack",
            PaymentType::Subscription => "subscription",
        }
    }
}

/// Pricing information
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Price {
    pub name: String,
    pub cents: i64,
    /// Billed monthly when true
    pub recurring: bool,
}

/// Everything the reconciler needs to act on a completed session
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CheckoutMetadata {
    pub mode: CheckoutMode,
    pub source: Source,
    pub target_id: String,
    pub creator_email: String,
    pub viewer_email: String,
    pub payment_ref: String,
    pub amount_cents: i64,
}

impl CheckoutMetadata {
    pub fn to_map(&self) -> HashMap<String, String> {
        let mut map = HashMap::new();
        map.insert("mode".to_string(), self.mode.as_str().to_string());
        if let Some(action) = self.mode.action() {
            map.insert("action".to_string(), action.as_str().to_string());
        }
        if let CheckoutMode::Verification(tier) = self.mode {
            map.insert("tier".to_string(), tier.as_str().to_string());
        }
        map.insert(
            "pack".to_string(),
            matches!(self.mode, CheckoutMode::Pack(_)).to_string(),
        );
        map.insert("source".to_string(), self.source.as_str().to_string());
        map.insert("target_id".to_string(), self.target_id.clone());
        map.insert("creator_email".to_string(), self.creator_email.clone());
        map.insert("viewer_email".to_string(), self.viewer_email.clone());
        map.insert("payment_ref".to_string(), self.payment_ref.clone());
        map.insert(
            "payment_type".to_string(),
            self.mode.payment_type().as_str().to_string(),
        );
        map.insert("amount_cents".to_string(), self.amount_cents.to_string());
        map
    }

    pub fn from_map(map: &HashMap<String, String>) -> Result<Self> {
        let field = |key: &str| {
            map.get(key)
                .cloned()
                .ok_or_else(|| PaymentError::WebhookParse(format!("metadata missing '{key}'")))
        };
        let non_empty = |key: &str| {
            field(key).and_then(|value| {
                if value.is_empty() {
                    Err(PaymentError::WebhookParse(format!("metadata '{key}' is empty")))
                } else {
                    Ok(value)
                }
            })
        };
        let optional = |key: &str| map.get(key).cloned().unwrap_or_default();

        let mode: CheckoutMode = field("mode")?.parse()?;
        let amount_cents = field("amount_cents")?.parse().map_err(|_| {
            PaymentError::WebhookParse("metadata 'amount_cents' not a number".into())
        })?;

        // Viewer-side modes are booked against the viewer and, for single
        // actions, the target
        let (viewer_email, target_id) = match mode {
            CheckoutMode::Single(_) => (non_empty("viewer_email")?, non_empty("target_id")?),
            CheckoutMode::Pack(_) => (non_empty("viewer_email")?, optional("target_id")),
            CheckoutMode::Verification(_) => (optional("viewer_email"), optional("target_id")),
        };

        Ok(Self {
            mode,
            source: map
                .get("source")
                .map(|s| s.parse::<Source>())
                .transpose()?
                .unwrap_or_default(),
            target_id,
            creator_email: field("creator_email")?,
            viewer_email,
            payment_ref: field("payment_ref")?,
            amount_cents,
        })
    }
}

/// Request to create a checkout session
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CheckoutRequest {
    pub mode: String,
    pub creator_email: String,
    #[serde(default)]
    pub viewer_email: String,
    #[serde(default)]
    pub target_id: String,
    #[serde(default)]
    pub source: Source,
    /// Local path to send the user back to, e.g. `/p/post123`
    pub return_path: String,
    /// Custom amount, honoured for `tip` only
    #[serde(default)]
    pub amount_cents: Option<i64>,
}

/// Processor-facing session parameters
#[derive(Clone, Debug)]
pub struct SessionParams {
    pub price: Price,
    pub amount_cents: i64,
    pub customer_email: String,
    pub success_url: String,
    pub cancel_url: String,
    pub metadata: CheckoutMetadata,
}

/// Result of creating a checkout session
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CheckoutSession {
    /// Stripe session ID
    pub id: String,

    /// URL to redirect user to
    pub checkout_url: String,

    /// Reference the resulting payment is booked under
    pub payment_ref: String,
}

/// Hosted-checkout provider
#[async_trait]
pub trait CheckoutGateway: Send + Sync {
    async fn create_session(&self, params: &SessionParams) -> Result<CheckoutSession>;
}

/// Stripe client wrapper
pub struct StripeCheckoutGateway {
    client: Client,
}

impl StripeCheckoutGateway {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl CheckoutGateway for StripeCheckoutGateway {
    async fn create_session(&self, request: &SessionParams) -> Result<CheckoutSession> {
        let metadata = request.metadata.to_map();
        let payment_ref = request.metadata.payment_ref.clone();

        let mut params = CreateCheckoutSession::new();
        params.customer_email = Some(&request.customer_email);
        params.success_url = Some(&request.success_url);
        params.cancel_url = Some(&request.cancel_url);
        params.client_reference_id = Some(&payment_ref);
        params.metadata = Some(metadata.clone());

        if request.price.recurring {
            params.mode = Some(CheckoutSessionMode::Subscription);
            params.subscription_data = Some(CreateCheckoutSessionSubscriptionData {
                metadata: Some(metadata),
                ..Default::default()
            });
        } else {
            params.mode = Some(CheckoutSessionMode::Payment);
            params.payment_intent_data = Some(CreateCheckoutSessionPaymentIntentData {
                metadata: Some(metadata),
                ..Default::default()
            });
        }

        params.line_items = Some(vec![CreateCheckoutSessionLineItems {
            quantity: Some(1),
            price_data: Some(CreateCheckoutSessionLineItemsPriceData {
                currency: Currency::USD,
                unit_amount: Some(request.amount_cents),
                product_data: Some(CreateCheckoutSessionLineItemsPriceDataProductData {
                    name: request.price.name.clone(),
                    ..Default::default()
                }),
                recurring: request.price.recurring.then_some(
                    CreateCheckoutSessionLineItemsPriceDataRecurring {
                        interval: CreateCheckoutSessionLineItemsPriceDataRecurringInterval::Month,
                        interval_count: Some(1),
                    },
                ),
                ..Default::default()
            }),
            ..Default::default()
        }]);

        // Retries of the same checkout attempt reuse the payment ref
        let client = self
            .client
            .clone()
            .with_strategy(RequestStrategy::Idempotent(payment_ref.clone()));

        let session = StripeCheckoutSession::create(&client, params)
            .await
            .map_err(|e| PaymentError::DownstreamUnavailable(e.to_string()))?;

        let checkout_url = session.url.ok_or_else(|| {
            PaymentError::DownstreamUnavailable("No checkout URL returned".into())
        })?;

        Ok(CheckoutSession {
            id: session.id.to_string(),
            checkout_url,
            payment_ref,
        })
    }
}

/// Builds checkout sessions from monetization selections
pub struct CheckoutSessionBuilder {
    gateway: Arc<dyn CheckoutGateway>,
    profiles: Arc<dyn ProfileStore>,
    support: SupportLedger,
    public_base_url: String,
    timeout: Duration,
}

impl CheckoutSessionBuilder {
    pub fn new(
        gateway: Arc<dyn CheckoutGateway>,
        profiles: Arc<dyn ProfileStore>,
        support: SupportLedger,
        public_base_url: impl Into<String>,
    ) -> Self {
        Self {
            gateway,
            profiles,
            support,
            public_base_url: public_base_url.into(),
            timeout: DEFAULT_CHECKOUT_TIMEOUT,
        }
    }

    /// Bound each session-creation call by `timeout`
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Create a hosted checkout session. Writes no local state.
    pub async fn build(&self, request: CheckoutRequest) -> Result<CheckoutSession> {
        let mode: CheckoutMode = request.mode.parse()?;
        validate_return_path(&request.return_path)?;

        let price = mode.price();
        let amount_cents = resolve_amount(mode, &price, request.amount_cents)?;

        let customer_email = match mode {
            CheckoutMode::Verification(tier) => {
                let profile = self
                    .profiles
                    .get(&request.creator_email)
                    .await?
                    .ok_or_else(|| PaymentError::ProfileNotFound(request.creator_email.clone()))?;
                ensure_tier_change_allowed(&profile.verification, tier)?;
                request.creator_email.clone()
            }
            CheckoutMode::Single(_) | CheckoutMode::Pack(_) => {
                if request.viewer_email.is_empty() {
                    return Err(PaymentError::InvalidRequest("viewer email required".into()));
                }
                if let CheckoutMode::Single(kind) = mode {
                    if request.target_id.is_empty() {
                        return Err(PaymentError::InvalidRequest("target id required".into()));
                    }
                    self.support
                        .ensure_within_cap(&request.viewer_email, &request.target_id, kind)
                        .await?;
                }
                request.viewer_email.clone()
            }
        };

        let metadata = CheckoutMetadata {
            mode,
            source: request.source,
            target_id: request.target_id,
            creator_email: request.creator_email,
            viewer_email: request.viewer_email,
            payment_ref: uuid::Uuid::new_v4().to_string(),
            amount_cents,
        };

        let params = SessionParams {
            price,
            amount_cents,
            customer_email,
            success_url: self.return_url(
                &request.return_path,
                "checkout=success&session_id={CHECKOUT_SESSION_ID}",
            ),
            cancel_url: self.return_url(&request.return_path, "checkout=canceled"),
            metadata,
        };

        let session = tokio::time::timeout(self.timeout, self.gateway.create_session(&params))
            .await
            .unwrap_or_else(|_| {
                Err(PaymentError::DownstreamUnavailable(
                    "checkout session timed out".into(),
                ))
            })
            .inspect_err(|e| {
                tracing::error!(mode = mode.as_str(), error = %e, "Checkout session failed");
            })?;

        tracing::info!(
            session_id = %session.id,
            mode = mode.as_str(),
            payment_ref = %session.payment_ref,
            amount_cents,
            "Created checkout session"
        );
        Ok(session)
    }

    fn return_url(&self, path: &str, query: &str) -> String {
        let separator = if path.contains('?') { '&' } else { '?' };
        format!("{}{path}{separator}{query}", self.public_base_url)
    }
}

fn resolve_amount(mode: CheckoutMode, price: &Price, requested: Option<i64>) -> Result<i64> {
    match (mode, requested) {
        (CheckoutMode::Single(ActionKind::Tip), Some(cents)) => {
            if (MIN_CUSTOM_TIP_CENTS..=MAX_CUSTOM_TIP_CENTS).contains(&cents) {
                Ok(cents)
            } else {
                Err(PaymentError::InvalidAmount(format!(
                    "tip must be between {MIN_CUSTOM_TIP_CENTS} and {MAX_CUSTOM_TIP_CENTS} cents, got {cents}"
                )))
            }
        }
        (_, Some(cents)) => {
            tracing::debug!(mode = mode.as_str(), cents, "Ignoring client amount for fixed price");
            Ok(price.cents)
        }
        (_, None) => Ok(price.cents),
    }
}

/// Only same-origin absolute paths are accepted
fn validate_return_path(path: &str) -> Result<()> {
    let ok = path.starts_with('/')
        && !path.starts_with("//")
        && !path.contains('\\')
        && !path.contains("://")
        && !path.chars().any(char::is_control);
    if ok {
        Ok(())
    } else {
        Err(PaymentError::InvalidReturnPath(path.to_string()))
    }
}
