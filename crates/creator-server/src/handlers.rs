//! HTTP Handlers

use axum::{
    Json,
    body::Bytes,
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use creator_payments::{
    ActionKind, CheckoutRequest, CreatorProfile, CreditBalance, CreditFundedAction,
    PaymentError, PayoutStatus, ReconcileOutcome, Result, Source, SupportLedgerEntry,
    TargetCounters, VerificationStatus, VerificationTier,
};

use crate::state::{AppState, StripeServices};

// ============================================================================
// Request / Response Types
// ============================================================================

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub stripe_configured: bool,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

#[derive(Debug, Deserialize)]
pub struct SpendRequest {
    pub email: String,
    pub kind: ActionKind,
    #[serde(default)]
    pub creator_email: Option<String>,
    #[serde(default)]
    pub target_id: Option<String>,
    #[serde(default)]
    pub source: Option<Source>,
}

#[derive(Debug, Serialize)]
pub struct SpendResponse {
    pub balance: CreditBalance,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entry: Option<SupportLedgerEntry>,
}

#[derive(Debug, Serialize)]
pub struct CheckoutResponse {
    pub redirect_url: String,
    pub session_id: String,
    pub payment_ref: String,
}

#[derive(Debug, Serialize)]
pub struct WebhookAck {
    pub received: bool,
    pub duplicate: bool,
}

#[derive(Debug, Deserialize)]
pub struct EmailQuery {
    pub email: String,
}

#[derive(Debug, Deserialize)]
pub struct PayoutQuery {
    pub email: String,
    #[serde(default)]
    pub refresh: bool,
}

#[derive(Debug, Deserialize)]
pub struct ActivateRequest {
    pub email: String,
}

#[derive(Debug, Deserialize)]
pub struct TargetQuery {
    pub target_id: String,
    #[serde(default)]
    pub kind: Option<ActionKind>,
}

#[derive(Debug, Serialize)]
pub struct VerificationResponse {
    pub email: String,
    pub status: VerificationStatus,
    pub tier: Option<VerificationTier>,
    pub current_period_end: Option<DateTime<Utc>>,
    pub verified: bool,
}

impl From<CreatorProfile> for VerificationResponse {
    fn from(profile: CreatorProfile) -> Self {
        Self {
            verified: profile.verification.is_verified(),
            status: profile.verification.status,
            tier: profile.verification.tier,
            current_period_end: profile.verification.current_period_end,
            email: profile.email,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct PayoutResponse {
    pub email: String,
    pub status: PayoutStatus,
    pub account_id: Option<String>,
    pub charges_enabled: bool,
    pub payouts_enabled: bool,
}

impl From<CreatorProfile> for PayoutResponse {
    fn from(profile: CreatorProfile) -> Self {
        Self {
            email: profile.email,
            status: profile.payout_onboarding_status,
            account_id: profile.payout_account_id,
            charges_enabled: profile.charges_enabled,
            payouts_enabled: profile.payouts_enabled,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct AggregateResponse {
    pub target_id: String,
    pub kind: ActionKind,
    pub buckets: BTreeMap<String, u64>,
}

// ============================================================================
// Handlers
// ============================================================================

/// Health check endpoint
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
        stripe_configured: state.stripe.is_some(),
    })
}

/// Spend one credit, booking it against a target when one is given
pub async fn spend(
    State(state): State<AppState>,
    Json(payload): Json<SpendRequest>,
) -> Result<Json<SpendResponse>> {
    let email = required(&payload.email, "email")?;

    match (payload.creator_email.as_deref(), payload.target_id.as_deref()) {
        (Some(creator_email), Some(target_id)) => {
            let action = CreditFundedAction {
                viewer_email: email.to_string(),
                creator_email: required(creator_email, "creator_email")?.to_string(),
                kind: payload.kind,
                source: payload.source.unwrap_or_default(),
                target_id: required(target_id, "target_id")?.to_string(),
            };
            let (balance, entry) = state.credits.spend_and_record(&state.support, action).await?;
            Ok(Json(SpendResponse {
                balance,
                entry: Some(entry),
            }))
        }
        (None, None) => {
            let balance = state.credits.spend_for(email, payload.kind).await?;
            Ok(Json(SpendResponse {
                balance,
                entry: None,
            }))
        }
        _ => Err(PaymentError::InvalidRequest(
            "creator_email and target_id must be given together".into(),
        )),
    }
}

/// Create Stripe checkout session
pub async fn create_checkout(
    State(state): State<AppState>,
    Json(payload): Json<CheckoutRequest>,
) -> Result<Json<CheckoutResponse>> {
    let stripe = stripe_services(&state)?;

    let session = stripe.checkout.build(payload).await?;

    Ok(Json(CheckoutResponse {
        redirect_url: session.checkout_url,
        session_id: session.id,
        payment_ref: session.payment_ref,
    }))
}

/// Stripe webhook handler
///
/// The body is taken as raw bytes; the signature covers them exactly.
pub async fn stripe_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> std::result::Result<Json<WebhookAck>, Response> {
    let stripe = stripe_services(&state).map_err(IntoResponse::into_response)?;

    let signature = headers
        .get("stripe-signature")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();

    let event = stripe.verifier.verify(&body, signature).map_err(|e| {
        tracing::warn!(error = %e, "Webhook signature failed");
        e.into_response()
    })?;

    match state.reconciler.dispatch(&event).await {
        Ok(outcome) => {
            if let ReconcileOutcome::Ignored { event_type } = &outcome {
                tracing::debug!(
                    event_id = %event.id,
                    event_type = %event_type,
                    "Webhook acknowledged"
                );
            }
            Ok(Json(WebhookAck {
                received: true,
                duplicate: false,
            }))
        }
        Err(PaymentError::DuplicateEvent(_)) => Ok(Json(WebhookAck {
            received: true,
            duplicate: true,
        })),
        Err(err @ PaymentError::WebhookParse(_)) => {
            tracing::warn!(event_id = %event.id, error = %err, "Webhook payload rejected");
            Err(err.into_response())
        }
        Err(err) => {
            tracing::error!(event_id = %event.id, error = %err, "Webhook processing error");
            Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse {
                    error: "Webhook processing failed".into(),
                    code: "WEBHOOK_ERROR".into(),
                }),
            )
                .into_response())
        }
    }
}

/// Credit balance, zero for unknown viewers
pub async fn balance(
    State(state): State<AppState>,
    Query(query): Query<EmailQuery>,
) -> Result<Json<CreditBalance>> {
    let email = required(&query.email, "email")?;
    Ok(Json(state.credits.balance(email).await?))
}

pub async fn verification(
    State(state): State<AppState>,
    Query(query): Query<EmailQuery>,
) -> Result<Json<VerificationResponse>> {
    let profile = load_profile(&state, &query.email).await?;
    Ok(Json(profile.into()))
}

/// Payout onboarding status, optionally re-polled from Stripe first
pub async fn payout_status(
    State(state): State<AppState>,
    Query(query): Query<PayoutQuery>,
) -> Result<Json<PayoutResponse>> {
    let profile = if query.refresh {
        let stripe = stripe_services(&state)?;
        stripe.payouts.refresh(required(&query.email, "email")?).await?
    } else {
        load_profile(&state, &query.email).await?
    };
    Ok(Json(profile.into()))
}

/// Activate a creator. Repeat calls return the existing profile.
pub async fn activate_creator(
    State(state): State<AppState>,
    Json(payload): Json<ActivateRequest>,
) -> Result<Json<CreatorProfile>> {
    let email = required(&payload.email, "email")?;
    let profile = state.profiles.activate(email).await?;
    tracing::info!(email = %email, "Creator activated");
    Ok(Json(profile))
}

/// Per-sub-key unit totals for a target (reactions by default)
pub async fn support_aggregate(
    State(state): State<AppState>,
    Query(query): Query<TargetQuery>,
) -> Result<Json<AggregateResponse>> {
    let target_id = required(&query.target_id, "target_id")?;
    let kind = query.kind.unwrap_or(ActionKind::Reaction);
    let buckets = state.support.aggregate(target_id, kind).await?;
    Ok(Json(AggregateResponse {
        target_id: target_id.to_string(),
        kind,
        buckets,
    }))
}

pub async fn target_counters(
    State(state): State<AppState>,
    Query(query): Query<TargetQuery>,
) -> Result<Json<TargetCounters>> {
    let target_id = required(&query.target_id, "target_id")?;
    Ok(Json(state.counters.get(target_id).await?))
}

// ============================================================================
// Helpers
// ============================================================================

fn stripe_services(state: &AppState) -> Result<&StripeServices> {
    state
        .stripe
        .as_ref()
        .ok_or_else(|| PaymentError::DownstreamUnavailable("payments not configured".into()))
}

fn required<'a>(value: &'a str, field: &str) -> Result<&'a str> {
    let value = value.trim();
    if value.is_empty() {
        return Err(PaymentError::InvalidRequest(format!("{field} is required")));
    }
    Ok(value)
}

async fn load_profile(state: &AppState, email: &str) -> Result<CreatorProfile> {
    let email = required(email, "email")?;
    state
        .profiles
        .get(email)
        .await?
        .ok_or_else(|| PaymentError::ProfileNotFound(email.to_string()))
}
