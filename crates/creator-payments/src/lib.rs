//! # creator-payments
//!
//! Creator monetization ledger and Stripe reconciliation.
//!
//! Viewers support creators with reactions, votes, tips, boosts and spins.
//! Each action is paid either from a pre-purchased credit balance or
//! through a Stripe Checkout session. Creators buy verification badges as
//! monthly subscriptions and receive payouts through connected accounts.
//!
//! ## Payment Flows
//!
//! ### 1. Credit spend - no processor round trip
//!
//! ```text
//! ┌─────────────┐     ┌─────────────────┐     ┌─────────────────┐
//! │   Viewer    │────▶│  Credit Ledger  │────▶│ Support Ledger  │
//! │  (action)   │     │  (decrement)    │     │  (gross = 0)    │
//! └─────────────┘     └─────────────────┘     └─────────────────┘
//! ```
//!
//! ### 2. Card payment - hosted checkout, settled by webhook
//!
//! ```text
//! ┌─────────────┐     ┌─────────────────┐     ┌─────────────────┐
//! │  Checkout   │────▶│  Stripe Hosted  │────▶│  POST /webhook  │
//! │  Builder    │     │  Checkout Page  │     │  (signed event) │
//! └─────────────┘     └─────────────────┘     └────────┬────────┘
//!                                                      ▼
//!                     ┌──────────────────────────────────────────┐
//!                     │ Reconciler: claim event id, then one of  │
//!                     │  grant pack · record action · snapshot   │
//!                     └──────────────────────────────────────────┘
//! ```
//!
//! Webhooks arrive at least once and in any order. The reconciler claims
//! each event id, keys every mutation by the checkout's payment reference
//! and ignores profile snapshots older than the ones already applied.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use creator_payments::{ActionKind, CreditLedger, MemoryCreditStore};
//!
//! let credits = CreditLedger::new(Arc::new(MemoryCreditStore::new()));
//! let remaining = credits.spend_for("viewer@example.com", ActionKind::Tip).await?;
//! ```

mod action;
mod checkout;
mod config;
mod counters;
mod credits;
mod error;
mod idempotency;
mod payout;
mod profiles;
mod reconciler;
mod support;
mod verification;
mod webhook;

pub use action::{ActionKind, CreditKind, SUB_KEY_DELIMITER, Source, split_target};
pub use checkout::{
    CheckoutGateway, CheckoutMetadata, CheckoutMode, CheckoutRequest, CheckoutSession,
    CheckoutSessionBuilder, DEFAULT_CHECKOUT_TIMEOUT, MAX_CUSTOM_TIP_CENTS, MIN_CUSTOM_TIP_CENTS,
    PACK_SIZE, PaymentType, Price, SessionParams, StripeCheckoutGateway,
};
pub use config::{DEFAULT_PLATFORM_FEE_BPS, PaymentsConfig};
pub use counters::{CounterStore, MemoryCounterStore, TargetCounters};
pub use credits::{
    CreditBalance, CreditFundedAction, CreditLedger, CreditStore, Grant, MemoryCreditStore,
};
pub use error::{PaymentError, Result};
pub use idempotency::{MemoryEventStore, ProcessedEventStore};
pub use payout::{
    AccountLookup, PayoutRefresher, PayoutSnapshot, PayoutStatus, StripeAccountLookup,
};
pub use profiles::{CreatorProfile, MemoryProfileStore, ProfileStore};
pub use reconciler::{ReconcileOutcome, Reconciler};
pub use support::{
    AppendOutcome, DEFAULT_CURRENCY, LEGACY_BUCKET, MemorySupportStore, NewEntry, Split,
    SupportLedger, SupportLedgerEntry, SupportStore, split_revenue,
};
pub use verification::{
    SnapshotOrigin, VerificationSnapshot, VerificationState, VerificationStatus,
    VerificationTier, ensure_tier_change_allowed,
};
pub use webhook::{DEFAULT_TOLERANCE, ProcessorEvent, WebhookEvent, WebhookVerifier};

/// Re-exported so callers can build a client without depending on async-stripe directly
pub use stripe::Client as StripeApiClient;
