//! Application State

use std::sync::Arc;
use std::time::Duration;

use creator_payments::{
    AccountLookup, CheckoutGateway, CheckoutSessionBuilder, CounterStore, CreditLedger,
    MemoryCounterStore, MemoryCreditStore, MemoryEventStore, MemoryProfileStore,
    MemorySupportStore, PayoutRefresher, ProfileStore, Reconciler, SupportLedger,
    WebhookVerifier,
};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    /// Viewer credit balances
    pub credits: CreditLedger,

    /// Append-only record of every funded action
    pub support: SupportLedger,

    pub counters: Arc<dyn CounterStore>,

    pub profiles: Arc<dyn ProfileStore>,

    /// Applies verified webhook events
    pub reconciler: Arc<Reconciler>,

    /// Stripe-backed services (optional - None if not configured)
    pub stripe: Option<StripeServices>,
}

/// Everything that needs Stripe credentials
#[derive(Clone)]
pub struct StripeServices {
    pub checkout: Arc<CheckoutSessionBuilder>,
    pub verifier: WebhookVerifier,
    pub payouts: Arc<PayoutRefresher>,
}

impl AppState {
    /// State backed by in-memory stores, with payments disabled
    pub fn in_memory(platform_fee_bps: u32) -> Self {
        let credits = CreditLedger::new(Arc::new(MemoryCreditStore::new()));
        let support = SupportLedger::new(Arc::new(MemorySupportStore::new()), platform_fee_bps);
        let counters: Arc<dyn CounterStore> = Arc::new(MemoryCounterStore::new());
        let profiles: Arc<dyn ProfileStore> = Arc::new(MemoryProfileStore::new());

        let reconciler = Reconciler::new(
            credits.clone(),
            support.clone(),
            counters.clone(),
            profiles.clone(),
            Arc::new(MemoryEventStore::new()),
        );

        Self {
            credits,
            support,
            counters,
            profiles,
            reconciler: Arc::new(reconciler),
            stripe: None,
        }
    }

    /// Enable checkout, webhooks and payout polling
    pub fn with_stripe(
        mut self,
        gateway: Arc<dyn CheckoutGateway>,
        lookup: Arc<dyn AccountLookup>,
        verifier: WebhookVerifier,
        public_base_url: impl Into<String>,
        checkout_timeout: Duration,
    ) -> Self {
        let checkout = CheckoutSessionBuilder::new(
            gateway,
            self.profiles.clone(),
            self.support.clone(),
            public_base_url,
        )
        .with_timeout(checkout_timeout);

        self.stripe = Some(StripeServices {
            checkout: Arc::new(checkout),
            verifier,
            payouts: Arc::new(PayoutRefresher::new(self.profiles.clone(), lookup)),
        });
        self
    }
}
