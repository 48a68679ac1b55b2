//! Payout State Machine
//!
//! Onboarding status of a creator's connected payout account, derived from
//! the two capability flags the processor reports for the account.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::error::{PaymentError, Result};
use crate::profiles::{CreatorProfile, ProfileStore};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayoutStatus {
    #[default]
    NotStarted,
    Pending,
    Complete,
}

impl PayoutStatus {
    /// Complete iff both capabilities are enabled; any known account is at least pending
    pub fn derive(has_account: bool, charges_enabled: bool, payouts_enabled: bool) -> Self {
        match (has_account, charges_enabled && payouts_enabled) {
            (false, _) => PayoutStatus::NotStarted,
            (true, true) => PayoutStatus::Complete,
            (true, false) => PayoutStatus::Pending,
        }
    }
}

/// Account state reported by one processor event or poll
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PayoutSnapshot {
    pub account_id: String,
    pub charges_enabled: bool,
    pub payouts_enabled: bool,
    pub observed_at: DateTime<Utc>,
}

impl PayoutSnapshot {
    pub fn status(&self) -> PayoutStatus {
        PayoutStatus::derive(true, self.charges_enabled, self.payouts_enabled)
    }
}

/// Read access to connected accounts at the processor
#[async_trait]
pub trait AccountLookup: Send + Sync {
    async fn fetch_account(&self, account_id: &str) -> Result<PayoutSnapshot>;
}

/// Stripe Connect account lookup
pub struct StripeAccountLookup {
    client: stripe::Client,
    timeout: Duration,
}

impl StripeAccountLookup {
    pub fn new(client: stripe::Client, timeout: Duration) -> Self {
        Self { client, timeout }
    }
}

#[async_trait]
impl AccountLookup for StripeAccountLookup {
    async fn fetch_account(&self, account_id: &str) -> Result<PayoutSnapshot> {
        let id = account_id
            .parse::<stripe::AccountId>()
            .map_err(|e| PaymentError::InvalidRequest(format!("bad account id: {e}")))?;

        let account = tokio::time::timeout(
            self.timeout,
            stripe::Account::retrieve(&self.client, &id, &[]),
        )
        .await
        .map_err(|_| PaymentError::DownstreamUnavailable("account lookup timed out".into()))?
        .map_err(|e| PaymentError::DownstreamUnavailable(e.to_string()))?;

        Ok(PayoutSnapshot {
            account_id: account.id.to_string(),
            charges_enabled: account.charges_enabled.unwrap_or(false),
            payouts_enabled: account.payouts_enabled.unwrap_or(false),
            observed_at: Utc::now(),
        })
    }
}

/// Fallback reconciliation by polling the processor.
///
/// The webhook stays the primary update path; a poll goes through the same
/// snapshot application and so cannot disagree with it.
pub struct PayoutRefresher {
    profiles: Arc<dyn ProfileStore>,
    lookup: Arc<dyn AccountLookup>,
}

impl PayoutRefresher {
    pub fn new(profiles: Arc<dyn ProfileStore>, lookup: Arc<dyn AccountLookup>) -> Self {
        Self { profiles, lookup }
    }

    pub async fn refresh(&self, email: &str) -> Result<CreatorProfile> {
        let profile = self
            .profiles
            .get(email)
            .await?
            .ok_or_else(|| PaymentError::ProfileNotFound(email.to_string()))?;

        let Some(account_id) = profile.payout_account_id.as_deref() else {
            return Ok(profile);
        };

        let snapshot = self.lookup.fetch_account(account_id).await?;
        tracing::info!(
            email = %email,
            account_id = %snapshot.account_id,
            status = ?snapshot.status(),
            "Polled payout account"
        );
        self.profiles.apply_payout(email, &snapshot).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profiles::MemoryProfileStore;

    struct FixedLookup(bool, bool);

    #[async_trait]
    impl AccountLookup for FixedLookup {
        async fn fetch_account(&self, account_id: &str) -> Result<PayoutSnapshot> {
            Ok(PayoutSnapshot {
                account_id: account_id.to_string(),
                charges_enabled: self.0,
                payouts_enabled: self.1,
                observed_at: Utc::now(),
            })
        }
    }

    #[test]
    fn test_derive() {
        assert_eq!(PayoutStatus::derive(false, true, true), PayoutStatus::NotStarted);
        assert_eq!(PayoutStatus::derive(true, true, false), PayoutStatus::Pending);
        assert_eq!(PayoutStatus::derive(true, false, true), PayoutStatus::Pending);
        assert_eq!(PayoutStatus::derive(true, true, true), PayoutStatus::Complete);
    }

    #[tokio::test]
    async fn test_refresh_without_account_is_noop() {
        let profiles = Arc::new(MemoryProfileStore::new());
        profiles.activate("creator@example.com").await.unwrap();
        let refresher = PayoutRefresher::new(profiles, Arc::new(FixedLookup(true, true)));

        let profile = refresher.refresh("creator@example.com").await.unwrap();
        assert_eq!(profile.payout_onboarding_status, PayoutStatus::NotStarted);
    }

    #[tokio::test]
    async fn test_refresh_applies_snapshot() {
        let profiles = Arc::new(MemoryProfileStore::new());
        profiles.activate("creator@example.com").await.unwrap();
        profiles
            .apply_payout(
                "creator@example.com",
                &PayoutSnapshot {
                    account_id: "acct_123".into(),
                    charges_enabled: false,
                    payouts_enabled: false,
                    observed_at: Utc::now() - chrono::Duration::minutes(5),
                },
            )
            .await
            .unwrap();

        let refresher = PayoutRefresher::new(profiles, Arc::new(FixedLookup(true, true)));
        let profile = refresher.refresh("creator@example.com").await.unwrap();
        assert_eq!(profile.payout_onboarding_status, PayoutStatus::Complete);
        assert!(profile.charges_enabled && profile.payouts_enabled);
    }

    #[tokio::test]
    async fn test_refresh_unknown_profile() {
        let refresher = PayoutRefresher::new(
            Arc::new(MemoryProfileStore::new()),
            Arc::new(FixedLookup(true, true)),
        );
        assert!(matches!(
            refresher.refresh("ghost@example.com").await,
            Err(PaymentError::ProfileNotFound(_))
        ));
    }
}
