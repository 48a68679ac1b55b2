//! Creator Profiles
//!
//! Account, subscription and payout state per creator, keyed by email.
//! Profiles are created on activation and afterwards only changed by
//! processor-confirmed snapshots.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;

use crate::error::{PaymentError, Result};
use crate::payout::{PayoutSnapshot, PayoutStatus};
use crate::verification::{VerificationSnapshot, VerificationState};

/// A creator's account record
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatorProfile {
    pub email: String,
    pub verification: VerificationState,
    pub processor_customer_id: Option<String>,
    pub processor_subscription_id: Option<String>,
    pub payout_account_id: Option<String>,
    pub payout_onboarding_status: PayoutStatus,
    pub charges_enabled: bool,
    pub payouts_enabled: bool,
    /// Processor time of the last applied verification snapshot
    pub verification_snapshot_at: Option<DateTime<Utc>>,
    /// Processor time of the last applied payout snapshot
    pub payout_snapshot_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl CreatorProfile {
    pub fn new(email: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            verification: VerificationState::default(),
            processor_customer_id: None,
            processor_subscription_id: None,
            payout_account_id: None,
            payout_onboarding_status: PayoutStatus::NotStarted,
            charges_enabled: false,
            payouts_enabled: false,
            verification_snapshot_at: None,
            payout_snapshot_at: None,
            created_at: Utc::now(),
        }
    }

    /// Apply a verification snapshot if it is not stale. Returns whether it applied.
    pub fn apply_verification(&mut self, snapshot: &VerificationSnapshot) -> bool {
        if !self
            .verification
            .accepts(snapshot, self.verification_snapshot_at)
        {
            return false;
        }

        self.verification.apply(snapshot);
        if snapshot.customer_id.is_some() {
            self.processor_customer_id.clone_from(&snapshot.customer_id);
        }
        if snapshot.subscription_id.is_some() {
            self.processor_subscription_id
                .clone_from(&snapshot.subscription_id);
        }
        self.verification_snapshot_at = Some(snapshot.observed_at);
        true
    }

    /// Apply a payout snapshot if it is not older than the last one. Returns whether it applied.
    pub fn apply_payout(&mut self, snapshot: &PayoutSnapshot) -> bool {
        if self
            .payout_snapshot_at
            .is_some_and(|at| snapshot.observed_at < at)
        {
            return false;
        }

        self.payout_account_id = Some(snapshot.account_id.clone());
        self.charges_enabled = snapshot.charges_enabled;
        self.payouts_enabled = snapshot.payouts_enabled;
        self.payout_onboarding_status = snapshot.status();
        self.payout_snapshot_at = Some(snapshot.observed_at);
        true
    }
}

/// Creator profile storage.
///
/// `apply_*` must compare-and-replace atomically in the backing store.
#[async_trait]
pub trait ProfileStore: Send + Sync {
    async fn get(&self, email: &str) -> Result<Option<CreatorProfile>>;

    /// Create a default profile unless one exists; returns the stored profile
    async fn activate(&self, email: &str) -> Result<CreatorProfile>;

    async fn find_by_customer(&self, customer_id: &str) -> Result<Option<CreatorProfile>>;

    async fn find_by_subscription(&self, subscription_id: &str) -> Result<Option<CreatorProfile>>;

    async fn find_by_account(&self, account_id: &str) -> Result<Option<CreatorProfile>>;

    async fn apply_verification(
        &self,
        email: &str,
        snapshot: &VerificationSnapshot,
    ) -> Result<CreatorProfile>;

    async fn apply_payout(&self, email: &str, snapshot: &PayoutSnapshot) -> Result<CreatorProfile>;
}

/// In-memory profile store (for development and tests)
#[derive(Default)]
pub struct MemoryProfileStore {
    profiles: RwLock<HashMap<String, CreatorProfile>>,
}

impl MemoryProfileStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn find_by<F>(&self, pred: F) -> Option<CreatorProfile>
    where
        F: Fn(&CreatorProfile) -> bool + Send,
    {
        let profiles = self.profiles.read().await;
        profiles.values().find(|p| pred(p)).cloned()
    }
}

#[async_trait]
impl ProfileStore for MemoryProfileStore {
    async fn get(&self, email: &str) -> Result<Option<CreatorProfile>> {
        let profiles = self.profiles.read().await;
        Ok(profiles.get(email).cloned())
    }

    async fn activate(&self, email: &str) -> Result<CreatorProfile> {
        let mut profiles = self.profiles.write().await;
        Ok(profiles
            .entry(email.to_string())
            .or_insert_with(|| CreatorProfile::new(email))
            .clone())
    }

    async fn find_by_customer(&self, customer_id: &str) -> Result<Option<CreatorProfile>> {
        Ok(self
            .find_by(|p| p.processor_customer_id.as_deref() == Some(customer_id))
            .await)
    }

    async fn find_by_subscription(&self, subscription_id: &str) -> Result<Option<CreatorProfile>> {
        Ok(self
            .find_by(|p| p.processor_subscription_id.as_deref() == Some(subscription_id))
            .await)
    }

    async fn find_by_account(&self, account_id: &str) -> Result<Option<CreatorProfile>> {
        Ok(self
            .find_by(|p| p.payout_account_id.as_deref() == Some(account_id))
            .await)
    }

    async fn apply_verification(
        &self,
        email: &str,
        snapshot: &VerificationSnapshot,
    ) -> Result<CreatorProfile> {
        let mut profiles = self.profiles.write().await;
        let profile = profiles
            .get_mut(email)
            .ok_or_else(|| PaymentError::ProfileNotFound(email.to_string()))?;

        if !profile.apply_verification(snapshot) {
            tracing::info!(
                email = %email,
                status = snapshot.status.as_str(),
                observed_at = %snapshot.observed_at,
                "Ignored stale verification snapshot"
            );
        }
        Ok(profile.clone())
    }

    async fn apply_payout(&self, email: &str, snapshot: &PayoutSnapshot) -> Result<CreatorProfile> {
        let mut profiles = self.profiles.write().await;
        let profile = profiles
            .get_mut(email)
            .ok_or_else(|| PaymentError::ProfileNotFound(email.to_string()))?;

        if !profile.apply_payout(snapshot) {
            tracing::info!(
                email = %email,
                account_id = %snapshot.account_id,
                "Ignored stale payout snapshot"
            );
        }
        Ok(profile.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::verification::{SnapshotOrigin, VerificationStatus, VerificationTier};
    use chrono::Duration;

    fn payout(charges: bool, payouts: bool, at: DateTime<Utc>) -> PayoutSnapshot {
        PayoutSnapshot {
            account_id: "acct_1".into(),
            charges_enabled: charges,
            payouts_enabled: payouts,
            observed_at: at,
        }
    }

    #[tokio::test]
    async fn test_activate_is_idempotent() {
        let store = MemoryProfileStore::new();
        let first = store.activate("creator@example.com").await.unwrap();
        let second = store.activate("creator@example.com").await.unwrap();
        assert_eq!(first.created_at, second.created_at);
    }

    #[tokio::test]
    async fn test_payout_snapshots_out_of_order() {
        let store = MemoryProfileStore::new();
        store.activate("creator@example.com").await.unwrap();
        let now = Utc::now();

        store
            .apply_payout("creator@example.com", &payout(true, true, now))
            .await
            .unwrap();
        let profile = store
            .apply_payout(
                "creator@example.com",
                &payout(true, false, now - Duration::seconds(10)),
            )
            .await
            .unwrap();

        assert_eq!(profile.payout_onboarding_status, PayoutStatus::Complete);
        assert_eq!(
            store.find_by_account("acct_1").await.unwrap().unwrap().email,
            "creator@example.com"
        );
    }

    #[tokio::test]
    async fn test_verification_records_processor_ids() {
        let store = MemoryProfileStore::new();
        store.activate("creator@example.com").await.unwrap();

        store
            .apply_verification(
                "creator@example.com",
                &VerificationSnapshot {
                    status: VerificationStatus::Active,
                    tier: Some(VerificationTier::Blue),
                    current_period_end: None,
                    customer_id: Some("cus_1".into()),
                    subscription_id: Some("sub_1".into()),
                    observed_at: Utc::now(),
                    origin: SnapshotOrigin::Subscription,
                },
            )
            .await
            .unwrap();

        let found = store.find_by_subscription("sub_1").await.unwrap().unwrap();
        assert_eq!(found.verification.tier, Some(VerificationTier::Blue));
        assert!(store.find_by_customer("cus_1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_apply_to_missing_profile() {
        let store = MemoryProfileStore::new();
        let result = store
            .apply_payout("ghost@example.com", &payout(true, true, Utc::now()))
            .await;
        assert!(matches!(result, Err(PaymentError::ProfileNotFound(_))));
    }
}
