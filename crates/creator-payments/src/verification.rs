//! Verification State Machine
//!
//! Subscription-backed badge state for creators. Only processor events move
//! it; every event carries a full snapshot of the subscription which replaces
//! the stored state when it is not older than what was last applied.
//!
//! ```text
//! none ──▶ pending ──▶ active(blue|gold) ──▶ past_due | canceled ──▶ none
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::str::FromStr;

use crate::error::{PaymentError, Result};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationStatus {
    #[default]
    None,
    Pending,
    Active,
    PastDue,
    Canceled,
}

impl VerificationStatus {
    /// Map a Stripe subscription status
    pub fn from_subscription_status(status: &str) -> Self {
        match status {
            "active" | "trialing" => VerificationStatus::Active,
            "past_due" | "unpaid" => VerificationStatus::PastDue,
            "canceled" | "incomplete_expired" => VerificationStatus::Canceled,
            "incomplete" | "paused" => VerificationStatus::Pending,
            _ => VerificationStatus::None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            VerificationStatus::None => "none",
            VerificationStatus::Pending => "pending",
            VerificationStatus::Active => "active",
            VerificationStatus::PastDue => "past_due",
            VerificationStatus::Canceled => "canceled",
        }
    }

    /// Lifecycle position used to order same-second snapshots
    fn rank(self) -> u8 {
        match self {
            VerificationStatus::None => 0,
            VerificationStatus::Pending => 1,
            VerificationStatus::Active => 2,
            VerificationStatus::PastDue => 3,
            VerificationStatus::Canceled => 4,
        }
    }

    /// Whether a badge tier may be attached in this status
    fn holds_tier(self) -> bool {
        !matches!(self, VerificationStatus::None | VerificationStatus::Canceled)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VerificationTier {
    Blue,
    Gold,
}

impl VerificationTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            VerificationTier::Blue => "blue",
            VerificationTier::Gold => "gold",
        }
    }
}

impl FromStr for VerificationTier {
    type Err = PaymentError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "blue" => Ok(VerificationTier::Blue),
            "gold" => Ok(VerificationTier::Gold),
            other => Err(PaymentError::WebhookParse(format!("unknown tier '{other}'"))),
        }
    }
}

/// Which kind of event produced a snapshot
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SnapshotOrigin {
    /// Checkout completion; only knows that a subscription was started
    Checkout,
    /// Subscription or invoice event carrying the processor's own status
    #[default]
    Subscription,
}

/// Subscription state reported by one processor event
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VerificationSnapshot {
    pub status: VerificationStatus,
    pub tier: Option<VerificationTier>,
    pub current_period_end: Option<DateTime<Utc>>,
    pub customer_id: Option<String>,
    pub subscription_id: Option<String>,
    /// Processor-side creation time of the event
    pub observed_at: DateTime<Utc>,
    pub origin: SnapshotOrigin,
}

/// Verification fields of a creator profile
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationState {
    pub status: VerificationStatus,
    pub tier: Option<VerificationTier>,
    pub current_period_end: Option<DateTime<Utc>>,
}

impl VerificationState {
    /// Whether `snapshot` should replace state last set at `applied_at`.
    ///
    /// A checkout completion never demotes a subscription already reported
    /// active or past due, whatever the timestamps: the processor routinely
    /// delivers it after the subscription events it caused. Otherwise older
    /// snapshots never apply, and on equal timestamps (one-second resolution)
    /// the status further along the lifecycle wins.
    pub fn accepts(
        &self,
        snapshot: &VerificationSnapshot,
        applied_at: Option<DateTime<Utc>>,
    ) -> bool {
        if snapshot.origin == SnapshotOrigin::Checkout
            && matches!(
                self.status,
                VerificationStatus::Active | VerificationStatus::PastDue
            )
        {
            return false;
        }

        let Some(applied_at) = applied_at else {
            return true;
        };
        match snapshot.observed_at.cmp(&applied_at) {
            Ordering::Greater => true,
            Ordering::Less => false,
            Ordering::Equal => snapshot.status.rank() >= self.status.rank(),
        }
    }

    /// Replace state with `snapshot`
    pub fn apply(&mut self, snapshot: &VerificationSnapshot) {
        self.status = snapshot.status;
        if snapshot.current_period_end.is_some() {
            self.current_period_end = snapshot.current_period_end;
        }
        if snapshot.tier.is_some() {
            self.tier = snapshot.tier;
        }
        if !self.status.holds_tier() {
            self.tier = None;
            self.current_period_end = None;
        }
    }

    pub fn is_verified(&self) -> bool {
        matches!(
            self.status,
            VerificationStatus::Active | VerificationStatus::PastDue
        ) && self.tier.is_some()
    }
}

/// Checkout-time policy: an active gold subscriber may not buy blue
pub fn ensure_tier_change_allowed(
    current: &VerificationState,
    requested: VerificationTier,
) -> Result<()> {
    match (current.status, current.tier) {
        (VerificationStatus::Active | VerificationStatus::PastDue, Some(tier))
            if requested < tier =>
        {
            Err(PaymentError::DowngradeRejected(format!(
                "{} is active, cannot start {}",
                tier.as_str(),
                requested.as_str()
            )))
        }
        _ => Ok(()),
    }
}
