//! Support Ledger
//!
//! Append-only audit trail of completed paid and credit-funded actions.
//! Entries are never updated or removed. Two constraints are enforced by the
//! store inside the same atomic append:
//!
//! - per-(viewer, base target, kind) caps for capped actions
//! - uniqueness of the payment reference carried by processor-funded entries

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::action::{ActionKind, Source, split_target};
use crate::error::{PaymentError, Result};

/// Bucket used by [`SupportLedger::aggregate`] for entries without a sub-key
pub const LEGACY_BUCKET: &str = "legacy";

/// Currency used for every priced action
pub const DEFAULT_CURRENCY: &str = "usd";

/// One completed action
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SupportLedgerEntry {
    pub id: String,
    pub creator_email: String,
    pub viewer_email: String,
    pub kind: ActionKind,
    pub source: Source,
    pub target_id: String,
    pub units: u32,
    pub currency: String,
    pub gross_cents: i64,
    pub creator_cents: i64,
    pub platform_cents: i64,
    /// Checkout payment reference; `None` for credit-funded entries
    pub payment_ref: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl SupportLedgerEntry {
    pub fn base_target(&self) -> &str {
        split_target(&self.target_id).0
    }
}

/// An entry about to be appended
#[derive(Clone, Debug)]
pub struct NewEntry {
    pub creator_email: String,
    pub viewer_email: String,
    pub kind: ActionKind,
    pub source: Source,
    pub target_id: String,
    pub units: u32,
    pub gross_cents: i64,
    pub payment_ref: Option<String>,
}

impl NewEntry {
    /// Entry paid with one pre-purchased credit
    pub fn credit_funded(
        creator_email: &str,
        viewer_email: &str,
        kind: ActionKind,
        source: Source,
        target_id: &str,
    ) -> Self {
        Self {
            creator_email: creator_email.to_string(),
            viewer_email: viewer_email.to_string(),
            kind,
            source,
            target_id: target_id.to_string(),
            units: 1,
            gross_cents: 0,
            payment_ref: None,
        }
    }
}

/// Result of a store append
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AppendOutcome {
    Appended(SupportLedgerEntry),
    /// An entry with the same payment reference already exists
    Duplicate(SupportLedgerEntry),
    CapReached,
}

/// Support ledger storage.
#[async_trait]
pub trait SupportStore: Send + Sync {
    /// Atomically append `entry` unless its payment reference exists or the
    /// viewer already has `cap` entries of the same kind on the base target.
    async fn append(&self, entry: SupportLedgerEntry, cap: Option<u32>) -> Result<AppendOutcome>;

    /// Entries of `kind` the viewer holds on the base target
    async fn count_for(&self, viewer_email: &str, base_target: &str, kind: ActionKind)
    -> Result<u32>;

    /// All entries whose base target equals `base_target`
    async fn entries_for_target(&self, base_target: &str) -> Result<Vec<SupportLedgerEntry>>;
}

/// In-memory support store (for development and tests)
#[derive(Default)]
pub struct MemorySupportStore {
    entries: RwLock<Vec<SupportLedgerEntry>>,
}

impl MemorySupportStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SupportStore for MemorySupportStore {
    async fn append(&self, entry: SupportLedgerEntry, cap: Option<u32>) -> Result<AppendOutcome> {
        let mut entries = self.entries.write().await;

        if let Some(payment_ref) = entry.payment_ref.as_deref() {
            if let Some(existing) = entries
                .iter()
                .find(|e| e.payment_ref.as_deref() == Some(payment_ref))
            {
                return Ok(AppendOutcome::Duplicate(existing.clone()));
            }
        }

        if let Some(cap) = cap {
            let base = entry.base_target();
            let prior = entries
                .iter()
                .filter(|e| {
                    e.viewer_email == entry.viewer_email
                        && e.kind == entry.kind
                        && e.base_target() == base
                })
                .count();
            if prior >= cap as usize {
                return Ok(AppendOutcome::CapReached);
            }
        }

        entries.push(entry.clone());
        Ok(AppendOutcome::Appended(entry))
    }

    async fn count_for(
        &self,
        viewer_email: &str,
        base_target: &str,
        kind: ActionKind,
    ) -> Result<u32> {
        let entries = self.entries.read().await;
        let count = entries
            .iter()
            .filter(|e| {
                e.viewer_email == viewer_email && e.kind == kind && e.base_target() == base_target
            })
            .count();
        Ok(u32::try_from(count).unwrap_or(u32::MAX))
    }

    async fn entries_for_target(&self, base_target: &str) -> Result<Vec<SupportLedgerEntry>> {
        let entries = self.entries.read().await;
        Ok(entries
            .iter()
            .filter(|e| e.base_target() == base_target)
            .cloned()
            .collect())
    }
}

/// Revenue split for a gross amount
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Split {
    pub creator_cents: i64,
    pub platform_cents: i64,
}

/// Split `gross_cents` with the platform taking `fee_bps` basis points, rounded down
pub fn split_revenue(gross_cents: i64, fee_bps: u32) -> Split {
    let platform_cents = gross_cents.max(0) * i64::from(fee_bps.min(10_000)) / 10_000;
    Split {
        creator_cents: gross_cents - platform_cents,
        platform_cents,
    }
}

/// Support ledger operations
#[derive(Clone)]
pub struct SupportLedger {
    store: Arc<dyn SupportStore>,
    platform_fee_bps: u32,
}

impl SupportLedger {
    pub fn new(store: Arc<dyn SupportStore>, platform_fee_bps: u32) -> Self {
        Self {
            store,
            platform_fee_bps,
        }
    }

    /// Append a completed action.
    ///
    /// A repeated payment reference returns the entry already on file.
    pub async fn record(&self, new: NewEntry) -> Result<SupportLedgerEntry> {
        let split = split_revenue(new.gross_cents, self.platform_fee_bps);
        let entry = SupportLedgerEntry {
            id: uuid::Uuid::new_v4().to_string(),
            creator_email: new.creator_email,
            viewer_email: new.viewer_email,
            kind: new.kind,
            source: new.source,
            target_id: new.target_id,
            units: new.units,
            currency: DEFAULT_CURRENCY.to_string(),
            gross_cents: new.gross_cents,
            creator_cents: split.creator_cents,
            platform_cents: split.platform_cents,
            payment_ref: new.payment_ref,
            created_at: Utc::now(),
        };

        let cap = entry.kind.cap();
        match self.store.append(entry.clone(), cap).await? {
            AppendOutcome::Appended(entry) => {
                tracing::info!(
                    entry_id = %entry.id,
                    kind = %entry.kind,
                    target_id = %entry.target_id,
                    viewer = %entry.viewer_email,
                    gross_cents = entry.gross_cents,
                    "Recorded support entry"
                );
                Ok(entry)
            }
            AppendOutcome::Duplicate(existing) => {
                tracing::info!(
                    entry_id = %existing.id,
                    payment_ref = ?existing.payment_ref,
                    "Payment already recorded"
                );
                Ok(existing)
            }
            AppendOutcome::CapReached => Err(PaymentError::CapReached {
                kind: entry.kind.to_string(),
                target_id: entry.target_id,
                cap: cap.unwrap_or_default(),
            }),
        }
    }

    /// Convenience wrapper matching the paid-action call shape
    pub async fn record_paid_action(
        &self,
        creator_email: &str,
        viewer_email: &str,
        kind: ActionKind,
        source: Source,
        target_id: &str,
        units: u32,
    ) -> Result<SupportLedgerEntry> {
        self.record(NewEntry {
            units,
            ..NewEntry::credit_funded(creator_email, viewer_email, kind, source, target_id)
        })
        .await
    }

    /// Fail with `CapReached` when the viewer has no allowance left for `kind`
    /// on the target. Advisory only: the append re-checks atomically.
    pub async fn ensure_within_cap(
        &self,
        viewer_email: &str,
        target_id: &str,
        kind: ActionKind,
    ) -> Result<()> {
        let Some(cap) = kind.cap() else {
            return Ok(());
        };
        let held = self
            .store
            .count_for(viewer_email, split_target(target_id).0, kind)
            .await?;
        if held >= cap {
            return Err(PaymentError::CapReached {
                kind: kind.to_string(),
                target_id: target_id.to_string(),
                cap,
            });
        }
        Ok(())
    }

    pub async fn entries_for(&self, target_id: &str) -> Result<Vec<SupportLedgerEntry>> {
        self.store.entries_for_target(split_target(target_id).0).await
    }

    /// Units of `kind` on `target_id`, bucketed by sub-key
    pub async fn aggregate(
        &self,
        target_id: &str,
        kind: ActionKind,
    ) -> Result<BTreeMap<String, u64>> {
        let mut buckets = BTreeMap::new();
        for entry in self.entries_for(target_id).await? {
            if entry.kind != kind {
                continue;
            }
            let bucket = split_target(&entry.target_id)
                .1
                .unwrap_or(LEGACY_BUCKET)
                .to_string();
            *buckets.entry(bucket).or_insert(0) += u64::from(entry.units);
        }
        Ok(buckets)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ledger() -> SupportLedger {
        SupportLedger::new(Arc::new(MemorySupportStore::new()), 2000)
    }

    fn paid(target: &str, kind: ActionKind, payment_ref: &str) -> NewEntry {
        NewEntry {
            gross_cents: 199,
            payment_ref: Some(payment_ref.into()),
            ..NewEntry::credit_funded(
                "creator@example.com",
                "viewer@example.com",
                kind,
                Source::Feed,
                target,
            )
        }
    }

    #[test]
    fn test_split_revenue() {
        let split = split_revenue(199, 2000);
        assert_eq!(split.platform_cents, 39);
        assert_eq!(split.creator_cents, 160);
        assert_eq!(split_revenue(0, 2000).platform_cents, 0);
    }

    #[tokio::test]
    async fn test_payment_ref_is_unique() {
        let ledger = ledger();
        let first = ledger.record(paid("post1", ActionKind::Tip, "ref-1")).await.unwrap();
        let second = ledger.record(paid("post1", ActionKind::Tip, "ref-1")).await.unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(ledger.entries_for("post1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_vote_cap() {
        let ledger = ledger();
        for i in 0..20 {
            ledger
                .record_paid_action(
                    "creator@example.com",
                    "viewer@example.com",
                    ActionKind::Vote,
                    Source::Live,
                    &format!("poll9::option{}", i % 3),
                    1,
                )
                .await
                .unwrap();
        }

        let err = ledger
            .record_paid_action(
                "creator@example.com",
                "viewer@example.com",
                ActionKind::Vote,
                Source::Live,
                "poll9::option0",
                1,
            )
            .await;
        assert!(matches!(err, Err(PaymentError::CapReached { cap: 20, .. })));

        // A different viewer has their own allowance
        ledger
            .record_paid_action(
                "creator@example.com",
                "other@example.com",
                ActionKind::Vote,
                Source::Live,
                "poll9::option0",
                1,
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_ensure_within_cap() {
        let ledger = ledger();
        for _ in 0..10 {
            ledger
                .ensure_within_cap("viewer@example.com", "post3::🔥", ActionKind::Reaction)
                .await
                .unwrap();
            ledger
                .record_paid_action(
                    "creator@example.com",
                    "viewer@example.com",
                    ActionKind::Reaction,
                    Source::Feed,
                    "post3::🔥",
                    1,
                )
                .await
                .unwrap();
        }

        // Switching sub-key does not reset the allowance
        let err = ledger
            .ensure_within_cap("viewer@example.com", "post3::😂", ActionKind::Reaction)
            .await;
        assert!(matches!(err, Err(PaymentError::CapReached { cap: 10, .. })));
        ledger
            .ensure_within_cap("viewer@example.com", "post3", ActionKind::Tip)
            .await
            .unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_cap_holds_under_concurrency() {
        let ledger = ledger();
        let mut handles = Vec::new();
        for _ in 0..40 {
            let ledger = ledger.clone();
            handles.push(tokio::spawn(async move {
                ledger
                    .record_paid_action(
                        "creator@example.com",
                        "viewer@example.com",
                        ActionKind::Reaction,
                        Source::Feed,
                        "post7::🔥",
                        1,
                    )
                    .await
            }));
        }

        let mut ok = 0;
        for handle in handles {
            if handle.await.unwrap().is_ok() {
                ok += 1;
            }
        }
        assert_eq!(ok, 10);
        assert_eq!(ledger.entries_for("post7").await.unwrap().len(), 10);
    }

    #[tokio::test]
    async fn test_aggregate_buckets_by_sub_key() {
        let ledger = ledger();
        for target in ["post5::🔥", "post5::🔥", "post5::😂", "post5"] {
            ledger
                .record_paid_action(
                    "creator@example.com",
                    "viewer@example.com",
                    ActionKind::Reaction,
                    Source::Feed,
                    target,
                    1,
                )
                .await
                .unwrap();
        }
        ledger.record(paid("post5", ActionKind::Tip, "ref-9")).await.unwrap();

        let counts = ledger.aggregate("post5", ActionKind::Reaction).await.unwrap();
        assert_eq!(counts.get("🔥"), Some(&2));
        assert_eq!(counts.get("😂"), Some(&1));
        assert_eq!(counts.get(LEGACY_BUCKET), Some(&1));
        assert_eq!(counts.len(), 3);
    }
}
