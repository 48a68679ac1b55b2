//! Credit Ledger
//!
//! Per-user balances of pre-purchased free actions. Balances only move
//! through two store primitives: an atomic decrement-where-positive (spend)
//! and a dedupe-keyed increment (grant, driven by confirmed payments).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::action::{ActionKind, CreditKind, Source};
use crate::error::{PaymentError, Result};
use crate::support::{NewEntry, SupportLedger, SupportLedgerEntry};

/// Credit balance for one user
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditBalance {
    pub email: String,
    pub tips: u32,
    pub boosts: u32,
    pub spins: u32,
}

impl CreditBalance {
    pub fn empty(email: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            ..Default::default()
        }
    }

    pub fn get(&self, kind: CreditKind) -> u32 {
        match kind {
            CreditKind::Tips => self.tips,
            CreditKind::Boosts => self.boosts,
            CreditKind::Spins => self.spins,
        }
    }

    fn counter_mut(&mut self, kind: CreditKind) -> &mut u32 {
        match kind {
            CreditKind::Tips => &mut self.tips,
            CreditKind::Boosts => &mut self.boosts,
            CreditKind::Spins => &mut self.spins,
        }
    }
}

/// Outcome of a grant
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Grant {
    pub balance: CreditBalance,
    /// False when the dedupe key had already been applied
    pub applied: bool,
}

/// Credit balance storage.
///
/// Each method must be a single atomic operation in the backing store.
#[async_trait]
pub trait CreditStore: Send + Sync {
    /// Current balance, zero for unknown users
    async fn get(&self, email: &str) -> Result<CreditBalance>;

    /// Decrement `kind` by one where it is > 0. `None` when nothing was decremented.
    async fn decrement_if_positive(
        &self,
        email: &str,
        kind: CreditKind,
    ) -> Result<Option<CreditBalance>>;

    /// Increment `kind` by `amount`, skipping keys that were already applied
    async fn increment(
        &self,
        email: &str,
        kind: CreditKind,
        amount: u32,
        dedupe_key: Option<&str>,
    ) -> Result<Grant>;
}

#[derive(Default)]
struct CreditTables {
    balances: HashMap<String, CreditBalance>,
    applied_grants: HashSet<String>,
}

/// In-memory credit store (for development and tests)
#[derive(Default)]
pub struct MemoryCreditStore {
    tables: Mutex<CreditTables>,
}

impl MemoryCreditStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CreditStore for MemoryCreditStore {
    async fn get(&self, email: &str) -> Result<CreditBalance> {
        let tables = self.tables.lock().await;
        Ok(tables
            .balances
            .get(email)
            .cloned()
            .unwrap_or_else(|| CreditBalance::empty(email)))
    }

    async fn decrement_if_positive(
        &self,
        email: &str,
        kind: CreditKind,
    ) -> Result<Option<CreditBalance>> {
        let mut tables = self.tables.lock().await;
        let Some(balance) = tables.balances.get_mut(email) else {
            return Ok(None);
        };

        let counter = balance.counter_mut(kind);
        if *counter == 0 {
            return Ok(None);
        }
        *counter -= 1;
        Ok(Some(balance.clone()))
    }

    async fn increment(
        &self,
        email: &str,
        kind: CreditKind,
        amount: u32,
        dedupe_key: Option<&str>,
    ) -> Result<Grant> {
        let mut tables = self.tables.lock().await;

        if let Some(key) = dedupe_key {
            if !tables.applied_grants.insert(key.to_string()) {
                let balance = tables
                    .balances
                    .get(email)
                    .cloned()
                    .unwrap_or_else(|| CreditBalance::empty(email));
                return Ok(Grant {
                    balance,
                    applied: false,
                });
            }
        }

        let balance = tables
            .balances
            .entry(email.to_string())
            .or_insert_with(|| CreditBalance::empty(email));
        let counter = balance.counter_mut(kind);
        *counter = counter.saturating_add(amount);

        Ok(Grant {
            balance: balance.clone(),
            applied: true,
        })
    }
}

/// A credit-funded action to be written to the support ledger
#[derive(Clone, Debug)]
pub struct CreditFundedAction {
    pub viewer_email: String,
    pub creator_email: String,
    pub kind: ActionKind,
    pub source: Source,
    pub target_id: String,
}

/// Credit ledger operations
#[derive(Clone)]
pub struct CreditLedger {
    store: Arc<dyn CreditStore>,
}

impl CreditLedger {
    pub fn new(store: Arc<dyn CreditStore>) -> Self {
        Self { store }
    }

    pub async fn balance(&self, email: &str) -> Result<CreditBalance> {
        self.store.get(email).await
    }

    /// Spend one credit of `kind`
    pub async fn spend(&self, email: &str, kind: CreditKind) -> Result<CreditBalance> {
        match self.store.decrement_if_positive(email, kind).await? {
            Some(balance) => {
                tracing::debug!(email = %email, kind = %kind, "Spent credit");
                Ok(balance)
            }
            None => {
                tracing::info!(email = %email, kind = %kind, "Insufficient credit");
                Err(PaymentError::InsufficientCredit {
                    email: email.to_string(),
                    kind: kind.to_string(),
                })
            }
        }
    }

    /// Spend the credit that funds `action`
    pub async fn spend_for(&self, email: &str, action: ActionKind) -> Result<CreditBalance> {
        self.spend(email, action.credit_kind()).await
    }

    /// Spend a credit and book the action in the support ledger.
    ///
    /// The credit is returned if the ledger refuses the entry (cap reached).
    pub async fn spend_and_record(
        &self,
        support: &SupportLedger,
        action: CreditFundedAction,
    ) -> Result<(CreditBalance, SupportLedgerEntry)> {
        let credit_kind = action.kind.credit_kind();
        let balance = self.spend(&action.viewer_email, credit_kind).await?;

        let entry = NewEntry::credit_funded(
            &action.creator_email,
            &action.viewer_email,
            action.kind,
            action.source,
            &action.target_id,
        );

        match support.record(entry).await {
            Ok(entry) => Ok((balance, entry)),
            Err(err) => {
                let refund_key = format!("refund:{}", uuid::Uuid::new_v4());
                self.grant(&action.viewer_email, credit_kind, 1, Some(&refund_key))
                    .await?;
                tracing::info!(
                    email = %action.viewer_email,
                    target_id = %action.target_id,
                    error = %err,
                    "Refunded credit after rejected ledger entry"
                );
                Err(err)
            }
        }
    }

    /// Add credits. Only the reconciler (and refunds) call this.
    pub(crate) async fn grant(
        &self,
        email: &str,
        kind: CreditKind,
        amount: u32,
        dedupe_key: Option<&str>,
    ) -> Result<Grant> {
        let grant = self.store.increment(email, kind, amount, dedupe_key).await?;
        if grant.applied {
            tracing::info!(email = %email, kind = %kind, amount, "Granted credits");
        } else {
            tracing::info!(
                email = %email,
                kind = %kind,
                dedupe_key = ?dedupe_key,
                "Grant already applied"
            );
        }
        Ok(grant)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::support::MemorySupportStore;

    fn ledger() -> (Arc<MemoryCreditStore>, CreditLedger) {
        let store = Arc::new(MemoryCreditStore::new());
        (store.clone(), CreditLedger::new(store))
    }

    #[tokio::test]
    async fn test_spend_with_zero_balance() {
        let (_, ledger) = ledger();
        let err = ledger.spend("viewer@example.com", CreditKind::Tips).await;
        assert!(matches!(err, Err(PaymentError::InsufficientCredit { .. })));

        let balance = ledger.balance("viewer@example.com").await.unwrap();
        assert_eq!(balance.tips, 0);
    }

    #[tokio::test]
    async fn test_grant_then_spend() {
        let (_, ledger) = ledger();
        ledger
            .grant("viewer@example.com", CreditKind::Boosts, 2, None)
            .await
            .unwrap();

        let balance = ledger
            .spend("viewer@example.com", CreditKind::Boosts)
            .await
            .unwrap();
        assert_eq!(balance.boosts, 1);
        assert_eq!(balance.tips, 0);
    }

    #[tokio::test]
    async fn test_dedupe_key_applies_once() {
        let (_, ledger) = ledger();
        let first = ledger
            .grant("viewer@example.com", CreditKind::Tips, 10, Some("evt_1"))
            .await
            .unwrap();
        let second = ledger
            .grant("viewer@example.com", CreditKind::Tips, 10, Some("evt_1"))
            .await
            .unwrap();

        assert!(first.applied);
        assert!(!second.applied);
        assert_eq!(second.balance.tips, 10);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_spends_never_overdraw() {
        let (_, ledger) = ledger();
        ledger
            .grant("viewer@example.com", CreditKind::Spins, 5, None)
            .await
            .unwrap();

        let mut handles = Vec::new();
        for _ in 0..32 {
            let ledger = ledger.clone();
            handles.push(tokio::spawn(async move {
                ledger.spend("viewer@example.com", CreditKind::Spins).await
            }));
        }

        let mut successes = 0;
        for handle in handles {
            if handle.await.unwrap().is_ok() {
                successes += 1;
            }
        }

        assert_eq!(successes, 5);
        let balance = ledger.balance("viewer@example.com").await.unwrap();
        assert_eq!(balance.spins, 0);
    }

    #[tokio::test]
    async fn test_reaction_without_credit_writes_nothing() {
        let (_, ledger) = ledger();
        let support_store = Arc::new(MemorySupportStore::new());
        let support = SupportLedger::new(support_store, 2000);

        let result = ledger
            .spend_and_record(
                &support,
                CreditFundedAction {
                    viewer_email: "viewer@example.com".into(),
                    creator_email: "creator@example.com".into(),
                    kind: ActionKind::Reaction,
                    source: Source::Feed,
                    target_id: "post123::🔥".into(),
                },
            )
            .await;

        assert!(matches!(result, Err(PaymentError::InsufficientCredit { .. })));
        assert!(support.entries_for("post123").await.unwrap().is_empty());
        assert_eq!(ledger.balance("viewer@example.com").await.unwrap().tips, 0);
    }

    #[tokio::test]
    async fn test_capped_spend_refunds_credit() {
        let (_, ledger) = ledger();
        let support = SupportLedger::new(Arc::new(MemorySupportStore::new()), 2000);
        ledger
            .grant("viewer@example.com", CreditKind::Tips, 15, None)
            .await
            .unwrap();

        let action = CreditFundedAction {
            viewer_email: "viewer@example.com".into(),
            creator_email: "creator@example.com".into(),
            kind: ActionKind::Reaction,
            source: Source::Live,
            target_id: "post123::👏".into(),
        };

        for _ in 0..10 {
            ledger
                .spend_and_record(&support, action.clone())
                .await
                .unwrap();
        }
        let result = ledger.spend_and_record(&support, action).await;

        assert!(matches!(result, Err(PaymentError::CapReached { cap: 10, .. })));
        assert_eq!(ledger.balance("viewer@example.com").await.unwrap().tips, 5);
    }
}
