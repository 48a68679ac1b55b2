//! Target Counters
//!
//! Paid boost and spin totals per piece of content, bumped by confirmed
//! checkout payments. Increments are keyed by payment reference so a
//! redelivered payment never bumps a counter twice.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use tokio::sync::Mutex;

use crate::action::ActionKind;
use crate::error::{PaymentError, Result};

/// Counter values for one target
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetCounters {
    pub target_id: String,
    pub boosts: u64,
    pub spins: u64,
}

/// Target counter storage.
#[async_trait]
pub trait CounterStore: Send + Sync {
    async fn get(&self, target_id: &str) -> Result<TargetCounters>;

    /// Atomically add one to the `kind` counter unless `dedupe_key` was already applied
    async fn increment(
        &self,
        target_id: &str,
        kind: ActionKind,
        dedupe_key: &str,
    ) -> Result<TargetCounters>;
}

#[derive(Default)]
struct CounterTables {
    counters: HashMap<String, TargetCounters>,
    applied: HashSet<String>,
}

/// In-memory counter store (for development and tests)
#[derive(Default)]
pub struct MemoryCounterStore {
    tables: Mutex<CounterTables>,
}

impl MemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn get(&self, target_id: &str) -> Result<TargetCounters> {
        let tables = self.tables.lock().await;
        Ok(tables.counters.get(target_id).cloned().unwrap_or_else(|| TargetCounters {
            target_id: target_id.to_string(),
            ..Default::default()
        }))
    }

    async fn increment(
        &self,
        target_id: &str,
        kind: ActionKind,
        dedupe_key: &str,
    ) -> Result<TargetCounters> {
        if !matches!(kind, ActionKind::Boost | ActionKind::Spin) {
            return Err(PaymentError::Storage(format!("no target counter for {kind}")));
        }

        let mut tables = self.tables.lock().await;
        let fresh = tables.applied.insert(format!("{}:{dedupe_key}", kind.as_str()));

        let counters = tables
            .counters
            .entry(target_id.to_string())
            .or_insert_with(|| TargetCounters {
                target_id: target_id.to_string(),
                ..Default::default()
            });

        if fresh {
            if kind == ActionKind::Boost {
                counters.boosts += 1;
            } else {
                counters.spins += 1;
            }
        }

        Ok(counters.clone())
    }
}
