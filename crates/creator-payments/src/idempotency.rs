//! Processed Webhook Events
//!
//! Event ids claimed by the reconciler. A claim is an atomic
//! insert-if-absent; a failed handler releases its claim so the processor's
//! redelivery can try again.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::Mutex;

use crate::error::Result;

#[async_trait]
pub trait ProcessedEventStore: Send + Sync {
    /// Claim `event_id`. `false` if it was already claimed.
    async fn claim(&self, event_id: &str) -> Result<bool>;

    /// Drop a claim after a failed handling attempt
    async fn release(&self, event_id: &str) -> Result<()>;
}

/// In-memory processed-event store (for development and tests)
#[derive(Default)]
pub struct MemoryEventStore {
    claimed: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl MemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ProcessedEventStore for MemoryEventStore {
    async fn claim(&self, event_id: &str) -> Result<bool> {
        let mut claimed = self.claimed.lock().await;
        if claimed.contains_key(event_id) {
            return Ok(false);
        }
        claimed.insert(event_id.to_string(), Utc::now());
        Ok(true)
    }

    async fn release(&self, event_id: &str) -> Result<()> {
        self.claimed.lock().await.remove(event_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_claim_once() {
        let store = MemoryEventStore::new();
        assert!(store.claim("evt_1").await.unwrap());
        assert!(!store.claim("evt_1").await.unwrap());

        store.release("evt_1").await.unwrap();
        assert!(store.claim("evt_1").await.unwrap());
    }
}
