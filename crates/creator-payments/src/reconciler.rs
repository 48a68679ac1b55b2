//! Webhook Reconciler
//!
//! Applies verified processor events to the credit ledger, the support
//! ledger, target counters and creator profiles.
//!
//! Delivery is at-least-once and unordered, so every event id is claimed
//! before handling and every mutation is idempotent on its own: grants and
//! counter bumps are keyed by payment reference, ledger entries are unique
//! per payment reference, and profile state is replaced by timestamped
//! snapshots that never regress.

use chrono::{DateTime, Utc};
use std::sync::Arc;

use crate::action::{ActionKind, CreditKind};
use crate::checkout::{CheckoutMetadata, CheckoutMode, PACK_SIZE};
use crate::counters::CounterStore;
use crate::credits::CreditLedger;
use crate::error::{PaymentError, Result};
use crate::idempotency::ProcessedEventStore;
use crate::payout::{PayoutSnapshot, PayoutStatus};
use crate::profiles::{CreatorProfile, ProfileStore};
use crate::support::{NewEntry, SupportLedger};
use crate::verification::{SnapshotOrigin, VerificationSnapshot, VerificationStatus};
use crate::webhook::{ProcessorEvent, WebhookEvent};

/// What a handled event changed
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReconcileOutcome {
    CreditsGranted {
        email: String,
        kind: CreditKind,
        amount: u32,
    },
    ActionRecorded {
        entry_id: String,
    },
    /// Paid action arrived after the viewer's cap filled up
    CapExceeded {
        payment_ref: String,
    },
    VerificationUpdated {
        email: String,
        status: VerificationStatus,
    },
    PayoutUpdated {
        email: String,
        status: PayoutStatus,
    },
    Ignored {
        event_type: String,
    },
}

/// Routes processor events into local state
pub struct Reconciler {
    credits: CreditLedger,
    support: SupportLedger,
    counters: Arc<dyn CounterStore>,
    profiles: Arc<dyn ProfileStore>,
    events: Arc<dyn ProcessedEventStore>,
}

impl Reconciler {
    pub fn new(
        credits: CreditLedger,
        support: SupportLedger,
        counters: Arc<dyn CounterStore>,
        profiles: Arc<dyn ProfileStore>,
        events: Arc<dyn ProcessedEventStore>,
    ) -> Self {
        Self {
            credits,
            support,
            counters,
            profiles,
            events,
        }
    }

    /// Process a verified event exactly once.
    ///
    /// A repeated event id yields [`PaymentError::DuplicateEvent`]. On
    /// failure the claim is released so a redelivery can retry.
    pub async fn dispatch(&self, event: &ProcessorEvent) -> Result<ReconcileOutcome> {
        if !self.events.claim(&event.id).await? {
            tracing::info!(
                event_id = %event.id,
                event_type = %event.event_type,
                "Duplicate webhook event"
            );
            return Err(PaymentError::DuplicateEvent(event.id.clone()));
        }

        tracing::info!(
            event_id = %event.id,
            event_type = %event.event_type,
            "Processing Stripe webhook"
        );

        match self.apply(event).await {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                tracing::error!(
                    event_id = %event.id,
                    event_type = %event.event_type,
                    error = %err,
                    "Webhook handling failed; releasing claim for redelivery"
                );
                if let Err(release_err) = self.events.release(&event.id).await {
                    tracing::error!(
                        event_id = %event.id,
                        error = %release_err,
                        "Failed to release event claim"
                    );
                }
                Err(err)
            }
        }
    }

    async fn apply(&self, event: &ProcessorEvent) -> Result<ReconcileOutcome> {
        let observed_at = event.created_at();

        match WebhookEvent::from_processor(event)? {
            WebhookEvent::CheckoutCompleted {
                session_id,
                metadata,
                customer_id,
                subscription_id,
                amount_total,
            } => {
                tracing::info!(
                    session_id = %session_id,
                    mode = metadata.mode.as_str(),
                    payment_ref = %metadata.payment_ref,
                    "Checkout session completed"
                );
                self.apply_checkout(
                    metadata,
                    customer_id,
                    subscription_id,
                    amount_total,
                    observed_at,
                )
                .await
            }

            WebhookEvent::CheckoutAwaitingPayment { session_id } => {
                tracing::info!(session_id = %session_id, "Checkout awaiting asynchronous payment");
                Ok(ReconcileOutcome::Ignored {
                    event_type: event.event_type.clone(),
                })
            }

            WebhookEvent::InvoicePaid {
                subscription_id,
                customer_id,
                creator_email,
                tier,
                period_end,
            } => {
                let profile = self
                    .resolve_subscriber(
                        creator_email.as_deref(),
                        subscription_id.as_deref(),
                        customer_id.as_deref(),
                    )
                    .await?;
                let snapshot = VerificationSnapshot {
                    status: VerificationStatus::Active,
                    tier,
                    current_period_end: period_end,
                    customer_id,
                    subscription_id,
                    observed_at,
                    origin: SnapshotOrigin::Subscription,
                };
                self.apply_verification(&profile.email, &snapshot).await
            }

            WebhookEvent::SubscriptionChanged {
                subscription_id,
                customer_id,
                creator_email,
                tier,
                status,
                current_period_end,
                deleted,
            } => {
                let profile = self
                    .resolve_subscriber(
                        creator_email.as_deref(),
                        Some(&subscription_id),
                        customer_id.as_deref(),
                    )
                    .await?;
                let status = if deleted {
                    VerificationStatus::Canceled
                } else {
                    VerificationStatus::from_subscription_status(&status)
                };
                let snapshot = VerificationSnapshot {
                    status,
                    tier,
                    current_period_end,
                    customer_id,
                    subscription_id: Some(subscription_id),
                    observed_at,
                    origin: SnapshotOrigin::Subscription,
                };
                self.apply_verification(&profile.email, &snapshot).await
            }

            WebhookEvent::AccountUpdated {
                account_id,
                creator_email,
                charges_enabled,
                payouts_enabled,
            } => {
                let email = match self.profiles.find_by_account(&account_id).await? {
                    Some(profile) => profile.email,
                    None => creator_email
                        .ok_or_else(|| PaymentError::ProfileNotFound(account_id.clone()))?,
                };
                let snapshot = PayoutSnapshot {
                    account_id,
                    charges_enabled,
                    payouts_enabled,
                    observed_at,
                };
                let profile = self.profiles.apply_payout(&email, &snapshot).await?;
                tracing::info!(
                    email = %email,
                    account_id = %snapshot.account_id,
                    status = ?profile.payout_onboarding_status,
                    "Payout account updated"
                );
                Ok(ReconcileOutcome::PayoutUpdated {
                    email,
                    status: profile.payout_onboarding_status,
                })
            }

            WebhookEvent::Other { event_type } => {
                tracing::debug!(event_type = %event_type, "Unhandled webhook event");
                Ok(ReconcileOutcome::Ignored { event_type })
            }
        }
    }

    async fn apply_checkout(
        &self,
        metadata: CheckoutMetadata,
        customer_id: Option<String>,
        subscription_id: Option<String>,
        amount_total: Option<i64>,
        observed_at: DateTime<Utc>,
    ) -> Result<ReconcileOutcome> {
        match metadata.mode {
            CheckoutMode::Pack(kind) => {
                let dedupe_key = format!("pack:{}", metadata.payment_ref);
                self.credits
                    .grant(&metadata.viewer_email, kind, PACK_SIZE, Some(&dedupe_key))
                    .await?;
                Ok(ReconcileOutcome::CreditsGranted {
                    email: metadata.viewer_email,
                    kind,
                    amount: PACK_SIZE,
                })
            }

            CheckoutMode::Single(kind) => {
                let entry = NewEntry {
                    creator_email: metadata.creator_email,
                    viewer_email: metadata.viewer_email,
                    kind,
                    source: metadata.source,
                    target_id: metadata.target_id.clone(),
                    units: 1,
                    gross_cents: amount_total.unwrap_or(metadata.amount_cents),
                    payment_ref: Some(metadata.payment_ref.clone()),
                };

                let entry = match self.support.record(entry).await {
                    Ok(entry) => entry,
                    Err(PaymentError::CapReached { target_id, cap, .. }) => {
                        // Retrying cannot succeed; the payment needs a manual refund
                        tracing::warn!(
                            payment_ref = %metadata.payment_ref,
                            target_id = %target_id,
                            cap,
                            "Paid action exceeds viewer cap, not recorded"
                        );
                        return Ok(ReconcileOutcome::CapExceeded {
                            payment_ref: metadata.payment_ref,
                        });
                    }
                    Err(err) => return Err(err),
                };

                if matches!(kind, ActionKind::Boost | ActionKind::Spin) {
                    let counters = self
                        .counters
                        .increment(&metadata.target_id, kind, &metadata.payment_ref)
                        .await?;
                    tracing::info!(
                        target_id = %counters.target_id,
                        boosts = counters.boosts,
                        spins = counters.spins,
                        "Target counters updated"
                    );
                }

                Ok(ReconcileOutcome::ActionRecorded { entry_id: entry.id })
            }

            CheckoutMode::Verification(tier) => {
                let snapshot = VerificationSnapshot {
                    status: VerificationStatus::Pending,
                    tier: Some(tier),
                    current_period_end: None,
                    customer_id,
                    subscription_id,
                    observed_at,
                    origin: SnapshotOrigin::Checkout,
                };
                self.apply_verification(&metadata.creator_email, &snapshot).await
            }
        }
    }

    async fn apply_verification(
        &self,
        email: &str,
        snapshot: &VerificationSnapshot,
    ) -> Result<ReconcileOutcome> {
        let profile = self.profiles.apply_verification(email, snapshot).await?;
        tracing::info!(
            email = %email,
            status = profile.verification.status.as_str(),
            tier = ?profile.verification.tier,
            "Verification updated"
        );
        Ok(ReconcileOutcome::VerificationUpdated {
            email: email.to_string(),
            status: profile.verification.status,
        })
    }

    /// Find the creator a subscription belongs to
    async fn resolve_subscriber(
        &self,
        creator_email: Option<&str>,
        subscription_id: Option<&str>,
        customer_id: Option<&str>,
    ) -> Result<CreatorProfile> {
        if let Some(email) = creator_email {
            if let Some(profile) = self.profiles.get(email).await? {
                return Ok(profile);
            }
        }
        if let Some(subscription_id) = subscription_id {
            if let Some(profile) = self.profiles.find_by_subscription(subscription_id).await? {
                return Ok(profile);
            }
        }
        if let Some(customer_id) = customer_id {
            if let Some(profile) = self.profiles.find_by_customer(customer_id).await? {
                return Ok(profile);
            }
        }

        Err(PaymentError::ProfileNotFound(
            creator_email
                .or(subscription_id)
                .or(customer_id)
                .unwrap_or("unknown subscriber")
                .to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::Source;
    use crate::counters::MemoryCounterStore;
    use crate::credits::MemoryCreditStore;
    use crate::idempotency::MemoryEventStore;
    use crate::profiles::MemoryProfileStore;
    use crate::support::MemorySupportStore;
    use crate::verification::VerificationTier;
    use serde_json::{Value, json};

    struct Harness {
        reconciler: Reconciler,
        credits: CreditLedger,
        support: SupportLedger,
        counters: Arc<MemoryCounterStore>,
        profiles: Arc<MemoryProfileStore>,
    }

    fn harness() -> Harness {
        let credits = CreditLedger::new(Arc::new(MemoryCreditStore::new()));
        let support = SupportLedger::new(Arc::new(MemorySupportStore::new()), 2000);
        let counters = Arc::new(MemoryCounterStore::new());
        let profiles = Arc::new(MemoryProfileStore::new());
        let reconciler = Reconciler::new(
            credits.clone(),
            support.clone(),
            counters.clone(),
            profiles.clone(),
            Arc::new(MemoryEventStore::new()),
        );
        Harness {
            reconciler,
            credits,
            support,
            counters,
            profiles,
        }
    }

    fn event(id: &str, event_type: &str, created: i64, object: Value) -> ProcessorEvent {
        serde_json::from_value(json!({
            "id": id,
            "type": event_type,
            "created": created,
            "data": { "object": object }
        }))
        .unwrap()
    }

    fn checkout(id: &str, mode: CheckoutMode, target: &str, payment_ref: &str) -> ProcessorEvent {
        let metadata = CheckoutMetadata {
            mode,
            source: Source::Feed,
            target_id: target.into(),
            creator_email: "creator@example.com".into(),
            viewer_email: "viewer@example.com".into(),
            payment_ref: payment_ref.into(),
            amount_cents: mode.price().cents,
        };
        let subscription = match mode {
            CheckoutMode::Verification(_) => json!("sub_1"),
            _ => Value::Null,
        };
        event(
            id,
            "checkout.session.completed",
            1_700_000_000,
            json!({
                "id": format!("cs_{id}"),
                "customer": "cus_1",
                "subscription": subscription,
                "amount_total": mode.price().cents,
                "payment_status": "paid",
                "metadata": metadata.to_map(),
            }),
        )
    }

    fn subscription(id: &str, created: i64, status: &str, deleted: bool) -> ProcessorEvent {
        event(
            id,
            if deleted {
                "customer.subscription.deleted"
            } else {
                "customer.subscription.updated"
            },
            created,
            json!({
                "id": "sub_1",
                "customer": "cus_1",
                "status": status,
                "current_period_end": created + 2_592_000,
                "metadata": { "creator_email": "creator@example.com", "tier": "gold" }
            }),
        )
    }

    #[tokio::test]
    async fn test_tip_pack_grants_ten_once() {
        let h = harness();
        let evt = checkout("evt_1", CheckoutMode::Pack(CreditKind::Tips), "", "ref-1");

        h.reconciler.dispatch(&evt).await.unwrap();
        let replay = h.reconciler.dispatch(&evt).await;

        assert!(matches!(replay, Err(PaymentError::DuplicateEvent(_))));
        assert_eq!(h.credits.balance("viewer@example.com").await.unwrap().tips, 10);
    }

    #[tokio::test]
    async fn test_same_payment_under_new_event_id_grants_once() {
        let h = harness();
        h.reconciler
            .dispatch(&checkout("evt_1", CheckoutMode::Pack(CreditKind::Spins), "", "ref-1"))
            .await
            .unwrap();
        h.reconciler
            .dispatch(&checkout("evt_2", CheckoutMode::Pack(CreditKind::Spins), "", "ref-1"))
            .await
            .unwrap();

        assert_eq!(h.credits.balance("viewer@example.com").await.unwrap().spins, 10);
    }

    #[tokio::test]
    async fn test_tip_pack_unaffected_by_unrelated_events() {
        let h = harness();
        h.profiles.activate("creator@example.com").await.unwrap();

        h.reconciler
            .dispatch(&subscription("evt_9", 1_700_000_500, "active", false))
            .await
            .unwrap();
        h.reconciler
            .dispatch(&event("evt_8", "charge.refunded", 1_700_000_100, json!({})))
            .await
            .unwrap();
        h.reconciler
            .dispatch(&checkout("evt_1", CheckoutMode::Pack(CreditKind::Tips), "", "ref-1"))
            .await
            .unwrap();

        let balance = h.credits.balance("viewer@example.com").await.unwrap();
        assert_eq!(balance.tips, 10);
        assert_eq!(balance.boosts, 0);
    }

    #[tokio::test]
    async fn test_boost_checkout_bumps_counter_and_ledger() {
        let h = harness();
        let outcome = h
            .reconciler
            .dispatch(&checkout(
                "evt_1",
                CheckoutMode::Single(ActionKind::Boost),
                "post123",
                "ref-7",
            ))
            .await
            .unwrap();
        assert!(matches!(outcome, ReconcileOutcome::ActionRecorded { .. }));

        assert_eq!(h.counters.get("post123").await.unwrap().boosts, 1);
        let entries = h.support.entries_for("post123").await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].kind, ActionKind::Boost);
        assert_eq!(entries[0].units, 1);
        assert_eq!(entries[0].gross_cents, 200);
        assert_eq!(entries[0].creator_cents + entries[0].platform_cents, 200);
    }

    #[tokio::test]
    async fn test_paid_reaction_over_cap_is_acknowledged() {
        let h = harness();
        for i in 0..10 {
            h.support
                .record_paid_action(
                    "creator@example.com",
                    "viewer@example.com",
                    ActionKind::Reaction,
                    Source::Feed,
                    "post1::🔥",
                    1,
                )
                .await
                .unwrap_or_else(|e| panic!("entry {i}: {e}"));
        }

        let outcome = h
            .reconciler
            .dispatch(&checkout(
                "evt_1",
                CheckoutMode::Single(ActionKind::Reaction),
                "post1::🔥",
                "ref-1",
            ))
            .await
            .unwrap();
        assert!(matches!(outcome, ReconcileOutcome::CapExceeded { .. }));
        assert_eq!(h.support.entries_for("post1").await.unwrap().len(), 10);
    }

    #[tokio::test]
    async fn test_verification_lifecycle() {
        let h = harness();
        h.profiles.activate("creator@example.com").await.unwrap();

        h.reconciler
            .dispatch(&checkout(
                "evt_1",
                CheckoutMode::Verification(VerificationTier::Gold),
                "",
                "ref-1",
            ))
            .await
            .unwrap();
        let profile = h.profiles.get("creator@example.com").await.unwrap().unwrap();
        assert_eq!(profile.verification.status, VerificationStatus::Pending);
        assert_eq!(profile.processor_subscription_id.as_deref(), Some("sub_1"));

        h.reconciler
            .dispatch(&subscription("evt_2", 1_700_000_010, "active", false))
            .await
            .unwrap();
        let profile = h.profiles.get("creator@example.com").await.unwrap().unwrap();
        assert_eq!(profile.verification.status, VerificationStatus::Active);
        assert_eq!(profile.verification.tier, Some(VerificationTier::Gold));

        h.reconciler
            .dispatch(&subscription("evt_3", 1_700_000_020, "canceled", true))
            .await
            .unwrap();
        let profile = h.profiles.get("creator@example.com").await.unwrap().unwrap();
        assert_eq!(profile.verification.status, VerificationStatus::Canceled);
        assert_eq!(profile.verification.tier, None);
    }

    #[tokio::test]
    async fn test_out_of_order_subscription_events() {
        let h = harness();
        h.profiles.activate("creator@example.com").await.unwrap();

        h.reconciler
            .dispatch(&subscription("evt_3", 1_700_000_020, "canceled", true))
            .await
            .unwrap();
        h.reconciler
            .dispatch(&subscription("evt_2", 1_700_000_010, "active", false))
            .await
            .unwrap();

        let profile = h.profiles.get("creator@example.com").await.unwrap().unwrap();
        assert_eq!(profile.verification.status, VerificationStatus::Canceled);
        assert_ne!(profile.verification.tier, Some(VerificationTier::Gold));
    }

    #[tokio::test]
    async fn test_late_checkout_keeps_active_subscription() {
        let h = harness();
        h.profiles.activate("creator@example.com").await.unwrap();

        h.reconciler
            .dispatch(&subscription("evt_1", 1_699_999_990, "active", false))
            .await
            .unwrap();
        h.reconciler
            .dispatch(&checkout(
                "evt_2",
                CheckoutMode::Verification(VerificationTier::Gold),
                "",
                "ref-1",
            ))
            .await
            .unwrap();

        let profile = h.profiles.get("creator@example.com").await.unwrap().unwrap();
        assert_eq!(profile.verification.status, VerificationStatus::Active);
        assert_eq!(profile.verification.tier, Some(VerificationTier::Gold));
        assert!(profile.verification.is_verified());
    }

    #[tokio::test]
    async fn test_same_second_delete_then_update_stays_canceled() {
        let h = harness();
        h.profiles.activate("creator@example.com").await.unwrap();

        h.reconciler
            .dispatch(&subscription("evt_1", 1_700_000_000, "active", false))
            .await
            .unwrap();
        h.reconciler
            .dispatch(&subscription("evt_3", 1_700_000_020, "canceled", true))
            .await
            .unwrap();
        h.reconciler
            .dispatch(&subscription("evt_2", 1_700_000_020, "active", false))
            .await
            .unwrap();

        let profile = h.profiles.get("creator@example.com").await.unwrap().unwrap();
        assert_eq!(profile.verification.status, VerificationStatus::Canceled);
        assert_eq!(profile.verification.tier, None);
        assert!(!profile.verification.is_verified());
    }

    #[tokio::test]
    async fn test_invoice_paid_resolves_by_subscription() {
        let h = harness();
        h.profiles.activate("creator@example.com").await.unwrap();
        h.reconciler
            .dispatch(&checkout(
                "evt_1",
                CheckoutMode::Verification(VerificationTier::Blue),
                "",
                "ref-1",
            ))
            .await
            .unwrap();

        h.reconciler
            .dispatch(&event(
                "evt_2",
                "invoice.paid",
                1_700_000_030,
                json!({
                    "customer": "cus_1",
                    "subscription": "sub_1",
                    "lines": { "data": [ { "period": { "end": 1_702_592_000 } } ] }
                }),
            ))
            .await
            .unwrap();

        let profile = h.profiles.get("creator@example.com").await.unwrap().unwrap();
        assert_eq!(profile.verification.status, VerificationStatus::Active);
        assert_eq!(profile.verification.tier, Some(VerificationTier::Blue));
        assert_eq!(
            profile.verification.current_period_end,
            DateTime::from_timestamp(1_702_592_000, 0)
        );
    }

    #[tokio::test]
    async fn test_account_updated_snapshot() {
        let h = harness();
        h.profiles.activate("creator@example.com").await.unwrap();

        let account = |id: &str, created: i64, charges: bool, payouts: bool| {
            event(
                id,
                "account.updated",
                created,
                json!({
                    "id": "acct_1",
                    "email": "creator@example.com",
                    "charges_enabled": charges,
                    "payouts_enabled": payouts
                }),
            )
        };

        h.reconciler.dispatch(&account("evt_1", 100, true, false)).await.unwrap();
        let profile = h.profiles.get("creator@example.com").await.unwrap().unwrap();
        assert_eq!(profile.payout_onboarding_status, PayoutStatus::Pending);

        h.reconciler.dispatch(&account("evt_3", 300, true, true)).await.unwrap();
        h.reconciler.dispatch(&account("evt_2", 200, false, false)).await.unwrap();
        let profile = h.profiles.get("creator@example.com").await.unwrap().unwrap();
        assert_eq!(profile.payout_onboarding_status, PayoutStatus::Complete);
        assert!(profile.charges_enabled && profile.payouts_enabled);
    }

    #[tokio::test]
    async fn test_failure_releases_claim() {
        let h = harness();
        let evt = subscription("evt_1", 1_700_000_000, "active", false);

        let first = h.reconciler.dispatch(&evt).await;
        assert!(matches!(first, Err(PaymentError::ProfileNotFound(_))));

        h.profiles.activate("creator@example.com").await.unwrap();
        let retry = h.reconciler.dispatch(&evt).await.unwrap();
        assert_eq!(
            retry,
            ReconcileOutcome::VerificationUpdated {
                email: "creator@example.com".into(),
                status: VerificationStatus::Active,
            }
        );
    }
}
