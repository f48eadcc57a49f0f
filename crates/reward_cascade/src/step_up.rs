use std::sync::Arc;

use reward_cascade_proto::{
    CascadeRepository, GlobalNumber, StepUpKey, StepUpPaymentRecord, StepUpTier, StoreError,
    WalletLedger, WalletType,
};
use serde::{Deserialize, Serialize};

use crate::locks::KeyedLocks;
use crate::util::now_unix_ms;
use crate::CascadeError;

/// Follow-up work run after each StepUp payment.
///
/// Implementations must be idempotent: a retried cascade calls them again for
/// payments that were recorded by an earlier, interrupted attempt.
pub trait StepUpPaymentListener: Send + Sync {
    fn on_step_up_payment(&self, payment: &StepUpPaymentRecord) -> Result<(), CascadeError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StepUpCascadeReport {
    pub trigger_global_number: GlobalNumber,
    pub paid: Vec<StepUpPaymentRecord>,
    pub already_paid: Vec<StepUpKey>,
    /// Tiers whose recipient number has not been issued yet.
    pub not_yet_eligible: Vec<StepUpKey>,
}

impl StepUpCascadeReport {
    pub fn total_paid(&self) -> u64 {
        self.paid.iter().map(|record| record.reward_points).sum()
    }
}

/// Tiers that `trigger` divides into, paired with their recipient number.
pub fn eligible_tiers(trigger: GlobalNumber, tiers: &[StepUpTier]) -> Vec<(StepUpTier, GlobalNumber)> {
    if trigger == 0 {
        return Vec::new();
    }
    tiers
        .iter()
        .filter(|tier| tier.multiplier > 1 && trigger % tier.multiplier == 0)
        .map(|tier| (*tier, trigger / tier.multiplier))
        .collect()
}

enum TierOutcome {
    Paid(StepUpPaymentRecord),
    AlreadyPaid(StepUpKey),
    NotYetEligible(StepUpKey),
}

/// Pays tiered bonuses to earlier Global Number holders when a new number is
/// issued.
pub struct StepUpCascadeEngine {
    repository: Arc<dyn CascadeRepository>,
    wallet: Arc<dyn WalletLedger>,
    tiers: Vec<StepUpTier>,
    payment_locks: KeyedLocks<GlobalNumber>,
    listeners: Vec<Arc<dyn StepUpPaymentListener>>,
}

impl StepUpCascadeEngine {
    pub fn new(
        repository: Arc<dyn CascadeRepository>,
        wallet: Arc<dyn WalletLedger>,
        tiers: Vec<StepUpTier>,
    ) -> Self {
        Self {
            repository,
            wallet,
            tiers,
            payment_locks: KeyedLocks::new(),
            listeners: Vec::new(),
        }
    }

    pub fn with_listener(mut self, listener: Arc<dyn StepUpPaymentListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    pub fn tiers(&self) -> &[StepUpTier] {
        &self.tiers
    }

    /// Runs the StepUp cascade for an issued Global Number. Safe to call more
    /// than once for the same number: paid keys are skipped, and listeners are
    /// re-run so follow-ups missed by an earlier failure complete.
    pub fn on_new_number(&self, trigger: GlobalNumber) -> Result<StepUpCascadeReport, CascadeError> {
        if self.repository.assignment(trigger)?.is_none() {
            return Err(CascadeError::InvalidEvent {
                reason: format!("global number {} has not been issued", trigger),
            });
        }

        let mut report = StepUpCascadeReport {
            trigger_global_number: trigger,
            ..StepUpCascadeReport::default()
        };
        for (tier, recipient) in eligible_tiers(trigger, &self.tiers) {
            let outcome = self
                .payment_locks
                .with_lock(&recipient, || self.settle_tier(tier, trigger, recipient))?;
            match outcome {
                TierOutcome::Paid(record) => report.paid.push(record),
                TierOutcome::AlreadyPaid(key) => report.already_paid.push(key),
                TierOutcome::NotYetEligible(key) => report.not_yet_eligible.push(key),
            }
        }
        Ok(report)
    }

    fn settle_tier(
        &self,
        tier: StepUpTier,
        trigger: GlobalNumber,
        recipient: GlobalNumber,
    ) -> Result<TierOutcome, CascadeError> {
        let key = StepUpKey {
            recipient_global_number: recipient,
            trigger_global_number: trigger,
            multiplier: tier.multiplier,
        };

        if let Some(existing) = self.repository.step_up_payment(&key)? {
            tracing::debug!(%key, "step-up already paid");
            self.notify(&existing)?;
            return Ok(TierOutcome::AlreadyPaid(key));
        }

        let Some(assignment) = self.repository.assignment(recipient)? else {
            tracing::debug!(%key, "step-up recipient not issued yet");
            return Ok(TierOutcome::NotYetEligible(key));
        };

        let record = StepUpPaymentRecord {
            recipient_global_number: recipient,
            recipient_customer_id: assignment.customer_id,
            trigger_global_number: trigger,
            multiplier: tier.multiplier,
            reward_points: tier.reward_points,
            paid: true,
            paid_at_unix_ms: now_unix_ms(),
        };
        let reason = format!("step-up {}", key);
        self.wallet.credit(
            &record.recipient_customer_id,
            WalletType::Income,
            record.reward_points,
            &reason,
        )?;
        if let Err(err) = self.repository.record_step_up_payment(record.clone()) {
            tracing::warn!(%key, error = %err, "reversing step-up credit");
            self.wallet
                .debit(
                    &record.recipient_customer_id,
                    WalletType::Income,
                    record.reward_points,
                    &format!("reversal of {}", reason),
                )
                .map_err(|debit_err| CascadeError::CompensationFailed {
                    reason: format!(
                        "step-up {} credited but not recorded ({}), reversal failed: {}",
                        key, err, debit_err
                    ),
                })?;
            // Another writer recorded the same key after our read.
            if matches!(err, StoreError::DuplicatePayment { .. }) {
                if let Some(existing) = self.repository.step_up_payment(&key)? {
                    tracing::debug!(%key, "step-up recorded concurrently");
                    self.notify(&existing)?;
                    return Ok(TierOutcome::AlreadyPaid(key));
                }
            }
            return Err(err.into());
        }
        tracing::info!(
            %key,
            recipient = %record.recipient_customer_id,
            reward_points = record.reward_points,
            "step-up paid"
        );

        self.notify(&record)?;
        Ok(TierOutcome::Paid(record))
    }

    fn notify(&self, payment: &StepUpPaymentRecord) -> Result<(), CascadeError> {
        for listener in &self.listeners {
            listener.on_step_up_payment(payment)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::InMemoryWalletLedger;
    use crate::config::DEFAULT_STEP_UP_TIERS;
    use reward_cascade_proto::{
        AssignmentRequest, CustomerState, GlobalNumberAssignment, RippleRewardRecord,
        VoucherDistribution,
    };
    use reward_cascade_store::CascadeStore;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    struct RecordingListener {
        seen: Mutex<Vec<StepUpKey>>,
    }

    impl StepUpPaymentListener for RecordingListener {
        fn on_step_up_payment(&self, payment: &StepUpPaymentRecord) -> Result<(), CascadeError> {
            self.seen.lock().expect("lock").push(payment.key());
            Ok(())
        }
    }

    fn seed(store: &CascadeStore, count: u64) {
        for number in 1..=count {
            store
                .assign_global_number(AssignmentRequest {
                    customer_id: format!("c-{number}"),
                    proposed: number,
                    points_at_assignment: 1_500,
                    earned_points: 1_500,
                    event_id: None,
                    assigned_at_unix_ms: 0,
                })
                .expect("seed assignment");
        }
    }

    /// Reports no payment on the first lookup, as if another writer recorded
    /// it right after the read.
    struct RacedRepository {
        inner: CascadeStore,
        hide_next_payment: AtomicBool,
    }

    impl CascadeRepository for RacedRepository {
        fn customer(&self, customer_id: &str) -> Result<Option<CustomerState>, StoreError> {
            self.inner.customer(customer_id)
        }
        fn customers(&self) -> Result<Vec<CustomerState>, StoreError> {
            self.inner.customers()
        }
        fn is_event_applied(&self, event_id: &str) -> Result<bool, StoreError> {
            self.inner.is_event_applied(event_id)
        }
        fn mark_event_applied(&self, event_id: &str) -> Result<bool, StoreError> {
            self.inner.mark_event_applied(event_id)
        }
        fn record_accumulation(
            &self,
            customer_id: &str,
            accumulated_points: u64,
            earned_points: u64,
            event_id: Option<&str>,
        ) -> Result<CustomerState, StoreError> {
            self.inner
                .record_accumulation(customer_id, accumulated_points, earned_points, event_id)
        }
        fn latest_global_number(&self) -> Result<GlobalNumber, StoreError> {
            self.inner.latest_global_number()
        }
        fn assign_global_number(
            &self,
            request: AssignmentRequest,
        ) -> Result<GlobalNumberAssignment, StoreError> {
            self.inner.assign_global_number(request)
        }
        fn settle_cascade(
            &self,
            customer_id: &str,
            global_number: GlobalNumber,
        ) -> Result<(), StoreError> {
            self.inner.settle_cascade(customer_id, global_number)
        }
        fn pending_cascades(&self) -> Result<Vec<GlobalNumberAssignment>, StoreError> {
            self.inner.pending_cascades()
        }
        fn assignment(
            &self,
            global_number: GlobalNumber,
        ) -> Result<Option<GlobalNumberAssignment>, StoreError> {
            self.inner.assignment(global_number)
        }
        fn assignments(&self) -> Result<Vec<GlobalNumberAssignment>, StoreError> {
            self.inner.assignments()
        }
        fn step_up_payment(
            &self,
            key: &StepUpKey,
        ) -> Result<Option<StepUpPaymentRecord>, StoreError> {
            if self.hide_next_payment.swap(false, Ordering::SeqCst) {
                return Ok(None);
            }
            self.inner.step_up_payment(key)
        }
        fn record_step_up_payment(&self, record: StepUpPaymentRecord) -> Result<u64, StoreError> {
            self.inner.record_step_up_payment(record)
        }
        fn step_up_payments(&self) -> Result<Vec<StepUpPaymentRecord>, StoreError> {
            self.inner.step_up_payments()
        }
        fn step_up_payments_for(
            &self,
            customer_id: &str,
        ) -> Result<Vec<StepUpPaymentRecord>, StoreError> {
            self.inner.step_up_payments_for(customer_id)
        }
        fn ripple_reward(&self, key: &StepUpKey) -> Result<Option<RippleRewardRecord>, StoreError> {
            self.inner.ripple_reward(key)
        }
        fn record_ripple_reward(&self, record: RippleRewardRecord) -> Result<(), StoreError> {
            self.inner.record_ripple_reward(record)
        }
        fn ripple_rewards(&self) -> Result<Vec<RippleRewardRecord>, StoreError> {
            self.inner.ripple_rewards()
        }
        fn ripple_rewards_for(
            &self,
            referrer_id: &str,
        ) -> Result<Vec<RippleRewardRecord>, StoreError> {
            self.inner.ripple_rewards_for(referrer_id)
        }
        fn issue_vouchers(
            &self,
            customer_id: &str,
            distributions: Vec<VoucherDistribution>,
        ) -> Result<bool, StoreError> {
            self.inner.issue_vouchers(customer_id, distributions)
        }
        fn voucher_distributions(&self) -> Result<Vec<VoucherDistribution>, StoreError> {
            self.inner.voucher_distributions()
        }
        fn voucher_distributions_for(
            &self,
            customer_id: &str,
        ) -> Result<Vec<VoucherDistribution>, StoreError> {
            self.inner.voucher_distributions_for(customer_id)
        }
    }

    fn engine(store: Arc<CascadeStore>, wallet: Arc<InMemoryWalletLedger>) -> StepUpCascadeEngine {
        StepUpCascadeEngine::new(store, wallet, DEFAULT_STEP_UP_TIERS.to_vec())
    }

    #[test]
    fn eligible_tiers_follow_divisibility() {
        let tiers = DEFAULT_STEP_UP_TIERS.to_vec();
        assert!(eligible_tiers(6, &tiers).is_empty());
        assert_eq!(
            eligible_tiers(50, &tiers)
                .into_iter()
                .map(|(tier, recipient)| (tier.multiplier, recipient))
                .collect::<Vec<_>>(),
            vec![(5, 10), (25, 2)]
        );
        assert_eq!(eligible_tiers(2_500, &tiers).len(), 5);
        assert!(eligible_tiers(0, &tiers).is_empty());
    }

    #[test]
    fn pays_income_wallet_of_divisor_holder() {
        let store = Arc::new(CascadeStore::in_memory());
        let wallet = Arc::new(InMemoryWalletLedger::new());
        seed(&store, 10);
        let engine = engine(store.clone(), wallet.clone());

        let report = engine.on_new_number(10).expect("cascade");
        assert_eq!(report.paid.len(), 1);
        assert_eq!(report.paid[0].recipient_customer_id, "c-2");
        assert_eq!(report.total_paid(), 500);
        assert_eq!(wallet.balance("c-2", WalletType::Income), Ok(500));
        assert_eq!(wallet.balance("c-2", WalletType::RewardPoints), Ok(0));
        let recipient = store.customer("c-2").expect("read").expect("customer");
        assert_eq!(recipient.lifetime_step_up_points, 500);
    }

    #[test]
    fn multiple_tiers_fire_independently() {
        let store = Arc::new(CascadeStore::in_memory());
        let wallet = Arc::new(InMemoryWalletLedger::new());
        seed(&store, 25);
        let engine = engine(store.clone(), wallet.clone());

        let report = engine.on_new_number(25).expect("cascade");
        assert_eq!(report.paid.len(), 2);
        assert_eq!(wallet.balance("c-5", WalletType::Income), Ok(500));
        assert_eq!(wallet.balance("c-1", WalletType::Income), Ok(1_500));
    }

    #[test]
    fn second_run_pays_nothing_and_reruns_listeners() {
        let store = Arc::new(CascadeStore::in_memory());
        let wallet = Arc::new(InMemoryWalletLedger::new());
        seed(&store, 5);
        let listener = Arc::new(RecordingListener {
            seen: Mutex::new(Vec::new()),
        });
        let engine = engine(store.clone(), wallet.clone()).with_listener(listener.clone());

        let first = engine.on_new_number(5).expect("first");
        let second = engine.on_new_number(5).expect("second");
        assert_eq!(first.paid.len(), 1);
        assert!(second.paid.is_empty());
        assert_eq!(second.already_paid, vec![first.paid[0].key()]);
        assert_eq!(wallet.balance("c-1", WalletType::Income), Ok(500));
        assert_eq!(store.step_up_payments().expect("list").len(), 1);
        assert_eq!(listener.seen.lock().expect("lock").len(), 2);
    }

    #[test]
    fn concurrently_recorded_payment_counts_as_already_paid() {
        let inner = CascadeStore::in_memory();
        seed(&inner, 5);
        let key = StepUpKey {
            recipient_global_number: 1,
            trigger_global_number: 5,
            multiplier: 5,
        };
        inner
            .record_step_up_payment(StepUpPaymentRecord {
                recipient_global_number: 1,
                recipient_customer_id: "c-1".to_string(),
                trigger_global_number: 5,
                multiplier: 5,
                reward_points: 500,
                paid: true,
                paid_at_unix_ms: 0,
            })
            .expect("other writer records first");
        let repository = Arc::new(RacedRepository {
            inner,
            hide_next_payment: AtomicBool::new(true),
        });
        let wallet = Arc::new(InMemoryWalletLedger::new());
        let listener = Arc::new(RecordingListener {
            seen: Mutex::new(Vec::new()),
        });
        let engine = StepUpCascadeEngine::new(
            repository.clone(),
            wallet.clone(),
            DEFAULT_STEP_UP_TIERS.to_vec(),
        )
        .with_listener(listener.clone());

        let report = engine.on_new_number(5).expect("duplicate is not an error");
        assert!(report.paid.is_empty());
        assert_eq!(report.already_paid, vec![key]);
        assert_eq!(wallet.balance("c-1", WalletType::Income), Ok(0));
        assert_eq!(wallet.entries().len(), 2);
        assert_eq!(*listener.seen.lock().expect("lock"), vec![key]);
        let recipient = repository.customer("c-1").expect("read").expect("customer");
        assert_eq!(recipient.lifetime_step_up_points, 500);
    }

    #[test]
    fn rejects_numbers_that_were_never_issued() {
        let store = Arc::new(CascadeStore::in_memory());
        let wallet = Arc::new(InMemoryWalletLedger::new());
        seed(&store, 3);
        let engine = engine(store, wallet.clone());
        assert!(matches!(
            engine.on_new_number(5),
            Err(CascadeError::InvalidEvent { .. })
        ));
        assert!(wallet.entries().is_empty());
    }
}
