use std::sync::Arc;

use reward_cascade_proto::{
    CascadeRepository, CustomerState, GlobalNumber, GlobalNumberAssignment, PointsEarnedEvent,
    WalletLedger, WalletType,
};
use serde::{Deserialize, Serialize};

use crate::config::CascadeConfig;
use crate::locks::KeyedLocks;
use crate::registry::GlobalNumberRegistry;
use crate::step_up::{StepUpCascadeEngine, StepUpCascadeReport};
use crate::CascadeError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PointsOutcome {
    /// Reward points landed in the RewardPoints wallet and nothing else moved.
    RewardPointsCredited { customer_id: String, points: u64 },
    /// The event id had been applied before.
    Duplicate { event_id: String },
    Accumulated {
        customer_id: String,
        accumulated_points: u64,
        remaining_to_threshold: u64,
    },
    /// The customer already holds a number; only the lifetime total moved.
    AlreadyNumbered {
        customer_id: String,
        global_number: GlobalNumber,
    },
    Assigned {
        assignment: GlobalNumberAssignment,
        cascade: StepUpCascadeReport,
    },
}

/// Result of the repository commit for one event, before any cascade runs.
enum Committed {
    Accumulated(CustomerState),
    AlreadyNumbered(CustomerState, GlobalNumber),
    Assigned(GlobalNumberAssignment),
}

/// Tracks each customer's progress towards the threshold and triggers the
/// Global Number assignment when it is reached.
pub struct PointAccumulator {
    repository: Arc<dyn CascadeRepository>,
    wallet: Arc<dyn WalletLedger>,
    registry: Arc<GlobalNumberRegistry>,
    step_up: Arc<StepUpCascadeEngine>,
    threshold_points: u64,
    reward_points_count_toward_threshold: bool,
    customer_locks: KeyedLocks<String>,
}

impl PointAccumulator {
    pub fn new(
        repository: Arc<dyn CascadeRepository>,
        wallet: Arc<dyn WalletLedger>,
        registry: Arc<GlobalNumberRegistry>,
        step_up: Arc<StepUpCascadeEngine>,
        config: &CascadeConfig,
    ) -> Self {
        Self {
            repository,
            wallet,
            registry,
            step_up,
            threshold_points: config.threshold_points,
            reward_points_count_toward_threshold: config.reward_points_count_toward_threshold,
            customer_locks: KeyedLocks::new(),
        }
    }

    pub fn threshold_points(&self) -> u64 {
        self.threshold_points
    }

    /// Applies one points event. Events of the same customer are serialized;
    /// different customers run in parallel.
    pub fn on_points_earned(
        &self,
        event: &PointsEarnedEvent,
    ) -> Result<PointsOutcome, CascadeError> {
        validate_event(event)?;
        self.customer_locks
            .with_lock(&event.customer_id, || self.apply_locked(event))
    }

    /// Completes the customer's unsettled cascade, if any.
    pub fn resume_pending(
        &self,
        customer_id: &str,
    ) -> Result<Option<StepUpCascadeReport>, CascadeError> {
        self.customer_locks
            .with_lock(&customer_id.to_string(), || {
                let pending = self
                    .repository
                    .customer(customer_id)?
                    .and_then(|customer| customer.pending_cascade);
                match pending {
                    Some(global_number) => self
                        .complete_cascade(customer_id, global_number)
                        .map(Some),
                    None => Ok(None),
                }
            })
    }

    fn apply_locked(&self, event: &PointsEarnedEvent) -> Result<PointsOutcome, CascadeError> {
        let customer = self.repository.customer(&event.customer_id)?;
        if let Some(global_number) = customer
            .as_ref()
            .and_then(|customer| customer.pending_cascade)
        {
            tracing::info!(
                customer_id = %event.customer_id,
                global_number,
                "resuming unsettled cascade"
            );
            self.complete_cascade(&event.customer_id, global_number)?;
        }

        if let Some(event_id) = event.event_id.as_deref() {
            if self.repository.is_event_applied(event_id)? {
                tracing::debug!(event_id, "points event already applied");
                return Ok(PointsOutcome::Duplicate {
                    event_id: event_id.to_string(),
                });
            }
        }

        if event.is_reward_points {
            let reason = reward_credit_reason(event);
            self.wallet.credit(
                &event.customer_id,
                WalletType::RewardPoints,
                event.points,
                &reason,
            )?;
            if !self.reward_points_count_toward_threshold {
                if let Some(event_id) = event.event_id.as_deref() {
                    if let Err(err) = self.repository.mark_event_applied(event_id) {
                        self.reverse_reward_credit(event, &reason, &err.to_string())?;
                        return Err(err.into());
                    }
                }
                return Ok(PointsOutcome::RewardPointsCredited {
                    customer_id: event.customer_id.clone(),
                    points: event.points,
                });
            }
            return match self.commit(customer.as_ref(), event) {
                Ok(committed) => self.finish(committed),
                Err(err) => {
                    self.reverse_reward_credit(event, &reason, &err.to_string())?;
                    Err(err)
                }
            };
        }

        let committed = self.commit(customer.as_ref(), event)?;
        self.finish(committed)
    }

    fn commit(
        &self,
        customer: Option<&CustomerState>,
        event: &PointsEarnedEvent,
    ) -> Result<Committed, CascadeError> {
        let event_id = event.event_id.as_deref();
        if let Some((current, global_number)) =
            customer.and_then(|state| state.global_number.map(|number| (state, number)))
        {
            let updated = self.repository.record_accumulation(
                &event.customer_id,
                current.accumulated_points,
                event.points,
                event_id,
            )?;
            return Ok(Committed::AlreadyNumbered(updated, global_number));
        }

        let accumulated = customer.map_or(0, |state| state.accumulated_points);
        let total = accumulated.saturating_add(event.points);
        if total < self.threshold_points {
            let updated = self.repository.record_accumulation(
                &event.customer_id,
                total,
                event.points,
                event_id,
            )?;
            return Ok(Committed::Accumulated(updated));
        }

        if total > self.threshold_points {
            tracing::debug!(
                customer_id = %event.customer_id,
                discarded = total - self.threshold_points,
                "points above threshold discarded"
            );
        }
        let assignment = self
            .registry
            .assign(&event.customer_id, total, event.points, event_id)?;
        Ok(Committed::Assigned(assignment))
    }

    fn finish(&self, committed: Committed) -> Result<PointsOutcome, CascadeError> {
        match committed {
            Committed::Accumulated(customer) => Ok(PointsOutcome::Accumulated {
                remaining_to_threshold: self
                    .threshold_points
                    .saturating_sub(customer.accumulated_points),
                accumulated_points: customer.accumulated_points,
                customer_id: customer.customer_id,
            }),
            Committed::AlreadyNumbered(customer, global_number) => {
                Ok(PointsOutcome::AlreadyNumbered {
                    customer_id: customer.customer_id,
                    global_number,
                })
            }
            Committed::Assigned(assignment) => {
                match self.complete_cascade(&assignment.customer_id, assignment.global_number) {
                    Ok(cascade) => Ok(PointsOutcome::Assigned {
                        assignment,
                        cascade,
                    }),
                    // The event is already committed; resending it would apply it twice.
                    Err(err) => {
                        tracing::warn!(
                            customer_id = %assignment.customer_id,
                            global_number = assignment.global_number,
                            error = %err,
                            "cascade left pending"
                        );
                        Err(CascadeError::CascadePending {
                            global_number: assignment.global_number,
                            reason: err.to_string(),
                        })
                    }
                }
            }
        }
    }

    fn complete_cascade(
        &self,
        customer_id: &str,
        global_number: GlobalNumber,
    ) -> Result<StepUpCascadeReport, CascadeError> {
        let report = self.step_up.on_new_number(global_number)?;
        self.repository.settle_cascade(customer_id, global_number)?;
        Ok(report)
    }

    fn reverse_reward_credit(
        &self,
        event: &PointsEarnedEvent,
        reason: &str,
        cause: &str,
    ) -> Result<(), CascadeError> {
        tracing::warn!(customer_id = %event.customer_id, cause, "reversing reward points credit");
        self.wallet
            .debit(
                &event.customer_id,
                WalletType::RewardPoints,
                event.points,
                &format!("reversal of {}", reason),
            )
            .map_err(|debit_err| CascadeError::CompensationFailed {
                reason: format!(
                    "reward points for {} credited but not recorded ({}), reversal failed: {}",
                    event.customer_id, cause, debit_err
                ),
            })
    }
}

fn validate_event(event: &PointsEarnedEvent) -> Result<(), CascadeError> {
    if event.customer_id.trim().is_empty() {
        return Err(CascadeError::InvalidEvent {
            reason: "customer_id is empty".to_string(),
        });
    }
    if event.points == 0 {
        return Err(CascadeError::InvalidEvent {
            reason: format!("points must be positive for {}", event.customer_id),
        });
    }
    if matches!(event.event_id.as_deref(), Some(id) if id.trim().is_empty()) {
        return Err(CascadeError::InvalidEvent {
            reason: "event_id is blank".to_string(),
        });
    }
    Ok(())
}

fn reward_credit_reason(event: &PointsEarnedEvent) -> String {
    match event.event_id.as_deref() {
        Some(event_id) => format!("reward points event {}", event_id),
        None => "reward points".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::InMemoryWalletLedger;
    use crate::config::DEFAULT_STEP_UP_TIERS;
    use reward_cascade_store::CascadeStore;

    struct Fixture {
        store: Arc<CascadeStore>,
        wallet: Arc<InMemoryWalletLedger>,
        accumulator: PointAccumulator,
    }

    fn fixture(config: CascadeConfig) -> Fixture {
        let store = Arc::new(CascadeStore::in_memory());
        let wallet = Arc::new(InMemoryWalletLedger::new());
        let registry = Arc::new(GlobalNumberRegistry::new(store.clone()));
        let step_up = Arc::new(StepUpCascadeEngine::new(
            store.clone(),
            wallet.clone(),
            DEFAULT_STEP_UP_TIERS.to_vec(),
        ));
        let accumulator =
            PointAccumulator::new(store.clone(), wallet.clone(), registry, step_up, &config);
        Fixture {
            store,
            wallet,
            accumulator,
        }
    }

    fn earn(fixture: &Fixture, customer_id: &str, points: u64) -> PointsOutcome {
        fixture
            .accumulator
            .on_points_earned(&PointsEarnedEvent::new(customer_id, points, false))
            .expect("points event")
    }

    #[test]
    fn threshold_is_reached_exactly_at_the_last_point() {
        let fixture = fixture(CascadeConfig::default());
        assert_eq!(
            earn(&fixture, "c-1", 1_499),
            PointsOutcome::Accumulated {
                customer_id: "c-1".to_string(),
                accumulated_points: 1_499,
                remaining_to_threshold: 1,
            }
        );
        let PointsOutcome::Assigned { assignment, .. } = earn(&fixture, "c-1", 1) else {
            panic!("expected assignment");
        };
        assert_eq!(assignment.global_number, 1);
        assert_eq!(assignment.points_at_assignment, 1_500);
        let customer = fixture.store.customer("c-1").expect("read").expect("customer");
        assert_eq!(customer.accumulated_points, 0);
        assert_eq!(customer.pending_cascade, None);
        assert_eq!(customer.lifetime_points_earned, 1_500);
    }

    #[test]
    fn remainder_above_threshold_is_discarded() {
        let fixture = fixture(CascadeConfig::default());
        earn(&fixture, "c-1", 1_400);
        let PointsOutcome::Assigned { assignment, .. } = earn(&fixture, "c-1", 200) else {
            panic!("expected assignment");
        };
        assert_eq!(assignment.points_at_assignment, 1_600);
        let customer = fixture.store.customer("c-1").expect("read").expect("customer");
        assert_eq!(customer.accumulated_points, 0);
    }

    #[test]
    fn numbered_customers_only_grow_lifetime_points() {
        let fixture = fixture(CascadeConfig::default());
        earn(&fixture, "c-1", 1_500);
        assert_eq!(
            earn(&fixture, "c-1", 3_000),
            PointsOutcome::AlreadyNumbered {
                customer_id: "c-1".to_string(),
                global_number: 1,
            }
        );
        let customer = fixture.store.customer("c-1").expect("read").expect("customer");
        assert_eq!(customer.global_number, Some(1));
        assert_eq!(customer.accumulated_points, 0);
        assert_eq!(customer.lifetime_points_earned, 4_500);
        assert_eq!(fixture.store.latest_global_number().expect("latest"), 1);
    }

    #[test]
    fn reward_points_skip_the_threshold_by_default() {
        let fixture = fixture(CascadeConfig::default());
        let outcome = fixture
            .accumulator
            .on_points_earned(&PointsEarnedEvent::new("c-1", 5_000, true))
            .expect("reward points");
        assert_eq!(
            outcome,
            PointsOutcome::RewardPointsCredited {
                customer_id: "c-1".to_string(),
                points: 5_000,
            }
        );
        assert_eq!(
            fixture.wallet.balance("c-1", WalletType::RewardPoints),
            Ok(5_000)
        );
        assert!(fixture.store.customer("c-1").expect("read").is_none());
        assert_eq!(fixture.store.latest_global_number().expect("latest"), 0);
    }

    #[test]
    fn reward_points_can_count_when_configured() {
        let fixture = fixture(CascadeConfig::default().with_reward_points_counting(true));
        let outcome = fixture
            .accumulator
            .on_points_earned(&PointsEarnedEvent::new("c-1", 1_500, true))
            .expect("reward points");
        assert!(matches!(outcome, PointsOutcome::Assigned { .. }));
        assert_eq!(
            fixture.wallet.balance("c-1", WalletType::RewardPoints),
            Ok(1_500)
        );
    }

    #[test]
    fn repeated_event_ids_are_applied_once() {
        let fixture = fixture(CascadeConfig::default());
        let event = PointsEarnedEvent::new("c-1", 700, false).with_event_id("evt-1");
        fixture.accumulator.on_points_earned(&event).expect("first");
        assert_eq!(
            fixture.accumulator.on_points_earned(&event).expect("second"),
            PointsOutcome::Duplicate {
                event_id: "evt-1".to_string()
            }
        );
        let customer = fixture.store.customer("c-1").expect("read").expect("customer");
        assert_eq!(customer.accumulated_points, 700);

        let reward = PointsEarnedEvent::new("c-1", 40, true).with_event_id("evt-2");
        fixture.accumulator.on_points_earned(&reward).expect("reward");
        fixture.accumulator.on_points_earned(&reward).expect("reward again");
        assert_eq!(
            fixture.wallet.balance("c-1", WalletType::RewardPoints),
            Ok(40)
        );
    }

    #[test]
    fn invalid_events_are_rejected() {
        let fixture = fixture(CascadeConfig::default());
        for event in [
            PointsEarnedEvent::new("c-1", 0, false),
            PointsEarnedEvent::new(" ", 10, false),
            PointsEarnedEvent::new("c-1", 10, false).with_event_id(""),
        ] {
            assert!(matches!(
                fixture.accumulator.on_points_earned(&event),
                Err(CascadeError::InvalidEvent { .. })
            ));
        }
        assert!(fixture.store.customers().expect("list").is_empty());
    }
}
