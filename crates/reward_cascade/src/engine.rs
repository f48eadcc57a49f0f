use std::sync::Arc;

use reward_cascade_proto::{
    CascadeRepository, CustomerState, GlobalNumber, GlobalNumberAssignment, PointsEarnedEvent,
    PurchaseHistory, ReferralDirectory, RippleRewardRecord, StepUpPaymentRecord,
    VoucherDistribution, WalletLedger, WalletType,
};

use crate::accumulator::{PointAccumulator, PointsOutcome};
use crate::audit::{audit_cascade, CascadeInvariantReport};
use crate::config::CascadeConfig;
use crate::registry::GlobalNumberRegistry;
use crate::ripple::RippleCascadeEngine;
use crate::step_up::{StepUpCascadeEngine, StepUpCascadeReport};
use crate::voucher::VoucherTriggerEngine;
use crate::CascadeError;

/// The wired reward cascade: accumulator, registry and the three cascade
/// engines sharing one repository and one wallet ledger.
pub struct RewardCascade {
    config: CascadeConfig,
    repository: Arc<dyn CascadeRepository>,
    wallet: Arc<dyn WalletLedger>,
    registry: Arc<GlobalNumberRegistry>,
    step_up: Arc<StepUpCascadeEngine>,
    ripple: Arc<RippleCascadeEngine>,
    voucher: Arc<VoucherTriggerEngine>,
    accumulator: PointAccumulator,
}

impl RewardCascade {
    pub fn new(
        config: CascadeConfig,
        repository: Arc<dyn CascadeRepository>,
        wallet: Arc<dyn WalletLedger>,
        referrals: Arc<dyn ReferralDirectory>,
        purchases: Arc<dyn PurchaseHistory>,
    ) -> Result<Self, CascadeError> {
        config.validate()?;

        let registry = Arc::new(GlobalNumberRegistry::new(repository.clone()));
        let ripple = Arc::new(RippleCascadeEngine::new(
            repository.clone(),
            wallet.clone(),
            referrals,
            &config.ripple_rates,
        ));
        let voucher = Arc::new(VoucherTriggerEngine::new(
            repository.clone(),
            purchases,
            config.voucher.clone(),
        ));
        let step_up = Arc::new(
            StepUpCascadeEngine::new(
                repository.clone(),
                wallet.clone(),
                config.step_up_tiers.clone(),
            )
            .with_listener(ripple.clone())
            .with_listener(voucher.clone()),
        );
        let accumulator = PointAccumulator::new(
            repository.clone(),
            wallet.clone(),
            registry.clone(),
            step_up.clone(),
            &config,
        );

        Ok(Self {
            config,
            repository,
            wallet,
            registry,
            step_up,
            ripple,
            voucher,
            accumulator,
        })
    }

    pub fn config(&self) -> &CascadeConfig {
        &self.config
    }

    pub fn registry(&self) -> &GlobalNumberRegistry {
        &self.registry
    }

    pub fn step_up_engine(&self) -> &StepUpCascadeEngine {
        &self.step_up
    }

    pub fn ripple_engine(&self) -> &RippleCascadeEngine {
        &self.ripple
    }

    pub fn voucher_engine(&self) -> &VoucherTriggerEngine {
        &self.voucher
    }

    pub fn on_points_earned(
        &self,
        customer_id: &str,
        points: u64,
        is_reward_points: bool,
    ) -> Result<PointsOutcome, CascadeError> {
        self.apply_event(&PointsEarnedEvent::new(customer_id, points, is_reward_points))
    }

    pub fn apply_event(&self, event: &PointsEarnedEvent) -> Result<PointsOutcome, CascadeError> {
        self.accumulator.on_points_earned(event)
    }

    /// Re-runs every cascade left unsettled by an earlier failure, in Global
    /// Number order. Stops at the first cascade that fails again.
    pub fn resume_pending_cascades(&self) -> Result<Vec<StepUpCascadeReport>, CascadeError> {
        let mut reports = Vec::new();
        for assignment in self.repository.pending_cascades()? {
            if let Some(report) = self.accumulator.resume_pending(&assignment.customer_id)? {
                reports.push(report);
            }
        }
        if !reports.is_empty() {
            tracing::info!(resumed = reports.len(), "pending cascades settled");
        }
        Ok(reports)
    }

    pub fn global_number(&self, customer_id: &str) -> Result<Option<GlobalNumber>, CascadeError> {
        Ok(self
            .repository
            .customer(customer_id)?
            .and_then(|customer| customer.global_number))
    }

    pub fn lifetime_step_up_points(&self, customer_id: &str) -> Result<u64, CascadeError> {
        Ok(self
            .repository
            .customer(customer_id)?
            .map_or(0, |customer| customer.lifetime_step_up_points))
    }

    pub fn step_up_payments(
        &self,
        customer_id: &str,
    ) -> Result<Vec<StepUpPaymentRecord>, CascadeError> {
        Ok(self.repository.step_up_payments_for(customer_id)?)
    }

    pub fn ripple_rewards(&self, referrer_id: &str) -> Result<Vec<RippleRewardRecord>, CascadeError> {
        Ok(self.repository.ripple_rewards_for(referrer_id)?)
    }

    pub fn voucher_distributions(
        &self,
        customer_id: &str,
    ) -> Result<Vec<VoucherDistribution>, CascadeError> {
        Ok(self.repository.voucher_distributions_for(customer_id)?)
    }

    pub fn customer(&self, customer_id: &str) -> Result<Option<CustomerState>, CascadeError> {
        Ok(self.repository.customer(customer_id)?)
    }

    pub fn global_number_holder(
        &self,
        global_number: GlobalNumber,
    ) -> Result<Option<CustomerState>, CascadeError> {
        self.registry.get(global_number)
    }

    pub fn assignments(&self) -> Result<Vec<GlobalNumberAssignment>, CascadeError> {
        self.registry.all()
    }

    pub fn wallet_balance(&self, customer_id: &str, wallet: WalletType) -> Result<u64, CascadeError> {
        Ok(self.wallet.balance(customer_id, wallet)?)
    }

    pub fn audit(&self) -> Result<CascadeInvariantReport, CascadeError> {
        audit_cascade(self.repository.as_ref(), &self.config)
    }
}
