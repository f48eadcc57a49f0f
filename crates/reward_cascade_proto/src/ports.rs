//! Collaborator and repository ports consumed by the cascade engines.

use std::collections::BTreeMap;

use crate::error::{CollaboratorError, StoreError};
use crate::records::{
    CustomerState, GlobalNumber, GlobalNumberAssignment, RippleRewardRecord, StepUpKey,
    StepUpPaymentRecord, VoucherDistribution, WalletType,
};

/// Per-customer wallet balances kept outside the engine.
pub trait WalletLedger: Send + Sync {
    fn credit(
        &self,
        customer_id: &str,
        wallet: WalletType,
        amount: u64,
        reason: &str,
    ) -> Result<(), CollaboratorError>;

    fn debit(
        &self,
        customer_id: &str,
        wallet: WalletType,
        amount: u64,
        reason: &str,
    ) -> Result<(), CollaboratorError>;

    fn balance(&self, customer_id: &str, wallet: WalletType) -> Result<u64, CollaboratorError>;
}

pub trait ReferralDirectory: Send + Sync {
    fn referrer_of(&self, customer_id: &str) -> Result<Option<String>, CollaboratorError>;
}

pub trait PurchaseHistory: Send + Sync {
    /// Points each merchant contributed to the customer over their history.
    fn merchant_contributions(
        &self,
        customer_id: &str,
    ) -> Result<BTreeMap<String, u64>, CollaboratorError>;
}

/// Compare-and-swap request for the next Global Number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssignmentRequest {
    pub customer_id: String,
    /// Must equal the repository's latest number plus one at commit time.
    pub proposed: GlobalNumber,
    pub points_at_assignment: u64,
    /// Points of the triggering event, added to the lifetime total.
    pub earned_points: u64,
    pub event_id: Option<String>,
    pub assigned_at_unix_ms: i64,
}

/// Durable state of the cascade. Every method is one atomic step: it either
/// applies completely or leaves the repository unchanged.
pub trait CascadeRepository: Send + Sync {
    fn customer(&self, customer_id: &str) -> Result<Option<CustomerState>, StoreError>;

    fn customers(&self) -> Result<Vec<CustomerState>, StoreError>;

    fn is_event_applied(&self, event_id: &str) -> Result<bool, StoreError>;

    /// Returns `false` when the id was already marked.
    fn mark_event_applied(&self, event_id: &str) -> Result<bool, StoreError>;

    /// Stores a below-threshold accumulator value and adds `earned_points` to
    /// the lifetime total, creating the customer on first sight.
    fn record_accumulation(
        &self,
        customer_id: &str,
        accumulated_points: u64,
        earned_points: u64,
        event_id: Option<&str>,
    ) -> Result<CustomerState, StoreError>;

    /// 0 when nothing has been assigned yet.
    fn latest_global_number(&self) -> Result<GlobalNumber, StoreError>;

    /// Commits `request.proposed` for the customer, resets their accumulator
    /// and marks the cascade pending.
    fn assign_global_number(
        &self,
        request: AssignmentRequest,
    ) -> Result<GlobalNumberAssignment, StoreError>;

    fn settle_cascade(
        &self,
        customer_id: &str,
        global_number: GlobalNumber,
    ) -> Result<(), StoreError>;

    fn pending_cascades(&self) -> Result<Vec<GlobalNumberAssignment>, StoreError>;

    fn assignment(
        &self,
        global_number: GlobalNumber,
    ) -> Result<Option<GlobalNumberAssignment>, StoreError>;

    /// Ordered by Global Number.
    fn assignments(&self) -> Result<Vec<GlobalNumberAssignment>, StoreError>;

    fn step_up_payment(&self, key: &StepUpKey)
        -> Result<Option<StepUpPaymentRecord>, StoreError>;

    /// Stores the payment and adds it to the recipient's lifetime StepUp
    /// total, returning the new total.
    fn record_step_up_payment(&self, record: StepUpPaymentRecord) -> Result<u64, StoreError>;

    fn step_up_payments(&self) -> Result<Vec<StepUpPaymentRecord>, StoreError>;

    fn step_up_payments_for(
        &self,
        customer_id: &str,
    ) -> Result<Vec<StepUpPaymentRecord>, StoreError>;

    fn ripple_reward(&self, key: &StepUpKey) -> Result<Option<RippleRewardRecord>, StoreError>;

    fn record_ripple_reward(&self, record: RippleRewardRecord) -> Result<(), StoreError>;

    fn ripple_rewards(&self) -> Result<Vec<RippleRewardRecord>, StoreError>;

    fn ripple_rewards_for(&self, referrer_id: &str)
        -> Result<Vec<RippleRewardRecord>, StoreError>;

    /// Stores the distributions and sets the customer's voucher flag. Returns
    /// `false` without writing anything when the flag was already set.
    fn issue_vouchers(
        &self,
        customer_id: &str,
        distributions: Vec<VoucherDistribution>,
    ) -> Result<bool, StoreError>;

    fn voucher_distributions(&self) -> Result<Vec<VoucherDistribution>, StoreError>;

    fn voucher_distributions_for(
        &self,
        customer_id: &str,
    ) -> Result<Vec<VoucherDistribution>, StoreError>;
}
