//! Cascading point-reward distribution.
//!
//! Customers accumulate points until the threshold earns them a Global
//! Number. Each new number pays StepUp bonuses to earlier holders it is a
//! multiple of, every StepUp payment ripples a commission to the recipient's
//! referrer, and lifetime StepUp earnings eventually fire a one-time merchant
//! voucher split. [`RewardCascade`] wires the pieces together.

mod accumulator;
mod audit;
pub mod collaborators;
mod config;
mod engine;
mod error;
mod locks;
mod registry;
mod ripple;
mod step_up;
mod util;
mod voucher;

pub use accumulator::{PointAccumulator, PointsOutcome};
pub use audit::{audit_cascade, CascadeInvariantReport, CascadeInvariantViolation};
pub use config::{CascadeConfig, VoucherConfig, DEFAULT_RIPPLE_RATES, DEFAULT_STEP_UP_TIERS};
pub use engine::RewardCascade;
pub use error::CascadeError;
pub use registry::GlobalNumberRegistry;
pub use ripple::RippleCascadeEngine;
pub use step_up::{eligible_tiers, StepUpCascadeEngine, StepUpCascadeReport, StepUpPaymentListener};
pub use voucher::{split_voucher_pool, VoucherOutcome, VoucherShare, VoucherTriggerEngine};

pub use reward_cascade_proto::{
    CustomerState, GlobalNumber, GlobalNumberAssignment, PointsEarnedEvent, RippleRewardRecord,
    StepUpKey, StepUpPaymentRecord, StepUpTier, VoucherDistribution, WalletType,
};
pub use reward_cascade_store::CascadeStore;
