//! Shared records and ports for the reward cascade engines.
//!
//! Everything here is plain data or a trait; the engines live in
//! `reward_cascade` and the repository implementation in
//! `reward_cascade_store`.

pub mod error;
pub mod ports;
pub mod records;

pub use error::{CollaboratorError, StoreError};
pub use ports::{
    AssignmentRequest, CascadeRepository, PurchaseHistory, ReferralDirectory, WalletLedger,
};
pub use records::{
    CustomerState, GlobalNumber, GlobalNumberAssignment, PointsEarnedEvent, RippleRate,
    RippleRewardRecord, StepUpKey, StepUpPaymentRecord, StepUpTier, VoucherDistribution,
    WalletType,
};
