use std::fmt;
use std::io;

use crate::records::{GlobalNumber, StepUpKey, WalletType};

/// Errors raised by a `CascadeRepository`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The proposed Global Number is no longer the next free one.
    AllocationConflict {
        expected: GlobalNumber,
        found: GlobalNumber,
    },
    AlreadyAssigned {
        customer_id: String,
        global_number: GlobalNumber,
    },
    DuplicatePayment {
        key: StepUpKey,
    },
    DuplicateRipple {
        key: StepUpKey,
    },
    DuplicateVoucherCode {
        code: String,
    },
    UnknownCustomer {
        customer_id: String,
    },
    VersionMismatch {
        expected: u64,
        found: u64,
    },
    Io(String),
    Serde(String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::AllocationConflict { expected, found } => write!(
                f,
                "global number allocation conflict: proposed {}, next free is {}",
                expected, found
            ),
            StoreError::AlreadyAssigned {
                customer_id,
                global_number,
            } => write!(
                f,
                "customer {} already holds global number {}",
                customer_id, global_number
            ),
            StoreError::DuplicatePayment { key } => {
                write!(f, "step-up payment {} already recorded", key)
            }
            StoreError::DuplicateRipple { key } => {
                write!(f, "ripple reward for step-up {} already recorded", key)
            }
            StoreError::DuplicateVoucherCode { code } => {
                write!(f, "voucher code {} already issued", code)
            }
            StoreError::UnknownCustomer { customer_id } => {
                write!(f, "unknown customer: {}", customer_id)
            }
            StoreError::VersionMismatch { expected, found } => write!(
                f,
                "cascade store version mismatch: expected {}, found {}",
                expected, found
            ),
            StoreError::Io(reason) => write!(f, "cascade store io error: {}", reason),
            StoreError::Serde(reason) => write!(f, "cascade store serde error: {}", reason),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<io::Error> for StoreError {
    fn from(error: io::Error) -> Self {
        StoreError::Io(error.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(error: serde_json::Error) -> Self {
        StoreError::Serde(error.to_string())
    }
}

/// Errors raised by the wallet ledger, referral directory or purchase history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CollaboratorError {
    Rejected {
        reason: String,
    },
    InsufficientBalance {
        customer_id: String,
        wallet: WalletType,
        balance: u64,
        requested: u64,
    },
    Unavailable {
        reason: String,
    },
}

impl fmt::Display for CollaboratorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CollaboratorError::Rejected { reason } => write!(f, "request rejected: {}", reason),
            CollaboratorError::InsufficientBalance {
                customer_id,
                wallet,
                balance,
                requested,
            } => write!(
                f,
                "insufficient {} balance for {}: have {}, need {}",
                wallet, customer_id, balance, requested
            ),
            CollaboratorError::Unavailable { reason } => {
                write!(f, "collaborator unavailable: {}", reason)
            }
        }
    }
}

impl std::error::Error for CollaboratorError {}
