use std::fmt;

use reward_cascade_proto::{CollaboratorError, StoreError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CascadeError {
    InvalidConfig { reason: String },
    InvalidEvent { reason: String },
    Store(StoreError),
    Collaborator(CollaboratorError),
    /// A wallet credit could not be reversed after its record failed to persist.
    CompensationFailed { reason: String },
    /// The event was applied and its Global Number assigned, but the StepUp
    /// cascade did not finish. Do not resend the event; the cascade is left
    /// pending for `resume_pending_cascades` or the customer's next event.
    CascadePending {
        global_number: u64,
        reason: String,
    },
}

impl fmt::Display for CascadeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CascadeError::InvalidConfig { reason } => {
                write!(f, "invalid cascade config: {}", reason)
            }
            CascadeError::InvalidEvent { reason } => {
                write!(f, "invalid points event: {}", reason)
            }
            CascadeError::Store(err) => write!(f, "cascade store error: {}", err),
            CascadeError::Collaborator(err) => write!(f, "cascade collaborator error: {}", err),
            CascadeError::CompensationFailed { reason } => {
                write!(f, "cascade compensation failed: {}", reason)
            }
            CascadeError::CascadePending {
                global_number,
                reason,
            } => write!(
                f,
                "global number {} assigned, cascade left pending: {}",
                global_number, reason
            ),
        }
    }
}

impl std::error::Error for CascadeError {}

impl From<StoreError> for CascadeError {
    fn from(error: StoreError) -> Self {
        CascadeError::Store(error)
    }
}

impl From<CollaboratorError> for CascadeError {
    fn from(error: CollaboratorError) -> Self {
        CascadeError::Collaborator(error)
    }
}
