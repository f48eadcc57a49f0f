use std::sync::{Arc, Mutex};

use reward_cascade_proto::{
    AssignmentRequest, CascadeRepository, CustomerState, GlobalNumber, GlobalNumberAssignment,
    StoreError,
};

use crate::util::now_unix_ms;
use crate::CascadeError;

const MAX_ALLOCATION_ATTEMPTS: usize = 8;

/// Hands out Global Numbers as a gap-free sequence starting at 1.
///
/// Allocation is a compare-and-swap against the repository: propose
/// `latest + 1`, and the repository commits only if that is still the next
/// free number. Within one process the allocation gate makes the registry the
/// single writer, so conflicts only arise when another process shares the
/// repository.
pub struct GlobalNumberRegistry {
    repository: Arc<dyn CascadeRepository>,
    allocation_gate: Mutex<()>,
}

impl GlobalNumberRegistry {
    pub fn new(repository: Arc<dyn CascadeRepository>) -> Self {
        Self {
            repository,
            allocation_gate: Mutex::new(()),
        }
    }

    /// Assigns the next Global Number to a customer that does not hold one.
    ///
    /// The same repository step resets the customer's accumulator, adds
    /// `earned_points` to their lifetime total and records `event_id`. A
    /// failed attempt never consumes a number.
    pub fn assign(
        &self,
        customer_id: &str,
        points_at_assignment: u64,
        earned_points: u64,
        event_id: Option<&str>,
    ) -> Result<GlobalNumberAssignment, CascadeError> {
        let _gate = self
            .allocation_gate
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let mut attempts = 0;
        loop {
            let proposed = self.repository.latest_global_number()? + 1;
            let request = AssignmentRequest {
                customer_id: customer_id.to_string(),
                proposed,
                points_at_assignment,
                earned_points,
                event_id: event_id.map(ToOwned::to_owned),
                assigned_at_unix_ms: now_unix_ms(),
            };
            match self.repository.assign_global_number(request) {
                Ok(assignment) => {
                    tracing::info!(
                        customer_id,
                        global_number = assignment.global_number,
                        points_at_assignment,
                        "assigned global number"
                    );
                    return Ok(assignment);
                }
                Err(err @ StoreError::AllocationConflict { .. }) => {
                    attempts += 1;
                    if attempts >= MAX_ALLOCATION_ATTEMPTS {
                        return Err(err.into());
                    }
                    tracing::warn!(customer_id, attempts, error = %err, "retrying allocation");
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// The customer holding `global_number`, if it has been issued.
    pub fn get(&self, global_number: GlobalNumber) -> Result<Option<CustomerState>, CascadeError> {
        let Some(assignment) = self.repository.assignment(global_number)? else {
            return Ok(None);
        };
        Ok(self.repository.customer(&assignment.customer_id)?)
    }

    pub fn assignment(
        &self,
        global_number: GlobalNumber,
    ) -> Result<Option<GlobalNumberAssignment>, CascadeError> {
        Ok(self.repository.assignment(global_number)?)
    }

    /// Every assignment in Global Number order.
    pub fn all(&self) -> Result<Vec<GlobalNumberAssignment>, CascadeError> {
        Ok(self.repository.assignments()?)
    }

    pub fn latest(&self) -> Result<GlobalNumber, CascadeError> {
        Ok(self.repository.latest_global_number()?)
    }
}
