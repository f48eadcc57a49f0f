use reward_cascade_proto::{
    AssignmentRequest, CascadeRepository, CustomerState, GlobalNumber, GlobalNumberAssignment,
    RippleRewardRecord, StepUpKey, StepUpPaymentRecord, StoreError, VoucherDistribution,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};

const STORE_VERSION: u64 = 1;
const STORE_FILE: &str = "reward_cascade_state.json";

#[derive(Debug, Clone, Default)]
struct CascadeState {
    customers: BTreeMap<String, CustomerState>,
    assignments: BTreeMap<GlobalNumber, GlobalNumberAssignment>,
    step_up_payments: BTreeMap<StepUpKey, StepUpPaymentRecord>,
    ripple_rewards: BTreeMap<StepUpKey, RippleRewardRecord>,
    voucher_distributions: Vec<VoucherDistribution>,
    voucher_codes: BTreeSet<String>,
    applied_events: BTreeSet<String>,
}

impl CascadeState {
    fn latest_global_number(&self) -> GlobalNumber {
        self.assignments.keys().next_back().copied().unwrap_or(0)
    }

    fn customer_mut(&mut self, customer_id: &str) -> &mut CustomerState {
        self.customers
            .entry(customer_id.to_string())
            .or_insert_with(|| CustomerState::new(customer_id))
    }

    fn known_customer_mut(&mut self, customer_id: &str) -> Result<&mut CustomerState, StoreError> {
        self.customers
            .get_mut(customer_id)
            .ok_or_else(|| StoreError::UnknownCustomer {
                customer_id: customer_id.to_string(),
            })
    }
}

/// On-disk envelope. Keyed maps are flattened to lists since JSON object
/// keys must be strings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct CascadeStoreFile {
    pub version: u64,
    pub updated_at: i64,
    pub customers: Vec<CustomerState>,
    pub assignments: Vec<GlobalNumberAssignment>,
    pub step_up_payments: Vec<StepUpPaymentRecord>,
    pub ripple_rewards: Vec<RippleRewardRecord>,
    pub voucher_distributions: Vec<VoucherDistribution>,
    pub applied_events: Vec<String>,
}

impl CascadeStoreFile {
    fn from_state(state: &CascadeState) -> Self {
        Self {
            version: STORE_VERSION,
            updated_at: now_unix(),
            customers: state.customers.values().cloned().collect(),
            assignments: state.assignments.values().cloned().collect(),
            step_up_payments: state.step_up_payments.values().cloned().collect(),
            ripple_rewards: state.ripple_rewards.values().cloned().collect(),
            voucher_distributions: state.voucher_distributions.clone(),
            applied_events: state.applied_events.iter().cloned().collect(),
        }
    }

    fn into_state(self) -> CascadeState {
        let voucher_codes = self
            .voucher_distributions
            .iter()
            .map(|voucher| voucher.voucher_code.clone())
            .collect();
        CascadeState {
            customers: self
                .customers
                .into_iter()
                .map(|customer| (customer.customer_id.clone(), customer))
                .collect(),
            assignments: self
                .assignments
                .into_iter()
                .map(|assignment| (assignment.global_number, assignment))
                .collect(),
            step_up_payments: self
                .step_up_payments
                .into_iter()
                .map(|record| (record.key(), record))
                .collect(),
            ripple_rewards: self
                .ripple_rewards
                .into_iter()
                .map(|record| (record.step_up_key, record))
                .collect(),
            voucher_distributions: self.voucher_distributions,
            voucher_codes,
            applied_events: self.applied_events.into_iter().collect(),
        }
    }
}

/// Single-writer cascade repository.
///
/// All state sits behind one mutex, so every repository call is atomic with
/// respect to every other. When opened on a directory, each mutation is
/// applied to a copy, written to disk, and only then made visible; a failed
/// write leaves both memory and disk at the previous state.
#[derive(Debug)]
pub struct CascadeStore {
    path: Option<PathBuf>,
    state: Mutex<CascadeState>,
}

impl Default for CascadeStore {
    fn default() -> Self {
        Self::in_memory()
    }
}

impl CascadeStore {
    pub fn in_memory() -> Self {
        Self {
            path: None,
            state: Mutex::new(CascadeState::default()),
        }
    }

    pub fn open(root: impl AsRef<Path>) -> Result<Self, StoreError> {
        let root = root.as_ref();
        fs::create_dir_all(root)?;
        let path = root.join(STORE_FILE);
        let state = if path.exists() {
            let file: CascadeStoreFile = read_json_from_path(&path)?;
            if file.version != STORE_VERSION {
                return Err(StoreError::VersionMismatch {
                    expected: STORE_VERSION,
                    found: file.version,
                });
            }
            file.into_state()
        } else {
            CascadeState::default()
        };
        tracing::debug!(
            path = %path.display(),
            assignments = state.assignments.len(),
            "opened cascade store"
        );
        Ok(Self {
            path: Some(path),
            state: Mutex::new(state),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn read<R>(&self, f: impl FnOnce(&CascadeState) -> R) -> R {
        let state = lock_state(&self.state);
        f(&state)
    }

    fn write<R>(
        &self,
        f: impl FnOnce(&mut CascadeState) -> Result<R, StoreError>,
    ) -> Result<R, StoreError> {
        let mut state = lock_state(&self.state);
        match &self.path {
            None => f(&mut state),
            Some(path) => {
                let mut next = state.clone();
                let out = f(&mut next)?;
                write_json_atomic(&CascadeStoreFile::from_state(&next), path)?;
                *state = next;
                Ok(out)
            }
        }
    }
}

impl CascadeRepository for CascadeStore {
    fn customer(&self, customer_id: &str) -> Result<Option<CustomerState>, StoreError> {
        Ok(self.read(|state| state.customers.get(customer_id).cloned()))
    }

    fn customers(&self) -> Result<Vec<CustomerState>, StoreError> {
        Ok(self.read(|state| state.customers.values().cloned().collect()))
    }

    fn is_event_applied(&self, event_id: &str) -> Result<bool, StoreError> {
        Ok(self.read(|state| state.applied_events.contains(event_id)))
    }

    fn mark_event_applied(&self, event_id: &str) -> Result<bool, StoreError> {
        self.write(|state| Ok(state.applied_events.insert(event_id.to_string())))
    }

    fn record_accumulation(
        &self,
        customer_id: &str,
        accumulated_points: u64,
        earned_points: u64,
        event_id: Option<&str>,
    ) -> Result<CustomerState, StoreError> {
        self.write(|state| {
            if let Some(event_id) = event_id {
                state.applied_events.insert(event_id.to_string());
            }
            let customer = state.customer_mut(customer_id);
            customer.accumulated_points = accumulated_points;
            customer.lifetime_points_earned =
                customer.lifetime_points_earned.saturating_add(earned_points);
            Ok(customer.clone())
        })
    }

    fn latest_global_number(&self) -> Result<GlobalNumber, StoreError> {
        Ok(self.read(CascadeState::latest_global_number))
    }

    fn assign_global_number(
        &self,
        request: AssignmentRequest,
    ) -> Result<GlobalNumberAssignment, StoreError> {
        self.write(|state| {
            if let Some(global_number) = state
                .customers
                .get(&request.customer_id)
                .and_then(|customer| customer.global_number)
            {
                return Err(StoreError::AlreadyAssigned {
                    customer_id: request.customer_id.clone(),
                    global_number,
                });
            }
            let next = state.latest_global_number() + 1;
            if request.proposed != next {
                return Err(StoreError::AllocationConflict {
                    expected: request.proposed,
                    found: next,
                });
            }

            let assignment = GlobalNumberAssignment {
                global_number: next,
                customer_id: request.customer_id.clone(),
                points_at_assignment: request.points_at_assignment,
                assigned_at_unix_ms: request.assigned_at_unix_ms,
            };
            if let Some(event_id) = &request.event_id {
                state.applied_events.insert(event_id.clone());
            }
            let customer = state.customer_mut(&request.customer_id);
            customer.global_number = Some(next);
            customer.pending_cascade = Some(next);
            customer.accumulated_points = 0;
            customer.lifetime_points_earned = customer
                .lifetime_points_earned
                .saturating_add(request.earned_points);
            state.assignments.insert(next, assignment.clone());
            Ok(assignment)
        })
    }

    fn settle_cascade(
        &self,
        customer_id: &str,
        global_number: GlobalNumber,
    ) -> Result<(), StoreError> {
        self.write(|state| {
            let customer = state.known_customer_mut(customer_id)?;
            if customer.pending_cascade == Some(global_number) {
                customer.pending_cascade = None;
            }
            Ok(())
        })
    }

    fn pending_cascades(&self) -> Result<Vec<GlobalNumberAssignment>, StoreError> {
        Ok(self.read(|state| {
            let mut pending = state
                .customers
                .values()
                .filter_map(|customer| customer.pending_cascade)
                .filter_map(|global_number| state.assignments.get(&global_number).cloned())
                .collect::<Vec<_>>();
            pending.sort_by_key(|assignment| assignment.global_number);
            pending
        }))
    }

    fn assignment(
        &self,
        global_number: GlobalNumber,
    ) -> Result<Option<GlobalNumberAssignment>, StoreError> {
        Ok(self.read(|state| state.assignments.get(&global_number).cloned()))
    }

    fn assignments(&self) -> Result<Vec<GlobalNumberAssignment>, StoreError> {
        Ok(self.read(|state| state.assignments.values().cloned().collect()))
    }

    fn step_up_payment(
        &self,
        key: &StepUpKey,
    ) -> Result<Option<StepUpPaymentRecord>, StoreError> {
        Ok(self.read(|state| state.step_up_payments.get(key).cloned()))
    }

    fn record_step_up_payment(&self, record: StepUpPaymentRecord) -> Result<u64, StoreError> {
        self.write(|state| {
            let key = record.key();
            if state.step_up_payments.contains_key(&key) {
                return Err(StoreError::DuplicatePayment { key });
            }
            let customer = state.known_customer_mut(&record.recipient_customer_id)?;
            customer.lifetime_step_up_points = customer
                .lifetime_step_up_points
                .saturating_add(record.reward_points);
            let lifetime = customer.lifetime_step_up_points;
            state.step_up_payments.insert(key, record);
            Ok(lifetime)
        })
    }

    fn step_up_payments(&self) -> Result<Vec<StepUpPaymentRecord>, StoreError> {
        Ok(self.read(|state| state.step_up_payments.values().cloned().collect()))
    }

    fn step_up_payments_for(
        &self,
        customer_id: &str,
    ) -> Result<Vec<StepUpPaymentRecord>, StoreError> {
        Ok(self.read(|state| {
            state
                .step_up_payments
                .values()
                .filter(|record| record.recipient_customer_id == customer_id)
                .cloned()
                .collect()
        }))
    }

    fn ripple_reward(&self, key: &StepUpKey) -> Result<Option<RippleRewardRecord>, StoreError> {
        Ok(self.read(|state| state.ripple_rewards.get(key).cloned()))
    }

    fn record_ripple_reward(&self, record: RippleRewardRecord) -> Result<(), StoreError> {
        self.write(|state| {
            let key = record.step_up_key;
            if state.ripple_rewards.contains_key(&key) {
                return Err(StoreError::DuplicateRipple { key });
            }
            state.ripple_rewards.insert(key, record);
            Ok(())
        })
    }

    fn ripple_rewards(&self) -> Result<Vec<RippleRewardRecord>, StoreError> {
        Ok(self.read(|state| state.ripple_rewards.values().cloned().collect()))
    }

    fn ripple_rewards_for(
        &self,
        referrer_id: &str,
    ) -> Result<Vec<RippleRewardRecord>, StoreError> {
        Ok(self.read(|state| {
            state
                .ripple_rewards
                .values()
                .filter(|record| record.referrer_id == referrer_id)
                .cloned()
                .collect()
        }))
    }

    fn issue_vouchers(
        &self,
        customer_id: &str,
        distributions: Vec<VoucherDistribution>,
    ) -> Result<bool, StoreError> {
        self.write(|state| {
            if state.known_customer_mut(customer_id)?.voucher_issued {
                return Ok(false);
            }
            let mut batch_codes = BTreeSet::new();
            for voucher in &distributions {
                if state.voucher_codes.contains(&voucher.voucher_code)
                    || !batch_codes.insert(voucher.voucher_code.clone())
                {
                    return Err(StoreError::DuplicateVoucherCode {
                        code: voucher.voucher_code.clone(),
                    });
                }
            }
            state.known_customer_mut(customer_id)?.voucher_issued = true;
            state.voucher_codes.extend(batch_codes);
            state.voucher_distributions.extend(distributions);
            Ok(true)
        })
    }

    fn voucher_distributions(&self) -> Result<Vec<VoucherDistribution>, StoreError> {
        Ok(self.read(|state| state.voucher_distributions.clone()))
    }

    fn voucher_distributions_for(
        &self,
        customer_id: &str,
    ) -> Result<Vec<VoucherDistribution>, StoreError> {
        Ok(self.read(|state| {
            state
                .voucher_distributions
                .iter()
                .filter(|voucher| voucher.customer_id == customer_id)
                .cloned()
                .collect()
        }))
    }
}

fn lock_state(state: &Mutex<CascadeState>) -> MutexGuard<'_, CascadeState> {
    state
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_secs() as i64)
        .unwrap_or(0)
}

fn write_json_atomic<T: Serialize>(value: &T, path: &Path) -> Result<(), StoreError> {
    let tmp = path.with_extension("json.tmp");
    let data = serde_json::to_vec_pretty(value)?;
    fs::write(&tmp, data)?;
    fs::rename(tmp, path)?;
    Ok(())
}

fn read_json_from_path<T: DeserializeOwned>(path: &Path) -> Result<T, StoreError> {
    let data = fs::read(path)?;
    Ok(serde_json::from_slice(&data)?)
}
