//! In-memory stand-ins for the wallet ledger, referral directory and purchase
//! history. Production deployments plug their own services into the same ports.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use reward_cascade_proto::{
    CollaboratorError, PurchaseHistory, ReferralDirectory, WalletLedger, WalletType,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WalletEntryKind {
    Credit,
    Debit,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletEntry {
    pub customer_id: String,
    pub wallet: WalletType,
    pub kind: WalletEntryKind,
    pub amount: u64,
    pub reason: String,
}

#[derive(Debug, Default)]
struct LedgerState {
    balances: BTreeMap<(String, WalletType), u64>,
    journal: Vec<WalletEntry>,
}

#[derive(Debug, Default)]
pub struct InMemoryWalletLedger {
    state: Mutex<LedgerState>,
}

impl InMemoryWalletLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<WalletEntry> {
        lock(&self.state).journal.clone()
    }

    /// Sum of all balances of one wallet type across customers.
    pub fn total_balance(&self, wallet: WalletType) -> u64 {
        lock(&self.state)
            .balances
            .iter()
            .filter(|((_, entry_wallet), _)| *entry_wallet == wallet)
            .map(|(_, amount)| *amount)
            .sum()
    }
}

impl WalletLedger for InMemoryWalletLedger {
    fn credit(
        &self,
        customer_id: &str,
        wallet: WalletType,
        amount: u64,
        reason: &str,
    ) -> Result<(), CollaboratorError> {
        if amount == 0 {
            return Err(CollaboratorError::Rejected {
                reason: format!("zero credit to {} {}", customer_id, wallet),
            });
        }
        let mut state = lock(&self.state);
        let balance = state
            .balances
            .entry((customer_id.to_string(), wallet))
            .or_insert(0);
        *balance = balance
            .checked_add(amount)
            .ok_or_else(|| CollaboratorError::Rejected {
                reason: format!("{} {} balance overflow", customer_id, wallet),
            })?;
        state.journal.push(WalletEntry {
            customer_id: customer_id.to_string(),
            wallet,
            kind: WalletEntryKind::Credit,
            amount,
            reason: reason.to_string(),
        });
        Ok(())
    }

    fn debit(
        &self,
        customer_id: &str,
        wallet: WalletType,
        amount: u64,
        reason: &str,
    ) -> Result<(), CollaboratorError> {
        let mut state = lock(&self.state);
        let key = (customer_id.to_string(), wallet);
        let balance = state.balances.get(&key).copied().unwrap_or(0);
        if balance < amount {
            return Err(CollaboratorError::InsufficientBalance {
                customer_id: customer_id.to_string(),
                wallet,
                balance,
                requested: amount,
            });
        }
        state.balances.insert(key, balance - amount);
        state.journal.push(WalletEntry {
            customer_id: customer_id.to_string(),
            wallet,
            kind: WalletEntryKind::Debit,
            amount,
            reason: reason.to_string(),
        });
        Ok(())
    }

    fn balance(&self, customer_id: &str, wallet: WalletType) -> Result<u64, CollaboratorError> {
        Ok(lock(&self.state)
            .balances
            .get(&(customer_id.to_string(), wallet))
            .copied()
            .unwrap_or(0))
    }
}

/// Referrer links, set once at registration.
#[derive(Debug, Default)]
pub struct InMemoryReferralDirectory {
    referrers: Mutex<BTreeMap<String, String>>,
}

impl InMemoryReferralDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        customer_id: impl Into<String>,
        referrer_id: impl Into<String>,
    ) -> Result<(), CollaboratorError> {
        let customer_id = customer_id.into();
        let referrer_id = referrer_id.into();
        if customer_id == referrer_id {
            return Err(CollaboratorError::Rejected {
                reason: format!("customer {} cannot refer themselves", customer_id),
            });
        }
        let mut referrers = lock(&self.referrers);
        if let Some(existing) = referrers.get(&customer_id) {
            return Err(CollaboratorError::Rejected {
                reason: format!(
                    "customer {} already referred by {}",
                    customer_id, existing
                ),
            });
        }
        referrers.insert(customer_id, referrer_id);
        Ok(())
    }
}

impl ReferralDirectory for InMemoryReferralDirectory {
    fn referrer_of(&self, customer_id: &str) -> Result<Option<String>, CollaboratorError> {
        Ok(lock(&self.referrers).get(customer_id).cloned())
    }
}

/// Per-customer, per-merchant point contributions.
#[derive(Debug, Default)]
pub struct InMemoryPurchaseHistory {
    contributions: Mutex<BTreeMap<String, BTreeMap<String, u64>>>,
}

impl InMemoryPurchaseHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_contribution(
        &self,
        customer_id: impl Into<String>,
        merchant_id: impl Into<String>,
        points: u64,
    ) {
        let mut contributions = lock(&self.contributions);
        let merchant_points = contributions
            .entry(customer_id.into())
            .or_default()
            .entry(merchant_id.into())
            .or_insert(0);
        *merchant_points = merchant_points.saturating_add(points);
    }
}

impl PurchaseHistory for InMemoryPurchaseHistory {
    fn merchant_contributions(
        &self,
        customer_id: &str,
    ) -> Result<BTreeMap<String, u64>, CollaboratorError> {
        Ok(lock(&self.contributions)
            .get(customer_id)
            .cloned()
            .unwrap_or_default())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
