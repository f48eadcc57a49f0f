use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Sequential, permanent identifier handed out once a customer crosses the
/// accumulation threshold. Numbering starts at 1.
pub type GlobalNumber = u64;

/// Named sub-balances a customer holds in the wallet ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WalletType {
    RewardPoints,
    Income,
    Commerce,
}

impl WalletType {
    pub fn as_str(&self) -> &'static str {
        match self {
            WalletType::RewardPoints => "reward_points",
            WalletType::Income => "income",
            WalletType::Commerce => "commerce",
        }
    }
}

impl fmt::Display for WalletType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WalletType {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "reward_points" | "rewardpoints" => Ok(WalletType::RewardPoints),
            "income" => Ok(WalletType::Income),
            "commerce" => Ok(WalletType::Commerce),
            other => Err(format!("unknown wallet type: {other}")),
        }
    }
}

/// Engine-side state of one customer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomerState {
    pub customer_id: String,
    /// Points not yet converted into a Global Number, always below the threshold.
    pub accumulated_points: u64,
    pub global_number: Option<GlobalNumber>,
    pub lifetime_points_earned: u64,
    pub lifetime_step_up_points: u64,
    pub voucher_issued: bool,
    /// Global Number whose StepUp cascade has not been confirmed complete.
    #[serde(default)]
    pub pending_cascade: Option<GlobalNumber>,
}

impl CustomerState {
    pub fn new(customer_id: impl Into<String>) -> Self {
        Self {
            customer_id: customer_id.into(),
            accumulated_points: 0,
            global_number: None,
            lifetime_points_earned: 0,
            lifetime_step_up_points: 0,
            voucher_issued: false,
            pending_cascade: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalNumberAssignment {
    pub global_number: GlobalNumber,
    pub customer_id: String,
    pub points_at_assignment: u64,
    pub assigned_at_unix_ms: i64,
}

/// One row of the StepUp table: the holder of `n` is paid `reward_points`
/// when `n * multiplier` is issued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepUpTier {
    pub multiplier: u64,
    pub reward_points: u64,
}

impl StepUpTier {
    pub const fn new(multiplier: u64, reward_points: u64) -> Self {
        Self {
            multiplier,
            reward_points,
        }
    }
}

/// Idempotency key of a StepUp payment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StepUpKey {
    pub recipient_global_number: GlobalNumber,
    pub trigger_global_number: GlobalNumber,
    pub multiplier: u64,
}

impl fmt::Display for StepUpKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}<-{}x{}",
            self.recipient_global_number, self.trigger_global_number, self.multiplier
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepUpPaymentRecord {
    pub recipient_global_number: GlobalNumber,
    pub recipient_customer_id: String,
    pub trigger_global_number: GlobalNumber,
    pub multiplier: u64,
    pub reward_points: u64,
    pub paid: bool,
    pub paid_at_unix_ms: i64,
}

impl StepUpPaymentRecord {
    pub fn key(&self) -> StepUpKey {
        StepUpKey {
            recipient_global_number: self.recipient_global_number,
            trigger_global_number: self.trigger_global_number,
            multiplier: self.multiplier,
        }
    }
}

/// Maps a canonical StepUp amount to the commission paid to the recipient's referrer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RippleRate {
    pub step_up_amount: u64,
    pub ripple_amount: u64,
}

impl RippleRate {
    pub const fn new(step_up_amount: u64, ripple_amount: u64) -> Self {
        Self {
            step_up_amount,
            ripple_amount,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RippleRewardRecord {
    pub referrer_id: String,
    /// The StepUp recipient.
    pub referred_id: String,
    pub step_up_key: StepUpKey,
    pub step_up_amount: u64,
    pub ripple_amount: u64,
    pub created_at_unix_ms: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoucherDistribution {
    pub customer_id: String,
    pub merchant_id: String,
    pub points_allocated: u64,
    pub voucher_code: String,
    pub created_at_unix_ms: i64,
    pub expires_at_unix_ms: i64,
}

/// A "points earned" notification from the order, cashback or referral side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PointsEarnedEvent {
    /// Optional caller-supplied id; an id seen before is not applied twice.
    #[serde(default)]
    pub event_id: Option<String>,
    pub customer_id: String,
    pub points: u64,
    #[serde(default)]
    pub is_reward_points: bool,
}

impl PointsEarnedEvent {
    pub fn new(customer_id: impl Into<String>, points: u64, is_reward_points: bool) -> Self {
        Self {
            event_id: None,
            customer_id: customer_id.into(),
            points,
            is_reward_points,
        }
    }

    pub fn with_event_id(mut self, event_id: impl Into<String>) -> Self {
        self.event_id = Some(event_id.into());
        self
    }
}
