use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

use reward_cascade_proto::{RippleRate, StepUpTier};
use serde::{Deserialize, Serialize};

use crate::CascadeError;

const DEFAULT_THRESHOLD_POINTS: u64 = 1_500;
const DEFAULT_VOUCHER_TRIGGER_POINTS: u64 = 30_000;
const DEFAULT_VOUCHER_POOL_POINTS: u64 = 6_000;
const DEFAULT_VOUCHER_VALIDITY_DAYS: u64 = 365;
const DEFAULT_VOUCHER_CODE_PREFIX: &str = "VCH";

pub const DEFAULT_STEP_UP_TIERS: [StepUpTier; 5] = [
    StepUpTier::new(5, 500),
    StepUpTier::new(25, 1_500),
    StepUpTier::new(125, 3_000),
    StepUpTier::new(500, 30_000),
    StepUpTier::new(2_500, 160_000),
];

pub const DEFAULT_RIPPLE_RATES: [RippleRate; 5] = [
    RippleRate::new(500, 50),
    RippleRate::new(1_500, 100),
    RippleRate::new(3_000, 150),
    RippleRate::new(30_000, 700),
    RippleRate::new(160_000, 1_500),
];

/// One-time voucher split fired by lifetime StepUp earnings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VoucherConfig {
    pub trigger_lifetime_points: u64,
    pub pool_points: u64,
    pub validity_days: u64,
    pub code_prefix: String,
}

impl Default for VoucherConfig {
    fn default() -> Self {
        Self {
            trigger_lifetime_points: DEFAULT_VOUCHER_TRIGGER_POINTS,
            pool_points: DEFAULT_VOUCHER_POOL_POINTS,
            validity_days: DEFAULT_VOUCHER_VALIDITY_DAYS,
            code_prefix: DEFAULT_VOUCHER_CODE_PREFIX.to_string(),
        }
    }
}

/// Cascade configuration. Loaded once; the engines never mutate it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CascadeConfig {
    pub threshold_points: u64,
    /// When false, reward points only land in the RewardPoints wallet.
    pub reward_points_count_toward_threshold: bool,
    pub step_up_tiers: Vec<StepUpTier>,
    pub ripple_rates: Vec<RippleRate>,
    pub voucher: VoucherConfig,
}

impl Default for CascadeConfig {
    fn default() -> Self {
        Self {
            threshold_points: DEFAULT_THRESHOLD_POINTS,
            reward_points_count_toward_threshold: false,
            step_up_tiers: DEFAULT_STEP_UP_TIERS.to_vec(),
            ripple_rates: DEFAULT_RIPPLE_RATES.to_vec(),
            voucher: VoucherConfig::default(),
        }
    }
}

impl CascadeConfig {
    /// Reads a TOML config file. A missing or blank file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, CascadeError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path).map_err(|err| CascadeError::InvalidConfig {
            reason: format!("read {} failed: {}", path.display(), err),
        })?;
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        Self::from_toml_str(content.as_str()).map_err(|err| match err {
            CascadeError::InvalidConfig { reason } => CascadeError::InvalidConfig {
                reason: format!("{}: {}", path.display(), reason),
            },
            other => other,
        })
    }

    pub fn from_toml_str(content: &str) -> Result<Self, CascadeError> {
        let config: CascadeConfig =
            toml::from_str(content).map_err(|err| CascadeError::InvalidConfig {
                reason: format!("parse failed: {}", err),
            })?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String, CascadeError> {
        toml::to_string_pretty(self).map_err(|err| CascadeError::InvalidConfig {
            reason: format!("serialize failed: {}", err),
        })
    }

    pub fn with_threshold_points(mut self, threshold_points: u64) -> Result<Self, CascadeError> {
        self.threshold_points = threshold_points;
        self.validate()?;
        Ok(self)
    }

    pub fn with_step_up_tiers(mut self, tiers: Vec<StepUpTier>) -> Result<Self, CascadeError> {
        self.step_up_tiers = tiers;
        self.validate()?;
        Ok(self)
    }

    pub fn with_ripple_rates(mut self, rates: Vec<RippleRate>) -> Result<Self, CascadeError> {
        self.ripple_rates = rates;
        self.validate()?;
        Ok(self)
    }

    pub fn with_voucher(mut self, voucher: VoucherConfig) -> Result<Self, CascadeError> {
        self.voucher = voucher;
        self.validate()?;
        Ok(self)
    }

    pub fn with_reward_points_counting(mut self, enabled: bool) -> Self {
        self.reward_points_count_toward_threshold = enabled;
        self
    }

    pub fn validate(&self) -> Result<(), CascadeError> {
        if self.threshold_points == 0 {
            return Err(invalid("threshold_points must be positive"));
        }

        let mut multipliers = BTreeSet::new();
        for tier in &self.step_up_tiers {
            // A multiplier of 1 would make every holder pay themselves.
            if tier.multiplier < 2 {
                return Err(invalid(format!(
                    "step_up_tiers multiplier must be at least 2, got {}",
                    tier.multiplier
                )));
            }
            if tier.reward_points == 0 {
                return Err(invalid(format!(
                    "step_up_tiers reward_points must be positive for multiplier {}",
                    tier.multiplier
                )));
            }
            if !multipliers.insert(tier.multiplier) {
                return Err(invalid(format!(
                    "duplicate step_up_tiers multiplier {}",
                    tier.multiplier
                )));
            }
        }

        let mut ripple_amounts = BTreeSet::new();
        for rate in &self.ripple_rates {
            if !ripple_amounts.insert(rate.step_up_amount) {
                return Err(invalid(format!(
                    "duplicate ripple_rates step_up_amount {}",
                    rate.step_up_amount
                )));
            }
        }

        if self.voucher.trigger_lifetime_points == 0 {
            return Err(invalid("voucher.trigger_lifetime_points must be positive"));
        }
        if self.voucher.pool_points == 0 {
            return Err(invalid("voucher.pool_points must be positive"));
        }
        if self.voucher.validity_days == 0 {
            return Err(invalid("voucher.validity_days must be positive"));
        }
        if self.voucher.code_prefix.trim().is_empty() {
            return Err(invalid("voucher.code_prefix cannot be empty"));
        }
        Ok(())
    }
}

fn invalid(reason: impl Into<String>) -> CascadeError {
    CascadeError::InvalidConfig {
        reason: reason.into(),
    }
}
