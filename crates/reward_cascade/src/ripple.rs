use std::collections::BTreeMap;
use std::sync::Arc;

use reward_cascade_proto::{
    CascadeRepository, ReferralDirectory, RippleRate, RippleRewardRecord, StepUpKey,
    StepUpPaymentRecord, StoreError, WalletLedger, WalletType,
};

use crate::step_up::StepUpPaymentListener;
use crate::util::now_unix_ms;
use crate::CascadeError;

/// Pays the referrer of a StepUp recipient a fixed commission. One level
/// only: the referrer's own referrer is never paid.
pub struct RippleCascadeEngine {
    repository: Arc<dyn CascadeRepository>,
    wallet: Arc<dyn WalletLedger>,
    referrals: Arc<dyn ReferralDirectory>,
    rates: BTreeMap<u64, u64>,
}

impl RippleCascadeEngine {
    pub fn new(
        repository: Arc<dyn CascadeRepository>,
        wallet: Arc<dyn WalletLedger>,
        referrals: Arc<dyn ReferralDirectory>,
        rates: &[RippleRate],
    ) -> Self {
        Self {
            repository,
            wallet,
            referrals,
            rates: rates
                .iter()
                .map(|rate| (rate.step_up_amount, rate.ripple_amount))
                .collect(),
        }
    }

    /// Commission for a StepUp amount; `None` for amounts outside the table.
    pub fn ripple_amount_for(&self, step_up_amount: u64) -> Option<u64> {
        self.rates
            .get(&step_up_amount)
            .copied()
            .filter(|amount| *amount > 0)
    }

    pub fn on_payment(
        &self,
        recipient_customer_id: &str,
        step_up_amount: u64,
        step_up_key: StepUpKey,
    ) -> Result<Option<RippleRewardRecord>, CascadeError> {
        let Some(referrer_id) = self.referrals.referrer_of(recipient_customer_id)? else {
            tracing::debug!(recipient = recipient_customer_id, "no referrer, no ripple");
            return Ok(None);
        };
        let Some(ripple_amount) = self.ripple_amount_for(step_up_amount) else {
            tracing::debug!(step_up_amount, "step-up amount has no ripple rate");
            return Ok(None);
        };
        if let Some(existing) = self.repository.ripple_reward(&step_up_key)? {
            return Ok(Some(existing));
        }

        let record = RippleRewardRecord {
            referrer_id,
            referred_id: recipient_customer_id.to_string(),
            step_up_key,
            step_up_amount,
            ripple_amount,
            created_at_unix_ms: now_unix_ms(),
        };
        let reason = format!("ripple for step-up {}", step_up_key);
        self.wallet
            .credit(&record.referrer_id, WalletType::Income, ripple_amount, &reason)?;
        if let Err(err) = self.repository.record_ripple_reward(record.clone()) {
            tracing::warn!(key = %step_up_key, error = %err, "reversing ripple credit");
            self.wallet
                .debit(
                    &record.referrer_id,
                    WalletType::Income,
                    ripple_amount,
                    &format!("reversal of {}", reason),
                )
                .map_err(|debit_err| CascadeError::CompensationFailed {
                    reason: format!(
                        "ripple {} credited but not recorded ({}), reversal failed: {}",
                        step_up_key, err, debit_err
                    ),
                })?;
            if matches!(err, StoreError::DuplicateRipple { .. }) {
                if let Some(existing) = self.repository.ripple_reward(&step_up_key)? {
                    tracing::debug!(key = %step_up_key, "ripple recorded concurrently");
                    return Ok(Some(existing));
                }
            }
            return Err(err.into());
        }
        tracing::info!(
            referrer = %record.referrer_id,
            referred = recipient_customer_id,
            ripple_amount,
            "ripple paid"
        );
        Ok(Some(record))
    }
}

impl StepUpPaymentListener for RippleCascadeEngine {
    fn on_step_up_payment(&self, payment: &StepUpPaymentRecord) -> Result<(), CascadeError> {
        self.on_payment(
            &payment.recipient_customer_id,
            payment.reward_points,
            payment.key(),
        )
        .map(|_| ())
    }
}
