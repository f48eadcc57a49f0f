use std::collections::BTreeMap;
use std::sync::Arc;

use rand_core::{OsRng, RngCore};
use reward_cascade_proto::{
    CascadeRepository, CollaboratorError, PurchaseHistory, StepUpPaymentRecord,
    VoucherDistribution,
};
use serde::{Deserialize, Serialize};

use crate::config::VoucherConfig;
use crate::step_up::StepUpPaymentListener;
use crate::util::{now_unix_ms, MILLIS_PER_DAY};
use crate::CascadeError;

/// One merchant's slice of the voucher pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoucherShare {
    pub merchant_id: String,
    pub contribution: u64,
    pub points: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum VoucherOutcome {
    BelowTrigger { lifetime_step_up_points: u64 },
    AlreadyIssued,
    /// The trigger fired; empty when the customer has no merchant history.
    Issued(Vec<VoucherDistribution>),
}

/// Splits `pool` across merchants in proportion to their contributions.
///
/// Each merchant first receives `floor(pool * c / total)`. Points left over by
/// the floors go one at a time to the largest fractional remainders (ties:
/// larger contribution, then lower merchant id), so the shares always sum to
/// `pool`. Merchants ending with zero points are dropped.
pub fn split_voucher_pool(pool: u64, contributions: &BTreeMap<String, u64>) -> Vec<VoucherShare> {
    let total: u128 = contributions.values().map(|points| *points as u128).sum();
    if pool == 0 || total == 0 {
        return Vec::new();
    }

    let mut shares = Vec::with_capacity(contributions.len());
    let mut remainders = Vec::with_capacity(contributions.len());
    let mut distributed: u128 = 0;
    for (merchant_id, contribution) in contributions.iter().filter(|(_, points)| **points > 0) {
        let exact = pool as u128 * *contribution as u128;
        let floor = exact / total;
        remainders.push((shares.len(), exact % total));
        distributed += floor;
        shares.push(VoucherShare {
            merchant_id: merchant_id.clone(),
            contribution: *contribution,
            points: floor as u64,
        });
    }

    remainders.sort_by(|left, right| {
        right
            .1
            .cmp(&left.1)
            .then_with(|| shares[right.0].contribution.cmp(&shares[left.0].contribution))
            .then_with(|| shares[left.0].merchant_id.cmp(&shares[right.0].merchant_id))
    });
    let mut remaining = (pool as u128).saturating_sub(distributed);
    for (index, _) in remainders {
        if remaining == 0 {
            break;
        }
        shares[index].points += 1;
        remaining -= 1;
    }

    shares.retain(|share| share.points > 0);
    shares
}

/// Issues merchant vouchers once a customer's lifetime StepUp earnings cross
/// the configured trigger. Fires at most once per customer.
pub struct VoucherTriggerEngine {
    repository: Arc<dyn CascadeRepository>,
    purchases: Arc<dyn PurchaseHistory>,
    config: VoucherConfig,
}

impl VoucherTriggerEngine {
    pub fn new(
        repository: Arc<dyn CascadeRepository>,
        purchases: Arc<dyn PurchaseHistory>,
        config: VoucherConfig,
    ) -> Self {
        Self {
            repository,
            purchases,
            config,
        }
    }

    pub fn on_payment(
        &self,
        customer_id: &str,
        step_up_amount: u64,
    ) -> Result<VoucherOutcome, CascadeError> {
        let Some(customer) = self.repository.customer(customer_id)? else {
            return Ok(VoucherOutcome::BelowTrigger {
                lifetime_step_up_points: 0,
            });
        };
        if customer.voucher_issued {
            return Ok(VoucherOutcome::AlreadyIssued);
        }
        if customer.lifetime_step_up_points < self.config.trigger_lifetime_points {
            return Ok(VoucherOutcome::BelowTrigger {
                lifetime_step_up_points: customer.lifetime_step_up_points,
            });
        }

        let contributions = self.purchases.merchant_contributions(customer_id)?;
        let shares = split_voucher_pool(self.config.pool_points, &contributions);
        let created_at = now_unix_ms();
        let expires_at = created_at.saturating_add(
            (self.config.validity_days as i64).saturating_mul(MILLIS_PER_DAY),
        );
        let distributions = shares
            .into_iter()
            .map(|share| -> Result<VoucherDistribution, CascadeError> {
                Ok(VoucherDistribution {
                    customer_id: customer_id.to_string(),
                    merchant_id: share.merchant_id,
                    points_allocated: share.points,
                    voucher_code: generate_voucher_code(&self.config.code_prefix)?,
                    created_at_unix_ms: created_at,
                    expires_at_unix_ms: expires_at,
                })
            })
            .collect::<Result<Vec<_>, CascadeError>>()?;

        if !self
            .repository
            .issue_vouchers(customer_id, distributions.clone())?
        {
            return Ok(VoucherOutcome::AlreadyIssued);
        }
        tracing::info!(
            customer_id,
            step_up_amount,
            lifetime_step_up_points = customer.lifetime_step_up_points,
            vouchers = distributions.len(),
            "voucher trigger fired"
        );
        Ok(VoucherOutcome::Issued(distributions))
    }
}

impl StepUpPaymentListener for VoucherTriggerEngine {
    fn on_step_up_payment(&self, payment: &StepUpPaymentRecord) -> Result<(), CascadeError> {
        self.on_payment(&payment.recipient_customer_id, payment.reward_points)
            .map(|_| ())
    }
}

fn generate_voucher_code(prefix: &str) -> Result<String, CascadeError> {
    let mut bytes = [0u8; 16];
    OsRng
        .try_fill_bytes(&mut bytes)
        .map_err(|err| CollaboratorError::Unavailable {
            reason: format!("os randomness unavailable: {}", err),
        })?;
    Ok(format!("{}-{}", prefix, hex::encode_upper(bytes)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::InMemoryPurchaseHistory;
    use reward_cascade_proto::AssignmentRequest;
    use reward_cascade_store::CascadeStore;

    fn contributions(entries: &[(&str, u64)]) -> BTreeMap<String, u64> {
        entries
            .iter()
            .map(|(merchant, points)| (merchant.to_string(), *points))
            .collect()
    }

    fn numbered_customer(store: &CascadeStore, customer_id: &str, lifetime_step_up: u64) {
        store
            .assign_global_number(AssignmentRequest {
                customer_id: customer_id.to_string(),
                proposed: store.latest_global_number().expect("latest") + 1,
                points_at_assignment: 1_500,
                earned_points: 1_500,
                event_id: None,
                assigned_at_unix_ms: 0,
            })
            .expect("assign");
        if lifetime_step_up > 0 {
            store
                .record_step_up_payment(StepUpPaymentRecord {
                    recipient_global_number: 1,
                    recipient_customer_id: customer_id.to_string(),
                    trigger_global_number: 500,
                    multiplier: 500,
                    reward_points: lifetime_step_up,
                    paid: true,
                    paid_at_unix_ms: 0,
                })
                .expect("payment");
        }
    }

    #[test]
    fn split_is_proportional_for_exact_ratios() {
        let shares = split_voucher_pool(6_000, &contributions(&[("m-a", 300), ("m-b", 100)]));
        assert_eq!(
            shares
                .iter()
                .map(|share| (share.merchant_id.as_str(), share.points))
                .collect::<Vec<_>>(),
            vec![("m-a", 4_500), ("m-b", 1_500)]
        );
    }

    #[test]
    fn split_hands_floor_leftovers_to_largest_remainders() {
        let shares = split_voucher_pool(
            6_000,
            &contributions(&[("m-a", 1), ("m-b", 1), ("m-c", 1), ("m-d", 4)]),
        );
        let points = shares
            .iter()
            .map(|share| (share.merchant_id.as_str(), share.points))
            .collect::<Vec<_>>();
        // 6000/7 = 857 r1 for each single share, 24000/7 = 3428 r4.
        assert_eq!(
            points,
            vec![("m-a", 857), ("m-b", 857), ("m-c", 857), ("m-d", 3_429)]
        );
        assert_eq!(shares.iter().map(|share| share.points).sum::<u64>(), 6_000);
    }

    #[test]
    fn split_breaks_equal_remainders_by_merchant_id() {
        let shares = split_voucher_pool(
            100,
            &contributions(&[("m-c", 5), ("m-a", 5), ("m-b", 5)]),
        );
        assert_eq!(
            shares
                .iter()
                .map(|share| (share.merchant_id.as_str(), share.points))
                .collect::<Vec<_>>(),
            vec![("m-a", 34), ("m-b", 33), ("m-c", 33)]
        );
    }

    #[test]
    fn split_breaks_equal_remainders_by_larger_contribution() {
        // 2*1/4 and 2*3/4 both leave a remainder of 2; the larger contributor
        // takes the leftover point, leaving m-a with nothing.
        let shares = split_voucher_pool(2, &contributions(&[("m-a", 1), ("m-b", 3)]));
        assert_eq!(shares.len(), 1);
        assert_eq!(shares[0].merchant_id, "m-b");
        assert_eq!(shares[0].points, 2);
    }

    #[test]
    fn split_drops_empty_contributors() {
        assert!(split_voucher_pool(6_000, &BTreeMap::new()).is_empty());
        let shares = split_voucher_pool(6_000, &contributions(&[("m-a", 0), ("m-b", 9)]));
        assert_eq!(shares.len(), 1);
        assert_eq!(shares[0].points, 6_000);
    }

    #[test]
    fn fires_once_when_lifetime_crosses_trigger() {
        let store = Arc::new(CascadeStore::in_memory());
        let purchases = Arc::new(InMemoryPurchaseHistory::new());
        purchases.record_contribution("c-1", "m-a", 3_000);
        purchases.record_contribution("c-1", "m-b", 1_000);
        numbered_customer(&store, "c-1", 35_000);
        let engine =
            VoucherTriggerEngine::new(store.clone(), purchases, VoucherConfig::default());

        let VoucherOutcome::Issued(vouchers) = engine.on_payment("c-1", 30_000).expect("fire")
        else {
            panic!("expected vouchers");
        };
        assert_eq!(vouchers.len(), 2);
        assert_eq!(
            vouchers.iter().map(|v| v.points_allocated).sum::<u64>(),
            6_000
        );
        for voucher in &vouchers {
            assert!(voucher.voucher_code.starts_with("VCH-"));
            assert_eq!(
                voucher.expires_at_unix_ms - voucher.created_at_unix_ms,
                365 * MILLIS_PER_DAY
            );
        }
        assert_ne!(vouchers[0].voucher_code, vouchers[1].voucher_code);

        assert_eq!(
            engine.on_payment("c-1", 160_000).expect("second"),
            VoucherOutcome::AlreadyIssued
        );
        assert_eq!(store.voucher_distributions_for("c-1").expect("list").len(), 2);
    }

    #[test]
    fn no_history_still_consumes_the_trigger() {
        let store = Arc::new(CascadeStore::in_memory());
        let purchases = Arc::new(InMemoryPurchaseHistory::new());
        numbered_customer(&store, "c-1", 30_000);
        let engine =
            VoucherTriggerEngine::new(store.clone(), purchases.clone(), VoucherConfig::default());

        assert_eq!(
            engine.on_payment("c-1", 30_000).expect("fire"),
            VoucherOutcome::Issued(Vec::new())
        );
        let customer = store.customer("c-1").expect("read").expect("customer");
        assert!(customer.voucher_issued);

        purchases.record_contribution("c-1", "m-a", 10);
        assert_eq!(
            engine.on_payment("c-1", 500).expect("later"),
            VoucherOutcome::AlreadyIssued
        );
    }

    #[test]
    fn stays_quiet_below_trigger() {
        let store = Arc::new(CascadeStore::in_memory());
        numbered_customer(&store, "c-1", 29_999);
        let engine = VoucherTriggerEngine::new(
            store,
            Arc::new(InMemoryPurchaseHistory::new()),
            VoucherConfig::default(),
        );
        assert_eq!(
            engine.on_payment("c-1", 500).expect("check"),
            VoucherOutcome::BelowTrigger {
                lifetime_step_up_points: 29_999
            }
        );
    }
}
