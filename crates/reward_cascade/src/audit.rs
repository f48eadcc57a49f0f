use std::collections::BTreeMap;

use reward_cascade_proto::CascadeRepository;
use serde::{Deserialize, Serialize};

use crate::config::CascadeConfig;
use crate::util::hash_json;
use crate::CascadeError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct CascadeInvariantViolation {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct CascadeInvariantReport {
    pub total_global_numbers: u64,
    pub total_customers: usize,
    pub pending_cascades: usize,
    pub total_step_up_points: u64,
    pub total_ripple_points: u64,
    pub total_voucher_points: u64,
    /// sha256 over the serialized repository contents.
    pub state_digest: String,
    pub violations: Vec<CascadeInvariantViolation>,
}

impl CascadeInvariantReport {
    pub fn is_ok(&self) -> bool {
        self.violations.is_empty()
    }

    fn violation(&mut self, code: &str, message: String) {
        self.violations.push(CascadeInvariantViolation {
            code: code.to_string(),
            message,
        });
    }
}

/// Cross-checks everything the repository holds against the cascade rules.
pub fn audit_cascade(
    repository: &dyn CascadeRepository,
    config: &CascadeConfig,
) -> Result<CascadeInvariantReport, CascadeError> {
    let customers = repository.customers()?;
    let assignments = repository.assignments()?;
    let payments = repository.step_up_payments()?;
    let ripples = repository.ripple_rewards()?;
    let vouchers = repository.voucher_distributions()?;

    let mut report = CascadeInvariantReport {
        total_global_numbers: assignments.len() as u64,
        total_customers: customers.len(),
        pending_cascades: repository.pending_cascades()?.len(),
        total_step_up_points: payments.iter().map(|p| p.reward_points).sum(),
        total_ripple_points: ripples.iter().map(|r| r.ripple_amount).sum(),
        total_voucher_points: vouchers.iter().map(|v| v.points_allocated).sum(),
        state_digest: hash_json(&(&customers, &assignments, &payments, &ripples, &vouchers))?,
        violations: Vec::new(),
    };

    let holders = assignments
        .iter()
        .map(|assignment| (assignment.global_number, assignment.customer_id.as_str()))
        .collect::<BTreeMap<_, _>>();
    for (index, assignment) in assignments.iter().enumerate() {
        let expected = index as u64 + 1;
        if assignment.global_number != expected {
            report.violation(
                "global_number_gap",
                format!(
                    "expected global number {} at position {}, found {}",
                    expected, index, assignment.global_number
                ),
            );
        }
    }

    let customers_by_id = customers
        .iter()
        .map(|customer| (customer.customer_id.as_str(), customer))
        .collect::<BTreeMap<_, _>>();
    for assignment in &assignments {
        let held = customers_by_id
            .get(assignment.customer_id.as_str())
            .and_then(|customer| customer.global_number);
        if held != Some(assignment.global_number) {
            report.violation(
                "holder_mismatch",
                format!(
                    "global number {} assigned to {} but customer holds {:?}",
                    assignment.global_number, assignment.customer_id, held
                ),
            );
        }
    }
    for customer in &customers {
        if let Some(number) = customer.global_number {
            if holders.get(&number) != Some(&customer.customer_id.as_str()) {
                report.violation(
                    "holder_mismatch",
                    format!(
                        "customer {} claims global number {} without an assignment",
                        customer.customer_id, number
                    ),
                );
            }
        }
        if customer.accumulated_points >= config.threshold_points {
            report.violation(
                "accumulator_over_threshold",
                format!(
                    "customer {} holds {} accumulated points, threshold {}",
                    customer.customer_id, customer.accumulated_points, config.threshold_points
                ),
            );
        }
    }

    let tiers = config
        .step_up_tiers
        .iter()
        .map(|tier| (tier.multiplier, tier.reward_points))
        .collect::<BTreeMap<_, _>>();
    let mut step_up_by_customer = BTreeMap::<&str, u64>::new();
    for payment in &payments {
        let key = payment.key();
        if tiers.get(&payment.multiplier) != Some(&payment.reward_points)
            || payment.recipient_global_number.checked_mul(payment.multiplier)
                != Some(payment.trigger_global_number)
        {
            report.violation(
                "step_up_tier_mismatch",
                format!("payment {} of {} does not match a tier", key, payment.reward_points),
            );
        }
        if holders.get(&payment.recipient_global_number)
            != Some(&payment.recipient_customer_id.as_str())
        {
            report.violation(
                "step_up_recipient_mismatch",
                format!(
                    "payment {} credited {} who does not hold #{}",
                    key, payment.recipient_customer_id, payment.recipient_global_number
                ),
            );
        }
        if !holders.contains_key(&payment.trigger_global_number) {
            report.violation(
                "step_up_trigger_unissued",
                format!("payment {} triggered by an unissued number", key),
            );
        }
        *step_up_by_customer
            .entry(payment.recipient_customer_id.as_str())
            .or_insert(0) += payment.reward_points;
    }
    for customer in &customers {
        let paid = step_up_by_customer
            .get(customer.customer_id.as_str())
            .copied()
            .unwrap_or(0);
        if paid != customer.lifetime_step_up_points {
            report.violation(
                "lifetime_step_up_mismatch",
                format!(
                    "customer {} lifetime step-up {} but payments sum to {}",
                    customer.customer_id, customer.lifetime_step_up_points, paid
                ),
            );
        }
    }

    let rates = config
        .ripple_rates
        .iter()
        .map(|rate| (rate.step_up_amount, rate.ripple_amount))
        .collect::<BTreeMap<_, _>>();
    let payments_by_key = payments
        .iter()
        .map(|payment| (payment.key(), payment))
        .collect::<BTreeMap<_, _>>();
    for ripple in &ripples {
        if rates.get(&ripple.step_up_amount) != Some(&ripple.ripple_amount) {
            report.violation(
                "ripple_rate_mismatch",
                format!(
                    "ripple {} pays {} for step-up {}",
                    ripple.step_up_key, ripple.ripple_amount, ripple.step_up_amount
                ),
            );
        }
        match payments_by_key.get(&ripple.step_up_key) {
            Some(payment)
                if payment.reward_points == ripple.step_up_amount
                    && payment.recipient_customer_id == ripple.referred_id => {}
            _ => report.violation(
                "ripple_without_payment",
                format!("ripple {} has no matching step-up payment", ripple.step_up_key),
            ),
        }
        if ripple.referrer_id == ripple.referred_id {
            report.violation(
                "ripple_self_referral",
                format!("ripple {} pays {} for themselves", ripple.step_up_key, ripple.referrer_id),
            );
        }
    }

    let mut voucher_points_by_customer = BTreeMap::<&str, u64>::new();
    for voucher in &vouchers {
        *voucher_points_by_customer
            .entry(voucher.customer_id.as_str())
            .or_insert(0) += voucher.points_allocated;
    }
    for (customer_id, points) in voucher_points_by_customer {
        if points != config.voucher.pool_points {
            report.violation(
                "voucher_pool_mismatch",
                format!(
                    "customer {} vouchers sum to {}, pool {}",
                    customer_id, points, config.voucher.pool_points
                ),
            );
        }
        match customers_by_id.get(customer_id) {
            Some(customer)
                if customer.voucher_issued
                    && customer.lifetime_step_up_points
                        >= config.voucher.trigger_lifetime_points => {}
            _ => report.violation(
                "voucher_trigger_mismatch",
                format!("customer {} holds vouchers without a fired trigger", customer_id),
            ),
        }
    }

    Ok(report)
}
