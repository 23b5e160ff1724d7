// =============================================================================
// Fee estimation — a trade profitable on paper must be profitable in reality
// =============================================================================
//
// Two schedules:
//   Flat      — fixed taker fee per contract per leg (the common configured
//               case, and what the end-to-end scenarios assume).
//   Quadratic — the exchange's published curve, ceil(rate * p * (100 - p))
//               with p in cents, which peaks at even-money contracts.
// =============================================================================

use serde::{Deserialize, Serialize};

use crate::opportunity::Leg;

/// Which fee curve applies.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum FeeModel {
    Flat { cents_per_contract: i64 },
    Quadratic { rate: f64 },
}

/// Fee schedule used by the detector and the execution engine.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FeeSchedule {
    model: FeeModel,
}

impl FeeSchedule {
    pub fn flat(cents_per_contract: i64) -> Self {
        Self {
            model: FeeModel::Flat { cents_per_contract },
        }
    }

    /// The exchange's quadratic taker schedule (7% of p(1-p) notional).
    pub fn exchange_quadratic() -> Self {
        Self {
            model: FeeModel::Quadratic { rate: 7.0 },
        }
    }

    /// Fee charged for one contract traded at `limit_price` cents.
    pub fn per_contract(&self, limit_price: i64) -> i64 {
        match self.model {
            FeeModel::Flat { cents_per_contract } => cents_per_contract,
            FeeModel::Quadratic { rate } => {
                let p = limit_price.clamp(0, 100) as f64;
                // rate percent of p(1-p) dollar notional, in cents, rounded up.
                (rate / 100.0 * p * (100.0 - p) / 100.0).ceil() as i64
            }
        }
    }

    /// Per-unit fee estimate for a multi-leg trade: one contract on every leg.
    pub fn per_unit(&self, legs: &[Leg]) -> i64 {
        legs.iter().map(|l| self.per_contract(l.limit_price)).sum()
    }

    /// Total fee estimate for `count` unit sets across all legs.
    pub fn estimate(&self, legs: &[Leg], count: u32) -> i64 {
        self.per_unit(legs) * count as i64
    }
}

impl Default for FeeSchedule {
    fn default() -> Self {
        Self::flat(2)
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Action, Side};

    fn leg(limit: i64) -> Leg {
        Leg {
            ticker: "T".to_string(),
            side: Side::Yes,
            action: Action::Buy,
            limit_price: limit,
            observed_depth: 10,
        }
    }

    #[test]
    fn flat_fee_is_per_contract_per_leg() {
        let fees = FeeSchedule::flat(2);
        let legs = vec![leg(52), leg(58)];
        assert_eq!(fees.per_unit(&legs), 4);
        assert_eq!(fees.estimate(&legs, 10), 40);
    }

    #[test]
    fn quadratic_peaks_at_even_money() {
        let fees = FeeSchedule::exchange_quadratic();
        // 0.07 * 0.50 * 0.50 dollars = 1.75 cents, rounded up.
        assert_eq!(fees.per_contract(50), 2);
        // 0.07 * 0.10 * 0.90 dollars = 0.63 cents, rounded up.
        assert_eq!(fees.per_contract(10), 1);
        assert!(fees.per_contract(50) >= fees.per_contract(90));
    }

    #[test]
    fn quadratic_is_clamped_to_price_domain() {
        let fees = FeeSchedule::exchange_quadratic();
        assert_eq!(fees.per_contract(0), 0);
        assert_eq!(fees.per_contract(100), 0);
        assert_eq!(fees.per_contract(150), 0);
    }

    #[test]
    fn four_leg_partition_unit_fee() {
        let fees = FeeSchedule::flat(2);
        let legs = vec![leg(20), leg(25), leg(25), leg(22)];
        assert_eq!(fees.per_unit(&legs), 8);
        let cheap = FeeSchedule::flat(1);
        assert_eq!(cheap.per_unit(&legs), 4);
    }
}
