//! Capital allocator: target zone weights to per-zone dollar budgets.
//!
//! Budget arithmetic runs in `Decimal` so the three budgets always sum back
//! to the fund size to the cent; the stochastic modules downstream consume
//! the f64 projection.

use rust_decimal::prelude::*;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::config::SimulationConfig;
use crate::types::{PerZone, Zone};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapitalAllocation {
    /// Target weights from the configuration.
    pub zone_targets: PerZone<f64>,
    /// Dollar budget per zone; sums to `fund_size` exactly.
    pub capital_by_zone: PerZone<f64>,
    pub fund_size: f64,
}

/// One rebalancing step: a positive amount buys into the zone, a negative
/// amount trims it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RebalanceAdjustment {
    pub zone: Zone,
    pub amount: f64,
    /// Weight gap (target - actual) that motivated the adjustment.
    pub gap: f64,
}

/// Translate target zone weights into dollar budgets.
pub fn allocate(config: &SimulationConfig) -> CapitalAllocation {
    let fund_size = Decimal::from_f64(config.fund_size).unwrap_or_default();
    let weights = config.zone_allocations;

    let green = (fund_size * Decimal::from_f64(weights.green).unwrap_or_default())
        .round_dp(2);
    let orange = (fund_size * Decimal::from_f64(weights.orange).unwrap_or_default())
        .round_dp(2);
    // The last zone takes the residual so rounding never loses a cent.
    let red = fund_size - green - orange;

    CapitalAllocation {
        zone_targets: weights,
        capital_by_zone: PerZone::new(
            green.to_f64().unwrap_or(0.0),
            orange.to_f64().unwrap_or(0.0),
            red.to_f64().unwrap_or(0.0),
        ),
        fund_size: config.fund_size,
    }
}

/// Rebalancing advice: the adjustments that bring actual zone weights to
/// within `tolerance` of target, largest gap first. Zones already inside
/// the band get no adjustment.
pub fn rebalance_advice(
    targets: &PerZone<f64>,
    actual: &PerZone<f64>,
    fund_size: f64,
    tolerance: f64,
) -> Vec<RebalanceAdjustment> {
    let actual_total = actual.sum();
    let mut gaps: Vec<(Zone, f64)> = Zone::ALL
        .iter()
        .map(|&zone| {
            let actual_weight = if actual_total > 0.0 {
                actual.get(zone) / actual_total
            } else {
                0.0
            };
            (zone, targets.get(zone) - actual_weight)
        })
        .collect();

    gaps.sort_by(|a, b| {
        b.1.abs()
            .partial_cmp(&a.1.abs())
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    gaps.into_iter()
        .filter(|(_, gap)| gap.abs() > tolerance)
        .map(|(zone, gap)| {
            let amount_cents =
                Decimal::from_f64(gap * fund_size).unwrap_or_default().round_dp(2);
            RebalanceAdjustment {
                zone,
                amount: amount_cents.to_f64().unwrap_or(0.0),
                gap,
            }
        })
        .collect()
}

/// Dollar cent used by the allocation-sum tests.
pub const ONE_CENT: Decimal = dec!(0.01);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SimulationConfig;

    #[test]
    fn test_budgets_sum_to_fund_size() {
        let mut config = SimulationConfig::default();
        // Weights that do not divide evenly in binary.
        config.zone_allocations = PerZone::new(0.47, 0.33, 0.2);
        config.fund_size = 99_999_999.0;
        let allocation = allocate(&config);
        let total = Decimal::from_f64(allocation.capital_by_zone.sum()).unwrap();
        let fund = Decimal::from_f64(config.fund_size).unwrap();
        assert!((total - fund).abs() <= ONE_CENT, "total={total}");
    }

    #[test]
    fn test_budgets_match_weights() {
        let config = SimulationConfig::default();
        let allocation = allocate(&config);
        assert_eq!(allocation.capital_by_zone.green, 60_000_000.0);
        assert_eq!(allocation.capital_by_zone.orange, 30_000_000.0);
        assert_eq!(allocation.capital_by_zone.red, 10_000_000.0);
    }

    #[test]
    fn test_rebalance_within_tolerance_is_empty() {
        let targets = PerZone::new(0.6, 0.3, 0.1);
        let actual = PerZone::new(60.5e6, 29.5e6, 10.0e6);
        let advice = rebalance_advice(&targets, &actual, 100e6, 0.02);
        assert!(advice.is_empty());
    }

    #[test]
    fn test_rebalance_largest_gap_first() {
        let targets = PerZone::new(0.6, 0.3, 0.1);
        // Green badly underweight, red overweight.
        let actual = PerZone::new(40e6, 30e6, 30e6);
        let advice = rebalance_advice(&targets, &actual, 100e6, 0.01);
        assert_eq!(advice.len(), 2);
        assert_eq!(advice[0].zone, Zone::Green);
        assert!(advice[0].amount > 0.0);
        assert_eq!(advice[1].zone, Zone::Red);
        assert!(advice[1].amount < 0.0);
    }

    #[test]
    fn test_rebalance_empty_portfolio() {
        let targets = PerZone::new(0.6, 0.3, 0.1);
        let actual = PerZone::new(0.0, 0.0, 0.0);
        let advice = rebalance_advice(&targets, &actual, 100e6, 0.01);
        // Every zone is below target when nothing is deployed.
        assert_eq!(advice.len(), 3);
        assert_eq!(advice[0].zone, Zone::Green);
    }
}
