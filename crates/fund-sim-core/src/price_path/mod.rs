//! Price-path engine.
//!
//! Zone indices come from one of four stochastic models driven by
//! correlated shocks; suburb and property series nest inside their zone
//! path through bounded idiosyncratic factors. Every series is anchored at
//! 1.0 and strictly positive.

pub mod correlation;
pub mod models;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::info;

use crate::config::SimulationConfig;
use crate::engine::control::{CancelFlag, ProgressSink};
use crate::error::GuardrailViolation;
use crate::financial;
use crate::loans::Loan;
use crate::types::{PerZone, Zone};
use crate::SimResult;

pub use models::simulate_zone_paths;

const MODULE: &str = "price_path";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ZoneStatistics {
    pub mean_annual_return: f64,
    pub volatility: f64,
    pub sharpe_ratio: f64,
    pub max_drawdown: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PricePathStatistics {
    pub zone_stats: PerZone<ZoneStatistics>,
    /// Realized correlations of monthly zone log-returns, zone order
    /// green/orange/red.
    pub realized_correlations: [[f64; 3]; 3],
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PricePaths {
    /// Number of monthly steps; every series has `months + 1` points.
    pub months: usize,
    pub zone: PerZone<Vec<f64>>,
    pub suburb: BTreeMap<String, Vec<f64>>,
    pub property: BTreeMap<String, Vec<f64>>,
    pub statistics: PricePathStatistics,
    pub regime_path: Option<Vec<u8>>,
    pub cycle_positions: Option<Vec<f64>>,
}

impl PricePaths {
    /// Most specific series available for a loan: property, then suburb,
    /// then zone.
    pub fn series_for(&self, zone: Zone, suburb_id: &str, property_id: &str) -> &[f64] {
        if let Some(path) = self.property.get(property_id) {
            return path;
        }
        if let Some(path) = self.suburb.get(suburb_id) {
            return path;
        }
        self.zone.get(zone)
    }

    /// Index ratio between two months for a loan's property.
    pub fn index_ratio(
        &self,
        zone: Zone,
        suburb_id: &str,
        property_id: &str,
        from_month: usize,
        to_month: usize,
    ) -> f64 {
        let series = self.series_for(zone, suburb_id, property_id);
        let from = series[from_month.min(series.len() - 1)];
        let to = series[to_month.min(series.len() - 1)];
        to / from
    }
}

/// Property value at a month, used by the exit simulator and the API
/// surface.
pub fn calculate_property_value(
    paths: &PricePaths,
    initial_value: f64,
    zone: Zone,
    suburb_id: &str,
    property_id: &str,
    month: usize,
) -> f64 {
    let series = paths.series_for(zone, suburb_id, property_id);
    initial_value * series[month.min(series.len() - 1)]
}

fn zone_statistics(config: &SimulationConfig, paths: &PerZone<Vec<f64>>) -> PricePathStatistics {
    let risk_free = config.risk_metrics.risk_free_rate;

    let log_returns: PerZone<Vec<f64>> = paths.map(|_, series| {
        series
            .windows(2)
            .map(|w| (w[1] / w[0]).ln())
            .collect::<Vec<f64>>()
    });

    let zone_stats = log_returns.map(|zone, returns| {
        let mean_annual = financial::mean(returns) * 12.0;
        let volatility = financial::std_dev(returns) * 12f64.sqrt();
        let sharpe = if volatility > 0.0 {
            (mean_annual - risk_free) / volatility
        } else {
            0.0
        };
        ZoneStatistics {
            mean_annual_return: mean_annual,
            volatility,
            sharpe_ratio: sharpe,
            max_drawdown: financial::max_drawdown(paths.get(zone)),
        }
    });

    let series = [&log_returns.green, &log_returns.orange, &log_returns.red];
    let mut realized = [[0.0; 3]; 3];
    for (i, row) in realized.iter_mut().enumerate() {
        for (j, cell) in row.iter_mut().enumerate() {
            *cell = if i == j {
                1.0
            } else {
                financial::correlation(series[i], series[j])
            };
        }
    }

    PricePathStatistics {
        zone_stats,
        realized_correlations: realized,
    }
}

/// Generate all price series for the run.
///
/// Suburb and property factor paths are generated only for locations the
/// loan book references, from per-location seeds pre-sampled in sorted
/// order so the output is independent of iteration details.
pub fn simulate(
    config: &SimulationConfig,
    loans: &[Loan],
    rng: &mut StdRng,
    cancel: &CancelFlag,
    progress: &ProgressSink,
) -> SimResult<(PricePaths, Vec<GuardrailViolation>)> {
    progress.emit(MODULE, 0.0, "simulating zone price indices");
    let mut advisories = Vec::new();

    let zone_output = models::simulate_zone_paths(config, rng)?;
    if zone_output.correlation_projected {
        advisories.push(GuardrailViolation::advisory(
            "non_psd_correlation",
            MODULE,
            "correlation matrix was not positive semi-definite; projected by eigenvalue flooring",
        ));
    }

    let months = config.total_months() as usize;
    let pp = &config.price_path;

    // Locations referenced by the book, in deterministic order.
    let suburb_ids: BTreeSet<&str> = loans.iter().map(|l| l.suburb_id.as_str()).collect();
    let property_refs: BTreeMap<&str, (&str, Zone)> = loans
        .iter()
        .map(|l| (l.property_id.as_str(), (l.suburb_id.as_str(), l.zone)))
        .collect();
    let suburb_zone: BTreeMap<&str, Zone> =
        loans.iter().map(|l| (l.suburb_id.as_str(), l.zone)).collect();

    // Pre-sample one seed per location.
    let suburb_seeds: Vec<(&str, u64)> =
        suburb_ids.iter().map(|id| (*id, rng.gen::<u64>())).collect();
    let property_seeds: Vec<(&str, u64)> = property_refs
        .keys()
        .map(|id| (*id, rng.gen::<u64>()))
        .collect();

    progress.emit(MODULE, 40.0, "layering suburb and property variation");

    let mut suburb_paths: BTreeMap<String, Vec<f64>> = BTreeMap::new();
    for (count, (suburb_id, seed)) in suburb_seeds.iter().enumerate() {
        if count % 100 == 0 {
            cancel.check(MODULE)?;
        }
        let mut factor_rng = StdRng::seed_from_u64(*seed);
        let factor =
            models::idiosyncratic_factor_path(&mut factor_rng, months, pp.suburb_variation);
        let zone_series = zone_output.paths.get(suburb_zone[suburb_id]);
        let series: Vec<f64> = zone_series
            .iter()
            .zip(&factor)
            .map(|(z, f)| z * f)
            .collect();
        suburb_paths.insert(suburb_id.to_string(), series);
    }

    let mut property_paths: BTreeMap<String, Vec<f64>> = BTreeMap::new();
    for (count, (property_id, seed)) in property_seeds.iter().enumerate() {
        if count % 100 == 0 {
            cancel.check(MODULE)?;
        }
        let (suburb_id, zone) = property_refs[property_id];
        let mut factor_rng = StdRng::seed_from_u64(*seed);
        let factor =
            models::idiosyncratic_factor_path(&mut factor_rng, months, pp.property_variation);
        let base: &[f64] = suburb_paths
            .get(suburb_id)
            .map(|s| s.as_slice())
            .unwrap_or_else(|| zone_output.paths.get(zone));
        let series: Vec<f64> = base.iter().zip(&factor).map(|(b, f)| b * f).collect();
        property_paths.insert(property_id.to_string(), series);
    }

    let statistics = zone_statistics(config, &zone_output.paths);

    info!(
        suburbs = suburb_paths.len(),
        properties = property_paths.len(),
        model = ?pp.model_type,
        "price paths generated"
    );
    progress.emit(MODULE, 100.0, "price paths ready");

    Ok((
        PricePaths {
            months,
            zone: zone_output.paths,
            suburb: suburb_paths,
            property: property_paths,
            statistics,
            regime_path: zone_output.regime_path,
            cycle_positions: zone_output.cycle_positions,
        },
        advisories,
    ))
}
