//! Zone-level stochastic models.
//!
//! Each model produces a monthly log-price path per zone from one stream of
//! correlated shocks. Indices are exponentials of the log path, so they are
//! strictly positive with index[0] = 1.

use rand::rngs::StdRng;
use rand::Rng;
use statrs::distribution::Normal;

use super::correlation::{correlate, shock_transform};
use crate::config::{PriceModel, SimulationConfig, TimeStep};
use crate::error::SimError;
use crate::types::{PerZone, Zone};
use crate::SimResult;

pub struct ZonePathOutput {
    pub paths: PerZone<Vec<f64>>,
    /// Bull (0) / bear (1) state per month, regime-switching model only.
    pub regime_path: Option<Vec<u8>>,
    /// Cycle position per month, Sydney-cycle model only.
    pub cycle_positions: Option<Vec<f64>>,
    /// True when the correlation matrix had to be projected to PSD.
    pub correlation_projected: bool,
}

/// Simulate the three zone index series over the fund term.
pub fn simulate_zone_paths(
    config: &SimulationConfig,
    rng: &mut StdRng,
) -> SimResult<ZonePathOutput> {
    let pp = &config.price_path;
    let t_months = config.total_months() as usize;

    let (transform, correlation_projected) = shock_transform(pp.correlation_matrix);
    let unit = Normal::new(0.0, 1.0).map_err(|e| SimError::Internal {
        module: "price_path".into(),
        message: format!("unit normal: {e}"),
    })?;

    // Annual log drift and volatility per zone.
    let mu: [f64; 3] = [
        (1.0 + config.appreciation_rates.green).ln(),
        (1.0 + config.appreciation_rates.orange).ln(),
        (1.0 + config.appreciation_rates.red).ln(),
    ];
    let sigma: [f64; 3] = [
        pp.volatility.green,
        pp.volatility.orange,
        pp.volatility.red,
    ];

    // Regime-switching constants: center the state-conditional drifts on
    // their stationary mean so the long-run zone expectation stays at the
    // configured appreciation rate.
    let rs = &pp.regime_switching_params;
    let bull_mu = (1.0 + rs.bull_market_rate).ln();
    let bear_mu = (1.0 + rs.bear_market_rate).ln();
    let denom = rs.bull_to_bear_prob + rs.bear_to_bull_prob;
    let pi_bull = if denom > 0.0 {
        rs.bear_to_bull_prob / denom
    } else {
        1.0
    };
    let regime_mean = pi_bull * bull_mu + (1.0 - pi_bull) * bear_mu;

    let mr = &pp.mean_reversion_params;
    let long_term_mu = (1.0 + mr.long_term_mean).ln();

    let mut log_price = [0.0f64; 3];
    let mut paths = PerZone::new(
        Vec::with_capacity(t_months + 1),
        Vec::with_capacity(t_months + 1),
        Vec::with_capacity(t_months + 1),
    );
    for zone in Zone::ALL {
        paths.get_mut(zone).push(1.0);
    }

    let mut regime: u8 = 0;
    let mut regime_path = (pp.model_type == PriceModel::RegimeSwitching).then(|| vec![0u8]);
    let mut cycle_positions =
        (pp.model_type == PriceModel::SydneyCycle).then(|| vec![pp.cycle_position]);

    for m in 1..=t_months {
        let is_step = match pp.time_step {
            TimeStep::Monthly => true,
            TimeStep::Yearly => m % 12 == 0,
        };
        let dt = match pp.time_step {
            TimeStep::Monthly => 1.0 / 12.0,
            TimeStep::Yearly => 1.0,
        };
        let t_years = m as f64 / 12.0;
        let cycle_pos = (pp.cycle_position + t_years / pp.cycle_period_years).fract();

        if is_step {
            // One correlated shock vector per step, always consumed in zone
            // order so the draw sequence is independent of the model.
            let z = [rng.sample(unit), rng.sample(unit), rng.sample(unit)];
            let eps = correlate(&transform, z);

            if pp.model_type == PriceModel::RegimeSwitching {
                let flip_prob = if regime == 0 {
                    rs.bull_to_bear_prob
                } else {
                    rs.bear_to_bull_prob
                };
                let step_prob = 1.0 - (1.0 - flip_prob).powf(dt * 12.0);
                if rng.gen::<f64>() < step_prob {
                    regime = 1 - regime;
                }
            }

            for (i, zone) in Zone::ALL.into_iter().enumerate() {
                let x = log_price[i];
                let next = match pp.model_type {
                    PriceModel::Gbm => {
                        x + (mu[i] - 0.5 * sigma[i] * sigma[i]) * dt
                            + sigma[i] * dt.sqrt() * eps[i]
                    }
                    PriceModel::MeanReversion => {
                        let trend = long_term_mu * t_years;
                        x + mr.speed * (trend - x) * dt + sigma[i] * dt.sqrt() * eps[i]
                    }
                    PriceModel::RegimeSwitching => {
                        let state_mu = if regime == 0 { bull_mu } else { bear_mu };
                        let vol = if regime == 0 {
                            sigma[i]
                        } else {
                            sigma[i] * rs.bear_vol_multiplier
                        };
                        let drift = mu[i] + (state_mu - regime_mean);
                        x + (drift - 0.5 * vol * vol) * dt + vol * dt.sqrt() * eps[i]
                    }
                    PriceModel::SydneyCycle => {
                        let cyclical = pp.cycle_amplitude
                            * (std::f64::consts::TAU * cycle_pos).sin();
                        x + (mu[i] + cyclical - 0.5 * sigma[i] * sigma[i]) * dt
                            + sigma[i] * dt.sqrt() * eps[i]
                    }
                };
                log_price[i] = next;
                paths.get_mut(zone).push(next.exp());
            }
        } else {
            for zone in Zone::ALL {
                let last = *paths.get(zone).last().unwrap_or(&1.0);
                paths.get_mut(zone).push(last);
            }
        }

        if let Some(rp) = regime_path.as_mut() {
            rp.push(regime);
        }
        if let Some(cp) = cycle_positions.as_mut() {
            cp.push(cycle_pos);
        }
    }

    Ok(ZonePathOutput {
        paths,
        regime_path,
        cycle_positions,
        correlation_projected,
    })
}

/// Multiplicative idiosyncratic factor path: a martingale log-normal walk
/// with annualized dispersion `variation`.
pub fn idiosyncratic_factor_path(rng: &mut StdRng, months: usize, variation: f64) -> Vec<f64> {
    let mut path = Vec::with_capacity(months + 1);
    path.push(1.0);
    if variation <= 0.0 {
        path.resize(months + 1, 1.0);
        return path;
    }
    let dt = 1.0 / 12.0;
    let unit = Normal::new(0.0, 1.0).expect("unit normal");
    let mut value = 1.0f64;
    for _ in 0..months {
        let eps: f64 = rng.sample(unit);
        value *= (-0.5 * variation * variation * dt + variation * dt.sqrt() * eps).exp();
        path.push(value);
    }
    path
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    const SEED: u64 = 42;

    fn config_with_model(model: PriceModel) -> SimulationConfig {
        let mut config = SimulationConfig::default();
        config.price_path.model_type = model;
        config
    }

    fn paths_for(model: PriceModel) -> ZonePathOutput {
        let config = config_with_model(model);
        let mut rng = StdRng::seed_from_u64(SEED);
        simulate_zone_paths(&config, &mut rng).unwrap()
    }

    #[test]
    fn test_all_models_anchor_and_stay_positive() {
        for model in [
            PriceModel::Gbm,
            PriceModel::MeanReversion,
            PriceModel::RegimeSwitching,
            PriceModel::SydneyCycle,
        ] {
            let out = paths_for(model);
            for zone in Zone::ALL {
                let path = out.paths.get(zone);
                assert_eq!(path.len(), 121);
                assert_eq!(path[0], 1.0);
                assert!(path.iter().all(|v| *v > 0.0), "{model:?} {zone}");
            }
        }
    }

    #[test]
    fn test_gbm_long_run_drift() {
        // Average terminal growth over many seeded runs should be near the
        // configured appreciation rate.
        let config = config_with_model(PriceModel::Gbm);
        let mut terminal_log = 0.0;
        let n = 200;
        for seed in 0..n {
            let mut rng = StdRng::seed_from_u64(seed);
            let out = simulate_zone_paths(&config, &mut rng).unwrap();
            terminal_log += out.paths.green.last().unwrap().ln();
        }
        let annualized = (terminal_log / n as f64) / 10.0;
        let expected = (1.0f64 + 0.05).ln() - 0.5 * 0.05 * 0.05;
        assert!(
            (annualized - expected).abs() < 0.01,
            "annualized={annualized} expected={expected}"
        );
    }

    #[test]
    fn test_regime_model_reports_states() {
        let out = paths_for(PriceModel::RegimeSwitching);
        let regimes = out.regime_path.unwrap();
        assert_eq!(regimes.len(), 121);
        assert!(regimes.iter().all(|r| *r <= 1));
        // With monthly flip probabilities of 0.1/0.3 a 10-year path should
        // visit both states.
        assert!(regimes.iter().any(|r| *r == 1));
    }

    #[test]
    fn test_cycle_positions_wrap() {
        let out = paths_for(PriceModel::SydneyCycle);
        let positions = out.cycle_positions.unwrap();
        assert_eq!(positions.len(), 121);
        assert!(positions.iter().all(|p| (0.0..1.0).contains(p)));
        assert_eq!(positions[0], 0.5);
    }

    #[test]
    fn test_yearly_time_step_holds_within_year() {
        let mut config = config_with_model(PriceModel::Gbm);
        config.price_path.time_step = TimeStep::Yearly;
        let mut rng = StdRng::seed_from_u64(SEED);
        let out = simulate_zone_paths(&config, &mut rng).unwrap();
        let path = &out.paths.green;
        // Months 1..11 copy the anchor; the first move lands at month 12.
        assert_eq!(path[1], 1.0);
        assert_eq!(path[11], 1.0);
        assert_ne!(path[12], path[11]);
        assert_eq!(path[13], path[12]);
    }

    #[test]
    fn test_identity_correlation_not_projected() {
        let mut config = config_with_model(PriceModel::Gbm);
        config.price_path.correlation_matrix =
            [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]];
        let mut rng = StdRng::seed_from_u64(SEED);
        let out = simulate_zone_paths(&config, &mut rng).unwrap();
        assert!(!out.correlation_projected);
    }

    #[test]
    fn test_invalid_correlation_flagged() {
        let mut config = config_with_model(PriceModel::Gbm);
        config.price_path.correlation_matrix =
            [[1.0, 0.9, -0.9], [0.9, 1.0, 0.9], [-0.9, 0.9, 1.0]];
        let mut rng = StdRng::seed_from_u64(SEED);
        let out = simulate_zone_paths(&config, &mut rng).unwrap();
        assert!(out.correlation_projected);
    }

    #[test]
    fn test_factor_path_is_centered() {
        let mut rng = StdRng::seed_from_u64(SEED);
        let mut sum = 0.0;
        let n = 500;
        for _ in 0..n {
            let path = idiosyncratic_factor_path(&mut rng, 120, 0.02);
            assert_eq!(path[0], 1.0);
            assert!(path.iter().all(|v| *v > 0.0));
            sum += path.last().unwrap();
        }
        let mean = sum / n as f64;
        assert!((mean - 1.0).abs() < 0.01, "mean terminal factor {mean}");
    }

    #[test]
    fn test_zero_variation_factor_is_flat() {
        let mut rng = StdRng::seed_from_u64(SEED);
        let path = idiosyncratic_factor_path(&mut rng, 24, 0.0);
        assert!(path.iter().all(|v| *v == 1.0));
    }
}
