//! Risk and performance metrics.
//!
//! Consumes the loan book, realized exits, price paths, cashflows, and TLS
//! suburb data, and emits the six metric groups plus stress tests,
//! sensitivity sweeps, and visualization payloads. Tail metrics use the
//! Monte-Carlo distribution when one was produced; otherwise the analytic
//! log-normal approximation is reported with `is_approximation` set, and
//! strictly simulation-only metrics return `requires_mc`.

use serde::{Deserialize, Serialize};
use statrs::distribution::{Continuous, ContinuousCDF, Gamma, Normal};
use std::collections::BTreeMap;
use tracing::info;

use crate::cashflow::CashflowBundle;
use crate::config::{SimulationConfig, StressScenarioSpec};
use crate::engine::control::{CancelFlag, ProgressSink};
use crate::error::GuardrailViolation;
use crate::exits::ExitRecord;
use crate::financial;
use crate::loans::Loan;
use crate::monte_carlo::McSummary;
use crate::price_path::PricePaths;
use crate::tls::{SuburbData, TlsDataProvider};
use crate::types::{MetricValue, PerZone, Zone};
use crate::SimResult;

const MODULE: &str = "risk_metrics";

// ---------------------------------------------------------------------------
// Metric groups
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketPriceMetrics {
    pub portfolio_volatility: f64,
    pub zone_volatility: PerZone<f64>,
    /// Share of price variance idiosyncratic to suburbs (exposure-weighted).
    pub alpha_idiosyncratic_share: f64,
    pub beta_macro: f64,
    pub zone_beta: PerZone<f64>,
    pub var_95: MetricValue,
    pub var_99: MetricValue,
    pub cvar_95: MetricValue,
    pub cvar_99: MetricValue,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreditMetrics {
    /// Exposure-weighted LTV at exit.
    pub portfolio_ltv: f64,
    pub zone_ltv: PerZone<f64>,
    pub top_suburb_ltv: BTreeMap<String, f64>,
    /// Portfolio LTV under the configured price shock.
    pub stress_ltv: f64,
    pub default_probability_by_zone: PerZone<f64>,
    pub portfolio_default_rate: f64,
    /// Share of loans that actually defaulted.
    pub realized_default_rate: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiquidityMetrics {
    /// Exposure-weighted TLS liquidity score, 0..1.
    pub portfolio_liquidity_score: f64,
    /// Gamma-model expected months to exit a position.
    pub expected_exit_lag_months: f64,
    pub exit_lag_p95_months: f64,
    pub wal_years: f64,
    pub cfar_95: MetricValue,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeverageMetrics {
    pub nav_utilisation: f64,
    pub interest_coverage: MetricValue,
    pub var_uplift: MetricValue,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConcentrationMetrics {
    pub zone_exposure: PerZone<f64>,
    pub top_suburb_exposure: Vec<(String, f64)>,
    pub single_loan_exposure: f64,
    pub zone_hhi: f64,
    pub suburb_hhi: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    pub net_irr: MetricValue,
    pub sharpe_ratio: f64,
    pub sortino_ratio: f64,
    pub calmar_ratio: f64,
    pub information_ratio: f64,
    pub treynor_ratio: f64,
    pub omega_ratio: f64,
    pub kappa_3: f64,
    pub gain_loss_ratio: f64,
    pub hurdle_clear_probability: MetricValue,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StressTestResult {
    pub name: String,
    pub property_value_shock: f64,
    pub interest_rate_shock: f64,
    pub default_rate_multiplier: f64,
    pub liquidity_shock: f64,
    pub irr: f64,
    pub moic: f64,
    pub roi: f64,
    pub max_drawdown: f64,
    pub var_95: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskSensitivityPoint {
    pub shock: f64,
    pub irr: f64,
    pub moic: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskSensitivitySweep {
    pub parameter: String,
    pub points: Vec<RiskSensitivityPoint>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScatterPoint {
    pub label: String,
    pub risk: f64,
    pub ret: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DrawdownPoint {
    pub month: usize,
    pub drawdown: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StressComparisonRow {
    pub scenario: String,
    pub irr: f64,
    pub moic: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskVisualization {
    pub risk_return_scatter: Vec<ScatterPoint>,
    pub drawdown_chart: Vec<DrawdownPoint>,
    pub stress_comparison: Vec<StressComparisonRow>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskMetrics {
    pub market_price_metrics: MarketPriceMetrics,
    pub credit_metrics: CreditMetrics,
    pub liquidity_metrics: LiquidityMetrics,
    pub leverage_metrics: LeverageMetrics,
    pub concentration_metrics: ConcentrationMetrics,
    pub performance_metrics: PerformanceMetrics,
    pub stress_test_results: Vec<StressTestResult>,
    pub sensitivity_analysis: Vec<RiskSensitivitySweep>,
    pub visualization: RiskVisualization,
}

// ---------------------------------------------------------------------------
// Shared context
// ---------------------------------------------------------------------------

struct Inputs<'a> {
    config: &'a SimulationConfig,
    loans: &'a [Loan],
    exits: &'a BTreeMap<String, ExitRecord>,
    paths: &'a PricePaths,
    cashflows: &'a CashflowBundle,
    mc: Option<&'a McSummary>,
    /// TLS suburb records for every suburb the book touches.
    suburbs: BTreeMap<String, SuburbData>,
    /// Per-loan exposure weights, aligned with `loans`.
    weights: Vec<f64>,
    /// Exposure weights by zone.
    zone_weights: PerZone<f64>,
    /// Portfolio monthly log-returns (exposure-weighted zone returns).
    portfolio_returns: Vec<f64>,
    /// Macro benchmark monthly log-returns (TLS zone-distribution weights).
    macro_returns: Vec<f64>,
}

fn zone_log_returns(paths: &PricePaths, zone: Zone) -> Vec<f64> {
    paths
        .zone
        .get(zone)
        .windows(2)
        .map(|w| (w[1] / w[0]).ln())
        .collect()
}

fn build_inputs<'a>(
    config: &'a SimulationConfig,
    tls: &dyn TlsDataProvider,
    loans: &'a [Loan],
    exits: &'a BTreeMap<String, ExitRecord>,
    paths: &'a PricePaths,
    cashflows: &'a CashflowBundle,
    mc: Option<&'a McSummary>,
) -> Inputs<'a> {
    let total_exposure: f64 = loans.iter().map(|l| l.loan_size).sum::<f64>().max(1.0);
    let weights: Vec<f64> = loans.iter().map(|l| l.loan_size / total_exposure).collect();

    let mut zone_weights = PerZone::new(0.0, 0.0, 0.0);
    for (loan, w) in loans.iter().zip(&weights) {
        *zone_weights.get_mut(loan.zone) += w;
    }

    let mut suburbs = BTreeMap::new();
    for loan in loans {
        if !suburbs.contains_key(&loan.suburb_id) {
            if let Some(data) = tls.suburb_data(&loan.suburb_id) {
                suburbs.insert(loan.suburb_id.clone(), data);
            }
        }
    }

    let returns_by_zone: PerZone<Vec<f64>> =
        PerZone::new(Zone::Green, Zone::Orange, Zone::Red).map(|_, z| zone_log_returns(paths, *z));
    let n = returns_by_zone.green.len();
    let macro_weights = tls.zone_distribution();

    let mut portfolio_returns = Vec::with_capacity(n);
    let mut macro_returns = Vec::with_capacity(n);
    for i in 0..n {
        let mut port = 0.0;
        let mut mac = 0.0;
        for zone in Zone::ALL {
            port += zone_weights.get(zone) * returns_by_zone.get(zone)[i];
            mac += macro_weights.get(zone) * returns_by_zone.get(zone)[i];
        }
        portfolio_returns.push(port);
        macro_returns.push(mac);
    }

    Inputs {
        config,
        loans,
        exits,
        paths,
        cashflows,
        mc,
        suburbs,
        weights,
        zone_weights,
        portfolio_returns,
        macro_returns,
    }
}

// ---------------------------------------------------------------------------
// Group builders
// ---------------------------------------------------------------------------

fn market_price_metrics(inputs: &Inputs) -> MarketPriceMetrics {
    let config = inputs.config;
    let stats = &inputs.paths.statistics;

    let zone_volatility = stats.zone_stats.map(|_, s| s.volatility);
    let portfolio_volatility = financial::std_dev(&inputs.portfolio_returns) * 12f64.sqrt();
    let mean_annual = financial::mean(&inputs.portfolio_returns) * 12.0;

    let macro_var = financial::covariance(&inputs.macro_returns, &inputs.macro_returns);
    let beta_macro = if macro_var > 0.0 {
        financial::covariance(&inputs.portfolio_returns, &inputs.macro_returns) / macro_var
    } else {
        0.0
    };
    let zone_beta = PerZone::new(Zone::Green, Zone::Orange, Zone::Red).map(|_, z| {
        if macro_var > 0.0 {
            financial::covariance(&zone_log_returns(inputs.paths, *z), &inputs.macro_returns)
                / macro_var
        } else {
            0.0
        }
    });

    let alpha_idiosyncratic_share = inputs
        .loans
        .iter()
        .zip(&inputs.weights)
        .map(|(loan, w)| {
            inputs
                .suburbs
                .get(&loan.suburb_id)
                .map(|s| s.idiosyncratic_share * w)
                .unwrap_or(0.0)
        })
        .sum();

    let (var_95, var_99, cvar_95, cvar_99) = match inputs.mc {
        Some(mc) => (
            MetricValue::exact(mc.var_95),
            MetricValue::exact(mc.var_99),
            MetricValue::exact(mc.cvar_95),
            MetricValue::exact(mc.cvar_99),
        ),
        None => {
            let note = "analytic log-normal approximation";
            let horizon = config.fund_term as f64;
            let unit = Normal::new(0.0, 1.0).expect("unit normal");
            let analytic = |q: f64| {
                unit.inverse_cdf(q) * portfolio_volatility * horizon.sqrt()
                    - mean_annual * horizon
            };
            // Expected-shortfall multiplier for a normal tail.
            let es = |q: f64| {
                unit.pdf(unit.inverse_cdf(q)) / (1.0 - q) * portfolio_volatility * horizon.sqrt()
                    - mean_annual * horizon
            };
            (
                MetricValue::approximation(analytic(0.95), note),
                MetricValue::approximation(analytic(0.99), note),
                MetricValue::approximation(es(0.95), note),
                MetricValue::approximation(es(0.99), note),
            )
        }
    };

    MarketPriceMetrics {
        portfolio_volatility,
        zone_volatility,
        alpha_idiosyncratic_share,
        beta_macro,
        zone_beta,
        var_95,
        var_99,
        cvar_95,
        cvar_99,
    }
}

fn credit_metrics(inputs: &Inputs) -> CreditMetrics {
    let config = inputs.config;
    let shock = 1.0 + config.risk_metrics.stress_price_shock;

    let mut portfolio_ltv = 0.0;
    let mut stress_ltv = 0.0;
    let mut zone_ltv_sum = PerZone::new(0.0, 0.0, 0.0);
    let mut zone_weight = PerZone::new(0.0, 0.0, 0.0);
    let mut suburb_ltv_sum: BTreeMap<String, (f64, f64)> = BTreeMap::new();
    let mut defaulted = 0usize;

    for (loan, w) in inputs.loans.iter().zip(&inputs.weights) {
        let ratio = inputs
            .exits
            .get(&loan.loan_id)
            .map(|e| e.index_ratio)
            .unwrap_or(1.0);
        let current_ltv = loan.ltv / ratio;
        portfolio_ltv += current_ltv * w;
        stress_ltv += (loan.ltv / (ratio * shock)) * w;
        *zone_ltv_sum.get_mut(loan.zone) += current_ltv * w;
        *zone_weight.get_mut(loan.zone) += w;
        let slot = suburb_ltv_sum.entry(loan.suburb_id.clone()).or_default();
        slot.0 += current_ltv * w;
        slot.1 += w;
        if inputs
            .exits
            .get(&loan.loan_id)
            .map(|e| e.exit_type == crate::exits::ExitType::Default)
            .unwrap_or(false)
        {
            defaulted += 1;
        }
    }

    let zone_ltv = zone_ltv_sum.map(|zone, s| {
        let w = *zone_weight.get(zone);
        if w > 0.0 {
            s / w
        } else {
            0.0
        }
    });

    let mut top_suburb_ltv: Vec<(String, f64)> = suburb_ltv_sum
        .iter()
        .map(|(id, (s, w))| (id.clone(), if *w > 0.0 { s / w } else { 0.0 }))
        .collect();
    top_suburb_ltv.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    top_suburb_ltv.truncate(config.risk_metrics.top_n_suburbs);

    let default_probability_by_zone = config.default_rates;
    let portfolio_default_rate = inputs
        .loans
        .iter()
        .zip(&inputs.weights)
        .map(|(loan, w)| {
            let suburb_pd = inputs
                .suburbs
                .get(&loan.suburb_id)
                .map(|s| s.default_probability)
                .unwrap_or(*config.default_rates.get(loan.zone));
            suburb_pd * w
        })
        .sum();

    CreditMetrics {
        portfolio_ltv,
        zone_ltv,
        top_suburb_ltv: top_suburb_ltv.into_iter().collect(),
        stress_ltv,
        default_probability_by_zone,
        portfolio_default_rate,
        realized_default_rate: defaulted as f64 / inputs.loans.len().max(1) as f64,
    }
}

fn liquidity_metrics(inputs: &Inputs) -> LiquidityMetrics {
    let rm = &inputs.config.risk_metrics;

    let mut liquidity_score = 0.0;
    let mut expected_lag = 0.0;
    let mut wal_years = 0.0;
    for (loan, w) in inputs.loans.iter().zip(&inputs.weights) {
        let liq = inputs
            .suburbs
            .get(&loan.suburb_id)
            .map(|s| s.liquidity_score)
            .unwrap_or(0.5);
        liquidity_score += liq * w;
        // Less liquid suburbs stretch the gamma scale.
        expected_lag += rm.exit_lag_alpha * rm.exit_lag_beta * (1.5 - liq) * w;
        if let Some(exit) = inputs.exits.get(&loan.loan_id) {
            wal_years += ((exit.exit_month - loan.origination_month) as f64 / 12.0) * w;
        }
    }

    // Tail of the gamma lag model at the portfolio's liquidity level.
    let scale = rm.exit_lag_beta * (1.5 - liquidity_score);
    let exit_lag_p95_months = Gamma::new(rm.exit_lag_alpha, 1.0 / scale.max(1e-6))
        .map(|g| g.inverse_cdf(0.95))
        .unwrap_or(expected_lag * 2.0);

    let cfar_95 = match inputs.mc {
        Some(mc) => MetricValue::exact(mc.cfar_95),
        None => MetricValue::requires_mc("CFaR needs the simulated cash-balance distribution"),
    };

    LiquidityMetrics {
        portfolio_liquidity_score: liquidity_score,
        expected_exit_lag_months: expected_lag,
        exit_lag_p95_months,
        wal_years,
        cfar_95,
    }
}

fn leverage_metrics(inputs: &Inputs) -> LeverageMetrics {
    // No leverage facility is wired into this build: utilisation is zero
    // and coverage has no debt service to divide by.
    let var_uplift = match inputs.mc {
        Some(_) => MetricValue::exact(0.0),
        None => MetricValue::requires_mc("VaR uplift needs the simulated distribution"),
    };
    LeverageMetrics {
        nav_utilisation: 0.0,
        interest_coverage: MetricValue {
            value: None,
            note: Some("no leverage facility".into()),
            ..Default::default()
        },
        var_uplift,
    }
}

fn concentration_metrics(inputs: &Inputs) -> ConcentrationMetrics {
    let mut suburb_exposure: BTreeMap<String, f64> = BTreeMap::new();
    for (loan, w) in inputs.loans.iter().zip(&inputs.weights) {
        *suburb_exposure.entry(loan.suburb_id.clone()).or_default() += w;
    }
    let mut ranked: Vec<(String, f64)> = suburb_exposure
        .iter()
        .map(|(k, v)| (k.clone(), *v))
        .collect();
    ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

    let suburb_weights: Vec<f64> = suburb_exposure.values().copied().collect();
    let zone_weights_vec: Vec<f64> = Zone::ALL
        .iter()
        .map(|z| *inputs.zone_weights.get(*z))
        .collect();

    ConcentrationMetrics {
        zone_exposure: inputs.zone_weights,
        top_suburb_exposure: ranked
            .iter()
            .take(inputs.config.risk_metrics.top_n_suburbs)
            .cloned()
            .collect(),
        single_loan_exposure: inputs.weights.iter().copied().fold(0.0, f64::max),
        zone_hhi: financial::hhi(&zone_weights_vec),
        suburb_hhi: financial::hhi(&suburb_weights),
    }
}

fn performance_metrics(inputs: &Inputs) -> PerformanceMetrics {
    let config = inputs.config;
    let rf = config.risk_metrics.risk_free_rate;
    let rf_monthly = rf / 12.0;
    let returns = &inputs.portfolio_returns;

    let mean_annual = financial::mean(returns) * 12.0;
    let vol_annual = financial::std_dev(returns) * 12f64.sqrt();

    let net_irr = inputs
        .cashflows
        .analytics
        .as_ref()
        .map(|a| a.fund.irr.clone())
        .unwrap_or_else(|| MetricValue::requires_mc("cashflow analytics disabled"));

    let sharpe_ratio = if vol_annual > 0.0 {
        (mean_annual - rf) / vol_annual
    } else {
        0.0
    };
    let downside = financial::downside_deviation(returns, rf_monthly) * 12f64.sqrt();
    let sortino_ratio = if downside > 0.0 {
        (mean_annual - rf) / downside
    } else {
        0.0
    };

    let index: Vec<f64> = inputs
        .paths
        .zone
        .green
        .iter()
        .enumerate()
        .map(|(i, _)| {
            Zone::ALL
                .iter()
                .map(|z| inputs.zone_weights.get(*z) * inputs.paths.zone.get(*z)[i])
                .sum()
        })
        .collect();
    let max_dd = financial::max_drawdown(&index);
    let calmar_ratio = if max_dd > 0.0 { mean_annual / max_dd } else { 0.0 };

    let tracking: Vec<f64> = returns
        .iter()
        .zip(&inputs.macro_returns)
        .map(|(p, m)| p - m)
        .collect();
    let te = financial::std_dev(&tracking) * 12f64.sqrt();
    let information_ratio = if te > 0.0 {
        (mean_annual - financial::mean(&inputs.macro_returns) * 12.0) / te
    } else {
        0.0
    };

    let macro_var = financial::covariance(&inputs.macro_returns, &inputs.macro_returns);
    let beta = if macro_var > 0.0 {
        financial::covariance(returns, &inputs.macro_returns) / macro_var
    } else {
        0.0
    };
    let treynor_ratio = if beta != 0.0 {
        (mean_annual - rf) / beta
    } else {
        0.0
    };

    let gains: f64 = returns.iter().map(|r| (r - rf_monthly).max(0.0)).sum();
    let losses: f64 = returns.iter().map(|r| (rf_monthly - r).max(0.0)).sum();
    let omega_ratio = if losses > 0.0 { gains / losses } else { f64::MAX };

    let lpm3 = returns
        .iter()
        .map(|r| (rf_monthly - r).max(0.0).powi(3))
        .sum::<f64>()
        / returns.len().max(1) as f64;
    let kappa_3 = if lpm3 > 0.0 {
        (financial::mean(returns) - rf_monthly) / lpm3.cbrt()
    } else {
        0.0
    };

    let gain_count = returns.iter().filter(|r| **r > 0.0).count();
    let loss_count = returns.iter().filter(|r| **r < 0.0).count();
    let avg_gain = if gain_count > 0 {
        returns.iter().filter(|r| **r > 0.0).sum::<f64>() / gain_count as f64
    } else {
        0.0
    };
    let avg_loss = if loss_count > 0 {
        -returns.iter().filter(|r| **r < 0.0).sum::<f64>() / loss_count as f64
    } else {
        0.0
    };
    let gain_loss_ratio = if avg_loss > 0.0 {
        avg_gain / avg_loss
    } else {
        f64::MAX
    };

    let hurdle_clear_probability = match inputs.mc {
        Some(mc) => MetricValue::exact(mc.hurdle_clear_probability),
        None => MetricValue::requires_mc("hurdle-clear probability needs the IRR distribution"),
    };

    PerformanceMetrics {
        net_irr,
        sharpe_ratio,
        sortino_ratio,
        calmar_ratio,
        information_ratio,
        treynor_ratio,
        omega_ratio,
        kappa_3,
        gain_loss_ratio,
        hurdle_clear_probability,
    }
}

// ---------------------------------------------------------------------------
// Stress tests and sensitivity
// ---------------------------------------------------------------------------

fn stressed_stream(
    inputs: &Inputs,
    property_value_shock: f64,
    default_rate_multiplier: f64,
) -> Vec<f64> {
    // Appreciation share scales with the shocked appreciation pool; principal
    // erodes with the extra default incidence, in proportion to the loss
    // share already observed in the base run.
    let mean_ratio: f64 = {
        let ratios: Vec<f64> = inputs.exits.values().map(|e| e.index_ratio).collect();
        financial::mean(&ratios).max(1.001)
    };
    let appreciation_mult =
        ((mean_ratio * (1.0 + property_value_shock) - 1.0) / (mean_ratio - 1.0)).max(0.0);

    let invested: f64 = inputs
        .cashflows
        .fund_level
        .iter()
        .map(|r| -r.loan_investments)
        .sum();
    let principal: f64 = inputs
        .cashflows
        .fund_level
        .iter()
        .map(|r| r.principal_repayments)
        .sum();
    let loss_share = if invested > 0.0 {
        ((invested - principal) / invested).max(0.005)
    } else {
        0.005
    };
    let principal_mult = (1.0 - (default_rate_multiplier - 1.0) * loss_share).max(0.0);

    inputs
        .cashflows
        .fund_level
        .iter()
        .map(|row| {
            let delta = row.principal_repayments * (principal_mult - 1.0)
                + row.appreciation_share * (appreciation_mult - 1.0);
            row.capital_calls + (-row.distributions + delta).max(0.0)
        })
        .collect()
}

fn stream_metrics(config: &SimulationConfig, stream: &[f64]) -> (f64, f64, f64, f64) {
    let mpp = config.cashflow_aggregator.time_granularity.months_per_period();
    let periods_per_year = 12.0 / mpp as f64;
    let irr = financial::irr(stream, 0.01)
        .map(|r| (1.0 + r).powf(periods_per_year) - 1.0)
        .unwrap_or(0.0);
    let distributed: f64 = stream.iter().filter(|v| **v > 0.0).sum();
    let moic = distributed / config.fund_size;
    let roi = moic - 1.0;
    let cumulative: Vec<f64> = stream
        .iter()
        .scan(0.0, |acc, v| {
            *acc += v;
            Some(*acc + config.fund_size)
        })
        .collect();
    let max_dd = financial::max_drawdown(&cumulative);
    (irr, moic, roi, max_dd)
}

fn stress_tests(inputs: &Inputs, scenarios: &[StressScenarioSpec]) -> Vec<StressTestResult> {
    let config = inputs.config;
    let base_vol = financial::std_dev(&inputs.portfolio_returns) * 12f64.sqrt();
    let unit = Normal::new(0.0, 1.0).expect("unit normal");

    scenarios
        .iter()
        .map(|scenario| {
            let stream = stressed_stream(
                inputs,
                scenario.property_value_shock,
                scenario.default_rate_multiplier,
            );
            let (irr, moic, roi, max_drawdown) = stream_metrics(config, &stream);
            // Liquidity stress widens the loss tail.
            let stressed_vol = base_vol * (1.0 + scenario.liquidity_shock.abs());
            let horizon = config.fund_term as f64;
            let mean_annual = if moic > 0.0 {
                moic.powf(1.0 / horizon) - 1.0
            } else {
                -1.0
            };
            let var_95 =
                unit.inverse_cdf(0.95) * stressed_vol * horizon.sqrt() - mean_annual * horizon;

            StressTestResult {
                name: scenario.name.clone(),
                property_value_shock: scenario.property_value_shock,
                interest_rate_shock: scenario.interest_rate_shock,
                default_rate_multiplier: scenario.default_rate_multiplier,
                liquidity_shock: scenario.liquidity_shock,
                irr,
                moic,
                roi,
                max_drawdown,
                var_95,
            }
        })
        .collect()
}

fn sensitivity_analysis(inputs: &Inputs) -> Vec<RiskSensitivitySweep> {
    let rm = &inputs.config.risk_metrics;
    let steps = rm.sensitivity_steps.max(2);

    rm.sensitivity_parameters
        .iter()
        .map(|parameter| {
            let points = (0..steps)
                .map(|i| {
                    let shock = -rm.sensitivity_range
                        + 2.0 * rm.sensitivity_range * i as f64 / (steps - 1) as f64;
                    let stream = match parameter.as_str() {
                        "property_value" => stressed_stream(inputs, shock, 1.0),
                        "default_rate" => stressed_stream(inputs, 0.0, 1.0 + shock * 5.0),
                        _ => stressed_stream(inputs, shock * 0.5, 1.0 + shock),
                    };
                    let (irr, moic, _, _) = stream_metrics(inputs.config, &stream);
                    RiskSensitivityPoint { shock, irr, moic }
                })
                .collect();
            RiskSensitivitySweep {
                parameter: parameter.clone(),
                points,
            }
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Guardrails and visualization
// ---------------------------------------------------------------------------

fn evaluate_guardrails(
    config: &SimulationConfig,
    credit: &CreditMetrics,
    liquidity: &LiquidityMetrics,
    concentration: &ConcentrationMetrics,
) -> Vec<GuardrailViolation> {
    let rm = &config.risk_metrics;
    let mut violations = Vec::new();

    if liquidity.wal_years > 0.9 * config.fund_term as f64 {
        violations.push(GuardrailViolation::advisory(
            "wal_mismatch",
            MODULE,
            format!(
                "weighted average life {:.1}y is close to the {}y fund term",
                liquidity.wal_years, config.fund_term
            ),
        ));
    }
    for zone in Zone::ALL {
        let exposure = *concentration.zone_exposure.get(zone);
        if exposure > rm.zone_exposure_soft_cap {
            violations.push(GuardrailViolation::advisory(
                "zone_concentration",
                MODULE,
                format!(
                    "realized {zone} exposure {:.1}% exceeds the soft cap {:.1}%",
                    exposure * 100.0,
                    rm.zone_exposure_soft_cap * 100.0
                ),
            ));
        }
    }
    if credit.stress_ltv > rm.stress_ltv_threshold {
        violations.push(GuardrailViolation::advisory(
            "stress_ltv",
            MODULE,
            format!(
                "stress LTV {:.2} exceeds threshold {:.2}",
                credit.stress_ltv, rm.stress_ltv_threshold
            ),
        ));
    }
    violations
}

fn build_visualization(
    inputs: &Inputs,
    stress: &[StressTestResult],
) -> RiskVisualization {
    let stats = &inputs.paths.statistics;
    let mut risk_return_scatter: Vec<ScatterPoint> = Zone::ALL
        .iter()
        .map(|zone| {
            let zs = stats.zone_stats.get(*zone);
            ScatterPoint {
                label: zone.to_string(),
                risk: zs.volatility,
                ret: zs.mean_annual_return,
            }
        })
        .collect();
    risk_return_scatter.push(ScatterPoint {
        label: "portfolio".into(),
        risk: financial::std_dev(&inputs.portfolio_returns) * 12f64.sqrt(),
        ret: financial::mean(&inputs.portfolio_returns) * 12.0,
    });

    let index: Vec<f64> = (0..=inputs.paths.months)
        .map(|i| {
            Zone::ALL
                .iter()
                .map(|z| inputs.zone_weights.get(*z) * inputs.paths.zone.get(*z)[i])
                .sum()
        })
        .collect();
    let mut peak = index[0];
    let drawdown_chart = index
        .iter()
        .enumerate()
        .map(|(month, value)| {
            if *value > peak {
                peak = *value;
            }
            DrawdownPoint {
                month,
                drawdown: if peak > 0.0 { (peak - value) / peak } else { 0.0 },
            }
        })
        .collect();

    let stress_comparison = stress
        .iter()
        .map(|s| StressComparisonRow {
            scenario: s.name.clone(),
            irr: s.irr,
            moic: s.moic,
        })
        .collect();

    RiskVisualization {
        risk_return_scatter,
        drawdown_chart,
        stress_comparison,
    }
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

#[allow(clippy::too_many_arguments)]
pub fn calculate(
    config: &SimulationConfig,
    tls: &dyn TlsDataProvider,
    loans: &[Loan],
    exits: &BTreeMap<String, ExitRecord>,
    paths: &PricePaths,
    cashflows: &CashflowBundle,
    mc: Option<&McSummary>,
    cancel: &CancelFlag,
    progress: &ProgressSink,
) -> SimResult<(RiskMetrics, Vec<GuardrailViolation>)> {
    progress.emit(MODULE, 0.0, "computing risk metrics");
    cancel.check(MODULE)?;

    let inputs = build_inputs(config, tls, loans, exits, paths, cashflows, mc);

    let market_price = market_price_metrics(&inputs);
    let credit = credit_metrics(&inputs);
    let liquidity = liquidity_metrics(&inputs);
    let leverage = leverage_metrics(&inputs);
    let concentration = concentration_metrics(&inputs);
    progress.emit(MODULE, 50.0, "running stress tests");
    cancel.check(MODULE)?;

    let performance = performance_metrics(&inputs);
    let stress = stress_tests(&inputs, &config.risk_metrics.stress_scenarios);
    let sensitivity = sensitivity_analysis(&inputs);

    let violations = evaluate_guardrails(config, &credit, &liquidity, &concentration);
    let visualization = build_visualization(&inputs, &stress);

    let metrics = RiskMetrics {
        market_price_metrics: market_price,
        credit_metrics: credit,
        liquidity_metrics: liquidity,
        leverage_metrics: leverage,
        concentration_metrics: concentration,
        performance_metrics: performance,
        stress_test_results: stress,
        sensitivity_analysis: sensitivity,
        visualization,
    };

    info!(
        portfolio_vol = metrics.market_price_metrics.portfolio_volatility,
        wal = metrics.liquidity_metrics.wal_years,
        advisories = violations.len(),
        "risk metrics complete"
    );
    progress.emit(MODULE, 100.0, "risk metrics complete");
    Ok((metrics, violations))
}
