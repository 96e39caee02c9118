//! Derived cashflow analytics: return metrics at fund/LP/GP level, per-year
//! series, and the toggleable sensitivity/scenario/tax/liquidity blocks.
//!
//! LP and GP figures here are pre-carry, pro-rata-commitment estimates; the
//! waterfall engine computes the definitive split downstream.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::config::{ScenarioSpec, SimulationConfig};
use crate::exits::ExitRecord;
use crate::financial;
use crate::loans::Loan;
use crate::types::MetricValue;

use super::{FundPeriodCashflow, StakeholderCashflow};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReturnMetrics {
    /// Annualized IRR; 0 with a note when the solver does not converge.
    pub irr: MetricValue,
    pub moic: f64,
    pub tvpi: f64,
    pub dpi: f64,
    pub rvpi: f64,
    /// None when the investment is never paid back.
    pub payback_years: Option<f64>,
    pub cash_on_cash: f64,
    pub npv_at_hurdle: f64,
    pub profitability_index: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct YearlyMetrics {
    pub year: u32,
    pub tvpi: f64,
    pub dpi: f64,
    pub rvpi: f64,
    pub irr: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensitivityPoint {
    pub multiplier: f64,
    pub irr: f64,
    pub moic: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensitivitySweep {
    pub parameter: String,
    pub points: Vec<SensitivityPoint>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioResult {
    pub name: String,
    pub irr: f64,
    pub moic: f64,
    pub total_distributions: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaxImpact {
    pub pre_tax_irr: f64,
    pub post_tax_irr: f64,
    pub total_tax: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiquidityAnalysis {
    pub min_cash_reserve: f64,
    pub lowest_cash_reserve: f64,
    pub avg_cash_reserve: f64,
    /// Periods where the reserve sat below the configured minimum.
    pub reserve_breaches: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CashflowAnalytics {
    pub fund: ReturnMetrics,
    pub lp: ReturnMetrics,
    pub gp: ReturnMetrics,
    pub by_year: Vec<YearlyMetrics>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sensitivity: Option<Vec<SensitivitySweep>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scenarios: Option<Vec<ScenarioResult>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tax_impact: Option<TaxImpact>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub liquidity: Option<LiquidityAnalysis>,
}

// ---------------------------------------------------------------------------
// Streams and metric helpers
// ---------------------------------------------------------------------------

fn annualize(periodic_rate: f64, periods_per_year: f64) -> f64 {
    (1.0 + periodic_rate).powf(periods_per_year) - 1.0
}

fn periodic(annual_rate: f64, periods_per_year: f64) -> f64 {
    (1.0 + annual_rate).powf(1.0 / periods_per_year) - 1.0
}

fn irr_metric(stream: &[f64], periods_per_year: f64) -> MetricValue {
    match financial::irr(stream, 0.01) {
        Ok(r) => MetricValue::exact(annualize(r, periods_per_year)),
        Err(e) => MetricValue {
            value: Some(0.0),
            note: Some(format!("IRR solver did not converge ({e}); reported 0")),
            ..Default::default()
        },
    }
}

fn return_metrics(
    config: &SimulationConfig,
    stream: &[f64],
    paid_in: f64,
    terminal_nav: f64,
    periods_per_year: f64,
) -> ReturnMetrics {
    let distributed: f64 = stream.iter().filter(|v| **v > 0.0).sum();
    let invested: f64 = if paid_in > 0.0 {
        paid_in
    } else {
        stream.iter().filter(|v| **v < 0.0).map(|v| -v).sum()
    };

    // No capital basis (e.g. a fee-only GP): multiples are reported as 0.
    let (dpi, rvpi) = if invested > 0.0 {
        (distributed / invested, terminal_nav / invested)
    } else {
        (0.0, 0.0)
    };
    let hurdle_periodic = periodic(config.hurdle_rate, periods_per_year);
    let npv_at_hurdle = financial::npv(hurdle_periodic, stream).unwrap_or(0.0);

    let pv_outflows: f64 = {
        let mut discount = 1.0;
        let mut pv = 0.0;
        for (t, v) in stream.iter().enumerate() {
            if t > 0 {
                discount *= 1.0 + hurdle_periodic;
            }
            if *v < 0.0 {
                pv += -v / discount;
            }
        }
        pv
    };

    ReturnMetrics {
        irr: irr_metric(stream, periods_per_year),
        moic: dpi + rvpi,
        tvpi: dpi + rvpi,
        dpi,
        rvpi,
        payback_years: financial::payback_period(stream).map(|p| p / periods_per_year),
        cash_on_cash: dpi,
        npv_at_hurdle,
        profitability_index: if pv_outflows > 0.0 {
            (npv_at_hurdle + pv_outflows) / pv_outflows
        } else {
            0.0
        },
    }
}

/// Investor-perspective stream: capital calls (negative) plus cash
/// distributed (positive).
fn fund_stream(fund_level: &[FundPeriodCashflow]) -> Vec<f64> {
    fund_level
        .iter()
        .map(|row| row.capital_calls - row.distributions)
        .collect()
}

// ---------------------------------------------------------------------------
// Per-year series
// ---------------------------------------------------------------------------

fn nav_at_month(loans: &[Loan], exits: &BTreeMap<String, ExitRecord>, month: u32) -> f64 {
    loans
        .iter()
        .filter(|loan| {
            loan.origination_month <= month
                && exits
                    .get(&loan.loan_id)
                    .map(|e| e.exit_month > month)
                    .unwrap_or(true)
        })
        .map(|loan| loan.loan_size)
        .sum()
}

fn yearly_series(
    config: &SimulationConfig,
    fund_level: &[FundPeriodCashflow],
    loans: &[Loan],
    exits: &BTreeMap<String, ExitRecord>,
) -> Vec<YearlyMetrics> {
    let mpp = config.cashflow_aggregator.time_granularity.months_per_period();
    let periods_per_year = 12.0 / mpp as f64;
    let stream = fund_stream(fund_level);

    (1..=config.fund_term)
        .map(|year| {
            let cutoff_period = ((year * 12) / mpp) as usize;
            let cutoff_month = year * 12;

            let distributed: f64 = fund_level
                .iter()
                .take(cutoff_period + 1)
                .map(|r| -r.distributions)
                .sum();
            let reserve = fund_level
                .get(cutoff_period)
                .map(|r| r.cash_reserve)
                .unwrap_or(0.0);
            let nav = nav_at_month(loans, exits, cutoff_month) + reserve;

            let dpi = distributed / config.fund_size;
            let rvpi = nav / config.fund_size;

            let mut truncated: Vec<f64> = stream.iter().take(cutoff_period + 1).copied().collect();
            if let Some(last) = truncated.last_mut() {
                *last += nav;
            }
            let irr = financial::irr(&truncated, 0.01)
                .ok()
                .map(|r| annualize(r, periods_per_year));

            YearlyMetrics {
                year,
                tvpi: dpi + rvpi,
                dpi,
                rvpi,
                irr,
            }
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Sensitivity / scenarios / tax
// ---------------------------------------------------------------------------

/// First-order adjusted stream: scale inflow components and pass the delta
/// straight through to the distribution in the same period.
fn adjusted_stream(
    fund_level: &[FundPeriodCashflow],
    principal_mult: f64,
    interest_mult: f64,
    appreciation_mult: f64,
) -> Vec<f64> {
    fund_level
        .iter()
        .map(|row| {
            let delta = row.principal_repayments * (principal_mult - 1.0)
                + row.interest_income * (interest_mult - 1.0)
                + row.appreciation_share * (appreciation_mult - 1.0);
            let base_distribution = -row.distributions;
            row.capital_calls + (base_distribution + delta).max(0.0)
        })
        .collect()
}

fn stream_stats(stream: &[f64], paid_in: f64, periods_per_year: f64) -> (f64, f64) {
    let irr = financial::irr(stream, 0.01)
        .map(|r| annualize(r, periods_per_year))
        .unwrap_or(0.0);
    let distributed: f64 = stream.iter().filter(|v| **v > 0.0).sum();
    (irr, distributed / paid_in.max(1e-9))
}

fn principal_loss_share(fund_level: &[FundPeriodCashflow]) -> f64 {
    let invested: f64 = fund_level.iter().map(|r| -r.loan_investments).sum();
    let principal: f64 = fund_level.iter().map(|r| r.principal_repayments).sum();
    if invested > 0.0 {
        ((invested - principal) / invested).max(0.0)
    } else {
        0.0
    }
}

fn sensitivity_sweeps(
    config: &SimulationConfig,
    fund_level: &[FundPeriodCashflow],
    periods_per_year: f64,
) -> Vec<SensitivitySweep> {
    let cf = &config.cashflow_aggregator;
    let loss_share = principal_loss_share(fund_level);
    let steps = cf.sensitivity_steps.max(2);

    cf.sensitivity_parameters
        .iter()
        .map(|parameter| {
            let points = (0..steps)
                .map(|i| {
                    let multiplier = 1.0 - cf.sensitivity_range
                        + 2.0 * cf.sensitivity_range * i as f64 / (steps - 1) as f64;
                    let stream = match parameter.as_str() {
                        "appreciation_rates" => {
                            adjusted_stream(fund_level, 1.0, 1.0, multiplier)
                        }
                        "default_rates" => {
                            // Higher default incidence erodes principal in
                            // proportion to the observed loss share.
                            let principal_mult =
                                1.0 - (multiplier - 1.0) * loss_share.max(0.005);
                            adjusted_stream(fund_level, principal_mult, 1.0, 1.0)
                        }
                        _ => adjusted_stream(fund_level, multiplier, multiplier, multiplier),
                    };
                    let (irr, moic) = stream_stats(&stream, config.fund_size, periods_per_year);
                    SensitivityPoint {
                        multiplier,
                        irr,
                        moic,
                    }
                })
                .collect();
            SensitivitySweep {
                parameter: parameter.clone(),
                points,
            }
        })
        .collect()
}

fn scenario_results(
    config: &SimulationConfig,
    fund_level: &[FundPeriodCashflow],
    scenarios: &[ScenarioSpec],
    periods_per_year: f64,
) -> Vec<ScenarioResult> {
    let loss_share = principal_loss_share(fund_level);
    scenarios
        .iter()
        .map(|scenario| {
            let principal_mult =
                1.0 - (scenario.default_multiplier - 1.0) * loss_share.max(0.005);
            let stream = adjusted_stream(
                fund_level,
                principal_mult,
                scenario.interest_multiplier,
                scenario.appreciation_multiplier,
            );
            let (irr, moic) = stream_stats(&stream, config.fund_size, periods_per_year);
            let total_distributions = stream.iter().filter(|v| **v > 0.0).sum();
            ScenarioResult {
                name: scenario.name.clone(),
                irr,
                moic,
                total_distributions,
            }
        })
        .collect()
}

fn tax_impact(
    config: &SimulationConfig,
    fund_level: &[FundPeriodCashflow],
    periods_per_year: f64,
) -> TaxImpact {
    let tax_rate = config.cashflow_aggregator.tax_rate;
    let pre: Vec<f64> = fund_stream(fund_level);
    let mut total_tax = 0.0;
    let post: Vec<f64> = fund_level
        .iter()
        .map(|row| {
            let taxable = row.interest_income + row.appreciation_share;
            let tax = taxable.max(0.0) * tax_rate;
            total_tax += tax;
            row.capital_calls + (-row.distributions - tax).max(0.0)
        })
        .collect();
    let (pre_tax_irr, _) = stream_stats(&pre, config.fund_size, periods_per_year);
    let (post_tax_irr, _) = stream_stats(&post, config.fund_size, periods_per_year);
    TaxImpact {
        pre_tax_irr,
        post_tax_irr,
        total_tax,
    }
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

pub fn derive(
    config: &SimulationConfig,
    fund_level: &[FundPeriodCashflow],
    gp_cashflows: &[StakeholderCashflow],
    loans: &[Loan],
    exits: &BTreeMap<String, ExitRecord>,
) -> CashflowAnalytics {
    let cf = &config.cashflow_aggregator;
    let mpp = cf.time_granularity.months_per_period();
    let periods_per_year = 12.0 / mpp as f64;

    let stream = fund_stream(fund_level);
    let terminal_nav = fund_level.last().map(|r| r.cash_reserve).unwrap_or(0.0);
    let fund = return_metrics(config, &stream, config.fund_size, terminal_nav, periods_per_year);

    // Pre-carry pro-rata estimates for the stakeholders.
    let lp_share = 1.0 - config.gp_commitment_percentage;
    let lp_stream: Vec<f64> = fund_level
        .iter()
        .map(|row| {
            let call = if row.period == 0 {
                -config.lp_commitment()
            } else {
                0.0
            };
            call + -row.distributions * lp_share
        })
        .collect();
    let lp = return_metrics(
        config,
        &lp_stream,
        config.lp_commitment(),
        terminal_nav * lp_share,
        periods_per_year,
    );

    let gp_stream: Vec<f64> = fund_level
        .iter()
        .zip(gp_cashflows)
        .map(|(row, gp_row)| {
            gp_row.capital_calls
                + gp_row.management_fees
                + gp_row.origination_fees
                + -row.distributions * config.gp_commitment_percentage
        })
        .collect();
    let gp_paid_in = config.fund_size * config.gp_commitment_percentage;
    let gp = return_metrics(config, &gp_stream, gp_paid_in, 0.0, periods_per_year);

    CashflowAnalytics {
        fund,
        lp,
        gp,
        by_year: yearly_series(config, fund_level, loans, exits),
        sensitivity: cf
            .enable_sensitivity
            .then(|| sensitivity_sweeps(config, fund_level, periods_per_year)),
        scenarios: (cf.enable_scenarios && !cf.scenarios.is_empty())
            .then(|| scenario_results(config, fund_level, &cf.scenarios, periods_per_year)),
        tax_impact: cf
            .enable_tax_impact
            .then(|| tax_impact(config, fund_level, periods_per_year)),
        liquidity: cf.enable_liquidity_analysis.then(|| {
            let reserves: Vec<f64> = fund_level.iter().map(|r| r.cash_reserve).collect();
            let min_reserve = cf.min_cash_reserve_pct * config.fund_size;
            LiquidityAnalysis {
                min_cash_reserve: min_reserve,
                lowest_cash_reserve: reserves.iter().copied().fold(f64::INFINITY, f64::min),
                avg_cash_reserve: financial::mean(&reserves),
                reserve_breaches: reserves.iter().filter(|r| **r < min_reserve).count(),
            }
        }),
    }
}
