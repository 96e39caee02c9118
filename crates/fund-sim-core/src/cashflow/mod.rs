//! Cashflow aggregator: loan-, fund-, and stakeholder-level series.
//!
//! Loan entries are pure functions of (loan, exit) and can be built on a
//! rayon pool; the combined output is always sorted by loan id, so worker
//! count never changes the result. Fund periods bucket those entries at the
//! configured granularity and maintain `net = sum(components)` and a running
//! cumulative.

pub mod analytics;
pub mod viz;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{info, warn};

use crate::config::{ManagementFeeBasis, SimulationConfig, TimeGranularity};
use crate::engine::control::{CancelFlag, ProgressSink};
use crate::error::GuardrailViolation;
use crate::exits::ExitRecord;
use crate::loans::Loan;
use crate::reinvest::ReinvestmentSummary;
use crate::SimResult;

pub use analytics::{CashflowAnalytics, ReturnMetrics};
pub use viz::CashflowVisualization;

const MODULE: &str = "cashflow_aggregator";

/// Loan count above which the parallel path is worth the fan-out.
const PARALLEL_THRESHOLD: usize = 10;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoanOriginationEntry {
    /// Fund-relative year.
    pub year: i32,
    /// Months since fund inception.
    pub month: u32,
    /// Negative: cash out of the fund.
    pub loan_investment: f64,
    pub origination_fee: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoanExitEntry {
    pub year: i32,
    pub month: u32,
    pub principal: f64,
    pub accrued_interest: f64,
    pub appreciation_share: f64,
    pub total: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoanCashflow {
    pub loan_id: String,
    pub origination: Option<LoanOriginationEntry>,
    pub exit: Option<LoanExitEntry>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FundPeriodCashflow {
    pub period: usize,
    /// Fund-relative year at the period start.
    pub year: f64,
    pub capital_calls: f64,
    pub loan_investments: f64,
    pub origination_fees: f64,
    pub principal_repayments: f64,
    pub interest_income: f64,
    pub appreciation_share: f64,
    pub management_fees: f64,
    pub fund_expenses: f64,
    pub leverage_draws: f64,
    pub leverage_repayments: f64,
    pub leverage_interest: f64,
    /// Negative: cash paid out to investors.
    pub distributions: f64,
    pub net_cashflow: f64,
    pub cumulative_cashflow: f64,
    /// Fund cash balance after this period's activity.
    pub cash_reserve: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StakeholderCashflow {
    pub period: usize,
    pub year: f64,
    pub capital_calls: f64,
    /// Fee revenue (GP) — zero on LP rows.
    pub management_fees: f64,
    pub origination_fees: f64,
    /// Filled by the waterfall module's output, not here.
    pub distributions: f64,
    pub net_cashflow: f64,
    pub cumulative_cashflow: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CashflowBundle {
    pub granularity: TimeGranularity,
    pub loan_level: Vec<LoanCashflow>,
    pub fund_level: Vec<FundPeriodCashflow>,
    pub lp_cashflows: Vec<StakeholderCashflow>,
    pub gp_cashflows: Vec<StakeholderCashflow>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub analytics: Option<CashflowAnalytics>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub visualization: Option<CashflowVisualization>,
}

impl CashflowBundle {
    /// Total cash distributed to investors over the fund life.
    pub fn total_distributions(&self) -> f64 {
        self.fund_level.iter().map(|p| -p.distributions).sum()
    }
}

// ---------------------------------------------------------------------------
// Loan level
// ---------------------------------------------------------------------------

fn build_loan_entry(
    config: &SimulationConfig,
    loan: &Loan,
    exit: Option<&ExitRecord>,
) -> (LoanCashflow, usize) {
    let fee_rate = config.cashflow_aggregator.origination_fee_rate;
    let fund_term = config.fund_term as i32;
    let mut dropped = 0usize;

    let origination_year = loan.origination_year - config.vintage_year;
    let origination = if (0..=fund_term).contains(&origination_year) {
        Some(LoanOriginationEntry {
            year: origination_year,
            month: loan.origination_month,
            loan_investment: -loan.loan_size,
            origination_fee: loan.loan_size * fee_rate,
        })
    } else {
        dropped += 1;
        None
    };

    let exit_entry = exit.and_then(|record| {
        let exit_year = (record.exit_month / 12) as i32;
        if (0..=fund_term).contains(&exit_year) {
            Some(LoanExitEntry {
                year: exit_year,
                month: record.exit_month,
                principal: record.principal,
                accrued_interest: record.accrued_interest,
                appreciation_share: record.appreciation_share_amount,
                total: record.fund_return,
            })
        } else {
            dropped += 1;
            None
        }
    });

    (
        LoanCashflow {
            loan_id: loan.loan_id.clone(),
            origination,
            exit: exit_entry,
        },
        dropped,
    )
}

fn build_loan_level(
    config: &SimulationConfig,
    loans: &[Loan],
    exits: &BTreeMap<String, ExitRecord>,
    cancel: &CancelFlag,
) -> SimResult<(Vec<LoanCashflow>, usize)> {
    let cf = &config.cashflow_aggregator;
    let parallel = cf.enable_parallel_processing && loans.len() > PARALLEL_THRESHOLD;

    let mut entries: Vec<(LoanCashflow, usize)> = if parallel {
        cancel.check(MODULE)?;
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(cf.num_workers.max(1))
            .build()
            .map_err(|e| crate::error::SimError::Internal {
                module: MODULE.into(),
                message: format!("worker pool: {e}"),
            })?;
        pool.install(|| {
            loans
                .par_iter()
                .map(|loan| build_loan_entry(config, loan, exits.get(&loan.loan_id)))
                .collect()
        })
    } else {
        let mut out = Vec::with_capacity(loans.len());
        for (i, loan) in loans.iter().enumerate() {
            if i % 100 == 0 {
                cancel.check(MODULE)?;
            }
            out.push(build_loan_entry(config, loan, exits.get(&loan.loan_id)));
        }
        out
    };
    cancel.check(MODULE)?;

    // Deterministic reduction regardless of worker scheduling.
    entries.sort_by(|a, b| a.0.loan_id.cmp(&b.0.loan_id));
    let dropped = entries.iter().map(|(_, d)| *d).sum();
    Ok((entries.into_iter().map(|(e, _)| e).collect(), dropped))
}

// ---------------------------------------------------------------------------
// Fund level
// ---------------------------------------------------------------------------

fn build_fund_level(
    config: &SimulationConfig,
    loan_level: &[LoanCashflow],
    loans: &[Loan],
    exits: &BTreeMap<String, ExitRecord>,
    reinvestment: &ReinvestmentSummary,
) -> Vec<FundPeriodCashflow> {
    let cf = &config.cashflow_aggregator;
    let mpp = cf.time_granularity.months_per_period();
    let total_months = config.total_months();
    let num_periods = (total_months / mpp) as usize + 1;
    let dt_years = mpp as f64 / 12.0;

    let mut periods: Vec<FundPeriodCashflow> = (0..num_periods)
        .map(|p| FundPeriodCashflow {
            period: p,
            year: p as f64 * mpp as f64 / 12.0,
            ..Default::default()
        })
        .collect();

    periods[0].capital_calls = -config.fund_size;

    for entry in loan_level {
        if let Some(orig) = &entry.origination {
            let p = (orig.month / mpp) as usize;
            periods[p].loan_investments += orig.loan_investment;
            periods[p].origination_fees += orig.origination_fee;
        }
        if let Some(exit) = &entry.exit {
            let p = (exit.month / mpp) as usize;
            periods[p].principal_repayments += exit.principal;
            periods[p].interest_income += exit.accrued_interest;
            periods[p].appreciation_share += exit.appreciation_share;
        }
    }

    // Outstanding invested capital at the start of each month, for the
    // invested-capital and NAV fee bases.
    let mut invested_by_month = vec![0.0f64; total_months as usize + 1];
    for loan in loans {
        let from = loan.origination_month as usize;
        let to = exits
            .get(&loan.loan_id)
            .map(|e| e.exit_month as usize)
            .unwrap_or(total_months as usize);
        for month in invested_by_month.iter_mut().take(to).skip(from) {
            *month += loan.loan_size;
        }
    }

    // Capital recycled by the reinvestment engine, per period.
    let mut reinvested_by_period = vec![0.0f64; num_periods];
    for (month, amount) in &reinvestment.reinvested_by_month {
        reinvested_by_period[(*month / mpp) as usize] += *amount;
    }

    let window_end_period = (config.reinvestment_window_months() / mpp) as usize;
    let min_reserve = if cf.enable_liquidity_analysis {
        cf.min_cash_reserve_pct * config.fund_size
    } else {
        0.0
    };

    // `pool` is distributable exit proceeds (net of fees and recycled
    // capital); `reserve` is the full cash balance including undeployed
    // committed capital, which only the final sweep returns.
    let mut pool = 0.0f64;
    let mut reserve = 0.0f64;
    let mut cumulative = 0.0f64;
    for p in 0..num_periods {
        let month_index = ((p as u32 * mpp) as usize).min(total_months as usize);
        let fees_basis = match config.management_fee_basis {
            ManagementFeeBasis::CommittedCapital => config.fund_size,
            ManagementFeeBasis::InvestedCapital => invested_by_month[month_index],
            ManagementFeeBasis::NetAssetValue => invested_by_month[month_index] + reserve,
        };
        // No fee accrues past the final month.
        let accrues = (p as u32 * mpp) < total_months;
        let row = &mut periods[p];
        if accrues {
            row.management_fees = -(config.management_fee_rate * fees_basis * dt_years);
            row.fund_expenses = -(cf.fund_expense_rate * config.fund_size * dt_years);
        }

        let proceeds = row.origination_fees
            + row.principal_repayments
            + row.interest_income
            + row.appreciation_share
            + row.management_fees
            + row.fund_expenses;
        pool += proceeds - reinvested_by_period[p];
        reserve += -row.capital_calls + row.loan_investments + proceeds;

        // Distribution policy: retain everything inside the reinvestment
        // window, then pay proceeds out above the minimum reserve; the
        // final period sweeps the whole cash balance, undeployed capital
        // included.
        let is_final = p == num_periods - 1;
        let distributable = if is_final {
            reserve.max(0.0)
        } else if p < window_end_period {
            0.0
        } else {
            (pool - min_reserve).max(0.0).min(reserve.max(0.0))
        };
        row.distributions = -distributable;
        pool -= distributable;
        reserve -= distributable;
        row.cash_reserve = reserve;

        row.net_cashflow = row.capital_calls
            + row.loan_investments
            + row.origination_fees
            + row.principal_repayments
            + row.interest_income
            + row.appreciation_share
            + row.management_fees
            + row.fund_expenses
            + row.leverage_draws
            + row.leverage_repayments
            + row.leverage_interest
            + row.distributions;
        cumulative += row.net_cashflow;
        row.cumulative_cashflow = cumulative;
    }

    periods
}

// ---------------------------------------------------------------------------
// Stakeholder level
// ---------------------------------------------------------------------------

fn build_stakeholder_level(
    config: &SimulationConfig,
    fund_level: &[FundPeriodCashflow],
) -> (Vec<StakeholderCashflow>, Vec<StakeholderCashflow>) {
    let gp_pct = config.gp_commitment_percentage;
    let mut lp_rows = Vec::with_capacity(fund_level.len());
    let mut gp_rows = Vec::with_capacity(fund_level.len());
    let mut lp_cum = 0.0;
    let mut gp_cum = 0.0;

    for row in fund_level {
        let lp_call = if row.period == 0 {
            -(config.fund_size * (1.0 - gp_pct))
        } else {
            0.0
        };
        let gp_call = if row.period == 0 {
            -(config.fund_size * gp_pct)
        } else {
            0.0
        };

        let lp_net = lp_call;
        lp_cum += lp_net;
        lp_rows.push(StakeholderCashflow {
            period: row.period,
            year: row.year,
            capital_calls: lp_call,
            management_fees: 0.0,
            origination_fees: 0.0,
            distributions: 0.0,
            net_cashflow: lp_net,
            cumulative_cashflow: lp_cum,
        });

        // Management and origination fees flow to the GP as revenue.
        let gp_fees = -row.management_fees;
        let gp_orig = row.origination_fees;
        let gp_net = gp_call + gp_fees + gp_orig;
        gp_cum += gp_net;
        gp_rows.push(StakeholderCashflow {
            period: row.period,
            year: row.year,
            capital_calls: gp_call,
            management_fees: gp_fees,
            origination_fees: gp_orig,
            distributions: 0.0,
            net_cashflow: gp_net,
            cumulative_cashflow: gp_cum,
        });
    }

    (lp_rows, gp_rows)
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

pub fn aggregate(
    config: &SimulationConfig,
    loans: &[Loan],
    exits: &BTreeMap<String, ExitRecord>,
    reinvestment: &ReinvestmentSummary,
    cancel: &CancelFlag,
    progress: &ProgressSink,
) -> SimResult<(CashflowBundle, Vec<GuardrailViolation>)> {
    progress.emit(MODULE, 0.0, "building loan-level cashflows");
    let mut advisories = Vec::new();

    let (loan_level, dropped) = build_loan_level(config, loans, exits, cancel)?;
    if dropped > 0 {
        warn!(dropped, "cashflow entries outside the fund window were dropped");
        advisories.push(GuardrailViolation::advisory(
            "out_of_window_cashflows",
            MODULE,
            format!("{dropped} loan cashflow entries fell outside [0, fund_term] and were dropped"),
        ));
    }

    progress.emit(MODULE, 40.0, "bucketing fund-level periods");
    let fund_level = build_fund_level(config, &loan_level, loans, exits, reinvestment);
    let (lp_cashflows, gp_cashflows) = build_stakeholder_level(config, &fund_level);

    progress.emit(MODULE, 70.0, "deriving analytics");
    let cf = &config.cashflow_aggregator;
    let analytics = cf
        .enable_analytics
        .then(|| analytics::derive(config, &fund_level, &gp_cashflows, loans, exits));
    let visualization = cf
        .enable_visualization
        .then(|| viz::build(config, &fund_level, reinvestment.total_reinvested));

    let bundle = CashflowBundle {
        granularity: cf.time_granularity,
        loan_level,
        fund_level,
        lp_cashflows,
        gp_cashflows,
        analytics,
        visualization,
    };

    info!(
        periods = bundle.fund_level.len(),
        distributions = bundle.total_distributions(),
        "cashflow aggregation complete"
    );
    progress.emit(MODULE, 100.0, "cashflow aggregation complete");
    Ok((bundle, advisories))
}
