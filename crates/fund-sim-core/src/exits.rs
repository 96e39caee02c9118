//! Exit simulator.
//!
//! Each loan gets a monthly exit hazard built from a holding-period factor
//! and a price factor; the first Bernoulli success is the exit month. Exit
//! type is drawn from a categorical distribution reweighted by local price
//! and stress conditions, and exit economics follow the type.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use tracing::info;

use crate::config::{AppreciationShareMethod, SimulationConfig};
use crate::engine::control::{CancelFlag, ProgressSink};
use crate::financial;
use crate::loans::Loan;
use crate::price_path::PricePaths;
use crate::types::PerZone;
use crate::SimResult;

const MODULE: &str = "exit_simulator";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitType {
    Sale,
    Refinance,
    Default,
    TermCompletion,
}

impl ExitType {
    pub fn as_str(self) -> &'static str {
        match self {
            ExitType::Sale => "sale",
            ExitType::Refinance => "refinance",
            ExitType::Default => "default",
            ExitType::TermCompletion => "term_completion",
        }
    }
}

impl fmt::Display for ExitType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExitRecord {
    pub loan_id: String,
    /// Months since fund inception.
    pub exit_month: u32,
    pub exit_type: ExitType,
    /// Owner-equity value realized at exit (sale/default economics) or
    /// total proceeds for contractual exits.
    pub exit_value: f64,
    pub appreciation_share_amount: f64,
    /// Principal returned to the fund.
    pub principal: f64,
    pub accrued_interest: f64,
    /// Total cash back to the fund: principal + interest + share.
    pub fund_return: f64,
    pub roi: f64,
    pub annualized_roi: f64,
    /// Price index ratio between origination and exit.
    pub index_ratio: f64,
}

// ---------------------------------------------------------------------------
// Hazard and type sampling
// ---------------------------------------------------------------------------

fn monthly_hazard(config: &SimulationConfig, holding_years: f64, index_ratio: f64) -> f64 {
    let exits = &config.exit_simulator;
    let time_component = (holding_years / config.avg_loan_term).min(2.0);
    let price_component = (index_ratio - 1.0).max(0.0);
    let weight_sum = exits.time_factor + exits.price_factor;
    if weight_sum <= 0.0 {
        return 0.0;
    }
    let combined = (exits.time_factor * time_component + exits.price_factor * price_component)
        / weight_sum;
    (exits.base_exit_rate * combined / 12.0).clamp(0.0, 0.99)
}

fn draw_exit_type(
    config: &SimulationConfig,
    loan: &Loan,
    index_ratio: f64,
    rng: &mut StdRng,
) -> ExitType {
    let exits = &config.exit_simulator;
    let appreciation = index_ratio - 1.0;

    let mut sale = exits.sale_weight;
    let mut refinance = exits.refinance_weight;
    let mut default = exits.default_weight;

    if appreciation >= exits.sale_appreciation_threshold {
        sale *= exits.appreciation_sale_multiplier;
    }
    if index_ratio >= exits.refinance_band_low && index_ratio < exits.refinance_band_high {
        refinance *= exits.interest_rate_refinance_multiplier;
    }

    // Zone credit quality scales the default mass.
    let zone_default = *config.default_rates.get(loan.zone);
    if exits.base_default_rate > 0.0 {
        default *= (zone_default / exits.base_default_rate).max(0.1);
    }
    let current_ltv = loan.ltv / index_ratio;
    if index_ratio < exits.stress_price_threshold || current_ltv > exits.stress_ltv_threshold {
        default *= exits.economic_factor_default_multiplier;
    }

    let total = sale + refinance + default;
    if total <= 0.0 {
        return ExitType::Sale;
    }
    let draw: f64 = rng.gen::<f64>() * total;
    if draw < sale {
        ExitType::Sale
    } else if draw < sale + refinance {
        ExitType::Refinance
    } else {
        ExitType::Default
    }
}

fn appreciation_share_pct(config: &SimulationConfig, loan: &Loan, appreciation: f64) -> f64 {
    let exits = &config.exit_simulator;
    let pct = match exits.appreciation_share_method {
        AppreciationShareMethod::ProRataLtv => loan.ltv,
        AppreciationShareMethod::Fixed => exits.appreciation_share,
        AppreciationShareMethod::Tiered => {
            let bracket = exits
                .tiered_appreciation_thresholds
                .iter()
                .filter(|t| appreciation >= **t)
                .count();
            exits.tiered_appreciation_shares[bracket]
        }
    };
    pct.clamp(exits.min_appreciation_share, exits.max_appreciation_share)
}

/// Simulate the exit of one loan against the generated price paths.
///
/// Shared with the reinvestment engine, whose loans fall back to their
/// suburb or zone series when no property path exists.
pub fn simulate_loan_exit(
    config: &SimulationConfig,
    loan: &Loan,
    paths: &PricePaths,
    rng: &mut StdRng,
) -> ExitRecord {
    let exits = &config.exit_simulator;
    let term_months = config.total_months();
    let orig = loan.origination_month;
    let min_hold_months = (exits.min_hold_period * 12.0).round() as u32;
    let max_hold_months = (exits.max_hold_period * 12.0).round() as u32;
    let horizon = (orig + max_hold_months).min(term_months);

    let ratio_at = |month: u32| {
        paths.index_ratio(
            loan.zone,
            &loan.suburb_id,
            &loan.property_id,
            orig as usize,
            month as usize,
        )
    };

    let mut exit_month = horizon;
    let mut hazard_exit = false;
    let mut month = orig + min_hold_months.max(1);
    while month < horizon {
        let holding_years = (month - orig) as f64 / 12.0;
        let hazard = monthly_hazard(config, holding_years, ratio_at(month));
        if rng.gen::<f64>() < hazard {
            exit_month = month;
            hazard_exit = true;
            break;
        }
        month += 1;
    }

    let index_ratio = ratio_at(exit_month);
    let exit_type = if hazard_exit {
        draw_exit_type(config, loan, index_ratio, rng)
    } else {
        ExitType::TermCompletion
    };

    let holding_years = ((exit_month - orig) as f64 / 12.0).max(1.0 / 12.0);
    let balance = loan.loan_size;
    let interest = balance * loan.interest_rate * holding_years;
    let current_value = loan.property_value * index_ratio;
    let appreciation = index_ratio - 1.0;
    let appreciation_total = (loan.property_value * appreciation).max(0.0);

    let (exit_value, principal, accrued_interest, share) = match exit_type {
        ExitType::Sale => {
            let share = appreciation_total * appreciation_share_pct(config, loan, appreciation);
            (current_value - balance, balance, interest, share)
        }
        ExitType::Refinance => (balance + interest, balance, interest, 0.0),
        ExitType::Default => {
            let recovery = exits
                .recovery_rate
                .unwrap_or(*config.recovery_rates.get(loan.zone));
            let recovered =
                current_value * recovery - exits.foreclosure_cost * loan.property_value;
            let principal = recovered.clamp(0.0, balance);
            (recovered, principal, 0.0, 0.0)
        }
        ExitType::TermCompletion => {
            let share = appreciation_total * appreciation_share_pct(config, loan, appreciation);
            (balance + interest + share, balance, interest, share)
        }
    };

    let fund_return = principal + accrued_interest + share;
    let roi = fund_return / balance - 1.0;
    let annualized_roi = if roi > -1.0 {
        (1.0 + roi).powf(1.0 / holding_years) - 1.0
    } else {
        -1.0
    };

    ExitRecord {
        loan_id: loan.loan_id.clone(),
        exit_month,
        exit_type,
        exit_value,
        appreciation_share_amount: share,
        principal,
        accrued_interest,
        fund_return,
        roi,
        annualized_roi,
        index_ratio,
    }
}

/// Simulate exits for the whole book. Per-loan RNG streams come from seeds
/// pre-sampled in book order, so the result does not depend on how the loop
/// is scheduled.
pub fn simulate(
    config: &SimulationConfig,
    loans: &[Loan],
    paths: &PricePaths,
    rng: &mut StdRng,
    cancel: &CancelFlag,
    progress: &ProgressSink,
) -> SimResult<BTreeMap<String, ExitRecord>> {
    progress.emit(MODULE, 0.0, "simulating loan exits");
    let seeds: Vec<u64> = loans.iter().map(|_| rng.gen()).collect();

    let mut exits = BTreeMap::new();
    for (i, loan) in loans.iter().enumerate() {
        if i % 100 == 0 {
            cancel.check(MODULE)?;
            progress.emit(
                MODULE,
                100.0 * i as f64 / loans.len().max(1) as f64,
                "simulating loan exits",
            );
        }
        let mut loan_rng = StdRng::seed_from_u64(seeds[i]);
        let record = simulate_loan_exit(config, loan, paths, &mut loan_rng);
        exits.insert(loan.loan_id.clone(), record);
    }

    info!(num_exits = exits.len(), "exit simulation complete");
    progress.emit(MODULE, 100.0, "exit simulation complete");
    Ok(exits)
}

// ---------------------------------------------------------------------------
// Enhanced analytics (advisory)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CohortStat {
    pub count: usize,
    pub avg_roi: f64,
    pub avg_holding_years: f64,
    pub total_fund_return: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExitAnalytics {
    pub avg_exit_year: f64,
    pub avg_roi: f64,
    pub avg_annualized_roi: f64,
    /// Fractions by exit type; sums to 1 when any loan exited.
    pub exit_type_distribution: BTreeMap<String, f64>,
    pub exit_count_by_year: BTreeMap<u32, usize>,
    pub exit_value_by_year: BTreeMap<u32, f64>,
    pub exit_type_roi: BTreeMap<String, f64>,
    /// Empirical tails of the realized per-loan ROI distribution.
    pub roi_var_95: f64,
    pub roi_cvar_95: f64,
    pub cohort_by_vintage: BTreeMap<i32, CohortStat>,
    pub cohort_by_zone: PerZone<CohortStat>,
    pub cohort_by_ltv_band: BTreeMap<String, CohortStat>,
}

fn ltv_band(ltv: f64) -> String {
    let lower = (ltv * 10.0).floor() / 10.0;
    format!("{:.1}-{:.1}", lower, lower + 0.1)
}

struct CohortAccum {
    count: usize,
    roi_sum: f64,
    holding_sum: f64,
    return_sum: f64,
}

impl CohortAccum {
    fn new() -> Self {
        CohortAccum {
            count: 0,
            roi_sum: 0.0,
            holding_sum: 0.0,
            return_sum: 0.0,
        }
    }

    fn add(&mut self, roi: f64, holding_years: f64, fund_return: f64) {
        self.count += 1;
        self.roi_sum += roi;
        self.holding_sum += holding_years;
        self.return_sum += fund_return;
    }

    fn finish(&self) -> CohortStat {
        let n = self.count.max(1) as f64;
        CohortStat {
            count: self.count,
            avg_roi: self.roi_sum / n,
            avg_holding_years: self.holding_sum / n,
            total_fund_return: self.return_sum,
        }
    }
}

/// Cohort, tail-risk, and timing diagnostics over the realized exits.
pub fn analyze(
    loans: &[Loan],
    exits: &BTreeMap<String, ExitRecord>,
) -> ExitAnalytics {
    let mut rois = Vec::with_capacity(exits.len());
    let mut exit_years = Vec::with_capacity(exits.len());
    let mut annualized = Vec::with_capacity(exits.len());

    let mut type_counts: BTreeMap<String, usize> = BTreeMap::new();
    let mut type_roi: BTreeMap<String, CohortAccum> = BTreeMap::new();
    let mut count_by_year: BTreeMap<u32, usize> = BTreeMap::new();
    let mut value_by_year: BTreeMap<u32, f64> = BTreeMap::new();
    let mut by_vintage: BTreeMap<i32, CohortAccum> = BTreeMap::new();
    let mut by_zone: PerZone<CohortAccum> =
        PerZone::new(CohortAccum::new(), CohortAccum::new(), CohortAccum::new());
    let mut by_band: BTreeMap<String, CohortAccum> = BTreeMap::new();

    for loan in loans {
        let Some(exit) = exits.get(&loan.loan_id) else {
            continue;
        };
        let holding_years = (exit.exit_month - loan.origination_month) as f64 / 12.0;
        let year = exit.exit_month / 12;

        rois.push(exit.roi);
        annualized.push(exit.annualized_roi);
        exit_years.push(exit.exit_month as f64 / 12.0);

        *type_counts.entry(exit.exit_type.as_str().into()).or_default() += 1;
        type_roi
            .entry(exit.exit_type.as_str().into())
            .or_insert_with(CohortAccum::new)
            .add(exit.roi, holding_years, exit.fund_return);
        *count_by_year.entry(year).or_default() += 1;
        *value_by_year.entry(year).or_default() += exit.fund_return;

        by_vintage
            .entry(loan.origination_year)
            .or_insert_with(CohortAccum::new)
            .add(exit.roi, holding_years, exit.fund_return);
        by_zone
            .get_mut(loan.zone)
            .add(exit.roi, holding_years, exit.fund_return);
        by_band
            .entry(ltv_band(loan.ltv))
            .or_insert_with(CohortAccum::new)
            .add(exit.roi, holding_years, exit.fund_return);
    }

    let total = rois.len().max(1) as f64;
    let exit_type_distribution = type_counts
        .iter()
        .map(|(k, v)| (k.clone(), *v as f64 / total))
        .collect();

    ExitAnalytics {
        avg_exit_year: financial::mean(&exit_years),
        avg_roi: financial::mean(&rois),
        avg_annualized_roi: financial::mean(&annualized),
        exit_type_distribution,
        exit_count_by_year: count_by_year,
        exit_value_by_year: value_by_year,
        exit_type_roi: type_roi
            .iter()
            .map(|(k, acc)| (k.clone(), acc.finish().avg_roi))
            .collect(),
        roi_var_95: financial::value_at_risk(&rois, 0.95),
        roi_cvar_95: financial::conditional_value_at_risk(&rois, 0.95),
        cohort_by_vintage: by_vintage.iter().map(|(k, v)| (*k, v.finish())).collect(),
        cohort_by_zone: by_zone.map(|_, acc| acc.finish()),
        cohort_by_ltv_band: by_band.iter().map(|(k, v)| (k.clone(), v.finish())).collect(),
    }
}
