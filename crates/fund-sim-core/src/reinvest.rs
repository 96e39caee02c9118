//! Reinvestment engine.
//!
//! Walks the reinvestment window month by month, pools exited capital, and
//! recycles it into new loans once the pool clears the configured
//! threshold. New loans get their own exit simulation immediately, so later
//! months of the window can recycle their proceeds again.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::info;

use crate::config::{ReinvestmentStrategy, SimulationConfig};
use crate::engine::control::{CancelFlag, ProgressSink};
use crate::exits::{self, ExitRecord};
use crate::loans::{self, Loan};
use crate::price_path::PricePaths;
use crate::tls::TlsDataProvider;
use crate::types::PerZone;
use crate::SimResult;

const MODULE: &str = "reinvestment";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReinvestmentEvent {
    pub event_id: String,
    /// Months since fund inception.
    pub month: u32,
    pub year: f64,
    /// Capital deployed in this batch.
    pub amount: f64,
    /// Exited loans whose proceeds funded the batch.
    pub source_loan_ids: Vec<String>,
    pub strategy_used: ReinvestmentStrategy,
    /// Weight split requested for the batch.
    pub target_allocations: PerZone<f64>,
    /// Dollars actually placed per zone.
    pub actual_allocations: PerZone<f64>,
    pub num_loans_generated: usize,
    pub loan_ids: Vec<String>,
    pub cash_reserve_before: f64,
    pub cash_reserve_after: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReinvestmentSummary {
    pub events: Vec<ReinvestmentEvent>,
    pub total_reinvested: f64,
    pub num_loans_generated: usize,
    /// Capital deployed per month; the cashflow aggregator nets this out of
    /// the distributable pool.
    pub reinvested_by_month: BTreeMap<u32, f64>,
    pub reinvested_by_zone: PerZone<f64>,
}

fn batch_weights(
    config: &SimulationConfig,
    loans_so_far: &[Loan],
) -> PerZone<f64> {
    let prefs = &config.reinvestment_engine.zone_preference_multipliers;
    let raw = match config.reinvestment_engine.strategy {
        ReinvestmentStrategy::MaintainTargetAllocations => config
            .zone_allocations
            .map(|zone, w| w * prefs.get(zone)),
        ReinvestmentStrategy::RebalanceTowardTargets => {
            let actual = loans::actual_allocation(loans_so_far);
            let total = actual.sum().max(1.0);
            let gaps = config
                .zone_allocations
                .map(|zone, target| (target - actual.get(zone) / total).max(0.0));
            if gaps.sum() > 0.0 {
                gaps.map(|zone, g| g * prefs.get(zone))
            } else {
                config.zone_allocations.map(|zone, w| w * prefs.get(zone))
            }
        }
    };
    let total = raw.sum();
    if total > 0.0 {
        raw.map(|_, w| w / total)
    } else {
        config.zone_allocations
    }
}

/// Run the reinvestment window. Appends generated loans and their exits to
/// the book in place and returns the event log.
#[allow(clippy::too_many_arguments)]
pub fn run(
    config: &SimulationConfig,
    tls: &dyn TlsDataProvider,
    paths: &PricePaths,
    rng: &mut StdRng,
    cancel: &CancelFlag,
    progress: &ProgressSink,
    book: &mut Vec<Loan>,
    exit_records: &mut BTreeMap<String, ExitRecord>,
) -> SimResult<ReinvestmentSummary> {
    let window_end = config.reinvestment_window_months();
    if window_end == 0 {
        return Ok(ReinvestmentSummary::default());
    }
    let threshold = config
        .reinvestment_engine
        .reinvestment_threshold
        .unwrap_or(config.min_loan_size);

    progress.emit(MODULE, 0.0, "scanning reinvestment window");

    // Exit proceeds by month, fed by the initial book and extended as new
    // loans get their own exits.
    let mut proceeds_by_month: BTreeMap<u32, Vec<(String, f64)>> = BTreeMap::new();
    for record in exit_records.values() {
        proceeds_by_month
            .entry(record.exit_month)
            .or_default()
            .push((record.loan_id.clone(), record.fund_return));
    }

    let mut summary = ReinvestmentSummary::default();
    let mut pending_cash = 0.0;
    let mut pending_sources: Vec<String> = Vec::new();

    for month in 1..window_end {
        if month % 12 == 0 {
            cancel.check(MODULE)?;
            progress.emit(
                MODULE,
                100.0 * month as f64 / window_end as f64,
                "processing reinvestment window",
            );
        }

        if let Some(entries) = proceeds_by_month.get(&month) {
            for (loan_id, amount) in entries {
                pending_cash += amount;
                pending_sources.push(loan_id.clone());
            }
        }
        if pending_cash < threshold || pending_sources.is_empty() {
            continue;
        }

        let weights = batch_weights(config, book);
        let amounts = weights.map(|_, w| w * pending_cash);
        let new_loans = loans::generate_reinvestment_loans(
            config,
            tls,
            rng,
            &amounts,
            month,
            book.len(),
        )?;
        if new_loans.is_empty() {
            continue;
        }

        let placed: f64 = new_loans.iter().map(|l| l.loan_size).sum();
        let actual = loans::actual_allocation(&new_loans);
        let loan_ids: Vec<String> = new_loans.iter().map(|l| l.loan_id.clone()).collect();

        // New loans exit too; their proceeds can fund later batches.
        for loan in &new_loans {
            let seed: u64 = rng.gen();
            let mut loan_rng = StdRng::seed_from_u64(seed);
            let record = exits::simulate_loan_exit(config, loan, paths, &mut loan_rng);
            proceeds_by_month
                .entry(record.exit_month)
                .or_default()
                .push((record.loan_id.clone(), record.fund_return));
            exit_records.insert(loan.loan_id.clone(), record);
        }

        let event = ReinvestmentEvent {
            event_id: format!("REINV{:04}", summary.events.len()),
            month,
            year: month as f64 / 12.0,
            amount: placed,
            source_loan_ids: std::mem::take(&mut pending_sources),
            strategy_used: config.reinvestment_engine.strategy,
            target_allocations: weights,
            actual_allocations: actual,
            num_loans_generated: new_loans.len(),
            loan_ids,
            cash_reserve_before: pending_cash,
            cash_reserve_after: pending_cash - placed,
        };

        pending_cash -= placed;
        summary.total_reinvested += placed;
        summary.num_loans_generated += new_loans.len();
        *summary.reinvested_by_month.entry(month).or_default() += placed;
        for zone in crate::types::Zone::ALL {
            *summary.reinvested_by_zone.get_mut(zone) += actual.get(zone);
        }
        summary.events.push(event);
        book.extend(new_loans);
    }

    info!(
        events = summary.events.len(),
        total_reinvested = summary.total_reinvested,
        new_loans = summary.num_loans_generated,
        "reinvestment window complete"
    );
    progress.emit(MODULE, 100.0, "reinvestment complete");
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capital;
    use crate::tls::MockTlsDataSource;
    use rand::SeedableRng;

    const SEED: u64 = 42;

    fn build_world(
        reinvestment_period: u32,
    ) -> (
        SimulationConfig,
        MockTlsDataSource,
        Vec<Loan>,
        BTreeMap<String, ExitRecord>,
        PricePaths,
        StdRng,
    ) {
        let mut config = SimulationConfig::default();
        config.reinvestment_period = reinvestment_period;
        let tls = MockTlsDataSource::new(60, 20, SEED);
        let allocation = capital::allocate(&config);
        let mut rng = StdRng::seed_from_u64(SEED);
        let book =
            loans::generate_initial_book(&config, &tls, &mut rng, &allocation.capital_by_zone)
                .unwrap();
        let (paths, _) = crate::price_path::simulate(
            &config,
            &book,
            &mut rng,
            &CancelFlag::new(),
            &ProgressSink::disabled(),
        )
        .unwrap();
        let exits = exits::simulate(
            &config,
            &book,
            &paths,
            &mut rng,
            &CancelFlag::new(),
            &ProgressSink::disabled(),
        )
        .unwrap();
        (config, tls, book, exits, paths, rng)
    }

    #[test]
    fn test_reinvestment_grows_the_book() {
        let (config, tls, mut book, mut exit_records, paths, mut rng) = build_world(5);
        let before = book.len();
        let summary = run(
            &config,
            &tls,
            &paths,
            &mut rng,
            &CancelFlag::new(),
            &ProgressSink::disabled(),
            &mut book,
            &mut exit_records,
        )
        .unwrap();
        assert!(book.len() > before, "no loans were recycled");
        assert_eq!(book.len() - before, summary.num_loans_generated);
        assert!(summary.total_reinvested > 0.0);
        // Every new loan carries an exit record.
        assert_eq!(exit_records.len(), book.len());
    }

    #[test]
    fn test_new_loans_originate_inside_window() {
        let (config, tls, mut book, mut exit_records, paths, mut rng) = build_world(5);
        run(
            &config,
            &tls,
            &paths,
            &mut rng,
            &CancelFlag::new(),
            &ProgressSink::disabled(),
            &mut book,
            &mut exit_records,
        )
        .unwrap();
        for loan in book.iter().filter(|l| l.is_reinvestment) {
            assert!(loan.origination_month < 60);
            let exit = &exit_records[&loan.loan_id];
            assert!(exit.exit_month > loan.origination_month);
            assert!(exit.exit_month <= 120);
        }
    }

    #[test]
    fn test_zero_window_is_noop() {
        let (config, tls, mut book, mut exit_records, paths, mut rng) = build_world(0);
        let before = book.len();
        let summary = run(
            &config,
            &tls,
            &paths,
            &mut rng,
            &CancelFlag::new(),
            &ProgressSink::disabled(),
            &mut book,
            &mut exit_records,
        )
        .unwrap();
        assert_eq!(book.len(), before);
        assert!(summary.events.is_empty());
        assert_eq!(summary.total_reinvested, 0.0);
    }

    #[test]
    fn test_events_account_for_deployed_capital() {
        let (config, tls, mut book, mut exit_records, paths, mut rng) = build_world(5);
        let summary = run(
            &config,
            &tls,
            &paths,
            &mut rng,
            &CancelFlag::new(),
            &ProgressSink::disabled(),
            &mut book,
            &mut exit_records,
        )
        .unwrap();
        for event in &summary.events {
            assert!(event.amount > 0.0);
            assert!(event.cash_reserve_before >= event.amount);
            assert!(
                (event.cash_reserve_after - (event.cash_reserve_before - event.amount)).abs()
                    < 1e-6
            );
            assert_eq!(event.num_loans_generated, event.loan_ids.len());
            assert!(!event.source_loan_ids.is_empty());
            let placed = event.actual_allocations.sum();
            assert!((placed - event.amount).abs() < 1e-6);
        }
        let by_month_total: f64 = summary.reinvested_by_month.values().sum();
        assert!((by_month_total - summary.total_reinvested).abs() < 1e-6);
    }

    #[test]
    fn test_preference_multiplier_biases_zones() {
        let (mut config, tls, _, _, _, _) = build_world(5);
        config.reinvestment_engine.zone_preference_multipliers = PerZone::new(3.0, 1.0, 1.0);
        let weights = batch_weights(&config, &[]);
        assert!(weights.green > config.zone_allocations.green);
        assert!((weights.sum() - 1.0).abs() < 1e-12);
    }
}
