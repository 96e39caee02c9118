//! Orchestrator: the sole entrypoint to the simulation core.
//!
//! Drives the module pipeline in its fixed dependency order, records
//! per-module wall time, checks the cancellation flag between modules,
//! evaluates guardrails at the stages that produce them, and assembles the
//! run summary. A configuration failure never enters `Running`.

use std::sync::mpsc::SyncSender;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info};

use super::context::{generate_run_id, SimulationContext, TlsSummary};
use super::control::{CancelFlag, ProgressEvent, ProgressSink};
use crate::capital;
use crate::cashflow;
use crate::config::SimulationConfig;
use crate::error::{GuardrailViolation, SimError};
use crate::exits;
use crate::loans;
use crate::monte_carlo;
use crate::price_path;
use crate::reinvest::{self, ReinvestmentSummary};
use crate::risk;
use crate::summary::{RunError, RunStatus, RunSummary};
use crate::tls::{self, TlsDataProvider};
use crate::waterfall;
use crate::SimResult;

/// Realized zone weights may drift this far from target before the
/// advisory fires.
const ALLOCATION_DRIFT_TOLERANCE: f64 = 0.05;

#[derive(Default)]
pub struct RunOptions {
    pub run_id: Option<String>,
    /// Overrides the configured seed when set (CLI `--seed`).
    pub seed: Option<u64>,
    pub cancel: Option<CancelFlag>,
    pub progress: Option<SyncSender<ProgressEvent>>,
}

/// Run a simulation against the TLS source selected by the environment.
pub fn run(config: SimulationConfig, options: RunOptions) -> RunSummary {
    let tls = tls::provider_from_env(options.seed.unwrap_or(config.seed));
    run_with_tls(config, tls, options)
}

/// Run a simulation against an explicit TLS source.
pub fn run_with_tls(
    mut config: SimulationConfig,
    tls: Arc<dyn TlsDataProvider>,
    options: RunOptions,
) -> RunSummary {
    if let Some(seed) = options.seed {
        config.seed = seed;
    }
    let run_id = options.run_id.unwrap_or_else(generate_run_id);
    let cancel = options.cancel.unwrap_or_default();
    let progress = ProgressSink::new(&run_id, options.progress);

    let mut status = RunStatus::Pending;

    // Configuration is validated before the run ever enters RUNNING.
    let advisories = match config.validate() {
        Ok(advisories) => advisories,
        Err(e) => {
            error!(run_id = %run_id, error = %e, "configuration rejected");
            let context =
                SimulationContext::new(config, tls, Some(run_id), cancel, progress);
            assert!(status.can_transition(RunStatus::Failed));
            status = RunStatus::Failed;
            return RunSummary::from_context(&context, status, Some(RunError::from(&e)));
        }
    };

    let mut context =
        SimulationContext::new(config, tls, Some(run_id), cancel, progress);
    context.add_violations(advisories);

    assert!(status.can_transition(RunStatus::Running));
    status = RunStatus::Running;

    match execute_pipeline(&mut context) {
        Ok(()) => {
            assert!(status.can_transition(RunStatus::Completed));
            info!(
                run_id = %context.run_id,
                loans = context.loans.len(),
                seconds = context.total_execution_time(),
                "simulation completed"
            );
            RunSummary::from_context(&context, RunStatus::Completed, None)
        }
        Err(SimError::Cancelled { module }) => {
            assert!(status.can_transition(RunStatus::Cancelled));
            info!(run_id = %context.run_id, module = %module, "simulation cancelled");
            RunSummary::from_context(&context, RunStatus::Cancelled, None)
        }
        Err(e) => {
            assert!(status.can_transition(RunStatus::Failed));
            error!(run_id = %context.run_id, error = %e, "simulation failed");
            RunSummary::from_context(&context, RunStatus::Failed, Some(RunError::from(&e)))
        }
    }
}

fn run_module(
    context: &mut SimulationContext,
    name: &str,
    f: impl FnOnce(&mut SimulationContext) -> SimResult<()>,
) -> SimResult<()> {
    context.cancel.check(name)?;
    context.progress.emit(name, 0.0, "starting");
    let start = Instant::now();
    f(context)?;
    context.record_timing(name, start.elapsed().as_secs_f64());
    context.progress.emit(name, 100.0, "completed");
    Ok(())
}

fn execute_pipeline(context: &mut SimulationContext) -> SimResult<()> {
    run_module(context, "tls_module", |ctx| {
        ctx.tls_summary = Some(TlsSummary {
            num_suburbs: ctx.tls.num_suburbs(),
            zone_distribution: ctx.tls.zone_distribution(),
        });
        Ok(())
    })?;

    run_module(context, "capital_allocator", |ctx| {
        ctx.capital_allocation = Some(capital::allocate(&ctx.config));
        Ok(())
    })?;

    run_module(context, "loan_generator", |ctx| {
        let budgets = ctx
            .capital_allocation
            .as_ref()
            .map(|a| a.capital_by_zone)
            .ok_or_else(|| SimError::Internal {
                module: "loan_generator".into(),
                message: "capital allocation missing".into(),
            })?;
        ctx.loans =
            loans::generate_initial_book(&ctx.config, ctx.tls.as_ref(), &mut ctx.rng, &budgets)?;
        Ok(())
    })?;
    check_allocation_drift(context);

    run_module(context, "price_path", |ctx| {
        let (paths, advisories) = price_path::simulate(
            &ctx.config,
            &ctx.loans,
            &mut ctx.rng,
            &ctx.cancel,
            &ctx.progress,
        )?;
        ctx.price_paths = Some(paths);
        ctx.add_violations(advisories);
        Ok(())
    })?;

    run_module(context, "exit_simulator", |ctx| {
        let paths = ctx.price_paths.as_ref().ok_or_else(|| SimError::Internal {
            module: "exit_simulator".into(),
            message: "price paths missing".into(),
        })?;
        ctx.exits = exits::simulate(
            &ctx.config,
            &ctx.loans,
            paths,
            &mut ctx.rng,
            &ctx.cancel,
            &ctx.progress,
        )?;
        Ok(())
    })?;

    run_module(context, "reinvestment", |ctx| {
        let paths = ctx.price_paths.as_ref().ok_or_else(|| SimError::Internal {
            module: "reinvestment".into(),
            message: "price paths missing".into(),
        })?;
        let summary = reinvest::run(
            &ctx.config,
            ctx.tls.as_ref(),
            paths,
            &mut ctx.rng,
            &ctx.cancel,
            &ctx.progress,
            &mut ctx.loans,
            &mut ctx.exits,
        )?;
        ctx.reinvestment = Some(summary);
        // The enhanced exit diagnostics cover the full book, reinvestment
        // loans included.
        ctx.exit_analytics = Some(exits::analyze(&ctx.loans, &ctx.exits));
        Ok(())
    })?;

    run_module(context, "cashflow_aggregator", |ctx| {
        let default_reinvestment = ReinvestmentSummary::default();
        let reinvestment = ctx.reinvestment.as_ref().unwrap_or(&default_reinvestment);
        let (bundle, advisories) = cashflow::aggregate(
            &ctx.config,
            &ctx.loans,
            &ctx.exits,
            reinvestment,
            &ctx.cancel,
            &ctx.progress,
        )?;
        ctx.cashflows = Some(bundle);
        ctx.add_violations(advisories);
        Ok(())
    })?;

    run_module(context, "waterfall_engine", |ctx| {
        let cashflows = ctx.cashflows.as_ref().ok_or_else(|| SimError::Internal {
            module: "waterfall_engine".into(),
            message: "cashflows missing".into(),
        })?;
        let (result, advisories) =
            waterfall::distribute(&ctx.config, cashflows, &ctx.loans, &ctx.exits)?;
        ctx.waterfall = Some(result);
        ctx.add_violations(advisories);
        Ok(())
    })?;

    if context.config.monte_carlo.enabled {
        run_module(context, "monte_carlo", |ctx| {
            ctx.monte_carlo = Some(monte_carlo::run(
                &ctx.config,
                &ctx.loans,
                &mut ctx.rng,
                &ctx.cancel,
                &ctx.progress,
            )?);
            Ok(())
        })?;
    }

    run_module(context, "risk_metrics", |ctx| {
        let paths = ctx.price_paths.as_ref().ok_or_else(|| SimError::Internal {
            module: "risk_metrics".into(),
            message: "price paths missing".into(),
        })?;
        let cashflows = ctx.cashflows.as_ref().ok_or_else(|| SimError::Internal {
            module: "risk_metrics".into(),
            message: "cashflows missing".into(),
        })?;
        let (metrics, advisories) = risk::calculate(
            &ctx.config,
            ctx.tls.as_ref(),
            &ctx.loans,
            &ctx.exits,
            paths,
            cashflows,
            ctx.monte_carlo.as_ref(),
            &ctx.cancel,
            &ctx.progress,
        )?;
        ctx.metrics = Some(metrics);
        ctx.add_violations(advisories);
        Ok(())
    })?;

    context.cancel.check("orchestrator")?;
    Ok(())
}

fn check_allocation_drift(context: &mut SimulationContext) {
    let actual = loans::actual_allocation(&context.loans);
    let total = actual.sum();
    if total <= 0.0 {
        return;
    }
    for (zone, target) in context.config.zone_allocations.iter() {
        let realized = actual.get(zone) / total;
        if (realized - target).abs() > ALLOCATION_DRIFT_TOLERANCE {
            context.guardrail_violations.push(GuardrailViolation::advisory(
                "allocation_drift",
                "loan_generator",
                format!(
                    "realized {zone} allocation {:.1}% drifted from target {:.1}%",
                    realized * 100.0,
                    target * 100.0
                ),
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tls::MockTlsDataSource;
    use crate::types::PerZone;
    use std::sync::mpsc::sync_channel;

    fn mock_tls() -> Arc<dyn TlsDataProvider> {
        Arc::new(MockTlsDataSource::new(60, 20, 1))
    }

    fn baseline_config() -> SimulationConfig {
        let mut config = SimulationConfig::default();
        config.seed = 42;
        config.reinvestment_period = 0;
        config
    }

    fn baseline_options(run_id: &str) -> RunOptions {
        RunOptions {
            run_id: Some(run_id.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_s1_baseline_run() {
        let summary = run_with_tls(baseline_config(), mock_tls(), baseline_options("s1"));
        assert_eq!(summary.status, RunStatus::Completed);
        assert!(summary.error.is_none());
        assert!(
            (320..=480).contains(&summary.num_loans),
            "num_loans={}",
            summary.num_loans
        );
        let metrics = summary.metrics.as_ref().unwrap();
        let irr = metrics.performance_metrics.net_irr.value.unwrap();
        assert!(irr > 0.0, "irr={irr}");
        let analytics = summary.cashflows.len();
        assert!(analytics > 0);
        let tvpi = summary
            .waterfall
            .as_ref()
            .map(|w| w.distributions.total_distributed / 100e6)
            .unwrap();
        assert!(tvpi > 1.0, "tvpi={tvpi}");
        assert!(
            summary.guardrail_violations.is_empty(),
            "{:?}",
            summary.guardrail_violations
        );
        // Every pipeline module reported a timing.
        let modules: Vec<&str> = summary
            .module_timings
            .iter()
            .map(|t| t.module.as_str())
            .collect();
        assert_eq!(
            modules,
            vec![
                "tls_module",
                "capital_allocator",
                "loan_generator",
                "price_path",
                "exit_simulator",
                "reinvestment",
                "cashflow_aggregator",
                "waterfall_engine",
                "risk_metrics",
            ]
        );
    }

    #[test]
    fn test_s2_allocation_violation_never_runs() {
        let mut config = baseline_config();
        config.zone_allocations = PerZone::new(0.7, 0.2, 0.1);
        let summary = run_with_tls(config, mock_tls(), baseline_options("s2"));
        assert_eq!(summary.status, RunStatus::Failed);
        let error = summary.error.unwrap();
        assert_eq!(error.kind, "config_validation");
        // Never entered RUNNING: no module executed.
        assert!(summary.module_timings.is_empty());
        assert!(summary.metrics.is_none());
    }

    #[test]
    fn test_s3_ltv_violation() {
        let mut config = baseline_config();
        config.max_ltv = 0.90;
        let summary = run_with_tls(config, mock_tls(), baseline_options("s3"));
        assert_eq!(summary.status, RunStatus::Failed);
        assert_eq!(summary.error.unwrap().kind, "config_validation");
    }

    #[test]
    fn test_s4_reinvestment_grows_committed_capital() {
        // Same run id, so both runs share the initial book and differ only
        // in the reinvestment window.
        let base = run_with_tls(baseline_config(), mock_tls(), baseline_options("s4"));

        let mut config = baseline_config();
        config.reinvestment_period = 5;
        let reinvested = run_with_tls(config, mock_tls(), baseline_options("s4"));

        assert_eq!(reinvested.status, RunStatus::Completed);
        assert!(
            reinvested.num_loans > base.num_loans,
            "{} vs {}",
            reinvested.num_loans,
            base.num_loans
        );
        assert!(reinvested.loan_portfolio.total_loan_amount > 100e6);
        // Period 0 is untouched by reinvestment.
        assert_eq!(
            base.cashflows[0].cumulative_cashflow,
            reinvested.cashflows[0].cumulative_cashflow
        );
    }

    #[test]
    fn test_s5_european_waterfall_invariants() {
        let summary = run_with_tls(baseline_config(), mock_tls(), baseline_options("s5"));
        let waterfall = summary.waterfall.as_ref().unwrap();
        let d = &waterfall.distributions;
        let pool: f64 = summary.cashflows.iter().map(|r| -r.distributions).sum();

        assert!((d.return_of_capital - pool.min(100e6)).abs() < 0.01);
        assert!(d.preferred_return >= 0.0);
        // Conservation within one cent.
        assert!(
            (d.total_to_lp + d.total_to_gp - pool).abs() < 0.01,
            "lp+gp={} pool={pool}",
            d.total_to_lp + d.total_to_gp
        );
    }

    #[test]
    fn test_s6_cancellation_mid_run() {
        let (tx, rx) = sync_channel::<ProgressEvent>(256);
        let cancel = CancelFlag::new();
        let cancel_remote = cancel.clone();
        let listener = std::thread::spawn(move || {
            while let Ok(event) = rx.recv() {
                if event.module == "capital_allocator" && event.progress >= 100.0 {
                    cancel_remote.cancel();
                }
            }
        });

        let options = RunOptions {
            run_id: Some("s6".into()),
            seed: None,
            cancel: Some(cancel),
            progress: Some(tx),
        };
        let summary = run_with_tls(baseline_config(), mock_tls(), options);
        listener.join().unwrap();

        assert_eq!(summary.status, RunStatus::Cancelled);
        assert!(summary.metrics.is_none());
        assert!(summary.cashflows.is_empty());
        // Only modules that completed before the flag was observed appear.
        assert!(summary.module_timings.len() < 9);
        assert!(summary
            .module_timings
            .iter()
            .any(|t| t.module == "capital_allocator"));
    }

    #[test]
    fn test_pre_cancelled_run_has_no_timings() {
        let cancel = CancelFlag::new();
        cancel.cancel();
        let options = RunOptions {
            run_id: Some("pre-cancel".into()),
            seed: None,
            cancel: Some(cancel),
            progress: None,
        };
        let summary = run_with_tls(baseline_config(), mock_tls(), options);
        assert_eq!(summary.status, RunStatus::Cancelled);
        assert!(summary.module_timings.is_empty());
        assert_eq!(summary.num_loans, 0);
    }

    #[test]
    fn test_determinism_for_fixed_seed_and_run_id() {
        let a = run_with_tls(baseline_config(), mock_tls(), baseline_options("det"));
        let b = run_with_tls(baseline_config(), mock_tls(), baseline_options("det"));
        assert_eq!(a.num_loans, b.num_loans);
        let metrics_a = serde_json::to_string(&a.metrics).unwrap();
        let metrics_b = serde_json::to_string(&b.metrics).unwrap();
        assert_eq!(metrics_a, metrics_b);
        let loans_a = serde_json::to_string(&a.loans).unwrap();
        let loans_b = serde_json::to_string(&b.loans).unwrap();
        assert_eq!(loans_a, loans_b);
    }

    #[test]
    fn test_seed_override_changes_results() {
        let a = run_with_tls(baseline_config(), mock_tls(), baseline_options("seed"));
        let mut options = baseline_options("seed");
        options.seed = Some(7);
        let b = run_with_tls(baseline_config(), mock_tls(), options);
        assert_ne!(
            serde_json::to_string(&a.loans).unwrap(),
            serde_json::to_string(&b.loans).unwrap()
        );
    }

    #[test]
    fn test_allocation_infeasible_fails_run() {
        let mut config = baseline_config();
        // A red-zone sliver below the minimum loan size.
        config.fund_size = 1_000_000.0;
        config.zone_allocations = PerZone::new(0.55, 0.40, 0.05);
        let summary = run_with_tls(config, mock_tls(), baseline_options("infeasible"));
        assert_eq!(summary.status, RunStatus::Failed);
        let error = summary.error.unwrap();
        assert_eq!(error.kind, "allocation_infeasible");
        assert_eq!(error.module, "loan_generator");
    }

    #[test]
    fn test_monte_carlo_stage_runs_when_enabled() {
        let mut config = baseline_config();
        config.monte_carlo.enabled = true;
        config.monte_carlo.num_simulations = 25;
        let summary = run_with_tls(config, mock_tls(), baseline_options("mc"));
        assert_eq!(summary.status, RunStatus::Completed);
        assert!(summary.monte_carlo.is_some());
        assert!(summary
            .module_timings
            .iter()
            .any(|t| t.module == "monte_carlo"));
        let metrics = summary.metrics.unwrap();
        assert!(!metrics.market_price_metrics.var_95.is_approximation);
    }

    #[test]
    fn test_summary_sanitizes_for_transport() {
        let summary = run_with_tls(baseline_config(), mock_tls(), baseline_options("json"));
        let value = summary.to_sanitized_json().unwrap();
        assert_eq!(value["status"], serde_json::json!("completed"));
        assert!(value["metrics"]["performance_metrics"].is_object());
        // Spot-check rounding: every float in module timings has at most 3
        // decimals.
        for timing in value["module_timings"].as_array().unwrap() {
            let seconds = timing["seconds"].as_f64().unwrap();
            let scaled = seconds * 1000.0;
            assert!((scaled - scaled.round()).abs() < 1e-6);
        }
    }
}
