//! Run summary assembly and JSON sanitization.
//!
//! The summary is the only artifact handed to result stores and API
//! consumers. Transport JSON carries finite doubles only: NaN/Inf map to
//! null, magnitudes clamp to ±1e15, and floats round to 3 decimals.
//! Internal computation keeps full precision throughout.

use rust_decimal::prelude::*;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::capital::CapitalAllocation;
use crate::cashflow::FundPeriodCashflow;
use crate::engine::context::{ModuleTiming, SimulationContext};
use crate::error::{GuardrailViolation, SimError};
use crate::exits::ExitAnalytics;
use crate::loans::{self, Loan};
use crate::monte_carlo::McSummary;
use crate::reinvest::ReinvestmentSummary;
use crate::risk::RiskMetrics;
use crate::types::PerZone;
use crate::waterfall::WaterfallResult;
use crate::SimResult;

const TRANSPORT_CLAMP: f64 = 1e15;

/// Run lifecycle. Only `Pending → Running` and `Running → {Completed,
/// Failed, Cancelled}` are legal; a config-validation failure goes straight
/// to `Failed` without ever entering `Running`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn can_transition(self, to: RunStatus) -> bool {
        matches!(
            (self, to),
            (RunStatus::Pending, RunStatus::Running)
                | (RunStatus::Pending, RunStatus::Failed)
                | (
                    RunStatus::Running,
                    RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled
                )
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunError {
    pub kind: String,
    pub module: String,
    pub message: String,
}

impl From<&SimError> for RunError {
    fn from(e: &SimError) -> Self {
        RunError {
            kind: e.kind().to_string(),
            module: e.module().to_string(),
            message: e.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigSummary {
    pub fund_size: f64,
    pub fund_term: u32,
    pub vintage_year: i32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoanPortfolioStats {
    pub num_loans: usize,
    pub total_loan_amount: f64,
    pub avg_loan_size: f64,
    pub avg_ltv: f64,
    pub loans_by_zone: PerZone<usize>,
    pub num_reinvestment_loans: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ZoneAllocationReport {
    /// Target weights.
    pub targets: PerZone<f64>,
    /// Realized weights over the final book.
    pub actual: PerZone<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: String,
    pub status: RunStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RunError>,
    pub config_summary: ConfigSummary,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics: Option<RiskMetrics>,
    pub execution_time: f64,
    pub module_timings: Vec<ModuleTiming>,
    pub guardrail_violations: Vec<GuardrailViolation>,
    pub num_loans: usize,
    pub zone_allocation: ZoneAllocationReport,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capital_allocation: Option<CapitalAllocation>,
    pub loans: Vec<Loan>,
    pub loan_portfolio: LoanPortfolioStats,
    /// Fund-level cashflow rows.
    pub cashflows: Vec<FundPeriodCashflow>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub waterfall: Option<WaterfallResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_summary: Option<ExitAnalytics>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reinvestment: Option<ReinvestmentSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub monte_carlo: Option<McSummary>,
}

fn portfolio_stats(book: &[Loan]) -> LoanPortfolioStats {
    if book.is_empty() {
        return LoanPortfolioStats::default();
    }
    let total: f64 = book.iter().map(|l| l.loan_size).sum();
    let mut by_zone = PerZone::new(0usize, 0, 0);
    for loan in book {
        *by_zone.get_mut(loan.zone) += 1;
    }
    LoanPortfolioStats {
        num_loans: book.len(),
        total_loan_amount: total,
        avg_loan_size: total / book.len() as f64,
        avg_ltv: book.iter().map(|l| l.ltv).sum::<f64>() / book.len() as f64,
        loans_by_zone: by_zone,
        num_reinvestment_loans: book.iter().filter(|l| l.is_reinvestment).count(),
    }
}

impl RunSummary {
    /// Build the summary from a finished (or aborted) context. Cancelled
    /// runs discard partial module outputs and keep only bookkeeping.
    pub fn from_context(
        context: &SimulationContext,
        status: RunStatus,
        error: Option<RunError>,
    ) -> Self {
        let discard = status == RunStatus::Cancelled;
        let config = &context.config;

        let actual_dollars = loans::actual_allocation(&context.loans);
        let total = actual_dollars.sum();
        let actual_weights = if total > 0.0 {
            actual_dollars.map(|_, v| v / total)
        } else {
            PerZone::new(0.0, 0.0, 0.0)
        };

        RunSummary {
            run_id: context.run_id.clone(),
            status,
            error,
            config_summary: ConfigSummary {
                fund_size: config.fund_size,
                fund_term: config.fund_term,
                vintage_year: config.vintage_year,
            },
            metrics: if discard { None } else { context.metrics.clone() },
            execution_time: context.total_execution_time(),
            module_timings: context.module_timings.clone(),
            guardrail_violations: context.guardrail_violations.clone(),
            num_loans: if discard { 0 } else { context.loans.len() },
            zone_allocation: ZoneAllocationReport {
                targets: config.zone_allocations,
                actual: if discard {
                    PerZone::new(0.0, 0.0, 0.0)
                } else {
                    actual_weights
                },
            },
            capital_allocation: if discard {
                None
            } else {
                context.capital_allocation.clone()
            },
            loans: if discard {
                Vec::new()
            } else {
                context.loans.clone()
            },
            loan_portfolio: if discard {
                LoanPortfolioStats::default()
            } else {
                portfolio_stats(&context.loans)
            },
            cashflows: if discard {
                Vec::new()
            } else {
                context
                    .cashflows
                    .as_ref()
                    .map(|c| c.fund_level.clone())
                    .unwrap_or_default()
            },
            waterfall: if discard {
                None
            } else {
                context.waterfall.clone()
            },
            exit_summary: if discard {
                None
            } else {
                context.exit_analytics.clone()
            },
            reinvestment: if discard {
                None
            } else {
                context.reinvestment.clone()
            },
            monte_carlo: if discard {
                None
            } else {
                context.monte_carlo.clone()
            },
        }
    }

    /// Serialize with transport sanitization applied.
    pub fn to_sanitized_json(&self) -> SimResult<Value> {
        let mut value = serde_json::to_value(self)?;
        sanitize(&mut value);
        Ok(value)
    }
}

/// Clamp and round a transport double. Full-precision floats stay inside
/// the engine; only serialized output passes through here.
fn sanitize_f64(x: f64) -> Value {
    if !x.is_finite() {
        return Value::Null;
    }
    let clamped = x.clamp(-TRANSPORT_CLAMP, TRANSPORT_CLAMP);
    let rounded = Decimal::from_f64(clamped)
        .map(|d| d.round_dp(3))
        .and_then(|d| d.to_f64())
        .unwrap_or(clamped);
    serde_json::Number::from_f64(rounded)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

/// Recursively sanitize every float in the tree.
pub fn sanitize(value: &mut Value) {
    match value {
        Value::Number(n) => {
            if n.is_f64() {
                if let Some(x) = n.as_f64() {
                    *value = sanitize_f64(x);
                }
            }
        }
        Value::Array(items) => {
            for item in items {
                sanitize(item);
            }
        }
        Value::Object(map) => {
            for (_, item) in map.iter_mut() {
                sanitize(item);
            }
        }
        _ => {}
    }
}
