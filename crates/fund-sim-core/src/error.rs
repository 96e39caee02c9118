use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::Zone;

#[derive(Debug, Error)]
pub enum SimError {
    #[error("Invalid configuration: {field} — {reason}")]
    ConfigValidation { field: String, reason: String },

    #[error(
        "Allocation infeasible: {zone} zone budget {budget:.2} cannot fit a minimum-size loan of {min_loan_size:.2}"
    )]
    AllocationInfeasible {
        zone: Zone,
        budget: f64,
        min_loan_size: f64,
    },

    #[error("Numeric instability in {function}: {detail}")]
    NumericInstability { function: String, detail: String },

    #[error("Simulation cancelled in {module}")]
    Cancelled { module: String },

    #[error("Internal error in {module}: {message}")]
    Internal { module: String, message: String },

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl SimError {
    /// Stable machine-readable kind string, used in the run summary's
    /// `error.kind` field.
    pub fn kind(&self) -> &'static str {
        match self {
            SimError::ConfigValidation { .. } => "config_validation",
            SimError::AllocationInfeasible { .. } => "allocation_infeasible",
            SimError::NumericInstability { .. } => "numeric_instability",
            SimError::Cancelled { .. } => "cancelled",
            SimError::Internal { .. } => "internal",
            SimError::Serialization(_) => "internal",
        }
    }

    /// Module attribution for the structured error payload.
    pub fn module(&self) -> &str {
        match self {
            SimError::ConfigValidation { .. } => "config_validator",
            SimError::AllocationInfeasible { .. } => "loan_generator",
            SimError::NumericInstability { function, .. } => function,
            SimError::Cancelled { module } => module,
            SimError::Internal { module, .. } => module,
            SimError::Serialization(_) => "summary",
        }
    }
}

impl From<serde_json::Error> for SimError {
    fn from(e: serde_json::Error) -> Self {
        SimError::Serialization(e.to_string())
    }
}

/// Advisory guardrail descriptor. Violations accumulate on the simulation
/// context and are reported in the summary regardless of run status; only
/// config-level violations abort a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardrailViolation {
    /// Stable code, e.g. `non_psd_correlation`, `allocation_drift`.
    pub code: String,
    /// Module that observed the violation.
    pub module: String,
    pub message: String,
    /// Fatal violations abort the run; advisories do not.
    pub fatal: bool,
}

impl GuardrailViolation {
    pub fn advisory(code: &str, module: &str, message: impl Into<String>) -> Self {
        GuardrailViolation {
            code: code.to_string(),
            module: module.to_string(),
            message: message.into(),
            fatal: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind_strings() {
        let e = SimError::ConfigValidation {
            field: "max_ltv".into(),
            reason: "too high".into(),
        };
        assert_eq!(e.kind(), "config_validation");
        assert_eq!(e.module(), "config_validator");

        let e = SimError::AllocationInfeasible {
            zone: Zone::Red,
            budget: 50_000.0,
            min_loan_size: 100_000.0,
        };
        assert_eq!(e.kind(), "allocation_infeasible");
    }

    #[test]
    fn test_cancelled_carries_module() {
        let e = SimError::Cancelled {
            module: "price_path".into(),
        };
        assert_eq!(e.module(), "price_path");
        assert_eq!(e.kind(), "cancelled");
    }

    #[test]
    fn test_advisory_constructor() {
        let v = GuardrailViolation::advisory("wal_mismatch", "risk_metrics", "WAL exceeds term");
        assert!(!v.fatal);
        assert_eq!(v.code, "wal_mismatch");
    }
}
