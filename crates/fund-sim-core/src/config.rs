//! Simulation configuration: parsing, defaults, and guardrail validation.
//!
//! A `SimulationConfig` is immutable once validated. Unknown fields are
//! preserved in the `extra` map so configurations round-trip through newer
//! and older readers unchanged.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{GuardrailViolation, SimError};
use crate::types::{PerZone, Rate};
use crate::SimResult;

// ---------------------------------------------------------------------------
// Enumerations
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaterfallStructure {
    #[default]
    European,
    American,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ManagementFeeBasis {
    #[default]
    CommittedCapital,
    InvestedCapital,
    NetAssetValue,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeGranularity {
    #[default]
    Monthly,
    Quarterly,
    Yearly,
}

impl TimeGranularity {
    /// Number of months in one reporting period.
    pub fn months_per_period(self) -> u32 {
        match self {
            TimeGranularity::Monthly => 1,
            TimeGranularity::Quarterly => 3,
            TimeGranularity::Yearly => 12,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriceModel {
    #[default]
    Gbm,
    MeanReversion,
    RegimeSwitching,
    SydneyCycle,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeStep {
    #[default]
    Monthly,
    Yearly,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppreciationShareMethod {
    #[default]
    ProRataLtv,
    Tiered,
    Fixed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReinvestmentStrategy {
    /// Split each batch by the configured target zone weights.
    #[default]
    MaintainTargetAllocations,
    /// Overweight the zones currently furthest below target.
    RebalanceTowardTargets,
}

// ---------------------------------------------------------------------------
// Per-module sub-configurations
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MeanReversionParams {
    pub speed: f64,
    pub long_term_mean: Rate,
}

impl Default for MeanReversionParams {
    fn default() -> Self {
        MeanReversionParams {
            speed: 0.2,
            long_term_mean: 0.03,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegimeSwitchingParams {
    pub bull_market_rate: Rate,
    pub bear_market_rate: Rate,
    pub bull_to_bear_prob: f64,
    pub bear_to_bull_prob: f64,
    /// Volatility multiplier applied in the bear state.
    pub bear_vol_multiplier: f64,
}

impl Default for RegimeSwitchingParams {
    fn default() -> Self {
        RegimeSwitchingParams {
            bull_market_rate: 0.08,
            bear_market_rate: -0.03,
            bull_to_bear_prob: 0.1,
            bear_to_bull_prob: 0.3,
            bear_vol_multiplier: 1.5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PricePathConfig {
    pub model_type: PriceModel,
    /// Annualized log-price volatility per zone.
    pub volatility: PerZone<f64>,
    /// Zone-by-zone shock correlation, row/column order green, orange, red.
    pub correlation_matrix: [[f64; 3]; 3],
    pub time_step: TimeStep,
    /// Initial position in the property cycle, 0..1 (Sydney-cycle model).
    pub cycle_position: f64,
    /// Amplitude of the deterministic cycle drift component.
    pub cycle_amplitude: f64,
    pub cycle_period_years: f64,
    /// Log-normal dispersion of suburb paths around their zone path.
    pub suburb_variation: f64,
    /// Log-normal dispersion of property paths around their suburb path.
    pub property_variation: f64,
    pub mean_reversion_params: MeanReversionParams,
    pub regime_switching_params: RegimeSwitchingParams,
}

impl Default for PricePathConfig {
    fn default() -> Self {
        PricePathConfig {
            model_type: PriceModel::Gbm,
            volatility: PerZone::new(0.05, 0.07, 0.09),
            correlation_matrix: [[1.0, 0.7, 0.5], [0.7, 1.0, 0.6], [0.5, 0.6, 1.0]],
            time_step: TimeStep::Monthly,
            cycle_position: 0.5,
            cycle_amplitude: 0.05,
            cycle_period_years: 7.0,
            suburb_variation: 0.02,
            property_variation: 0.01,
            mean_reversion_params: MeanReversionParams::default(),
            regime_switching_params: RegimeSwitchingParams::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExitSimulatorConfig {
    /// Base annual exit probability.
    pub base_exit_rate: f64,
    /// Weight of the holding-period hazard component.
    pub time_factor: f64,
    /// Weight of the price-appreciation hazard component.
    pub price_factor: f64,
    /// Minimum holding period in years.
    pub min_hold_period: f64,
    /// Maximum holding period in years; reaching it forces term completion.
    pub max_hold_period: f64,
    pub sale_weight: f64,
    pub refinance_weight: f64,
    pub default_weight: f64,
    /// Appreciation above `sale_appreciation_threshold` scales the sale
    /// weight by this multiplier.
    pub appreciation_sale_multiplier: f64,
    pub sale_appreciation_threshold: f64,
    /// Price ratio inside [refinance_band_low, refinance_band_high) scales
    /// the refinance weight by this multiplier.
    pub interest_rate_refinance_multiplier: f64,
    pub refinance_band_low: f64,
    pub refinance_band_high: f64,
    /// Stress (price ratio below `stress_price_threshold`, or current LTV
    /// above `stress_ltv_threshold`) scales the default weight.
    pub economic_factor_default_multiplier: f64,
    pub stress_price_threshold: f64,
    pub stress_ltv_threshold: f64,
    pub appreciation_share_method: AppreciationShareMethod,
    /// Fund's fixed share of appreciation (the `fixed` method).
    pub appreciation_share: f64,
    pub min_appreciation_share: f64,
    pub max_appreciation_share: f64,
    pub tiered_appreciation_thresholds: Vec<f64>,
    pub tiered_appreciation_shares: Vec<f64>,
    /// Reference default rate against which zone default rates scale the
    /// default exit weight.
    pub base_default_rate: f64,
    /// Overrides the per-zone recovery rate when set.
    pub recovery_rate: Option<f64>,
    /// Foreclosure cost as a fraction of property value.
    pub foreclosure_cost: f64,
}

impl Default for ExitSimulatorConfig {
    fn default() -> Self {
        ExitSimulatorConfig {
            base_exit_rate: 0.1,
            time_factor: 0.4,
            price_factor: 0.6,
            min_hold_period: 1.0,
            max_hold_period: 10.0,
            sale_weight: 0.6,
            refinance_weight: 0.3,
            default_weight: 0.1,
            appreciation_sale_multiplier: 2.0,
            sale_appreciation_threshold: 0.2,
            interest_rate_refinance_multiplier: 3.0,
            refinance_band_low: 0.9,
            refinance_band_high: 1.0,
            economic_factor_default_multiplier: 2.0,
            stress_price_threshold: 0.9,
            stress_ltv_threshold: 0.95,
            appreciation_share_method: AppreciationShareMethod::ProRataLtv,
            appreciation_share: 0.2,
            min_appreciation_share: 0.1,
            max_appreciation_share: 0.5,
            tiered_appreciation_thresholds: vec![0.2, 0.5, 1.0],
            tiered_appreciation_shares: vec![0.1, 0.2, 0.3, 0.4],
            base_default_rate: 0.01,
            recovery_rate: None,
            foreclosure_cost: 0.1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScenarioSpec {
    pub name: String,
    pub appreciation_multiplier: f64,
    pub default_multiplier: f64,
    pub interest_multiplier: f64,
}

impl Default for ScenarioSpec {
    fn default() -> Self {
        ScenarioSpec {
            name: "base".into(),
            appreciation_multiplier: 1.0,
            default_multiplier: 1.0,
            interest_multiplier: 1.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CashflowConfig {
    pub time_granularity: TimeGranularity,
    /// Origination fee charged on each loan, revenue to the GP.
    pub origination_fee_rate: f64,
    /// Annual fund operating expenses as a fraction of fund size.
    pub fund_expense_rate: f64,
    pub enable_parallel_processing: bool,
    pub num_workers: usize,
    /// Fund/LP/GP return analytics (IRR, MOIC, TVPI, DPI, RVPI, ...).
    pub enable_analytics: bool,
    pub enable_sensitivity: bool,
    /// One-at-a-time sweep parameters for the sensitivity analysis.
    pub sensitivity_parameters: Vec<String>,
    /// Relative half-width of each sweep, e.g. 0.2 = ±20%.
    pub sensitivity_range: f64,
    pub sensitivity_steps: usize,
    pub enable_scenarios: bool,
    pub scenarios: Vec<ScenarioSpec>,
    pub enable_tax_impact: bool,
    pub tax_rate: f64,
    pub enable_liquidity_analysis: bool,
    /// Minimum cash reserve as a fraction of fund size.
    pub min_cash_reserve_pct: f64,
    pub enable_visualization: bool,
}

impl Default for CashflowConfig {
    fn default() -> Self {
        CashflowConfig {
            time_granularity: TimeGranularity::Monthly,
            origination_fee_rate: 0.03,
            fund_expense_rate: 0.001,
            enable_parallel_processing: false,
            num_workers: 4,
            enable_analytics: true,
            enable_sensitivity: false,
            sensitivity_parameters: vec![
                "appreciation_rates".into(),
                "default_rates".into(),
                "exit_proceeds".into(),
            ],
            sensitivity_range: 0.2,
            sensitivity_steps: 5,
            enable_scenarios: false,
            scenarios: Vec::new(),
            enable_tax_impact: false,
            tax_rate: 0.30,
            enable_liquidity_analysis: true,
            min_cash_reserve_pct: 0.02,
            enable_visualization: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WaterfallTierSpec {
    pub name: String,
    pub hurdle_rate: Rate,
    pub gp_share: Rate,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WaterfallEngineConfig {
    pub multi_tier_enabled: bool,
    /// Ordered tiers applied to the residual after the standard cascade.
    pub tiers: Vec<WaterfallTierSpec>,
    pub enable_clawback: bool,
    /// Excess carry at or below the threshold is not clawed back.
    pub clawback_threshold: f64,
}

impl Default for WaterfallEngineConfig {
    fn default() -> Self {
        WaterfallEngineConfig {
            multi_tier_enabled: false,
            tiers: Vec::new(),
            enable_clawback: true,
            clawback_threshold: 0.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StressScenarioSpec {
    pub name: String,
    pub property_value_shock: f64,
    pub interest_rate_shock: f64,
    pub default_rate_multiplier: f64,
    pub liquidity_shock: f64,
}

impl Default for StressScenarioSpec {
    fn default() -> Self {
        StressScenarioSpec {
            name: "base".into(),
            property_value_shock: 0.0,
            interest_rate_shock: 0.0,
            default_rate_multiplier: 1.0,
            liquidity_shock: 0.0,
        }
    }
}

fn default_stress_scenarios() -> Vec<StressScenarioSpec> {
    vec![
        StressScenarioSpec {
            name: "mild_recession".into(),
            property_value_shock: -0.10,
            interest_rate_shock: 0.01,
            default_rate_multiplier: 1.5,
            liquidity_shock: -0.2,
        },
        StressScenarioSpec {
            name: "severe_recession".into(),
            property_value_shock: -0.30,
            interest_rate_shock: 0.02,
            default_rate_multiplier: 3.0,
            liquidity_shock: -0.5,
        },
        StressScenarioSpec {
            name: "rate_shock".into(),
            property_value_shock: -0.05,
            interest_rate_shock: 0.03,
            default_rate_multiplier: 1.2,
            liquidity_shock: -0.1,
        },
        StressScenarioSpec {
            name: "liquidity_crunch".into(),
            property_value_shock: -0.15,
            interest_rate_shock: 0.01,
            default_rate_multiplier: 2.0,
            liquidity_shock: -0.6,
        },
    ]
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskMetricsConfig {
    pub risk_free_rate: Rate,
    /// Price shock applied for the stress-LTV metric.
    pub stress_price_shock: f64,
    /// Realized zone exposure above this soft cap raises an advisory.
    pub zone_exposure_soft_cap: f64,
    /// Stress LTV above this threshold raises an advisory.
    pub stress_ltv_threshold: f64,
    pub top_n_suburbs: usize,
    /// Gamma shape for the expected-exit-lag model (months).
    pub exit_lag_alpha: f64,
    /// Gamma scale for the expected-exit-lag model (months).
    pub exit_lag_beta: f64,
    pub stress_scenarios: Vec<StressScenarioSpec>,
    pub sensitivity_parameters: Vec<String>,
    pub sensitivity_range: f64,
    pub sensitivity_steps: usize,
}

impl Default for RiskMetricsConfig {
    fn default() -> Self {
        RiskMetricsConfig {
            risk_free_rate: 0.02,
            stress_price_shock: -0.20,
            zone_exposure_soft_cap: 0.65,
            stress_ltv_threshold: 0.90,
            top_n_suburbs: 5,
            exit_lag_alpha: 2.0,
            exit_lag_beta: 3.0,
            stress_scenarios: default_stress_scenarios(),
            sensitivity_parameters: vec![
                "property_value".into(),
                "default_rate".into(),
                "interest_rate".into(),
            ],
            sensitivity_range: 0.2,
            sensitivity_steps: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReinvestmentEngineConfig {
    /// Accumulated exit capital required to trigger a batch. Defaults to
    /// the configured minimum loan size when unset.
    pub reinvestment_threshold: Option<f64>,
    pub zone_preference_multipliers: PerZone<f64>,
    pub strategy: ReinvestmentStrategy,
}

impl Default for ReinvestmentEngineConfig {
    fn default() -> Self {
        ReinvestmentEngineConfig {
            reinvestment_threshold: None,
            zone_preference_multipliers: PerZone::splat(1.0),
            strategy: ReinvestmentStrategy::MaintainTargetAllocations,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonteCarloConfig {
    pub enabled: bool,
    pub num_simulations: u32,
    /// Worker-pool width; defaults to the rayon global pool when unset.
    pub num_workers: Option<usize>,
}

impl Default for MonteCarloConfig {
    fn default() -> Self {
        MonteCarloConfig {
            enabled: false,
            num_simulations: 1000,
            num_workers: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Top-level configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    // Fund shape
    pub fund_size: f64,
    pub fund_term: u32,
    pub vintage_year: i32,
    pub gp_commitment_percentage: Rate,
    pub reinvestment_period: u32,

    // Economics
    pub hurdle_rate: Rate,
    pub carried_interest_rate: Rate,
    pub catch_up_rate: Rate,
    pub management_fee_rate: Rate,
    pub management_fee_basis: ManagementFeeBasis,
    pub waterfall_structure: WaterfallStructure,

    // Loan shape
    pub avg_loan_size: f64,
    pub loan_size_std_dev: f64,
    pub min_loan_size: f64,
    pub max_loan_size: f64,
    pub avg_loan_term: f64,
    /// Zero keeps the term fixed at `avg_loan_term`.
    pub loan_term_std_dev: f64,
    pub avg_loan_interest_rate: Rate,
    /// Zero keeps the rate fixed at `avg_loan_interest_rate`.
    pub interest_rate_std_dev: f64,
    pub avg_loan_ltv: Rate,
    pub ltv_std_dev: f64,
    pub min_ltv: Rate,
    pub max_ltv: Rate,

    // Zone policy
    pub zone_allocations: PerZone<f64>,
    pub appreciation_rates: PerZone<Rate>,
    pub default_rates: PerZone<Rate>,
    pub recovery_rates: PerZone<Rate>,

    // Randomness
    pub seed: u64,

    // Per-module configuration
    pub monte_carlo: MonteCarloConfig,
    pub price_path: PricePathConfig,
    pub exit_simulator: ExitSimulatorConfig,
    pub cashflow_aggregator: CashflowConfig,
    pub waterfall_engine: WaterfallEngineConfig,
    pub risk_metrics: RiskMetricsConfig,
    pub reinvestment_engine: ReinvestmentEngineConfig,

    /// Unknown keys, preserved untyped for forward compatibility (this is
    /// where e.g. a `tranche_manager` block rides along).
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        SimulationConfig {
            fund_size: 100_000_000.0,
            fund_term: 10,
            vintage_year: 2023,
            gp_commitment_percentage: 0.0,
            reinvestment_period: 5,
            hurdle_rate: 0.08,
            carried_interest_rate: 0.20,
            catch_up_rate: 0.0,
            management_fee_rate: 0.02,
            management_fee_basis: ManagementFeeBasis::CommittedCapital,
            waterfall_structure: WaterfallStructure::European,
            avg_loan_size: 250_000.0,
            loan_size_std_dev: 50_000.0,
            min_loan_size: 100_000.0,
            max_loan_size: 500_000.0,
            avg_loan_term: 5.0,
            loan_term_std_dev: 0.0,
            avg_loan_interest_rate: 0.05,
            interest_rate_std_dev: 0.0,
            avg_loan_ltv: 0.75,
            ltv_std_dev: 0.05,
            min_ltv: 0.5,
            max_ltv: 0.85,
            zone_allocations: PerZone::new(0.6, 0.3, 0.1),
            appreciation_rates: PerZone::new(0.05, 0.03, 0.01),
            default_rates: PerZone::new(0.01, 0.03, 0.05),
            recovery_rates: PerZone::new(0.9, 0.8, 0.7),
            seed: 42,
            monte_carlo: MonteCarloConfig::default(),
            price_path: PricePathConfig::default(),
            exit_simulator: ExitSimulatorConfig::default(),
            cashflow_aggregator: CashflowConfig::default(),
            waterfall_engine: WaterfallEngineConfig::default(),
            risk_metrics: RiskMetricsConfig::default(),
            reinvestment_engine: ReinvestmentEngineConfig::default(),
            extra: BTreeMap::new(),
        }
    }
}

fn invalid(field: &str, reason: impl Into<String>) -> SimError {
    SimError::ConfigValidation {
        field: field.to_string(),
        reason: reason.into(),
    }
}

fn check_rate(field: &str, value: f64) -> SimResult<()> {
    if !(0.0..=1.0).contains(&value) {
        return Err(invalid(field, format!("must be between 0 and 1, got {value}")));
    }
    Ok(())
}

impl SimulationConfig {
    /// Parse and validate an untyped options bundle.
    pub fn from_value(value: serde_json::Value) -> SimResult<Self> {
        let config: SimulationConfig = serde_json::from_value(value)
            .map_err(|e| invalid("config", e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate every range and policy guardrail. Returns the advisory
    /// descriptors (soft warnings) collected along the way; any hard
    /// violation fails with `ConfigValidation`.
    pub fn validate(&self) -> SimResult<Vec<GuardrailViolation>> {
        let mut advisories = Vec::new();

        if self.fund_size < 1_000_000.0 {
            return Err(invalid("fund_size", "must be at least 1,000,000"));
        }
        if !(1..=30).contains(&self.fund_term) {
            return Err(invalid("fund_term", "must be between 1 and 30 years"));
        }
        if !(1900..=2100).contains(&self.vintage_year) {
            return Err(invalid("vintage_year", "must be between 1900 and 2100"));
        }
        check_rate("gp_commitment_percentage", self.gp_commitment_percentage)?;
        check_rate("hurdle_rate", self.hurdle_rate)?;
        check_rate("carried_interest_rate", self.carried_interest_rate)?;
        check_rate("catch_up_rate", self.catch_up_rate)?;
        if !(0.0..=0.05).contains(&self.management_fee_rate) {
            return Err(invalid(
                "management_fee_rate",
                format!("must be between 0 and 0.05, got {}", self.management_fee_rate),
            ));
        }
        if self.reinvestment_period > 30 {
            return Err(invalid("reinvestment_period", "must be at most 30 years"));
        }

        // Loan shape
        if self.min_loan_size < 1_000.0 {
            return Err(invalid("min_loan_size", "must be at least 1,000"));
        }
        if self.avg_loan_size < 10_000.0 {
            return Err(invalid("avg_loan_size", "must be at least 10,000"));
        }
        if self.loan_size_std_dev < 0.0 {
            return Err(invalid("loan_size_std_dev", "must be non-negative"));
        }
        if self.max_loan_size < self.min_loan_size {
            return Err(invalid(
                "max_loan_size",
                format!(
                    "maximum loan size ({}) cannot be less than minimum loan size ({})",
                    self.max_loan_size, self.min_loan_size
                ),
            ));
        }
        if self.avg_loan_term < 0.1 {
            return Err(invalid("avg_loan_term", "must be at least 0.1 years"));
        }
        check_rate("avg_loan_interest_rate", self.avg_loan_interest_rate)?;
        check_rate("avg_loan_ltv", self.avg_loan_ltv)?;
        if !(0.0..=0.5).contains(&self.ltv_std_dev) {
            return Err(invalid("ltv_std_dev", "must be between 0 and 0.5"));
        }
        check_rate("min_ltv", self.min_ltv)?;
        check_rate("max_ltv", self.max_ltv)?;
        if self.max_ltv < self.min_ltv {
            return Err(invalid(
                "max_ltv",
                format!(
                    "maximum LTV ({}) cannot be less than minimum LTV ({})",
                    self.max_ltv, self.min_ltv
                ),
            ));
        }

        // Policy guardrails
        if self.max_ltv > 0.85 {
            return Err(invalid(
                "max_ltv",
                format!("maximum LTV cannot exceed 0.85, got {}", self.max_ltv),
            ));
        }
        for (zone, weight) in self.zone_allocations.iter() {
            if !(0.0..=1.0).contains(weight) {
                return Err(invalid(
                    "zone_allocations",
                    format!("{zone} allocation must be between 0 and 1, got {weight}"),
                ));
            }
            if *weight > 0.6 {
                return Err(invalid(
                    "zone_allocations",
                    format!("allocation to {zone} zone cannot exceed 0.6, got {weight}"),
                ));
            }
        }
        let total = self.zone_allocations.sum();
        if (total - 1.0).abs() > 1e-6 {
            return Err(invalid(
                "zone_allocations",
                format!("allocations must sum to 1, got {total}"),
            ));
        }
        for (zone, rate) in self.appreciation_rates.iter() {
            if !(-1.0..=1.0).contains(rate) {
                return Err(invalid(
                    "appreciation_rates",
                    format!("{zone} rate must be between -1 and 1, got {rate}"),
                ));
            }
        }
        for (zone, rate) in self.default_rates.iter() {
            check_rate(&format!("default_rates.{zone}"), *rate)?;
        }
        for (zone, rate) in self.recovery_rates.iter() {
            check_rate(&format!("recovery_rates.{zone}"), *rate)?;
        }

        // Monte Carlo
        if !(1..=10_000).contains(&self.monte_carlo.num_simulations) {
            return Err(invalid(
                "monte_carlo.num_simulations",
                "must be between 1 and 10000",
            ));
        }

        // Exit simulator coherence
        let exits = &self.exit_simulator;
        if exits.min_hold_period > exits.max_hold_period {
            return Err(invalid(
                "exit_simulator.min_hold_period",
                "cannot exceed max_hold_period",
            ));
        }
        if exits.tiered_appreciation_shares.len()
            != exits.tiered_appreciation_thresholds.len() + 1
        {
            return Err(invalid(
                "exit_simulator.tiered_appreciation_shares",
                "must have exactly one more entry than the thresholds",
            ));
        }

        // WAL proxy warning: long loans in a short fund.
        if self.avg_loan_term > 8.0 && self.fund_term <= 6 {
            advisories.push(GuardrailViolation::advisory(
                "wal_proxy",
                "config_validator",
                format!(
                    "average loan term {} years exceeds 8 while fund term is {} years",
                    self.avg_loan_term, self.fund_term
                ),
            ));
        }

        Ok(advisories)
    }

    /// LP share of committed capital.
    pub fn lp_commitment(&self) -> f64 {
        self.fund_size * (1.0 - self.gp_commitment_percentage)
    }

    /// Total number of monthly steps in the fund's life (plus the anchor).
    pub fn total_months(&self) -> u32 {
        self.fund_term * 12
    }

    /// End of the reinvestment window in months since inception.
    pub fn reinvestment_window_months(&self) -> u32 {
        (self.reinvestment_period * 12).min(self.total_months())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_defaults_are_valid() {
        let config = SimulationConfig::default();
        let advisories = config.validate().unwrap();
        assert!(advisories.is_empty());
    }

    #[test]
    fn test_minimal_bundle_fills_defaults() {
        let config = SimulationConfig::from_value(json!({
            "fund_size": 50_000_000.0,
            "fund_term": 8,
            "vintage_year": 2024,
        }))
        .unwrap();
        assert_eq!(config.fund_size, 50_000_000.0);
        assert_eq!(config.hurdle_rate, 0.08);
        assert_eq!(config.appreciation_rates.green, 0.05);
        assert_eq!(config.recovery_rates.red, 0.7);
    }

    #[test]
    fn test_unknown_fields_preserved() {
        let config = SimulationConfig::from_value(json!({
            "tranche_manager": {"enabled": true, "tranches": []},
            "future_flag": 7,
        }))
        .unwrap();
        assert!(config.extra.contains_key("tranche_manager"));
        assert_eq!(config.extra["future_flag"], json!(7));

        // Round-trip keeps the unknown keys.
        let value = serde_json::to_value(&config).unwrap();
        let again = SimulationConfig::from_value(value).unwrap();
        assert!(again.extra.contains_key("tranche_manager"));
    }

    #[test]
    fn test_config_roundtrip_canonical() {
        let config = SimulationConfig::from_value(json!({
            "fund_size": 100_000_000.0,
            "zone_allocations": {"green": 0.5, "orange": 0.3, "red": 0.2},
            "max_ltv": 0.8,
        }))
        .unwrap();
        let serialized = serde_json::to_value(&config).unwrap();
        let reparsed = SimulationConfig::from_value(serialized.clone()).unwrap();
        assert_eq!(serialized, serde_json::to_value(&reparsed).unwrap());
    }

    #[test]
    fn test_fund_size_floor() {
        let mut config = SimulationConfig::default();
        config.fund_size = 500_000.0;
        assert!(matches!(
            config.validate(),
            Err(SimError::ConfigValidation { field, .. }) if field == "fund_size"
        ));
    }

    #[test]
    fn test_max_ltv_guardrail() {
        let mut config = SimulationConfig::default();
        config.max_ltv = 0.90;
        assert!(matches!(
            config.validate(),
            Err(SimError::ConfigValidation { field, .. }) if field == "max_ltv"
        ));
    }

    #[test]
    fn test_zone_cap_guardrail() {
        let mut config = SimulationConfig::default();
        config.zone_allocations = PerZone::new(0.7, 0.2, 0.1);
        assert!(matches!(
            config.validate(),
            Err(SimError::ConfigValidation { field, .. }) if field == "zone_allocations"
        ));
    }

    #[test]
    fn test_zone_sum_guardrail() {
        let mut config = SimulationConfig::default();
        config.zone_allocations = PerZone::new(0.5, 0.3, 0.1);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_loan_size_ordering() {
        let mut config = SimulationConfig::default();
        config.min_loan_size = 600_000.0;
        config.max_loan_size = 500_000.0;
        assert!(matches!(
            config.validate(),
            Err(SimError::ConfigValidation { field, .. }) if field == "max_loan_size"
        ));
    }

    #[test]
    fn test_ltv_ordering() {
        let mut config = SimulationConfig::default();
        config.min_ltv = 0.8;
        config.max_ltv = 0.6;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_management_fee_cap() {
        let mut config = SimulationConfig::default();
        config.management_fee_rate = 0.06;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_num_simulations_bounds() {
        let mut config = SimulationConfig::default();
        config.monte_carlo.num_simulations = 20_000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_wal_proxy_advisory() {
        let mut config = SimulationConfig::default();
        config.avg_loan_term = 9.0;
        config.fund_term = 6;
        let advisories = config.validate().unwrap();
        assert_eq!(advisories.len(), 1);
        assert_eq!(advisories[0].code, "wal_proxy");
        assert!(!advisories[0].fatal);
    }

    #[test]
    fn test_tiered_share_arity() {
        let mut config = SimulationConfig::default();
        config.exit_simulator.tiered_appreciation_shares = vec![0.1, 0.2];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_helpers() {
        let mut config = SimulationConfig::default();
        config.gp_commitment_percentage = 0.02;
        assert_eq!(config.lp_commitment(), 98_000_000.0);
        assert_eq!(config.total_months(), 120);
        config.reinvestment_period = 20;
        assert_eq!(config.reinvestment_window_months(), 120);
    }
}
