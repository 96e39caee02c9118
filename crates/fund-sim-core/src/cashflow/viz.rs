//! Visualization payloads for the cashflow series: chart-ready rows the API
//! layer serves verbatim.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::config::SimulationConfig;

use super::FundPeriodCashflow;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WaterfallChartRow {
    pub category: String,
    pub amount: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct YearChartRow {
    pub year: u32,
    pub inflows: f64,
    pub outflows: f64,
    pub net: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CumulativePoint {
    pub period: usize,
    pub year: f64,
    pub cumulative: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeatmapCell {
    pub year: u32,
    pub component: String,
    pub amount: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SankeyLink {
    pub source: String,
    pub target: String,
    pub amount: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CashflowVisualization {
    pub waterfall_chart: Vec<WaterfallChartRow>,
    pub by_year_chart: Vec<YearChartRow>,
    pub cumulative_chart: Vec<CumulativePoint>,
    pub heatmap: Vec<HeatmapCell>,
    pub sankey: Vec<SankeyLink>,
}

pub fn build(
    config: &SimulationConfig,
    fund_level: &[FundPeriodCashflow],
    total_reinvested: f64,
) -> CashflowVisualization {
    let sum = |f: fn(&FundPeriodCashflow) -> f64| -> f64 { fund_level.iter().map(f).sum() };

    let investments = sum(|r| -r.loan_investments);
    let origination_fees = sum(|r| r.origination_fees);
    let principal = sum(|r| r.principal_repayments);
    let interest = sum(|r| r.interest_income);
    let appreciation = sum(|r| r.appreciation_share);
    let management_fees = sum(|r| -r.management_fees);
    let expenses = sum(|r| -r.fund_expenses);
    let distributions = sum(|r| -r.distributions);

    let waterfall_chart = vec![
        WaterfallChartRow {
            category: "Capital Calls".into(),
            amount: config.fund_size,
        },
        WaterfallChartRow {
            category: "Loan Investments".into(),
            amount: -investments,
        },
        WaterfallChartRow {
            category: "Principal Repayments".into(),
            amount: principal,
        },
        WaterfallChartRow {
            category: "Interest Income".into(),
            amount: interest,
        },
        WaterfallChartRow {
            category: "Appreciation Share".into(),
            amount: appreciation,
        },
        WaterfallChartRow {
            category: "Origination Fees".into(),
            amount: origination_fees,
        },
        WaterfallChartRow {
            category: "Management Fees".into(),
            amount: -management_fees,
        },
        WaterfallChartRow {
            category: "Fund Expenses".into(),
            amount: -expenses,
        },
        WaterfallChartRow {
            category: "Distributions".into(),
            amount: -distributions,
        },
    ];

    let mut by_year: BTreeMap<u32, (f64, f64)> = BTreeMap::new();
    let mut heat: BTreeMap<(u32, &'static str), f64> = BTreeMap::new();
    for row in fund_level {
        let year = row.year.floor() as u32;
        let inflow = row.principal_repayments
            + row.interest_income
            + row.appreciation_share
            + row.origination_fees;
        let outflow =
            -row.loan_investments - row.management_fees - row.fund_expenses - row.distributions;
        let slot = by_year.entry(year).or_default();
        slot.0 += inflow;
        slot.1 += outflow;

        *heat.entry((year, "principal")).or_default() += row.principal_repayments;
        *heat.entry((year, "interest")).or_default() += row.interest_income;
        *heat.entry((year, "appreciation")).or_default() += row.appreciation_share;
        *heat.entry((year, "management_fees")).or_default() += -row.management_fees;
        *heat.entry((year, "distributions")).or_default() += -row.distributions;
    }

    let by_year_chart = by_year
        .iter()
        .map(|(year, (inflows, outflows))| YearChartRow {
            year: *year,
            inflows: *inflows,
            outflows: *outflows,
            net: inflows - outflows,
        })
        .collect();

    let cumulative_chart = fund_level
        .iter()
        .map(|row| CumulativePoint {
            period: row.period,
            year: row.year,
            cumulative: row.cumulative_cashflow,
        })
        .collect();

    let heatmap = heat
        .iter()
        .map(|((year, component), amount)| HeatmapCell {
            year: *year,
            component: (*component).to_string(),
            amount: *amount,
        })
        .collect();

    let sankey = vec![
        SankeyLink {
            source: "Committed Capital".into(),
            target: "Loan Portfolio".into(),
            amount: config.fund_size,
        },
        SankeyLink {
            source: "Exit Proceeds".into(),
            target: "Reinvested".into(),
            amount: total_reinvested,
        },
        SankeyLink {
            source: "Loan Portfolio".into(),
            target: "Principal".into(),
            amount: principal,
        },
        SankeyLink {
            source: "Loan Portfolio".into(),
            target: "Interest".into(),
            amount: interest,
        },
        SankeyLink {
            source: "Loan Portfolio".into(),
            target: "Appreciation Share".into(),
            amount: appreciation,
        },
        SankeyLink {
            source: "Exit Proceeds".into(),
            target: "Distributions".into(),
            amount: distributions,
        },
    ];

    CashflowVisualization {
        waterfall_chart,
        by_year_chart,
        cumulative_chart,
        heatmap,
        sankey,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_periods() -> Vec<FundPeriodCashflow> {
        vec![
            FundPeriodCashflow {
                period: 0,
                year: 0.0,
                capital_calls: -100.0,
                loan_investments: -90.0,
                origination_fees: 2.7,
                management_fees: -2.0,
                net_cashflow: -189.3,
                cumulative_cashflow: -189.3,
                ..Default::default()
            },
            FundPeriodCashflow {
                period: 1,
                year: 1.0,
                principal_repayments: 90.0,
                interest_income: 10.0,
                appreciation_share: 5.0,
                distributions: -103.0,
                net_cashflow: 2.0,
                cumulative_cashflow: -187.3,
                ..Default::default()
            },
        ]
    }

    #[test]
    fn test_chart_shapes() {
        let config = SimulationConfig::default();
        let viz = build(&config, &sample_periods(), 0.0);
        assert_eq!(viz.waterfall_chart.len(), 9);
        assert_eq!(viz.cumulative_chart.len(), 2);
        assert!(!viz.heatmap.is_empty());
        assert_eq!(viz.by_year_chart.len(), 2);
    }

    #[test]
    fn test_waterfall_totals_match_components() {
        let config = SimulationConfig::default();
        let viz = build(&config, &sample_periods(), 0.0);
        let principal = viz
            .waterfall_chart
            .iter()
            .find(|r| r.category == "Principal Repayments")
            .unwrap();
        assert_eq!(principal.amount, 90.0);
        let distributions = viz
            .waterfall_chart
            .iter()
            .find(|r| r.category == "Distributions")
            .unwrap();
        assert_eq!(distributions.amount, -103.0);
    }

    #[test]
    fn test_sankey_carries_reinvestment() {
        let config = SimulationConfig::default();
        let viz = build(&config, &sample_periods(), 42.0);
        let reinvested = viz
            .sankey
            .iter()
            .find(|l| l.target == "Reinvested")
            .unwrap();
        assert_eq!(reinvested.amount, 42.0);
    }
}
