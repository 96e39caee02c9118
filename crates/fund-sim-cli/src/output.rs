use colored::Colorize;
use serde_json::Value;
use std::collections::BTreeMap;
use tabled::{Table, Tabled};

#[derive(Tabled)]
struct MetricRow {
    #[tabled(rename = "Metric")]
    metric: String,
    #[tabled(rename = "Value")]
    value: String,
}

#[derive(Tabled)]
struct CashflowRow {
    #[tabled(rename = "Year")]
    year: String,
    #[tabled(rename = "Net")]
    net: String,
    #[tabled(rename = "Distributions")]
    distributions: String,
    #[tabled(rename = "Cumulative")]
    cumulative: String,
}

fn fmt_money(v: f64) -> String {
    if v.abs() >= 1e6 {
        format!("${:.2}M", v / 1e6)
    } else {
        format!("${v:.0}")
    }
}

fn fmt_pct(v: f64) -> String {
    format!("{:.2}%", v * 100.0)
}

fn get_f64(value: &Value, path: &[&str]) -> Option<f64> {
    let mut current = value;
    for key in path {
        current = current.get(key)?;
    }
    current.as_f64()
}

fn metric_rows(value: &Value) -> Vec<MetricRow> {
    let mut rows = Vec::new();
    let mut push = |metric: &str, text: Option<String>| {
        if let Some(text) = text {
            rows.push(MetricRow {
                metric: metric.to_string(),
                value: text,
            });
        }
    };

    push(
        "Net IRR",
        get_f64(value, &["metrics", "performance_metrics", "net_irr", "value"]).map(fmt_pct),
    );
    push(
        "Sharpe Ratio",
        get_f64(value, &["metrics", "performance_metrics", "sharpe_ratio"])
            .map(|v| format!("{v:.2}")),
    );
    push(
        "Sortino Ratio",
        get_f64(value, &["metrics", "performance_metrics", "sortino_ratio"])
            .map(|v| format!("{v:.2}")),
    );
    push(
        "Portfolio Volatility",
        get_f64(value, &["metrics", "market_price_metrics", "portfolio_volatility"])
            .map(fmt_pct),
    );
    push(
        "VaR 95",
        get_f64(value, &["metrics", "market_price_metrics", "var_95", "value"]).map(fmt_pct),
    );
    push(
        "Portfolio LTV",
        get_f64(value, &["metrics", "credit_metrics", "portfolio_ltv"]).map(fmt_pct),
    );
    push(
        "WAL",
        get_f64(value, &["metrics", "liquidity_metrics", "wal_years"])
            .map(|v| format!("{v:.1}y")),
    );
    push(
        "Total to LP",
        get_f64(value, &["waterfall", "distributions", "total_to_lp"]).map(fmt_money),
    );
    push(
        "Total to GP",
        get_f64(value, &["waterfall", "distributions", "total_to_gp"]).map(fmt_money),
    );
    push(
        "Carried Interest",
        get_f64(value, &["waterfall", "distributions", "carried_interest"]).map(fmt_money),
    );
    rows
}

fn cashflow_rows(value: &Value) -> Vec<CashflowRow> {
    let Some(periods) = value.get("cashflows").and_then(|c| c.as_array()) else {
        return Vec::new();
    };

    // Aggregate to yearly rows for display regardless of granularity.
    let mut by_year: BTreeMap<i64, (f64, f64, f64)> = BTreeMap::new();
    for period in periods {
        let year = period.get("year").and_then(|y| y.as_f64()).unwrap_or(0.0).floor() as i64;
        let net = period.get("net_cashflow").and_then(|v| v.as_f64()).unwrap_or(0.0);
        let dist = -period.get("distributions").and_then(|v| v.as_f64()).unwrap_or(0.0);
        let cumulative = period
            .get("cumulative_cashflow")
            .and_then(|v| v.as_f64())
            .unwrap_or(0.0);
        let slot = by_year.entry(year).or_default();
        slot.0 += net;
        slot.1 += dist;
        slot.2 = cumulative;
    }

    by_year
        .iter()
        .map(|(year, (net, dist, cumulative))| CashflowRow {
            year: year.to_string(),
            net: fmt_money(*net),
            distributions: fmt_money(*dist),
            cumulative: fmt_money(*cumulative),
        })
        .collect()
}

pub fn display_summary(value: &Value) {
    let run_id = value.get("run_id").and_then(|v| v.as_str()).unwrap_or("?");
    let status = value.get("status").and_then(|v| v.as_str()).unwrap_or("?");
    let status_colored = match status {
        "completed" => status.green().bold(),
        "cancelled" => status.yellow().bold(),
        _ => status.red().bold(),
    };

    println!("\n{}", "Simulation Summary".bold());
    println!("Run ID: {run_id}");
    println!("Status: {status_colored}");
    if let Some(seconds) = value.get("execution_time").and_then(|v| v.as_f64()) {
        println!("Execution Time: {seconds:.3}s");
    }
    if let Some(loans) = value.get("num_loans").and_then(|v| v.as_u64()) {
        println!("Loans: {loans}");
    }

    if let Some(error) = value.get("error") {
        let kind = error.get("kind").and_then(|v| v.as_str()).unwrap_or("internal");
        let module = error.get("module").and_then(|v| v.as_str()).unwrap_or("?");
        let message = error.get("message").and_then(|v| v.as_str()).unwrap_or("");
        println!("{} [{kind}/{module}] {message}", "Failure:".red().bold());
    }

    let metrics = metric_rows(value);
    if !metrics.is_empty() {
        println!("\n{}", "Key Metrics".bold());
        println!("{}", Table::new(metrics));
    }

    let cashflows = cashflow_rows(value);
    if !cashflows.is_empty() {
        println!("\n{}", "Cash Flows".bold());
        println!("{}", Table::new(cashflows));
    }

    if let Some(violations) = value.get("guardrail_violations").and_then(|v| v.as_array()) {
        if !violations.is_empty() {
            println!("\n{}", "Guardrail Advisories".yellow().bold());
            for violation in violations {
                let code = violation.get("code").and_then(|v| v.as_str()).unwrap_or("?");
                let message = violation
                    .get("message")
                    .and_then(|v| v.as_str())
                    .unwrap_or("");
                println!("  - [{code}] {message}");
            }
        }
    }
    println!();
}
