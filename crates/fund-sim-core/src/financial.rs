//! Financial primitives shared by the cashflow, waterfall, and risk modules.
//!
//! All functions operate on f64 cashflow/return series. IRR-style solvers
//! report non-convergence as `NumericInstability`; callers substitute a
//! neutral value and record an advisory instead of failing the run.

use crate::error::SimError;
use crate::SimResult;

const CONVERGENCE_THRESHOLD: f64 = 1e-7;
const MAX_IRR_ITERATIONS: u32 = 100;

/// Net Present Value of a periodic cashflow series.
pub fn npv(rate: f64, cash_flows: &[f64]) -> SimResult<f64> {
    if rate <= -1.0 {
        return Err(SimError::NumericInstability {
            function: "npv".into(),
            detail: format!("discount rate {rate} must be greater than -100%"),
        });
    }
    let mut result = 0.0;
    let mut discount = 1.0;
    for (t, cf) in cash_flows.iter().enumerate() {
        if t > 0 {
            discount *= 1.0 + rate;
        }
        result += cf / discount;
    }
    Ok(result)
}

fn npv_unchecked(rate: f64, cash_flows: &[f64]) -> f64 {
    let mut result = 0.0;
    let mut discount = 1.0;
    for (t, cf) in cash_flows.iter().enumerate() {
        if t > 0 {
            discount *= 1.0 + rate;
        }
        result += cf / discount;
    }
    result
}

/// Internal Rate of Return per period, Newton-Raphson with a bisection
/// fallback over [-0.99, 10] when the derivative stalls or iterations
/// diverge.
pub fn irr(cash_flows: &[f64], guess: f64) -> SimResult<f64> {
    if cash_flows.len() < 2 {
        return Err(SimError::NumericInstability {
            function: "irr".into(),
            detail: "at least 2 cash flows required".into(),
        });
    }
    let has_negative = cash_flows.iter().any(|cf| *cf < 0.0);
    let has_positive = cash_flows.iter().any(|cf| *cf > 0.0);
    if !has_negative || !has_positive {
        return Err(SimError::NumericInstability {
            function: "irr".into(),
            detail: "cash flows never change sign".into(),
        });
    }

    let mut rate = guess;
    for _ in 0..MAX_IRR_ITERATIONS {
        let mut npv_val = 0.0;
        let mut dnpv = 0.0;
        for (t, cf) in cash_flows.iter().enumerate() {
            let tf = t as f64;
            let discount = (1.0 + rate).powf(tf);
            if !discount.is_finite() || discount == 0.0 {
                continue;
            }
            npv_val += cf / discount;
            if t > 0 {
                dnpv -= tf * cf / (1.0 + rate).powf(tf + 1.0);
            }
        }
        if npv_val.abs() < CONVERGENCE_THRESHOLD {
            return Ok(rate);
        }
        if dnpv == 0.0 || !dnpv.is_finite() {
            break;
        }
        rate -= npv_val / dnpv;
        rate = rate.clamp(-0.99, 100.0);
    }

    bisect_irr(cash_flows)
}

/// Bisection over a bracketing interval. Mirrors the brentq fallback the
/// Newton solver needs for steep or flat NPV curves.
fn bisect_irr(cash_flows: &[f64]) -> SimResult<f64> {
    let mut lo = -0.99;
    let mut hi = 10.0;
    let mut f_lo = npv_unchecked(lo, cash_flows);
    let f_hi = npv_unchecked(hi, cash_flows);
    if f_lo * f_hi > 0.0 {
        return Err(SimError::NumericInstability {
            function: "irr".into(),
            detail: "no sign change in [-0.99, 10.0]".into(),
        });
    }
    for _ in 0..200 {
        let mid = 0.5 * (lo + hi);
        let f_mid = npv_unchecked(mid, cash_flows);
        if f_mid.abs() < CONVERGENCE_THRESHOLD || (hi - lo) < 1e-12 {
            return Ok(mid);
        }
        if f_lo * f_mid < 0.0 {
            hi = mid;
        } else {
            lo = mid;
            f_lo = f_mid;
        }
    }
    Err(SimError::NumericInstability {
        function: "irr".into(),
        detail: "bisection exhausted iterations".into(),
    })
}

/// Extended IRR for cashflows at irregular times expressed in year
/// fractions from the first flow.
pub fn xirr(dated_flows: &[(f64, f64)], guess: f64) -> SimResult<f64> {
    if dated_flows.len() < 2 {
        return Err(SimError::NumericInstability {
            function: "xirr".into(),
            detail: "at least 2 cash flows required".into(),
        });
    }
    let base = dated_flows[0].0;
    let mut rate = guess;
    for _ in 0..MAX_IRR_ITERATIONS {
        let mut npv_val = 0.0;
        let mut dnpv = 0.0;
        for (time, amount) in dated_flows {
            let years = time - base;
            let one_plus_r: f64 = 1.0 + rate;
            if one_plus_r <= 0.0 {
                return Err(SimError::NumericInstability {
                    function: "xirr".into(),
                    detail: "rate drifted below -100%".into(),
                });
            }
            let discount = one_plus_r.powf(years);
            if !discount.is_finite() || discount == 0.0 {
                continue;
            }
            npv_val += amount / discount;
            dnpv -= years * amount / (one_plus_r * discount);
        }
        if npv_val.abs() < CONVERGENCE_THRESHOLD {
            return Ok(rate);
        }
        if dnpv == 0.0 || !dnpv.is_finite() {
            return Err(SimError::NumericInstability {
                function: "xirr".into(),
                detail: "derivative vanished".into(),
            });
        }
        rate -= npv_val / dnpv;
        rate = rate.clamp(-0.99, 100.0);
    }
    Err(SimError::NumericInstability {
        function: "xirr".into(),
        detail: format!("no convergence after {MAX_IRR_ITERATIONS} iterations"),
    })
}

/// Equity multiple: total positive flows over total invested.
pub fn equity_multiple(cash_flows: &[f64]) -> Option<f64> {
    let invested: f64 = cash_flows.iter().filter(|cf| **cf < 0.0).map(|cf| -cf).sum();
    if invested == 0.0 {
        return None;
    }
    let returned: f64 = cash_flows.iter().filter(|cf| **cf > 0.0).sum();
    Some(returned / invested)
}

/// Payback period in periods with linear interpolation inside the
/// recovering period. `None` when cumulative flow never reaches zero.
pub fn payback_period(cash_flows: &[f64]) -> Option<f64> {
    if cash_flows.is_empty() || cash_flows[0] >= 0.0 {
        return None;
    }
    let mut cumulative = cash_flows[0];
    for (i, cf) in cash_flows.iter().enumerate().skip(1) {
        let prev = cumulative;
        cumulative += cf;
        if cumulative >= 0.0 {
            if *cf > 0.0 && cumulative > 0.0 {
                return Some((i - 1) as f64 + (-prev) / cf);
            }
            return Some(i as f64);
        }
    }
    None
}

/// Percentile of a **sorted** slice with linear interpolation, p in [0, 100].
pub fn percentile_sorted(sorted: &[f64], p: f64) -> f64 {
    assert!(!sorted.is_empty());
    if sorted.len() == 1 {
        return sorted[0];
    }
    let rank = p / 100.0 * (sorted.len() - 1) as f64;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    if lower == upper {
        sorted[lower]
    } else {
        let frac = rank - lower as f64;
        sorted[lower] * (1.0 - frac) + sorted[upper] * frac
    }
}

/// Historical Value-at-Risk: the loss at the (1 - confidence) percentile,
/// reported positive.
pub fn value_at_risk(returns: &[f64], confidence: f64) -> f64 {
    if returns.is_empty() {
        return 0.0;
    }
    let mut sorted = returns.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    -percentile_sorted(&sorted, 100.0 * (1.0 - confidence))
}

/// Conditional VaR: mean loss beyond the VaR cutoff, reported positive.
pub fn conditional_value_at_risk(returns: &[f64], confidence: f64) -> f64 {
    if returns.is_empty() {
        return 0.0;
    }
    let cutoff = -value_at_risk(returns, confidence);
    let tail: Vec<f64> = returns.iter().copied().filter(|r| *r <= cutoff).collect();
    if tail.is_empty() {
        return value_at_risk(returns, confidence);
    }
    -(tail.iter().sum::<f64>() / tail.len() as f64)
}

pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Sample standard deviation (ddof = 1).
pub fn std_dev(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let m = mean(values);
    let var = values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / (values.len() - 1) as f64;
    var.sqrt()
}

pub fn sharpe_ratio(returns: &[f64], risk_free_rate: f64) -> Option<f64> {
    let sd = std_dev(returns);
    if sd == 0.0 {
        return None;
    }
    Some((mean(returns) - risk_free_rate) / sd)
}

/// Downside deviation relative to a target return.
pub fn downside_deviation(returns: &[f64], target: f64) -> f64 {
    if returns.is_empty() {
        return 0.0;
    }
    let sum_sq: f64 = returns
        .iter()
        .map(|r| (r - target).min(0.0).powi(2))
        .sum();
    (sum_sq / returns.len() as f64).sqrt()
}

pub fn sortino_ratio(returns: &[f64], target: f64) -> Option<f64> {
    let dd = downside_deviation(returns, target);
    if dd == 0.0 {
        return None;
    }
    Some((mean(returns) - target) / dd)
}

/// Maximum peak-to-trough drawdown of a value series, as a positive decimal.
pub fn max_drawdown(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let mut peak = values[0];
    let mut worst: f64 = 0.0;
    for &v in &values[1..] {
        if v > peak {
            peak = v;
        } else if peak > 0.0 {
            worst = worst.max((peak - v) / peak);
        }
    }
    worst
}

/// Herfindahl-Hirschman index of a set of exposure weights (decimals).
pub fn hhi(weights: &[f64]) -> f64 {
    weights.iter().map(|w| w * w).sum()
}

/// Covariance of two equal-length series (population).
pub fn covariance(xs: &[f64], ys: &[f64]) -> f64 {
    let n = xs.len().min(ys.len());
    if n < 2 {
        return 0.0;
    }
    let mx = mean(&xs[..n]);
    let my = mean(&ys[..n]);
    xs[..n]
        .iter()
        .zip(&ys[..n])
        .map(|(x, y)| (x - mx) * (y - my))
        .sum::<f64>()
        / n as f64
}

/// Pearson correlation of two equal-length series.
pub fn correlation(xs: &[f64], ys: &[f64]) -> f64 {
    let n = xs.len().min(ys.len());
    if n < 2 {
        return 0.0;
    }
    let cov = covariance(xs, ys);
    let vx = covariance(xs, xs);
    let vy = covariance(ys, ys);
    if vx <= 0.0 || vy <= 0.0 {
        return 0.0;
    }
    cov / (vx.sqrt() * vy.sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_npv_basic() {
        let cfs = [-1000.0, 300.0, 400.0, 500.0];
        let result = npv(0.10, &cfs).unwrap();
        // -1000 + 300/1.1 + 400/1.21 + 500/1.331 ≈ -21.04
        assert!((result + 21.04).abs() < 0.5, "npv={result}");
    }

    #[test]
    fn test_npv_zero_rate() {
        let cfs = [-100.0, 50.0, 50.0, 50.0];
        assert_eq!(npv(0.0, &cfs).unwrap(), 50.0);
    }

    #[test]
    fn test_irr_basic() {
        let cfs = [-1000.0, 400.0, 400.0, 400.0];
        let r = irr(&cfs, 0.10).unwrap();
        assert!((r - 0.0970).abs() < 0.001, "irr={r}");
    }

    #[test]
    fn test_irr_matches_npv_root() {
        let cfs = [-100.0, 30.0, 40.0, 50.0];
        let r = irr(&cfs, 0.10).unwrap();
        assert!(npv(r, &cfs).unwrap().abs() < 1e-5);
    }

    #[test]
    fn test_irr_all_negative_fails() {
        let cfs = [-100.0, -50.0, -10.0];
        assert!(irr(&cfs, 0.10).is_err());
    }

    #[test]
    fn test_irr_bisection_fallback() {
        // Very steep curve that makes Newton overshoot from a high guess.
        let cfs = [-1.0, 0.0, 0.0, 0.0, 1000.0];
        let r = irr(&cfs, 50.0).unwrap();
        assert!(npv(r, &cfs).unwrap().abs() < 1e-4);
    }

    #[test]
    fn test_xirr_irregular_spacing() {
        let flows = [(0.0, -100.0), (0.5, 30.0), (1.0, 40.0), (1.5, 50.0)];
        let r = xirr(&flows, 0.10).unwrap();
        // Same flows at twice the density double the annual rate vs irr.
        assert!((r - 0.2127).abs() < 0.01, "xirr={r}");
    }

    #[test]
    fn test_equity_multiple() {
        assert_eq!(equity_multiple(&[-100.0, 30.0, 40.0, 50.0]), Some(1.2));
        assert_eq!(equity_multiple(&[0.0, 10.0]), None);
    }

    #[test]
    fn test_payback_interpolates() {
        let p = payback_period(&[-100.0, 30.0, 40.0, 50.0]).unwrap();
        assert!((p - 2.6).abs() < 1e-9, "payback={p}");
    }

    #[test]
    fn test_payback_never_recovered() {
        assert_eq!(payback_period(&[-100.0, 10.0, 10.0]), None);
    }

    #[test]
    fn test_percentile_bounds() {
        let sorted = [1.0, 2.0, 3.0, 4.0, 5.0];
        assert_eq!(percentile_sorted(&sorted, 0.0), 1.0);
        assert_eq!(percentile_sorted(&sorted, 100.0), 5.0);
        assert_eq!(percentile_sorted(&sorted, 50.0), 3.0);
    }

    #[test]
    fn test_var_cvar_ordering() {
        let returns = [0.05, -0.02, 0.03, -0.08, 0.04, -0.01, 0.02, -0.05];
        let var = value_at_risk(&returns, 0.95);
        let cvar = conditional_value_at_risk(&returns, 0.95);
        assert!(var > 0.0);
        assert!(cvar >= var, "cvar={cvar} var={var}");
    }

    #[test]
    fn test_max_drawdown() {
        let values = [100.0, 110.0, 105.0, 95.0, 100.0, 90.0, 95.0];
        let dd = max_drawdown(&values);
        assert!((dd - 0.181818).abs() < 1e-5, "dd={dd}");
    }

    #[test]
    fn test_hhi_concentrated_vs_even() {
        assert!((hhi(&[1.0]) - 1.0).abs() < 1e-12);
        let even = hhi(&[0.25, 0.25, 0.25, 0.25]);
        assert!((even - 0.25).abs() < 1e-12);
    }

    #[test]
    fn test_correlation_perfect() {
        let xs = [1.0, 2.0, 3.0, 4.0];
        let ys = [2.0, 4.0, 6.0, 8.0];
        assert!((correlation(&xs, &ys) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_sortino_uses_downside_only() {
        let returns = [0.10, 0.12, 0.08, -0.02];
        let sortino = sortino_ratio(&returns, 0.0).unwrap();
        let sharpe = sharpe_ratio(&returns, 0.0).unwrap();
        assert!(sortino > sharpe);
    }
}
