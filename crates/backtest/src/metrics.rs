use qbt_core::bar::Frequency;
use qbt_core::stats::{finite_or, mean, sample_std};
use serde::{Deserialize, Serialize};

use crate::simulator::TradeRecord;

/// Bars-per-year used to annualize per-bar statistics. Approximate for
/// intraday frequencies; `Custom` falls back to a 252-session year.
pub fn periods_per_year(freq: Frequency) -> f64 {
    match freq {
        Frequency::Minute => 252.0 * 390.0,
        Frequency::Minute15 => 252.0 * 26.0,
        Frequency::Hour => 252.0 * 6.5,
        Frequency::Hour4 => 252.0 * 2.0,
        Frequency::Day => 252.0,
        Frequency::Week => 52.0,
        Frequency::Month => 12.0,
        Frequency::Custom => 252.0,
    }
}

/// Performance report for one backtest run. Every ratio falls back to NaN on
/// a degenerate denominator (zero variance, zero bars) rather than erroring
/// or clamping to zero (spec.md §5).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    pub total_return: f64,
    pub cagr: f64,
    pub annual_volatility: f64,
    pub downside_risk: f64,
    pub max_drawdown: f64,
    pub sharpe: f64,
    pub sortino: f64,
    pub calmar: f64,
    pub bah_total_return: f64,
    pub bah_max_drawdown: f64,
    pub win_rate: f64,
    pub profit_factor: f64,
    pub max_consecutive_losses: u32,
    pub exposure_time: f64,
    pub num_trades: u32,
}

impl PerformanceMetrics {
    /// Placeholder report for a task that never reached simulation (a failed
    /// `BacktestResult`): every ratio is NaN, every count is zero.
    pub fn nan() -> Self {
        PerformanceMetrics {
            total_return: f64::NAN,
            cagr: f64::NAN,
            annual_volatility: f64::NAN,
            downside_risk: f64::NAN,
            max_drawdown: f64::NAN,
            sharpe: f64::NAN,
            sortino: f64::NAN,
            calmar: f64::NAN,
            bah_total_return: f64::NAN,
            bah_max_drawdown: f64::NAN,
            win_rate: f64::NAN,
            profit_factor: f64::NAN,
            max_consecutive_losses: 0,
            exposure_time: f64::NAN,
            num_trades: 0,
        }
    }
}

fn bar_returns(series: &[f64]) -> Vec<f64> {
    series
        .windows(2)
        .map(|w| if w[0] != 0.0 { w[1] / w[0] - 1.0 } else { 0.0 })
        .collect()
}

/// Maximum peak-to-trough drawdown of an equity-like series, as a negative
/// fraction (e.g. `-0.23` for a 23% decline). `0.0` for a monotonically
/// non-decreasing series, `NaN` for fewer than 2 points.
pub fn max_drawdown(series: &[f64]) -> f64 {
    if series.len() < 2 {
        return f64::NAN;
    }
    let mut peak = series[0];
    let mut worst = 0.0f64;
    for &v in series {
        if v > peak {
            peak = v;
        }
        if peak != 0.0 {
            let dd = v / peak - 1.0;
            if dd < worst {
                worst = dd;
            }
        }
    }
    worst
}

/// Root-mean-square of `min(Return - threshold, 0)` over every bar (spec.md
/// §4.6), not a standard deviation around the mean of the negative subset:
/// bars with `Return >= threshold` contribute a zero term but still count
/// toward the averaging denominator.
fn downside_deviation(returns: &[f64], threshold: f64) -> f64 {
    if returns.is_empty() {
        return f64::NAN;
    }
    let sum_sq: f64 = returns.iter().map(|r| (r - threshold).min(0.0).powi(2)).sum();
    (sum_sq / returns.len() as f64).sqrt()
}

/// Compute the full performance report from a simulated trade-record series.
/// `risk_free_rate` is an annualized rate (e.g. `0.0` for excess-return-free
/// Sharpe).
pub fn compute_metrics(records: &[TradeRecord], freq: Frequency, risk_free_rate: f64) -> PerformanceMetrics {
    let n = records.len();
    let equity: Vec<f64> = records.iter().map(|r| r.equity_value).collect();
    let returns = bar_returns(&equity);
    let ppy = periods_per_year(freq);

    let total_return = if n > 0 && equity[0] != 0.0 {
        equity[n - 1] / equity[0] - 1.0
    } else {
        f64::NAN
    };

    // years = elapsed calendar days between the first and last record's
    // `Time`, divided by bars-per-year (spec.md §4.6), not bar count / ppy:
    // those diverge whenever the series has calendar gaps (weekends, non-
    // daily frequencies).
    let cagr = if n > 1 && equity[0] > 0.0 {
        let growth = equity[n - 1] / equity[0];
        let elapsed_days = (records[n - 1].time - records[0].time).num_days() as f64;
        let years = (elapsed_days / ppy).max(1e-6);
        if growth > 0.0 {
            growth.powf(1.0 / years) - 1.0
        } else {
            f64::NAN
        }
    } else {
        f64::NAN
    };

    let annual_volatility = finite_or(sample_std(&returns) * ppy.sqrt(), f64::NAN);
    let downside_risk = finite_or(downside_deviation(&returns, 0.0) * ppy.sqrt(), f64::NAN);
    let mdd = max_drawdown(&equity);

    let mean_annual = mean(&returns) * ppy;
    let sharpe = if annual_volatility.is_finite() && annual_volatility > 0.0 {
        (mean_annual - risk_free_rate) / annual_volatility
    } else {
        f64::NAN
    };
    let sortino = if downside_risk.is_finite() && downside_risk > 0.0 {
        (mean_annual - risk_free_rate) / downside_risk
    } else {
        f64::NAN
    };
    let calmar = if mdd.is_finite() && mdd != 0.0 {
        (cagr - risk_free_rate) / mdd.abs()
    } else {
        f64::NAN
    };

    let close0 = records.first().map(|r| r.close).unwrap_or(f64::NAN);
    let bah: Vec<f64> = records
        .iter()
        .map(|r| if close0 != 0.0 { 100.0 * r.close / close0 } else { f64::NAN })
        .collect();
    let bah_total_return = if n > 0 && bah[0] != 0.0 {
        bah[n - 1] / bah[0] - 1.0
    } else {
        f64::NAN
    };
    let bah_max_drawdown = max_drawdown(&bah);

    let trade_returns: Vec<f64> = records.iter().filter_map(|r| r.trade_return).collect();
    let num_trades = trade_returns.len() as u32;
    let win_rate = if num_trades > 0 {
        trade_returns.iter().filter(|r| **r > 0.0).count() as f64 / num_trades as f64
    } else {
        f64::NAN
    };
    let gains: f64 = trade_returns.iter().filter(|r| **r > 0.0).sum();
    let losses: f64 = trade_returns.iter().filter(|r| **r < 0.0).map(|r| r.abs()).sum();
    let profit_factor = if losses > 0.0 {
        gains / losses
    } else if gains > 0.0 {
        f64::INFINITY
    } else {
        f64::NAN
    };

    let mut max_consecutive_losses = 0u32;
    let mut current_streak = 0u32;
    for r in &trade_returns {
        if *r < 0.0 {
            current_streak += 1;
            max_consecutive_losses = max_consecutive_losses.max(current_streak);
        } else {
            current_streak = 0;
        }
    }

    let exposure_time = if n > 0 {
        records.iter().filter(|r| r.position_size != 0).count() as f64 / n as f64
    } else {
        f64::NAN
    };

    PerformanceMetrics {
        total_return,
        cagr,
        annual_volatility,
        downside_risk,
        max_drawdown: mdd,
        sharpe,
        sortino,
        calmar,
        bah_total_return,
        bah_max_drawdown,
        win_rate,
        profit_factor,
        max_consecutive_losses,
        exposure_time,
        num_trades,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulator::PositionType;
    use chrono::{TimeZone, Utc};

    fn record(equity: f64, position_size: i8, trade_return: Option<f64>, close: f64) -> TradeRecord {
        TradeRecord {
            time: Utc.timestamp_opt(0, 0).unwrap(),
            open: close,
            high: close,
            low: close,
            close,
            trading_instrument: "Close".to_string(),
            position_type: PositionType::None,
            open_price: None,
            close_price: None,
            position_size,
            r#return: 0.0,
            trade_group_id: None,
            trade_action: 0,
            open_time: None,
            close_time: None,
            parameter_set_id: "x".to_string(),
            equity_value: equity,
            transaction_cost: 0.0,
            slippage_cost: 0.0,
            predictor_value: 0.0,
            entry_signal: 0,
            exit_signal: 0,
            holding_period_count: 0,
            holding_period: None,
            trade_return,
            backtest_id: "x".to_string(),
        }
    }

    #[test]
    fn flat_equity_curve_has_zero_drawdown_and_nan_ratios() {
        let records: Vec<_> = (0..20).map(|_| record(100.0, 0, None, 100.0)).collect();
        let m = compute_metrics(&records, Frequency::Day, 0.0);
        assert!((m.total_return).abs() < 1e-9);
        assert_eq!(m.max_drawdown, 0.0);
        assert!(m.sharpe.is_nan());
        assert!(m.win_rate.is_nan());
    }

    #[test]
    fn drawdown_detects_peak_to_trough() {
        let series = vec![100.0, 110.0, 90.0, 95.0, 120.0];
        let dd = max_drawdown(&series);
        assert!((dd - (90.0 / 110.0 - 1.0)).abs() < 1e-9);
    }

    #[test]
    fn profit_factor_and_win_rate_from_closed_trades() {
        let mut records = vec![record(100.0, 0, None, 100.0)];
        records.push(record(105.0, 0, Some(5.0), 100.0));
        records.push(record(102.0, 0, Some(-3.0), 100.0));
        records.push(record(110.0, 0, Some(8.0), 100.0));
        let m = compute_metrics(&records, Frequency::Day, 0.0);
        assert_eq!(m.num_trades, 3);
        assert!((m.win_rate - 2.0 / 3.0).abs() < 1e-9);
        assert!((m.profit_factor - (13.0 / 3.0)).abs() < 1e-9);
    }

    #[test]
    fn max_consecutive_losses_counts_longest_run() {
        let mut records = vec![record(100.0, 0, None, 100.0)];
        for r in [1.0, -1.0, -1.0, -1.0, 2.0, -1.0] {
            records.push(record(100.0, 0, Some(r), 100.0));
        }
        let m = compute_metrics(&records, Frequency::Day, 0.0);
        assert_eq!(m.max_consecutive_losses, 3);
    }
}
