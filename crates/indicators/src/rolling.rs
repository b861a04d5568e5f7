//! Full-length (`NaN`-padded warmup) rolling statistics shared by the
//! signal generators and their batched-cache counterpart.

use qbt_core::stats::{finite_or, percentile_linear, sample_std};

pub fn sma_full(x: &[f64], period: usize) -> Vec<f64> {
    let n = x.len();
    let mut out = vec![f64::NAN; n];
    if period == 0 || n < period {
        return out;
    }
    for i in period - 1..n {
        let sum: f64 = x[i + 1 - period..=i].iter().sum();
        out[i] = finite_or(sum / period as f64, f64::NAN);
    }
    out
}

/// EMA seeded from the mean of the first `period` bars (spec.md §9 open
/// question, decision recorded in DESIGN.md), then smoothed with `2/(p+1)`.
pub fn ema_full(x: &[f64], period: usize) -> Vec<f64> {
    let n = x.len();
    let mut out = vec![f64::NAN; n];
    if period == 0 || n < period {
        return out;
    }
    let multiplier = 2.0 / (period as f64 + 1.0);
    let seed = finite_or(x[..period].iter().sum::<f64>() / period as f64, f64::NAN);
    out[period - 1] = seed;
    for i in period..n {
        let prev = out[i - 1];
        out[i] = finite_or((x[i] - prev) * multiplier + prev, prev);
    }
    out
}

pub fn wma_full(x: &[f64], period: usize) -> Vec<f64> {
    let n = x.len();
    let mut out = vec![f64::NAN; n];
    if period == 0 || n < period {
        return out;
    }
    let weight_sum = (1..=period).sum::<usize>() as f64;
    for i in period - 1..n {
        let window = &x[i + 1 - period..=i];
        let weighted: f64 = window
            .iter()
            .enumerate()
            .map(|(idx, v)| v * (idx + 1) as f64)
            .sum();
        out[i] = finite_or(weighted / weight_sum, f64::NAN);
    }
    out
}

pub fn rolling_ma(x: &[f64], period: usize, ma_type: &str) -> Vec<f64> {
    match ma_type {
        "EMA" => ema_full(x, period),
        "WMA" => wma_full(x, period),
        _ => sma_full(x, period),
    }
}

/// Rolling sample standard deviation (the spec mandates sample, not
/// population, std for Bollinger bands).
pub fn std_sample_full(x: &[f64], period: usize) -> Vec<f64> {
    let n = x.len();
    let mut out = vec![f64::NAN; n];
    if period < 2 || n < period {
        return out;
    }
    for i in period - 1..n {
        out[i] = finite_or(sample_std(&x[i + 1 - period..=i]), f64::NAN);
    }
    out
}

pub fn rolling_max_full(x: &[f64], window: usize) -> Vec<f64> {
    let n = x.len();
    let mut out = vec![f64::NAN; n];
    if window == 0 || n < window {
        return out;
    }
    for i in window - 1..n {
        out[i] = x[i + 1 - window..=i]
            .iter()
            .cloned()
            .fold(f64::NEG_INFINITY, f64::max);
    }
    out
}

pub fn rolling_min_full(x: &[f64], window: usize) -> Vec<f64> {
    let n = x.len();
    let mut out = vec![f64::NAN; n];
    if window == 0 || n < window {
        return out;
    }
    for i in window - 1..n {
        out[i] = x[i + 1 - window..=i]
            .iter()
            .cloned()
            .fold(f64::INFINITY, f64::min);
    }
    out
}

pub fn rolling_quantile_full(x: &[f64], window: usize, q: f64) -> Vec<f64> {
    let n = x.len();
    let mut out = vec![f64::NAN; n];
    if window == 0 || n < window {
        return out;
    }
    for i in window - 1..n {
        out[i] = finite_or(percentile_linear(&x[i + 1 - window..=i], q), f64::NAN);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sma_warmup_is_nan() {
        let x = vec![1.0, 2.0, 3.0, 4.0, 5.0];
        let out = sma_full(&x, 3);
        assert!(out[0].is_nan());
        assert!(out[1].is_nan());
        assert!((out[2] - 2.0).abs() < 1e-9);
        assert!((out[4] - 4.0).abs() < 1e-9);
    }

    #[test]
    fn ema_seeded_from_mean_of_first_period() {
        let x = vec![2.0, 4.0, 6.0];
        let out = ema_full(&x, 3);
        assert!((out[2] - 4.0).abs() < 1e-9);
    }
}
