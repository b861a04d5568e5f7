/// Shared rolling-statistic helpers used by the indicator and metrics
/// layers. Generalised from the teacher's adaptive-threshold helpers
/// (mean/std_dev/percentile) to the float-only, NaN-guarded semantics this
/// system requires.

/// Return `val` if finite, otherwise `default`. NaN/Inf inputs must never
/// propagate past a signal boundary.
#[inline]
pub fn finite_or(val: f64, default: f64) -> f64 {
    if val.is_finite() {
        val
    } else {
        default
    }
}

pub fn mean(data: &[f64]) -> f64 {
    if data.is_empty() {
        return f64::NAN;
    }
    data.iter().sum::<f64>() / data.len() as f64
}

/// Sample standard deviation (n-1 denominator). NaN when fewer than 2 points.
pub fn sample_std(data: &[f64]) -> f64 {
    if data.len() < 2 {
        return f64::NAN;
    }
    let m = mean(data);
    let variance = data.iter().map(|x| (x - m).powi(2)).sum::<f64>() / (data.len() - 1) as f64;
    variance.sqrt()
}

/// Population standard deviation (n denominator).
pub fn population_std(data: &[f64]) -> f64 {
    if data.is_empty() {
        return f64::NAN;
    }
    let m = mean(data);
    let variance = data.iter().map(|x| (x - m).powi(2)).sum::<f64>() / data.len() as f64;
    variance.sqrt()
}

/// Linear-interpolation quantile of `data` at `q` (0.0..=1.0). Sorts a copy
/// internally. `q` is clamped to [0, 1].
pub fn percentile_linear(data: &[f64], q: f64) -> f64 {
    if data.is_empty() {
        return f64::NAN;
    }
    let mut sorted: Vec<f64> = data.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let q = q.clamp(0.0, 1.0);
    if sorted.len() == 1 {
        return sorted[0];
    }
    let pos = q * (sorted.len() - 1) as f64;
    let lower = pos.floor() as usize;
    let upper = pos.ceil() as usize;
    if lower == upper {
        return sorted[lower];
    }
    let frac = pos - lower as f64;
    sorted[lower] * (1.0 - frac) + sorted[upper] * frac
}

/// Linear-weighted moving average with weights `1..=period` (WMA).
pub fn wma(data: &[f64], period: usize) -> Vec<f64> {
    if period == 0 || data.len() < period {
        return vec![];
    }
    let weight_sum: f64 = (1..=period).sum::<usize>() as f64;
    let mut result = Vec::with_capacity(data.len() - period + 1);
    for i in period - 1..data.len() {
        let window = &data[i + 1 - period..=i];
        let weighted: f64 = window
            .iter()
            .enumerate()
            .map(|(idx, v)| v * (idx + 1) as f64)
            .sum();
        result.push(finite_or(weighted / weight_sum, 0.0));
    }
    result
}
