use std::collections::HashMap;
use std::sync::Arc;

use crate::rolling;

/// Which rolling statistic a cache entry holds. Quantiles are keyed by the
/// quantile scaled to an integer (x1000) so the key can implement `Eq`/`Hash`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum StatKind {
    Sma,
    Ema,
    Wma,
    StdSample,
    RollingMax,
    RollingMin,
    Quantile(i64),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    stat: StatKind,
    window: usize,
    predictor: String,
}

/// Shared rolling-statistic cache keyed by `(statKind, window, predictor)`.
/// A single instance is owned per backtest-engine run and handed to every
/// batched generator call so identical `(window, predictor)` tuples across
/// tasks compute their rolling series exactly once.
#[derive(Default)]
pub struct RollingCache {
    entries: HashMap<CacheKey, Arc<Vec<f64>>>,
}

impl RollingCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn moving_average(&mut self, predictor: &str, x: &[f64], period: usize, ma_type: &str) -> Arc<Vec<f64>> {
        let stat = match ma_type {
            "EMA" => StatKind::Ema,
            "WMA" => StatKind::Wma,
            _ => StatKind::Sma,
        };
        self.get_or_compute(stat, period, predictor, || rolling::rolling_ma(x, period, ma_type))
    }

    pub fn std_sample(&mut self, predictor: &str, x: &[f64], period: usize) -> Arc<Vec<f64>> {
        self.get_or_compute(StatKind::StdSample, period, predictor, || {
            rolling::std_sample_full(x, period)
        })
    }

    pub fn rolling_max(&mut self, predictor: &str, x: &[f64], window: usize) -> Arc<Vec<f64>> {
        self.get_or_compute(StatKind::RollingMax, window, predictor, || {
            rolling::rolling_max_full(x, window)
        })
    }

    pub fn rolling_min(&mut self, predictor: &str, x: &[f64], window: usize) -> Arc<Vec<f64>> {
        self.get_or_compute(StatKind::RollingMin, window, predictor, || {
            rolling::rolling_min_full(x, window)
        })
    }

    pub fn quantile(&mut self, predictor: &str, x: &[f64], window: usize, q: f64) -> Arc<Vec<f64>> {
        let stat = StatKind::Quantile((q * 1000.0).round() as i64);
        self.get_or_compute(stat, window, predictor, || {
            rolling::rolling_quantile_full(x, window, q)
        })
    }

    fn get_or_compute(
        &mut self,
        stat: StatKind,
        window: usize,
        predictor: &str,
        compute: impl FnOnce() -> Vec<f64>,
    ) -> Arc<Vec<f64>> {
        let key = CacheKey {
            stat,
            window,
            predictor: predictor.to_string(),
        };
        if let Some(existing) = self.entries.get(&key) {
            return existing.clone();
        }
        let computed = Arc::new(compute());
        self.entries.insert(key, computed.clone());
        computed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_hits_on_repeated_window_predictor() {
        let mut cache = RollingCache::new();
        let x = vec![1.0, 2.0, 3.0, 4.0, 5.0];
        let a = cache.moving_average("Close", &x, 3, "SMA");
        let b = cache.moving_average("Close", &x, 3, "SMA");
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn cache_misses_on_different_predictor() {
        let mut cache = RollingCache::new();
        let x = vec![1.0, 2.0, 3.0, 4.0, 5.0];
        let a = cache.moving_average("Close", &x, 3, "SMA");
        let b = cache.moving_average("Open", &x, 3, "SMA");
        assert!(!Arc::ptr_eq(&a, &b));
    }
}
