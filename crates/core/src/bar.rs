use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Inferred sampling frequency of a bar table, derived from the median
/// inter-bar delta in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Frequency {
    Minute,
    Minute15,
    Hour,
    Hour4,
    Day,
    Week,
    Month,
    Custom,
}

const FREQUENCY_TABLE: &[(i64, Frequency)] = &[
    (60, Frequency::Minute),
    (900, Frequency::Minute15),
    (3600, Frequency::Hour),
    (14400, Frequency::Hour4),
    (86400, Frequency::Day),
    (604800, Frequency::Week),
    (2592000, Frequency::Month),
];

/// Pick the closest-match frequency bucket for a median delta in seconds.
/// Falls back to `Custom` when no bucket is within 10% of the median.
fn closest_frequency(median_secs: i64) -> Frequency {
    FREQUENCY_TABLE
        .iter()
        .min_by_key(|(secs, _)| (secs - median_secs).abs())
        .filter(|(secs, _)| ((secs - median_secs).abs() as f64) <= 0.1 * (*secs).max(1) as f64)
        .map(|(_, freq)| *freq)
        .unwrap_or(Frequency::Custom)
}

/// A column-oriented, dense, zero-indexed time series of OHLC[V] bars plus
/// zero or more exogenous predictor columns.
///
/// `D` is loaded once per run and shared read-only by every task; nothing
/// in this type mutates after construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BarTable {
    pub time: Vec<DateTime<Utc>>,
    pub open: Vec<f64>,
    pub high: Vec<f64>,
    pub low: Vec<f64>,
    pub close: Vec<f64>,
    pub volume: Option<Vec<f64>>,
    pub predictors: HashMap<String, Vec<f64>>,
}

impl BarTable {
    pub fn len(&self) -> usize {
        self.time.len()
    }

    pub fn is_empty(&self) -> bool {
        self.time.is_empty()
    }

    /// Resolve a named column: `Open`, `High`, `Low`, `Close`, `Volume`, or
    /// any predictor column name. Returns `MissingColumn` when absent.
    pub fn column(&self, name: &str) -> Result<&[f64], Error> {
        match name {
            "Open" => Ok(&self.open),
            "High" => Ok(&self.high),
            "Low" => Ok(&self.low),
            "Close" => Ok(&self.close),
            "Volume" => self
                .volume
                .as_deref()
                .ok_or_else(|| Error::MissingColumn("Volume".to_string())),
            other => self
                .predictors
                .get(other)
                .map(|v| v.as_slice())
                .ok_or_else(|| Error::MissingColumn(other.to_string())),
        }
    }

    /// Infer sampling frequency from the median inter-bar delta.
    pub fn infer_frequency(&self) -> Frequency {
        if self.time.len() < 2 {
            return Frequency::Custom;
        }
        let mut deltas: Vec<i64> = self
            .time
            .windows(2)
            .map(|w| (w[1] - w[0]).num_seconds())
            .collect();
        deltas.sort_unstable();
        let median = deltas[deltas.len() / 2];
        closest_frequency(median)
    }

    /// Structural validation: strictly increasing time, consistent column
    /// lengths, no gaps in the index.
    pub fn validate(&self) -> Result<(), Error> {
        let n = self.time.len();
        for col in [&self.open, &self.high, &self.low, &self.close] {
            if col.len() != n {
                return Err(Error::InvalidConfig(
                    "bar table columns have mismatched lengths".to_string(),
                ));
            }
        }
        if let Some(vol) = &self.volume {
            if vol.len() != n {
                return Err(Error::InvalidConfig(
                    "volume column length mismatch".to_string(),
                ));
            }
        }
        for (name, col) in &self.predictors {
            if col.len() != n {
                return Err(Error::InvalidConfig(format!(
                    "predictor column '{name}' length mismatch"
                )));
            }
        }
        for w in self.time.windows(2) {
            if w[1] <= w[0] {
                return Err(Error::InvalidConfig(
                    "bar table time column must be strictly increasing".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// A contiguous sub-slice view over `[start, end)` bar indices, used to
    /// carve train/test windows without copying the full table.
    pub fn slice(&self, start: usize, end: usize) -> BarTable {
        let predictors = self
            .predictors
            .iter()
            .map(|(k, v)| (k.clone(), v[start..end].to_vec()))
            .collect();
        BarTable {
            time: self.time[start..end].to_vec(),
            open: self.open[start..end].to_vec(),
            high: self.high[start..end].to_vec(),
            low: self.low[start..end].to_vec(),
            close: self.close[start..end].to_vec(),
            volume: self.volume.as_ref().map(|v| v[start..end].to_vec()),
            predictors,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn bar(ts: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(ts, 0).unwrap()
    }

    #[test]
    fn infers_daily_frequency() {
        let table = BarTable {
            time: (0..10).map(|i| bar(i * 86400)).collect(),
            open: vec![1.0; 10],
            high: vec![1.0; 10],
            low: vec![1.0; 10],
            close: vec![1.0; 10],
            volume: None,
            predictors: HashMap::new(),
        };
        assert_eq!(table.infer_frequency(), Frequency::Day);
    }

    #[test]
    fn missing_column_errors() {
        let table = BarTable {
            time: vec![bar(0)],
            open: vec![1.0],
            high: vec![1.0],
            low: vec![1.0],
            close: vec![1.0],
            volume: None,
            predictors: HashMap::new(),
        };
        assert!(table.column("Volume").is_err());
        assert!(table.column("RSI").is_err());
        assert!(table.column("Close").is_ok());
    }

    #[test]
    fn validate_rejects_non_monotonic_time() {
        let table = BarTable {
            time: vec![bar(100), bar(50)],
            open: vec![1.0, 1.0],
            high: vec![1.0, 1.0],
            low: vec![1.0, 1.0],
            close: vec![1.0, 1.0],
            volume: None,
            predictors: HashMap::new(),
        };
        assert!(table.validate().is_err());
    }
}
