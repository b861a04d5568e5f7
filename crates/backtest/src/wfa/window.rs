use crate::config::{WfaConfig, WfaMode};

/// One walk-forward window: a training (in-sample) slice immediately
/// followed by a testing (out-of-sample) slice, expressed as half-open bar
/// index ranges `[start, end)` (spec.md §4.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    pub window_id: usize,
    pub train_start: usize,
    pub train_end: usize,
    pub test_start: usize,
    pub test_end: usize,
}

impl Window {
    pub fn train_len(&self) -> usize {
        self.train_end - self.train_start
    }

    pub fn test_len(&self) -> usize {
        self.test_end - self.test_start
    }
}

/// Build the full window sequence for `total_bars` bars.
///
/// `Standard`: both boundaries slide forward by `step_size` each iteration;
/// train and test window lengths are fixed, derived once from
/// `train_set_percentage`/`test_set_percentage` of `total_bars`.
///
/// `Anchored`: `train_start` stays `0` and `train_end` grows by `step_size`
/// each iteration (an expanding in-sample window); `test_len` stays fixed.
///
/// Iteration stops as soon as a window's `test_end` would exceed
/// `total_bars`; a `total_bars` too small to fit even one window yields an
/// empty list rather than an error (spec.md leaves this as NoSignal territory
/// for the caller, not the planner, to raise).
pub fn plan_windows(total_bars: usize, config: &WfaConfig) -> Vec<Window> {
    let train_len = ((config.train_set_percentage * total_bars as f64).floor() as usize).max(1);
    let test_len = ((config.test_set_percentage * total_bars as f64).floor() as usize).max(1);

    let mut windows = Vec::new();
    // Windows are numbered 1..K in emission order (spec.md §4.7).
    let mut window_id = 1;

    match config.mode {
        WfaMode::Standard => {
            let mut train_start = 0usize;
            loop {
                let train_end = train_start + train_len;
                let test_start = train_end;
                let test_end = test_start + test_len;
                if test_end > total_bars {
                    break;
                }
                windows.push(Window {
                    window_id,
                    train_start,
                    train_end,
                    test_start,
                    test_end,
                });
                window_id += 1;
                train_start += config.step_size;
            }
        }
        WfaMode::Anchored => {
            let mut train_end = train_len;
            loop {
                let test_start = train_end;
                let test_end = test_start + test_len;
                if test_end > total_bars {
                    break;
                }
                windows.push(Window {
                    window_id,
                    train_start: 0,
                    train_end,
                    test_start,
                    test_end,
                });
                window_id += 1;
                train_end += config.step_size;
            }
        }
    }

    windows
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Objective;

    fn config(mode: WfaMode, train_pct: f64, test_pct: f64, step: usize) -> WfaConfig {
        WfaConfig {
            mode,
            train_set_percentage: train_pct,
            test_set_percentage: test_pct,
            step_size: step,
            optimization_objectives: vec![Objective::Sharpe],
            output_csv: false,
        }
    }

    #[test]
    fn standard_windows_slide_both_boundaries() {
        let cfg = config(WfaMode::Standard, 0.5, 0.2, 100);
        let windows = plan_windows(1000, &cfg);
        assert!(!windows.is_empty());
        assert_eq!(windows[0].window_id, 1);
        assert_eq!(windows[0].train_start, 0);
        assert_eq!(windows[0].train_end, 500);
        assert_eq!(windows[0].test_start, 500);
        assert_eq!(windows[0].test_end, 700);
        assert_eq!(windows[1].train_start, 100);
        assert_eq!(windows[1].train_end, 600);
    }

    #[test]
    fn anchored_windows_keep_train_start_fixed() {
        let cfg = config(WfaMode::Anchored, 0.5, 0.2, 100);
        let windows = plan_windows(1000, &cfg);
        assert!(windows.iter().all(|w| w.train_start == 0));
        assert!(windows[1].train_end > windows[0].train_end);
    }

    #[test]
    fn windows_never_exceed_total_bars() {
        let cfg = config(WfaMode::Standard, 0.6, 0.3, 50);
        let windows = plan_windows(500, &cfg);
        assert!(windows.iter().all(|w| w.test_end <= 500));
    }

    #[test]
    fn too_small_series_yields_no_windows() {
        let cfg = config(WfaMode::Standard, 0.5, 0.5, 10);
        let windows = plan_windows(5, &cfg);
        assert!(windows.is_empty());
    }
}
