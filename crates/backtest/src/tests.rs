//! Cross-module integration scenarios exercising the full
//! `run_backtests`/`run_walk_forward` pipelines end to end, matching the
//! concrete scenarios worked through during design (one deterministic bar
//! table walked through signal generation, simulation, and metrics, the way
//! a real strategy run would).

use std::collections::{BTreeMap, HashMap};

use chrono::{TimeZone, Utc};
use qbt_core::BarTable;
use qbt_indicators::enumerate;

use crate::config::{ConditionPair, Objective, StrategyConfig, TradePrice, TradingParams, WfaConfig, WfaMode};
use crate::engine::run_backtests;
use crate::wfa::run_walk_forward;

fn bars_with_closes(closes: &[f64]) -> BarTable {
    let close = closes.to_vec();
    BarTable {
        time: (0..close.len())
            .map(|i| Utc.timestamp_opt(i as i64 * 86400, 0).unwrap())
            .collect(),
        open: close.clone(),
        high: close.clone(),
        low: close.clone(),
        close,
        volume: None,
        predictors: HashMap::new(),
    }
}

fn sine_bars(n: usize) -> BarTable {
    let closes: Vec<f64> = (0..n)
        .map(|i| 100.0 + ((i as f64) * 0.05).sin() * 5.0 + (i % 13) as f64)
        .collect();
    bars_with_closes(&closes)
}

// =============================================================================
// S4: NDayCycle forces a close exactly `n` bars after entry, and leaves the
// position open when entry+n would run past the end of the series.
// =============================================================================

#[test]
fn nday_cycle_forces_close_n_bars_after_entry() {
    // MA1 fires its single cross near the start of the series; NDayCycle1
    // with n=3 should force a close exactly 3 bars later, with no further
    // trades once the forced exit has fired.
    let bars = bars_with_closes(&[
        100.0, 100.0, 100.0, 95.0, 110.0, 111.0, 112.0, 113.0, 114.0, 115.0, 116.0, 117.0,
    ]);

    let mut indicator_params = BTreeMap::new();
    let ma_cfg: BTreeMap<String, String> =
        [("ma_range".to_string(), "3:3:1".to_string())].into_iter().collect();
    indicator_params.insert(StrategyConfig::slot_key("MA1", 1), enumerate("MA1", &ma_cfg).unwrap());
    let nday_cfg: BTreeMap<String, String> =
        [("n_range".to_string(), "3".to_string())].into_iter().collect();
    indicator_params.insert(
        StrategyConfig::slot_key("NDayCycle1", 1),
        enumerate("NDayCycle1", &nday_cfg).unwrap(),
    );

    let strategy = StrategyConfig {
        condition_pairs: vec![ConditionPair {
            entry: vec!["MA1".to_string()],
            exit: vec!["NDayCycle1".to_string()],
        }],
        indicator_params,
        predictors: vec!["Close".to_string()],
        trading_params: TradingParams {
            transaction_cost: 0.0,
            slippage: 0.0,
            trade_delay: 0,
            trade_price: TradePrice::Close,
        },
    };

    let results = run_backtests(&bars, &strategy).unwrap();
    assert_eq!(results.len(), 1);
    let result = &results[0];

    // Exactly one round trip: one open, one forced close, never a second entry.
    let opens = result.trades.iter().filter(|t| t.trade_action == 1).count();
    let closes = result.trades.iter().filter(|t| t.trade_action == 4).count();
    assert_eq!(opens, 1, "exactly one entry should fire");
    assert_eq!(closes, 1, "the NDayCycle override should force exactly one close");

    let entry_day = result.trades.iter().find(|t| t.trade_action == 1).unwrap().time.timestamp() / 86400;
    let exit_day = result.trades.iter().find(|t| t.trade_action == 4).unwrap().time.timestamp() / 86400;
    assert_eq!(exit_day, entry_day + 3, "close must land exactly n=3 bars after entry");
}

#[test]
fn nday_cycle_out_of_range_leaves_position_open() {
    // Entry fires near the very end of the series; entry + n runs past the
    // last bar, so the forced close is simply dropped (no trailing trade, no
    // error) and the position is left open at series end.
    let bars = bars_with_closes(&[100.0, 100.0, 100.0, 95.0, 130.0]);

    let mut indicator_params = BTreeMap::new();
    let ma_cfg: BTreeMap<String, String> =
        [("ma_range".to_string(), "3:3:1".to_string())].into_iter().collect();
    indicator_params.insert(StrategyConfig::slot_key("MA1", 1), enumerate("MA1", &ma_cfg).unwrap());
    let nday_cfg: BTreeMap<String, String> =
        [("n_range".to_string(), "5".to_string())].into_iter().collect();
    indicator_params.insert(
        StrategyConfig::slot_key("NDayCycle1", 1),
        enumerate("NDayCycle1", &nday_cfg).unwrap(),
    );

    let strategy = StrategyConfig {
        condition_pairs: vec![ConditionPair {
            entry: vec!["MA1".to_string()],
            exit: vec!["NDayCycle1".to_string()],
        }],
        indicator_params,
        predictors: vec!["Close".to_string()],
        trading_params: TradingParams {
            transaction_cost: 0.0,
            slippage: 0.0,
            trade_delay: 0,
            trade_price: TradePrice::Close,
        },
    };

    let results = run_backtests(&bars, &strategy).unwrap();
    assert_eq!(results.len(), 1);
    let result = &results[0];
    let closes = result.trades.iter().filter(|t| t.trade_action == 4).count();
    assert_eq!(closes, 0, "an out-of-range forced exit must not produce a close record");
}

// =============================================================================
// S5: a standard-mode walk-forward plan over 1000 bars with 60%/20%
// train/test windows and a step size of 50 yields exactly 5 windows.
// =============================================================================

#[test]
fn wfa_standard_mode_plans_exact_window_count() {
    let bars = sine_bars(1000);

    let mut indicator_params = BTreeMap::new();
    let ma_cfg: BTreeMap<String, String> =
        [("ma_range".to_string(), "3:9:3".to_string())].into_iter().collect();
    indicator_params.insert(StrategyConfig::slot_key("MA1", 1), enumerate("MA1", &ma_cfg).unwrap());
    let nday_cfg: BTreeMap<String, String> =
        [("n_range".to_string(), "2".to_string())].into_iter().collect();
    indicator_params.insert(
        StrategyConfig::slot_key("NDayCycle1", 1),
        enumerate("NDayCycle1", &nday_cfg).unwrap(),
    );

    let strategy = StrategyConfig {
        condition_pairs: vec![ConditionPair {
            entry: vec!["MA1".to_string()],
            exit: vec!["NDayCycle1".to_string()],
        }],
        indicator_params,
        predictors: vec!["Close".to_string()],
        trading_params: TradingParams {
            transaction_cost: 0.0,
            slippage: 0.0,
            trade_delay: 0,
            trade_price: TradePrice::Close,
        },
    };

    let wfa = WfaConfig {
        mode: WfaMode::Standard,
        train_set_percentage: 0.6,
        test_set_percentage: 0.2,
        step_size: 50,
        optimization_objectives: vec![Objective::Sharpe],
        output_csv: false,
    };

    let result = run_walk_forward(&bars, &strategy, &wfa).unwrap();
    assert_eq!(result.dropped_windows, 0, "every planned window should produce a result here");
    let window_ids: std::collections::BTreeSet<usize> =
        result.windows.iter().map(|w| w.window_id).collect();
    assert_eq!(
        window_ids,
        [1, 2, 3, 4, 5].into_iter().collect(),
        "trainPct=0.6/testPct=0.2/step=50 over 1000 bars must plan exactly 5 windows, numbered from 1"
    );
}

// =============================================================================
// S6: a condition pair with three simultaneously-variable parameters must
// fail fast with TooManyVariables before any window is simulated.
// =============================================================================

#[test]
fn wfa_rejects_three_variable_parameters_before_simulating() {
    let bars = sine_bars(300);

    // PERC5 enumerates (window, m1, m2) together; ranging all three gives
    // this single alias three simultaneously-variable parameters.
    let mut indicator_params = BTreeMap::new();
    let perc_cfg: BTreeMap<String, String> = [
        ("window_range".to_string(), "10:20:10".to_string()),
        ("m1_range".to_string(), "1:2:1".to_string()),
        ("m2_range".to_string(), "3:4:1".to_string()),
    ]
    .into_iter()
    .collect();
    indicator_params.insert(StrategyConfig::slot_key("PERC5", 1), enumerate("PERC5", &perc_cfg).unwrap());

    let strategy = StrategyConfig {
        condition_pairs: vec![ConditionPair {
            entry: vec!["PERC5".to_string()],
            exit: vec![],
        }],
        indicator_params,
        predictors: vec!["Close".to_string()],
        trading_params: TradingParams {
            transaction_cost: 0.0,
            slippage: 0.0,
            trade_delay: 0,
            trade_price: TradePrice::Close,
        },
    };

    let wfa = WfaConfig {
        mode: WfaMode::Standard,
        train_set_percentage: 0.5,
        test_set_percentage: 0.2,
        step_size: 50,
        optimization_objectives: vec![Objective::Sharpe],
        output_csv: false,
    };

    let err = run_walk_forward(&bars, &strategy, &wfa).unwrap_err();
    assert!(
        matches!(err, qbt_core::Error::TooManyVariables(_)),
        "expected TooManyVariables, got {err:?}"
    );
}
