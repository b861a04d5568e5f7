use chrono::{DateTime, Utc};
use qbt_core::error::Error;
use qbt_core::BarTable;
use qbt_indicators::params::{is_variable, ResolvedValue};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::{ConditionPair, Objective, StrategyConfig, WfaConfig};
use crate::engine::{build_tasks_for_pair, run_task, run_tasks, BacktestResult, Task};
use crate::metrics::PerformanceMetrics;

use super::optimizer::{select_grid_region, validate_variable_count, GridPoint};
use super::window::{plan_windows, Window};

/// One walk-forward window's outcome for one `ConditionPair`, one
/// optimization objective, and one of the (up to) nine grid cells the
/// in-sample optimizer selected around its best region (spec.md §6 result
/// schema).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WfaWindowResult {
    pub window_id: usize,
    pub condition_pair_index: usize,
    pub predictor: String,
    pub objective: String,
    pub param_combination_id: usize,
    pub optimal_params: String,
    pub train_start: usize,
    pub train_end: usize,
    pub test_start: usize,
    pub test_end: usize,
    pub train_start_date: DateTime<Utc>,
    pub train_end_date: DateTime<Utc>,
    pub test_start_date: DateTime<Utc>,
    pub test_end_date: DateTime<Utc>,
    pub is_sharpe: f64,
    pub is_calmar: f64,
    pub is_sortino: f64,
    pub is_total_return: f64,
    pub is_mdd: f64,
    pub is_metric: f64,
    pub oos_sharpe: f64,
    pub oos_calmar: f64,
    pub oos_sortino: f64,
    pub oos_total_return: f64,
    pub oos_mdd: f64,
}

/// Full walk-forward run output: every window's result, plus how many
/// windows were silently dropped because the in-sample optimization or the
/// out-of-sample resimulation failed for reasons other than a data problem
/// the caller should see immediately.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WfaResult {
    pub windows: Vec<WfaWindowResult>,
    pub dropped_windows: usize,
}

fn objective_score(metrics: &PerformanceMetrics, objective: Objective) -> f64 {
    match objective {
        Objective::Sharpe => metrics.sharpe,
        Objective::Calmar => metrics.calmar,
    }
}

fn objective_name(objective: Objective) -> &'static str {
    match objective {
        Objective::Sharpe => "Sharpe",
        Objective::Calmar => "Calmar",
    }
}

/// The (alias, paramKey) pairs whose enumerated values vary for this
/// condition pair, across both its entry and exit slots. At most two may
/// vary (spec.md §7 `TooManyVariables`); this also doubles as the optimizer
/// grid's axis selection.
fn variable_axes(
    pair: &ConditionPair,
    indicator_params: &std::collections::BTreeMap<String, Vec<qbt_indicators::IndicatorParams>>,
    strategy_index: usize,
) -> Result<Vec<(String, String)>, Error> {
    let mut axes = Vec::new();
    for alias in pair.entry.iter().chain(pair.exit.iter()) {
        let key = StrategyConfig::slot_key(alias, strategy_index + 1);
        let Some(slot) = indicator_params.get(&key) else {
            continue;
        };
        let Some(sample) = slot.first() else { continue };
        for param_key in sample.params.keys() {
            let values: Vec<ResolvedValue> = slot
                .iter()
                .filter_map(|p| p.get(param_key).cloned())
                .collect();
            if is_variable(&values) {
                axes.push((alias.clone(), param_key.clone()));
            }
        }
    }
    validate_variable_count(axes.len())?;
    Ok(axes)
}

fn axis_value(task: &Task, alias: &str, key: &str) -> ResolvedValue {
    task.entry_combo
        .iter()
        .chain(task.exit_combo.iter())
        .find(|p| p.alias == alias)
        .and_then(|p| p.get(key).cloned())
        .unwrap_or(ResolvedValue::Int(0))
}

/// Stringify a task's resolved parameters as spec.md §6's `optimal_params`:
/// a dict keyed `"{alias}_{param}"`, entry slots before exit slots, each
/// slot's own params in their natural (`BTreeMap`) sorted order.
fn optimal_params_string(task: &Task) -> String {
    let mut entries: Vec<(String, String)> = Vec::new();
    for p in task.entry_combo.iter().chain(task.exit_combo.iter()) {
        for (key, value) in &p.params {
            entries.push((format!("{}_{}", p.alias, key), value.to_string()));
        }
    }
    let body = entries
        .iter()
        .map(|(k, v)| format!("\"{k}\": {v}"))
        .collect::<Vec<_>>()
        .join(", ");
    format!("{{{body}}}")
}

/// Select the in-sample grid region for one window: the nine (or, when a
/// variable axis has fewer than 3 distinct values, single) cells around the
/// best-scoring neighbourhood, each paired with its in-sample result. When
/// zero or one variable parameter exists there is nothing to search — the
/// single enumerated task stands alone as combination 1.
fn select_is_region(
    axes: &[(String, String)],
    objective: Objective,
    train_results: Vec<(Task, BacktestResult)>,
) -> Result<Vec<(usize, Task, BacktestResult, f64)>, Error> {
    if train_results.len() == 1 || axes.is_empty() {
        let (task, result) = train_results
            .into_iter()
            .next()
            .ok_or_else(|| Error::NoSignal("no in-sample tasks produced".to_string()))?;
        let metric = objective_score(&result.metrics, objective);
        return Ok(vec![(1, task, result, metric)]);
    }

    let points: Vec<GridPoint<(Task, BacktestResult)>> = train_results
        .into_iter()
        .map(|(task, result)| {
            let dim0 = axis_value(&task, &axes[0].0, &axes[0].1);
            let dim1 = if axes.len() == 2 {
                axis_value(&task, &axes[1].0, &axes[1].1)
            } else {
                ResolvedValue::Int(0)
            };
            let value = objective_score(&result.metrics, objective);
            GridPoint {
                dim0,
                dim1,
                value,
                payload: (task, result),
            }
        })
        .collect();

    let region = select_grid_region(&points)?;
    Ok(region
        .cells
        .into_iter()
        .map(|cell| {
            let (task, result) = cell.payload;
            (cell.combination_id, task, result, cell.is_metric)
        })
        .collect())
}

fn bar_date(bars: &BarTable, index: usize) -> DateTime<Utc> {
    let clamped = index.min(bars.len().saturating_sub(1));
    bars.time[clamped]
}

/// Run one window end to end: optimize in-sample to a grid region, then
/// re-simulate every cell of that region out-of-sample (spec.md §4.9 steps
/// 2-3), producing one result row per surviving cell.
#[allow(clippy::too_many_arguments)]
fn run_window(
    bars: &BarTable,
    strategy: &StrategyConfig,
    pair_index: usize,
    pair: &ConditionPair,
    predictor: &str,
    axes: &[(String, String)],
    objective: Objective,
    window: Window,
) -> Result<Vec<WfaWindowResult>, Error> {
    let train_bars = bars.slice(window.train_start, window.train_end);
    let test_bars = bars.slice(window.test_start, window.test_end);

    let single_predictor = [predictor.to_string()];
    let train_tasks = build_tasks_for_pair(
        pair,
        &strategy.indicator_params,
        &single_predictor,
        pair_index,
    )?;
    let train_results = run_tasks(&train_bars, &strategy.trading_params, train_tasks)?;
    if train_results.is_empty() {
        return Err(Error::NoSignal(format!(
            "window {} produced no in-sample results",
            window.window_id
        )));
    }

    let region = select_is_region(axes, objective, train_results)?;

    region
        .into_iter()
        .map(|(combination_id, task, is_result, is_metric)| {
            let oos_result = run_task(&test_bars, &strategy.trading_params, &task)?;
            Ok(WfaWindowResult {
                window_id: window.window_id,
                condition_pair_index: pair_index,
                predictor: predictor.to_string(),
                objective: objective_name(objective).to_string(),
                param_combination_id: combination_id,
                optimal_params: optimal_params_string(&task),
                train_start: window.train_start,
                train_end: window.train_end,
                test_start: window.test_start,
                test_end: window.test_end,
                train_start_date: bar_date(bars, window.train_start),
                train_end_date: bar_date(bars, window.train_end.saturating_sub(1)),
                test_start_date: bar_date(bars, window.test_start),
                test_end_date: bar_date(bars, window.test_end.saturating_sub(1)),
                is_sharpe: is_result.metrics.sharpe,
                is_calmar: is_result.metrics.calmar,
                is_sortino: is_result.metrics.sortino,
                is_total_return: is_result.metrics.total_return,
                is_mdd: is_result.metrics.max_drawdown,
                is_metric,
                oos_sharpe: oos_result.metrics.sharpe,
                oos_calmar: oos_result.metrics.calmar,
                oos_sortino: oos_result.metrics.sortino,
                oos_total_return: oos_result.metrics.total_return,
                oos_mdd: oos_result.metrics.max_drawdown,
            })
        })
        .collect()
}

/// Orchestrate the full walk-forward analysis: for every `ConditionPair`,
/// every configured optimization objective, and every planned window,
/// optimize in-sample and resimulate out-of-sample (spec.md §4.9). A window
/// that fails (e.g. `NoSignal` because a train slice produced no trades)
/// is dropped and counted rather than aborting the whole run.
pub fn run_walk_forward(bars: &BarTable, strategy: &StrategyConfig, wfa: &WfaConfig) -> Result<WfaResult, Error> {
    strategy.validate()?;
    wfa.validate()?;

    let windows = plan_windows(bars.len(), wfa);
    if windows.is_empty() {
        return Err(Error::InvalidConfig(
            "bar series is too short to fit a single walk-forward window".to_string(),
        ));
    }

    let mut results = Vec::new();
    let mut dropped = 0usize;

    for (pair_index, pair) in strategy.condition_pairs.iter().enumerate() {
        let axes = variable_axes(pair, &strategy.indicator_params, pair_index)?;
        for predictor in &strategy.predictors {
            for &objective in &wfa.optimization_objectives {
                for &window in &windows {
                    match run_window(bars, strategy, pair_index, pair, predictor, &axes, objective, window) {
                        Ok(rows) => results.extend(rows),
                        Err(e) => {
                            warn!(
                                window_id = window.window_id,
                                condition_pair_index = pair_index,
                                predictor = %predictor,
                                error = %e,
                                "dropping walk-forward window after failure"
                            );
                            dropped += 1;
                        }
                    }
                }
            }
        }
    }

    Ok(WfaResult {
        windows: results,
        dropped_windows: dropped,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConditionPair, TradePrice, TradingParams, WfaMode};
    use chrono::TimeZone;
    use qbt_indicators::enumerate;
    use std::collections::{BTreeMap, HashMap};

    fn table(n: usize) -> BarTable {
        let close: Vec<f64> = (0..n).map(|i| 100.0 + ((i as f64) * 0.05).sin() * 5.0 + (i % 13) as f64).collect();
        BarTable {
            time: (0..n).map(|i| Utc.timestamp_opt(i as i64 * 86400, 0).unwrap()).collect(),
            open: close.clone(),
            high: close.clone(),
            low: close.clone(),
            close,
            volume: None,
            predictors: HashMap::new(),
        }
    }

    fn strategy() -> StrategyConfig {
        let mut indicator_params = BTreeMap::new();
        let ma_cfg: BTreeMap<String, String> =
            [("ma_range".to_string(), "3:9:3".to_string())].into_iter().collect();
        indicator_params.insert(
            StrategyConfig::slot_key("MA1", 1),
            enumerate("MA1", &ma_cfg).unwrap(),
        );
        let nday_cfg: BTreeMap<String, String> =
            [("n_range".to_string(), "2".to_string())].into_iter().collect();
        indicator_params.insert(
            StrategyConfig::slot_key("NDayCycle1", 1),
            enumerate("NDayCycle1", &nday_cfg).unwrap(),
        );

        StrategyConfig {
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
        }
    }

    #[test]
    fn runs_one_window_per_configured_objective() {
        let bars = table(300);
        let strat = strategy();
        let wfa = WfaConfig {
            mode: WfaMode::Standard,
            train_set_percentage: 0.5,
            test_set_percentage: 0.2,
            step_size: 100,
            optimization_objectives: vec![Objective::Sharpe, Objective::Calmar],
            output_csv: false,
        };
        let result = run_walk_forward(&bars, &strat, &wfa).unwrap();
        assert!(!result.windows.is_empty());
        assert!(result.windows.iter().any(|w| w.objective == "Sharpe"));
        assert!(result.windows.iter().any(|w| w.objective == "Calmar"));
    }

    #[test]
    fn too_short_series_is_invalid_config() {
        let bars = table(5);
        let strat = strategy();
        let wfa = WfaConfig {
            mode: WfaMode::Standard,
            train_set_percentage: 0.5,
            test_set_percentage: 0.4,
            step_size: 10,
            optimization_objectives: vec![Objective::Sharpe],
            output_csv: false,
        };
        assert!(run_walk_forward(&bars, &strat, &wfa).is_err());
    }
}
