use std::collections::BTreeMap;
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use qbt_core::error::Error;
use qbt_core::ids::BacktestId;
use qbt_core::BarTable;
use qbt_indicators::{and_combine, derive_nday_cycle_exit, generate, IndicatorKind, IndicatorParams, RollingCache};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use sysinfo::System;
use tracing::{info, warn};

use crate::config::{ConditionPair, StrategyConfig};
use crate::metrics::{compute_metrics, PerformanceMetrics};
use crate::simulator::{simulate, TradeRecord};

const BATCH_TIMEOUT: Duration = Duration::from_secs(5 * 60);
/// Fraction of currently-available system memory one batch is allowed to
/// occupy, assuming ~200 bytes per retained trade row (spec.md §4.5).
const MEMORY_BUDGET_FRACTION: f64 = 0.25;
const BYTES_PER_TRADE_ROW: usize = 200;

/// One fully-simulated parameter combination. Only action bars (open/close)
/// are retained in `trades`; `metrics` is computed from the full per-bar
/// equity curve before it is discarded.
///
/// At most one of `trades`/`metrics` being meaningful and `error` being set
/// holds at a time: a failed task carries `error`, empty `trades`, and
/// `PerformanceMetrics` filled with NaN placeholders rather than aborting the
/// run (spec.md §3, §7: "Per-task errors are local... do not abort the run").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestResult {
    pub backtest_id: String,
    pub parameter_set_id: String,
    pub condition_pair_index: usize,
    pub predictor: String,
    pub metrics: PerformanceMetrics,
    pub trades: Vec<TradeRecord>,
    pub error: Option<String>,
    /// Non-fatal notices, e.g. `NoSignal` ("task produced zero entry and
    /// zero exit signals") — the run still returns an all-flat record table.
    pub warnings: Vec<String>,
}

impl BacktestResult {
    fn failed(task: &Task, message: String) -> Self {
        BacktestResult {
            backtest_id: String::new(),
            parameter_set_id: label_for_combo(&task.entry_combo, &task.exit_combo),
            condition_pair_index: task.condition_pair_index,
            predictor: task.predictor.clone(),
            metrics: PerformanceMetrics::nan(),
            trades: Vec::new(),
            error: Some(message),
            warnings: Vec::new(),
        }
    }
}

/// A fully-resolved unit of work: one predictor, one entry parameter
/// combination, one exit parameter combination (or an NDayCycle override).
/// Exposed `pub(crate)` so the walk-forward optimizer can build and re-run
/// single tasks against train/test windows without going through the full
/// `StrategyConfig` sweep.
#[derive(Debug, Clone)]
pub(crate) struct Task {
    pub(crate) condition_pair_index: usize,
    pub(crate) predictor: String,
    pub(crate) entry_combo: Vec<IndicatorParams>,
    pub(crate) exit_combo: Vec<IndicatorParams>,
}

fn cartesian_params(lists: &[Vec<IndicatorParams>]) -> Vec<Vec<IndicatorParams>> {
    let mut combos: Vec<Vec<IndicatorParams>> = vec![vec![]];
    for list in lists {
        let mut next = Vec::with_capacity(combos.len() * list.len().max(1));
        for combo in &combos {
            for item in list {
                let mut c = combo.clone();
                c.push(item.clone());
                next.push(c);
            }
        }
        combos = next;
    }
    combos
}

/// Look up one alias's enumerated parameter list for a `ConditionPair` slot.
/// A missing key is a fail-fast config error (the caller never enumerated
/// this alias at all); a present-but-empty list is a legitimate *empty
/// enumeration* (e.g. every MA5-8 short/long combination filtered out by
/// `short < long`) and is returned as-is, letting the cartesian product — and
/// ultimately `run_backtests` — collapse to zero tasks without an error
/// (spec.md §8: "Empty range yields empty enumeration; the backtest run
/// returns an empty result list without error").
fn lookup_slot<'a>(
    indicator_params: &'a BTreeMap<String, Vec<IndicatorParams>>,
    alias: &str,
    strategy_index: usize,
) -> Result<&'a Vec<IndicatorParams>, Error> {
    let key = StrategyConfig::slot_key(alias, strategy_index);
    indicator_params
        .get(&key)
        .ok_or_else(|| Error::InvalidConfig(format!("no enumerated parameters for slot '{key}'")))
}

fn enumerate_condition_pair(
    pair: &ConditionPair,
    indicator_params: &BTreeMap<String, Vec<IndicatorParams>>,
    strategy_index: usize,
) -> Result<(Vec<Vec<IndicatorParams>>, Vec<Vec<IndicatorParams>>), Error> {
    let entry_lists: Vec<Vec<IndicatorParams>> = pair
        .entry
        .iter()
        .map(|alias| lookup_slot(indicator_params, alias, strategy_index).cloned())
        .collect::<Result<_, _>>()?;
    let exit_lists: Vec<Vec<IndicatorParams>> = pair
        .exit
        .iter()
        .map(|alias| lookup_slot(indicator_params, alias, strategy_index).cloned())
        .collect::<Result<_, _>>()?;

    Ok((cartesian_params(&entry_lists), cartesian_params(&exit_lists)))
}

fn label_for_combo(entry_combo: &[IndicatorParams], exit_combo: &[IndicatorParams]) -> String {
    let entry_label = entry_combo.iter().map(|p| p.label()).collect::<Vec<_>>().join("+");
    if exit_combo.is_empty() {
        entry_label
    } else {
        let exit_label = exit_combo.iter().map(|p| p.label()).collect::<Vec<_>>().join("+");
        format!("{entry_label}_{exit_label}")
    }
}

/// Build every task for a single `ConditionPair` (one entry in
/// `strategy.condition_pairs`, at index `condition_pair_index`).
pub(crate) fn build_tasks_for_pair(
    pair: &ConditionPair,
    indicator_params: &BTreeMap<String, Vec<IndicatorParams>>,
    predictors: &[String],
    condition_pair_index: usize,
) -> Result<Vec<Task>, Error> {
    let (entry_combos, exit_combos) =
        enumerate_condition_pair(pair, indicator_params, condition_pair_index + 1)?;
    let mut tasks = Vec::new();
    for predictor in predictors {
        for entry_combo in &entry_combos {
            for exit_combo in &exit_combos {
                tasks.push(Task {
                    condition_pair_index,
                    predictor: predictor.clone(),
                    entry_combo: entry_combo.clone(),
                    exit_combo: exit_combo.clone(),
                });
            }
        }
    }
    Ok(tasks)
}

fn build_tasks(strategy: &StrategyConfig) -> Result<Vec<Task>, Error> {
    let mut tasks = Vec::new();
    for (idx, pair) in strategy.condition_pairs.iter().enumerate() {
        tasks.extend(build_tasks_for_pair(
            pair,
            &strategy.indicator_params,
            &strategy.predictors,
            idx,
        )?);
    }
    Ok(tasks)
}

/// Single-task entry point for callers that re-run one fixed parameter
/// combination in isolation (the walk-forward optimiser's out-of-sample
/// resimulation, in particular): owns a private cache, since there is no
/// sibling task to share rolling statistics with.
pub(crate) fn run_task(
    bars: &BarTable,
    trading: &crate::config::TradingParams,
    task: &Task,
) -> Result<BacktestResult, Error> {
    let cache = Mutex::new(RollingCache::new());
    run_task_with_cache(bars, trading, task, &cache)
}

/// Evaluate one task's signals and trade simulation, drawing rolling
/// statistics (moving averages, bands, rolling max/min, quantiles) from a
/// cache shared with the rest of its batch. The cache is locked per
/// `(indicatorType, predictor)` computation rather than for the task's full
/// duration, so unrelated `(window, predictor)` keys across concurrently
/// running tasks never contend (spec.md §5: "guarded by a lock").
pub(crate) fn run_task_with_cache(
    bars: &BarTable,
    trading: &crate::config::TradingParams,
    task: &Task,
    cache: &Mutex<RollingCache>,
) -> Result<BacktestResult, Error> {
    let x = bars.column(&task.predictor)?;

    let entry_signals: Vec<Vec<i8>> = task
        .entry_combo
        .iter()
        .map(|p| {
            let mut guard = cache.lock().expect("rolling cache mutex poisoned");
            generate(p, &task.predictor, x, &mut guard)
        })
        .collect::<Result<_, _>>()?;
    let entry = and_combine(&entry_signals);

    let nday = task.exit_combo.iter().find(|p| p.kind == IndicatorKind::NDayCycle);
    let exit = if let Some(nday_params) = nday {
        let n = nday_params
            .get("n")
            .and_then(|v| v.as_usize())
            .ok_or_else(|| Error::InvalidConfig("NDayCycle missing 'n'".to_string()))?;
        derive_nday_cycle_exit(&entry, n, nday_params.strategy_variant)
    } else if task.exit_combo.is_empty() {
        vec![0i8; bars.len()]
    } else {
        let exit_signals: Vec<Vec<i8>> = task
            .exit_combo
            .iter()
            .map(|p| {
                let mut guard = cache.lock().expect("rolling cache mutex poisoned");
                generate(p, &task.predictor, x, &mut guard)
            })
            .collect::<Result<_, _>>()?;
        and_combine(&exit_signals)
    };

    let seed = serde_json::json!({
        "predictor": task.predictor,
        "conditionPairIndex": task.condition_pair_index,
        "entry": task.entry_combo.iter().map(|p| p.param_hash()).collect::<Vec<_>>(),
        "exit": task.exit_combo.iter().map(|p| p.param_hash()).collect::<Vec<_>>(),
        "trading": trading,
    });
    let backtest_id = BacktestId::from_seed(&seed);
    let parameter_set_id = label_for_combo(&task.entry_combo, &task.exit_combo);

    let records = simulate(
        bars,
        &entry,
        &exit,
        x,
        &task.predictor,
        trading,
        &parameter_set_id,
        &backtest_id,
    )?;
    let freq = bars.infer_frequency();
    let metrics = compute_metrics(&records, freq, 0.0);
    // NoSignal (spec.md §7): the combined entry and exit streams never fired
    // at all. Not an error — the all-flat record table is still returned.
    let warnings = if entry.iter().all(|s| *s == 0) && exit.iter().all(|s| *s == 0) {
        vec!["NoSignal: task produced zero entry and zero exit signals".to_string()]
    } else {
        Vec::new()
    };
    let trades = records.into_iter().filter(|r| r.trade_action != 0).collect();

    Ok(BacktestResult {
        backtest_id: backtest_id.to_string(),
        parameter_set_id,
        condition_pair_index: task.condition_pair_index,
        predictor: task.predictor.clone(),
        metrics,
        trades,
        error: None,
        warnings,
    })
}

/// Evaluate one task, converting a task-local `Error` into a failed
/// `BacktestResult` instead of propagating it: a batch must keep evaluating
/// its remaining tasks even when one predictor is misconfigured (spec.md §7:
/// "Per-task errors are local... do not abort the run").
fn run_task_isolated(bars: &BarTable, trading: &crate::config::TradingParams, task: &Task, cache: &Mutex<RollingCache>) -> BacktestResult {
    match run_task_with_cache(bars, trading, task, cache) {
        Ok(result) => result,
        Err(e) => BacktestResult::failed(task, e.to_string()),
    }
}

/// Worker count and per-batch task count, sized from CPU count and current
/// available memory (spec.md §4.5). Assumes roughly `BYTES_PER_TRADE_ROW`
/// retained bytes per bar per task; spends at most `MEMORY_BUDGET_FRACTION`
/// of currently-available memory on one in-flight batch.
pub fn capacity_plan(total_tasks: usize, bars_len: usize) -> (usize, usize) {
    let cpus = num_cpus::get().max(1);
    let mut sys = System::new_all();
    sys.refresh_memory();
    let available_bytes = sys.available_memory() as usize;
    let per_task_bytes = (bars_len * BYTES_PER_TRADE_ROW).max(1);
    let budget = ((available_bytes as f64) * MEMORY_BUDGET_FRACTION) as usize;
    let max_by_memory = (budget / per_task_bytes).max(1);

    let workers = cpus.min(total_tasks.max(1));
    let batch_size = max_by_memory.min(total_tasks.max(1)).max(1);
    (workers, batch_size)
}

/// Run every enumerated `(predictor, entryCombo, exitCombo)` task against
/// `bars`. Tasks are grouped into memory-bounded batches; each batch runs on
/// a dedicated thread with a hard wall-clock timeout. A batch that times out
/// or exhausts memory contributes no results for its tasks rather than
/// aborting the whole run — callers see fewer `BacktestResult`s than tasks
/// enumerated, never a panic.
pub fn run_backtests(bars: &BarTable, strategy: &StrategyConfig) -> Result<Vec<BacktestResult>, Error> {
    strategy.validate()?;
    let tasks = build_tasks(strategy)?;
    if tasks.is_empty() {
        // An empty parameter-space enumeration is not an error (spec.md §8):
        // e.g. every entry/exit combination filtered out by a range-spec
        // constraint such as MA5-8's `short < long` rule.
        return Ok(Vec::new());
    }
    let paired = run_tasks(bars, &strategy.trading_params, tasks)?;
    Ok(paired.into_iter().map(|(_, result)| result).collect())
}

/// Batched, capacity-aware execution of a pre-built task list, returning
/// each task paired with its result (order-preserving) so callers that need
/// to map a result back to its originating parameter combination — the
/// walk-forward optimizer, in particular — don't have to re-derive it from
/// `parameter_set_id`.
pub(crate) fn run_tasks(
    bars: &BarTable,
    trading: &crate::config::TradingParams,
    tasks: Vec<Task>,
) -> Result<Vec<(Task, BacktestResult)>, Error> {
    if tasks.is_empty() {
        return Ok(Vec::new());
    }

    let (workers, mut batch_size) = capacity_plan(tasks.len(), bars.len());
    info!(workers, batch_size, total_tasks = tasks.len(), "planned capacity for backtest sweep");

    let pool = Arc::new(
        rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .build()
            .map_err(|e| Error::RuntimeError(format!("failed to build worker pool: {e}")))?,
    );

    let mut results = Vec::with_capacity(tasks.len());
    let mut offset = 0;
    let mut sys = System::new_all();

    while offset < tasks.len() {
        sys.refresh_memory();
        if low_memory(&sys) && batch_size > 1 {
            warn!("low memory detected, shrinking batch size and releasing cached rolling statistics");
            batch_size = (batch_size / 2).max(1);
        }

        let end = (offset + batch_size).min(tasks.len());
        let batch = &tasks[offset..end];
        match run_batch_with_timeout(&pool, bars, trading, batch) {
            Ok(batch_results) => {
                results.extend(batch.iter().cloned().zip(batch_results));
            }
            Err(Error::BatchTimeout(msg)) => {
                warn!(msg, "batch timed out; dropping {} tasks", batch.len());
            }
            Err(Error::OutOfMemory(msg)) if batch_size > 1 => {
                warn!(msg, "retrying batch at half size after memory pressure");
                batch_size = (batch_size / 2).max(1);
                continue;
            }
            Err(e) => return Err(e),
        }
        offset = end;
    }

    Ok(results)
}

fn low_memory(sys: &System) -> bool {
    let total = sys.total_memory().max(1);
    let available = sys.available_memory();
    (available as f64) / (total as f64) < 0.05
}

/// Runs one batch on a dedicated thread and waits up to `BATCH_TIMEOUT` for
/// it. Rust has no safe way to kill a running thread, so a timed-out batch
/// is left to finish in the background (its result is simply discarded when
/// it eventually arrives) while the caller moves on to the next batch. The
/// `rayon::ThreadPool` is shared across batches so straggler threads don't
/// multiply the worker count.
fn run_batch_with_timeout(
    pool: &Arc<rayon::ThreadPool>,
    bars: &BarTable,
    trading: &crate::config::TradingParams,
    batch: &[Task],
) -> Result<Vec<BacktestResult>, Error> {
    let (tx, rx) = mpsc::channel();
    let bars_owned = bars.clone();
    let trading_owned = trading.clone();
    let batch_owned: Vec<Task> = batch.to_vec();
    let pool_handle = pool.clone();

    let started = Instant::now();
    thread::spawn(move || {
        // One cache per batch, shared across every task in it: tasks that
        // probe the same (indicatorType, window, predictor) key — common
        // across a parameter sweep — compute that rolling series once.
        let cache = Mutex::new(RollingCache::new());
        // A per-task failure (e.g. a misconfigured predictor) becomes a
        // failed row in-place; it must never short-circuit the rest of the
        // batch the way a collected `Result<Vec<_>, _>` would.
        let result: Vec<BacktestResult> = pool_handle.install(|| {
            batch_owned
                .par_iter()
                .map(|task| run_task_isolated(&bars_owned, &trading_owned, task, &cache))
                .collect()
        });
        let _ = tx.send(result);
    });

    match rx.recv_timeout(BATCH_TIMEOUT) {
        Ok(result) => Ok(result),
        Err(_) => Err(Error::BatchTimeout(format!(
            "batch of {} tasks exceeded {:?} (elapsed {:?})",
            batch.len(),
            BATCH_TIMEOUT,
            started.elapsed()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{TradePrice, TradingParams};
    use chrono::{TimeZone, Utc};
    use qbt_indicators::enumerate;
    use std::collections::HashMap;

    fn table(n: usize) -> BarTable {
        let close: Vec<f64> = (0..n).map(|i| 100.0 + (i % 7) as f64).collect();
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

    fn strategy_config() -> StrategyConfig {
        let mut indicator_params = BTreeMap::new();
        let ma_cfg: BTreeMap<String, String> =
            [("ma_range".to_string(), "3:6:3".to_string())].into_iter().collect();
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
    fn enumerates_cross_product_of_entry_variants() {
        let bars = table(60);
        let strategy = strategy_config();
        let results = run_backtests(&bars, &strategy).unwrap();
        // 2 MA periods (3, 6) x 1 NDayCycle n-value
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r.predictor == "Close"));
    }

    #[test]
    fn a_misconfigured_predictor_fails_its_own_task_without_aborting_the_batch() {
        // One predictor name resolves to a real column, the other doesn't;
        // the batch must still return a row for both tasks instead of
        // short-circuiting the whole run on the bad one.
        let bars = table(60);
        let mut strategy = strategy_config();
        strategy.predictors = vec!["Close".to_string(), "NoSuchPredictor".to_string()];

        let results = run_backtests(&bars, &strategy).unwrap();
        assert_eq!(results.len(), 4, "2 predictors x 2 MA periods");

        let ok_rows: Vec<_> = results.iter().filter(|r| r.predictor == "Close").collect();
        let failed_rows: Vec<_> = results.iter().filter(|r| r.predictor == "NoSuchPredictor").collect();
        assert_eq!(ok_rows.len(), 2);
        assert_eq!(failed_rows.len(), 2);
        assert!(ok_rows.iter().all(|r| r.error.is_none()));
        assert!(failed_rows.iter().all(|r| r.error.is_some() && r.trades.is_empty()));
    }

    #[test]
    fn capacity_plan_never_zero() {
        let (workers, batch_size) = capacity_plan(10, 1000);
        assert!(workers >= 1);
        assert!(batch_size >= 1);
    }

    #[test]
    fn empty_enumeration_returns_empty_results_without_error() {
        // MA5-8's short < long filter rejects every combination here, so the
        // slot enumerates to zero IndicatorParams — a legitimate empty
        // search space, not a config error.
        let bars = table(60);
        let mut indicator_params = BTreeMap::new();
        let ma_cfg: BTreeMap<String, String> = [
            ("short_range".to_string(), "10:10:1".to_string()),
            ("long_range".to_string(), "5:5:1".to_string()),
        ]
        .into_iter()
        .collect();
        indicator_params.insert(
            StrategyConfig::slot_key("MA5", 1),
            enumerate("MA5", &ma_cfg).unwrap(),
        );
        let exit_cfg: BTreeMap<String, String> =
            [("ma_range".to_string(), "5:5:1".to_string())].into_iter().collect();
        indicator_params.insert(
            StrategyConfig::slot_key("MA1", 1),
            enumerate("MA1", &exit_cfg).unwrap(),
        );

        let strategy = StrategyConfig {
            condition_pairs: vec![ConditionPair {
                entry: vec!["MA5".to_string()],
                exit: vec!["MA1".to_string()],
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
        assert!(results.is_empty());
    }
}
