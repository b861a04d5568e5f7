use chrono::{DateTime, Utc};
use qbt_core::error::Error;
use qbt_core::ids::{BacktestId, TradeGroupId};
use qbt_core::BarTable;
use serde::{Deserialize, Serialize};

use crate::config::{ConditionPair, TradePrice, TradingParams};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionType {
    None,
    NewLong,
    NewShort,
    CloseLong,
    CloseShort,
}

/// One row per bar. Schema fixed by spec.md §3.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeRecord {
    pub time: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub trading_instrument: String,
    pub position_type: PositionType,
    pub open_price: Option<f64>,
    pub close_price: Option<f64>,
    pub position_size: i8,
    pub r#return: f64,
    pub trade_group_id: Option<String>,
    pub trade_action: u8,
    pub open_time: Option<DateTime<Utc>>,
    pub close_time: Option<DateTime<Utc>>,
    pub parameter_set_id: String,
    pub equity_value: f64,
    pub transaction_cost: f64,
    pub slippage_cost: f64,
    pub predictor_value: f64,
    pub entry_signal: i8,
    pub exit_signal: i8,
    pub holding_period_count: u32,
    pub holding_period: Option<i64>,
    pub trade_return: Option<f64>,
    pub backtest_id: String,
}

fn trade_price_column<'a>(bars: &'a BarTable, choice: TradePrice) -> &'a [f64] {
    match choice {
        TradePrice::Open => &bars.open,
        TradePrice::Close => &bars.close,
    }
}

/// Bar-by-bar `Flat -> Long/Short -> Flat` state machine (spec.md §4.4).
/// `entry`/`exit` are the already-combined, already-delay-unaware sequences;
/// delay is applied here via `trade_delay` by sampling `t - delay` (clamped
/// to 0).
pub fn simulate(
    bars: &BarTable,
    entry: &[i8],
    exit: &[i8],
    predictor: &[f64],
    predictor_name: &str,
    trading_params: &TradingParams,
    parameter_set_id: &str,
    backtest_id: &BacktestId,
) -> Result<Vec<TradeRecord>, Error> {
    let n = bars.len();
    if entry.len() != n || exit.len() != n {
        return Err(Error::RuntimeError(
            "entry/exit signal length does not match bar table".to_string(),
        ));
    }
    let price_col = trade_price_column(bars, trading_params.trade_price);

    let mut records = Vec::with_capacity(n);
    let mut equity = 1.0f64;
    let mut position_size_prev: i8 = 0;
    let mut open_price: f64 = 0.0;
    let mut open_time: Option<DateTime<Utc>> = None;
    let mut group_id: Option<TradeGroupId> = None;
    let mut holding_count: u32 = 0;

    for t in 0..n {
        let delayed = t.saturating_sub(trading_params.trade_delay);
        let e = entry[delayed];
        let x = exit[delayed];
        let price = price_col[t];

        // Bar return accrues from the position carried INTO this bar.
        let ret = if t > 0 && position_size_prev != 0 {
            let prev_close = bars.close[t - 1];
            if prev_close != 0.0 {
                (bars.close[t] - prev_close) / prev_close * position_size_prev as f64
            } else {
                0.0
            }
        } else {
            0.0
        };
        equity *= 1.0 + ret;

        let mut action = 0u8;
        let mut position_type = PositionType::None;
        let mut position_size_cur = position_size_prev;
        let mut cost_applied = 0.0;
        let mut slippage_applied = 0.0;
        let mut trade_return = None;
        let mut holding_period = None;
        let mut rec_open_price = None;
        let mut rec_close_price = None;
        let mut rec_open_time = open_time;
        let mut rec_close_time = None;
        let mut rec_group_id = group_id.as_ref().map(|g| g.to_string());

        match position_size_prev {
            0 => {
                if e == 1 {
                    action = 1;
                    position_type = PositionType::NewLong;
                    position_size_cur = 1;
                    open_price = price;
                    open_time = Some(bars.time[t]);
                    let new_group = TradeGroupId::from_seed(backtest_id, t);
                    group_id = Some(new_group);
                    rec_group_id = group_id.as_ref().map(|g| g.to_string());
                    rec_open_price = Some(price);
                    rec_open_time = open_time;
                    equity *= (1.0 - trading_params.slippage) * (1.0 - trading_params.transaction_cost);
                    cost_applied = trading_params.transaction_cost;
                    slippage_applied = trading_params.slippage;
                } else if e == -1 {
                    action = 1;
                    position_type = PositionType::NewShort;
                    position_size_cur = -1;
                    open_price = price;
                    open_time = Some(bars.time[t]);
                    let new_group = TradeGroupId::from_seed(backtest_id, t);
                    group_id = Some(new_group);
                    rec_group_id = group_id.as_ref().map(|g| g.to_string());
                    rec_open_price = Some(price);
                    rec_open_time = open_time;
                    equity *= (1.0 - trading_params.slippage) * (1.0 - trading_params.transaction_cost);
                    cost_applied = trading_params.transaction_cost;
                    slippage_applied = trading_params.slippage;
                }
            }
            1 => {
                if x == -1 {
                    action = 4;
                    position_type = PositionType::CloseLong;
                    position_size_cur = 0;
                    rec_close_price = Some(price);
                    rec_close_time = Some(bars.time[t]);
                    equity *= (1.0 - trading_params.slippage) * (1.0 - trading_params.transaction_cost);
                    cost_applied = trading_params.transaction_cost;
                    slippage_applied = trading_params.slippage;
                    trade_return = Some((price - open_price) / open_price * 100.0);
                    holding_period = Some(holding_period_days(open_time, Some(bars.time[t])));
                    rec_open_price = Some(open_price);
                }
            }
            -1 => {
                if x == 1 {
                    action = 4;
                    position_type = PositionType::CloseShort;
                    position_size_cur = 0;
                    rec_close_price = Some(price);
                    rec_close_time = Some(bars.time[t]);
                    equity *= (1.0 - trading_params.slippage) * (1.0 - trading_params.transaction_cost);
                    cost_applied = trading_params.transaction_cost;
                    slippage_applied = trading_params.slippage;
                    trade_return = Some(-(price - open_price) / open_price * 100.0);
                    holding_period = Some(holding_period_days(open_time, Some(bars.time[t])));
                    rec_open_price = Some(open_price);
                }
            }
            _ => unreachable!("position size is always -1, 0, or 1"),
        }

        // Incremented from the position carried INTO this bar, not the
        // post-action one: the open bar itself is count 0, not 1.
        holding_count = if action != 4 && position_size_prev != 0 {
            holding_count + 1
        } else {
            0
        };

        if action == 4 {
            // Round trip complete: clear carried-open state.
            open_time = None;
        }

        records.push(TradeRecord {
            time: bars.time[t],
            open: bars.open[t],
            high: bars.high[t],
            low: bars.low[t],
            close: bars.close[t],
            trading_instrument: predictor_name.to_string(),
            position_type,
            open_price: rec_open_price,
            close_price: rec_close_price,
            position_size: position_size_cur,
            r#return: ret,
            trade_group_id: rec_group_id,
            trade_action: action,
            open_time: rec_open_time,
            close_time: rec_close_time,
            parameter_set_id: parameter_set_id.to_string(),
            equity_value: equity * 100.0,
            transaction_cost: cost_applied,
            slippage_cost: slippage_applied,
            predictor_value: predictor[t],
            entry_signal: e,
            exit_signal: x,
            holding_period_count: holding_count,
            holding_period,
            trade_return,
            backtest_id: backtest_id.to_string(),
        });

        position_size_prev = position_size_cur;
    }

    Ok(records)
}

fn holding_period_days(open_time: Option<DateTime<Utc>>, close_time: Option<DateTime<Utc>>) -> i64 {
    match (open_time, close_time) {
        (Some(o), Some(c)) => ((c - o).num_seconds() as f64 / 86400.0).floor().max(1.0) as i64,
        _ => 1,
    }
}

/// Every entry alias must resolve and every exit alias must resolve;
/// `NDayCycle` aliases are validated at `ConditionPair` construction.
pub fn validate_condition_pair(pair: &ConditionPair) -> Result<(), Error> {
    pair.validate()
}
