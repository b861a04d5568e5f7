pub mod config;
pub mod engine;
pub mod metrics;
pub mod simulator;
pub mod wfa;

#[cfg(test)]
mod tests;

pub use config::{
    ConditionPair, Objective, StrategyConfig, TradePrice, TradingParams, WfaConfig, WfaMode,
};
pub use engine::{capacity_plan, run_backtests, BacktestResult};
pub use metrics::{compute_metrics, periods_per_year, PerformanceMetrics};
pub use simulator::{simulate, PositionType, TradeRecord};
pub use wfa::{run_walk_forward, WfaResult};
