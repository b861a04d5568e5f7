use std::collections::BTreeMap;

use qbt_core::error::Error;
use qbt_indicators::IndicatorParams;
use serde::{Deserialize, Serialize};

/// Which bar-table column a trade executes at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradePrice {
    Open,
    Close,
}

/// `(transactionCost, slippage, tradeDelay, tradePrice)` — all four required.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradingParams {
    pub transaction_cost: f64,
    pub slippage: f64,
    pub trade_delay: usize,
    pub trade_price: TradePrice,
}

impl TradingParams {
    pub fn validate(&self) -> Result<(), Error> {
        if self.transaction_cost < 0.0 || self.slippage < 0.0 {
            return Err(Error::InvalidConfig(
                "transactionCost and slippage must be >= 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// `(entry: list<alias>, exit: list<alias>)`. `len(entry) >= 1`. NDayCycle
/// aliases may appear only in `exit`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConditionPair {
    pub entry: Vec<String>,
    pub exit: Vec<String>,
}

impl ConditionPair {
    pub fn validate(&self) -> Result<(), Error> {
        if self.entry.is_empty() {
            return Err(Error::InvalidConfig(
                "ConditionPair.entry must contain at least one alias".to_string(),
            ));
        }
        for alias in &self.entry {
            if alias.starts_with("NDayCycle") {
                return Err(Error::InvalidConfig(format!(
                    "NDayCycle alias '{alias}' may only appear in the exit slot"
                )));
            }
        }
        let nday_count = self.exit.iter().filter(|a| a.starts_with("NDayCycle")).count();
        if nday_count > 0 && (nday_count > 1 || self.exit.len() > 1) {
            return Err(Error::InvalidConfig(
                "an NDayCycle exit alias must be the sole exit condition".to_string(),
            ));
        }
        Ok(())
    }
}

/// One logical strategy-configuration document for a backtest run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyConfig {
    pub condition_pairs: Vec<ConditionPair>,
    /// Keyed `"{alias}_strategy_{s}"` (`s` is 1-based).
    pub indicator_params: BTreeMap<String, Vec<IndicatorParams>>,
    pub predictors: Vec<String>,
    pub trading_params: TradingParams,
}

impl StrategyConfig {
    pub fn slot_key(alias: &str, strategy_index: usize) -> String {
        format!("{alias}_strategy_{strategy_index}")
    }

    pub fn validate(&self) -> Result<(), Error> {
        self.trading_params.validate()?;
        for pair in &self.condition_pairs {
            pair.validate()?;
        }
        if self.predictors.is_empty() {
            return Err(Error::InvalidConfig(
                "at least one predictor column is required".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WfaMode {
    Standard,
    Anchored,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Objective {
    Sharpe,
    Calmar,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WfaConfig {
    pub mode: WfaMode,
    pub train_set_percentage: f64,
    pub test_set_percentage: f64,
    pub step_size: usize,
    pub optimization_objectives: Vec<Objective>,
    pub output_csv: bool,
}

impl WfaConfig {
    pub fn validate(&self) -> Result<(), Error> {
        let in_unit_range = |p: f64| p > 0.0 && p <= 1.0;
        if !in_unit_range(self.train_set_percentage) || !in_unit_range(self.test_set_percentage) {
            return Err(Error::InvalidConfig(
                "train/test set percentages must be in (0,1]".to_string(),
            ));
        }
        if self.train_set_percentage + self.test_set_percentage > 1.0 {
            return Err(Error::InvalidConfig(
                "train + test percentage must not exceed 1.0".to_string(),
            ));
        }
        if self.step_size == 0 {
            return Err(Error::InvalidConfig("stepSize must be >= 1".to_string()));
        }
        Ok(())
    }
}
