pub mod bar;
pub mod error;
pub mod ids;
pub mod stats;

pub use bar::{BarTable, Frequency};
pub use error::{Error, Result};
pub use ids::{BacktestId, ParameterSetId, TradeGroupId};
