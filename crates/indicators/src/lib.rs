pub mod cache;
pub mod combiner;
pub mod params;
pub mod rolling;
pub mod signals;

pub use cache::RollingCache;
pub use combiner::{and_combine, derive_nday_cycle_exit};
pub use params::{enumerate, is_variable, parse_alias, parse_range_spec, Alias, IndicatorKind, IndicatorParams, ResolvedValue};
pub use signals::{generate, warmup};
