pub mod engine;
pub mod optimizer;
pub mod window;

pub use engine::{run_walk_forward, WfaResult};
pub use optimizer::{select_grid_region, validate_variable_count, GridCell, GridPoint, GridRegion};
pub use window::{plan_windows, Window};
