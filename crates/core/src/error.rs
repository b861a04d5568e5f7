use thiserror::Error;

/// Error kinds shared across the backtest and walk-forward pipelines.
///
/// `InvalidConfig` and `TooManyVariables` are fail-fast: callers must reject
/// them before any task executes. The rest are per-task or per-run failures
/// that populate a result's `error` field rather than aborting the caller.
#[derive(Error, Debug, Clone)]
pub enum Error {
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("missing column: {0}")]
    MissingColumn(String),

    #[error("too many variable parameters: {0}")]
    TooManyVariables(String),

    #[error("no signal: {0}")]
    NoSignal(String),

    #[error("batch timeout: {0}")]
    BatchTimeout(String),

    #[error("out of memory: {0}")]
    OutOfMemory(String),

    #[error("runtime error: {0}")]
    RuntimeError(String),
}

pub type Result<T> = std::result::Result<T, Error>;
