//! Error types.

use thiserror::Error;

/// Errors raised by the load engine.
#[derive(Error, Debug)]
pub enum Error {
    /// Rejected configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The latency histogram could not be created with the configured bounds.
    #[error("invalid latency histogram bounds: {0:?}")]
    Histogram(hdrhistogram::CreationError),

    /// A worker panicked instead of returning from its job.
    #[error("worker {worker} panicked: {message}")]
    WorkerPanicked { worker: usize, message: String },

    /// The OS refused to start a worker thread.
    #[error("failed to spawn worker {worker}: {source}")]
    Spawn {
        worker: usize,
        source: std::io::Error,
    },

    /// A worker was still running when the watchdog gave up on it.
    #[error("worker {worker} did not finish within {grace:?} of its deadline")]
    WorkerTimedOut {
        worker: usize,
        grace: std::time::Duration,
    },

    /// Scalability model could not be fitted.
    #[error("model fit failed: {0}")]
    Fit(#[from] FitError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Reasons a scalability fit is refused.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FitError {
    #[error("need at least {required} distinct concurrency levels, got {distinct}")]
    TooFewLevels { distinct: usize, required: usize },

    #[error("concurrency level {concurrency} has no throughput")]
    ZeroThroughput { concurrency: f64 },

    #[error("samples do not determine a unique curve")]
    Singular,

    #[error("fit is not physical (lambda={lambda}, sigma={sigma}, kappa={kappa})")]
    NonPhysical { lambda: f64, sigma: f64, kappa: f64 },
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
