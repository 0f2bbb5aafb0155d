//! # cntryl-load
//!
//! A concurrent load generator for measuring how a system behaves as you push
//! more work through it.
//!
//! A job is a closure run once per worker. Inside, the job sets up whatever it
//! needs (a connection, a file handle) and hands an operation to its
//! [`Generator`], which calls it in a loop until the run's deadline, either as
//! fast as possible or at a fixed aggregate rate. Latencies land in an HDR
//! histogram; under a fixed rate, stalls are back-filled so the tail is not
//! hidden by coordinated omission.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use cntryl_load::{Bench, BenchConfig, Rate};
//! use std::time::Duration;
//!
//! let bench = Bench::new(
//!     BenchConfig::new()
//!         .duration(Duration::from_secs(5))
//!         .rate(Rate::constant(2_000.0)),
//! )?;
//!
//! let result = bench.run(8, |_worker, gen| {
//!     // Setup (not timed)
//!     let payload = vec![0u8; 4096];
//!
//!     gen.generate(|| {
//!         std::hint::black_box(&payload);
//!         Ok::<(), std::io::Error>(())
//!     })
//! });
//!
//! print!("{result}");
//! # Ok::<(), cntryl_load::Error>(())
//! ```
//!
//! [`Bench::auto_run`] repeats a run at each level a [`Step`] chooses, and
//! [`model::model`] fits the Universal Scalability Law to the results.

mod bench;
mod config;
mod error;
mod generator;
mod histogram;
pub mod model;
mod report;
mod result;
pub mod step;

pub use bench::Bench;
pub use config::BenchConfig;
pub use error::{Error, FitError, Result};
pub use generator::{Correction, Generator, Rate};
pub use histogram::{Bracket, LatencyHistogram};
pub use model::{Fitter, Sample, Usl, UslFitter};
pub use report::{ConsoleReporter, JsonReporter, Reporter};
pub use result::{RunResult, RunSummary, SuiteSummary};
pub use step::{FixedStep, Levels, Log, MaxLatency, Step, STOP};
