//! Configuration for a load bench.

use crate::error::{Error, Result};
use crate::generator::{Correction, Rate};
use std::path::PathBuf;
use std::time::Duration;

/// Configuration shared by every run of a [`Bench`](crate::Bench).
#[derive(Debug, Clone)]
pub struct BenchConfig {
    /// Measured length of each run.
    pub duration: Duration,
    /// Unmeasured lead-in at the start of each worker's loop.
    pub warmup: Duration,
    /// Lowest latency the histogram distinguishes.
    pub min_latency: Duration,
    /// Highest latency the histogram records; slower samples are dropped.
    pub max_latency: Duration,
    /// Histogram precision in significant decimal digits (0-5).
    pub significant_digits: u8,
    /// Operation rate policy.
    pub rate: Rate,
    /// Coordinated omission correction for throttled runs.
    pub correction: Correction,
    /// Give up on workers this long after their deadline (waits forever if unset).
    pub grace: Option<Duration>,
    /// Print results to stderr.
    pub verbose: bool,
    /// Write JSON results here.
    pub output_dir: Option<PathBuf>,
}

impl Default for BenchConfig {
    fn default() -> Self {
        Self {
            duration: Duration::from_secs(10),
            warmup: Duration::ZERO,
            min_latency: Duration::from_micros(1),
            max_latency: Duration::from_secs(60),
            significant_digits: 3,
            rate: Rate::MaxThroughput,
            correction: Correction::Period,
            grace: None,
            verbose: false,
            output_dir: None,
        }
    }
}

impl BenchConfig {
    /// Create a new config with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse config from environment variables.
    ///
    /// Supported variables:
    /// - `LOAD_DURATION_MS`: measured run length (default: 10000)
    /// - `LOAD_WARMUP_MS`: warmup per run (default: 0)
    /// - `LOAD_MIN_LATENCY_US`: histogram floor (default: 1)
    /// - `LOAD_MAX_LATENCY_US`: histogram ceiling (default: 60000000)
    /// - `LOAD_SIGFIG`: histogram significant digits (default: 3)
    /// - `LOAD_RATE_HZ`: aggregate constant rate (default: unthrottled)
    /// - `LOAD_GRACE_MS`: watchdog grace period
    /// - `LOAD_VERBOSE`: print results (default: false)
    /// - `LOAD_OUTPUT_DIR`: directory for JSON results
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Self {
        let mut cfg = Self::default();
        let millis = |key: &str| {
            var(key)
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_millis)
        };
        let micros = |key: &str| {
            var(key)
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_micros)
        };

        if let Some(d) = millis("LOAD_DURATION_MS") {
            cfg.duration = d;
        }
        if let Some(d) = millis("LOAD_WARMUP_MS") {
            cfg.warmup = d;
        }
        if let Some(d) = micros("LOAD_MIN_LATENCY_US") {
            cfg.min_latency = d;
        }
        if let Some(d) = micros("LOAD_MAX_LATENCY_US") {
            cfg.max_latency = d;
        }
        if let Some(n) = var("LOAD_SIGFIG").and_then(|v| v.parse().ok()) {
            cfg.significant_digits = n;
        }
        if let Some(hz) = var("LOAD_RATE_HZ").and_then(|v| v.parse::<f64>().ok()) {
            cfg.rate = Rate::constant(hz);
        }
        if let Some(d) = millis("LOAD_GRACE_MS") {
            cfg.grace = Some(d);
        }
        if let Some(v) = var("LOAD_VERBOSE") {
            cfg.verbose = v != "0" && !v.eq_ignore_ascii_case("false");
        }
        if let Some(v) = var("LOAD_OUTPUT_DIR") {
            cfg.output_dir = Some(PathBuf::from(v));
        }

        cfg
    }

    /// Set the measured run length.
    pub fn duration(mut self, d: Duration) -> Self {
        self.duration = d;
        self
    }

    /// Set the warmup.
    pub fn warmup(mut self, d: Duration) -> Self {
        self.warmup = d;
        self
    }

    /// Set the histogram range.
    pub fn latency_range(mut self, min: Duration, max: Duration) -> Self {
        self.min_latency = min;
        self.max_latency = max;
        self
    }

    /// Set histogram precision.
    pub fn significant_digits(mut self, n: u8) -> Self {
        self.significant_digits = n;
        self
    }

    /// Set the rate policy.
    pub fn rate(mut self, rate: Rate) -> Self {
        self.rate = rate;
        self
    }

    /// Set coordinated omission correction.
    pub fn correction(mut self, correction: Correction) -> Self {
        self.correction = correction;
        self
    }

    /// Enable the watchdog.
    pub fn grace(mut self, grace: Duration) -> Self {
        self.grace = Some(grace);
        self
    }

    /// Set verbose output.
    pub fn verbose(mut self, v: bool) -> Self {
        self.verbose = v;
        self
    }

    /// Set the JSON output directory.
    pub fn output_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.output_dir = Some(path.into());
        self
    }

    /// Check the config for values no run could honour.
    pub fn validate(&self) -> Result<()> {
        if self.duration.is_zero() {
            return Err(Error::InvalidConfig("duration must be non-zero".into()));
        }
        if self.min_latency < Duration::from_micros(1) {
            return Err(Error::InvalidConfig(format!(
                "min_latency must be at least 1us, got {:?}",
                self.min_latency
            )));
        }
        if self.max_latency < self.min_latency * 2 {
            return Err(Error::InvalidConfig(format!(
                "max_latency ({:?}) must be at least twice min_latency ({:?})",
                self.max_latency, self.min_latency
            )));
        }
        if self.significant_digits > 5 {
            return Err(Error::InvalidConfig(format!(
                "significant_digits must be at most 5, got {}",
                self.significant_digits
            )));
        }
        if let Rate::Constant { hz } = self.rate {
            if !hz.is_finite() || hz <= 0.0 {
                return Err(Error::InvalidConfig(format!(
                    "constant rate must be a positive number of Hz, got {hz}"
                )));
            }
            if Duration::try_from_secs_f64(1.0 / hz).is_err() {
                return Err(Error::InvalidConfig(format!(
                    "constant rate of {hz} Hz is too low for a tick period"
                )));
            }
        }
        Ok(())
    }
}
