//! Pluggable reporters for run output.

use crate::config::BenchConfig;
use crate::generator::Rate;
use crate::model;
use crate::result::{RunResult, SuiteSummary};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Hooks called by a [`Bench`](crate::Bench) as runs progress.
pub trait Reporter: Send + Sync {
    /// Called before the workers of a run are spawned.
    fn run_start(&self, _concurrency: usize, _config: &BenchConfig) {}

    /// Called when a run completes.
    fn run_end(&self, _result: &RunResult) {}

    /// Called when an auto-run sequence completes.
    fn auto_run_end(&self, _results: &[RunResult]) {}
}

/// Console reporter that prints results to stderr.
pub struct ConsoleReporter {
    show_distribution: bool,
}

impl ConsoleReporter {
    pub fn new() -> Self {
        Self {
            show_distribution: false,
        }
    }

    /// Print the full latency distribution, not just the summary line.
    pub fn show_distribution(mut self, show: bool) -> Self {
        self.show_distribution = show;
        self
    }

    fn format_throughput(ops: f64) -> String {
        if ops >= 1_000_000.0 {
            format!("{:.2}M ops/s", ops / 1_000_000.0)
        } else if ops >= 1_000.0 {
            format!("{:.2}K ops/s", ops / 1_000.0)
        } else {
            format!("{:.0} ops/s", ops)
        }
    }
}

impl Default for ConsoleReporter {
    fn default() -> Self {
        Self::new()
    }
}

impl Reporter for ConsoleReporter {
    fn run_start(&self, concurrency: usize, config: &BenchConfig) {
        let rate = match config.rate {
            Rate::MaxThroughput => "max throughput".to_string(),
            Rate::Constant { hz } => format!("{hz} Hz"),
        };
        eprintln!(
            "  {:>4} workers, {} for {} ... ",
            concurrency,
            rate,
            format_duration(config.duration)
        );
    }

    fn run_end(&self, result: &RunResult) {
        eprintln!(
            "       {}  p50={} p99={} max={}  ({} ok, {} failed, {} errors)",
            Self::format_throughput(result.throughput()),
            format_duration(result.latency.value_at_percentile(50.0)),
            format_duration(result.p99()),
            format_duration(result.latency.max()),
            result.success,
            result.failure,
            result.errors.len()
        );
        for e in &result.errors {
            eprintln!("       error: {e:#}");
        }
        if self.show_distribution {
            for line in result.to_string().lines().skip(1) {
                eprintln!("         {line}");
            }
        }
    }

    fn auto_run_end(&self, results: &[RunResult]) {
        eprintln!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
        eprintln!("  Completed {} concurrency levels", results.len());
        match model::model(results) {
            Ok(usl) => eprintln!(
                "  USL: sigma={:.4} kappa={:.6} lambda={:.2}  peak ~{} workers",
                usl.sigma,
                usl.kappa,
                usl.lambda,
                usl.peak_concurrency()
            ),
            Err(e) => eprintln!("  USL: {e}"),
        }
        eprintln!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    }
}

/// JSON reporter that writes results to a directory.
pub struct JsonReporter {
    output_dir: PathBuf,
}

impl JsonReporter {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
        }
    }

    /// Write `results` as `<timestamp>.json` and `latest.json`, returning the
    /// timestamped path.
    pub fn write(&self, results: &[RunResult]) -> crate::Result<PathBuf> {
        let suite = SuiteSummary::new(results, model::model(results).ok());
        write_suite(&self.output_dir, &suite)
    }
}

impl Reporter for JsonReporter {
    fn auto_run_end(&self, results: &[RunResult]) {
        match self.write(results) {
            Ok(path) => eprintln!("  Results written to: {}", path.display()),
            Err(e) => eprintln!("Warning: failed to write JSON results: {}", e),
        }
    }
}

fn write_suite(output_dir: &Path, suite: &SuiteSummary) -> crate::Result<PathBuf> {
    std::fs::create_dir_all(output_dir)?;

    let json = serde_json::to_string_pretty(suite)?;
    let path = output_dir.join(format!("{}.json", suite.started_at));
    std::fs::write(&path, &json)?;
    std::fs::write(output_dir.join("latest.json"), &json)?;

    Ok(path)
}

pub(crate) fn format_duration(d: Duration) -> String {
    let secs = d.as_secs_f64();
    if secs >= 1.0 {
        format!("{:.2}s", secs)
    } else if secs >= 0.001 {
        format!("{:.2}ms", secs * 1_000.0)
    } else {
        format!("{:.2}us", secs * 1_000_000.0)
    }
}
