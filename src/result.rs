//! Run result types.

use crate::histogram::{Bracket, LatencyHistogram};
use crate::model::Usl;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Aggregated outcome of one run at a fixed concurrency level.
#[derive(Debug)]
pub struct RunResult {
    /// Number of workers requested.
    pub concurrency: usize,
    /// Wall time from the start barrier until the last worker finished,
    /// excluding warmup.
    pub elapsed: Duration,
    /// Operations that succeeded, summed over all workers.
    pub success: u64,
    /// Operations that failed, summed over all workers.
    pub failure: u64,
    /// Union of every worker's latency samples.
    pub latency: LatencyHistogram,
    /// Job-level errors, at most one per worker, in the order they arrived.
    pub errors: Vec<anyhow::Error>,
}

impl RunResult {
    /// Successful operations per second; zero if no time elapsed.
    pub fn throughput(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.success as f64 / secs
        } else {
            0.0
        }
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    /// 99th percentile latency.
    pub fn p99(&self) -> Duration {
        self.latency.value_at_percentile(99.0)
    }

    pub fn summary(&self) -> RunSummary {
        RunSummary::from(self)
    }
}

impl fmt::Display for RunResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{} successes, {} failures, {} errors, {:.2} ops/sec",
            self.success,
            self.failure,
            self.errors.len(),
            self.throughput()
        )?;
        for b in self.latency.cumulative_distribution() {
            writeln!(
                f,
                "p{:.6} = {:.3}ms",
                b.quantile * 100.0,
                b.value_at.as_secs_f64() * 1000.0
            )?;
        }
        Ok(())
    }
}

/// Serializable snapshot of a [`RunResult`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub concurrency: usize,
    #[serde(with = "duration_serde")]
    pub elapsed: Duration,
    pub success: u64,
    pub failure: u64,
    /// Job-level error messages
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
    /// Successful operations per second
    pub throughput: f64,
    #[serde(with = "duration_serde")]
    pub p50: Duration,
    #[serde(with = "duration_serde")]
    pub p90: Duration,
    #[serde(with = "duration_serde")]
    pub p99: Duration,
    #[serde(with = "duration_serde")]
    pub max: Duration,
    pub distribution: Vec<Bracket>,
}

impl From<&RunResult> for RunSummary {
    fn from(r: &RunResult) -> Self {
        Self {
            concurrency: r.concurrency,
            elapsed: r.elapsed,
            success: r.success,
            failure: r.failure,
            errors: r.errors.iter().map(|e| format!("{e:#}")).collect(),
            throughput: r.throughput(),
            p50: r.latency.value_at_percentile(50.0),
            p90: r.latency.value_at_percentile(90.0),
            p99: r.p99(),
            max: r.latency.max(),
            distribution: r.latency.cumulative_distribution(),
        }
    }
}

/// Results of a sequence of runs, e.g. one auto-run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuiteSummary {
    /// Unix timestamp in milliseconds when the suite was written
    pub started_at: String,
    pub runs: Vec<RunSummary>,
    /// Scalability model fitted to the runs, if one converged
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<Usl>,
}

impl SuiteSummary {
    pub fn new(results: &[RunResult], model: Option<Usl>) -> Self {
        Self {
            started_at: timestamp(),
            runs: results.iter().map(RunSummary::from).collect(),
            model,
        }
    }

    /// Load a suite summary from a JSON file.
    pub fn load(path: impl AsRef<std::path::Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Run with the highest throughput.
    pub fn peak(&self) -> Option<&RunSummary> {
        self.runs
            .iter()
            .max_by(|a, b| a.throughput.total_cmp(&b.throughput))
    }
}

fn timestamp() -> String {
    let now = std::time::SystemTime::now();
    let since_epoch = now
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    format!("{}", since_epoch.as_millis())
}

pub(crate) mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        d.as_nanos().serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let nanos = u128::deserialize(d)?;
        Ok(Duration::from_nanos(nanos as u64))
    }
}
