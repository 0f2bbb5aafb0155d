//! Concurrency escalation policies.
//!
//! A [`Step`] picks the next concurrency level from the previous run's
//! result. It is called once with `None` to get the first level, then once per
//! completed run. Returning `None` stops the sequence.
//!
//! Decorators wrap an inner step and either cut the sequence short
//! ([`MaxLatency`]) or observe it ([`Log`]).
//!
//! ```rust
//! use cntryl_load::{FixedStep, Step};
//! use std::time::Duration;
//!
//! // 1, 10, 20 ... 100, stopping early once p99 exceeds 25ms
//! let step = FixedStep::new(1, 100, 10)
//!     .max_latency(99.0, Duration::from_millis(25))
//!     .logged();
//! # let _ = step;
//! ```

use crate::result::RunResult;
use std::time::Duration;

/// Stop value for a [`Step`].
pub const STOP: Option<usize> = None;

/// Policy deciding the next concurrency level.
pub trait Step {
    /// Next level to run at given the last result, or `None` to stop.
    fn next_level(&mut self, last: Option<&RunResult>) -> Option<usize>;

    /// Stop once the latency at `percentile` exceeds `max`.
    fn max_latency(self, percentile: f64, max: Duration) -> MaxLatency<Self>
    where
        Self: Sized,
    {
        MaxLatency::new(percentile, max, self)
    }

    /// Log a summary of every completed level.
    fn logged(self) -> Log<Self>
    where
        Self: Sized,
    {
        Log::new(self)
    }
}

impl<S: Step + ?Sized> Step for &mut S {
    fn next_level(&mut self, last: Option<&RunResult>) -> Option<usize> {
        (**self).next_level(last)
    }
}

impl<S: Step + ?Sized> Step for Box<S> {
    fn next_level(&mut self, last: Option<&RunResult>) -> Option<usize> {
        (**self).next_level(last)
    }
}

/// Steps from `min` to `max` in increments of `increment`.
///
/// After the first level, each level is rounded down to a multiple of the
/// increment before stepping, so `FixedStep::new(1, 100, 10)` yields
/// `1, 10, 20, ..., 100`.
#[derive(Debug, Clone, Copy)]
pub struct FixedStep {
    min: usize,
    max: usize,
    increment: usize,
}

impl FixedStep {
    /// # Panics
    ///
    /// If `min` or `increment` is zero.
    pub fn new(min: usize, max: usize, increment: usize) -> Self {
        assert!(min > 0, "FixedStep minimum must be at least 1");
        assert!(increment > 0, "FixedStep increment must be at least 1");
        Self {
            min,
            max,
            increment,
        }
    }
}

impl Step for FixedStep {
    fn next_level(&mut self, last: Option<&RunResult>) -> Option<usize> {
        let Some(last) = last else {
            return Some(self.min);
        };
        if last.concurrency >= self.max {
            return STOP;
        }
        Some((last.concurrency / self.increment) * self.increment + self.increment)
    }
}

/// Stops the inner step once a latency percentile crosses a threshold.
#[derive(Debug, Clone)]
pub struct MaxLatency<S> {
    percentile: f64,
    max: Duration,
    inner: S,
}

impl<S: Step> MaxLatency<S> {
    /// `percentile` is in `0.0..=100.0`.
    pub fn new(percentile: f64, max: Duration, inner: S) -> Self {
        Self {
            percentile,
            max,
            inner,
        }
    }
}

impl<S: Step> Step for MaxLatency<S> {
    fn next_level(&mut self, last: Option<&RunResult>) -> Option<usize> {
        if let Some(r) = last {
            let observed = r.latency.value_at_percentile(self.percentile);
            if observed > self.max {
                tracing::debug!(
                    concurrency = r.concurrency,
                    ?observed,
                    max = ?self.max,
                    "latency threshold exceeded"
                );
                return STOP;
            }
        }
        self.inner.next_level(last)
    }
}

/// Logs throughput and p99 of every completed level, then defers to the
/// inner step.
#[derive(Debug, Clone)]
pub struct Log<S> {
    inner: S,
}

impl<S: Step> Log<S> {
    pub fn new(inner: S) -> Self {
        Self { inner }
    }
}

impl<S: Step> Step for Log<S> {
    fn next_level(&mut self, last: Option<&RunResult>) -> Option<usize> {
        if let Some(r) = last {
            tracing::info!(
                concurrency = r.concurrency,
                throughput = r.throughput(),
                p99_ms = r.p99().as_secs_f64() * 1000.0,
                "{}: {:.2} op/sec @ p99={:.3}ms",
                r.concurrency,
                r.throughput(),
                r.p99().as_secs_f64() * 1000.0
            );
        }
        self.inner.next_level(last)
    }
}

/// Walks an explicit list of levels, then stops.
#[derive(Debug, Clone)]
pub struct Levels {
    levels: std::vec::IntoIter<usize>,
}

impl Levels {
    pub fn new(levels: impl IntoIterator<Item = usize>) -> Self {
        Self {
            levels: levels.into_iter().collect::<Vec<_>>().into_iter(),
        }
    }
}

impl Step for Levels {
    fn next_level(&mut self, _last: Option<&RunResult>) -> Option<usize> {
        self.levels.next()
    }
}

/// A step backed by a closure. See [`from_fn`].
#[derive(Debug, Clone)]
pub struct FnStep<F>(F);

/// Wrap a closure as a [`Step`].
///
/// ```rust
/// use cntryl_load::step::{from_fn, Step};
///
/// // double until 64
/// let mut step = from_fn(|last| match last {
///     None => Some(1),
///     Some(r) if r.concurrency >= 64 => None,
///     Some(r) => Some(r.concurrency * 2),
/// });
/// assert_eq!(step.next_level(None), Some(1));
/// ```
pub fn from_fn<F>(f: F) -> FnStep<F>
where
    F: FnMut(Option<&RunResult>) -> Option<usize>,
{
    FnStep(f)
}

impl<F> Step for FnStep<F>
where
    F: FnMut(Option<&RunResult>) -> Option<usize>,
{
    fn next_level(&mut self, last: Option<&RunResult>) -> Option<usize> {
        (self.0)(last)
    }
}
