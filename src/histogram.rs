//! HDR latency histogram, in microseconds.
//!
//! Thin wrapper around [`hdrhistogram::Histogram`] that speaks [`Duration`]
//! instead of raw integers. Every histogram in a run is created from the same
//! template, so merging two of them can never fail on range mismatches.

use crate::error::{Error, Result};
use hdrhistogram::{AdditionError, Histogram, RecordError};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// A latency distribution recorded at microsecond resolution.
#[derive(Debug, Clone)]
pub struct LatencyHistogram {
    inner: Histogram<u64>,
}

/// One step of the cumulative latency distribution.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bracket {
    /// Fraction of samples at or below `value_at`, in `[0, 1]`.
    pub quantile: f64,
    /// Highest latency in this bracket.
    #[serde(with = "crate::result::duration_serde")]
    pub value_at: Duration,
    /// Samples added since the previous bracket.
    pub count: u64,
}

impl LatencyHistogram {
    /// Create an empty histogram tracking `[min, max]` with the given number of
    /// significant decimal digits (at most 5).
    pub fn new(min: Duration, max: Duration, significant_digits: u8) -> Result<Self> {
        let inner = Histogram::new_with_bounds(micros(min), micros(max), significant_digits)
            .map_err(Error::Histogram)?;
        Ok(Self { inner })
    }

    /// An empty histogram with the same range and precision as `self`.
    pub fn empty_copy(&self) -> Self {
        Self {
            inner: Histogram::new_from(&self.inner),
        }
    }

    /// Record one latency sample.
    pub fn record(&mut self, latency: Duration) -> std::result::Result<(), RecordError> {
        self.inner.record(micros(latency))
    }

    /// Record one sample and back-fill the samples that would have been taken
    /// every `expected_interval` while this one was outstanding.
    pub fn record_corrected(
        &mut self,
        latency: Duration,
        expected_interval: Duration,
    ) -> std::result::Result<(), RecordError> {
        self.inner
            .record_correct(micros(latency), micros(expected_interval))
    }

    /// Add every sample of `other` into `self`.
    pub fn merge(&mut self, other: &LatencyHistogram) -> std::result::Result<(), AdditionError> {
        self.inner.add(&other.inner)
    }

    /// Number of recorded samples.
    pub fn len(&self) -> u64 {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Latency at `quantile` (`0.0..=1.0`).
    pub fn value_at_quantile(&self, quantile: f64) -> Duration {
        Duration::from_micros(self.inner.value_at_quantile(quantile))
    }

    /// Latency at `percentile` (`0.0..=100.0`).
    pub fn value_at_percentile(&self, percentile: f64) -> Duration {
        Duration::from_micros(self.inner.value_at_percentile(percentile))
    }

    pub fn min(&self) -> Duration {
        Duration::from_micros(self.inner.min())
    }

    pub fn max(&self) -> Duration {
        Duration::from_micros(self.inner.max())
    }

    pub fn mean(&self) -> Duration {
        Duration::from_secs_f64(self.inner.mean() / 1_000_000.0)
    }

    /// Cumulative distribution, one bracket per halving of the remaining tail.
    pub fn cumulative_distribution(&self) -> Vec<Bracket> {
        self.inner
            .iter_quantiles(1)
            .map(|v| Bracket {
                quantile: v.quantile_iterated_to(),
                value_at: Duration::from_micros(v.value_iterated_to()),
                count: v.count_since_last_iteration(),
            })
            .collect()
    }
}

fn micros(d: Duration) -> u64 {
    u64::try_from(d.as_micros()).unwrap_or(u64::MAX)
}
