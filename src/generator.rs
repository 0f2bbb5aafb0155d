//! Rate-controlled operation loop.
//!
//! A [`Generator`] is handed to each worker's job. Calling
//! [`Generator::generate`] runs the job's operation over and over until the
//! run's deadline, recording every outcome into the worker's private
//! histogram and the run's shared success/failure counters.

use crate::histogram::LatencyHistogram;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// How fast each worker issues operations.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum Rate {
    /// Back-to-back operations with no throttling.
    ///
    /// Finds the saturation point, but latencies are optimistic under
    /// overload: a stalled worker simply takes fewer samples (coordinated
    /// omission).
    #[default]
    MaxThroughput,
    /// A fixed aggregate rate in operations per second, split evenly across
    /// workers. Missed ticks are compensated for in the histogram.
    Constant { hz: f64 },
}

impl Rate {
    pub fn constant(hz: f64) -> Self {
        Rate::Constant { hz }
    }

    /// Per-worker tick period for `concurrency` workers, if throttled.
    ///
    /// Saturates at [`Duration::MAX`] when the rate is too low to express.
    pub fn period(&self, concurrency: usize) -> Option<Duration> {
        match *self {
            Rate::MaxThroughput => None,
            Rate::Constant { hz } => {
                let secs = concurrency as f64 / hz;
                let period = Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX);
                Some(period.max(MIN_PERIOD))
            }
        }
    }
}

/// Expected interval used to back-fill samples for missed ticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Correction {
    /// Use the generator's own tick period.
    #[default]
    Period,
    /// Use a fixed interval regardless of rate.
    Interval(Duration),
    /// Record raw latencies only.
    Off,
}

const MIN_PERIOD: Duration = Duration::from_micros(1);

/// Rate policy resolved for one run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum Pacing {
    Unthrottled,
    Periodic {
        period: Duration,
        interval: Option<Duration>,
    },
}

impl Pacing {
    pub(crate) fn new(rate: Rate, correction: Correction, concurrency: usize) -> Self {
        match rate.period(concurrency) {
            None => Pacing::Unthrottled,
            Some(period) => Pacing::Periodic {
                period,
                interval: match correction {
                    Correction::Period => Some(period),
                    Correction::Interval(d) => Some(d),
                    Correction::Off => None,
                },
            },
        }
    }
}

/// Success and failure totals shared by every worker of a run.
#[derive(Debug, Default)]
pub(crate) struct Counters {
    success: AtomicU64,
    failure: AtomicU64,
}

impl Counters {
    /// Only meaningful once every worker has signalled completion.
    pub(crate) fn snapshot(&self) -> (u64, u64) {
        (
            self.success.load(Ordering::Acquire),
            self.failure.load(Ordering::Acquire),
        )
    }
}

/// Per-worker sink: a private histogram plus the run's shared counters.
#[derive(Debug)]
pub(crate) struct Recorder {
    latency: LatencyHistogram,
    counters: Arc<Counters>,
}

impl Recorder {
    pub(crate) fn new(latency: LatencyHistogram, counters: Arc<Counters>) -> Self {
        Self { latency, counters }
    }

    fn success(&mut self, elapsed: Duration, interval: Option<Duration>) {
        let recorded = match interval {
            Some(interval) => self.latency.record_corrected(elapsed, interval),
            None => self.latency.record(elapsed),
        };
        if let Err(e) = recorded {
            tracing::warn!(?elapsed, error = ?e, "dropping latency sample outside histogram range");
        }
        self.counters.success.fetch_add(1, Ordering::Release);
    }

    fn failure(&self) {
        self.counters.failure.fetch_add(1, Ordering::Release);
    }
}

/// Load generator owned by a single worker.
pub struct Generator {
    recorder: Recorder,
    pacing: Pacing,
    warmup: Duration,
    duration: Duration,
}

impl Generator {
    pub(crate) fn new(
        recorder: Recorder,
        pacing: Pacing,
        warmup: Duration,
        duration: Duration,
    ) -> Self {
        Self {
            recorder,
            pacing,
            warmup,
            duration,
        }
    }

    /// Tick period for throttled runs, `None` when unthrottled.
    pub fn period(&self) -> Option<Duration> {
        match self.pacing {
            Pacing::Unthrottled => None,
            Pacing::Periodic { period, .. } => Some(period),
        }
    }

    /// Run `op` repeatedly until the deadline passes.
    ///
    /// An `Err` from `op` counts as a failure and the loop carries on; it is
    /// never fatal. An operation in flight when the deadline passes is allowed
    /// to finish. Operations started during the warmup window are executed
    /// but not counted.
    ///
    /// Always returns `Ok(())`, so a job can end with `gen.generate(...)`.
    pub fn generate<F, E>(&mut self, mut op: F) -> anyhow::Result<()>
    where
        F: FnMut() -> Result<(), E>,
    {
        let warmed = Instant::now() + self.warmup;
        let deadline = warmed + self.duration;

        match self.pacing {
            Pacing::Unthrottled => loop {
                let start = Instant::now();
                if start >= deadline {
                    break;
                }
                let outcome = op();
                if start < warmed {
                    continue;
                }
                match outcome {
                    Ok(()) => self.recorder.success(start.elapsed(), None),
                    Err(_) => self.recorder.failure(),
                }
            },
            Pacing::Periodic { period, interval } => {
                let mut ticker = Ticker::new(period);
                while let Some(tick) = ticker.wait(deadline) {
                    let outcome = op();
                    if tick < warmed {
                        continue;
                    }
                    match outcome {
                        Ok(()) => self.recorder.success(tick.elapsed(), interval),
                        Err(_) => self.recorder.failure(),
                    }
                }
            }
        }
        Ok(())
    }

    pub(crate) fn into_latency(self) -> LatencyHistogram {
        self.recorder.latency
    }
}

/// Periodic timer whose missed ticks coalesce into one.
///
/// Ticks sit on a fixed grid `origin + k * period`. When the caller falls
/// behind, the first missed tick is delivered immediately and the rest are
/// dropped, so a slow operation costs throughput instead of triggering a
/// burst of catch-up calls.
#[derive(Debug)]
pub(crate) struct Ticker {
    origin: Instant,
    period: Duration,
    fired: u64,
}

impl Ticker {
    pub(crate) fn new(period: Duration) -> Self {
        Self {
            origin: Instant::now(),
            period: period.max(MIN_PERIOD),
            fired: 0,
        }
    }

    /// `None` when the tick lies beyond what an `Instant` can represent.
    fn at(&self, tick: u64) -> Option<Instant> {
        let nanos = self.period.as_nanos().saturating_mul(u128::from(tick));
        self.origin
            .checked_add(Duration::from_nanos(u64::try_from(nanos).ok()?))
    }

    /// Block until the next tick and return its scheduled instant, or return
    /// `None` once `deadline` passes first.
    pub(crate) fn wait(&mut self, deadline: Instant) -> Option<Instant> {
        let now = Instant::now();
        let Some(due) = self.at(self.fired + 1) else {
            std::thread::sleep(deadline.saturating_duration_since(now));
            return None;
        };

        if due > now {
            if due > deadline {
                std::thread::sleep(deadline.saturating_duration_since(now));
                return None;
            }
            std::thread::sleep(due - now);
            self.fired += 1;
            return Some(due);
        }

        if now >= deadline {
            return None;
        }
        let behind = now.duration_since(self.origin).as_nanos() / self.period.as_nanos();
        self.fired = u64::try_from(behind).unwrap_or(u64::MAX);
        Some(due)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn generator(pacing: Pacing, duration: Duration) -> (Generator, Arc<Counters>) {
        let counters = Arc::new(Counters::default());
        let latency =
            LatencyHistogram::new(Duration::from_micros(1), Duration::from_secs(10), 3).unwrap();
        let recorder = Recorder::new(latency, Arc::clone(&counters));
        (
            Generator::new(recorder, pacing, Duration::ZERO, duration),
            counters,
        )
    }

    #[test]
    fn should_split_rate_across_workers_when_constant() {
        let rate = Rate::constant(1000.0);
        assert_eq!(rate.period(10), Some(Duration::from_millis(10)));
        assert_eq!(rate.period(1), Some(Duration::from_millis(1)));
        assert_eq!(Rate::MaxThroughput.period(10), None);
    }

    #[test]
    fn should_floor_period_when_rate_is_huge() {
        assert_eq!(Rate::constant(1e12).period(1), Some(MIN_PERIOD));
    }

    #[test]
    fn should_saturate_period_when_rate_is_tiny() {
        assert_eq!(Rate::constant(1e-300).period(1), Some(Duration::MAX));
        assert_eq!(Rate::constant(1e-20).period(1000), Some(Duration::MAX));
    }

    #[test]
    fn should_resolve_correction_interval_when_throttled() {
        let p = Pacing::new(Rate::constant(100.0), Correction::Period, 1);
        assert_eq!(
            p,
            Pacing::Periodic {
                period: Duration::from_millis(10),
                interval: Some(Duration::from_millis(10))
            }
        );
        let p = Pacing::new(Rate::constant(100.0), Correction::Off, 1);
        assert!(matches!(p, Pacing::Periodic { interval: None, .. }));
        let p = Pacing::new(Rate::MaxThroughput, Correction::Period, 4);
        assert_eq!(p, Pacing::Unthrottled);
    }

    #[test]
    fn should_count_successes_when_unthrottled() {
        let (mut gen, counters) = generator(Pacing::Unthrottled, Duration::from_millis(50));
        gen.generate(|| Ok::<(), anyhow::Error>(())).unwrap();

        let (success, failure) = counters.snapshot();
        assert!(success > 0);
        assert_eq!(failure, 0);
        assert_eq!(gen.into_latency().len(), success);
    }

    #[test]
    fn should_count_failures_without_samples_when_op_errors() {
        let (mut gen, counters) = generator(Pacing::Unthrottled, Duration::from_millis(20));
        gen.generate(|| Err::<(), _>("boom")).unwrap();

        let (success, failure) = counters.snapshot();
        assert_eq!(success, 0);
        assert!(failure > 0);
        assert!(gen.into_latency().is_empty());
    }

    #[test]
    fn should_count_failures_without_samples_when_periodic_op_errors() {
        let pacing = Pacing::Periodic {
            period: Duration::from_millis(5),
            interval: Some(Duration::from_millis(5)),
        };
        let (mut gen, counters) = generator(pacing, Duration::from_millis(50));
        gen.generate(|| Err::<(), _>("boom")).unwrap();

        let (success, failure) = counters.snapshot();
        assert_eq!(success, 0);
        assert!(failure > 0);
        assert!(gen.into_latency().is_empty());
    }

    #[test]
    fn should_count_success_but_drop_sample_when_latency_out_of_range() {
        let counters = Arc::new(Counters::default());
        let latency =
            LatencyHistogram::new(Duration::from_micros(1), Duration::from_millis(1), 3).unwrap();
        let recorder = Recorder::new(latency, Arc::clone(&counters));
        let mut gen = Generator::new(
            recorder,
            Pacing::Unthrottled,
            Duration::ZERO,
            Duration::from_millis(20),
        );

        gen.generate(|| {
            std::thread::sleep(Duration::from_millis(5));
            Ok::<(), anyhow::Error>(())
        })
        .unwrap();

        let (success, failure) = counters.snapshot();
        assert!(success > 1, "loop must keep going after a dropped sample");
        assert_eq!(failure, 0);
        assert_eq!(gen.into_latency().len(), 0);
    }

    #[test]
    fn should_stop_without_ticking_when_period_is_unrepresentable() {
        let mut ticker = Ticker::new(Duration::MAX);
        let deadline = Instant::now() + Duration::from_millis(10);
        assert_eq!(ticker.wait(deadline), None);
    }

    #[test]
    fn should_cap_operations_at_tick_count_when_periodic() {
        let pacing = Pacing::Periodic {
            period: Duration::from_millis(10),
            interval: Some(Duration::from_millis(10)),
        };
        let (mut gen, counters) = generator(pacing, Duration::from_millis(200));
        gen.generate(|| Ok::<(), anyhow::Error>(())).unwrap();

        let (success, _) = counters.snapshot();
        assert!(success <= 20, "ran {success} ops in 20 ticks");
        assert!(success >= 10);
    }

    #[test]
    fn should_skip_uncounted_ops_when_warming_up() {
        let counters = Arc::new(Counters::default());
        let latency =
            LatencyHistogram::new(Duration::from_micros(1), Duration::from_secs(10), 3).unwrap();
        let recorder = Recorder::new(latency, Arc::clone(&counters));
        let mut gen = Generator::new(
            recorder,
            Pacing::Unthrottled,
            Duration::from_millis(30),
            Duration::from_millis(30),
        );

        let mut calls = 0u64;
        gen.generate(|| {
            calls += 1;
            std::thread::sleep(Duration::from_millis(1));
            Ok::<(), anyhow::Error>(())
        })
        .unwrap();

        let (success, _) = counters.snapshot();
        assert!(success > 0);
        assert!(calls > success, "warmup calls must not be counted");
    }

    #[test]
    fn should_backfill_missed_ticks_when_op_overruns_period() {
        let pacing = Pacing::Periodic {
            period: Duration::from_millis(5),
            interval: Some(Duration::from_millis(5)),
        };
        let (mut gen, counters) = generator(pacing, Duration::from_millis(60));
        gen.generate(|| {
            std::thread::sleep(Duration::from_millis(20));
            Ok::<(), anyhow::Error>(())
        })
        .unwrap();

        let (success, _) = counters.snapshot();
        assert!(success > 0);
        // each 20ms sample carries synthetic fill-ins for the ticks it blocked
        assert!(gen.into_latency().len() > success);
    }

    #[test]
    fn should_coalesce_missed_ticks_when_caller_falls_behind() {
        let period = Duration::from_millis(100);
        let mut ticker = Ticker::new(period);
        let deadline = Instant::now() + Duration::from_secs(5);

        let first = ticker.wait(deadline).unwrap();
        std::thread::sleep(Duration::from_millis(350));

        let before = Instant::now();
        let second = ticker.wait(deadline).unwrap();
        assert!(before.elapsed() < Duration::from_millis(20));
        assert_eq!(second - first, period);

        let third = ticker.wait(deadline).unwrap();
        assert_eq!(third - first, period * 4);
    }

    #[test]
    fn should_stop_ticking_when_deadline_passes() {
        let mut ticker = Ticker::new(Duration::from_millis(50));
        let deadline = Instant::now() + Duration::from_millis(20);
        assert_eq!(ticker.wait(deadline), None);
        assert!(Instant::now() >= deadline);
    }
}
