//! The bench: runs a job across workers and escalates concurrency.

use crate::config::BenchConfig;
use crate::error::{Error, Result};
use crate::generator::{Counters, Generator, Pacing, Recorder};
use crate::histogram::LatencyHistogram;
use crate::report::{ConsoleReporter, JsonReporter, Reporter};
use crate::result::RunResult;
use crate::step::Step;
use std::any::Any;
use std::collections::HashSet;
use std::sync::mpsc;
use std::sync::{Arc, Barrier};
use std::thread::{self, JoinHandle};
use std::time::Instant;

/// A bench drives a job at one or more concurrency levels.
///
/// # Example
///
/// ```rust,no_run
/// use cntryl_load::{Bench, BenchConfig, FixedStep, Step};
/// use std::time::Duration;
///
/// let bench = Bench::new(
///     BenchConfig::new()
///         .duration(Duration::from_secs(10))
///         .latency_range(Duration::from_micros(1), Duration::from_secs(60)),
/// )?;
///
/// // 1, 10, 20 ... 90, 100
/// let results = bench.auto_run(FixedStep::new(1, 100, 10).logged(), |_id, gen| {
///     gen.generate(|| {
///         std::thread::sleep(Duration::from_millis(1));
///         Ok::<(), std::io::Error>(())
///     })
/// });
///
/// for r in &results {
///     println!("{} workers: {:.0} op/s, p99 {:?}", r.concurrency, r.throughput(), r.p99());
/// }
/// # Ok::<(), cntryl_load::Error>(())
/// ```
pub struct Bench {
    config: BenchConfig,
    template: LatencyHistogram,
    reporters: Vec<Box<dyn Reporter>>,
}

/// What a worker hands back when its job returns.
struct Finished {
    worker: usize,
    outcome: anyhow::Result<()>,
    latency: LatencyHistogram,
}

impl Bench {
    /// Create a bench, validating the config.
    ///
    /// Installs a [`ConsoleReporter`] when `config.verbose` is set and a
    /// [`JsonReporter`] when `config.output_dir` is set.
    pub fn new(config: BenchConfig) -> Result<Self> {
        config.validate()?;
        let template = LatencyHistogram::new(
            config.min_latency,
            config.max_latency,
            config.significant_digits,
        )?;

        let mut reporters: Vec<Box<dyn Reporter>> = Vec::new();
        if config.verbose {
            reporters.push(Box::new(ConsoleReporter::new()));
        }
        if let Some(dir) = &config.output_dir {
            reporters.push(Box::new(JsonReporter::new(dir.clone())));
        }

        Ok(Self {
            config,
            template,
            reporters,
        })
    }

    /// Create a bench with config from environment.
    pub fn from_env() -> Result<Self> {
        Self::new(BenchConfig::from_env())
    }

    pub fn config(&self) -> &BenchConfig {
        &self.config
    }

    /// Replace reporters with a custom set.
    pub fn reporters(&mut self, reporters: Vec<Box<dyn Reporter>>) -> &mut Self {
        self.reporters = reporters;
        self
    }

    /// Add an additional reporter.
    pub fn add_reporter(&mut self, reporter: Box<dyn Reporter>) -> &mut Self {
        self.reporters.push(reporter);
        self
    }

    /// Run `job` once on each of `concurrency` workers.
    ///
    /// Every worker gets its own [`Generator`] and waits at a start barrier;
    /// the clock starts when the last one arrives and stops when the last one
    /// finishes. Errors returned by the job, worker panics and watchdog
    /// timeouts all land in [`RunResult::errors`]; the run itself never fails.
    /// If a worker thread cannot be spawned, the run goes ahead with the
    /// workers started so far and the failure is recorded as an error.
    ///
    /// # Panics
    ///
    /// If `concurrency` is zero.
    pub fn run<J>(&self, concurrency: usize, job: J) -> RunResult
    where
        J: Fn(usize, &mut Generator) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.run_shared(concurrency, &Arc::new(job))
    }

    /// Run `job` at each concurrency level `step` produces.
    ///
    /// Stops when the step returns `None` (or zero), or right after a run
    /// that reported job-level errors; that run is the last element.
    pub fn auto_run<S, J>(&self, mut step: S, job: J) -> Vec<RunResult>
    where
        S: Step,
        J: Fn(usize, &mut Generator) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let job = Arc::new(job);
        let mut results: Vec<RunResult> = Vec::new();
        let mut level = step.next_level(None);

        while let Some(concurrency) = level.filter(|&c| c > 0) {
            let result = self.run_shared(concurrency, &job);
            if result.has_errors() {
                tracing::warn!(
                    concurrency,
                    errors = result.errors.len(),
                    "stopping auto-run after job errors"
                );
                results.push(result);
                break;
            }
            level = step.next_level(Some(&result));
            results.push(result);
        }

        for r in &self.reporters {
            r.auto_run_end(&results);
        }
        results
    }

    fn run_shared<J>(&self, concurrency: usize, job: &Arc<J>) -> RunResult
    where
        J: Fn(usize, &mut Generator) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        assert!(concurrency > 0, "concurrency must be at least 1");
        for r in &self.reporters {
            r.run_start(concurrency, &self.config);
        }
        tracing::debug!(concurrency, rate = ?self.config.rate, "starting run");

        let pacing = Pacing::new(self.config.rate, self.config.correction, concurrency);
        let counters = Arc::new(Counters::default());
        let (tx, rx) = mpsc::channel::<Finished>();

        let crew = assemble(concurrency, |worker, gate| {
            let recorder = Recorder::new(self.template.empty_copy(), Arc::clone(&counters));
            let mut generator =
                Generator::new(recorder, pacing, self.config.warmup, self.config.duration);
            let tx = tx.clone();
            let job = Arc::clone(job);

            thread::Builder::new()
                .name(format!("load-worker-{worker}"))
                .spawn(move || {
                    let Ok(start) = gate.recv() else {
                        return;
                    };
                    start.wait();
                    let outcome = job(worker, &mut generator);
                    // the receiver is gone only if the watchdog gave up on us
                    let _ = tx.send(Finished {
                        worker,
                        outcome,
                        latency: generator.into_latency(),
                    });
                })
        });
        drop(tx);

        crew.start.wait();
        let started = Instant::now();
        let cutoff = self
            .config
            .grace
            .map(|grace| started + self.config.warmup + self.config.duration + grace);

        let mut finished = Vec::with_capacity(crew.handles.len());
        while finished.len() < crew.handles.len() {
            let next = match cutoff {
                None => rx.recv().ok(),
                Some(at) => rx
                    .recv_timeout(at.saturating_duration_since(Instant::now()))
                    .ok(),
            };
            match next {
                Some(f) => finished.push(f),
                None => break,
            }
        }
        let elapsed = started.elapsed().saturating_sub(self.config.warmup);

        let mut errors = crew.errors;
        let (latency, collected) = self.gather(finished, &rx, crew.handles, cutoff.is_some());
        errors.extend(collected);
        let (success, failure) = counters.snapshot();

        let result = RunResult {
            concurrency,
            elapsed,
            success,
            failure,
            latency,
            errors,
        };
        tracing::info!(
            concurrency,
            elapsed_secs = result.elapsed.as_secs_f64(),
            success = result.success,
            failure = result.failure,
            errors = result.errors.len(),
            throughput = result.throughput(),
            "run completed"
        );
        for r in &self.reporters {
            r.run_end(&result);
        }
        result
    }

    /// Merge what the workers handed back and join their threads.
    ///
    /// With the watchdog on, workers that have not exited are abandoned. A
    /// worker may exit after the last receive, so the channel is drained once
    /// every handle's state is known.
    fn gather(
        &self,
        mut finished: Vec<Finished>,
        rx: &mpsc::Receiver<Finished>,
        handles: Vec<(usize, JoinHandle<()>)>,
        watchdog: bool,
    ) -> (LatencyHistogram, Vec<anyhow::Error>) {
        let settled: Vec<bool> = handles
            .iter()
            .map(|(_, h)| !watchdog || h.is_finished())
            .collect();
        finished.extend(rx.try_iter());

        let mut latency = self.template.empty_copy();
        let mut errors = Vec::new();
        let mut reported = HashSet::with_capacity(finished.len());
        for f in finished {
            reported.insert(f.worker);
            if let Err(e) = latency.merge(&f.latency) {
                tracing::warn!(worker = f.worker, error = ?e, "failed to merge worker latencies");
            }
            if let Err(e) = f.outcome {
                tracing::debug!(worker = f.worker, error = %e, "job returned an error");
                errors.push(e);
            }
        }

        for ((worker, handle), settled) in handles.into_iter().zip(settled) {
            if settled || reported.contains(&worker) {
                if let Err(panic) = handle.join() {
                    let message = panic_message(panic.as_ref());
                    tracing::error!(worker, %message, "worker panicked");
                    errors.push(Error::WorkerPanicked { worker, message }.into());
                }
            } else {
                let grace = self.config.grace.unwrap_or_default();
                tracing::warn!(worker, ?grace, "abandoning worker still running after deadline");
                errors.push(Error::WorkerTimedOut { worker, grace }.into());
            }
        }
        (latency, errors)
    }
}

/// Workers waiting to start, and the barrier that releases them.
struct Crew {
    handles: Vec<(usize, JoinHandle<()>)>,
    start: Arc<Barrier>,
    errors: Vec<anyhow::Error>,
}

/// Spawn up to `concurrency` workers with `spawn`.
///
/// Each worker receives the start barrier through its gate once spawning is
/// over, so the barrier only counts workers that exist. Spawning stops at the
/// first failure, which is recorded as a job-level error.
fn assemble<S>(concurrency: usize, mut spawn: S) -> Crew
where
    S: FnMut(usize, mpsc::Receiver<Arc<Barrier>>) -> std::io::Result<JoinHandle<()>>,
{
    let mut gates = Vec::with_capacity(concurrency);
    let mut handles = Vec::with_capacity(concurrency);
    let mut errors = Vec::new();

    for worker in 0..concurrency {
        let (gate_tx, gate_rx) = mpsc::sync_channel(1);
        match spawn(worker, gate_rx) {
            Ok(handle) => {
                gates.push(gate_tx);
                handles.push((worker, handle));
            }
            Err(source) => {
                tracing::error!(worker, error = %source, "failed to spawn worker");
                errors.push(Error::Spawn { worker, source }.into());
                break;
            }
        }
    }

    let start = Arc::new(Barrier::new(handles.len() + 1));
    for gate in gates {
        let _ = gate.send(Arc::clone(&start));
    }
    Crew {
        handles,
        start,
        errors,
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generator::Rate;
    use crate::step::{FixedStep, Levels};
    use std::sync::Mutex;
    use std::time::Duration;

    fn bench(duration: Duration) -> Bench {
        Bench::new(
            BenchConfig::new()
                .duration(duration)
                .latency_range(Duration::from_millis(1), Duration::from_secs(1)),
        )
        .unwrap()
    }

    fn succeed(_id: usize, gen: &mut Generator) -> anyhow::Result<()> {
        gen.generate(|| Ok::<(), anyhow::Error>(()))
    }

    #[test]
    fn should_reject_bench_when_config_invalid() {
        let cfg = BenchConfig::new().significant_digits(9);
        assert!(matches!(Bench::new(cfg), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn should_report_concurrency_when_unthrottled() {
        let r = bench(Duration::from_secs(1)).run(10, succeed);

        assert_eq!(r.concurrency, 10);
        assert!(r.errors.is_empty());
        assert!(r.success > 0);
        assert!(r.elapsed >= Duration::from_secs(1));
    }

    #[test]
    fn should_succeed_at_every_level_when_job_succeeds() {
        let bench = bench(Duration::from_millis(20));
        for n in [1, 2, 7, 16] {
            let r = bench.run(n, succeed);
            assert_eq!(r.concurrency, n);
            assert!(r.errors.is_empty());
            assert!(r.success > 0);
        }
    }

    #[test]
    fn should_bound_successes_by_rate_when_constant() {
        let bench = Bench::new(
            BenchConfig::new()
                .duration(Duration::from_secs(1))
                .latency_range(Duration::from_millis(1), Duration::from_secs(1))
                .rate(Rate::constant(1000.0)),
        )
        .unwrap();
        let r = bench.run(10, succeed);

        assert_eq!(r.concurrency, 10);
        assert!(r.success <= 1000, "{} ops at 1000 Hz for 1s", r.success);
        assert!(r.success >= 500, "{} ops at 1000 Hz for 1s", r.success);
    }

    #[test]
    fn should_count_failures_not_errors_when_operations_fail() {
        for n in [1, 10] {
            let r = bench(Duration::from_millis(50)).run(n, |_, gen| {
                gen.generate(|| Err::<(), _>(anyhow::anyhow!("woo hoo")))
            });
            assert!(r.failure > 0);
            assert_eq!(r.success, 0);
            assert!(r.errors.is_empty());
            assert!(r.latency.is_empty());
        }
    }

    #[test]
    fn should_collect_one_error_per_worker_when_job_fails() {
        for n in [1, 3, 10] {
            let r = bench(Duration::from_millis(10)).run(n, |_, _| anyhow::bail!("woo hoo"));
            assert_eq!(r.errors.len(), n);
            assert_eq!(r.success + r.failure, 0);
        }
    }

    #[test]
    fn should_merge_every_worker_histogram_when_finished() {
        let per_worker = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&per_worker);
        let r = bench(Duration::from_millis(50)).run(4, move |id, gen| {
            let mut calls = 0u64;
            gen.generate(|| {
                calls += 1;
                Ok::<(), anyhow::Error>(())
            })?;
            seen.lock().unwrap().push((id, calls));
            Ok(())
        });

        let per_worker = per_worker.lock().unwrap();
        let mut ids: Vec<_> = per_worker.iter().map(|(id, _)| *id).collect();
        ids.sort();
        assert_eq!(ids, vec![0, 1, 2, 3]);
        let total: u64 = per_worker.iter().map(|(_, n)| n).sum();
        assert_eq!(r.success, total);
        assert_eq!(r.latency.len(), total);
    }

    #[test]
    fn should_capture_panic_as_error_when_worker_panics() {
        let r = bench(Duration::from_millis(20)).run(3, |id, gen| {
            if id == 1 {
                panic!("worker {id} exploded");
            }
            succeed(id, gen)
        });

        assert_eq!(r.errors.len(), 1);
        let msg = r.errors[0].to_string();
        assert!(msg.contains("worker 1 panicked"), "{msg}");
        assert!(msg.contains("exploded"), "{msg}");
        assert!(r.success > 0);
    }

    #[test]
    fn should_abandon_hung_worker_when_grace_expires() {
        let bench = Bench::new(
            BenchConfig::new()
                .duration(Duration::from_millis(20))
                .latency_range(Duration::from_millis(1), Duration::from_secs(1))
                .grace(Duration::from_millis(50)),
        )
        .unwrap();

        let began = Instant::now();
        let r = bench.run(2, |id, gen| {
            if id == 0 {
                thread::sleep(Duration::from_secs(3));
                return Ok(());
            }
            succeed(id, gen)
        });

        assert!(began.elapsed() < Duration::from_secs(2));
        assert_eq!(r.errors.len(), 1);
        assert!(matches!(
            r.errors[0].downcast_ref::<Error>(),
            Some(Error::WorkerTimedOut { worker: 0, .. })
        ));
    }

    #[test]
    fn should_keep_job_error_when_worker_exits_after_cutoff() {
        let bench = bench(Duration::from_millis(1));
        let (tx, rx) = mpsc::channel();
        let mut sample = bench.template.empty_copy();
        sample.record(Duration::from_millis(3)).unwrap();

        let handle = thread::spawn(move || {
            tx.send(Finished {
                worker: 0,
                outcome: Err(anyhow::anyhow!("late job error")),
                latency: sample,
            })
            .unwrap();
        });
        while !handle.is_finished() {
            thread::sleep(Duration::from_millis(1));
        }

        // nothing was received before the cutoff
        let (latency, errors) = bench.gather(Vec::new(), &rx, vec![(0, handle)], true);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].to_string(), "late job error");
        assert_eq!(latency.len(), 1);
    }

    #[test]
    fn should_report_exactly_one_error_when_job_fails_near_cutoff() {
        let bench = Bench::new(
            BenchConfig::new()
                .duration(Duration::from_millis(2))
                .latency_range(Duration::from_millis(1), Duration::from_secs(1))
                .grace(Duration::from_millis(3)),
        )
        .unwrap();

        for trial in 0..100u64 {
            let r = bench.run(1, move |_, _| {
                thread::sleep(Duration::from_micros(4_800 + trial % 5 * 100));
                anyhow::bail!("late job error")
            });
            assert_eq!(r.errors.len(), 1, "trial {trial}: {:?}", r.errors);
        }
    }

    #[test]
    fn should_release_started_workers_when_spawn_fails() {
        let crew = assemble(4, |worker, gate| {
            if worker == 2 {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "out of threads",
                ));
            }
            thread::Builder::new().spawn(move || {
                if let Ok(start) = gate.recv() {
                    start.wait();
                }
            })
        });

        assert_eq!(crew.handles.len(), 2);
        assert_eq!(crew.errors.len(), 1);
        assert!(matches!(
            crew.errors[0].downcast_ref::<Error>(),
            Some(Error::Spawn { worker: 2, .. })
        ));

        crew.start.wait();
        for (_, handle) in crew.handles {
            handle.join().unwrap();
        }
    }

    #[test]
    fn should_exclude_warmup_from_elapsed() {
        let bench = Bench::new(
            BenchConfig::new()
                .duration(Duration::from_millis(50))
                .warmup(Duration::from_millis(200))
                .latency_range(Duration::from_millis(1), Duration::from_secs(1)),
        )
        .unwrap();
        let r = bench.run(2, succeed);

        assert!(r.elapsed >= Duration::from_millis(50));
        assert!(r.elapsed < Duration::from_millis(200), "{:?}", r.elapsed);
    }

    #[test]
    fn should_run_every_level_when_auto_running() {
        let results = bench(Duration::from_millis(1)).auto_run(FixedStep::new(1, 100, 10), succeed);

        assert_eq!(results.len(), 11);
        let levels: Vec<_> = results.iter().map(|r| r.concurrency).collect();
        assert_eq!(levels, vec![1, 10, 20, 30, 40, 50, 60, 70, 80, 90, 100]);
    }

    #[test]
    fn should_keep_escalating_when_operations_fail() {
        let results = bench(Duration::from_millis(1)).auto_run(FixedStep::new(1, 20, 10), |_, gen| {
            gen.generate(|| Err::<(), _>("woo hoo"))
        });

        assert_eq!(results.len(), 3);
        assert!(results[0].failure > 0);
    }

    #[test]
    fn should_stop_after_first_run_when_job_errors() {
        let results =
            bench(Duration::from_millis(1)).auto_run(FixedStep::new(1, 100, 10), |_, _| {
                anyhow::bail!("woo hoo")
            });

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].errors.len(), 1);
    }

    #[test]
    fn should_stop_mid_sequence_when_a_level_errors() {
        let results = bench(Duration::from_millis(1)).auto_run(Levels::new([1, 2, 3, 4]), |id, gen| {
            if id == 2 {
                anyhow::bail!("third worker refuses");
            }
            succeed(id, gen)
        });

        let levels: Vec<_> = results.iter().map(|r| r.concurrency).collect();
        assert_eq!(levels, vec![1, 2, 3]);
        assert!(results[..2].iter().all(|r| r.errors.is_empty()));
        assert_eq!(results[2].errors.len(), 1);
    }

    #[test]
    fn should_stop_when_step_returns_zero() {
        let results = bench(Duration::from_millis(1)).auto_run(Levels::new([2, 0, 5]), succeed);
        assert_eq!(results.len(), 1);
    }

    #[test]
    #[should_panic(expected = "concurrency must be at least 1")]
    fn should_panic_when_concurrency_is_zero() {
        bench(Duration::from_millis(1)).run(0, succeed);
    }

    struct Counting(Arc<Mutex<(usize, usize, usize)>>);

    impl Reporter for Counting {
        fn run_start(&self, _: usize, _: &BenchConfig) {
            self.0.lock().unwrap().0 += 1;
        }
        fn run_end(&self, _: &RunResult) {
            self.0.lock().unwrap().1 += 1;
        }
        fn auto_run_end(&self, results: &[RunResult]) {
            self.0.lock().unwrap().2 = results.len();
        }
    }

    #[test]
    fn should_notify_reporters_when_running() {
        let calls = Arc::new(Mutex::new((0, 0, 0)));
        let mut bench = bench(Duration::from_millis(1));
        bench.add_reporter(Box::new(Counting(Arc::clone(&calls))));

        bench.auto_run(Levels::new([1, 2]), succeed);
        assert_eq!(*calls.lock().unwrap(), (2, 2, 2));
    }
}
