//! cntryl-load: drive a synthetic workload from the command line.
//!
//! Every operation sleeps for `--work-us`, then optionally holds a
//! process-wide lock for `--serial-us`. The lock makes workers queue behind
//! each other, so `auto` shows throughput flattening out the way a real
//! contended resource would.
//!
//! ```text
//! cntryl-load run -c 16 --rate 5000 --duration-ms 2000
//! cntryl-load auto --max 64 --step 8 --serial-us 50 --fit
//! ```

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use cntryl_load::{
    Bench, BenchConfig, ConsoleReporter, FixedStep, Generator, JsonReporter, Rate, RunResult, Step,
};
use std::path::PathBuf;
use std::sync::Mutex;
use std::thread;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(
    name = "cntryl-load",
    about = "Generate concurrent load against a synthetic job",
    long_about = "
Runs a synthetic job at one or more concurrency levels and reports
throughput and latency percentiles.

Defaults come from LOAD_* environment variables; flags override them.

Example:
    cntryl-load run -c 8                       # Unthrottled, 8 workers
    cntryl-load run -c 8 --rate 1000           # 1000 ops/s across 8 workers
    cntryl-load auto --max 100 --step 10 --fit # Escalate and fit USL
"
)]
struct Cli {
    #[command(subcommand)]
    cmd: Commands,

    #[command(flatten)]
    common: CommonArgs,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run once at a fixed concurrency
    Run {
        /// Number of workers
        #[arg(long, short = 'c', default_value_t = 1)]
        concurrency: usize,
    },

    /// Escalate concurrency until the step stops or latency degrades
    Auto {
        /// First concurrency level
        #[arg(long, default_value_t = 1)]
        min: usize,

        /// Last concurrency level
        #[arg(long, default_value_t = 100)]
        max: usize,

        /// Increment between levels
        #[arg(long, default_value_t = 10)]
        step: usize,

        /// Stop once p99 latency exceeds this many milliseconds
        #[arg(long)]
        max_p99_ms: Option<f64>,

        /// Fit the Universal Scalability Law to the results
        #[arg(long)]
        fit: bool,
    },
}

#[derive(Debug, Args)]
struct CommonArgs {
    // ========================================================================
    // Run Options
    // ========================================================================
    /// Measured length of each run in milliseconds
    #[arg(long, global = true)]
    duration_ms: Option<u64>,

    /// Unmeasured warmup per run in milliseconds
    #[arg(long, global = true)]
    warmup_ms: Option<u64>,

    /// Aggregate operations per second (unthrottled if unset)
    #[arg(long, global = true)]
    rate: Option<f64>,

    /// Abandon workers still running this long after the deadline
    #[arg(long, global = true)]
    grace_ms: Option<u64>,

    // ========================================================================
    // Synthetic Job
    // ========================================================================
    /// Parallel work per operation in microseconds
    #[arg(long, global = true, default_value_t = 100)]
    work_us: u64,

    /// Serialized work per operation in microseconds, under a shared lock
    #[arg(long, global = true, default_value_t = 0)]
    serial_us: u64,

    /// Fail every Nth operation of each worker (0 = never)
    #[arg(long, global = true, default_value_t = 0)]
    fail_every: u64,

    // ========================================================================
    // Output Control
    // ========================================================================
    /// Print the full latency distribution of each run
    #[arg(long, global = true)]
    distribution: bool,

    /// Write JSON results to this directory
    #[arg(long, global = true)]
    output_dir: Option<PathBuf>,
}

impl CommonArgs {
    fn config(&self) -> BenchConfig {
        let mut cfg = BenchConfig::from_env().verbose(false);
        if let Some(ms) = self.duration_ms {
            cfg = cfg.duration(Duration::from_millis(ms));
        }
        if let Some(ms) = self.warmup_ms {
            cfg = cfg.warmup(Duration::from_millis(ms));
        }
        if let Some(hz) = self.rate {
            cfg = cfg.rate(Rate::constant(hz));
        }
        if let Some(ms) = self.grace_ms {
            cfg = cfg.grace(Duration::from_millis(ms));
        }
        if let Some(dir) = &self.output_dir {
            cfg = cfg.output_dir(dir);
        }
        cfg
    }

    fn job(&self) -> impl Fn(usize, &mut Generator) -> anyhow::Result<()> + Send + Sync + 'static {
        let work = Duration::from_micros(self.work_us);
        let serial = Duration::from_micros(self.serial_us);
        let fail_every = self.fail_every;

        move |_worker: usize, gen: &mut Generator| {
            let mut calls = 0u64;
            gen.generate(|| {
                calls += 1;
                synthetic_op(work, serial)?;
                if fail_every > 0 && calls % fail_every == 0 {
                    anyhow::bail!("synthetic failure on call {calls}");
                }
                Ok(())
            })
        }
    }
}

static SERIAL: Mutex<()> = Mutex::new(());

fn synthetic_op(work: Duration, serial: Duration) -> Result<()> {
    if !work.is_zero() {
        thread::sleep(work);
    }
    if !serial.is_zero() {
        let _guard = SERIAL
            .lock()
            .map_err(|_| anyhow::anyhow!("serial lock poisoned"))?;
        thread::sleep(serial);
    }
    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = cli.common.config();
    let mut bench = Bench::new(config).context("invalid bench configuration")?;
    bench.add_reporter(Box::new(
        ConsoleReporter::new().show_distribution(cli.common.distribution),
    ));
    let job = cli.common.job();

    let results = match cli.cmd {
        Commands::Run { concurrency } => {
            if concurrency == 0 {
                anyhow::bail!("--concurrency must be at least 1");
            }
            let results = vec![bench.run(concurrency, job)];
            // auto-run output goes through the bench's JsonReporter
            if let Some(dir) = &cli.common.output_dir {
                let path = JsonReporter::new(dir).write(&results)?;
                eprintln!("Results written to: {}", path.display());
            }
            results
        }
        Commands::Auto {
            min,
            max,
            step,
            max_p99_ms,
            fit,
        } => {
            if min == 0 || step == 0 {
                anyhow::bail!("--min and --step must be at least 1");
            }
            let fixed = FixedStep::new(min, max, step);
            let step: Box<dyn Step> = match max_p99_ms.map(p99_threshold).transpose()? {
                Some(threshold) => Box::new(fixed.max_latency(99.0, threshold).logged()),
                None => Box::new(fixed.logged()),
            };
            let results = bench.auto_run(step, job);
            if fit {
                print_fit(&results);
            }
            results
        }
    };

    match results.last() {
        Some(last) if last.has_errors() => {
            anyhow::bail!(
                "run at concurrency {} ended with {} job error(s)",
                last.concurrency,
                last.errors.len()
            )
        }
        _ => Ok(()),
    }
}

fn p99_threshold(ms: f64) -> Result<Duration> {
    if ms < 0.0 {
        anyhow::bail!("--max-p99-ms must not be negative, got {ms}");
    }
    Duration::try_from_secs_f64(ms / 1000.0)
        .with_context(|| format!("--max-p99-ms {ms} is not a usable latency"))
}

fn print_fit(results: &[RunResult]) {
    match cntryl_load::model::model(results) {
        Ok(usl) => {
            println!(
                "sigma={:.6} kappa={:.6} lambda={:.2}",
                usl.sigma, usl.kappa, usl.lambda
            );
            println!(
                "peak: {} workers at {:.0} ops/s",
                usl.peak_concurrency(),
                usl.peak_throughput()
            );
        }
        Err(e) => println!("no fit: {e}"),
    }
}
