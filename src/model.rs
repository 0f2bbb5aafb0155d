//! Scalability model fitted to a series of runs.
//!
//! Each [`RunResult`] becomes one sample: concurrency on the x axis,
//! throughput (successes per second) on the y axis. Samples are handed, in
//! run order, to a [`Fitter`]. The default fitter models the Universal
//! Scalability Law:
//!
//! ```text
//! X(N) = λN / (1 + σ(N - 1) + κN(N - 1))
//! ```
//!
//! where λ is the single-worker throughput, σ the contention penalty and κ
//! the coherency penalty. Rearranged, `N / X(N)` is a quadratic in `N`, which
//! [`UslFitter`] solves by ordinary least squares.

use crate::error::FitError;
use crate::result::RunResult;
use serde::{Deserialize, Serialize};

/// Minimum number of distinct concurrency levels for a fit.
pub const MIN_LEVELS: usize = 3;

/// One (concurrency, throughput) measurement.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub x: f64,
    pub y: f64,
}

/// One sample per result, in result order.
pub fn samples(results: &[RunResult]) -> Vec<Sample> {
    results
        .iter()
        .map(|r| Sample {
            x: r.concurrency as f64,
            y: r.throughput(),
        })
        .collect()
}

/// Curve-fitting collaborator.
pub trait Fitter {
    type Model;

    fn fit(&self, samples: &[Sample]) -> Result<Self::Model, FitError>;
}

/// Fit the Universal Scalability Law to `results`.
pub fn model(results: &[RunResult]) -> Result<Usl, FitError> {
    fit_with(&UslFitter, results)
}

/// Fit `results` with an arbitrary collaborator.
pub fn fit_with<F: Fitter>(fitter: &F, results: &[RunResult]) -> Result<F::Model, FitError> {
    fitter.fit(&samples(results))
}

/// Fitted Universal Scalability Law parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Usl {
    /// Contention (serial fraction), σ
    pub sigma: f64,
    /// Coherency (crosstalk) cost, κ
    pub kappa: f64,
    /// Throughput of a single worker, λ
    pub lambda: f64,
}

impl Usl {
    /// Predicted throughput at concurrency `n`.
    pub fn throughput_at(&self, n: f64) -> f64 {
        self.lambda * n / (1.0 + self.sigma * (n - 1.0) + self.kappa * n * (n - 1.0))
    }

    /// Concurrency at which throughput peaks; infinite when κ is zero.
    pub fn peak_concurrency(&self) -> f64 {
        if self.kappa > 0.0 {
            ((1.0 - self.sigma) / self.kappa).max(0.0).sqrt().floor()
        } else {
            f64::INFINITY
        }
    }

    /// Predicted throughput at [`Usl::peak_concurrency`]; with no coherency
    /// cost this is the asymptote `λ / σ`.
    pub fn peak_throughput(&self) -> f64 {
        let n = self.peak_concurrency();
        if n.is_finite() {
            self.throughput_at(n)
        } else if self.sigma > 0.0 {
            self.lambda / self.sigma
        } else {
            f64::INFINITY
        }
    }
}

/// Least-squares fit of the Universal Scalability Law.
#[derive(Debug, Clone, Copy, Default)]
pub struct UslFitter;

/// Negative σ or κ smaller than this in magnitude are rounding noise.
const TOLERANCE: f64 = 1e-6;

impl Fitter for UslFitter {
    type Model = Usl;

    fn fit(&self, samples: &[Sample]) -> Result<Usl, FitError> {
        let mut levels: Vec<f64> = samples.iter().map(|s| s.x).collect();
        levels.sort_by(f64::total_cmp);
        levels.dedup();
        if levels.len() < MIN_LEVELS {
            return Err(FitError::TooFewLevels {
                distinct: levels.len(),
                required: MIN_LEVELS,
            });
        }
        if let Some(s) = samples.iter().find(|s| !s.y.is_finite() || s.y <= 0.0) {
            return Err(FitError::ZeroThroughput { concurrency: s.x });
        }

        // N / X(N) = c0 + c1 N + c2 N^2
        //   c0 = (1 - σ) / λ,  c1 = (σ - κ) / λ,  c2 = κ / λ
        let mut normal = [[0.0f64; 4]; 3];
        for s in samples {
            let basis = [1.0, s.x, s.x * s.x];
            let z = s.x / s.y;
            for (i, row) in normal.iter_mut().enumerate() {
                for j in 0..3 {
                    row[j] += basis[i] * basis[j];
                }
                row[3] += basis[i] * z;
            }
        }
        let [c0, c1, c2] = solve(normal).ok_or(FitError::Singular)?;

        let lambda = 1.0 / (c0 + c1 + c2);
        let kappa = c2 * lambda;
        let sigma = c1 * lambda + kappa;
        if !lambda.is_finite() || lambda <= 0.0 || !sigma.is_finite() || !kappa.is_finite() {
            return Err(FitError::NonPhysical {
                lambda,
                sigma,
                kappa,
            });
        }
        if sigma < -TOLERANCE || kappa < -TOLERANCE {
            return Err(FitError::NonPhysical {
                lambda,
                sigma,
                kappa,
            });
        }

        Ok(Usl {
            sigma: sigma.max(0.0),
            kappa: kappa.max(0.0),
            lambda,
        })
    }
}

/// Gaussian elimination with partial pivoting on a 3x3 augmented matrix.
fn solve(mut m: [[f64; 4]; 3]) -> Option<[f64; 3]> {
    for col in 0..3 {
        let pivot = (col..3).max_by(|&a, &b| m[a][col].abs().total_cmp(&m[b][col].abs()))?;
        let scale = m.iter().map(|r| r[col].abs()).fold(0.0, f64::max);
        if m[pivot][col].abs() <= scale * 1e-12 || m[pivot][col] == 0.0 {
            return None;
        }
        m.swap(col, pivot);
        for row in col + 1..3 {
            let factor = m[row][col] / m[col][col];
            for k in col..4 {
                m[row][k] -= factor * m[col][k];
            }
        }
    }

    let mut x = [0.0; 3];
    for row in (0..3).rev() {
        let tail: f64 = (row + 1..3).map(|k| m[row][k] * x[k]).sum();
        x[row] = (m[row][3] - tail) / m[row][row];
    }
    x.iter().all(|v| v.is_finite()).then_some(x)
}
