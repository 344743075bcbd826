//! Non-negative least squares (Lawson–Hanson active set).
//!
//! Solves `min ‖A x - b‖₂` subject to `x >= 0`.
//!
//! The index set is split into a *passive* set `P` (coefficients free to move,
//! solved without constraints) and an *active* set `Z` (coefficients clamped to
//! zero). Each outer iteration releases the clamped index with the largest
//! positive dual `w = Aᵀ(b - Ax)`; the inner loop steps back towards the
//! previous feasible point whenever the unconstrained passive solve goes
//! negative.

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use super::ols::LeastSquaresFactor;

/// Outer iterations allowed per column.
const ITERATIONS_PER_COLUMN: usize = 3;

/// Relative tolerance on the dual vector.
const DUAL_TOL: f64 = 1e-12;

/// Coefficients this small relative to the largest are clamped after a step back.
const CLAMP_TOL: f64 = 1e-14;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NnlsStatus {
    Optimal,
    /// Zero target or an exact fit: the solution carries no information.
    Degenerate,
    /// The iteration cap was hit; `x` is the best feasible point found.
    IterationLimit,
}

#[derive(Debug, Clone)]
pub struct NnlsSolution {
    /// Coefficients, all `>= 0`.
    pub x: DVector<f64>,
    /// Final residual norm `‖A x - b‖₂`.
    pub rnorm: f64,
    pub status: NnlsStatus,
    /// Passive indices at exit (ascending).
    pub passive: Vec<usize>,
    pub iterations: usize,
}

/// Reusable NNLS solver.
///
/// The struct only carries the iteration policy; work vectors are per call so a
/// solver can be shared between threads by reference.
#[derive(Debug, Clone)]
pub struct NonNegativeLeastSquares {
    max_iterations: Option<usize>,
}

impl Default for NonNegativeLeastSquares {
    fn default() -> Self {
        Self::new()
    }
}

impl NonNegativeLeastSquares {
    /// Solver with the default cap of `3 × n_columns` outer iterations.
    pub fn new() -> Self {
        Self { max_iterations: None }
    }

    pub fn with_max_iterations(max_iterations: usize) -> Self {
        Self {
            max_iterations: Some(max_iterations),
        }
    }

    pub fn solve(&self, a: &DMatrix<f64>, b: &DVector<f64>) -> NnlsSolution {
        let n = a.ncols();
        let max_iter = self.max_iterations.unwrap_or(ITERATIONS_PER_COLUMN * n);
        let mut x = DVector::zeros(n);

        let b_norm = b.norm();
        if b_norm == 0.0 || n == 0 {
            return NnlsSolution {
                x,
                rnorm: b_norm,
                status: NnlsStatus::Degenerate,
                passive: Vec::new(),
                iterations: 0,
            };
        }

        let a_norm = a.column_iter().map(|c| c.norm()).fold(0.0, f64::max);
        let tol = DUAL_TOL * a_norm * b_norm;

        let mut passive = vec![false; n];
        // Indices whose release gave a non-positive coefficient; skipped until x moves.
        let mut blocked = vec![false; n];
        let mut iterations = 0;
        let mut status = NnlsStatus::Optimal;

        let mut w = a.tr_mul(&(b - a * &x));

        'outer: loop {
            let candidate = (0..n)
                .filter(|&j| !passive[j] && !blocked[j] && w[j] > tol)
                .max_by(|&i, &j| w[i].total_cmp(&w[j]));
            let Some(t) = candidate else { break };

            if iterations >= max_iter {
                status = NnlsStatus::IterationLimit;
                break;
            }
            iterations += 1;
            passive[t] = true;

            let mut first = true;
            loop {
                let Some(z) = solve_passive(a, b, &passive) else {
                    passive[t] = false;
                    blocked[t] = true;
                    break;
                };

                if (0..n).filter(|&j| passive[j]).all(|j| z[j] > 0.0) {
                    x = z;
                    blocked.iter_mut().for_each(|v| *v = false);
                    break;
                }
                if first && z[t] <= 0.0 {
                    // The released column does not help; keep the previous point.
                    passive[t] = false;
                    blocked[t] = true;
                    continue 'outer;
                }
                first = false;

                let Some((limiting, alpha)) = (0..n)
                    .filter(|&j| passive[j] && z[j] <= 0.0)
                    .map(|j| (j, x[j] / (x[j] - z[j])))
                    .min_by(|a, b| a.1.total_cmp(&b.1))
                else {
                    break;
                };
                let x_scale = x.amax();
                for j in 0..n {
                    if passive[j] {
                        x[j] += alpha * (z[j] - x[j]);
                        if j == limiting || x[j] <= 0.0 || (z[j] <= 0.0 && x[j] <= CLAMP_TOL * x_scale) {
                            x[j] = 0.0;
                            passive[j] = false;
                        }
                    }
                }
                blocked.iter_mut().for_each(|v| *v = false);
                if !passive.iter().any(|&p| p) {
                    break;
                }
            }

            w = a.tr_mul(&(b - a * &x));
        }

        let rnorm = (a * &x - b).norm();
        if status == NnlsStatus::Optimal && rnorm == 0.0 {
            status = NnlsStatus::Degenerate;
        }
        NnlsSolution {
            x,
            rnorm,
            status,
            passive: (0..n).filter(|&j| passive[j]).collect(),
            iterations,
        }
    }
}

/// Unconstrained solve on the passive columns, scattered back to full length.
fn solve_passive(a: &DMatrix<f64>, b: &DVector<f64>, passive: &[bool]) -> Option<DVector<f64>> {
    let cols: Vec<usize> = (0..passive.len()).filter(|&j| passive[j]).collect();
    let a_p = a.select_columns(&cols);
    let factor = LeastSquaresFactor::new(&a_p)?;
    let z_p = factor.solve(b);
    if z_p.iter().any(|v| !v.is_finite()) {
        return None;
    }
    let mut z = DVector::zeros(passive.len());
    for (k, &j) in cols.iter().enumerate() {
        z[j] = z_p[k];
    }
    Some(z)
}
