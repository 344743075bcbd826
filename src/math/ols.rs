//! SVD least squares.
//!
//! The linear subproblems here are tiny (one column per decay component plus
//! an optional offset) but tall (one row per time bin and channel), and the
//! columns can become nearly collinear when two lifetimes approach each other.
//!
//! Implementation choices:
//! - SVD with a relative singular-value cutoff, so collinear columns yield the
//!   minimum-norm solution instead of a failure.
//! - The factorization is kept around: the variable-projection Jacobian needs
//!   the orthogonal projector and the pseudo-inverse of the same matrix.

use nalgebra::{DMatrix, DVector};

/// Singular values below `RCOND * s_max` are treated as zero.
pub const RCOND: f64 = 1e-12;

/// Thin SVD `A = U S Vᵀ` with the numerical rank already decided.
#[derive(Debug, Clone)]
pub struct LeastSquaresFactor {
    u: DMatrix<f64>,
    v_t: DMatrix<f64>,
    /// `1/s` for retained singular values, `0` otherwise.
    s_inv: DVector<f64>,
    rank: usize,
}

impl LeastSquaresFactor {
    /// Factorize `x`. Returns `None` for an empty matrix or non-finite SVD.
    pub fn new(x: &DMatrix<f64>) -> Option<Self> {
        if x.nrows() == 0 || x.ncols() == 0 {
            return None;
        }
        let svd = x.clone().svd(true, true);
        let u = svd.u?;
        let v_t = svd.v_t?;
        let s = svd.singular_values;
        if s.iter().any(|v| !v.is_finite()) {
            return None;
        }

        let s_max = s.iter().cloned().fold(0.0, f64::max);
        let cutoff = RCOND * s_max;
        let s_inv = s.map(|v| if v > cutoff && v > 0.0 { 1.0 / v } else { 0.0 });
        let rank = s_inv.iter().filter(|v| **v != 0.0).count();
        Some(Self { u, v_t, s_inv, rank })
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    /// Minimum-norm least-squares solution of `A x ≈ y`.
    pub fn solve(&self, y: &DVector<f64>) -> DVector<f64> {
        let uty = self.u.tr_mul(y).component_mul(&self.s_inv);
        self.v_t.tr_mul(&uty)
    }

    /// `(I - U Uᵀ) z`: the component of `z` outside the column space.
    pub fn project_out(&self, z: &DVector<f64>) -> DVector<f64> {
        let mut coeffs = self.u.tr_mul(z);
        for (c, s) in coeffs.iter_mut().zip(self.s_inv.iter()) {
            if *s == 0.0 {
                *c = 0.0;
            }
        }
        z - &self.u * coeffs
    }

    /// `(A⁺)ᵀ v = U S⁺ Vᵀ v` for a vector `v` in parameter space.
    pub fn pinv_transpose_mul(&self, v: &DVector<f64>) -> DVector<f64> {
        let coeffs = (&self.v_t * v).component_mul(&self.s_inv);
        &self.u * coeffs
    }
}

/// Solve a least squares problem using SVD.
///
/// Returns `None` if the matrix is empty or the solution is not finite.
pub fn solve_least_squares(x: &DMatrix<f64>, y: &DVector<f64>) -> Option<DVector<f64>> {
    let factor = LeastSquaresFactor::new(x)?;
    let beta = factor.solve(y);
    beta.iter().all(|v| v.is_finite()).then_some(beta)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn least_squares_solves_simple_system() {
        // Fit y = 2 + 3x on x = [0,1,2]
        let x = DMatrix::from_row_slice(3, 2, &[1.0, 0.0, 1.0, 1.0, 1.0, 2.0]);
        let y = DVector::from_row_slice(&[2.0, 5.0, 8.0]);

        let beta = solve_least_squares(&x, &y).unwrap();
        assert!((beta[0] - 2.0).abs() < 1e-10);
        assert!((beta[1] - 3.0).abs() < 1e-10);
    }

    #[test]
    fn collinear_columns_give_minimum_norm_solution() {
        let x = DMatrix::from_row_slice(3, 2, &[1.0, 1.0, 2.0, 2.0, 3.0, 3.0]);
        let y = DVector::from_row_slice(&[2.0, 4.0, 6.0]);
        let factor = LeastSquaresFactor::new(&x).unwrap();
        assert_eq!(factor.rank(), 1);
        let beta = factor.solve(&y);
        assert!((beta[0] - 1.0).abs() < 1e-10);
        assert!((beta[1] - 1.0).abs() < 1e-10);
    }

    #[test]
    fn projector_removes_column_space() {
        let x = DMatrix::from_row_slice(3, 1, &[1.0, 1.0, 0.0]);
        let factor = LeastSquaresFactor::new(&x).unwrap();
        let z = DVector::from_row_slice(&[3.0, 1.0, 5.0]);
        let p = factor.project_out(&z);
        assert!((p[0] - 1.0).abs() < 1e-12);
        assert!((p[1] + 1.0).abs() < 1e-12);
        assert!((p[2] - 5.0).abs() < 1e-12);
    }

    #[test]
    fn pinv_transpose_matches_explicit_pseudo_inverse() {
        let x = DMatrix::from_row_slice(4, 2, &[1.0, 0.5, 0.0, 1.0, 2.0, 0.0, 1.0, 1.0]);
        let factor = LeastSquaresFactor::new(&x).unwrap();
        let pinv = (x.transpose() * &x).try_inverse().unwrap() * x.transpose();
        let v = DVector::from_row_slice(&[0.3, -1.2]);
        let expected = pinv.transpose() * &v;
        let got = factor.pinv_transpose_mul(&v);
        assert!((got - expected).norm() < 1e-12);
    }

    #[test]
    fn empty_matrix_is_rejected() {
        let x = DMatrix::<f64>::zeros(0, 2);
        assert!(LeastSquaresFactor::new(&x).is_none());
    }
}
