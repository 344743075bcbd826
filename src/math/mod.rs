//! Numerical building blocks: exponential bin integrals, SVD least squares
//! and non-negative least squares.

use crate::error::{FitError, Result};

pub mod basis;
pub mod nnls;
pub mod ols;

pub use nnls::{NnlsSolution, NnlsStatus, NonNegativeLeastSquares};
pub use ols::{solve_least_squares, LeastSquaresFactor};

/// Zero-filled buffer, reporting allocation failure instead of aborting.
pub fn try_zeroed(len: usize, what: &str) -> Result<Vec<f64>> {
    let mut v = Vec::new();
    v.try_reserve_exact(len).map_err(|e| {
        FitError::Allocation(format!("cannot allocate {what} ({len} values): {e}"))
    })?;
    v.resize(len, 0.0);
    Ok(v)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zeroed_buffer_has_requested_length() {
        let v = try_zeroed(17, "test buffer").unwrap();
        assert_eq!(v, vec![0.0; 17]);
    }

    #[test]
    fn impossible_allocation_is_an_error() {
        let err = try_zeroed(usize::MAX, "huge buffer").err().unwrap();
        assert!(matches!(err, FitError::Allocation(_)));
        assert!(err.to_string().contains("huge buffer"));
    }
}
