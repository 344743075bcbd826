//! Per-region variable projection.
//!
//! For fixed nonlinear parameters α, a region's optimal amplitudes are the
//! NNLS solution of `W A(α) c ≈ W b`. The projected residual is
//! `r(α) = W b - W A(α) c(α)`, and with `A_P` the passive (unclamped)
//! columns its Jacobian is
//!
//! ```text
//! ∂r/∂α_k = -( P⊥ D_k c + (A_P⁺)ᵀ D_kᵀ r ),   P⊥ = I - U Uᵀ,   D_k = W ∂A/∂α_k
//! ```
//!
//! Clamped columns do not enter: their coefficients stay at zero for small
//! parameter changes.

use nalgebra::{DMatrix, DVector};

use crate::data::FitRegion;
use crate::math::{LeastSquaresFactor, NnlsStatus, NonNegativeLeastSquares};
use crate::models::{DecayModel, ModelScratch};

/// Per-worker buffers. Sized once, reused for every region of the group.
pub struct ProjectorScratch {
    model: ModelScratch,
    a: DMatrix<f64>,
    aw: DMatrix<f64>,
    derivatives: Vec<DMatrix<f64>>,
    target: DVector<f64>,
}

impl ProjectorScratch {
    pub fn new(model: &dyn DecayModel) -> Self {
        let rows = model.rows_per_region();
        let cols = model.n_columns();
        Self {
            model: model.new_scratch(),
            a: DMatrix::zeros(rows, cols),
            aw: DMatrix::zeros(rows, cols),
            derivatives: (0..model.n_nonlinear()).map(|_| DMatrix::zeros(rows, cols)).collect(),
            target: DVector::zeros(rows),
        }
    }
}

/// Output rows of one region inside the global buffers.
pub struct RegionRows<'a> {
    /// Weighted residuals (`rows`).
    pub fvec: &'a mut [f64],
    /// Unweighted model curve (`rows`).
    pub fitted: &'a mut [f64],
    /// Row-major Jacobian block (`rows × n_nonlinear`), when requested.
    pub fjac: Option<&'a mut [f64]>,
    /// Linear coefficients (`n_columns`).
    pub coefficients: &'a mut [f64],
}

pub struct RegionProjector<'a> {
    model: &'a dyn DecayModel,
    nnls: &'a NonNegativeLeastSquares,
}

impl<'a> RegionProjector<'a> {
    pub fn new(model: &'a dyn DecayModel, nnls: &'a NonNegativeLeastSquares) -> Self {
        Self { model, nnls }
    }

    /// Solve one region at `params` and write its rows.
    ///
    /// `targets` and `weights` are the region's slices of the session's
    /// weighting buffers.
    pub fn project(
        &self,
        params: &[f64],
        region: &FitRegion,
        targets: &[f64],
        weights: &[f64],
        scratch: &mut ProjectorScratch,
        out: RegionRows<'_>,
    ) -> NnlsStatus {
        let n_rows = targets.len();
        let n_params = params.len();
        let want_jacobian = out.fjac.is_some();

        let derivatives = if want_jacobian {
            Some(scratch.derivatives.as_mut_slice())
        } else {
            None
        };
        self.model
            .evaluate(params, region.irf_idx, &mut scratch.model, &mut scratch.a, derivatives);

        scratch.aw.copy_from(&scratch.a);
        for (mut row, &w) in scratch.aw.row_iter_mut().zip(weights) {
            row *= w;
        }
        for ((t, &y), &w) in scratch.target.iter_mut().zip(targets).zip(weights) {
            *t = w * y;
        }

        let solution = self.nnls.solve(&scratch.aw, &scratch.target);
        let c = &solution.x;

        let residual = &scratch.target - &scratch.aw * c;
        out.fvec.copy_from_slice(residual.as_slice());
        let fitted = &scratch.a * c;
        out.fitted.copy_from_slice(fitted.as_slice());
        out.coefficients.copy_from_slice(c.as_slice());

        if let Some(fjac) = out.fjac {
            debug_assert_eq!(fjac.len(), n_rows * n_params);
            fjac.fill(0.0);
            if solution.passive.is_empty() {
                // c = 0 and nothing is free to move: the residual is just W b.
                return solution.status;
            }
            let a_p = scratch.aw.select_columns(&solution.passive);
            let Some(factor) = LeastSquaresFactor::new(&a_p) else {
                return solution.status;
            };

            for (k, d) in scratch.derivatives.iter_mut().enumerate() {
                for (mut row, &w) in d.row_iter_mut().zip(weights) {
                    row *= w;
                }
                let dc = &*d * c;
                let d_p = d.select_columns(&solution.passive);
                let dtr = d_p.tr_mul(&residual);
                let term = factor.project_out(&dc) + factor.pinv_transpose_mul(&dtr);
                for (i, v) in term.iter().enumerate() {
                    fjac[i * n_params + k] = -v;
                }
            }
        }
        solution.status
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::data::{Acquisition, InstrumentResponse};
    use crate::domain::{IrfSettings, ModelConfig};
    use crate::models::MultiExponentialModel;

    fn model(fit_offset: bool) -> MultiExponentialModel {
        let acq = Arc::new(Acquisition::new(1, 80, 0.0, 0.1).unwrap());
        let settings = IrfSettings {
            timebin_width: 0.1,
            ..IrfSettings::default()
        };
        let irf = Arc::new(InstrumentResponse::gaussian(&settings, 1, 20, 0.6, 0.3).unwrap());
        let config = ModelConfig {
            n_exp: 2,
            fit_offset,
            fit_t0: true,
            t0_shift: 0.01,
            ..ModelConfig::default()
        };
        MultiExponentialModel::new(config, acq, irf).unwrap()
    }

    fn region(model: &MultiExponentialModel, params: &[f64], amps: &[f64]) -> FitRegion {
        let mut scratch = model.new_scratch();
        let mut a = DMatrix::zeros(model.rows_per_region(), model.n_columns());
        model.evaluate(params, 0, &mut scratch, &mut a, None);
        let counts = &a * DVector::from_column_slice(amps);
        // Perturb so the residual is not zero and the second Jacobian term matters.
        let counts = counts.iter().enumerate().map(|(i, v)| v + ((i * 7) % 5) as f64 - 2.0).collect();
        FitRegion {
            label: "r".to_string(),
            source: 0,
            irf_idx: 0,
            counts,
        }
    }

    fn residual(
        projector: &RegionProjector<'_>,
        scratch: &mut ProjectorScratch,
        params: &[f64],
        region: &FitRegion,
        weights: &[f64],
    ) -> Vec<f64> {
        let n = region.counts.len();
        let mut fvec = vec![0.0; n];
        let mut fitted = vec![0.0; n];
        let mut coeffs = vec![0.0; scratch.a.ncols()];
        projector.project(
            params,
            region,
            &region.counts,
            weights,
            scratch,
            RegionRows {
                fvec: &mut fvec,
                fitted: &mut fitted,
                fjac: None,
                coefficients: &mut coeffs,
            },
        );
        fvec
    }

    #[test]
    fn jacobian_matches_finite_differences_of_projected_residual() {
        let model = model(true);
        let nnls = NonNegativeLeastSquares::new();
        let projector = RegionProjector::new(&model, &nnls);
        let mut scratch = ProjectorScratch::new(&model);

        let params = vec![2.0, 0.4, 0.01];
        let region = region(&model, &params, &[300.0, 800.0, 4.0]);
        let weights: Vec<f64> = region.counts.iter().map(|y| 1.0 / (y.max(0.0) + 1.0).sqrt()).collect();
        let n = region.counts.len();

        let mut fvec = vec![0.0; n];
        let mut fitted = vec![0.0; n];
        let mut fjac = vec![0.0; n * 3];
        let mut coeffs = vec![0.0; 3];
        let status = projector.project(
            &params,
            &region,
            &region.counts,
            &weights,
            &mut scratch,
            RegionRows {
                fvec: &mut fvec,
                fitted: &mut fitted,
                fjac: Some(&mut fjac),
                coefficients: &mut coeffs,
            },
        );
        assert_eq!(status, NnlsStatus::Optimal);
        assert!(coeffs.iter().all(|c| *c > 0.0));

        for k in 0..3 {
            let h = 1e-6;
            let mut p = params.clone();
            p[k] += h;
            let plus = residual(&projector, &mut scratch, &p, &region, &weights);
            p[k] -= 2.0 * h;
            let minus = residual(&projector, &mut scratch, &p, &region, &weights);
            let scale = (0..n).map(|i| fjac[i * 3 + k].abs()).fold(0.0, f64::max);
            for i in 0..n {
                let fd = (plus[i] - minus[i]) / (2.0 * h);
                assert!((fd - fjac[i * 3 + k]).abs() < 1e-4 * scale, "param {k} row {i}");
            }
        }
    }

    #[test]
    fn zero_region_gives_zero_rows() {
        let model = model(false);
        let nnls = NonNegativeLeastSquares::new();
        let projector = RegionProjector::new(&model, &nnls);
        let mut scratch = ProjectorScratch::new(&model);
        let n = model.rows_per_region();
        let region = FitRegion {
            label: "empty".to_string(),
            source: 0,
            irf_idx: 0,
            counts: vec![0.0; n],
        };
        let mut fvec = vec![1.0; n];
        let mut fitted = vec![1.0; n];
        let mut fjac = vec![1.0; n * 3];
        let mut coeffs = vec![1.0; 2];
        let status = projector.project(
            &[1.0, 0.5, 0.0],
            &region,
            &region.counts,
            &vec![1.0; n],
            &mut scratch,
            RegionRows {
                fvec: &mut fvec,
                fitted: &mut fitted,
                fjac: Some(&mut fjac),
                coefficients: &mut coeffs,
            },
        );
        assert_eq!(status, NnlsStatus::Degenerate);
        assert!(coeffs.iter().all(|c| *c == 0.0));
        assert!(fvec.iter().chain(&fitted).chain(&fjac).all(|v| *v == 0.0));
    }
}
