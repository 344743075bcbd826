//! Multi-exponential decay model.
//!
//! Nonlinear parameters: `[k_1 .. k_n, (t0)]`, decay rates in 1/ns followed by
//! the IRF time shift when it is fitted.
//!
//! Design matrix columns (per region, rows = `n_chan * n_t` gated bins):
//! - one column per component: `channel_factor[c] * (IRF ⊗ e^{-k_i t})`
//! - an optional constant offset column (all ones)
//!
//! Derivative matrix `j` holds `∂A/∂α_j`; a rate only touches its own column,
//! the time shift touches every decay column.

use std::sync::Arc;

use nalgebra::DMatrix;

use crate::convolve::{make_convolvers, Convolver};
use crate::data::{Acquisition, InstrumentResponse};
use crate::domain::ModelConfig;
use crate::error::{FitError, Result};

/// Rates are kept above this (1/ns) so every component stays a decay.
pub const MIN_RATE: f64 = 1e-4;

/// Central-difference step (ns) for the time-shift derivative.
const T0_STEP: f64 = 1e-3;

/// Per-thread model workspace.
pub struct ModelScratch {
    convolvers: Vec<Box<dyn Convolver>>,
}

/// What the fitter needs from a decay model.
pub trait DecayModel: Send + Sync {
    /// Linear columns per region.
    fn n_columns(&self) -> usize;

    /// Length of the nonlinear parameter vector.
    fn n_nonlinear(&self) -> usize;

    fn parameter_names(&self) -> Vec<String>;

    /// Observations per region (`n_chan * n_t` gated).
    fn rows_per_region(&self) -> usize;

    fn acquisition(&self) -> &Arc<Acquisition>;

    fn irf(&self) -> &Arc<InstrumentResponse>;

    fn channel_factors(&self) -> &[f64];

    fn new_scratch(&self) -> ModelScratch;

    /// Fill the unweighted design matrix `a` (`rows_per_region × n_columns`)
    /// and, when requested, one derivative matrix per nonlinear parameter.
    ///
    /// Rate derivatives are exact. The time-shift derivative of a fitted `t0`
    /// is a central difference with a fixed step of `1e-3` ns, which costs two
    /// extra kernel evaluations per component and pass.
    fn evaluate(
        &self,
        params: &[f64],
        irf_idx: usize,
        scratch: &mut ModelScratch,
        a: &mut DMatrix<f64>,
        derivatives: Option<&mut [DMatrix<f64>]>,
    );

    /// Map parameters back into the admissible region.
    fn project(&self, params: &mut [f64]);

    /// Decay rates from the parameter vector.
    fn rates<'a>(&self, params: &'a [f64]) -> &'a [f64];

    /// Whether the last linear column is the constant offset.
    fn has_offset(&self) -> bool;
}

pub struct MultiExponentialModel {
    config: ModelConfig,
    acquisition: Arc<Acquisition>,
    irf: Arc<InstrumentResponse>,
    channel_factors: Vec<f64>,
    ref_lifetime: f64,
}

impl MultiExponentialModel {
    pub fn new(config: ModelConfig, acquisition: Arc<Acquisition>, irf: Arc<InstrumentResponse>) -> Result<Self> {
        if config.n_exp == 0 {
            return Err(FitError::config("The model needs at least one exponential component."));
        }
        if irf.n_chan() != acquisition.n_chan() {
            return Err(FitError::config(format!(
                "IRF has {} channels but the data has {}.",
                irf.n_chan(),
                acquisition.n_chan()
            )));
        }
        let channel_factors = if config.channel_factors.is_empty() {
            vec![1.0; acquisition.n_chan()]
        } else if config.channel_factors.len() == acquisition.n_chan() {
            config.channel_factors.clone()
        } else {
            return Err(FitError::config(format!(
                "Got {} channel factors for {} channels.",
                config.channel_factors.len(),
                acquisition.n_chan()
            )));
        };
        if channel_factors.iter().any(|f| !f.is_finite() || *f < 0.0) {
            return Err(FitError::config("Channel factors must be finite and non-negative."));
        }
        if !config.t0_shift.is_finite() {
            return Err(FitError::config("IRF time shift must be finite."));
        }

        let ref_lifetime = irf.reference_lifetime().unwrap_or(0.0);
        Ok(Self {
            config,
            acquisition,
            irf,
            channel_factors,
            ref_lifetime,
        })
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    /// Initial parameter vector from lifetime guesses (ns).
    pub fn initial_parameters(&self, lifetimes: &[f64]) -> Result<Vec<f64>> {
        if lifetimes.len() != self.config.n_exp {
            return Err(FitError::config(format!(
                "Got {} initial lifetimes for {} components.",
                lifetimes.len(),
                self.config.n_exp
            )));
        }
        if lifetimes.iter().any(|t| !t.is_finite() || *t <= 0.0) {
            return Err(FitError::config("Initial lifetimes must be positive."));
        }
        let mut params: Vec<f64> = lifetimes.iter().map(|t| 1.0 / t).collect();
        if self.config.fit_t0 {
            params.push(self.config.t0_shift);
        }
        Ok(params)
    }

    fn t0_shift(&self, params: &[f64]) -> f64 {
        if self.config.fit_t0 {
            params[self.config.n_exp]
        } else {
            self.config.t0_shift
        }
    }

    fn fill_columns(&self, convolvers: &[Box<dyn Convolver>], out: &mut [f64], sign: f64) {
        let n_rows = self.rows_per_region();
        for (i, conv) in convolvers.iter().enumerate() {
            let col = &mut out[i * n_rows..(i + 1) * n_rows];
            conv.add_decay(sign, &self.channel_factors, self.ref_lifetime, col);
        }
    }
}

impl DecayModel for MultiExponentialModel {
    fn n_columns(&self) -> usize {
        self.config.n_exp + usize::from(self.config.fit_offset)
    }

    fn n_nonlinear(&self) -> usize {
        self.config.n_exp + usize::from(self.config.fit_t0)
    }

    fn parameter_names(&self) -> Vec<String> {
        let mut names: Vec<String> = (1..=self.config.n_exp).map(|i| format!("k{i}")).collect();
        if self.config.fit_t0 {
            names.push("t0".to_string());
        }
        names
    }

    fn rows_per_region(&self) -> usize {
        self.acquisition.n_rows()
    }

    fn acquisition(&self) -> &Arc<Acquisition> {
        &self.acquisition
    }

    fn irf(&self) -> &Arc<InstrumentResponse> {
        &self.irf
    }

    fn channel_factors(&self) -> &[f64] {
        &self.channel_factors
    }

    fn new_scratch(&self) -> ModelScratch {
        ModelScratch {
            convolvers: make_convolvers(self.config.n_exp, self.config.convolver, &self.acquisition, &self.irf),
        }
    }

    fn evaluate(
        &self,
        params: &[f64],
        irf_idx: usize,
        scratch: &mut ModelScratch,
        a: &mut DMatrix<f64>,
        derivatives: Option<&mut [DMatrix<f64>]>,
    ) {
        let n_exp = self.config.n_exp;
        let n_rows = self.rows_per_region();
        debug_assert_eq!(params.len(), self.n_nonlinear());
        debug_assert_eq!(a.shape(), (n_rows, self.n_columns()));

        let t0 = self.t0_shift(params);
        let rates = &params[..n_exp];

        if let Some(derivs) = derivatives {
            debug_assert_eq!(derivs.len(), self.n_nonlinear());
            derivs.iter_mut().for_each(|d| d.fill(0.0));

            if self.config.fit_t0 {
                let d_t0 = derivs[n_exp].as_mut_slice();
                for (conv, &k) in scratch.convolvers.iter_mut().zip(rates) {
                    conv.compute(k, irf_idx, t0 + T0_STEP);
                }
                self.fill_columns(&scratch.convolvers, d_t0, 0.5 / T0_STEP);
                for (conv, &k) in scratch.convolvers.iter_mut().zip(rates) {
                    conv.compute(k, irf_idx, t0 - T0_STEP);
                }
                self.fill_columns(&scratch.convolvers, d_t0, -0.5 / T0_STEP);
            }

            for (conv, &k) in scratch.convolvers.iter_mut().zip(rates) {
                conv.compute(k, irf_idx, t0);
            }
            for (i, conv) in scratch.convolvers.iter().enumerate() {
                let col = &mut derivs[i].as_mut_slice()[i * n_rows..(i + 1) * n_rows];
                conv.add_derivative(1.0, &self.channel_factors, self.ref_lifetime, col);
            }
        } else {
            for (conv, &k) in scratch.convolvers.iter_mut().zip(rates) {
                conv.compute(k, irf_idx, t0);
            }
        }

        a.fill(0.0);
        let cols = a.as_mut_slice();
        self.fill_columns(&scratch.convolvers, cols, 1.0);
        if self.config.fit_offset {
            cols[n_exp * n_rows..(n_exp + 1) * n_rows].fill(1.0);
        }
    }

    fn project(&self, params: &mut [f64]) {
        for k in params[..self.config.n_exp].iter_mut() {
            if !(*k >= MIN_RATE) {
                *k = MIN_RATE;
            }
        }
    }

    fn rates<'a>(&self, params: &'a [f64]) -> &'a [f64] {
        &params[..self.config.n_exp]
    }

    fn has_offset(&self) -> bool {
        self.config.fit_offset
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ConvolverKind, IrfSettings};

    fn setup(config: ModelConfig) -> MultiExponentialModel {
        let acq = Arc::new(Acquisition::new(2, 120, 0.0, 0.05).unwrap());
        let settings = IrfSettings {
            timebin_width: 0.05,
            ..IrfSettings::default()
        };
        let irf = Arc::new(InstrumentResponse::gaussian(&settings, 2, 40, 0.8, 0.2).unwrap());
        MultiExponentialModel::new(config, acq, irf).unwrap()
    }

    fn matrices(model: &MultiExponentialModel) -> (DMatrix<f64>, Vec<DMatrix<f64>>) {
        let a = DMatrix::zeros(model.rows_per_region(), model.n_columns());
        let d = (0..model.n_nonlinear()).map(|_| a.clone()).collect();
        (a, d)
    }

    #[test]
    fn layout_follows_configuration() {
        let model = setup(ModelConfig {
            n_exp: 2,
            fit_offset: true,
            fit_t0: true,
            ..ModelConfig::default()
        });
        assert_eq!(model.n_columns(), 3);
        assert_eq!(model.n_nonlinear(), 3);
        assert_eq!(model.parameter_names(), vec!["k1", "k2", "t0"]);
        assert_eq!(model.rows_per_region(), 240);
        assert_eq!(model.initial_parameters(&[0.5, 2.0]).unwrap(), vec![2.0, 0.5, 0.0]);
        assert!(model.initial_parameters(&[1.0]).is_err());
    }

    #[test]
    fn channel_factor_count_must_match() {
        let acq = Arc::new(Acquisition::new(2, 10, 0.0, 0.1).unwrap());
        let irf = Arc::new(InstrumentResponse::delta(2, 0.0, 0.1).unwrap());
        let config = ModelConfig {
            channel_factors: vec![1.0, 2.0, 3.0],
            ..ModelConfig::default()
        };
        assert!(MultiExponentialModel::new(config, acq, irf).is_err());
    }

    #[test]
    fn derivatives_match_finite_differences() {
        for convolver in [ConvolverKind::Analytic, ConvolverKind::Numerical] {
            let model = setup(ModelConfig {
                n_exp: 2,
                convolver,
                channel_factors: vec![1.0, 0.6],
                fit_offset: true,
                fit_t0: true,
                t0_shift: 0.02,
            });
            let mut scratch = model.new_scratch();
            let params = vec![1.5, 0.3, 0.02];
            let (mut a, mut d) = matrices(&model);
            model.evaluate(&params, 0, &mut scratch, &mut a, Some(&mut d));

            for j in 0..3 {
                let h = 1e-5;
                let mut p = params.clone();
                p[j] += h;
                let (mut ap, _) = matrices(&model);
                model.evaluate(&p, 0, &mut scratch, &mut ap, None);
                p[j] -= 2.0 * h;
                let (mut am, _) = matrices(&model);
                model.evaluate(&p, 0, &mut scratch, &mut am, None);
                let fd = (ap - am) / (2.0 * h);
                let scale = d[j].amax().max(1e-12);
                assert!((&fd - &d[j]).amax() < 1e-4 * scale, "{convolver:?} param {j}");
            }
            // Offset column carries no nonlinear dependence.
            assert!(d.iter().all(|m| m.column(2).iter().all(|v| *v == 0.0)));
            assert!(a.column(2).iter().all(|v| *v == 1.0));
        }
    }

    #[test]
    fn projection_keeps_rates_positive() {
        let model = setup(ModelConfig {
            n_exp: 2,
            fit_t0: true,
            ..ModelConfig::default()
        });
        let mut p = vec![-1.0, f64::NAN, -0.3];
        model.project(&mut p);
        assert_eq!(&p[..2], &[MIN_RATE, MIN_RATE]);
        assert_eq!(p[2], -0.3);
    }
}
