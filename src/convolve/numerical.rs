//! Discrete reconvolution on the data grid.
//!
//! The IRF is first resampled onto the data bins (mass-conserving, with the
//! time shift applied), then convolved with the bin-integrated decay kernel
//!
//! ```text
//! e_0 = F(Δ) / Δ
//! e_m = e^{-kmΔ} Δ sinhc(kΔ/2)²       (m >= 1)
//! ```
//!
//! which treats the resampled IRF mass as uniform inside each data bin.

use std::sync::Arc;

use super::{rebin_irf, Convolver, DecayTables};
use crate::data::{Acquisition, InstrumentResponse};
use crate::math::basis::{ramp_integral, ramp_integral_dk, sinhc, sinhc_du};

pub struct NumericalConvolver {
    acquisition: Arc<Acquisition>,
    irf: Arc<InstrumentResponse>,
    tables: DecayTables,
    kernel: Vec<f64>,
    dkernel: Vec<f64>,
    /// `(irf_idx, t0_shift)` the resampled IRF currently reflects.
    resampled: Option<(usize, f64)>,
}

impl NumericalConvolver {
    pub fn new(acquisition: Arc<Acquisition>, irf: Arc<InstrumentResponse>) -> Self {
        let tables = DecayTables::new(&acquisition);
        let n = acquisition.n_t_full();
        Self {
            acquisition,
            irf,
            tables,
            kernel: vec![0.0; n],
            dkernel: vec![0.0; n],
            resampled: None,
        }
    }

    fn fill_kernel(&mut self, k: f64) {
        let dt = self.acquisition.bin_width();
        let u = 0.5 * k * dt;
        let s = sinhc(u);
        let p = dt * s * s;
        let dp = dt * dt * s * sinhc_du(u);

        self.kernel[0] = ramp_integral(k, dt) / dt;
        self.dkernel[0] = ramp_integral_dk(k, dt) / dt;
        for m in 1..self.kernel.len() {
            let tm = m as f64 * dt;
            let e = (-k * tm).exp();
            self.kernel[m] = e * p;
            self.dkernel[m] = e * (dp - tm * p);
        }
    }
}

impl Convolver for NumericalConvolver {
    fn compute(&mut self, rate: f64, irf_idx: usize, t0_shift: f64) {
        debug_assert!(rate > 0.0, "decay rate must be positive");
        debug_assert!(irf_idx < self.irf.n_irf());

        if self.resampled != Some((irf_idx, t0_shift)) {
            rebin_irf(&self.irf, irf_idx, &self.acquisition, t0_shift, &mut self.tables.irf_grid);
            self.resampled = Some((irf_idx, t0_shift));
        }
        self.fill_kernel(rate);

        let n_t_full = self.acquisition.n_t_full();
        let tables = &mut self.tables;
        tables.rate = rate;

        for c in 0..self.acquisition.n_chan() {
            let range = c * n_t_full..(c + 1) * n_t_full;
            let irf = &tables.irf_grid[range.clone()];
            let decay = &mut tables.decay[range.clone()];
            let ddecay = &mut tables.ddecay[range];
            decay.iter_mut().for_each(|v| *v = 0.0);
            ddecay.iter_mut().for_each(|v| *v = 0.0);

            for (j, &mass) in irf.iter().enumerate() {
                if mass == 0.0 {
                    continue;
                }
                let out = decay[j..].iter_mut().zip(ddecay[j..].iter_mut());
                for ((d, dd), (e, de)) in out.zip(self.kernel.iter().zip(&self.dkernel)) {
                    *d += mass * e;
                    *dd += mass * de;
                }
            }
        }
    }

    fn tables(&self) -> &DecayTables {
        &self.tables
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::IrfSettings;

    #[test]
    fn kernel_matches_direct_bin_integral() {
        let acq = Arc::new(Acquisition::new(1, 20, 0.0, 0.1).unwrap());
        let irf = Arc::new(InstrumentResponse::delta(1, 0.0, 0.1).unwrap());
        let mut conv = NumericalConvolver::new(acq, irf);
        let k = 1.7;
        conv.fill_kernel(k);
        for m in 1..20 {
            // (1/Δ) ∫_0^Δ ds ∫_{mΔ}^{(m+1)Δ} e^{-k(t-s)} dt
            let q = (1.0 - (-k * 0.1f64).exp()) / k;
            let expected = (-k * (m as f64 - 1.0) * 0.1).exp() * q * q / 0.1;
            assert!((conv.kernel[m] - expected).abs() < 1e-13 * expected);
        }
    }

    #[test]
    fn resampled_irf_is_cached_per_shift() {
        let settings = IrfSettings {
            timebin_width: 0.05,
            ..IrfSettings::default()
        };
        let acq = Arc::new(Acquisition::new(1, 100, 0.0, 0.05).unwrap());
        let irf = Arc::new(InstrumentResponse::gaussian(&settings, 1, 40, 0.8, 0.2).unwrap());
        let mut conv = NumericalConvolver::new(acq, irf);
        conv.compute(1.0, 0, 0.0);
        assert_eq!(conv.resampled, Some((0, 0.0)));
        let first = conv.tables().decay(0).to_vec();
        conv.compute(1.0, 0, 0.02);
        assert_eq!(conv.resampled, Some((0, 0.02)));
        assert_ne!(conv.tables().decay(0), first.as_slice());
        conv.compute(1.0, 0, 0.0);
        assert_eq!(conv.tables().decay(0), first.as_slice());
    }
}
