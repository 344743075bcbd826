//! Closed-form reconvolution.
//!
//! The IRF is taken as piecewise constant on its own grid. For an IRF bin
//! `[a, a + δ]` with unit mass and a detection bin `[t, t + Δ]`, the expected
//! counts of `e^{-k(t' - s)}` are
//!
//! ```text
//! S(u) = [F(u + Δ) - F(u) - F(u + Δ - δ) + F(u - δ)] / δ,   u = t - a
//! ```
//!
//! which factorizes to `e^{-k(u - δ)} q(Δ) q(δ) / δ` once the bins no longer
//! overlap (`u >= δ`).

use std::sync::Arc;

use super::{rebin_irf, Convolver, DecayTables};
use crate::data::{Acquisition, InstrumentResponse};
use crate::math::basis::{decay_integral, decay_integral_dk, ramp_integral, ramp_integral_dk};

pub struct AnalyticConvolver {
    acquisition: Arc<Acquisition>,
    irf: Arc<InstrumentResponse>,
    tables: DecayTables,
}

impl AnalyticConvolver {
    pub fn new(acquisition: Arc<Acquisition>, irf: Arc<InstrumentResponse>) -> Self {
        let tables = DecayTables::new(&acquisition);
        Self {
            acquisition,
            irf,
            tables,
        }
    }
}

/// Bin response and its rate derivative for one IRF bin at offset `u`.
fn bin_response(k: f64, u: f64, dt: f64, width: f64) -> (f64, f64) {
    if u + dt <= 0.0 {
        return (0.0, 0.0);
    }
    if u >= width {
        let e = (-k * (u - width)).exp();
        let (q_dt, q_w) = (decay_integral(k, dt), decay_integral(k, width));
        let value = e * q_dt * q_w;
        let dvalue = e
            * (decay_integral_dk(k, dt) * q_w + q_dt * decay_integral_dk(k, width)
                - (u - width) * q_dt * q_w);
        return (value / width, dvalue / width);
    }
    let value = ramp_integral(k, u + dt) - ramp_integral(k, u) - ramp_integral(k, u + dt - width)
        + ramp_integral(k, u - width);
    let dvalue = ramp_integral_dk(k, u + dt)
        - ramp_integral_dk(k, u)
        - ramp_integral_dk(k, u + dt - width)
        + ramp_integral_dk(k, u - width);
    (value / width, dvalue / width)
}

impl Convolver for AnalyticConvolver {
    fn compute(&mut self, rate: f64, irf_idx: usize, t0_shift: f64) {
        debug_assert!(rate > 0.0, "decay rate must be positive");
        debug_assert!(irf_idx < self.irf.n_irf());

        let acq = &self.acquisition;
        let irf = &self.irf;
        let n_t_full = acq.n_t_full();
        let dt = acq.bin_width();
        let width = irf.timebin_width();

        let tables = &mut self.tables;
        tables.rate = rate;
        tables.decay.iter_mut().for_each(|v| *v = 0.0);
        tables.ddecay.iter_mut().for_each(|v| *v = 0.0);

        if irf.reference_lifetime().is_some() {
            rebin_irf(irf, irf_idx, acq, t0_shift, &mut tables.irf_grid);
        }

        for c in 0..acq.n_chan().min(irf.n_chan()) {
            let decay = &mut tables.decay[c * n_t_full..(c + 1) * n_t_full];
            let ddecay = &mut tables.ddecay[c * n_t_full..(c + 1) * n_t_full];
            for (j, &mass) in irf.channel(irf_idx, c).iter().enumerate() {
                if mass == 0.0 {
                    continue;
                }
                let a = irf.timebin_t0() + j as f64 * width + t0_shift;
                for i in 0..n_t_full {
                    let (v, dv) = bin_response(rate, acq.bin_start(i) - a, dt, width);
                    decay[i] += mass * v;
                    ddecay[i] += mass * dv;
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

    #[test]
    fn narrow_irf_gives_binned_exponential() {
        let acq = Arc::new(Acquisition::new(1, 50, 0.0, 0.1).unwrap());
        let irf = Arc::new(InstrumentResponse::delta(1, 0.0, 1e-6).unwrap());
        let mut conv = AnalyticConvolver::new(acq, irf);
        let k = 0.8;
        conv.compute(k, 0, 0.0);
        let decay = conv.tables().decay(0);
        for (i, &v) in decay.iter().enumerate() {
            let t = i as f64 * 0.1;
            let expected = ((-k * t).exp() - (-k * (t + 0.1)).exp()) / k;
            assert!((v - expected).abs() < 1e-6 * expected, "bin {i}: {v} vs {expected}");
        }
    }

    #[test]
    fn overlapping_and_separated_forms_meet() {
        let (k, dt, w) = (1.3, 0.05, 0.02);
        let below = bin_response(k, w * (1.0 - 1e-9), dt, w);
        let above = bin_response(k, w, dt, w);
        assert!((below.0 - above.0).abs() < 1e-8 * above.0);
        assert!((below.1 - above.1).abs() < 1e-6 * above.1.abs());
    }

    #[test]
    fn bins_before_the_irf_are_empty() {
        assert_eq!(bin_response(1.0, -0.2, 0.1, 0.05), (0.0, 0.0));
    }

    #[test]
    fn total_counts_match_decay_integral() {
        // Grid long enough that nothing escapes: sum over bins = 1/k.
        let acq = Arc::new(Acquisition::new(1, 2000, -1.0, 0.02).unwrap());
        let irf = Arc::new(InstrumentResponse::delta(1, 0.013, 0.031).unwrap());
        let mut conv = AnalyticConvolver::new(acq, irf);
        conv.compute(2.0, 0, 0.0);
        let total: f64 = conv.tables().decay(0).iter().sum();
        assert!((total - 0.5).abs() < 1e-9);
    }
}
