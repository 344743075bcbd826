//! Instrument-response convolution kernels.
//!
//! A kernel turns a decay rate into the expected counts of a unit-amplitude
//! exponential `e^{-kt}` reconvolved with the IRF, for every channel and
//! every bin of the full time grid, together with its derivative w.r.t. `k`.
//!
//! Contract:
//! - `compute` must be called before `add_decay` / `add_derivative` for a
//!   rate; the last rate is cached (`rate()`) but never re-validated.
//! - rates must be `> 0` and IRF indices in range (checked in debug builds only).
//!
//! Two variants share the capability set and are chosen once per model:
//! [`AnalyticConvolver`] and [`NumericalConvolver`].

use std::ops::Range;
use std::sync::Arc;

use crate::data::{Acquisition, InstrumentResponse};
use crate::domain::ConvolverKind;

pub mod analytic;
pub mod numerical;

pub use analytic::AnalyticConvolver;
pub use numerical::NumericalConvolver;

/// Shared capability set of the convolution kernels.
pub trait Convolver: Send {
    /// Evaluate the reconvolved decay and its rate derivative.
    fn compute(&mut self, rate: f64, irf_idx: usize, t0_shift: f64);

    /// Tables filled by the last `compute`.
    fn tables(&self) -> &DecayTables;

    /// Rate of the last `compute` (negative before the first call).
    fn rate(&self) -> f64 {
        self.tables().rate
    }

    /// Add `fact * channel_factors[c] * decay` into the gated design column `a`.
    ///
    /// A positive `ref_lifetime` selects reference reconvolution. Time shifts
    /// are applied by `compute`, so the column and its derivative always
    /// share one time axis.
    fn add_decay(&self, fact: f64, channel_factors: &[f64], ref_lifetime: f64, a: &mut [f64]) {
        self.tables().add_decay(fact, channel_factors, ref_lifetime, a);
    }

    /// Add `fact * channel_factors[c] * ∂decay/∂k` into the gated column `b`.
    fn add_derivative(&self, fact: f64, channel_factors: &[f64], ref_lifetime: f64, b: &mut [f64]) {
        self.tables().add_derivative(fact, channel_factors, ref_lifetime, b);
    }
}

/// Build a kernel of the requested kind.
pub fn make_convolver(
    kind: ConvolverKind,
    acquisition: Arc<Acquisition>,
    irf: Arc<InstrumentResponse>,
) -> Box<dyn Convolver> {
    match kind {
        ConvolverKind::Analytic => Box::new(AnalyticConvolver::new(acquisition, irf)),
        ConvolverKind::Numerical => Box::new(NumericalConvolver::new(acquisition, irf)),
    }
}

/// Build `n` independent kernels of the same kind.
pub fn make_convolvers(
    n: usize,
    kind: ConvolverKind,
    acquisition: &Arc<Acquisition>,
    irf: &Arc<InstrumentResponse>,
) -> Vec<Box<dyn Convolver>> {
    (0..n)
        .map(|_| make_convolver(kind, Arc::clone(acquisition), Arc::clone(irf)))
        .collect()
}

/// Per-channel tables on the full time grid, channel-major.
#[derive(Debug, Clone)]
pub struct DecayTables {
    n_chan: usize,
    n_t_full: usize,
    gate: Range<usize>,
    rate: f64,
    /// IRF ⊗ e^{-kt}, integrated over each bin.
    decay: Vec<f64>,
    /// ∂decay/∂k.
    ddecay: Vec<f64>,
    /// IRF mass falling into each data bin (after the time shift).
    irf_grid: Vec<f64>,
}

impl DecayTables {
    fn new(acquisition: &Acquisition) -> Self {
        let len = acquisition.n_chan() * acquisition.n_t_full();
        Self {
            n_chan: acquisition.n_chan(),
            n_t_full: acquisition.n_t_full(),
            gate: acquisition.gate(),
            rate: -1.0,
            decay: vec![0.0; len],
            ddecay: vec![0.0; len],
            irf_grid: vec![0.0; len],
        }
    }

    pub fn decay(&self, chan: usize) -> &[f64] {
        &self.decay[chan * self.n_t_full..(chan + 1) * self.n_t_full]
    }

    pub fn derivative(&self, chan: usize) -> &[f64] {
        &self.ddecay[chan * self.n_t_full..(chan + 1) * self.n_t_full]
    }

    fn add_decay(&self, fact: f64, channel_factors: &[f64], ref_lifetime: f64, a: &mut [f64]) {
        let n_t = self.gate.len();
        debug_assert!(a.len() >= self.n_chan * n_t);
        let ref_factor = reference_factor(ref_lifetime, self.rate);

        for c in 0..self.n_chan {
            let scale = fact * channel_factor(channel_factors, c);
            let base = c * self.n_t_full;
            let out = &mut a[c * n_t..(c + 1) * n_t];
            for (o, i) in out.iter_mut().zip(self.gate.clone()) {
                let src = base + i;
                let value = match ref_factor {
                    Some(f) => self.irf_grid[src] + f * self.decay[src],
                    None => self.decay[src],
                };
                *o += scale * value;
            }
        }
    }

    fn add_derivative(&self, fact: f64, channel_factors: &[f64], ref_lifetime: f64, b: &mut [f64]) {
        let n_t = self.gate.len();
        debug_assert!(b.len() >= self.n_chan * n_t);
        let ref_factor = reference_factor(ref_lifetime, self.rate);

        for c in 0..self.n_chan {
            let scale = fact * channel_factor(channel_factors, c);
            let base = c * self.n_t_full;
            let out = &mut b[c * n_t..(c + 1) * n_t];
            for (o, i) in out.iter_mut().zip(self.gate.clone()) {
                let src = base + i;
                // d/dk [R + (1/τ_ref - k) R⊗e] = (1/τ_ref - k) ∂(R⊗e)/∂k - R⊗e
                let value = match ref_factor {
                    Some(f) => f * self.ddecay[src] - self.decay[src],
                    None => self.ddecay[src],
                };
                *o += scale * value;
            }
        }
    }
}

fn reference_factor(ref_lifetime: f64, rate: f64) -> Option<f64> {
    (ref_lifetime > 0.0).then(|| 1.0 / ref_lifetime - rate)
}

fn channel_factor(channel_factors: &[f64], chan: usize) -> f64 {
    channel_factors.get(chan).copied().unwrap_or(1.0)
}

/// Distribute the (shifted) piecewise-constant IRF mass onto the data grid.
///
/// Mass that falls outside the grid is dropped.
fn rebin_irf(
    irf: &InstrumentResponse,
    irf_idx: usize,
    acquisition: &Acquisition,
    t0_shift: f64,
    out: &mut [f64],
) {
    out.iter_mut().for_each(|v| *v = 0.0);
    let n_t_full = acquisition.n_t_full();
    let dt = acquisition.bin_width();
    let grid_t0 = acquisition.bin_start(0);
    let width = irf.timebin_width();

    for c in 0..irf.n_chan().min(acquisition.n_chan()) {
        let row = &mut out[c * n_t_full..(c + 1) * n_t_full];
        for (j, &mass) in irf.channel(irf_idx, c).iter().enumerate() {
            if mass == 0.0 {
                continue;
            }
            let lo = irf.timebin_t0() + j as f64 * width + t0_shift;
            let hi = lo + width;
            let first = ((lo - grid_t0) / dt).floor().max(0.0) as usize;
            let last = ((hi - grid_t0) / dt).ceil().max(0.0) as usize;
            for (i, slot) in row.iter_mut().enumerate().take(last.min(n_t_full)).skip(first) {
                let b_lo = acquisition.bin_start(i);
                let overlap = hi.min(b_lo + dt) - lo.max(b_lo);
                if overlap > 0.0 {
                    *slot += mass * overlap / width;
                }
            }
        }
    }
}
