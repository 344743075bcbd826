//! Time axis of the measurement and the instrument response.
//!
//! Layout conventions used everywhere in the crate:
//!
//! - counts are stored channel-major: `counts[chan * n_t + bin]`
//! - the data grid is uniform: bin `i` covers `[t0 + i*w, t0 + (i+1)*w)`
//! - the gate selects the contiguous bin range that is actually fitted

use std::ops::Range;

use crate::domain::IrfSettings;
use crate::error::{FitError, Result};

/// Uniform time grid of a TCSPC histogram plus the fitted gate.
#[derive(Debug, Clone)]
pub struct Acquisition {
    n_chan: usize,
    n_t_full: usize,
    t0: f64,
    bin_width: f64,
    gate: Range<usize>,
}

impl Acquisition {
    pub fn new(n_chan: usize, n_t: usize, t0: f64, bin_width: f64) -> Result<Self> {
        if n_chan == 0 || n_t == 0 {
            return Err(FitError::config(format!(
                "Acquisition needs at least one channel and one time bin (n_chan={n_chan}, n_t={n_t})."
            )));
        }
        if !(bin_width.is_finite() && bin_width > 0.0 && t0.is_finite()) {
            return Err(FitError::config(format!(
                "Invalid time grid: t0={t0}, bin_width={bin_width}."
            )));
        }
        Ok(Self {
            n_chan,
            n_t_full: n_t,
            t0,
            bin_width,
            gate: 0..n_t,
        })
    }

    /// Restrict fitting to bins lying entirely inside `[t_start, t_stop]`.
    pub fn with_gate(mut self, t_start: f64, t_stop: f64) -> Result<Self> {
        let first = (0..self.n_t_full).find(|&i| self.bin_start(i) >= t_start - 1e-9);
        let last = (0..self.n_t_full)
            .rev()
            .find(|&i| self.bin_start(i) + self.bin_width <= t_stop + 1e-9);
        match (first, last) {
            (Some(first), Some(last)) if last >= first => {
                self.gate = first..last + 1;
                Ok(self)
            }
            _ => Err(FitError::config(format!(
                "Time gate [{t_start}, {t_stop}] ns selects no bins."
            ))),
        }
    }

    pub fn n_chan(&self) -> usize {
        self.n_chan
    }

    /// Number of bins on the full (ungated) grid.
    pub fn n_t_full(&self) -> usize {
        self.n_t_full
    }

    /// Number of fitted bins per channel.
    pub fn n_t(&self) -> usize {
        self.gate.len()
    }

    pub fn gate(&self) -> Range<usize> {
        self.gate.clone()
    }

    pub fn bin_width(&self) -> f64 {
        self.bin_width
    }

    /// Start time of bin `i` on the full grid.
    pub fn bin_start(&self, i: usize) -> f64 {
        self.t0 + i as f64 * self.bin_width
    }

    /// Observations per region after gating.
    pub fn n_rows(&self) -> usize {
        self.n_chan * self.n_t()
    }

    /// Start times of the gated bins.
    pub fn timepoints(&self) -> Vec<f64> {
        self.gate.clone().map(|i| self.bin_start(i)).collect()
    }
}

/// One or more measured instrument responses.
///
/// Each IRF holds `n_chan` channels on its own uniform grid and every channel
/// is normalized to unit sum. Regions refer to an IRF by index, which allows
/// spatially varying responses.
#[derive(Debug, Clone)]
pub struct InstrumentResponse {
    n_chan: usize,
    n_t: usize,
    timebin_t0: f64,
    timebin_width: f64,
    reference_lifetime: Option<f64>,
    irfs: Vec<Vec<f64>>,
}

impl InstrumentResponse {
    /// Build from one channel-major IRF histogram.
    pub fn new(settings: &IrfSettings, n_chan: usize, n_t: usize, data: &[f64]) -> Result<Self> {
        if n_chan == 0 || n_t == 0 {
            return Err(FitError::config("IRF needs at least one channel and one bin."));
        }
        if !(settings.timebin_width.is_finite() && settings.timebin_width > 0.0) {
            return Err(FitError::config(format!(
                "Invalid IRF bin width: {}.",
                settings.timebin_width
            )));
        }
        let reference_lifetime = if settings.reference_reconvolution {
            if !(settings.reference_lifetime.is_finite() && settings.reference_lifetime > 0.0) {
                return Err(FitError::config(format!(
                    "Reference lifetime must be > 0 (got {}).",
                    settings.reference_lifetime
                )));
            }
            Some(settings.reference_lifetime)
        } else {
            None
        };

        let mut irf = Self {
            n_chan,
            n_t,
            timebin_t0: settings.timebin_t0,
            timebin_width: settings.timebin_width,
            reference_lifetime,
            irfs: Vec::new(),
        };
        irf.add_irf(data)?;
        Ok(irf)
    }

    /// A single bin of width `width` at `t0` in every channel.
    ///
    /// With a narrow width this is the identity response.
    pub fn delta(n_chan: usize, t0: f64, width: f64) -> Result<Self> {
        let settings = IrfSettings {
            timebin_t0: t0,
            timebin_width: width,
            ..IrfSettings::default()
        };
        Self::new(&settings, n_chan, 1, &vec![1.0; n_chan])
    }

    /// Sampled Gaussian response, identical in every channel.
    pub fn gaussian(settings: &IrfSettings, n_chan: usize, n_t: usize, center: f64, fwhm: f64) -> Result<Self> {
        if !(fwhm.is_finite() && fwhm > 0.0) {
            return Err(FitError::config(format!("Invalid IRF FWHM: {fwhm}.")));
        }
        let sigma = fwhm / (8.0 * 2f64.ln()).sqrt();
        let mut data = Vec::with_capacity(n_chan * n_t);
        for _ in 0..n_chan {
            for j in 0..n_t {
                let t = settings.timebin_t0 + (j as f64 + 0.5) * settings.timebin_width;
                let z = (t - center) / sigma;
                data.push((-0.5 * z * z).exp());
            }
        }
        Self::new(settings, n_chan, n_t, &data)
    }

    /// Append another IRF (same grid and channel count) and return its index.
    pub fn add_irf(&mut self, data: &[f64]) -> Result<usize> {
        if data.len() != self.n_chan * self.n_t {
            return Err(FitError::config(format!(
                "IRF data has {} values, expected {} ({} channels x {} bins).",
                data.len(),
                self.n_chan * self.n_t,
                self.n_chan,
                self.n_t
            )));
        }
        if data.iter().any(|v| !v.is_finite() || *v < 0.0) {
            return Err(FitError::config("IRF values must be finite and non-negative."));
        }

        let mut normalized = data.to_vec();
        for chan in normalized.chunks_mut(self.n_t) {
            let sum: f64 = chan.iter().sum();
            if sum <= 0.0 {
                return Err(FitError::config("Every IRF channel needs a positive total."));
            }
            chan.iter_mut().for_each(|v| *v /= sum);
        }
        self.irfs.push(normalized);
        Ok(self.irfs.len() - 1)
    }

    pub fn n_chan(&self) -> usize {
        self.n_chan
    }

    pub fn n_t(&self) -> usize {
        self.n_t
    }

    pub fn n_irf(&self) -> usize {
        self.irfs.len()
    }

    pub fn timebin_t0(&self) -> f64 {
        self.timebin_t0
    }

    pub fn timebin_width(&self) -> f64 {
        self.timebin_width
    }

    /// Reference lifetime when the IRF is a measured reference decay.
    pub fn reference_lifetime(&self) -> Option<f64> {
        self.reference_lifetime
    }

    /// Normalized IRF values of one channel.
    pub fn channel(&self, irf_idx: usize, chan: usize) -> &[f64] {
        let irf = &self.irfs[irf_idx];
        &irf[chan * self.n_t..(chan + 1) * self.n_t]
    }
}
