//! Synthetic FLIM dataset generation.
//!
//! Regions share the same lifetimes and differ in their amplitude mix. Counts
//! are the analytic reconvolved decays of a Gaussian IRF, scaled to the
//! requested photon budget, plus a flat background, then Poisson sampled.

use std::sync::Arc;

use nalgebra::DMatrix;
use rand::prelude::*;
use rand::rngs::StdRng;
use rand_distr::Poisson;

use crate::convolve::{Convolver, NumericalConvolver};
use crate::data::{Acquisition, Dataset, InstrumentResponse, Region};
use crate::domain::{ConvolverKind, IrfSettings, ModelConfig, SampleConfig, SampleTruth};
use crate::error::{FitError, Result};
use crate::models::{DecayModel, MultiExponentialModel};

/// The IRF grid extends this many FWHM past the peak.
const IRF_SPAN_FWHM: f64 = 4.0;

#[derive(Debug, Clone)]
pub struct SampleData {
    pub dataset: Dataset,
    /// Response to fit with (a reference decay in reference mode).
    pub irf: InstrumentResponse,
    pub truth: SampleTruth,
}

pub fn generate_sample(config: &SampleConfig, irf_settings: &IrfSettings) -> Result<SampleData> {
    if config.n_regions == 0 {
        return Err(FitError::config("Region count must be > 0."));
    }
    if config.lifetimes.is_empty() || config.lifetimes.iter().any(|t| !t.is_finite() || *t <= 0.0) {
        return Err(FitError::config("Sample lifetimes must be positive."));
    }
    if !(config.counts_per_region.is_finite() && config.counts_per_region >= 0.0) {
        return Err(FitError::config("Counts per region must be >= 0."));
    }
    if !(config.background.is_finite() && config.background >= 0.0) {
        return Err(FitError::config("Background must be >= 0."));
    }

    let acquisition = Acquisition::new(config.n_chan, config.n_t, 0.0, config.bin_width)?;
    let irf_bins = (((config.irf_center + IRF_SPAN_FWHM * config.irf_fwhm) - irf_settings.timebin_t0)
        / irf_settings.timebin_width)
        .ceil()
        .max(1.0) as usize;
    let plain_settings = IrfSettings {
        reference_reconvolution: false,
        ..irf_settings.clone()
    };
    let plain_irf = InstrumentResponse::gaussian(
        &plain_settings,
        config.n_chan,
        irf_bins,
        config.irf_center,
        config.irf_fwhm,
    )?;

    let rates: Vec<f64> = config.lifetimes.iter().map(|t| 1.0 / t).collect();
    let columns = unit_decays(&acquisition, &plain_irf, &rates)?;
    let column_totals: Vec<f64> = columns.column_iter().map(|c| c.sum()).collect();

    let mut rng = StdRng::seed_from_u64(config.seed);
    let mut dataset = Dataset::new(acquisition);
    let mut amplitudes = Vec::with_capacity(config.n_regions + config.n_empty_regions);

    for r in 0..config.n_regions {
        // Random mix of the components, normalized to the photon budget.
        let weights: Vec<f64> = rates.iter().map(|_| rng.gen_range(0.2..1.0)).collect();
        let sum: f64 = weights.iter().sum();
        let amps: Vec<f64> = weights
            .iter()
            .zip(&column_totals)
            .map(|(w, total)| config.counts_per_region * w / sum / total.max(f64::MIN_POSITIVE))
            .collect();

        let expected = &columns * nalgebra::DVector::from_column_slice(&amps);
        let counts = expected
            .iter()
            .map(|&mu| {
                let mu = mu + config.background;
                if config.noise_free {
                    Ok(mu)
                } else {
                    draw_poisson(&mut rng, mu)
                }
            })
            .collect::<Result<Vec<f64>>>()?;

        dataset.push_region(Region {
            label: format!("R{:04}", r + 1),
            counts,
            irf_idx: 0,
        })?;
        amplitudes.push(amps);
    }

    for r in 0..config.n_empty_regions {
        dataset.push_region(Region {
            label: format!("E{:04}", r + 1),
            counts: vec![0.0; columns.nrows()],
            irf_idx: 0,
        })?;
        amplitudes.push(vec![0.0; rates.len()]);
    }

    let irf = if irf_settings.reference_reconvolution {
        reference_decay(&plain_irf, irf_settings)?
    } else {
        plain_irf
    };

    Ok(SampleData {
        dataset,
        irf,
        truth: SampleTruth { rates, amplitudes },
    })
}

/// Unit-amplitude reconvolved decays, one column per rate, on the full grid.
fn unit_decays(acquisition: &Acquisition, irf: &InstrumentResponse, rates: &[f64]) -> Result<DMatrix<f64>> {
    let acquisition = Arc::new(acquisition.clone());
    let model = MultiExponentialModel::new(
        ModelConfig {
            n_exp: rates.len(),
            convolver: ConvolverKind::Analytic,
            ..ModelConfig::default()
        },
        Arc::clone(&acquisition),
        Arc::new(irf.clone()),
    )?;
    let mut scratch = model.new_scratch();
    let mut a = DMatrix::zeros(model.rows_per_region(), model.n_columns());
    model.evaluate(rates, 0, &mut scratch, &mut a, None);
    Ok(a)
}

/// Reference fluorophore decay `IRF ⊗ e^{-t/τ_ref}` on the IRF's own grid.
fn reference_decay(irf: &InstrumentResponse, settings: &IrfSettings) -> Result<InstrumentResponse> {
    // Long enough for the reference to decay to e^{-12}.
    let extra = (12.0 * settings.reference_lifetime / settings.timebin_width).ceil() as usize;
    let n_t = irf.n_t() + extra;
    let grid = Arc::new(Acquisition::new(irf.n_chan(), n_t, settings.timebin_t0, settings.timebin_width)?);
    let mut conv = NumericalConvolver::new(Arc::clone(&grid), Arc::new(irf.clone()));
    conv.compute(1.0 / settings.reference_lifetime, 0, 0.0);
    let data: Vec<f64> = (0..irf.n_chan())
        .flat_map(|c| conv.tables().decay(c).to_vec())
        .collect();
    InstrumentResponse::new(settings, irf.n_chan(), n_t, &data)
}

fn draw_poisson(rng: &mut StdRng, mu: f64) -> Result<f64> {
    if mu <= 0.0 {
        return Ok(0.0);
    }
    let dist = Poisson::new(mu).map_err(|e| FitError::config(format!("Poisson distribution error: {e}")))?;
    Ok(dist.sample(rng))
}
