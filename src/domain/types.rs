//! Shared domain types.
//!
//! These types are kept lightweight and serializable so they can be:
//!
//! - passed between the CLI, the pipeline and the fitting engine
//! - exported to JSON/CSV
//! - reloaded later for plotting

use std::path::PathBuf;

use chrono::{DateTime, Local};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::math::NnlsStatus;

/// Per-observation weighting policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum WeightingMode {
    /// Every observation has unit weight.
    Uniform,
    /// Shot-noise weights from the observed counts with Mighell's gamma
    /// correction (`target = y + min(y, 1)`, `variance = y + 1`).
    Poisson,
    /// Weights refreshed every iteration from the fitted curve at the current
    /// iterate (`variance = max(model, 1)`), approximating a Poisson
    /// maximum-likelihood fit while each solve stays linear.
    Iterative,
}

/// How the Jacobian of the projected residual is obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum DerivativeMode {
    /// Variable-projection derivative from the factorized design matrix.
    Analytic,
    /// Forward differences of the whole residual vector.
    Numerical,
}

/// Which IRF convolution kernel the decay model uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ConvolverKind {
    /// Closed-form bin integral of the exponential reconvolved with the binned IRF.
    Analytic,
    /// Discrete convolution of the IRF resampled onto the data grid.
    Numerical,
}

/// Terminal state of a fit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FitStatus {
    Converged,
    MaxIterationsReached,
    NumericalFailure,
    Cancelled,
}

impl FitStatus {
    pub fn display_name(self) -> &'static str {
        match self {
            FitStatus::Converged => "converged",
            FitStatus::MaxIterationsReached => "max iterations reached",
            FitStatus::NumericalFailure => "numerical failure",
            FitStatus::Cancelled => "cancelled",
        }
    }

    /// Whether a session ending in this state produced a usable result.
    pub fn is_successful(self) -> bool {
        matches!(self, FitStatus::Converged | FitStatus::MaxIterationsReached)
    }
}

/// Settings for the fitting session (the orchestrator).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FitterConfig {
    /// Number of worker threads in the session pool.
    pub n_thread: usize,
    pub weighting: WeightingMode,
    pub derivatives: DerivativeMode,
    /// Maximum rows (time bins x channels) a single region may contribute.
    pub max_region_size: usize,
    /// Relative reduction tolerance for chi-squared.
    pub ftol: f64,
    /// Relative step tolerance on the scaled parameter vector.
    pub xtol: f64,
    /// Cosine tolerance between residual and Jacobian columns.
    pub gtol: f64,
}

impl Default for FitterConfig {
    fn default() -> Self {
        Self {
            n_thread: 4,
            weighting: WeightingMode::Poisson,
            derivatives: DerivativeMode::Analytic,
            max_region_size: 1 << 16,
            ftol: 1e-10,
            xtol: 1e-10,
            gtol: 1e-10,
        }
    }
}

/// Settings for the multi-exponential decay model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Number of exponential components (one decay rate each).
    pub n_exp: usize,
    pub convolver: ConvolverKind,
    /// Per-channel scale factors applied to every decay column.
    ///
    /// Empty means unit factors for every channel.
    pub channel_factors: Vec<f64>,
    /// Add a non-negative constant offset column per region.
    pub fit_offset: bool,
    /// Fit the IRF time shift as an extra nonlinear parameter.
    pub fit_t0: bool,
    /// IRF time shift (ns) used when `fit_t0` is off, and the initial guess otherwise.
    pub t0_shift: f64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            n_exp: 1,
            convolver: ConvolverKind::Analytic,
            channel_factors: Vec::new(),
            fit_offset: false,
            fit_t0: false,
            t0_shift: 0.0,
        }
    }
}

/// Time axis and reference-decay settings of an instrument response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IrfSettings {
    /// Start time (ns) of the first IRF bin.
    pub timebin_t0: f64,
    /// Width (ns) of each IRF bin.
    pub timebin_width: f64,
    /// Treat the IRF as a measured reference decay with a known lifetime.
    pub reference_reconvolution: bool,
    /// Lifetime (ns) of the reference fluorophore.
    pub reference_lifetime: f64,
}

impl Default for IrfSettings {
    fn default() -> Self {
        Self {
            timebin_t0: 0.0,
            timebin_width: 0.05,
            reference_reconvolution: false,
            reference_lifetime: 0.08,
        }
    }
}

/// Data transformation applied before fitting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransformSettings {
    /// Discard bins starting before this time (ns).
    pub t_start: f64,
    /// Discard bins ending after this time (ns).
    pub t_stop: f64,
    /// Constant background (counts per bin) subtracted from every bin.
    pub background: f64,
    /// Regions whose total gated counts fall below this are excluded.
    pub threshold: f64,
    /// Regions with any bin above this are excluded as saturated (0 disables).
    pub limit: f64,
}

impl Default for TransformSettings {
    fn default() -> Self {
        Self {
            t_start: f64::NEG_INFINITY,
            t_stop: f64::INFINITY,
            background: 0.0,
            threshold: 0.0,
            limit: 0.0,
        }
    }
}

/// Result of the nonlinear stage of a fit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FitOutcome {
    /// Final nonlinear parameters (rates in 1/ns, then the optional t0 shift).
    pub parameters: Vec<f64>,
    pub parameter_names: Vec<String>,
    pub iterations: usize,
    pub evaluations: usize,
    pub status: FitStatus,
    /// Human-readable termination reason from the minimizer.
    pub reason: String,
    /// Weighted sum of squared residuals.
    pub chi2: f64,
    /// `chi2` divided by the degrees of freedom.
    pub reduced_chi2: f64,
}

/// Linear parameters of one region at the final nonlinear parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegionResult {
    pub label: String,
    /// Non-negative amplitude per exponential component.
    pub amplitudes: Vec<f64>,
    /// Fitted constant offset (only when the model fits one).
    pub offset: Option<f64>,
    /// Reduced chi-squared for this region alone.
    pub chi2: f64,
    pub status: NnlsStatus,
    /// Gated observed counts, channel-major.
    pub observed: Vec<f64>,
    /// Fitted model counts, same layout as `observed`.
    pub fitted: Vec<f64>,
}

impl RegionResult {
    /// Amplitude-weighted mean lifetime in ns.
    pub fn mean_lifetime(&self, rates: &[f64]) -> Option<f64> {
        let total: f64 = self.amplitudes.iter().sum();
        if total <= 0.0 {
            return None;
        }
        let tau: f64 = self
            .amplitudes
            .iter()
            .zip(rates)
            .map(|(&a, &k)| a / k)
            .sum();
        Some(tau / total)
    }
}

/// Linear results for every region of a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinearResults {
    pub regions: Vec<RegionResult>,
    /// Regions whose target was all zero (or fitted exactly).
    pub n_degenerate: usize,
    /// Regions whose NNLS solve hit its iteration cap.
    pub n_iteration_limit: usize,
}

/// A full run's configuration as understood by the pipeline.
///
/// This is derived from CLI flags (plus defaults).
#[derive(Debug, Clone)]
pub struct FitConfig {
    pub sample: SampleConfig,
    pub model: ModelConfig,
    pub fitter: FitterConfig,
    pub transform: TransformSettings,
    pub irf: IrfSettings,

    /// Initial lifetime guesses (ns), one per component.
    pub initial_lifetimes: Vec<f64>,
    pub max_iterations: usize,

    pub top_n: usize,
    pub plot: bool,
    pub plot_region: usize,
    pub plot_width: usize,
    pub plot_height: usize,

    pub export_results: Option<PathBuf>,
    pub export_json: Option<PathBuf>,
}

/// Synthetic dataset generation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SampleConfig {
    pub n_regions: usize,
    /// Additional regions with no photons at all.
    pub n_empty_regions: usize,
    pub n_chan: usize,
    pub n_t: usize,
    /// Data bin width (ns).
    pub bin_width: f64,
    /// True lifetimes (ns) used to generate the decays.
    pub lifetimes: Vec<f64>,
    /// Expected photon count per region (before background).
    pub counts_per_region: f64,
    /// Expected background counts per bin.
    pub background: f64,
    /// IRF peak position (ns).
    pub irf_center: f64,
    /// IRF full width at half maximum (ns).
    pub irf_fwhm: f64,
    /// Generate noise-free expected counts instead of Poisson draws.
    pub noise_free: bool,
    pub seed: u64,
}

impl Default for SampleConfig {
    fn default() -> Self {
        Self {
            n_regions: 64,
            n_empty_regions: 0,
            n_chan: 1,
            n_t: 256,
            bin_width: 0.05,
            lifetimes: vec![0.8, 3.0],
            counts_per_region: 5000.0,
            background: 0.0,
            irf_center: 1.0,
            irf_fwhm: 0.15,
            noise_free: false,
            seed: 42,
        }
    }
}

/// The ground truth behind a synthetic dataset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SampleTruth {
    pub rates: Vec<f64>,
    /// Amplitudes per region, indexed like the generated regions.
    pub amplitudes: Vec<Vec<f64>>,
}

/// A saved results file (JSON).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultsFile {
    pub tool: String,
    pub generated: DateTime<Local>,
    pub bin_width: f64,
    /// Start time (ns) of every gated bin.
    pub timepoints: Vec<f64>,
    pub n_chan: usize,
    pub model: ModelConfig,
    pub fitter: FitterConfig,
    pub outcome: FitOutcome,
    pub lifetimes: Vec<f64>,
    pub linear: LinearResults,
}
