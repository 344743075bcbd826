//! Command-line parsing for the `flimfit` global decay fitter.
//!
//! The goal of this module is to keep **argument parsing** separate from the
//! fitting engine. Flags map one-to-one onto the typed config structs in
//! `domain`; `app::fit_config_from_args` does the mapping.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::domain::{ConvolverKind, DerivativeMode, WeightingMode};

/// Top-level CLI.
#[derive(Debug, Parser)]
#[command(name = "flimfit", version, about = "Global variable-projection fitting of fluorescence decays")]
pub struct Cli {
    /// Log filter in `RUST_LOG` syntax (e.g. `debug`, `flim_fit::fit=trace`).
    #[arg(long, global = true, default_value = "info")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Command,
}

/// CLI subcommands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Synthesize a dataset, fit it globally, print diagnostics and optionally plot/export.
    Fit(FitArgs),
    /// Plot one region of a previously exported results JSON.
    Plot(PlotArgs),
}

/// Options for the synthetic dataset.
#[derive(Debug, Args, Clone)]
pub struct SampleArgs {
    /// Number of regions with photons.
    #[arg(short = 'n', long, default_value_t = 64)]
    pub regions: usize,

    /// Extra regions without any photons.
    #[arg(long, default_value_t = 0)]
    pub empty_regions: usize,

    /// Spectral channels per region.
    #[arg(long, default_value_t = 1)]
    pub channels: usize,

    /// Time bins per channel.
    #[arg(long, default_value_t = 256)]
    pub bins: usize,

    /// Time bin width (ns).
    #[arg(long, default_value_t = 0.05)]
    pub bin_width: f64,

    /// True lifetimes (ns) of the synthetic components.
    #[arg(long, value_delimiter = ',', default_values_t = [0.8, 3.0])]
    pub lifetimes: Vec<f64>,

    /// Expected photons per region.
    #[arg(long, default_value_t = 5000.0)]
    pub counts: f64,

    /// Expected background photons per bin.
    #[arg(long, default_value_t = 0.0)]
    pub background: f64,

    /// IRF peak position (ns).
    #[arg(long, default_value_t = 1.0)]
    pub irf_center: f64,

    /// IRF full width at half maximum (ns).
    #[arg(long, default_value_t = 0.15)]
    pub irf_fwhm: f64,

    /// Use expected counts instead of Poisson draws.
    #[arg(long)]
    pub noise_free: bool,

    /// Random seed for sample generation.
    #[arg(long, default_value_t = 42)]
    pub seed: u64,
}

/// Options for a fit run.
#[derive(Debug, Parser, Clone)]
pub struct FitArgs {
    #[command(flatten)]
    pub sample: SampleArgs,

    /// Initial lifetime guesses (ns); their count sets the number of components.
    #[arg(long, value_delimiter = ',', default_values_t = [0.5, 2.0])]
    pub initial: Vec<f64>,

    /// IRF convolution kernel.
    #[arg(long, value_enum, default_value_t = ConvolverKind::Analytic)]
    pub convolver: ConvolverKind,

    /// Per-channel scale factors (comma separated, one per channel).
    #[arg(long, value_delimiter = ',')]
    pub channel_factors: Vec<f64>,

    /// Fit a constant offset per region.
    #[arg(long)]
    pub fit_offset: bool,

    /// Fit the IRF time shift.
    #[arg(long)]
    pub fit_t0: bool,

    /// IRF time shift (ns), or the initial guess with `--fit-t0`.
    #[arg(long, default_value_t = 0.0, allow_hyphen_values = true)]
    pub t0_shift: f64,

    /// IRF bin width (ns).
    #[arg(long, default_value_t = 0.05)]
    pub irf_bin_width: f64,

    /// Treat the IRF as a measured reference decay.
    #[arg(long)]
    pub reference: bool,

    /// Reference fluorophore lifetime (ns).
    #[arg(long, default_value_t = 0.08)]
    pub reference_lifetime: f64,

    /// Worker threads.
    #[arg(short = 'j', long, default_value_t = 4)]
    pub threads: usize,

    #[arg(long, value_enum, default_value_t = WeightingMode::Poisson)]
    pub weighting: WeightingMode,

    #[arg(long, value_enum, default_value_t = DerivativeMode::Analytic)]
    pub derivatives: DerivativeMode,

    /// Iteration cap of the nonlinear solve.
    #[arg(long, default_value_t = 100)]
    pub max_iterations: usize,

    /// Relative chi-squared reduction tolerance.
    #[arg(long, default_value_t = 1e-10)]
    pub ftol: f64,

    /// Relative step tolerance.
    #[arg(long, default_value_t = 1e-10)]
    pub xtol: f64,

    /// Gradient orthogonality tolerance.
    #[arg(long, default_value_t = 1e-10)]
    pub gtol: f64,

    /// Discard bins starting before this time (ns).
    #[arg(long, allow_hyphen_values = true)]
    pub t_start: Option<f64>,

    /// Discard bins ending after this time (ns).
    #[arg(long)]
    pub t_stop: Option<f64>,

    /// Constant background subtracted from every bin before fitting.
    #[arg(long, default_value_t = 0.0)]
    pub subtract: f64,

    /// Exclude regions with fewer total counts.
    #[arg(long, default_value_t = 0.0)]
    pub threshold: f64,

    /// Exclude regions with any bin above this count (0 disables).
    #[arg(long, default_value_t = 0.0)]
    pub limit: f64,

    /// Show the top-N regions in each ranking.
    #[arg(long, default_value_t = 10)]
    pub top: usize,

    /// Disable the terminal decay plot.
    #[arg(long)]
    pub no_plot: bool,

    /// Region index to plot.
    #[arg(long, default_value_t = 0)]
    pub plot_region: usize,

    /// Plot width (columns).
    #[arg(long, default_value_t = 100)]
    pub width: usize,

    /// Plot height (rows).
    #[arg(long, default_value_t = 25)]
    pub height: usize,

    /// Export per-region results to CSV.
    #[arg(long)]
    pub export: Option<PathBuf>,

    /// Export the full results (parameters, amplitudes, curves) to JSON.
    #[arg(long = "export-json")]
    pub export_json: Option<PathBuf>,
}

/// Options for plotting saved results.
#[derive(Debug, Parser)]
pub struct PlotArgs {
    /// Results JSON produced by `flimfit fit --export-json`.
    #[arg(long, value_name = "JSON")]
    pub results: PathBuf,

    /// Region index to plot.
    #[arg(long, default_value_t = 0)]
    pub region: usize,

    /// Plot width (columns).
    #[arg(long, default_value_t = 100)]
    pub width: usize,

    /// Plot height (rows).
    #[arg(long, default_value_t = 25)]
    pub height: usize,
}
