//! Shared "fit pipeline" logic.
//!
//! Keeping this in one place keeps the CLI handler about presentation only:
//! sample generation -> transformation -> model -> global fit -> linear results

use std::sync::Arc;

use log::info;

use crate::data::{generate_sample, transform, SampleData, TransformedData};
use crate::domain::{FitConfig, FitOutcome, LinearResults, ModelConfig};
use crate::error::Result;
use crate::fit::{ProgressReporter, VariableProjectionFitter};
use crate::models::{DecayModel, MultiExponentialModel};

/// All computed outputs of a single `flimfit fit` run.
pub struct RunOutput {
    pub sample: SampleData,
    pub data: Arc<TransformedData>,
    pub model: ModelConfig,
    pub outcome: FitOutcome,
    pub linear: LinearResults,
    /// Fitted decay rates (1/ns).
    pub rates: Vec<f64>,
    pub fit_successful: bool,
}

impl RunOutput {
    /// Fitted lifetimes (ns), in component order.
    pub fn lifetimes(&self) -> Vec<f64> {
        self.rates.iter().map(|k| 1.0 / k).collect()
    }
}

/// Execute the full fitting pipeline and return the computed outputs.
pub fn run_fit(config: &FitConfig) -> Result<RunOutput> {
    run_fit_with_reporter(config, Arc::new(ProgressReporter::new()))
}

/// Execute the pipeline with a caller-owned progress reporter.
pub fn run_fit_with_reporter(config: &FitConfig, reporter: Arc<ProgressReporter>) -> Result<RunOutput> {
    // 1) Synthesize the dataset and its IRF.
    let sample = generate_sample(&config.sample, &config.irf)?;

    // 2) Gate, subtract background, drop dim and saturated regions.
    let data = Arc::new(transform(&sample.dataset, &config.transform)?);

    // 3) Build the model on the gated time axis.
    let model_config = ModelConfig {
        n_exp: config.initial_lifetimes.len(),
        ..config.model.clone()
    };
    let model = Arc::new(MultiExponentialModel::new(
        model_config.clone(),
        data.acquisition().clone(),
        Arc::new(sample.irf.clone()),
    )?);
    let initial = model.initial_parameters(&config.initial_lifetimes)?;

    // 4) Global fit.
    let mut fitter = VariableProjectionFitter::new(
        model.clone() as Arc<dyn DecayModel>,
        data.clone(),
        config.fitter.clone(),
        reporter,
    )?;
    let outcome = fitter.fit(&initial, config.max_iterations)?;

    // 5) Per-region amplitudes at the final parameters.
    let linear = fitter.linear_params(&outcome.parameters)?;
    let rates = model.rates(&outcome.parameters).to_vec();
    info!(
        "Fitted {} regions ({} degenerate)",
        linear.regions.len(),
        linear.n_degenerate
    );

    Ok(RunOutput {
        fit_successful: fitter.fit_successful(),
        sample,
        data,
        model: model_config,
        outcome,
        linear,
        rates,
    })
}
