//! Read/write results JSON files.
//!
//! Results JSON is the portable record of a fit:
//! - model and fitter settings
//! - nonlinear outcome (rates, status, chi-squared)
//! - per-region amplitudes with observed and fitted curves for later plotting
//!
//! The schema is defined by `domain::ResultsFile`.

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use chrono::Local;
use log::info;

use crate::data::TransformedData;
use crate::domain::{FitOutcome, FitterConfig, LinearResults, ModelConfig, ResultsFile};
use crate::error::Result;

/// Assemble a results file from a finished run.
pub fn build_results(
    data: &TransformedData,
    model: &ModelConfig,
    fitter: &FitterConfig,
    outcome: &FitOutcome,
    linear: &LinearResults,
    rates: &[f64],
) -> ResultsFile {
    let acq = data.acquisition();
    ResultsFile {
        tool: "flimfit".to_string(),
        generated: Local::now(),
        bin_width: acq.bin_width(),
        timepoints: acq.timepoints(),
        n_chan: acq.n_chan(),
        model: model.clone(),
        fitter: fitter.clone(),
        outcome: outcome.clone(),
        lifetimes: rates.iter().map(|k| 1.0 / k).collect(),
        linear: linear.clone(),
    }
}

/// Write a results JSON file.
pub fn write_results_json(path: &Path, results: &ResultsFile) -> Result<()> {
    let file = BufWriter::new(File::create(path)?);
    serde_json::to_writer_pretty(file, results)?;
    info!("Wrote results JSON to {}", path.display());
    Ok(())
}

/// Read a results JSON file.
pub fn read_results_json(path: &Path) -> Result<ResultsFile> {
    let file = BufReader::new(File::open(path)?);
    Ok(serde_json::from_reader(file)?)
}
