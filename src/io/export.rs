//! Export per-region results to CSV.
//!
//! The export is meant to be easy to consume in spreadsheets or downstream scripts.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use log::info;

use crate::domain::LinearResults;
use crate::error::Result;

/// Write one row per region: label, NNLS status, reduced chi2, mean lifetime,
/// one amplitude column per component, then the offset when fitted.
pub fn write_results_csv(path: &Path, linear: &LinearResults, rates: &[f64]) -> Result<()> {
    let mut file = BufWriter::new(File::create(path)?);
    write_results(&mut file, linear, rates)?;
    file.flush()?;
    info!("Wrote {} region rows to {}", linear.regions.len(), path.display());
    Ok(())
}

fn write_results<W: Write>(out: &mut W, linear: &LinearResults, rates: &[f64]) -> Result<()> {
    let has_offset = linear.regions.iter().any(|r| r.offset.is_some());

    let mut header = vec!["label".to_string(), "status".to_string(), "chi2".to_string(), "tau_mean".to_string()];
    header.extend((1..=rates.len()).map(|i| format!("amp_{i}")));
    if has_offset {
        header.push("offset".to_string());
    }
    writeln!(out, "{}", header.join(","))?;

    for r in &linear.regions {
        let mut row = vec![
            r.label.clone(),
            format!("{:?}", r.status).to_lowercase(),
            format!("{:.6}", r.chi2),
            r.mean_lifetime(rates).map(|t| format!("{t:.6}")).unwrap_or_default(),
        ];
        row.extend(r.amplitudes.iter().map(|a| format!("{a:.6}")));
        if has_offset {
            row.push(r.offset.map(|o| format!("{o:.6}")).unwrap_or_default());
        }
        writeln!(out, "{}", row.join(","))?;
    }
    Ok(())
}
