//! Formatted terminal output.
//!
//! We keep formatting code in one place so:
//! - the fitting code stays clean and testable
//! - output changes are localized

use crate::data::TransformedData;
use crate::domain::{FitConfig, FitOutcome, LinearResults};
use crate::report::{RegionSummary, Rankings};

/// Format the run summary (dataset + fit diagnostics + fitted lifetimes).
pub fn format_run_summary(
    data: &TransformedData,
    outcome: &FitOutcome,
    linear: &LinearResults,
    rates: &[f64],
    config: &FitConfig,
) -> String {
    let acq = data.acquisition();
    let mut out = String::new();

    out.push_str("=== flimfit - global lifetime fit ===\n");
    out.push_str(&format!(
        "Sample: regions={} (+{} empty) | channels={} | bins={} x {:.3}ns | seed={}\n",
        config.sample.n_regions,
        config.sample.n_empty_regions,
        config.sample.n_chan,
        config.sample.n_t,
        config.sample.bin_width,
        config.sample.seed
    ));
    out.push_str(&format!(
        "Data: fitted={} | excluded={} | gate=[{:.3}, {:.3}]ns ({} bins)\n",
        data.n_regions(),
        data.excluded().len(),
        acq.bin_start(acq.gate().start),
        acq.bin_start(acq.gate().end),
        acq.n_t()
    ));
    out.push_str(&format!(
        "Fitter: threads={} | weighting={:?} | derivatives={:?} | convolver={:?}\n",
        config.fitter.n_thread, config.fitter.weighting, config.fitter.derivatives, config.model.convolver
    ));

    out.push_str("\nFit diagnostics:\n");
    out.push_str(&format!("- status    : {} ({})\n", outcome.status.display_name(), outcome.reason));
    out.push_str(&format!(
        "- iterations: {} ({} evaluations)\n",
        outcome.iterations, outcome.evaluations
    ));
    out.push_str(&format!(
        "- chi2      : {:.6e} (reduced {:.4})\n",
        outcome.chi2, outcome.reduced_chi2
    ));
    out.push_str(&format!(
        "- regions   : {} degenerate, {} at NNLS iteration cap\n",
        linear.n_degenerate, linear.n_iteration_limit
    ));

    out.push_str("\nParameters:\n");
    for (name, value) in outcome.parameter_names.iter().zip(&outcome.parameters) {
        out.push_str(&format!("- {name:<4}: {value:.6}\n"));
    }
    let taus: Vec<f64> = rates.iter().map(|k| 1.0 / k).collect();
    out.push_str(&format!("- tau : {} ns\n", fmt_vec(&taus)));
    out.push_str(&format!("- true: {} ns\n", fmt_vec(&config.sample.lifetimes)));
    out.push('\n');

    out
}

/// Format the ranking tables.
pub fn format_rankings(rankings: &Rankings) -> String {
    let mut out = String::new();

    out.push_str("Worst fits (highest reduced chi2):\n");
    out.push_str(&format_table(&rankings.worst_fit));
    out.push('\n');

    out.push_str("Longest mean lifetime:\n");
    out.push_str(&format_table(&rankings.longest));
    out.push('\n');

    out.push_str("Shortest mean lifetime:\n");
    out.push_str(&format_table(&rankings.shortest));

    out
}

fn format_table(rows: &[RegionSummary]) -> String {
    let mut out = String::new();
    out.push_str(
        format!(
            "{:<12} {:>10} {:>12} {:>10} {:<16}\n",
            "region", "tau_m", "counts", "chi2", "nnls"
        )
        .trim_end(),
    );
    out.push('\n');
    out.push_str(format!("{:-<12} {:-<10} {:-<12} {:-<10} {:-<16}\n", "", "", "", "", "").trim_end());
    out.push('\n');

    for r in rows {
        let tau = r
            .mean_lifetime
            .map(|t| format!("{t:.4}"))
            .unwrap_or_else(|| "-".to_string());
        out.push_str(
            format!(
                "{:<12} {:>10} {:>12.0} {:>10.4} {:<16}\n",
                truncate(&r.label, 12),
                tau,
                r.total_counts,
                r.chi2,
                format!("{:?}", r.status).to_lowercase(),
            )
            .trim_end(),
        );
        out.push('\n');
    }

    out
}

fn fmt_vec(v: &[f64]) -> String {
    let parts: Vec<String> = v.iter().map(|x| format!("{x:.4}")).collect();
    format!("[{}]", parts.join(", "))
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let mut out: String = s.chars().take(max.saturating_sub(1)).collect();
    out.push('.');
    out
}
