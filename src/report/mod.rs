//! Reporting utilities: per-region summaries and rankings.

pub mod format;

pub use format::*;

use std::cmp::Ordering;

use crate::domain::{LinearResults, RegionResult};
use crate::math::NnlsStatus;

/// One row of a region table.
#[derive(Debug, Clone, PartialEq)]
pub struct RegionSummary {
    pub label: String,
    /// Amplitude-weighted mean lifetime (ns); `None` for an empty region.
    pub mean_lifetime: Option<f64>,
    pub chi2: f64,
    pub total_counts: f64,
    pub status: NnlsStatus,
}

impl RegionSummary {
    pub fn from_result(region: &RegionResult, rates: &[f64]) -> Self {
        Self {
            label: region.label.clone(),
            mean_lifetime: region.mean_lifetime(rates),
            chi2: region.chi2,
            total_counts: region.observed.iter().sum(),
            status: region.status,
        }
    }
}

/// Top-N regions by fit quality and by lifetime.
#[derive(Debug, Clone)]
pub struct Rankings {
    /// Highest reduced chi-squared first.
    pub worst_fit: Vec<RegionSummary>,
    /// Longest mean lifetime first.
    pub longest: Vec<RegionSummary>,
    /// Shortest mean lifetime first.
    pub shortest: Vec<RegionSummary>,
}

/// Rank regions by reduced chi-squared and mean lifetime.
///
/// Regions without a mean lifetime (no photons assigned) are left out of the
/// lifetime rankings.
pub fn rank_regions(linear: &LinearResults, rates: &[f64], top_n: usize) -> Rankings {
    let rows: Vec<RegionSummary> = linear
        .regions
        .iter()
        .map(|r| RegionSummary::from_result(r, rates))
        .collect();

    let mut by_chi2 = rows.clone();
    by_chi2.sort_by(|a, b| b.chi2.partial_cmp(&a.chi2).unwrap_or(Ordering::Equal));
    let worst_fit = by_chi2.into_iter().take(top_n).collect();

    let mut by_tau: Vec<RegionSummary> = rows.into_iter().filter(|r| r.mean_lifetime.is_some()).collect();
    by_tau.sort_by(|a, b| b.mean_lifetime.partial_cmp(&a.mean_lifetime).unwrap_or(Ordering::Equal));
    let longest = by_tau.iter().take(top_n).cloned().collect();
    let shortest = by_tau.iter().rev().take(top_n).cloned().collect();

    Rankings {
        worst_fit,
        longest,
        shortest,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region(label: &str, amplitudes: Vec<f64>, chi2: f64) -> RegionResult {
        let status = if amplitudes.iter().all(|a| *a == 0.0) {
            NnlsStatus::Degenerate
        } else {
            NnlsStatus::Optimal
        };
        RegionResult {
            label: label.to_string(),
            amplitudes,
            offset: None,
            chi2,
            status,
            observed: vec![1.0, 2.0],
            fitted: vec![1.0, 2.0],
        }
    }

    #[test]
    fn rankings_order_by_chi2_and_lifetime() {
        let linear = LinearResults {
            regions: vec![
                region("A", vec![1.0, 0.0], 1.2),
                region("B", vec![0.0, 1.0], 3.5),
                region("C", vec![1.0, 1.0], 0.9),
                region("E", vec![0.0, 0.0], 0.0),
            ],
            n_degenerate: 1,
            n_iteration_limit: 0,
        };
        // Lifetimes 1 ns and 4 ns.
        let rankings = rank_regions(&linear, &[1.0, 0.25], 2);

        let worst: Vec<&str> = rankings.worst_fit.iter().map(|r| r.label.as_str()).collect();
        assert_eq!(worst, ["B", "A"]);
        let longest: Vec<&str> = rankings.longest.iter().map(|r| r.label.as_str()).collect();
        assert_eq!(longest, ["B", "C"]);
        let shortest: Vec<&str> = rankings.shortest.iter().map(|r| r.label.as_str()).collect();
        assert_eq!(shortest, ["A", "C"]);
        assert!((rankings.longest[1].mean_lifetime.unwrap() - 2.5).abs() < 1e-12);
        assert_eq!(rankings.worst_fit[0].total_counts, 3.0);
    }
}
