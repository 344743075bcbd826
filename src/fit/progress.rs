//! Progress and cooperative cancellation.
//!
//! The reporter is shared (`Arc`) between the fitting session and whoever
//! watches it. The session only polls it at pass boundaries, so a cancel
//! request takes effect after the current pass completes.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

#[derive(Debug, Default)]
pub struct ProgressReporter {
    cancelled: AtomicBool,
    iteration: AtomicUsize,
    max_iterations: AtomicUsize,
    chi2_bits: AtomicU64,
}

impl ProgressReporter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the session to stop at the next pass boundary.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    /// Clear progress (but not a pending cancel) at the start of a fit.
    pub fn start(&self, max_iterations: usize) {
        self.iteration.store(0, Ordering::Relaxed);
        self.max_iterations.store(max_iterations, Ordering::Relaxed);
        self.chi2_bits.store(f64::NAN.to_bits(), Ordering::Relaxed);
    }

    pub fn update(&self, iteration: usize, chi2: f64) {
        self.iteration.store(iteration, Ordering::Relaxed);
        self.chi2_bits.store(chi2.to_bits(), Ordering::Relaxed);
    }

    pub fn iteration(&self) -> usize {
        self.iteration.load(Ordering::Relaxed)
    }

    /// Last reported chi-squared (NaN before the first pass).
    pub fn chi2(&self) -> f64 {
        f64::from_bits(self.chi2_bits.load(Ordering::Relaxed))
    }

    /// Iterations done over the cap, in `[0, 1]`.
    pub fn fraction(&self) -> f64 {
        let max = self.max_iterations.load(Ordering::Relaxed);
        if max == 0 {
            return 0.0;
        }
        (self.iteration() as f64 / max as f64).min(1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fraction_tracks_iterations() {
        let p = ProgressReporter::new();
        p.start(20);
        assert_eq!(p.fraction(), 0.0);
        assert!(p.chi2().is_nan());
        p.update(5, 12.5);
        assert_eq!(p.fraction(), 0.25);
        assert_eq!(p.chi2(), 12.5);
    }

    #[test]
    fn cancel_survives_restart() {
        let p = ProgressReporter::new();
        p.cancel();
        p.start(10);
        assert!(p.is_cancelled());
    }
}
