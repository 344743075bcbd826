//! Per-observation targets and weights.
//!
//! Residuals are `w_i (target_i - model_i)` with `w_i = 1 / σ_i`:
//!
//! | mode      | target            | variance                                  |
//! |-----------|-------------------|-------------------------------------------|
//! | uniform   | `y`               | `1`                                       |
//! | poisson   | `y + min(y, 1)`   | `y + 1` (Mighell's χ²γ)                   |
//! | iterative | `y`               | `y + 1` first, then `max(model, 1)`       |
//!
//! Background subtraction can leave negative counts; they are treated as zero
//! when forming the gamma correction and the variance.

use crate::domain::WeightingMode;

fn gamma_target(y: f64) -> f64 {
    y + y.clamp(0.0, 1.0)
}

fn gamma_weight(y: f64) -> f64 {
    1.0 / (y.max(0.0) + 1.0).sqrt()
}

fn model_weight(fitted: f64) -> f64 {
    1.0 / fitted.max(1.0).sqrt()
}

/// Fill targets and weights before the first pass.
pub fn initial_weights(mode: WeightingMode, counts: &[f64], targets: &mut [f64], weights: &mut [f64]) {
    debug_assert_eq!(counts.len(), targets.len());
    debug_assert_eq!(counts.len(), weights.len());
    for ((&y, t), w) in counts.iter().zip(targets.iter_mut()).zip(weights.iter_mut()) {
        match mode {
            WeightingMode::Uniform => {
                *t = y;
                *w = 1.0;
            }
            WeightingMode::Poisson => {
                *t = gamma_target(y);
                *w = gamma_weight(y);
            }
            WeightingMode::Iterative => {
                *t = y;
                *w = gamma_weight(y);
            }
        }
    }
}

/// Model-based weights from the fitted curve at the current iterate.
pub fn refresh_weights(fitted: &[f64], weights: &mut [f64]) {
    debug_assert_eq!(fitted.len(), weights.len());
    for (w, &m) in weights.iter_mut().zip(fitted) {
        *w = model_weight(m);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gamma_correction_follows_mighell() {
        let counts = [0.0, 0.5, 4.0, -2.0];
        let mut t = [0.0; 4];
        let mut w = [0.0; 4];
        initial_weights(WeightingMode::Poisson, &counts, &mut t, &mut w);
        assert_eq!(t, [0.0, 1.0, 5.0, -2.0]);
        assert_eq!(w[0], 1.0);
        assert!((w[2] - 1.0 / 5f64.sqrt()).abs() < 1e-15);
        assert_eq!(w[3], 1.0);
    }

    #[test]
    fn uniform_leaves_counts_untouched() {
        let counts = [3.0, 7.0];
        let mut t = [0.0; 2];
        let mut w = [0.0; 2];
        initial_weights(WeightingMode::Uniform, &counts, &mut t, &mut w);
        assert_eq!(t, counts);
        assert_eq!(w, [1.0, 1.0]);
    }

    #[test]
    fn model_weights_are_floored_at_unit_variance() {
        let mut w = [0.0; 3];
        refresh_weights(&[0.0, 0.25, 16.0], &mut w);
        assert_eq!(w, [1.0, 1.0, 0.25]);
    }
}
