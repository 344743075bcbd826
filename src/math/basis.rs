//! Stable building blocks for integrals of exponential decays.
//!
//! The convolution kernels integrate `e^{-k t}` over detection bins and over
//! piecewise-constant IRF bins. Everything reduces to two primitives:
//!
//! - `q(x) = ∫_0^x e^{-k s} ds = (1 - e^{-kx}) / k`
//! - `F(x) = ∫_0^x q(s) ds = (kx - 1 + e^{-kx}) / k²` for `x > 0`, else `0`
//!
//! Numerical notes:
//! - For small `kx`, `1 - e^{-kx}` suffers from catastrophic cancellation.
//!   We use `expm1`-based forms and series fallbacks to keep full precision.
//! - Derivatives are with respect to the rate `k`.

/// Below this `kx` the series forms of `q'` are used.
const SMALL_Q: f64 = 1e-3;

/// Below this `kx` the series forms of `F` and `F'` are used.
const SMALL_F: f64 = 1e-2;

/// `q(x) = (1 - e^{-kx}) / k`, the integral of the decay over `[0, x]`.
pub fn decay_integral(k: f64, x: f64) -> f64 {
    if x <= 0.0 {
        return 0.0;
    }
    let kx = k * x;
    if kx.abs() < 1e-12 {
        return x;
    }
    -(-kx).exp_m1() / k
}

/// `∂q/∂k = (x e^{-kx} - q) / k`.
pub fn decay_integral_dk(k: f64, x: f64) -> f64 {
    if x <= 0.0 {
        return 0.0;
    }
    let kx = k * x;
    if kx.abs() < SMALL_Q {
        // Series: -x²/2 + k x³/3 - k² x⁴/8
        return x * x * (-0.5 + kx / 3.0 - kx * kx / 8.0);
    }
    (x * (-kx).exp() - decay_integral(k, x)) / k
}

/// `F(x) = (kx - 1 + e^{-kx}) / k²`: the decay response to a unit step,
/// integrated over `[0, x]`. Zero for `x <= 0`.
pub fn ramp_integral(k: f64, x: f64) -> f64 {
    if x <= 0.0 {
        return 0.0;
    }
    let kx = k * x;
    if kx < SMALL_F {
        // Series: x²/2 - k x³/6 + k² x⁴/24 - k³ x⁵/120
        return x * x * (0.5 - kx / 6.0 + kx * kx / 24.0 - kx * kx * kx / 120.0);
    }
    (kx + (-kx).exp_m1()) / (k * k)
}

/// `∂F/∂k = (x q(x) - 2 F(x)) / k`.
pub fn ramp_integral_dk(k: f64, x: f64) -> f64 {
    if x <= 0.0 {
        return 0.0;
    }
    let kx = k * x;
    if kx < SMALL_F {
        // Series: -x³/6 + k x⁴/12 - k² x⁵/40
        return x * x * x * (-1.0 / 6.0 + kx / 12.0 - kx * kx / 40.0);
    }
    (x * decay_integral(k, x) - 2.0 * ramp_integral(k, x)) / k
}

/// `sinh(u) / u` with the removable singularity filled in.
pub fn sinhc(u: f64) -> f64 {
    if u.abs() < 1e-4 {
        return 1.0 + u * u / 6.0;
    }
    u.sinh() / u
}

/// Derivative of [`sinhc`] with respect to `u`.
pub fn sinhc_du(u: f64) -> f64 {
    if u.abs() < 1e-3 {
        return u / 3.0 + u * u * u / 30.0;
    }
    (u * u.cosh() - u.sinh()) / (u * u)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn central_dk(f: impl Fn(f64) -> f64, k: f64) -> f64 {
        let h = 1e-6 * k.max(1e-3);
        (f(k + h) - f(k - h)) / (2.0 * h)
    }

    #[test]
    fn integrals_vanish_for_non_positive_x() {
        assert_eq!(decay_integral(1.0, 0.0), 0.0);
        assert_eq!(ramp_integral(1.0, -1.0), 0.0);
        assert_eq!(ramp_integral_dk(1.0, 0.0), 0.0);
    }

    #[test]
    fn series_and_closed_forms_agree_at_switch_points() {
        let k = 1.0;
        for &x in &[SMALL_F * 0.999, SMALL_F * 1.001] {
            let closed = (k * x + (-k * x).exp_m1()) / (k * k);
            assert!((ramp_integral(k, x) - closed).abs() < 1e-10 * closed.abs());
        }
        let x = SMALL_Q * 0.999;
        let closed = (x * (-k * x).exp() - decay_integral(k, x)) / k;
        assert!((decay_integral_dk(k, x) - closed).abs() < 1e-9 * closed.abs());
    }

    #[test]
    fn derivatives_match_finite_differences() {
        for &k in &[0.05, 0.4, 2.0, 10.0] {
            for &x in &[0.05, 0.5, 3.0] {
                let fd = central_dk(|kk| decay_integral(kk, x), k);
                let an = decay_integral_dk(k, x);
                assert!((fd - an).abs() < 1e-6 * an.abs().max(1e-9), "q' k={k} x={x}: {fd} vs {an}");

                let fd = central_dk(|kk| ramp_integral(kk, x), k);
                let an = ramp_integral_dk(k, x);
                assert!((fd - an).abs() < 1e-6 * an.abs().max(1e-12), "F' k={k} x={x}: {fd} vs {an}");
            }
        }
    }

    #[test]
    fn sinhc_derivative_matches_finite_difference() {
        for &u in &[1e-5, 1e-2, 0.3, 2.0] {
            let h = 1e-6;
            let fd = (sinhc(u + h) - sinhc(u - h)) / (2.0 * h);
            assert!((fd - sinhc_du(u)).abs() < 1e-6, "u={u}");
        }
    }
}
