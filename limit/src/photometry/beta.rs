//! Detection probability for faint sources.
//!
//! For a source of peak flux `f` on Gaussian noise `sigma`, the probability
//! that it exceeds an `n`-sigma detection threshold is
//!
//! ```text
//! P = 1/2 * (1 - erf((n sigma - f) / (sqrt(2) sigma))) = Phi((f - n sigma) / sigma)
//! ```
//!
//! `beta' = 1 - P` is the false-negative probability. Inverting for the flux
//! at which `P = beta` gives the upper-limit flux
//! `f_ul = (n + sqrt(2) erfinv(2 beta - 1)) sigma`.

use shared::algo::{erfinv, normal_cdf};
use std::f64::consts::SQRT_2;

/// Probability that a source of peak `flux` is detected at `n` sigma.
pub fn beta_value(n: f64, sigma: f64, flux: f64) -> f64 {
    if sigma <= 0.0 {
        return if flux >= 0.0 { 1.0 } else { 0.0 };
    }
    normal_cdf((flux - n * sigma) / sigma)
}

/// Peak flux detected with probability `beta` at an `n`-sigma threshold.
pub fn f_ul(n: f64, beta: f64, sigma: f64) -> f64 {
    (n + SQRT_2 * erfinv(2.0 * beta - 1.0)) * sigma
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_half_probability_at_threshold() {
        assert_abs_diff_eq!(beta_value(3.0, 5.0, 15.0), 0.5, epsilon = 1e-7);
        assert_abs_diff_eq!(f_ul(3.0, 0.5, 5.0), 15.0, epsilon = 1e-7);
    }

    #[test]
    fn test_f_ul_inverts_beta_value() {
        for &beta in &[0.1, 0.5, 0.75, 0.95] {
            let flux = f_ul(3.0, beta, 4.0);
            assert_abs_diff_eq!(beta_value(3.0, 4.0, flux), beta, epsilon = 1e-6);
        }
    }

    #[test]
    fn test_f_ul_for_default_beta() {
        // sqrt(2) * erfinv(0.5) = 0.6744897...
        assert_abs_diff_eq!(f_ul(3.0, 0.75, 1.0), 3.674_489_75, epsilon = 1e-6);
    }

    #[test]
    fn test_one_sigma_above_threshold() {
        // Phi(1) = 0.8413447...
        assert_abs_diff_eq!(beta_value(3.0, 2.0, 8.0), 0.841_344_746, epsilon = 1e-6);
        assert_abs_diff_eq!(beta_value(3.0, 2.0, 4.0), 1.0 - 0.841_344_746, epsilon = 1e-6);
    }

    #[test]
    fn test_probability_monotonic_in_flux() {
        let mut last = 0.0;
        for i in 0..50 {
            let p = beta_value(3.0, 2.0, i as f64);
            assert!(p >= last);
            last = p;
        }
    }
}
