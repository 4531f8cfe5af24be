//! Flux and magnitude conversions.

use std::f64::consts::LN_10;

/// Convert a count rate to a magnitude.
///
/// `-2.5 log10(flux * gain) + zeropoint`. Non-positive or non-finite flux
/// yields NaN rather than an infinite magnitude.
pub fn calc_mag(flux: f64, gain: f64, zeropoint: f64) -> f64 {
    let electrons = flux * gain;
    if electrons > 0.0 && electrons.is_finite() {
        -2.5 * electrons.log10() + zeropoint
    } else {
        f64::NAN
    }
}

/// Relative flux of an instrumental magnitude, `10^(-m / 2.5)`.
pub fn flux_for_magnitude(magnitude: f64) -> f64 {
    10f64.powf(-magnitude / 2.5)
}

/// First-order magnitude uncertainty, `2.5 / ln(10) * flux_error / flux`.
pub fn mag_error(flux: f64, flux_error: f64) -> f64 {
    if flux > 0.0 {
        2.5 / LN_10 * flux_error / flux
    } else {
        f64::NAN
    }
}
