//! Photometric conversions: magnitudes, signal-to-noise and detection probability.

pub mod beta;
pub mod magnitude;
pub mod snr;

pub use beta::{beta_value, f_ul};
pub use magnitude::{calc_mag, flux_for_magnitude, mag_error};
pub use snr::snr_electrons;
