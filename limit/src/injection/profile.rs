//! Analytic point-source profiles.

use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

use super::source_model::ModelError;

/// Profile value, relative to the peak, below which a stamp is truncated.
const SUPPORT_FLOOR: f64 = 1e-4;

/// Unit-peak radial profile of a point source.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AnalyticProfile {
    /// `exp(-r^2 / (2 sigma^2))`
    Gaussian { sigma: f64 },
    /// `(1 + r^2 / alpha^2)^-beta`
    Moffat { alpha: f64, beta: f64 },
}

impl AnalyticProfile {
    /// Gaussian whose FWHM matches `fwhm`.
    pub fn gaussian_from_fwhm(fwhm: f64) -> Self {
        AnalyticProfile::Gaussian {
            sigma: fwhm / (2.0 * (2.0 * 2f64.ln()).sqrt()),
        }
    }

    pub fn validate(&self) -> Result<(), ModelError> {
        match *self {
            AnalyticProfile::Gaussian { sigma } => {
                if sigma > 0.0 && sigma.is_finite() {
                    Ok(())
                } else {
                    Err(ModelError::InvalidProfile(format!(
                        "gaussian sigma must be positive, got {sigma}"
                    )))
                }
            }
            AnalyticProfile::Moffat { alpha, beta } => {
                if !(alpha > 0.0 && alpha.is_finite()) {
                    Err(ModelError::InvalidProfile(format!(
                        "moffat alpha must be positive, got {alpha}"
                    )))
                } else if !(beta > 1.0 && beta.is_finite()) {
                    // Volume diverges for beta <= 1.
                    Err(ModelError::InvalidProfile(format!(
                        "moffat beta must exceed 1, got {beta}"
                    )))
                } else {
                    Ok(())
                }
            }
        }
    }

    /// Profile value at offset `(dx, dy)` from the centre, 1 at the centre.
    pub fn evaluate(&self, dx: f64, dy: f64) -> f64 {
        let r2 = dx * dx + dy * dy;
        match *self {
            AnalyticProfile::Gaussian { sigma } => (-r2 / (2.0 * sigma * sigma)).exp(),
            AnalyticProfile::Moffat { alpha, beta } => (1.0 + r2 / (alpha * alpha)).powf(-beta),
        }
    }

    /// Integral of the unit-peak profile over the plane.
    pub fn unit_volume(&self) -> f64 {
        match *self {
            AnalyticProfile::Gaussian { sigma } => 2.0 * PI * sigma * sigma,
            AnalyticProfile::Moffat { alpha, beta } => PI * alpha * alpha / (beta - 1.0),
        }
    }

    /// Radius beyond which the profile is negligible.
    pub fn support_radius(&self) -> f64 {
        match *self {
            AnalyticProfile::Gaussian { sigma } => 5.0 * sigma,
            AnalyticProfile::Moffat { alpha, beta } => {
                alpha * (SUPPORT_FLOOR.powf(-1.0 / beta) - 1.0).sqrt()
            }
        }
    }

    pub fn fwhm(&self) -> f64 {
        match *self {
            AnalyticProfile::Gaussian { sigma } => 2.0 * (2.0 * 2f64.ln()).sqrt() * sigma,
            AnalyticProfile::Moffat { alpha, beta } => {
                2.0 * alpha * (2f64.powf(1.0 / beta) - 1.0).sqrt()
            }
        }
    }
}
