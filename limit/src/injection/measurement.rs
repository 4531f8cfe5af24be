//! Measuring injected sources.

use ndarray::ArrayView2;
use shared::image_proc::{measure_aperture, ApertureError, ApertureMeasurement, ApertureRadii};
use thiserror::Error;

use super::placement::InjectionSite;
use crate::config::InjectionConfig;

#[derive(Error, Debug)]
pub enum MeasurementError {
    #[error(transparent)]
    Aperture(#[from] ApertureError),

    #[error("{0}")]
    Failed(String),

    #[error("expected {expected} measurements, got {actual}")]
    CountMismatch { expected: usize, actual: usize },
}

/// Photometry of one source position, in counts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Measurement {
    pub flux: f64,
    pub flux_error: f64,
    /// Brightest background-subtracted pixel
    pub peak_flux: f64,
    /// Local background level per pixel
    pub background: f64,
    /// Local background noise per pixel
    pub background_noise: f64,
}

impl Measurement {
    /// Placeholder for a measurement that could not be made.
    pub fn missing() -> Self {
        Self {
            flux: f64::NAN,
            flux_error: f64::NAN,
            peak_flux: f64::NAN,
            background: f64::NAN,
            background_noise: f64::NAN,
        }
    }

    pub fn is_finite(&self) -> bool {
        self.flux.is_finite()
            && self.flux_error.is_finite()
            && self.peak_flux.is_finite()
            && self.background.is_finite()
            && self.background_noise.is_finite()
    }
}

impl From<ApertureMeasurement> for Measurement {
    fn from(m: ApertureMeasurement) -> Self {
        Self {
            flux: m.flux,
            flux_error: m.flux_error,
            peak_flux: m.peak,
            background: m.background,
            background_noise: m.background_noise,
        }
    }
}

/// Measures sources at known positions.
///
/// Implementations return one [`Measurement`] per site, in site order.
pub trait RecoveryMeasurement: Send + Sync {
    fn measure(
        &self,
        image: &ArrayView2<f64>,
        sites: &[InjectionSite],
    ) -> Result<Vec<Measurement>, MeasurementError>;
}

/// Aperture photometry with a local background annulus.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ApertureRecovery {
    radii: ApertureRadii,
    gain: f64,
}

impl ApertureRecovery {
    pub fn new(radii: ApertureRadii, gain: f64) -> Self {
        Self { radii, gain }
    }

    /// Radii scaled by `fwhm` from the configured multiples.
    pub fn from_config(config: &InjectionConfig, fwhm: f64) -> Self {
        Self::new(
            ApertureRadii::from_fwhm(
                fwhm,
                config.aperture_size_fwhm,
                config.annulus_inner_fwhm,
                config.annulus_outer_fwhm,
            ),
            config.gain,
        )
    }

    pub fn radii(&self) -> &ApertureRadii {
        &self.radii
    }
}

impl RecoveryMeasurement for ApertureRecovery {
    fn measure(
        &self,
        image: &ArrayView2<f64>,
        sites: &[InjectionSite],
    ) -> Result<Vec<Measurement>, MeasurementError> {
        sites
            .iter()
            .map(|site| {
                measure_aperture(image, site.x, site.y, &self.radii, self.gain)
                    .map(Measurement::from)
                    .map_err(MeasurementError::from)
            })
            .collect()
    }
}
