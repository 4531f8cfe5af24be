//! Image processing for injection and recovery measurements.
//!
//! - **noise**: seeded Gaussian fields and Poisson photon noise
//! - **aperture_photometry**: aperture and annulus pixel collection and measurement
//! - **background**: sky surface removal and residual noise estimation
//! - **thresholding**: masks for excluding detected sources

pub mod aperture_photometry;
pub mod background;
pub mod noise;
pub mod thresholding;

pub use aperture_photometry::{
    collect_aperture_pixels, measure_aperture, ApertureError, ApertureMeasurement, ApertureRadii,
};
pub use background::{
    BackgroundError, BackgroundFit, BackgroundMethod, BackgroundModel, LocalMedianBackground,
    PolynomialBackground,
};
pub use noise::{apply_poisson_photon_noise, simple_normal_array};
pub use thresholding::{apply_threshold, dilate_mask, disc_mask, source_mask};
