//! Background surface removal.
//!
//! A [`BackgroundModel`] takes an image and returns the residual after the
//! sky surface has been subtracted, along with the surface itself and a noise
//! estimate for the residual. Two models are provided:
//!
//! - [`LocalMedianBackground`]: a flat sigma-clipped median level, suited to
//!   small cutouts around a target
//! - [`PolynomialBackground`]: a low-order 2D polynomial surface fitted by
//!   least squares to the sigma-clipped pixels, suited to fields with a
//!   gradient
//!
//! Noise is always the sigma-clipped standard deviation of the residual, so
//! bright stars do not inflate it.

use crate::algo::stats::{median, sigma_clipped_stats, StatsError};
use nalgebra::{DMatrix, DVector};
use ndarray::{Array2, ArrayView2};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Upper bound on pixels fed to the polynomial least-squares solve.
const MAX_FIT_SAMPLES: usize = 40_000;

#[derive(Error, Debug)]
pub enum BackgroundError {
    #[error("background statistics failed: {0}")]
    Stats(#[from] StatsError),

    #[error("polynomial degree {0} not supported, expected 1 to 3")]
    UnsupportedDegree(usize),

    #[error("surface fit failed: {0}")]
    FitFailed(String),
}

/// Result of removing a background surface from an image.
#[derive(Debug, Clone)]
pub struct BackgroundFit {
    /// Image minus surface
    pub residual: Array2<f64>,
    /// Fitted sky surface
    pub surface: Array2<f64>,
    /// Median of the fitted surface
    pub surface_median: f64,
    /// Robust standard deviation of the residual
    pub noise: f64,
}

/// Removes a sky background from an image.
pub trait BackgroundModel: Send + Sync {
    fn remove(&self, image: &ArrayView2<f64>) -> Result<BackgroundFit, BackgroundError>;
}

/// Serializable selector for the built-in background models.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum BackgroundMethod {
    LocalMedian { clip_sigma: f64 },
    Polynomial { degree: usize, clip_sigma: f64 },
}

impl Default for BackgroundMethod {
    fn default() -> Self {
        BackgroundMethod::LocalMedian { clip_sigma: 3.0 }
    }
}

impl BackgroundMethod {
    /// Build the model this selector describes.
    pub fn build(&self) -> Box<dyn BackgroundModel> {
        match *self {
            BackgroundMethod::LocalMedian { clip_sigma } => {
                Box::new(LocalMedianBackground { clip_sigma })
            }
            BackgroundMethod::Polynomial { degree, clip_sigma } => {
                Box::new(PolynomialBackground { degree, clip_sigma })
            }
        }
    }
}

fn clipped_noise(residual: &Array2<f64>, clip_sigma: f64) -> Result<f64, StatsError> {
    let values: Vec<f64> = residual.iter().copied().collect();
    Ok(sigma_clipped_stats(&values, clip_sigma, 5)?.std)
}

/// Flat background at the sigma-clipped median of the image.
#[derive(Debug, Clone, Copy)]
pub struct LocalMedianBackground {
    pub clip_sigma: f64,
}

impl BackgroundModel for LocalMedianBackground {
    fn remove(&self, image: &ArrayView2<f64>) -> Result<BackgroundFit, BackgroundError> {
        let values: Vec<f64> = image.iter().copied().collect();
        let level = sigma_clipped_stats(&values, self.clip_sigma, 5)?.median;

        let surface = Array2::from_elem(image.dim(), level);
        let residual = image.mapv(|v| v - level);
        let noise = clipped_noise(&residual, self.clip_sigma)?;

        Ok(BackgroundFit {
            residual,
            surface,
            surface_median: level,
            noise,
        })
    }
}

/// 2D polynomial sky surface of total degree 1 to 3.
#[derive(Debug, Clone, Copy)]
pub struct PolynomialBackground {
    pub degree: usize,
    pub clip_sigma: f64,
}

impl PolynomialBackground {
    /// Monomial exponents (px, py) with px + py <= degree.
    fn terms(&self) -> Vec<(i32, i32)> {
        let d = self.degree as i32;
        (0..=d)
            .flat_map(|total| (0..=total).map(move |py| (total - py, py)))
            .collect()
    }

    fn solve(
        &self,
        terms: &[(i32, i32)],
        samples: &[(f64, f64, f64)],
    ) -> Result<DVector<f64>, BackgroundError> {
        if samples.len() < terms.len() {
            return Err(BackgroundError::FitFailed(format!(
                "{} usable pixels for {} coefficients",
                samples.len(),
                terms.len()
            )));
        }

        let design = DMatrix::from_fn(samples.len(), terms.len(), |row, col| {
            let (x, y, _) = samples[row];
            let (px, py) = terms[col];
            x.powi(px) * y.powi(py)
        });
        let rhs = DVector::from_iterator(samples.len(), samples.iter().map(|s| s.2));

        design
            .svd(true, true)
            .solve(&rhs, 1e-10)
            .map_err(|e| BackgroundError::FitFailed(e.to_string()))
    }
}

impl BackgroundModel for PolynomialBackground {
    fn remove(&self, image: &ArrayView2<f64>) -> Result<BackgroundFit, BackgroundError> {
        if !(1..=3).contains(&self.degree) {
            return Err(BackgroundError::UnsupportedDegree(self.degree));
        }
        let (height, width) = image.dim();
        let terms = self.terms();

        // Normalised coordinates keep the design matrix well conditioned.
        let norm = |v: usize, n: usize| {
            if n > 1 {
                2.0 * v as f64 / (n - 1) as f64 - 1.0
            } else {
                0.0
            }
        };

        let stride = (image.len() / MAX_FIT_SAMPLES).max(1);
        let mut samples: Vec<(f64, f64, f64)> = image
            .indexed_iter()
            .step_by(stride)
            .filter(|(_, v)| v.is_finite())
            .map(|((y, x), &v)| (norm(x, width), norm(y, height), v))
            .collect();

        let evaluate = |coeffs: &DVector<f64>, x: f64, y: f64| -> f64 {
            terms
                .iter()
                .zip(coeffs.iter())
                .map(|(&(px, py), c)| c * x.powi(px) * y.powi(py))
                .sum()
        };

        // Fit, reject outliers against the fitted surface, refit.
        let mut coeffs = self.solve(&terms, &samples)?;
        for _ in 0..3 {
            let residuals: Vec<f64> = samples
                .iter()
                .map(|&(x, y, v)| v - evaluate(&coeffs, x, y))
                .collect();
            let spread = sigma_clipped_stats(&residuals, self.clip_sigma, 5)?.std;
            let before = samples.len();
            let kept: Vec<(f64, f64, f64)> = samples
                .iter()
                .zip(residuals.iter())
                .filter(|(_, r)| r.abs() <= self.clip_sigma * spread)
                .map(|(s, _)| *s)
                .collect();
            if kept.len() == before || kept.len() < terms.len() {
                break;
            }
            samples = kept;
            coeffs = self.solve(&terms, &samples)?;
        }

        let surface = Array2::from_shape_fn((height, width), |(y, x)| {
            evaluate(&coeffs, norm(x, width), norm(y, height))
        });

        let residual = image.to_owned() - &surface;
        let surface_values: Vec<f64> = surface.iter().copied().collect();
        let surface_median = median(&surface_values)?;
        let noise = clipped_noise(&residual, self.clip_sigma)?;

        Ok(BackgroundFit {
            residual,
            surface,
            surface_median,
            noise,
        })
    }
}
