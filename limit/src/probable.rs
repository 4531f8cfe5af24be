//! Single-sample limiting magnitude.
//!
//! A quick, non-iterative estimate: sum many random "fake apertures" of sky
//! pixels, fit the spread of those sums with a Gaussian, and convert the
//! detection threshold implied by that spread into a magnitude. Useful as a
//! baseline next to the injection search.

use ndarray::{Array2, ArrayView2, Zip};
use rand::rngs::StdRng;
use rand::seq::index;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use shared::algo::{population_std, seeded_par_map};
use shared::image_proc::{disc_mask, source_mask, BackgroundModel};
use std::f64::consts::PI;

use crate::config::InjectionConfig;
use crate::errors::{LimitError, Result};
use crate::fit::{fit_gaussian, GaussianFit, LmConfig};
use crate::injection::image_center;
use crate::photometry::{calc_mag, f_ul};

/// Result of the single-sample estimator with its intermediate products.
#[derive(Debug, Clone, Serialize)]
pub struct SingleSampleEstimate {
    /// Sum of each random fake aperture, in counts
    pub sums: Vec<f64>,
    /// Histogram bin centres of `sums`
    pub bin_centers: Vec<f64>,
    /// Density-normalised histogram of `sums`
    pub density: Vec<f64>,
    pub amplitude: f64,
    pub mean: f64,
    pub sigma: f64,
    /// True when the Gaussian fit failed and sample moments were used
    pub used_fallback: bool,
    /// Pixels per fake aperture
    pub aperture_area: usize,
    /// Pixels eligible for sampling after masking
    pub included_pixels: usize,
    /// Counts at the detection limit
    pub limit_counts: f64,
    /// Instrumental limiting magnitude
    pub magnitude: f64,
}

/// Density-normalised histogram as `(centres, densities)`.
fn density_histogram(values: &[f64], bins: usize) -> (Vec<f64>, Vec<f64>) {
    let (lo, hi) = values
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| {
            (lo.min(v), hi.max(v))
        });
    let width = if hi > lo { (hi - lo) / bins as f64 } else { 1.0 };

    let mut counts = vec![0usize; bins];
    for &v in values {
        let bin = (((v - lo) / width) as usize).min(bins - 1);
        counts[bin] += 1;
    }

    let norm = values.len() as f64 * width;
    let centers = (0..bins).map(|i| lo + (i as f64 + 0.5) * width).collect();
    let density = counts.iter().map(|&c| c as f64 / norm).collect();
    (centers, density)
}

/// Mask of pixels that may be sampled: away from sources and the target.
fn inclusion_mask(
    residual: &ArrayView2<f64>,
    noise: f64,
    radius: f64,
    config: &InjectionConfig,
) -> Array2<bool> {
    let shape = residual.dim();
    let center = image_center(shape);
    let target = disc_mask(shape, center.x, center.y, radius);

    if config.subtraction_ready {
        return target.mapv(|t| !t);
    }

    let sources = source_mask(residual, 0.0, noise, config.bkg_level, radius);
    let mut include = Array2::from_elem(shape, true);
    Zip::from(&mut include)
        .and(&target)
        .and(&sources)
        .for_each(|inc, &t, &s| *inc = !t && !s);
    include
}

/// Estimate the limiting magnitude from random fake apertures.
pub fn estimate_single_sample(
    image: &ArrayView2<f64>,
    fwhm: f64,
    config: &InjectionConfig,
    background: &dyn BackgroundModel,
) -> Result<SingleSampleEstimate> {
    if !(fwhm > 0.0 && fwhm.is_finite()) {
        return Err(LimitError::InvalidInput(format!(
            "FWHM must be positive, got {fwhm}"
        )));
    }
    let config = config.validated()?;

    let fit = background.remove(image)?;
    let residual = fit.residual.view();
    let radius = config.aperture_size_fwhm * fwhm;
    let aperture_area = (PI * radius * radius).floor() as usize;
    if aperture_area == 0 {
        return Err(LimitError::InvalidInput(format!(
            "aperture radius {radius:.2} px covers no pixels"
        )));
    }

    let include = inclusion_mask(&residual, fit.noise, radius, &config);
    let included: Vec<f64> = residual
        .iter()
        .zip(include.iter())
        .filter(|&(v, &inc)| inc && v.is_finite())
        .map(|(&v, _)| v)
        .collect();
    let included_pixels = included.len();

    let pool = if included_pixels >= aperture_area {
        included
    } else {
        log::warn!(
            "only {included_pixels} unmasked pixels for apertures of {aperture_area}, sampling the whole image"
        );
        residual.iter().copied().filter(|v| v.is_finite()).collect()
    };
    if pool.len() < aperture_area {
        return Err(LimitError::InvalidInput(format!(
            "image has {} usable pixels, fewer than one aperture of {aperture_area}",
            pool.len()
        )));
    }

    let mut rng = StdRng::seed_from_u64(config.rng_seed.unwrap_or_else(|| rand::rng().random()));
    let draws: Vec<usize> = (0..config.sample_count).collect();
    let sums = seeded_par_map(&draws, rng.random(), |_, _, seed| {
        let mut rng = StdRng::seed_from_u64(seed);
        index::sample(&mut rng, pool.len(), aperture_area)
            .into_iter()
            .map(|i| pool[i])
            .sum::<f64>()
    });

    let sample_mean = sums.iter().sum::<f64>() / sums.len() as f64;
    let sample_std = population_std(&sums);

    let bins = ((sums.len() as f64).sqrt().ceil() as usize).max(10);
    let (bin_centers, density) = density_histogram(&sums, bins);
    let peak = density.iter().copied().fold(0.0, f64::max);

    let fitted = fit_gaussian(
        &bin_centers,
        &density,
        (peak, sample_mean, sample_std),
        &LmConfig::default(),
    );
    let (fit, used_fallback) = match fitted {
        Ok(fit) if fit.sigma.is_finite() && fit.sigma > 0.0 => (fit, false),
        Ok(fit) => {
            log::warn!("gaussian fit gave sigma {}, using sample moments", fit.sigma);
            (moment_fit(peak, sample_mean, sample_std), true)
        }
        Err(e) => {
            log::warn!("gaussian fit failed ({e}), using sample moments");
            (moment_fit(peak, sample_mean, sample_std), true)
        }
    };
    let GaussianFit {
        amplitude,
        mean,
        sigma,
        ..
    } = fit;

    let limit_counts = if config.use_beta_criterion {
        f_ul(config.detection_limit, config.beta_limit, sigma)
    } else {
        config.detection_limit * sigma
    };
    let magnitude = calc_mag(limit_counts / config.exposure_time, config.gain, 0.0);

    log::info!(
        "single-sample limit: sigma {sigma:.3} counts, limit {limit_counts:.3} counts, magnitude {magnitude:.3}"
    );

    Ok(SingleSampleEstimate {
        sums,
        bin_centers,
        density,
        amplitude,
        mean,
        sigma,
        used_fallback,
        aperture_area,
        included_pixels,
        limit_counts,
        magnitude,
    })
}

fn moment_fit(amplitude: f64, mean: f64, sigma: f64) -> GaussianFit {
    GaussianFit {
        amplitude,
        mean,
        sigma,
        chi2: f64::NAN,
        iterations: 0,
    }
}

/// Instrumental single-sample limiting magnitude, NaN on failure.
///
/// Uses the background model selected by `config`.
pub fn estimate_single_sample_limit(
    image: &ArrayView2<f64>,
    fwhm: f64,
    config: &InjectionConfig,
) -> f64 {
    let background = config.background.build();
    match estimate_single_sample(image, fwhm, config, background.as_ref()) {
        Ok(estimate) => estimate.magnitude,
        Err(e) => {
            log::error!("single-sample estimate failed: {e}");
            f64::NAN
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_histogram_is_density() {
        let values: Vec<f64> = (0..100).map(|i| i as f64).collect();
        let (centers, density) = density_histogram(&values, 10);
        assert_eq!(centers.len(), 10);
        let width = centers[1] - centers[0];
        assert_relative_eq!(density.iter().sum::<f64>() * width, 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_histogram_of_constant_values() {
        let (_, density) = density_histogram(&[3.0; 20], 10);
        assert_relative_eq!(density[0], 1.0);
    }

    #[test]
    fn test_inclusion_mask_excludes_target_and_sources() {
        let mut residual = Array2::zeros((40, 40));
        residual[[5, 5]] = 100.0;
        let config = InjectionConfig::default();
        let include = inclusion_mask(&residual.view(), 1.0, 3.0, &config);
        assert!(!include[[20, 20]]);
        assert!(!include[[5, 7]]);
        assert!(include[[30, 30]]);

        let subtracted = InjectionConfig {
            subtraction_ready: true,
            ..Default::default()
        };
        let include = inclusion_mask(&residual.view(), 1.0, 3.0, &subtracted);
        assert!(!include[[20, 20]]);
        assert!(include[[5, 5]]);
    }
}
