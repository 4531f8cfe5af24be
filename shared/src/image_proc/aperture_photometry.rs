//! Aperture photometry for point sources.
//!
//! Pixels are assigned to the aperture or the background annulus by the
//! "center" method: a pixel belongs to a region when its centre falls inside
//! it. The local background is the median of the annulus and its noise the
//! MAD-derived sigma, which keeps neighbouring stars and cosmic rays in the
//! annulus from biasing either.

use crate::algo::stats::{mad_sigma, median, StatsError};
use ndarray::ArrayView2;
use thiserror::Error;

/// Minimum number of annulus pixels for a usable background estimate.
pub const MIN_BACKGROUND_PIXELS: usize = 10;

#[derive(Error, Debug)]
pub enum ApertureError {
    #[error("aperture contains no pixels at ({x:.1}, {y:.1}) with radius {radius:.1}")]
    EmptyAperture { x: f64, y: f64, radius: f64 },

    #[error("insufficient background pixels ({count}) at ({x:.1}, {y:.1}), need at least 10")]
    InsufficientBackground { count: usize, x: f64, y: f64 },

    #[error("non-finite position ({x}, {y})")]
    InvalidPosition { x: f64, y: f64 },

    #[error("stats computation failed: {0}")]
    Stats(#[from] StatsError),
}

/// Aperture and annulus radii in pixels.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ApertureRadii {
    pub aperture: f64,
    pub annulus_inner: f64,
    pub annulus_outer: f64,
}

impl ApertureRadii {
    /// Radii scaled from a FWHM by the given multiples.
    pub fn from_fwhm(fwhm: f64, aperture: f64, inner: f64, outer: f64) -> Self {
        Self {
            aperture: aperture * fwhm,
            annulus_inner: inner * fwhm,
            annulus_outer: outer * fwhm,
        }
    }
}

/// Background-subtracted aperture measurement in counts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ApertureMeasurement {
    /// Aperture sum minus the background contribution
    pub flux: f64,
    /// CCD-equation uncertainty on `flux`
    pub flux_error: f64,
    /// Brightest background-subtracted pixel in the aperture
    pub peak: f64,
    /// Per-pixel background level from the annulus
    pub background: f64,
    /// Per-pixel background noise from the annulus
    pub background_noise: f64,
    /// Pixels in the aperture
    pub aperture_pixels: usize,
    /// Pixels in the annulus
    pub background_pixels: usize,
}

/// Collect pixels from a circular aperture and background annulus.
///
/// # Arguments
///
/// * `image` - Image indexed `[y, x]`
/// * `x_center`, `y_center` - Aperture centre, may be subpixel
/// * `aperture_radius` - Aperture radius in pixels
/// * `background_inner_radius`, `background_outer_radius` - Annulus radii in pixels
///
/// # Returns
///
/// `(aperture_pixels, background_pixels)`. Regions are clipped at the image
/// edge, so either vector may be short or empty near borders.
pub fn collect_aperture_pixels(
    image: &ArrayView2<f64>,
    x_center: f64,
    y_center: f64,
    aperture_radius: f64,
    background_inner_radius: f64,
    background_outer_radius: f64,
) -> (Vec<f64>, Vec<f64>) {
    let (height, width) = image.dim();
    let reach = background_outer_radius.max(aperture_radius).ceil() as isize;

    let xc = x_center.round() as isize;
    let yc = y_center.round() as isize;

    let x_min = (xc - reach).max(0) as usize;
    let x_max = (xc + reach + 1).clamp(0, width as isize) as usize;
    let y_min = (yc - reach).max(0) as usize;
    let y_max = (yc + reach + 1).clamp(0, height as isize) as usize;

    let mut aperture_pixels = Vec::new();
    let mut background_pixels = Vec::new();

    for y in y_min..y_max {
        for x in x_min..x_max {
            let dx = x as f64 - x_center;
            let dy = y as f64 - y_center;
            let distance = (dx * dx + dy * dy).sqrt();

            if distance <= aperture_radius {
                aperture_pixels.push(image[[y, x]]);
            } else if distance >= background_inner_radius && distance <= background_outer_radius {
                background_pixels.push(image[[y, x]]);
            }
        }
    }

    (aperture_pixels, background_pixels)
}

/// Measure a source at `(x, y)` with a circular aperture and local annulus.
///
/// `gain` converts counts to electrons for the shot-noise term of the flux
/// error; the returned values stay in counts.
pub fn measure_aperture(
    image: &ArrayView2<f64>,
    x: f64,
    y: f64,
    radii: &ApertureRadii,
    gain: f64,
) -> Result<ApertureMeasurement, ApertureError> {
    if !x.is_finite() || !y.is_finite() {
        return Err(ApertureError::InvalidPosition { x, y });
    }

    let (aperture, annulus) = collect_aperture_pixels(
        image,
        x,
        y,
        radii.aperture,
        radii.annulus_inner,
        radii.annulus_outer,
    );

    if aperture.is_empty() {
        return Err(ApertureError::EmptyAperture {
            x,
            y,
            radius: radii.aperture,
        });
    }
    if annulus.len() < MIN_BACKGROUND_PIXELS {
        return Err(ApertureError::InsufficientBackground {
            count: annulus.len(),
            x,
            y,
        });
    }

    let background = median(&annulus)?;
    let background_noise = mad_sigma(&annulus, background)?;

    let n_ap = aperture.len() as f64;
    let n_bkg = annulus.len() as f64;
    let flux = aperture.iter().sum::<f64>() - background * n_ap;
    let peak = aperture
        .iter()
        .copied()
        .fold(f64::NEG_INFINITY, f64::max)
        - background;

    let gain = if gain > 0.0 { gain } else { 1.0 };
    let variance =
        flux.max(0.0) / gain + n_ap * background_noise.powi(2) * (1.0 + n_ap / n_bkg);

    Ok(ApertureMeasurement {
        flux,
        flux_error: variance.sqrt(),
        peak,
        background,
        background_noise,
        aperture_pixels: aperture.len(),
        background_pixels: annulus.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::Array2;

    #[test]
    fn test_collect_aperture_pixels_regions() {
        let image = Array2::from_shape_fn((20, 20), |(i, j)| {
            let d = ((j as f64 - 10.0).powi(2) + (i as f64 - 10.0).powi(2)).sqrt();
            if d <= 2.0 {
                100.0
            } else if (4.0..=6.0).contains(&d) {
                50.0
            } else {
                0.0
            }
        });

        let (ap, bkg) = collect_aperture_pixels(&image.view(), 10.0, 10.0, 2.0, 4.0, 6.0);
        assert!(!ap.is_empty());
        assert!(ap.iter().all(|&p| p == 100.0));
        assert!(!bkg.is_empty());
        assert!(bkg.iter().all(|&p| p == 50.0));
    }

    #[test]
    fn test_collect_aperture_pixels_counts() {
        let image = Array2::<f64>::zeros((30, 30));
        let (ap, _) = collect_aperture_pixels(&image.view(), 15.0, 15.0, 3.0, 6.0, 9.0);
        // Center method on a 3 px radius gives 29 pixels.
        assert_eq!(ap.len(), 29);
    }

    #[test]
    fn test_collect_aperture_pixels_clips_edges() {
        let image = Array2::<f64>::ones((10, 10));
        let (ap, bkg) = collect_aperture_pixels(&image.view(), 0.0, 0.0, 1.5, 3.0, 4.5);
        assert!(!ap.is_empty());
        assert!(!bkg.is_empty());
        let (ap, bkg) = collect_aperture_pixels(&image.view(), -50.0, -50.0, 1.5, 3.0, 4.5);
        assert!(ap.is_empty() && bkg.is_empty());
    }

    #[test]
    fn test_measure_aperture_subtracts_background() {
        let mut image = Array2::from_elem((40, 40), 20.0);
        image[[20, 20]] += 500.0;
        let radii = ApertureRadii::from_fwhm(2.0, 1.5, 3.0, 5.0);

        let m = measure_aperture(&image.view(), 20.0, 20.0, &radii, 1.0).unwrap();
        assert_relative_eq!(m.background, 20.0);
        assert_eq!(m.background_noise, 0.0);
        assert_relative_eq!(m.flux, 500.0, epsilon = 1e-9);
        assert_relative_eq!(m.peak, 500.0, epsilon = 1e-9);
        assert_relative_eq!(m.flux_error, 500.0_f64.sqrt(), epsilon = 1e-9);
    }

    #[test]
    fn test_measure_aperture_errors() {
        let image = Array2::<f64>::zeros((40, 40));
        let radii = ApertureRadii::from_fwhm(2.0, 1.5, 3.0, 5.0);
        assert!(matches!(
            measure_aperture(&image.view(), f64::NAN, 3.0, &radii, 1.0),
            Err(ApertureError::InvalidPosition { .. })
        ));
        assert!(matches!(
            measure_aperture(&image.view(), -100.0, -100.0, &radii, 1.0),
            Err(ApertureError::EmptyAperture { .. })
        ));
    }
}
