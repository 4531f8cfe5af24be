//! Synthetic point sources.
//!
//! A [`SourceModel`] turns an instrumental magnitude into a pixel stamp that
//! can be added to an image. It is backed either by a caller-supplied PSF
//! ([`PsfEvaluator`]) or by an [`AnalyticProfile`]; the choice is made once
//! per search by [`SourceModel::select`].

use ndarray::{s, Array2};
use shared::image_proc::apply_poisson_photon_noise;
use std::fmt;
use thiserror::Error;

use super::profile::AnalyticProfile;
use crate::config::ProfileParameters;
use crate::photometry::flux_for_magnitude;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ModelError {
    #[error("no PSF model or valid profile parameters available")]
    Unavailable,

    #[error("invalid profile: {0}")]
    InvalidProfile(String),

    #[error("invalid PSF residual table: {0}")]
    InvalidResidual(String),

    #[error("exposure time must be positive, got {0}")]
    InvalidExposure(f64),
}

/// Point spread function sampled at arbitrary subpixel offsets.
pub trait PsfEvaluator: Send + Sync {
    /// PSF value at `(dx, dy)` from the centre for unit amplitude.
    fn evaluate(&self, dx: f64, dy: f64) -> f64;

    /// Integrated counts of the unit-amplitude PSF.
    fn unity_counts(&self) -> f64;

    /// Radius beyond which the PSF is negligible.
    fn support_radius(&self) -> f64;
}

/// Analytic core plus an oversampled residual lookup table.
///
/// The residual is centred on the table's middle element and sampled
/// `oversample` times per pixel on each axis. Offsets that fall outside the
/// table only see the core.
#[derive(Debug, Clone)]
pub struct ResidualPsf {
    core: AnalyticProfile,
    residual: Array2<f64>,
    oversample: f64,
    unity_counts: f64,
}

impl ResidualPsf {
    pub fn new(
        core: AnalyticProfile,
        residual: Array2<f64>,
        oversample: f64,
    ) -> Result<Self, ModelError> {
        core.validate()?;
        if !(oversample >= 1.0 && oversample.is_finite()) {
            return Err(ModelError::InvalidResidual(format!(
                "oversample must be at least 1, got {oversample}"
            )));
        }
        if residual.iter().any(|v| !v.is_finite()) {
            return Err(ModelError::InvalidResidual(
                "residual contains non-finite values".to_string(),
            ));
        }

        let unity_counts = core.unit_volume() + residual.sum() / (oversample * oversample);
        if unity_counts <= 0.0 {
            return Err(ModelError::InvalidResidual(format!(
                "PSF volume must be positive, got {unity_counts}"
            )));
        }

        Ok(Self {
            core,
            residual,
            oversample,
            unity_counts,
        })
    }

    /// PSF with no residual, identical to its analytic core.
    pub fn from_core(core: AnalyticProfile) -> Result<Self, ModelError> {
        Self::new(core, Array2::zeros((1, 1)), 1.0)
    }

    fn residual_at(&self, dx: f64, dy: f64) -> f64 {
        let (rows, cols) = self.residual.dim();
        let u = (cols as f64 - 1.0) / 2.0 + dx * self.oversample;
        let v = (rows as f64 - 1.0) / 2.0 + dy * self.oversample;
        if u < 0.0 || v < 0.0 || u > (cols - 1) as f64 || v > (rows - 1) as f64 {
            return 0.0;
        }

        let (c0, r0) = (u.floor() as usize, v.floor() as usize);
        let (c1, r1) = ((c0 + 1).min(cols - 1), (r0 + 1).min(rows - 1));
        let (fu, fv) = (u - c0 as f64, v - r0 as f64);

        let top = self.residual[[r0, c0]] * (1.0 - fu) + self.residual[[r0, c1]] * fu;
        let bottom = self.residual[[r1, c0]] * (1.0 - fu) + self.residual[[r1, c1]] * fu;
        top * (1.0 - fv) + bottom * fv
    }
}

impl PsfEvaluator for ResidualPsf {
    fn evaluate(&self, dx: f64, dy: f64) -> f64 {
        self.core.evaluate(dx, dy) + self.residual_at(dx, dy)
    }

    fn unity_counts(&self) -> f64 {
        self.unity_counts
    }

    fn support_radius(&self) -> f64 {
        let (rows, cols) = self.residual.dim();
        let table_reach = rows.max(cols) as f64 / (2.0 * self.oversample);
        self.core.support_radius().max(table_reach)
    }
}

/// Rendered source covering a rectangular patch of the image.
#[derive(Debug, Clone, PartialEq)]
pub struct Stamp {
    /// Column of `data[[0, 0]]`
    pub x0: usize,
    /// Row of `data[[0, 0]]`
    pub y0: usize,
    pub data: Array2<f64>,
}

impl Stamp {
    /// Add the stamp into `image`, which must have the shape it was rendered for.
    pub fn add_to(&self, image: &mut Array2<f64>) {
        let (h, w) = self.data.dim();
        let mut patch = image.slice_mut(s![self.y0..self.y0 + h, self.x0..self.x0 + w]);
        patch += &self.data;
    }

    pub fn peak(&self) -> f64 {
        self.data.iter().copied().fold(0.0, f64::max)
    }

    pub fn total(&self) -> f64 {
        self.data.sum()
    }
}

/// How synthetic sources are drawn.
pub enum SourceModel {
    PsfBacked {
        psf: Box<dyn PsfEvaluator>,
        exposure_time: f64,
    },
    AnalyticBacked {
        profile: AnalyticProfile,
        exposure_time: f64,
    },
}

impl fmt::Debug for SourceModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceModel::PsfBacked { psf, exposure_time } => f
                .debug_struct("PsfBacked")
                .field("unity_counts", &psf.unity_counts())
                .field("exposure_time", exposure_time)
                .finish(),
            SourceModel::AnalyticBacked {
                profile,
                exposure_time,
            } => f
                .debug_struct("AnalyticBacked")
                .field("profile", profile)
                .field("exposure_time", exposure_time)
                .finish(),
        }
    }
}

impl SourceModel {
    /// Pick the source model for a run.
    ///
    /// A PSF wins over profile parameters. Without either, or with parameters
    /// that do not describe a valid profile, returns [`ModelError::Unavailable`].
    pub fn select(
        psf: Option<Box<dyn PsfEvaluator>>,
        params: Option<&ProfileParameters>,
        use_moffat: bool,
        exposure_time: f64,
    ) -> Result<Self, ModelError> {
        if !(exposure_time > 0.0 && exposure_time.is_finite()) {
            return Err(ModelError::InvalidExposure(exposure_time));
        }

        if let Some(psf) = psf {
            let unity = psf.unity_counts();
            if !(unity > 0.0 && unity.is_finite()) {
                return Err(ModelError::InvalidProfile(format!(
                    "PSF unity counts must be positive, got {unity}"
                )));
            }
            return Ok(SourceModel::PsfBacked { psf, exposure_time });
        }

        match params.and_then(|p| p.to_profile(use_moffat)) {
            Some(profile) => Ok(SourceModel::AnalyticBacked {
                profile,
                exposure_time,
            }),
            None => Err(ModelError::Unavailable),
        }
    }

    /// Gaussian model whose FWHM matches the image.
    pub fn gaussian_from_fwhm(fwhm: f64, exposure_time: f64) -> Result<Self, ModelError> {
        if !(exposure_time > 0.0 && exposure_time.is_finite()) {
            return Err(ModelError::InvalidExposure(exposure_time));
        }
        let profile = AnalyticProfile::gaussian_from_fwhm(fwhm);
        profile.validate()?;
        Ok(SourceModel::AnalyticBacked {
            profile,
            exposure_time,
        })
    }

    pub fn exposure_time(&self) -> f64 {
        match self {
            SourceModel::PsfBacked { exposure_time, .. }
            | SourceModel::AnalyticBacked { exposure_time, .. } => *exposure_time,
        }
    }

    /// Total counts of a source at instrumental magnitude `magnitude`.
    pub fn counts_for_magnitude(&self, magnitude: f64) -> f64 {
        self.exposure_time() * flux_for_magnitude(magnitude)
    }

    /// Peak amplitude that makes the model hold the counts of `magnitude`.
    pub fn amplitude_for_magnitude(&self, magnitude: f64) -> f64 {
        match self {
            SourceModel::PsfBacked { psf, exposure_time } => {
                exposure_time / psf.unity_counts() * flux_for_magnitude(magnitude)
            }
            SourceModel::AnalyticBacked { profile, .. } => {
                self.counts_for_magnitude(magnitude) / profile.unit_volume()
            }
        }
    }

    fn evaluate(&self, dx: f64, dy: f64) -> f64 {
        match self {
            SourceModel::PsfBacked { psf, .. } => psf.evaluate(dx, dy),
            SourceModel::AnalyticBacked { profile, .. } => profile.evaluate(dx, dy),
        }
    }

    fn support_radius(&self) -> f64 {
        match self {
            SourceModel::PsfBacked { psf, .. } => psf.support_radius(),
            SourceModel::AnalyticBacked { profile, .. } => profile.support_radius(),
        }
    }

    /// Render a source of peak `amplitude` centred at `(x, y)`.
    ///
    /// Only pixels within the model's support radius are written; the stamp is
    /// clipped to an image of `shape` `(height, width)`. With `noise_seed` the
    /// stamp is replaced by a Poisson realisation of itself.
    pub fn render_source(
        &self,
        x: f64,
        y: f64,
        amplitude: f64,
        shape: (usize, usize),
        noise_seed: Option<u64>,
    ) -> Stamp {
        let (height, width) = shape;
        let radius = self.support_radius();

        let x0 = (x - radius).floor().clamp(0.0, width as f64) as usize;
        let x1 = ((x + radius).ceil() + 1.0).clamp(0.0, width as f64) as usize;
        let y0 = (y - radius).floor().clamp(0.0, height as f64) as usize;
        let y1 = ((y + radius).ceil() + 1.0).clamp(0.0, height as f64) as usize;

        let data = Array2::from_shape_fn((y1.saturating_sub(y0), x1.saturating_sub(x0)), |(r, c)| {
            let dx = (x0 + c) as f64 - x;
            let dy = (y0 + r) as f64 - y;
            if dx * dx + dy * dy <= radius * radius {
                amplitude * self.evaluate(dx, dy)
            } else {
                0.0
            }
        });

        let data = match noise_seed {
            Some(seed) => apply_poisson_photon_noise(&data, Some(seed)),
            None => data,
        };

        Stamp { x0, y0, data }
    }
}
