//! Configuration for injection/recovery runs and the single-sample estimator.
//!
//! Every field has a default, so a JSON file only needs to name the values it
//! changes. [`InjectionConfig::validated`] normalises a configuration and
//! rejects contract violations before any image work starts.

use serde::{Deserialize, Serialize};
use shared::image_proc::BackgroundMethod;
use std::path::Path;
use thiserror::Error;

use crate::injection::profile::AnalyticProfile;

/// Cutoff used when a configured value is out of range.
pub const DEFAULT_CUTOFF_FRACTION: f64 = 0.8;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("failed to read or write configuration: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed configuration JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Shape parameters for the analytic source profile.
///
/// Mirrors the usual PSF fit output: a Gaussian needs `sigma`, a Moffat needs
/// `alpha` and `beta`. Which one is read depends on
/// [`InjectionConfig::use_moffat_profile`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ProfileParameters {
    pub sigma: Option<f64>,
    pub alpha: Option<f64>,
    pub beta: Option<f64>,
}

impl ProfileParameters {
    /// The analytic profile these parameters describe, if they are complete and valid.
    pub fn to_profile(&self, use_moffat: bool) -> Option<AnalyticProfile> {
        let profile = if use_moffat {
            AnalyticProfile::Moffat {
                alpha: self.alpha?,
                beta: self.beta?,
            }
        } else {
            AnalyticProfile::Gaussian { sigma: self.sigma? }
        };
        profile.validate().ok().map(|_| profile)
    }
}

/// Options for limiting magnitude estimation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InjectionConfig {
    /// Significance (in sigma) a source must reach to count as detected
    pub detection_limit: f64,
    /// Threshold (in sigma) for masking existing sources
    pub bkg_level: f64,
    /// Aperture radius in units of FWHM
    pub aperture_size_fwhm: f64,
    /// Background annulus inner radius in units of FWHM
    pub annulus_inner_fwhm: f64,
    /// Background annulus outer radius in units of FWHM
    pub annulus_outer_fwhm: f64,
    /// Exposure time in seconds
    pub exposure_time: f64,
    /// Detector gain in electrons per count
    pub gain: f64,
    /// Read noise in electrons
    pub read_noise: f64,
    /// Use the beta detection-probability criterion instead of SNR
    pub use_beta_criterion: bool,
    /// Image is template subtracted; also selects the beta criterion
    pub subtraction_ready: bool,
    /// Detection probability a recovered source must reach in beta mode
    pub beta_limit: f64,
    /// Coarse magnitude step
    pub coarse_step: f64,
    /// Fine magnitude step, must be smaller than `coarse_step`
    pub fine_step: f64,
    /// Coarse step budget
    pub max_steps: usize,
    /// Injections per site per step when Poisson noise is enabled
    pub noise_repeat_count: usize,
    /// Number of ring sites around the target
    pub source_count: usize,
    /// Fraction of injections that must be lost to call a magnitude unrecovered
    pub cutoff_fraction: f64,
    /// Add Poisson noise to every injected source
    pub add_poisson_noise: bool,
    /// Read Moffat rather than Gaussian parameters from `profile`
    pub use_moffat_profile: bool,
    /// Analytic profile parameters; derived from FWHM when absent
    pub profile: Option<ProfileParameters>,
    /// Zeropoint added to instrumental magnitudes
    pub zeropoint: f64,
    /// Calibrated magnitude of the first step when no guess is given
    pub start_magnitude: f64,
    /// Calibrated first-step magnitude overriding `start_magnitude`
    pub magnitude_guess: Option<f64>,
    /// Ring radius in units of FWHM
    pub source_location_fwhm: f64,
    /// Jittered duplicates per ring site
    pub jitter_count: usize,
    /// Jitter amplitude in units of FWHM/2; -1 selects subpixel jitter
    pub jitter_offset_fwhm: f64,
    /// Consecutive fine steps that must agree before convergence
    pub stability_steps: usize,
    /// Disagreements tolerated before they are ignored as noise
    pub discrepancy_limit: usize,
    /// Retries of a step whose measurement failed
    pub retry_limit: usize,
    /// Hard ceiling on steps in one search
    pub max_total_iterations: usize,
    /// Wall-clock ceiling on one search
    pub time_limit_secs: Option<f64>,
    /// Seed for placement jitter, noise and sampling
    pub rng_seed: Option<u64>,
    /// Random apertures drawn by the single-sample estimator
    pub sample_count: usize,
    /// Background removal applied before measuring
    pub background: BackgroundMethod,
}

impl Default for InjectionConfig {
    fn default() -> Self {
        Self {
            detection_limit: 3.0,
            bkg_level: 3.0,
            aperture_size_fwhm: 1.7,
            annulus_inner_fwhm: 2.0,
            annulus_outer_fwhm: 3.0,
            exposure_time: 1.0,
            gain: 1.0,
            read_noise: 0.0,
            use_beta_criterion: true,
            subtraction_ready: false,
            beta_limit: 0.75,
            coarse_step: 0.5,
            fine_step: 0.05,
            max_steps: 50,
            noise_repeat_count: 3,
            source_count: 10,
            cutoff_fraction: DEFAULT_CUTOFF_FRACTION,
            add_poisson_noise: false,
            use_moffat_profile: false,
            profile: None,
            zeropoint: 0.0,
            start_magnitude: 21.0,
            magnitude_guess: None,
            source_location_fwhm: 3.0,
            jitter_count: 3,
            jitter_offset_fwhm: 1.0,
            stability_steps: 5,
            discrepancy_limit: 3,
            retry_limit: 3,
            max_total_iterations: 500,
            time_limit_secs: None,
            rng_seed: None,
            sample_count: 150,
            background: BackgroundMethod::default(),
        }
    }
}

fn require(condition: bool, message: impl FnOnce() -> String) -> Result<(), ConfigError> {
    if condition {
        Ok(())
    } else {
        Err(ConfigError::Invalid(message()))
    }
}

impl InjectionConfig {
    /// Load configuration from a JSON file
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&json)?;
        config.validated()
    }

    /// Save configuration to a JSON file
    pub fn save_to_file(&self, path: &Path) -> Result<(), ConfigError> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// True when the beta criterion decides detections.
    pub fn uses_beta_mode(&self) -> bool {
        self.use_beta_criterion || self.subtraction_ready
    }

    /// Injections per site per step.
    pub fn repeats(&self) -> usize {
        if self.add_poisson_noise {
            self.noise_repeat_count.max(1)
        } else {
            1
        }
    }

    /// Instrumental magnitude of the first step.
    pub fn instrumental_start(&self) -> f64 {
        self.magnitude_guess.unwrap_or(self.start_magnitude) - self.zeropoint
    }

    /// Normalised copy of this configuration.
    ///
    /// A `cutoff_fraction` above 1 is reset to 0.8 with a warning. Values that
    /// cannot be repaired are reported as [`ConfigError::Invalid`].
    pub fn validated(&self) -> Result<Self, ConfigError> {
        let mut config = self.clone();

        if config.cutoff_fraction > 1.0 {
            log::warn!(
                "cutoff_fraction {:.3} exceeds 1, resetting to {DEFAULT_CUTOFF_FRACTION}",
                config.cutoff_fraction
            );
            config.cutoff_fraction = DEFAULT_CUTOFF_FRACTION;
        }

        let c = &config;
        require(c.cutoff_fraction >= 0.0, || {
            format!("cutoff_fraction must be non-negative, got {}", c.cutoff_fraction)
        })?;
        require(c.detection_limit > 0.0, || {
            format!("detection_limit must be positive, got {}", c.detection_limit)
        })?;
        require(c.exposure_time > 0.0 && c.exposure_time.is_finite(), || {
            format!("exposure_time must be positive, got {}", c.exposure_time)
        })?;
        require(c.gain > 0.0, || format!("gain must be positive, got {}", c.gain))?;
        require(c.read_noise >= 0.0, || {
            format!("read_noise must be non-negative, got {}", c.read_noise)
        })?;
        require(c.beta_limit > 0.0 && c.beta_limit < 1.0, || {
            format!("beta_limit must lie in (0, 1), got {}", c.beta_limit)
        })?;
        require(c.coarse_step > 0.0 && c.fine_step > 0.0, || {
            format!(
                "magnitude steps must be positive, got coarse {} fine {}",
                c.coarse_step, c.fine_step
            )
        })?;
        require(c.fine_step < c.coarse_step, || {
            format!(
                "fine_step {} must be smaller than coarse_step {}",
                c.fine_step, c.coarse_step
            )
        })?;
        require(c.aperture_size_fwhm > 0.0, || {
            format!("aperture_size_fwhm must be positive, got {}", c.aperture_size_fwhm)
        })?;
        require(
            c.annulus_inner_fwhm >= c.aperture_size_fwhm
                && c.annulus_outer_fwhm > c.annulus_inner_fwhm,
            || {
                format!(
                    "annulus ({}, {}) must lie outside the aperture {}",
                    c.annulus_inner_fwhm, c.annulus_outer_fwhm, c.aperture_size_fwhm
                )
            },
        )?;
        require(c.source_count > 0, || "source_count must be at least 1".to_string())?;
        require(c.sample_count > 1, || "sample_count must be at least 2".to_string())?;
        require(
            c.instrumental_start().is_finite() && c.zeropoint.is_finite(),
            || "start magnitude and zeropoint must be finite".to_string(),
        )?;
        if let Some(limit) = c.time_limit_secs {
            require(limit > 0.0, || format!("time_limit_secs must be positive, got {limit}"))?;
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_defaults_are_valid() {
        let config = InjectionConfig::default().validated().unwrap();
        assert_eq!(config, InjectionConfig::default());
        assert!(config.uses_beta_mode());
        assert_eq!(config.repeats(), 1);
        assert_eq!(config.instrumental_start(), 21.0);
    }

    #[test]
    fn test_cutoff_above_one_resets_to_default() {
        let config = InjectionConfig {
            cutoff_fraction: 1.5,
            ..Default::default()
        };
        assert_eq!(config.validated().unwrap().cutoff_fraction, 0.8);
    }

    #[test]
    fn test_fine_step_must_be_smaller() {
        let config = InjectionConfig {
            fine_step: 0.5,
            coarse_step: 0.5,
            ..Default::default()
        };
        assert!(matches!(config.validated(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_subtraction_ready_selects_beta_mode() {
        let config = InjectionConfig {
            use_beta_criterion: false,
            subtraction_ready: true,
            ..Default::default()
        };
        assert!(config.uses_beta_mode());
    }

    #[test]
    fn test_repeats_need_poisson_noise() {
        let mut config = InjectionConfig {
            noise_repeat_count: 4,
            ..Default::default()
        };
        assert_eq!(config.repeats(), 1);
        config.add_poisson_noise = true;
        assert_eq!(config.repeats(), 4);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: InjectionConfig =
            serde_json::from_str(r#"{"detection_limit": 5.0, "zeropoint": 25.0}"#).unwrap();
        assert_eq!(config.detection_limit, 5.0);
        assert_eq!(config.zeropoint, 25.0);
        assert_eq!(config.fine_step, 0.05);
        assert_eq!(config.instrumental_start(), -4.0);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("inject.json");
        let config = InjectionConfig {
            magnitude_guess: Some(19.5),
            profile: Some(ProfileParameters {
                sigma: Some(1.5),
                ..Default::default()
            }),
            ..Default::default()
        };
        config.save_to_file(&path).unwrap();
        assert_eq!(InjectionConfig::load_from_file(&path).unwrap(), config);
    }

    #[test]
    fn test_profile_parameters_select_shape() {
        let params = ProfileParameters {
            sigma: Some(2.0),
            alpha: Some(3.0),
            beta: Some(2.5),
        };
        assert_eq!(
            params.to_profile(false),
            Some(AnalyticProfile::Gaussian { sigma: 2.0 })
        );
        assert_eq!(
            params.to_profile(true),
            Some(AnalyticProfile::Moffat {
                alpha: 3.0,
                beta: 2.5
            })
        );
        let invalid = ProfileParameters {
            alpha: Some(3.0),
            beta: Some(0.8),
            ..Default::default()
        };
        assert_eq!(invalid.to_profile(true), None);
    }
}
