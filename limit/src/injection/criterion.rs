//! Deciding whether an injected source was recovered.
//!
//! Two modes exist. In SNR mode a measurement is detected when its CCD-equation
//! SNR reaches the site's threshold. In beta mode it is detected when the
//! probability that its peak clears an `n`-sigma threshold, given the site's
//! pre-injection noise, reaches `beta_limit`.
//!
//! Per-site thresholds are computed once from the image before anything is
//! injected and are then frozen for the run.

use serde::Serialize;
use std::f64::consts::PI;

use super::measurement::Measurement;
use crate::config::InjectionConfig;
use crate::photometry::{beta_value, f_ul, snr_electrons};

/// Detection probability below which a site counts as empty before injection.
const EMPTY_SITE_PROBABILITY: f64 = 0.5;

/// Pre-injection SNR at or below which a site counts as empty.
const EMPTY_SITE_SNR: f64 = 2.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DetectionMode {
    Snr,
    Beta,
}

/// Frozen pre-injection statistics of one site.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SiteThreshold {
    pub site: usize,
    pub pre_snr: f64,
    /// Probability that the empty site already reads as a detection
    pub pre_probability: f64,
    /// Local background noise, the sigma of the beta test
    pub noise: f64,
    /// SNR a recovered source must reach here
    pub snr_limit: f64,
    /// Peak a recovered source must reach here in beta mode
    pub flux_limit: f64,
}

impl SiteThreshold {
    /// Threshold of a site whose pre-injection measurement failed.
    pub fn unmeasured(site: usize) -> Self {
        Self {
            site,
            pre_snr: f64::NAN,
            pre_probability: f64::NAN,
            noise: f64::NAN,
            snr_limit: f64::NAN,
            flux_limit: f64::NAN,
        }
    }
}

fn round_to_tenth(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

#[derive(Debug, Clone, PartialEq)]
pub struct DetectionCriterion {
    mode: DetectionMode,
    detection_limit: f64,
    beta_limit: f64,
    beta_exclusion: bool,
    cutoff_fraction: f64,
    aperture_pixels: f64,
    gain: f64,
    read_noise: f64,
}

impl DetectionCriterion {
    pub fn new(config: &InjectionConfig, fwhm: f64) -> Self {
        let radius = config.aperture_size_fwhm * fwhm;
        Self {
            mode: if config.uses_beta_mode() {
                DetectionMode::Beta
            } else {
                DetectionMode::Snr
            },
            detection_limit: config.detection_limit,
            beta_limit: config.beta_limit,
            beta_exclusion: config.use_beta_criterion,
            cutoff_fraction: config.cutoff_fraction,
            aperture_pixels: PI * radius * radius,
            gain: config.gain,
            read_noise: config.read_noise,
        }
    }

    pub fn mode(&self) -> DetectionMode {
        self.mode
    }

    pub fn snr(&self, m: &Measurement) -> f64 {
        snr_electrons(
            m.flux,
            self.aperture_pixels,
            m.background_noise,
            self.gain,
            self.read_noise,
        )
    }

    /// Probability that a peak of `peak` reads as an `n`-sigma detection on `noise`.
    pub fn detection_probability(&self, peak: f64, noise: f64) -> f64 {
        beta_value(self.detection_limit, noise, peak)
    }

    /// Freeze the threshold of `site` from its pre-injection measurement.
    pub fn threshold_for(&self, site: usize, pre: &Measurement) -> SiteThreshold {
        if !pre.is_finite() {
            return SiteThreshold::unmeasured(site);
        }

        let pre_snr = self.snr(pre);
        let snr_limit = if pre_snr.is_finite() {
            self.detection_limit.max(round_to_tenth(pre_snr))
        } else {
            self.detection_limit
        };

        SiteThreshold {
            site,
            pre_snr,
            pre_probability: self.detection_probability(pre.peak_flux, pre.background_noise),
            noise: pre.background_noise,
            snr_limit,
            flux_limit: f_ul(self.detection_limit, self.beta_limit, pre.background_noise),
        }
    }

    /// Whether a site is empty enough to inject into.
    pub fn is_suitable(&self, threshold: &SiteThreshold) -> bool {
        if !threshold.noise.is_finite() {
            return false;
        }
        if self.beta_exclusion {
            threshold.pre_probability < EMPTY_SITE_PROBABILITY
        } else {
            round_to_tenth(threshold.pre_snr) <= EMPTY_SITE_SNR
        }
    }

    pub fn is_detected(&self, m: &Measurement, threshold: &SiteThreshold) -> bool {
        if !m.is_finite() {
            return false;
        }
        match self.mode {
            DetectionMode::Snr => self.snr(m) >= threshold.snr_limit,
            DetectionMode::Beta => {
                self.detection_probability(m.peak_flux, threshold.noise) >= self.beta_limit
            }
        }
    }

    /// Detected fraction of a step and whether it passes the cutoff.
    ///
    /// An empty step is never recovered.
    pub fn recovered(&self, detections: &[bool]) -> (f64, bool) {
        if detections.is_empty() {
            return (0.0, false);
        }
        let detected = detections.iter().filter(|&&d| d).count();
        let fraction = detected as f64 / detections.len() as f64;
        (fraction, fraction >= 1.0 - self.cutoff_fraction)
    }
}
