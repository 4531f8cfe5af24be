//! Command-line arguments shared by the limiting magnitude binaries.
//!
//! [`InjectionArgs`] layers CLI overrides on top of an optional JSON
//! configuration file; [`FieldArgs`] describes the synthetic test field used
//! when no image is supplied.

use clap::{Args, ValueEnum};
use shared::image_proc::BackgroundMethod;
use std::path::PathBuf;
use std::time::Duration;

use crate::config::{ConfigError, InjectionConfig};

/// Parse a duration such as "90s", "500ms", "1.5m" or a bare number of seconds.
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    let split = s
        .find(|c: char| c.is_ascii_alphabetic())
        .unwrap_or(s.len());
    let (number, unit) = s.split_at(split);

    let value: f64 = number
        .trim()
        .parse()
        .map_err(|_| format!("Invalid number in duration: {s}"))?;
    if !value.is_finite() || value < 0.0 {
        return Err(format!("Duration must be non-negative: {s}"));
    }

    let duration = match unit {
        "ms" => Duration::from_secs_f64(value / 1000.0),
        "" | "s" => Duration::from_secs_f64(value),
        "m" => Duration::from_secs_f64(value * 60.0),
        "h" => Duration::from_secs_f64(value * 3600.0),
        _ => return Err(format!("Unknown time unit: {unit}")),
    };

    Ok(duration)
}

/// Wrapper for Duration that parses from the command line and prints compactly
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DurationArg(pub Duration);

impl std::str::FromStr for DurationArg {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_duration(s).map(DurationArg)
    }
}

impl std::fmt::Display for DurationArg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let total_ms = self.0.as_millis();
        if total_ms >= 1000 && total_ms % 1000 == 0 {
            write!(f, "{}s", total_ms / 1000)
        } else if total_ms >= 1000 {
            write!(f, "{:.3}s", self.0.as_secs_f64())
        } else {
            write!(f, "{total_ms}ms")
        }
    }
}

/// Background removal choices exposed on the command line
#[derive(Debug, Clone, Copy, PartialEq, ValueEnum)]
pub enum BackgroundChoice {
    /// Flat sigma-clipped median level
    Median,
    /// Low-order polynomial surface
    Polynomial,
}

impl std::fmt::Display for BackgroundChoice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackgroundChoice::Median => write!(f, "median"),
            BackgroundChoice::Polynomial => write!(f, "polynomial"),
        }
    }
}

impl BackgroundChoice {
    pub fn to_method(self, degree: usize, clip_sigma: f64) -> BackgroundMethod {
        match self {
            BackgroundChoice::Median => BackgroundMethod::LocalMedian { clip_sigma },
            BackgroundChoice::Polynomial => BackgroundMethod::Polynomial { degree, clip_sigma },
        }
    }
}

/// Search configuration: a JSON file plus per-field overrides
#[derive(Args, Debug, Clone, Default)]
pub struct InjectionArgs {
    /// JSON configuration file; unspecified fields take their defaults
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Detection significance in sigma
    #[arg(long)]
    pub detection_limit: Option<f64>,

    /// Photometric zeropoint
    #[arg(long)]
    pub zeropoint: Option<f64>,

    /// Exposure time in seconds used to scale injected counts
    #[arg(long)]
    pub exposure_time: Option<f64>,

    /// Calibrated magnitude of the first step
    #[arg(long)]
    pub magnitude_guess: Option<f64>,

    /// Number of injection sites on the ring
    #[arg(long)]
    pub source_count: Option<usize>,

    /// Fraction of injections allowed to be missed at the limit
    #[arg(long)]
    pub cutoff_fraction: Option<f64>,

    /// Decide detections by SNR instead of the beta probability
    #[arg(long, default_value_t = false)]
    pub snr_criterion: bool,

    /// Add Poisson photon noise to every injected source
    #[arg(long, default_value_t = false)]
    pub poisson_noise: bool,

    /// Render sources with a Moffat profile instead of a Gaussian
    #[arg(long, default_value_t = false)]
    pub moffat: bool,

    /// Wall-clock budget for the search (e.g. "90s", "2m")
    #[arg(long)]
    pub time_limit: Option<DurationArg>,

    /// Seed for placement and noise
    #[arg(long)]
    pub seed: Option<u64>,

    /// Background removal method
    #[arg(long, value_enum)]
    pub background: Option<BackgroundChoice>,

    /// Polynomial degree for `--background polynomial`
    #[arg(long, default_value_t = 1)]
    pub background_degree: usize,
}

impl InjectionArgs {
    /// Build the configuration these arguments describe.
    pub fn to_config(&self) -> Result<InjectionConfig, ConfigError> {
        let mut config = match &self.config {
            Some(path) => InjectionConfig::load_from_file(path)?,
            None => InjectionConfig::default(),
        };

        if let Some(v) = self.detection_limit {
            config.detection_limit = v;
        }
        if let Some(v) = self.zeropoint {
            config.zeropoint = v;
        }
        if let Some(v) = self.exposure_time {
            config.exposure_time = v;
        }
        if let Some(v) = self.magnitude_guess {
            config.magnitude_guess = Some(v);
        }
        if let Some(v) = self.source_count {
            config.source_count = v;
        }
        if let Some(v) = self.cutoff_fraction {
            config.cutoff_fraction = v;
        }
        if self.snr_criterion {
            config.use_beta_criterion = false;
        }
        if self.poisson_noise {
            config.add_poisson_noise = true;
        }
        if self.moffat {
            config.use_moffat_profile = true;
        }
        if let Some(limit) = self.time_limit {
            config.time_limit_secs = Some(limit.0.as_secs_f64());
        }
        if let Some(seed) = self.seed {
            config.rng_seed = Some(seed);
        }
        if let Some(choice) = self.background {
            config.background = choice.to_method(self.background_degree, config.bkg_level);
        }

        config.validated()
    }
}

/// Synthetic field used when no image is given
#[derive(Args, Debug, Clone)]
pub struct FieldArgs {
    /// Field width and height in pixels
    #[arg(long, default_value_t = 201)]
    pub size: usize,

    /// Mean sky level in counts
    #[arg(long, default_value_t = 100.0)]
    pub sky: f64,

    /// Sky noise standard deviation in counts
    #[arg(long, default_value_t = 5.0)]
    pub sky_noise: f64,

    /// Source FWHM in pixels
    #[arg(long, default_value_t = 4.0)]
    pub fwhm: f64,

    /// Number of bright field stars scattered over the image
    #[arg(long, default_value_t = 0)]
    pub stars: usize,

    /// Calibrated magnitude of the field stars
    #[arg(long, default_value_t = 16.0)]
    pub star_magnitude: f64,

    /// Seed for the field noise and star positions
    #[arg(long, default_value_t = 7)]
    pub field_seed: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct Cli {
        #[command(flatten)]
        injection: InjectionArgs,
        #[command(flatten)]
        field: FieldArgs,
    }

    #[test]
    fn test_parse_duration_units() {
        assert_eq!(parse_duration("90s"), Ok(Duration::from_secs(90)));
        assert_eq!(parse_duration("500ms"), Ok(Duration::from_millis(500)));
        assert_eq!(parse_duration("1.5m"), Ok(Duration::from_secs(90)));
        assert_eq!(parse_duration("2"), Ok(Duration::from_secs(2)));
        assert!(parse_duration("3 fortnights").is_err());
        assert!(parse_duration("-1s").is_err());
    }

    #[test]
    fn test_duration_display() {
        assert_eq!(DurationArg(Duration::from_secs(2)).to_string(), "2s");
        assert_eq!(DurationArg(Duration::from_millis(1500)).to_string(), "1.500s");
        assert_eq!(DurationArg(Duration::from_millis(20)).to_string(), "20ms");
    }

    #[test]
    fn test_overrides_apply_to_defaults() {
        let cli = Cli::try_parse_from([
            "inject_lmag",
            "--zeropoint",
            "25",
            "--snr-criterion",
            "--time-limit",
            "30s",
            "--background",
            "polynomial",
            "--background-degree",
            "2",
            "--seed",
            "11",
        ])
        .unwrap();
        let config = cli.injection.to_config().unwrap();

        assert_eq!(config.zeropoint, 25.0);
        assert!(!config.use_beta_criterion);
        assert_eq!(config.time_limit_secs, Some(30.0));
        assert_eq!(config.rng_seed, Some(11));
        assert_eq!(
            config.background,
            BackgroundMethod::Polynomial {
                degree: 2,
                clip_sigma: 3.0
            }
        );
        assert_eq!(cli.field.size, 201);
    }

    #[test]
    fn test_config_file_is_overridden() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"zeropoint": 22.5, "source_count": 6}"#).unwrap();

        let cli = Cli::try_parse_from([
            "inject_lmag",
            "--config",
            path.to_str().unwrap(),
            "--source-count",
            "8",
        ])
        .unwrap();
        let config = cli.injection.to_config().unwrap();
        assert_eq!(config.zeropoint, 22.5);
        assert_eq!(config.source_count, 8);
    }

    #[test]
    fn test_invalid_override_is_rejected() {
        let args = InjectionArgs {
            detection_limit: Some(-1.0),
            ..Default::default()
        };
        assert!(matches!(args.to_config(), Err(ConfigError::Invalid(_))));
    }
}
