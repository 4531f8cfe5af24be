use approx::assert_abs_diff_eq;
use limit::injection::{
    ring_positions, CsvRecorder, FailureReason, InjectionSite, Measurement, MeasurementError,
    RecoveryMeasurement, SearchStatus,
};
use limit::photometry::f_ul;
use limit::plot::ConvergencePlot;
use limit::{find_limiting_magnitude, InjectionConfig, LimitingMagnitudeSearch, NO_SUITABLE_SITE};
use ndarray::{s, Array2, ArrayView2};
use shared::image_proc::simple_normal_array;
use std::f64::consts::PI;
use std::sync::atomic::{AtomicUsize, Ordering};
use test_helpers::{add_gaussian_star, output_path};

const FWHM: f64 = 4.0;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Reads the brightest pixel near each site against a fixed noise.
struct PeakReader {
    noise: f64,
}

impl RecoveryMeasurement for PeakReader {
    fn measure(
        &self,
        image: &ArrayView2<f64>,
        sites: &[InjectionSite],
    ) -> Result<Vec<Measurement>, MeasurementError> {
        Ok(sites
            .iter()
            .map(|site| {
                let (row, col) = (site.y.round() as usize, site.x.round() as usize);
                let window = image.slice(s![row - 1..=row + 1, col - 1..=col + 1]);
                Measurement {
                    flux: window.sum(),
                    flux_error: self.noise,
                    peak_flux: window.iter().copied().fold(f64::NEG_INFINITY, f64::max),
                    background: 0.0,
                    background_noise: self.noise,
                }
            })
            .collect())
    }
}

/// Reports a bright source at every site.
struct SaturatedReader;

impl RecoveryMeasurement for SaturatedReader {
    fn measure(
        &self,
        _image: &ArrayView2<f64>,
        sites: &[InjectionSite],
    ) -> Result<Vec<Measurement>, MeasurementError> {
        Ok(vec![
            Measurement {
                flux: 1e6,
                flux_error: 1.0,
                peak_flux: 1e6,
                background: 0.0,
                background_noise: 1.0,
            };
            sites.len()
        ])
    }
}

/// Succeeds for the first `healthy` calls, then always fails.
struct FlakyReader {
    calls: AtomicUsize,
    healthy: usize,
}

impl RecoveryMeasurement for FlakyReader {
    fn measure(
        &self,
        image: &ArrayView2<f64>,
        sites: &[InjectionSite],
    ) -> Result<Vec<Measurement>, MeasurementError> {
        if self.calls.fetch_add(1, Ordering::SeqCst) < self.healthy {
            PeakReader { noise: 5.0 }.measure(image, sites)
        } else {
            Err(MeasurementError::Failed("detector readout lost".to_string()))
        }
    }
}

/// Four sites on an exact ring of radius 10 px around a 64x64 blank image.
fn blank_config() -> InjectionConfig {
    InjectionConfig {
        source_count: 4,
        source_location_fwhm: 2.5,
        jitter_count: 0,
        zeropoint: 25.0,
        rng_seed: Some(1),
        ..Default::default()
    }
}

/// Calibrated magnitude at which a Gaussian of this FWHM peaks at `f_ul`.
fn analytic_limit(config: &InjectionConfig) -> f64 {
    let sigma = FWHM / (2.0 * (2.0 * 2f64.ln()).sqrt());
    let peak = f_ul(config.detection_limit, config.beta_limit, 5.0);
    let counts = peak * 2.0 * PI * sigma * sigma;
    -2.5 * (counts / config.exposure_time).log10() + config.zeropoint
}

#[test]
fn test_beta_search_on_blank_image() {
    init_logging();
    let image = Array2::<f64>::zeros((64, 64));
    let config = blank_config();

    let outcome = LimitingMagnitudeSearch::new(FWHM, config.clone())
        .unwrap()
        .with_measurement(PeakReader { noise: 5.0 })
        .run(&image.view())
        .unwrap();

    assert_eq!(outcome.status, SearchStatus::Converged);
    assert_eq!(outcome.active_sites, vec![0, 1, 2, 3]);
    assert_abs_diff_eq!(outcome.magnitude, 18.70, epsilon = 1e-9);
    assert!((outcome.magnitude - analytic_limit(&config)).abs() < config.fine_step);

    // Six coarse steps, four fine steps, five stability steps.
    assert_eq!(outcome.steps.len(), 15);
    assert_eq!(outcome.table.len(), 15 * 4);
    assert!(outcome.table.for_step(0).all(|row| !row.detected));
    assert!(outcome.table.for_step(5).all(|row| row.detected));
}

#[test]
fn test_long_exposure_converges_from_the_bright_side() {
    init_logging();
    let image = Array2::<f64>::zeros((64, 64));
    let config = InjectionConfig {
        exposure_time: 10.0,
        ..blank_config()
    };

    let outcome = LimitingMagnitudeSearch::new(FWHM, config.clone())
        .unwrap()
        .with_measurement(PeakReader { noise: 5.0 })
        .run(&image.view())
        .unwrap();

    assert_eq!(outcome.status, SearchStatus::Converged);
    assert_abs_diff_eq!(outcome.magnitude, 21.15, epsilon = 1e-9);
    assert!((outcome.magnitude - analytic_limit(&config)).abs() < config.fine_step);
    assert!(outcome.steps[0].recovered == Some(true));
}

#[test]
fn test_occupied_sites_yield_sentinel() {
    init_logging();
    let image = Array2::<f64>::zeros((64, 64));
    let mut plot = ConvergencePlot::new(0.8);

    let outcome = LimitingMagnitudeSearch::new(FWHM, blank_config())
        .unwrap()
        .with_measurement(SaturatedReader)
        .with_observer(&mut plot)
        .run(&image.view())
        .unwrap();

    assert_eq!(outcome.status, SearchStatus::NoSuitableSite);
    assert_eq!(outcome.magnitude, NO_SUITABLE_SITE);
    assert!(outcome.active_sites.is_empty());
    assert!(outcome.table.is_empty());
    assert_eq!(plot.result(), None);
}

#[test]
fn test_repeated_measurement_failure_stops_search() {
    init_logging();
    let image = Array2::<f64>::zeros((64, 64));
    let config = blank_config();

    let outcome = LimitingMagnitudeSearch::new(FWHM, config.clone())
        .unwrap()
        .with_measurement(FlakyReader {
            calls: AtomicUsize::new(0),
            healthy: 4,
        })
        .run(&image.view())
        .unwrap();

    assert_eq!(
        outcome.status,
        SearchStatus::Failed(FailureReason::MeasurementFailure)
    );
    assert!(outcome.magnitude.is_nan());
    assert_eq!(outcome.steps.len(), config.retry_limit + 1);
    assert!(outcome.steps.iter().all(|s| s.recovered.is_none()));
    assert!(outcome
        .steps
        .iter()
        .all(|s| s.magnitude == outcome.steps[0].magnitude));
    assert!(outcome.table.rows().iter().all(|r| !r.detected));
}

#[test]
fn test_budgets_stop_search() {
    init_logging();
    let image = Array2::<f64>::zeros((64, 64));

    let limited = InjectionConfig {
        max_total_iterations: 3,
        ..blank_config()
    };
    let outcome = LimitingMagnitudeSearch::new(FWHM, limited)
        .unwrap()
        .with_measurement(PeakReader { noise: 5.0 })
        .run(&image.view())
        .unwrap();
    assert_eq!(
        outcome.status,
        SearchStatus::Failed(FailureReason::IterationLimit)
    );
    assert_eq!(outcome.steps.len(), 3);
    assert!(outcome.magnitude.is_nan());

    let timed = InjectionConfig {
        time_limit_secs: Some(1e-9),
        ..blank_config()
    };
    let outcome = LimitingMagnitudeSearch::new(FWHM, timed)
        .unwrap()
        .with_measurement(PeakReader { noise: 5.0 })
        .run(&image.view())
        .unwrap();
    assert_eq!(outcome.status, SearchStatus::Failed(FailureReason::TimeLimit));
    assert!(outcome.steps.is_empty());
}

#[test]
fn test_observers_see_every_step() {
    init_logging();
    let image = Array2::<f64>::zeros((64, 64));
    let dir = tempfile::tempdir().unwrap();
    let csv_path = dir.path().join("recovery.csv");

    let mut recorder = CsvRecorder::new(std::fs::File::create(&csv_path).unwrap());
    let mut plot = ConvergencePlot::new(0.8);
    let outcome = LimitingMagnitudeSearch::new(FWHM, blank_config())
        .unwrap()
        .with_measurement(PeakReader { noise: 5.0 })
        .with_observer(&mut recorder)
        .with_observer(&mut plot)
        .run(&image.view())
        .unwrap();
    recorder.finish().unwrap();

    let text = std::fs::read_to_string(&csv_path).unwrap();
    assert_eq!(text.lines().count(), outcome.table.len() + 1);
    assert!(text.starts_with("site,step,repeat"));

    assert_eq!(plot.steps().len(), outcome.steps.len());
    assert_eq!(plot.result(), Some(outcome.magnitude));
}

#[test]
fn test_cutoff_above_one_is_clamped() {
    let config = InjectionConfig {
        cutoff_fraction: 1.5,
        ..Default::default()
    };
    let search = LimitingMagnitudeSearch::new(FWHM, config).unwrap();
    assert_eq!(search.config().cutoff_fraction, 0.8);
}

#[test]
fn test_invalid_fwhm_gives_nan() {
    init_logging();
    let image = Array2::<f64>::zeros((64, 64));
    let config = blank_config();
    assert!(find_limiting_magnitude(&image.view(), 0.0, 1.0, &config).is_nan());
    assert!(find_limiting_magnitude(&image.view(), f64::NAN, 1.0, &config).is_nan());
}

#[test]
fn test_snr_search_on_gaussian_sky() {
    init_logging();
    // Forty separated sites on a 64 px ring keep the median noise offset
    // near 0.07 mag.
    let image = simple_normal_array((201, 201), 100.0, 5.0, 17).unwrap();
    let config = InjectionConfig {
        use_beta_criterion: false,
        cutoff_fraction: 0.5,
        source_count: 40,
        source_location_fwhm: 16.0,
        jitter_count: 0,
        noise_repeat_count: 1,
        zeropoint: 25.0,
        rng_seed: Some(3),
        ..Default::default()
    };

    let csv_path = output_path("limit_snr_search.csv");
    let mut recorder = CsvRecorder::new(std::fs::File::create(&csv_path).unwrap());
    let outcome = LimitingMagnitudeSearch::new(FWHM, config.clone())
        .unwrap()
        .with_observer(&mut recorder)
        .run(&image.view())
        .unwrap();
    recorder.finish().unwrap();

    // 3 sigma in a 6.8 px aperture over 5 count sky noise is about 185 counts.
    let n_pix = PI * (config.aperture_size_fwhm * FWHM).powi(2);
    let variance = n_pix * 25.0;
    let limit_counts = (9.0 + (81.0 + 36.0 * variance).sqrt()) / 2.0;
    let expected = -2.5 * limit_counts.log10() + config.zeropoint;

    assert_eq!(outcome.status, SearchStatus::Converged);
    assert!(outcome.active_sites.len() > 30);
    assert!(
        (outcome.magnitude - expected).abs() < 0.25,
        "limit {:.3}, expected near {expected:.3}",
        outcome.magnitude
    );
}

#[test]
fn test_star_on_ring_is_skipped() {
    init_logging();
    let mut image = simple_normal_array((101, 101), 100.0, 5.0, 29).unwrap();
    let config = InjectionConfig {
        use_beta_criterion: false,
        source_count: 4,
        jitter_count: 0,
        zeropoint: 25.0,
        rng_seed: Some(8),
        ..Default::default()
    };
    let ring = ring_positions(config.source_location_fwhm * FWHM, image.dim(), 4);
    add_gaussian_star(&mut image, ring[0].x, ring[0].y, 500.0, 1.7);

    let outcome = LimitingMagnitudeSearch::new(FWHM, config)
        .unwrap()
        .run(&image.view())
        .unwrap();

    assert!(outcome.thresholds[0].pre_snr > 10.0);
    assert!(!outcome.active_sites.contains(&0));
    assert!(!outcome.active_sites.is_empty());
    assert!(outcome.table.for_site(0).next().is_none());
}
