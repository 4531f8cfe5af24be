//! Iterative limiting-magnitude search.
//!
//! The search injects synthetic sources at a ring of empty sites, measures
//! them, and walks the injected magnitude until the detected fraction flips.
//! Stepping is coarse until the first flip, then reverses at a fine step to
//! bracket the limit, and finally keeps stepping past the candidate to make
//! sure the result holds.
//!
//! The stepping logic lives in [`SearchState`], a pure state machine fed one
//! "recovered or not" outcome per step. [`LimitingMagnitudeSearch`] owns the
//! image work around it.

use ndarray::{Array2, ArrayView2};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use shared::algo::seeded_par_map;
use shared::image_proc::BackgroundModel;
use std::fmt;
use std::time::{Duration, Instant};

use super::criterion::{DetectionCriterion, DetectionMode, SiteThreshold};
use super::measurement::{ApertureRecovery, Measurement, MeasurementError, RecoveryMeasurement};
use super::placement::{jitter_half_width, jittered_duplicates, ring_positions, InjectionSite};
use super::record::{RecoveryRow, RecoveryTable, SearchObserver, StepSummary};
use super::source_model::{ModelError, PsfEvaluator, SourceModel};
use crate::config::InjectionConfig;
use crate::errors::{LimitError, Result};
use crate::photometry::{calc_mag, mag_error};

/// Returned in place of a magnitude when no site is empty enough to inject into.
pub const NO_SUITABLE_SITE: f64 = 999.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FailureReason {
    /// A step budget ran out before the outcome flipped
    DivergentSearch,
    /// Measurements kept failing at the same step
    MeasurementFailure,
    /// `max_total_iterations` steps were made
    IterationLimit,
    /// `time_limit_secs` elapsed
    TimeLimit,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            FailureReason::DivergentSearch => "search diverged",
            FailureReason::MeasurementFailure => "measurement retries exhausted",
            FailureReason::IterationLimit => "iteration limit reached",
            FailureReason::TimeLimit => "time limit reached",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SearchPhase {
    CoarseInitial,
    CoarseStepping,
    FineStepping,
    OvershootCheck,
    Converged,
    Failed(FailureReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SearchStatus {
    Converged,
    Failed(FailureReason),
    NoSuitableSite,
}

impl fmt::Display for SearchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SearchStatus::Converged => f.write_str("converged"),
            SearchStatus::Failed(reason) => write!(f, "failed: {reason}"),
            SearchStatus::NoSuitableSite => f.write_str("no suitable injection site"),
        }
    }
}

/// Step sizes and budgets of the state machine.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepPolicy {
    pub coarse_step: f64,
    pub fine_step: f64,
    pub max_steps: usize,
    pub stability_steps: usize,
    pub discrepancy_limit: usize,
}

impl StepPolicy {
    pub fn from_config(config: &InjectionConfig) -> Self {
        Self {
            coarse_step: config.coarse_step,
            fine_step: config.fine_step,
            max_steps: config.max_steps,
            stability_steps: config.stability_steps,
            discrepancy_limit: config.discrepancy_limit,
        }
    }

    /// Fine steps allowed before the search is declared divergent.
    pub fn fine_budget(&self) -> usize {
        (1.0 / self.fine_step).floor() as usize + self.max_steps
    }
}

/// Stepping state of one search, in instrumental magnitudes.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchState {
    pub phase: SearchPhase,
    /// Magnitude at index 0 of the current phase
    pub phase_start: f64,
    /// +1 steps fainter, -1 brighter
    pub direction: f64,
    pub step: f64,
    pub index: usize,
    /// Outcome that ends the current phase
    pub expect_recovered: bool,
    pub stable: usize,
    pub discrepancy: usize,
    pub candidate: Option<f64>,
    policy: StepPolicy,
}

impl SearchState {
    pub fn new(start: f64, policy: StepPolicy) -> Self {
        Self {
            phase: SearchPhase::CoarseInitial,
            phase_start: start,
            direction: 1.0,
            step: policy.coarse_step,
            index: 0,
            expect_recovered: false,
            stable: 0,
            discrepancy: 1,
            candidate: None,
            policy,
        }
    }

    /// Magnitude of the next step.
    pub fn current_magnitude(&self) -> f64 {
        self.phase_start + self.direction * self.index as f64 * self.step
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.phase, SearchPhase::Converged | SearchPhase::Failed(_))
    }

    /// Final status once the state is terminal.
    pub fn status(&self) -> Option<SearchStatus> {
        match self.phase {
            SearchPhase::Converged => Some(SearchStatus::Converged),
            SearchPhase::Failed(reason) => Some(SearchStatus::Failed(reason)),
            _ => None,
        }
    }

    pub fn fail(&mut self, reason: FailureReason) {
        self.phase = SearchPhase::Failed(reason);
    }

    fn record_stable(&mut self) {
        self.stable += 1;
        if self.stable > self.policy.stability_steps {
            self.phase = SearchPhase::Converged;
        } else {
            self.index += 1;
        }
    }

    /// Feed the outcome of the step at [`Self::current_magnitude`].
    pub fn advance(&mut self, recovered: bool) -> SearchPhase {
        let magnitude = self.current_magnitude();
        let hit = recovered == self.expect_recovered;

        match self.phase {
            SearchPhase::CoarseInitial => {
                if !recovered {
                    self.direction = -self.direction;
                    self.expect_recovered = true;
                }
                self.index = 1;
                self.phase = SearchPhase::CoarseStepping;
            }
            SearchPhase::CoarseStepping => {
                if hit {
                    self.phase_start = magnitude;
                    self.direction = -self.direction;
                    self.expect_recovered = !self.expect_recovered;
                    self.step = self.policy.fine_step;
                    self.index = 1;
                    self.phase = SearchPhase::FineStepping;
                } else {
                    self.index += 1;
                    if self.index > self.policy.max_steps {
                        self.fail(FailureReason::DivergentSearch);
                    }
                }
            }
            SearchPhase::FineStepping => {
                if hit {
                    self.candidate = Some(magnitude);
                    self.stable = 0;
                    self.phase = SearchPhase::OvershootCheck;
                    self.record_stable();
                } else {
                    self.index += 1;
                    if self.index > self.policy.fine_budget() {
                        self.fail(FailureReason::DivergentSearch);
                    }
                }
            }
            SearchPhase::OvershootCheck => {
                if hit {
                    self.record_stable();
                } else {
                    self.discrepancy += 1;
                    if self.discrepancy > self.policy.discrepancy_limit {
                        // Out of resets: step past the miss without counting it.
                        self.index += 1;
                    } else {
                        self.stable = 0;
                        self.candidate = None;
                        self.index += 1;
                        self.phase = SearchPhase::FineStepping;
                    }
                }
            }
            SearchPhase::Converged | SearchPhase::Failed(_) => {}
        }

        self.phase
    }
}

/// Everything a search produced.
#[derive(Debug, Clone)]
pub struct SearchOutcome {
    pub status: SearchStatus,
    /// Calibrated limiting magnitude, NaN on failure, 999 without a usable site
    pub magnitude: f64,
    pub mode: DetectionMode,
    pub table: RecoveryTable,
    pub steps: Vec<StepSummary>,
    pub sites: Vec<InjectionSite>,
    pub thresholds: Vec<SiteThreshold>,
    /// Indices into `sites` that were injected into
    pub active_sites: Vec<usize>,
}

fn measure_one(
    measurement: &dyn RecoveryMeasurement,
    image: &ArrayView2<f64>,
    site: &InjectionSite,
) -> std::result::Result<Measurement, MeasurementError> {
    let measured = measurement.measure(image, std::slice::from_ref(site))?;
    match measured.as_slice() {
        [m] => Ok(*m),
        other => Err(MeasurementError::CountMismatch {
            expected: 1,
            actual: other.len(),
        }),
    }
}

/// Read-only inputs shared by every step of a run.
struct StepContext<'s> {
    model: &'s SourceModel,
    measurement: &'s dyn RecoveryMeasurement,
    criterion: &'s DetectionCriterion,
    residual: &'s Array2<f64>,
    sites: &'s [InjectionSite],
    thresholds: &'s [SiteThreshold],
    /// `(site, repeat)` pairs injected at every step
    tasks: &'s [(usize, usize)],
    zeropoint: f64,
    gain: f64,
    poisson_noise: bool,
}

impl StepContext<'_> {
    /// Inject every task at `magnitude` into its own copy of the residual.
    fn measure_step(
        &self,
        magnitude: f64,
        seed: u64,
    ) -> std::result::Result<Vec<Measurement>, MeasurementError> {
        let amplitude = self.model.amplitude_for_magnitude(magnitude);
        let shape = self.residual.dim();

        seeded_par_map(self.tasks, seed, |_, &(site, _), task_seed| {
            let position = self.sites[site];
            let stamp = self.model.render_source(
                position.x,
                position.y,
                amplitude,
                shape,
                self.poisson_noise.then_some(task_seed),
            );
            let mut injected = self.residual.clone();
            stamp.add_to(&mut injected);
            measure_one(self.measurement, &injected.view(), &position)
        })
        .into_iter()
        .collect()
    }

    fn rows(&self, step: usize, magnitude: f64, measured: &[Measurement]) -> Vec<RecoveryRow> {
        let exposure = self.model.exposure_time();
        self.tasks
            .iter()
            .zip(measured)
            .map(|(&(site, repeat), m)| {
                let threshold = &self.thresholds[site];
                let position = self.sites[site];
                RecoveryRow {
                    site,
                    step,
                    repeat,
                    x: position.x,
                    y: position.y,
                    inject_mag: magnitude + self.zeropoint,
                    recover_mag: calc_mag(m.flux / exposure, self.gain, self.zeropoint),
                    recover_mag_err: mag_error(m.flux, m.flux_error),
                    inject_flux: self.model.counts_for_magnitude(magnitude),
                    recover_flux: m.flux,
                    recover_snr: self.criterion.snr(m),
                    location_noise: threshold.noise,
                    beta: 1.0 - self.criterion.detection_probability(m.peak_flux, threshold.noise),
                    detected: self.criterion.is_detected(m, threshold),
                }
            })
            .collect()
    }
}

/// Builder and driver for one limiting-magnitude search.
///
/// Collaborators that are not supplied fall back to the defaults implied by
/// the configuration: the configured background model, aperture photometry,
/// and an analytic profile (or a Gaussian matching the FWHM).
pub struct LimitingMagnitudeSearch<'a> {
    fwhm: f64,
    config: InjectionConfig,
    measurement: Option<Box<dyn RecoveryMeasurement + 'a>>,
    background: Option<Box<dyn BackgroundModel + 'a>>,
    psf: Option<Box<dyn PsfEvaluator>>,
    source_model: Option<SourceModel>,
    observers: Vec<&'a mut dyn SearchObserver>,
}

impl<'a> LimitingMagnitudeSearch<'a> {
    pub fn new(fwhm: f64, config: InjectionConfig) -> Result<Self> {
        if !(fwhm > 0.0 && fwhm.is_finite()) {
            return Err(LimitError::InvalidInput(format!(
                "FWHM must be positive, got {fwhm}"
            )));
        }
        Ok(Self {
            fwhm,
            config: config.validated()?,
            measurement: None,
            background: None,
            psf: None,
            source_model: None,
            observers: Vec::new(),
        })
    }

    pub fn with_measurement(mut self, measurement: impl RecoveryMeasurement + 'a) -> Self {
        self.measurement = Some(Box::new(measurement));
        self
    }

    pub fn with_background(mut self, background: impl BackgroundModel + 'a) -> Self {
        self.background = Some(Box::new(background));
        self
    }

    pub fn with_psf(mut self, psf: impl PsfEvaluator + 'static) -> Self {
        self.psf = Some(Box::new(psf));
        self
    }

    /// Use `model` as is, bypassing PSF and profile selection.
    pub fn with_source_model(mut self, model: SourceModel) -> Self {
        self.source_model = Some(model);
        self
    }

    pub fn with_observer(mut self, observer: &'a mut dyn SearchObserver) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn config(&self) -> &InjectionConfig {
        &self.config
    }

    pub fn fwhm(&self) -> f64 {
        self.fwhm
    }

    fn take_source_model(&mut self) -> Result<SourceModel> {
        if let Some(model) = self.source_model.take() {
            return Ok(model);
        }
        let config = &self.config;
        match SourceModel::select(
            self.psf.take(),
            config.profile.as_ref(),
            config.use_moffat_profile,
            config.exposure_time,
        ) {
            Ok(model) => Ok(model),
            Err(ModelError::Unavailable) => {
                log::warn!(
                    "no PSF or profile parameters, injecting Gaussians with FWHM {:.2}",
                    self.fwhm
                );
                Ok(SourceModel::gaussian_from_fwhm(
                    self.fwhm,
                    config.exposure_time,
                )?)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Run the search on `image`, which is left untouched.
    pub fn run(&mut self, image: &ArrayView2<f64>) -> Result<SearchOutcome> {
        let started = Instant::now();
        let (height, width) = image.dim();
        if height == 0 || width == 0 {
            return Err(LimitError::InvalidInput("image is empty".to_string()));
        }

        let model = self.take_source_model()?;
        let config = self.config.clone();
        let fwhm = self.fwhm;

        let fit = match &self.background {
            Some(background) => background.remove(image)?,
            None => config.background.build().remove(image)?,
        };
        if fit.noise <= 0.0 {
            log::warn!("background noise is {:.3e}, beta thresholds degenerate", fit.noise);
        }

        let default_measurement = ApertureRecovery::from_config(&config, fwhm);
        let measurement: &dyn RecoveryMeasurement = match &self.measurement {
            Some(m) => m.as_ref(),
            None => &default_measurement,
        };
        let criterion = DetectionCriterion::new(&config, fwhm);

        let mut rng = StdRng::seed_from_u64(config.rng_seed.unwrap_or_else(|| rand::rng().random()));

        let ring = ring_positions(
            config.source_location_fwhm * fwhm,
            (height, width),
            config.source_count,
        );
        let sites = jittered_duplicates(
            &ring,
            config.jitter_count,
            jitter_half_width(config.jitter_offset_fwhm, fwhm),
            &mut rng,
        );

        let residual_view = fit.residual.view();
        let thresholds: Vec<SiteThreshold> = sites
            .iter()
            .enumerate()
            .map(|(i, site)| match measure_one(measurement, &residual_view, site) {
                Ok(m) => criterion.threshold_for(i, &m),
                Err(e) => {
                    log::warn!("site {i} at ({:.1}, {:.1}) unmeasurable: {e}", site.x, site.y);
                    SiteThreshold::unmeasured(i)
                }
            })
            .collect();
        let active_sites: Vec<usize> = thresholds
            .iter()
            .filter(|t| criterion.is_suitable(t))
            .map(|t| t.site)
            .collect();

        log::info!(
            "{} of {} sites usable, {:?} criterion, source model {:?}",
            active_sites.len(),
            sites.len(),
            criterion.mode(),
            model
        );

        if active_sites.is_empty() {
            log::warn!("every injection site already holds a source");
            for observer in self.observers.iter_mut() {
                observer.on_finish(&SearchStatus::NoSuitableSite, NO_SUITABLE_SITE);
            }
            return Ok(SearchOutcome {
                status: SearchStatus::NoSuitableSite,
                magnitude: NO_SUITABLE_SITE,
                mode: criterion.mode(),
                table: RecoveryTable::new(),
                steps: Vec::new(),
                sites,
                thresholds,
                active_sites,
            });
        }

        let tasks: Vec<(usize, usize)> = active_sites
            .iter()
            .flat_map(|&site| (0..config.repeats()).map(move |repeat| (site, repeat)))
            .collect();
        let context = StepContext {
            model: &model,
            measurement,
            criterion: &criterion,
            residual: &fit.residual,
            sites: &sites,
            thresholds: &thresholds,
            tasks: &tasks,
            zeropoint: config.zeropoint,
            gain: config.gain,
            poisson_noise: config.add_poisson_noise,
        };

        let time_limit = config.time_limit_secs.map(Duration::from_secs_f64);
        let mut state = SearchState::new(config.instrumental_start(), StepPolicy::from_config(&config));
        let mut table = RecoveryTable::new();
        let mut steps: Vec<StepSummary> = Vec::new();
        let mut consecutive_failures = 0;

        let status = loop {
            if let Some(status) = state.status() {
                break status;
            }
            if steps.len() >= config.max_total_iterations {
                log::warn!("stopping after {} steps", steps.len());
                state.fail(FailureReason::IterationLimit);
                continue;
            }
            if time_limit.is_some_and(|limit| started.elapsed() > limit) {
                log::warn!("stopping after {:.1}s", started.elapsed().as_secs_f64());
                state.fail(FailureReason::TimeLimit);
                continue;
            }

            let step = steps.len();
            let magnitude = state.current_magnitude();
            let seed: u64 = rng.random();

            let (rows, outcome) = match context.measure_step(magnitude, seed) {
                Ok(measured) => {
                    consecutive_failures = 0;
                    let rows = context.rows(step, magnitude, &measured);
                    let detections: Vec<bool> = rows.iter().map(|r| r.detected).collect();
                    (rows, Some(criterion.recovered(&detections)))
                }
                Err(e) => {
                    consecutive_failures += 1;
                    log::error!(
                        "measurement failed at magnitude {:.3} (attempt {consecutive_failures}): {e}",
                        magnitude + config.zeropoint
                    );
                    let missing = vec![Measurement::missing(); tasks.len()];
                    (context.rows(step, magnitude, &missing), None)
                }
            };

            let summary = StepSummary {
                step,
                magnitude: magnitude + config.zeropoint,
                detected: rows.iter().filter(|r| r.detected).count(),
                total: rows.len(),
                fraction: outcome.map_or(f64::NAN, |(fraction, _)| fraction),
                recovered: outcome.map(|(_, recovered)| recovered),
            };
            for observer in self.observers.iter_mut() {
                observer.on_step(&summary, &rows);
            }
            table.extend(rows);
            steps.push(summary);

            match summary.recovered {
                Some(recovered) => {
                    let before = state.phase;
                    log::debug!(
                        "step {step}: magnitude {:.3} recovered {:.2} ({recovered})",
                        summary.magnitude,
                        summary.fraction
                    );
                    let after = state.advance(recovered);
                    if after != before {
                        log::info!("{before:?} -> {after:?} at magnitude {:.3}", summary.magnitude);
                    }
                }
                None if consecutive_failures > config.retry_limit => {
                    state.fail(FailureReason::MeasurementFailure);
                }
                None => {}
            }
        };

        let magnitude = match (status, state.candidate) {
            (SearchStatus::Converged, Some(candidate)) => candidate + config.zeropoint,
            _ => f64::NAN,
        };
        log::info!(
            "search {status} after {} steps: magnitude {magnitude:.3}",
            steps.len()
        );
        for observer in self.observers.iter_mut() {
            observer.on_finish(&status, magnitude);
        }

        Ok(SearchOutcome {
            status,
            magnitude,
            mode: criterion.mode(),
            table,
            steps,
            sites,
            thresholds,
            active_sites,
        })
    }
}

/// Limiting magnitude of `image`, NaN if the search fails.
///
/// `exposure_time` overrides the configured value. Returns
/// [`NO_SUITABLE_SITE`] when every candidate site already holds a source.
pub fn find_limiting_magnitude(
    image: &ArrayView2<f64>,
    fwhm: f64,
    exposure_time: f64,
    config: &InjectionConfig,
) -> f64 {
    let config = InjectionConfig {
        exposure_time,
        ..config.clone()
    };
    match LimitingMagnitudeSearch::new(fwhm, config).and_then(|mut search| search.run(image)) {
        Ok(outcome) => outcome.magnitude,
        Err(e) => {
            log::error!("limiting magnitude search failed: {e}");
            f64::NAN
        }
    }
}
