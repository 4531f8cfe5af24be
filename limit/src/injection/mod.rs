//! Artificial source injection and recovery.

pub mod criterion;
pub mod measurement;
pub mod placement;
pub mod profile;
pub mod record;
pub mod search;
pub mod source_model;

pub use criterion::{DetectionCriterion, DetectionMode, SiteThreshold};
pub use measurement::{ApertureRecovery, Measurement, MeasurementError, RecoveryMeasurement};
pub use placement::{
    image_center, jitter_half_width, jittered_duplicates, minimum_distance_sample, ring_positions,
    InjectionSite, PlacementError, SUBPIXEL_JITTER,
};
pub use profile::AnalyticProfile;
pub use record::{CsvRecorder, RecoveryRow, RecoveryTable, SearchObserver, StepSummary};
pub use search::{
    find_limiting_magnitude, FailureReason, LimitingMagnitudeSearch, SearchOutcome, SearchPhase,
    SearchState, SearchStatus, StepPolicy, NO_SUITABLE_SITE,
};
pub use source_model::{ModelError, PsfEvaluator, ResidualPsf, SourceModel, Stamp};
