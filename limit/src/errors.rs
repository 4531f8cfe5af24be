//! Crate-level error type.

use shared::image_proc::BackgroundError;
use thiserror::Error;

use crate::config::ConfigError;
use crate::fit::FitError;
use crate::injection::measurement::MeasurementError;
use crate::injection::placement::PlacementError;
use crate::injection::source_model::ModelError;

#[derive(Error, Debug)]
pub enum LimitError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("source model error: {0}")]
    Model(#[from] ModelError),

    #[error("measurement failed: {0}")]
    Measurement(#[from] MeasurementError),

    #[error("placement failed: {0}")]
    Placement(#[from] PlacementError),

    #[error("background removal failed: {0}")]
    Background(#[from] BackgroundError),

    #[error("fit failed: {0}")]
    Fit(#[from] FitError),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, LimitError>;
