//! Limiting magnitude estimation by artificial source injection and recovery.
//!
//! The main entry point is [`LimitingMagnitudeSearch`]: it places synthetic
//! point sources of a known magnitude on a ring around the image centre,
//! measures them, and walks the magnitude coarse-then-fine until the faintest
//! level at which enough of them are still detected is pinned down.
//!
//! [`estimate_single_sample_limit`] is a quick non-iterative alternative based
//! on the spread of random aperture sums.
//!
//! # Example
//! ```no_run
//! use limit::{find_limiting_magnitude, InjectionConfig};
//! use shared::image_proc::simple_normal_array;
//!
//! let image = simple_normal_array((101, 101), 100.0, 5.0, 3).unwrap();
//! let config = InjectionConfig {
//!     zeropoint: 25.0,
//!     ..Default::default()
//! };
//! let magnitude = find_limiting_magnitude(&image.view(), 4.0, 1.0, &config);
//! println!("limiting magnitude {magnitude:.2}");
//! ```

pub mod config;
pub mod errors;
pub mod fit;
pub mod injection;
pub mod photometry;
pub mod plot;
pub mod probable;
pub mod shared_args;

pub use config::{ConfigError, InjectionConfig, ProfileParameters};
pub use errors::{LimitError, Result};
pub use injection::{
    find_limiting_magnitude, LimitingMagnitudeSearch, SearchOutcome, SearchStatus,
    NO_SUITABLE_SITE,
};
pub use probable::{estimate_single_sample, estimate_single_sample_limit, SingleSampleEstimate};
