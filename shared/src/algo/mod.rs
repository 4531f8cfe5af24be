//! Algorithms shared across the workspace
//!
//! Parallel array processing with deterministic seeding and the robust
//! statistics used by background and noise estimation.

pub mod parallel;
pub mod stats;

pub use parallel::{derived_seed, process_array_in_parallel_chunks, seeded_par_map};
pub use stats::{
    erfinv, mad_sigma, median, normal_cdf, population_std, sigma_clipped_stats, ClippedStats,
    StatsError,
};
