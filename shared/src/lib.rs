//! Shared numerical and image-processing components.
//!
//! This crate contains the building blocks used by the limiting magnitude
//! tooling that are not specific to source injection: deterministic parallel
//! array processing, robust statistics, noise generation, aperture pixel
//! collection, background removal and threshold masks.

pub mod algo;
pub mod image_proc;
