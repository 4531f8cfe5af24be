//! Noise generation for synthetic fields and injected sources.
//!
//! Two primitives are provided:
//! - seeded Gaussian fields, used to build synthetic backgrounds and test data
//! - Poisson photon noise applied to a mean-count image, used to give injected
//!   sources realistic shot noise
//!
//! Both run through [`process_array_in_parallel_chunks`] or a single seeded
//! RNG, so results are reproducible for a fixed seed.

use crate::algo::process_array_in_parallel_chunks;
use ndarray::Array2;
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use rand_distr::{Distribution, Normal, NormalError, Poisson};

/// Means above this are sampled with a Normal approximation to the Poisson.
const POISSON_NORMAL_CROSSOVER: f64 = 20.0;

/// Generate a 2D array of normally distributed values.
///
/// Deterministic for a given seed, which makes it the standard way to build
/// synthetic sky backgrounds in tests and demos.
///
/// # Arguments
/// * `size` - (height, width) of the output
/// * `mean` - Mean of the distribution
/// * `std_dev` - Standard deviation of the distribution
/// * `seed` - Random seed
///
/// # Example
/// ```
/// use shared::image_proc::noise::simple_normal_array;
///
/// let noise = simple_normal_array((10, 10), 100.0, 10.0, 42).unwrap();
/// assert_eq!(noise.dim(), (10, 10));
/// ```
pub fn simple_normal_array(
    size: (usize, usize),
    mean: f64,
    std_dev: f64,
    seed: u64,
) -> Result<Array2<f64>, NormalError> {
    let mut rng = StdRng::seed_from_u64(seed);
    let normal_dist = Normal::new(mean, std_dev)?;
    Ok(Array2::from_shape_fn(size, |_| normal_dist.sample(&mut rng)))
}

/// Apply Poisson arrival statistics to a mean-count image.
///
/// Every pixel is treated as the mean of a Poisson distribution. Negative and
/// NaN pixels are clamped to zero first, since a model stamp can carry small
/// negative residual-table values in its wings.
///
/// # Arguments
/// * `mean_image` - Expected counts per pixel
/// * `rng_seed` - Optional seed; a fresh one is drawn when `None`
pub fn apply_poisson_photon_noise(mean_image: &Array2<f64>, rng_seed: Option<u64>) -> Array2<f64> {
    let seed = rng_seed.unwrap_or_else(|| rand::rng().next_u64());

    process_array_in_parallel_chunks(mean_image.clone(), seed, Some(64), |chunk, rng| {
        chunk.iter_mut().for_each(|pixel| {
            let mean = if pixel.is_finite() { pixel.max(0.0) } else { 0.0 };
            *pixel = if mean <= 0.0 {
                0.0
            } else if mean < POISSON_NORMAL_CROSSOVER {
                match Poisson::new(mean) {
                    Ok(poisson) => poisson.sample(rng),
                    Err(_) => 0.0,
                }
            } else {
                match Normal::new(mean, mean.sqrt()) {
                    Ok(normal) => normal.sample(rng).max(0.0),
                    Err(_) => mean,
                }
            };
        });
    })
}
