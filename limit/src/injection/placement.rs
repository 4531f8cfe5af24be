//! Placement of synthetic sources.
//!
//! Injection sites sit on a ring around the image centre (the target), each
//! optionally followed by a few randomly jittered duplicates. Minimum-distance
//! random placement is also provided for laying out illustrative fields.

use rand::seq::index;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use thiserror::Error;

/// Jitter offset meaning "move by up to a quarter pixel in each axis".
pub const SUBPIXEL_JITTER: f64 = -1.0;

/// Half-width in pixels of the subpixel jitter box.
const SUBPIXEL_HALF_WIDTH: f64 = 0.25;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PlacementError {
    #[error("range [{lo}, {hi}) cannot hold {k} values at least {min_distance} apart")]
    RangeTooSmall {
        lo: i64,
        hi: i64,
        k: usize,
        min_distance: i64,
    },

    #[error("minimum distance must be at least 1, got {0}")]
    InvalidDistance(i64),
}

/// Pixel position of one synthetic source, `x` along columns and `y` along rows.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct InjectionSite {
    pub x: f64,
    pub y: f64,
}

impl InjectionSite {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub fn distance_to(&self, other: &InjectionSite) -> f64 {
        ((self.x - other.x).powi(2) + (self.y - other.y).powi(2)).sqrt()
    }
}

/// Centre of an image of shape `(height, width)` as an injection site.
pub fn image_center(shape: (usize, usize)) -> InjectionSite {
    InjectionSite::new(shape.1 as f64 / 2.0, shape.0 as f64 / 2.0)
}

/// `n` points evenly spaced in angle at `radius` around the image centre.
///
/// Point `i` sits at angle `2 pi i / n` measured from the +x axis.
pub fn ring_positions(radius: f64, shape: (usize, usize), n: usize) -> Vec<InjectionSite> {
    let center = image_center(shape);
    (0..n)
        .map(|i| {
            let angle = 2.0 * PI * i as f64 / n as f64;
            InjectionSite::new(
                angle.cos() * radius + center.x,
                angle.sin() * radius + center.y,
            )
        })
        .collect()
}

/// Jitter half-width in pixels for an offset given in units of FWHM/2.
///
/// [`SUBPIXEL_JITTER`] selects subpixel jitter. Any other non-positive value
/// is a configuration mistake and is treated the same way with a warning.
pub fn jitter_half_width(offset_fwhm: f64, fwhm: f64) -> f64 {
    if offset_fwhm == SUBPIXEL_JITTER {
        SUBPIXEL_HALF_WIDTH
    } else if offset_fwhm <= 0.0 || !offset_fwhm.is_finite() {
        log::warn!("jitter offset {offset_fwhm} is not positive, using subpixel jitter");
        SUBPIXEL_HALF_WIDTH
    } else {
        offset_fwhm * fwhm / 2.0
    }
}

/// Base sites followed by `count_per_site` jittered copies of each.
///
/// Copies are displaced by independent uniform offsets in
/// `[-half_width, +half_width]` on both axes. The base sites keep their
/// indices; copies of base site `k` follow all base sites in order of `k`.
pub fn jittered_duplicates<R: Rng>(
    base: &[InjectionSite],
    count_per_site: usize,
    half_width: f64,
    rng: &mut R,
) -> Vec<InjectionSite> {
    let half_width = if half_width == SUBPIXEL_JITTER {
        SUBPIXEL_HALF_WIDTH
    } else {
        half_width.abs()
    };

    let mut sites = base.to_vec();
    for site in base {
        for _ in 0..count_per_site {
            let dx = half_width * rng.random_range(-1.0..=1.0);
            let dy = half_width * rng.random_range(-1.0..=1.0);
            sites.push(InjectionSite::new(site.x + dx, site.y + dy));
        }
    }
    sites
}

/// Rank of each value within `sample`, 0 for the smallest.
pub fn ranks(sample: &[i64]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..sample.len()).collect();
    order.sort_by_key(|&i| sample[i]);

    let mut ranks = vec![0; sample.len()];
    for (rank, idx) in order.into_iter().enumerate() {
        ranks[idx] = rank;
    }
    ranks
}

/// `k` integers in `[lo, hi)` whose sorted neighbours are at least `min_distance` apart.
///
/// Samples `k` distinct values from the range compressed by
/// `(k - 1)(min_distance - 1)` and spreads them back out by rank.
fn sample_axis<R: Rng>(
    lo: i64,
    hi: i64,
    k: usize,
    min_distance: i64,
    rng: &mut R,
) -> Result<Vec<i64>, PlacementError> {
    let span = hi - lo - (k as i64 - 1).max(0) * (min_distance - 1);
    if k == 0 {
        return Ok(Vec::new());
    }
    if span < k as i64 {
        return Err(PlacementError::RangeTooSmall {
            lo,
            hi,
            k,
            min_distance,
        });
    }

    let sample: Vec<i64> = index::sample(rng, span as usize, k)
        .into_iter()
        .map(|i| lo + i as i64)
        .collect();
    let ranks = ranks(&sample);

    Ok(sample
        .iter()
        .zip(ranks)
        .map(|(&v, rank)| v + (min_distance - 1) * rank as i64)
        .collect())
}

/// `k` random sites in `[range.0, range.1)` on both axes.
///
/// The x coordinates are pairwise at least `min_distance` apart, as are the y
/// coordinates, so no two sites share a row or column band.
pub fn minimum_distance_sample<R: Rng>(
    range: (i64, i64),
    k: usize,
    min_distance: i64,
    rng: &mut R,
) -> Result<Vec<InjectionSite>, PlacementError> {
    if min_distance < 1 {
        return Err(PlacementError::InvalidDistance(min_distance));
    }
    let xs = sample_axis(range.0, range.1, k, min_distance, rng)?;
    let ys = sample_axis(range.0, range.1, k, min_distance, rng)?;

    Ok(xs
        .into_iter()
        .zip(ys)
        .map(|(x, y)| InjectionSite::new(x as f64, y as f64))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn test_ring_points_at_radius() {
        for n in 1..=16 {
            for &shape in &[(64, 64), (101, 57), (30, 200)] {
                let center = image_center(shape);
                for site in ring_positions(9.5, shape, n) {
                    assert_relative_eq!(site.distance_to(&center), 9.5, epsilon = 1e-9);
                }
            }
        }
    }

    #[test]
    fn test_ring_angular_spacing() {
        let shape = (80, 80);
        let center = image_center(shape);
        let n = 7;
        let sites = ring_positions(12.0, shape, n);
        for (i, site) in sites.iter().enumerate() {
            let angle = (site.y - center.y).atan2(site.x - center.x).rem_euclid(2.0 * PI);
            let expected = 2.0 * PI * i as f64 / n as f64;
            assert_relative_eq!(angle, expected, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_jitter_count_and_bounds() {
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let base = ring_positions(10.0, (50, 50), 4);
        let sites = jittered_duplicates(&base, 3, 2.0, &mut rng);

        assert_eq!(sites.len(), 16);
        assert_eq!(&sites[..4], &base[..]);
        for (k, b) in base.iter().enumerate() {
            for copy in &sites[4 + 3 * k..4 + 3 * (k + 1)] {
                assert!((copy.x - b.x).abs() <= 2.0);
                assert!((copy.y - b.y).abs() <= 2.0);
            }
        }
    }

    #[test]
    fn test_subpixel_sentinel() {
        assert_eq!(jitter_half_width(SUBPIXEL_JITTER, 6.0), 0.25);
        assert_eq!(jitter_half_width(-3.0, 6.0), 0.25);
        assert_eq!(jitter_half_width(1.0, 6.0), 3.0);

        let mut rng = ChaCha8Rng::seed_from_u64(8);
        let base = [InjectionSite::new(10.0, 10.0)];
        let copies = jittered_duplicates(&base, 20, SUBPIXEL_JITTER, &mut rng);
        for copy in &copies[1..] {
            assert!((copy.x - 10.0).abs() <= 0.25 && (copy.y - 10.0).abs() <= 0.25);
        }
        assert!(copies[1..].iter().any(|c| c.x != 10.0 || c.y != 10.0));
    }

    #[test]
    fn test_ranks() {
        assert_eq!(ranks(&[30, 10, 20]), vec![2, 0, 1]);
        assert!(ranks(&[]).is_empty());
    }

    #[test]
    fn test_minimum_distance_guarantee() {
        for seed in 0..200 {
            let mut rng = ChaCha8Rng::seed_from_u64(seed);
            let sites = minimum_distance_sample((0, 40), 4, 10, &mut rng).unwrap();
            assert_eq!(sites.len(), 4);
            for axis in [|s: &InjectionSite| s.x, |s: &InjectionSite| s.y] {
                let mut values: Vec<f64> = sites.iter().map(axis).collect();
                values.sort_by(f64::total_cmp);
                assert!(values[0] >= 0.0 && values[3] < 40.0);
                for pair in values.windows(2) {
                    assert!(pair[1] - pair[0] >= 10.0, "seed {seed}: {values:?}");
                }
            }
        }
    }

    #[test]
    fn test_minimum_distance_range_too_small() {
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let result = minimum_distance_sample((0, 20), 4, 10, &mut rng);
        assert!(matches!(result, Err(PlacementError::RangeTooSmall { .. })));
        assert!(matches!(
            minimum_distance_sample((0, 20), 2, 0, &mut rng),
            Err(PlacementError::InvalidDistance(0))
        ));
    }
}
