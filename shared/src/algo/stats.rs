//! Robust statistics for background and noise estimation

use scilib::math::basic::erf;
use std::f64::consts::{PI, SQRT_2};
use thiserror::Error;

/// Scale factor converting a median absolute deviation to a Gaussian sigma.
pub const MAD_TO_SIGMA: f64 = 1.4826;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum StatsError {
    #[error("insufficient data: {total} values, {valid} finite")]
    InsufficientData { total: usize, valid: usize },
}

/// Cumulative distribution function for the standard normal distribution
pub fn normal_cdf(x: f64) -> f64 {
    0.5 * (1.0 + erf(x / SQRT_2))
}

/// Inverse error function.
///
/// Starts from Winitzki's closed-form approximation and polishes it with
/// Newton iterations on `erf`, which brings the result to the precision of
/// `erf` itself over the open interval (-1, 1). Returns `±inf` at `±1` and NaN
/// outside [-1, 1].
pub fn erfinv(y: f64) -> f64 {
    if y.is_nan() || y.abs() > 1.0 {
        return f64::NAN;
    }
    if y == 1.0 {
        return f64::INFINITY;
    }
    if y == -1.0 {
        return f64::NEG_INFINITY;
    }
    if y == 0.0 {
        return 0.0;
    }

    const A: f64 = 0.147;
    let ln = (1.0 - y * y).ln();
    let t = 2.0 / (PI * A) + ln / 2.0;
    let mut x = y.signum() * ((t * t - ln / A).sqrt() - t).sqrt();

    let two_over_sqrt_pi = 2.0 / PI.sqrt();
    for _ in 0..4 {
        let slope = two_over_sqrt_pi * (-x * x).exp();
        if slope == 0.0 {
            break;
        }
        x -= (erf(x) - y) / slope;
    }
    x
}

/// Median of the finite values in a slice.
///
/// NaN and infinite values are ignored. For even lengths the mean of the two
/// middle values is returned.
pub fn median(values: &[f64]) -> Result<f64, StatsError> {
    let mut valid: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
    if valid.is_empty() {
        return Err(StatsError::InsufficientData {
            total: values.len(),
            valid: 0,
        });
    }
    valid.sort_by(f64::total_cmp);

    let mid = valid.len() / 2;
    if valid.len() % 2 == 0 {
        Ok((valid[mid - 1] + valid[mid]) / 2.0)
    } else {
        Ok(valid[mid])
    }
}

/// Gaussian-equivalent sigma from the median absolute deviation about `center`.
pub fn mad_sigma(values: &[f64], center: f64) -> Result<f64, StatsError> {
    let deviations: Vec<f64> = values.iter().map(|v| (v - center).abs()).collect();
    Ok(MAD_TO_SIGMA * median(&deviations)?)
}

/// Summary returned by [`sigma_clipped_stats`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClippedStats {
    pub mean: f64,
    pub median: f64,
    pub std: f64,
    /// Values that survived clipping
    pub retained: usize,
}

/// Iteratively sigma-clipped mean, median and standard deviation.
///
/// Values further than `sigma` standard deviations from the median are
/// rejected until nothing changes or `max_iters` passes have run.
pub fn sigma_clipped_stats(
    values: &[f64],
    sigma: f64,
    max_iters: usize,
) -> Result<ClippedStats, StatsError> {
    let mut kept: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
    if kept.len() < 2 {
        return Err(StatsError::InsufficientData {
            total: values.len(),
            valid: kept.len(),
        });
    }

    for _ in 0..max_iters {
        let center = median(&kept)?;
        let std = population_std(&kept);
        if std == 0.0 {
            break;
        }
        let before = kept.len();
        kept.retain(|v| (v - center).abs() <= sigma * std);
        if kept.len() == before || kept.len() < 2 {
            break;
        }
    }

    let mean = kept.iter().sum::<f64>() / kept.len() as f64;
    Ok(ClippedStats {
        mean,
        median: median(&kept)?,
        std: population_std(&kept),
        retained: kept.len(),
    })
}

/// Population standard deviation (divides by N).
pub fn population_std(values: &[f64]) -> f64 {
    if values.is_empty() {
        return f64::NAN;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    (values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::{assert_abs_diff_eq, assert_relative_eq};

    #[test]
    fn test_normal_cdf_known_points() {
        assert_abs_diff_eq!(normal_cdf(0.0), 0.5, epsilon = 1e-9);
        assert_abs_diff_eq!(normal_cdf(1.0), 0.841_344_746, epsilon = 1e-6);
        assert_abs_diff_eq!(normal_cdf(-1.96), 0.024_997_895, epsilon = 1e-6);
    }

    #[test]
    fn test_erfinv_inverts_erf() {
        for &x in &[-2.0, -1.0, -0.3, 0.01, 0.5, 1.2, 2.0] {
            assert_abs_diff_eq!(erfinv(erf(x)), x, epsilon = 1e-6);
        }
    }

    #[test]
    fn test_erfinv_known_value() {
        // erfinv(0.5) = 0.4769362762044699
        assert_abs_diff_eq!(erfinv(0.5), 0.476_936_276_204_469_9, epsilon = 1e-6);
        assert_abs_diff_eq!(erfinv(-0.5), -0.476_936_276_204_469_9, epsilon = 1e-6);
    }

    #[test]
    fn test_erfinv_edges() {
        assert_eq!(erfinv(0.0), 0.0);
        assert_eq!(erfinv(1.0), f64::INFINITY);
        assert_eq!(erfinv(-1.0), f64::NEG_INFINITY);
        assert!(erfinv(1.5).is_nan());
    }

    #[test]
    fn test_median_skips_nan() {
        assert_eq!(median(&[3.0, f64::NAN, 1.0, 2.0]), Ok(2.0));
        assert_eq!(median(&[4.0, 1.0, 3.0, 2.0]), Ok(2.5));
        assert!(median(&[f64::NAN]).is_err());
    }

    #[test]
    fn test_mad_sigma_of_constant_is_zero() {
        assert_eq!(mad_sigma(&[5.0; 10], 5.0), Ok(0.0));
    }

    #[test]
    fn test_sigma_clip_rejects_outlier() {
        let mut values: Vec<f64> = (0..100).map(|i| (i % 10) as f64).collect();
        values.push(1.0e6);
        let stats = sigma_clipped_stats(&values, 3.0, 5).unwrap();
        assert_eq!(stats.retained, 100);
        assert_relative_eq!(stats.mean, 4.5, epsilon = 1e-12);
    }
}
