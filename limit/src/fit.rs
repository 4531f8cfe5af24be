//! One-dimensional Gaussian fitting by Levenberg-Marquardt.
//!
//! Fits `y = A exp(-(x - mu)^2 / (2 sigma^2))` to sampled points, used to
//! characterise the distribution of random aperture sums.

use nalgebra::{Matrix3, Vector3};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum FitError {
    #[error("need at least 3 points to fit, got {0}")]
    InsufficientData(usize),

    #[error("x and y lengths differ ({x} vs {y})")]
    LengthMismatch { x: usize, y: usize },

    #[error("normal equations are singular")]
    Singular,

    #[error("no convergence after {0} iterations")]
    NonConvergence(usize),

    #[error("fit produced invalid parameters: {0}")]
    InvalidResult(String),
}

/// Optimizer settings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LmConfig {
    pub max_iterations: usize,
    /// Relative parameter change below which the fit has converged
    pub tolerance: f64,
    pub initial_lambda: f64,
    pub lambda_up: f64,
    pub lambda_down: f64,
}

impl Default for LmConfig {
    fn default() -> Self {
        Self {
            max_iterations: 200,
            tolerance: 1e-10,
            initial_lambda: 1e-3,
            lambda_up: 10.0,
            lambda_down: 0.1,
        }
    }
}

/// Damping beyond which no downhill step exists and the fit has stalled at a minimum.
const LAMBDA_CEILING: f64 = 1e12;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GaussianFit {
    pub amplitude: f64,
    pub mean: f64,
    pub sigma: f64,
    pub chi2: f64,
    pub iterations: usize,
}

impl GaussianFit {
    pub fn evaluate(&self, x: f64) -> f64 {
        gaussian(x, &Vector3::new(self.amplitude, self.mean, self.sigma))
    }
}

fn gaussian(x: f64, p: &Vector3<f64>) -> f64 {
    let d = x - p[1];
    p[0] * (-d * d / (2.0 * p[2] * p[2])).exp()
}

fn jacobian_row(x: f64, p: &Vector3<f64>) -> Vector3<f64> {
    let (a, mu, sigma) = (p[0], p[1], p[2]);
    let d = x - mu;
    let e = (-d * d / (2.0 * sigma * sigma)).exp();
    Vector3::new(
        e,
        a * e * d / (sigma * sigma),
        a * e * d * d / (sigma * sigma * sigma),
    )
}

fn chi2(x: &[f64], y: &[f64], p: &Vector3<f64>) -> f64 {
    x.iter()
        .zip(y)
        .map(|(&xi, &yi)| (yi - gaussian(xi, p)).powi(2))
        .sum()
}

/// Fit a Gaussian starting from `(amplitude, mean, sigma)`.
pub fn fit_gaussian(
    x: &[f64],
    y: &[f64],
    initial: (f64, f64, f64),
    config: &LmConfig,
) -> Result<GaussianFit, FitError> {
    if x.len() != y.len() {
        return Err(FitError::LengthMismatch {
            x: x.len(),
            y: y.len(),
        });
    }
    if x.len() < 3 {
        return Err(FitError::InsufficientData(x.len()));
    }

    let mut params = Vector3::new(initial.0, initial.1, initial.2);
    let mut current = chi2(x, y, &params);
    let mut lambda = config.initial_lambda;
    let mut converged = false;
    let mut iterations = 0;

    while iterations < config.max_iterations {
        iterations += 1;

        let mut jtj = Matrix3::zeros();
        let mut jtr = Vector3::zeros();
        for (&xi, &yi) in x.iter().zip(y) {
            let row = jacobian_row(xi, &params);
            jtj += row * row.transpose();
            jtr += row * (yi - gaussian(xi, &params));
        }

        let mut step = None;
        while lambda < LAMBDA_CEILING {
            let mut damped = jtj;
            for i in 0..3 {
                damped[(i, i)] += lambda * jtj[(i, i)].max(f64::EPSILON);
            }
            let Some(delta) = damped.lu().solve(&jtr) else {
                lambda *= config.lambda_up;
                continue;
            };

            let mut trial = params + delta;
            trial[2] = trial[2].abs();
            let trial_chi2 = chi2(x, y, &trial);
            if trial_chi2.is_finite() && trial_chi2 <= current {
                step = Some((trial, trial_chi2, delta));
                lambda *= config.lambda_down;
                break;
            }
            lambda *= config.lambda_up;
        }

        let Some((trial, trial_chi2, delta)) = step else {
            // No downhill direction left.
            converged = true;
            break;
        };

        params = trial;
        current = trial_chi2;
        let relative = (0..3)
            .map(|i| delta[i].abs() / (params[i].abs() + f64::EPSILON))
            .fold(0.0, f64::max);
        if relative < config.tolerance {
            converged = true;
            break;
        }
    }

    if !converged {
        return Err(FitError::NonConvergence(iterations));
    }
    if !params.iter().all(|v| v.is_finite()) || params[2] <= 0.0 {
        return Err(FitError::InvalidResult(format!(
            "amplitude {} mean {} sigma {}",
            params[0], params[1], params[2]
        )));
    }

    Ok(GaussianFit {
        amplitude: params[0],
        mean: params[1],
        sigma: params[2],
        chi2: current,
        iterations,
    })
}
