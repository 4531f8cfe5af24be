//! Test infrastructure shared across the workspace.
//!
//! Locates the workspace root so tests can write inspectable artifacts
//! (recovery tables, convergence plots) to `<root>/test_output/`, and builds
//! small synthetic images with exactly known content.
//!
//! ```rust
//! use test_helpers::{add_gaussian_star, output_path};
//! use ndarray::Array2;
//!
//! let mut image = Array2::zeros((32, 32));
//! add_gaussian_star(&mut image, 16.0, 16.0, 50.0, 1.5);
//! assert_eq!(image[[16, 16]], 50.0);
//!
//! let csv = output_path("recovery_example.csv");
//! assert!(csv.ends_with("test_output/recovery_example.csv"));
//! ```

use ndarray::Array2;
use once_cell::sync::Lazy;
use std::env;
use std::path::{Path, PathBuf};

#[derive(thiserror::Error, Debug)]
pub enum TestHelperError {
    /// No ancestor of the working directory holds a workspace Cargo.toml.
    #[error("Failed to find project root: {0}")]
    ProjectRootNotFound(String),
}

/// Walk up from the current directory to the Cargo.toml declaring `[workspace]`.
pub fn find_project_root() -> Result<PathBuf, TestHelperError> {
    let mut current_dir = env::current_dir().map_err(|e| {
        TestHelperError::ProjectRootNotFound(format!("Failed to get current directory: {e}"))
    })?;

    loop {
        let cargo_toml = current_dir.join("Cargo.toml");
        if cargo_toml.exists() {
            let content = std::fs::read_to_string(&cargo_toml).map_err(|e| {
                TestHelperError::ProjectRootNotFound(format!("Failed to read Cargo.toml: {e}"))
            })?;

            if content.contains("[workspace]") {
                return Ok(current_dir);
            }
        }

        if !current_dir.pop() {
            break;
        }
    }

    Err(TestHelperError::ProjectRootNotFound(
        "Workspace root not found".to_string(),
    ))
}

static PROJECT_ROOT: Lazy<PathBuf> =
    Lazy::new(|| find_project_root().expect("Failed to find project root directory"));

/// `<project_root>/test_output`, created on first use.
pub fn get_output_dir() -> PathBuf {
    let output_dir = PROJECT_ROOT.join("test_output");

    if !output_dir.exists() {
        std::fs::create_dir_all(&output_dir).expect("Failed to create output directory");
    }

    output_dir
}

/// Path of a test artifact inside [`get_output_dir`].
pub fn output_path<P: AsRef<Path>>(path: P) -> PathBuf {
    get_output_dir().join(path)
}

/// Add a circular Gaussian of peak `peak` centred on pixel coordinates `(x, y)`.
///
/// Pixel `[row, col]` has its centre at `(col, row)`. Every pixel is written,
/// so the result is exact regardless of how far the wings reach.
pub fn add_gaussian_star(image: &mut Array2<f64>, x: f64, y: f64, peak: f64, sigma: f64) {
    let two_sigma_sq = 2.0 * sigma * sigma;
    for ((row, col), value) in image.indexed_iter_mut() {
        let dx = col as f64 - x;
        let dy = row as f64 - y;
        *value += peak * (-(dx * dx + dy * dy) / two_sigma_sq).exp();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_project_root_exists() {
        let root = find_project_root().expect("Failed to find project root");
        assert!(root.join("Cargo.toml").exists());
        assert!(root.join("test_helpers").exists());
    }

    #[test]
    fn test_output_path() {
        let path = output_path("test.png");
        assert_eq!(path, get_output_dir().join("test.png"));
        assert!(get_output_dir().is_dir());
    }

    #[test]
    fn test_gaussian_star_peak_and_symmetry() {
        let mut image = Array2::zeros((21, 21));
        add_gaussian_star(&mut image, 10.0, 10.0, 8.0, 2.0);
        assert_eq!(image[[10, 10]], 8.0);
        assert_eq!(image[[10, 12]], image[[12, 10]]);
        assert!((image[[10, 12]] - 8.0 * (-0.5f64).exp()).abs() < 1e-12);
    }
}
