//! Diagnostic plots for a search and for the single-sample estimate.

use plotters::prelude::*;
use std::path::Path;
use thiserror::Error;

use crate::injection::{RecoveryRow, SearchObserver, SearchStatus, StepSummary};
use crate::probable::SingleSampleEstimate;

#[derive(Error, Debug)]
pub enum PlotError {
    #[error("nothing to plot")]
    Empty,

    #[error("drawing failed: {0}")]
    Drawing(String),
}

fn drawing<E: std::fmt::Display>(e: E) -> PlotError {
    PlotError::Drawing(e.to_string())
}

fn padded_range(values: impl Iterator<Item = f64>, pad: f64) -> Option<(f64, f64)> {
    let (lo, hi) = values
        .filter(|v| v.is_finite())
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| {
            (lo.min(v), hi.max(v))
        });
    (lo <= hi).then_some((lo - pad, hi + pad))
}

/// Records steps during a search and draws detected fraction against magnitude.
#[derive(Debug, Clone, Default)]
pub struct ConvergencePlot {
    steps: Vec<StepSummary>,
    required_fraction: f64,
    result: Option<f64>,
}

impl ConvergencePlot {
    /// `cutoff_fraction` as configured; the plotted line sits at `1 - cutoff_fraction`.
    pub fn new(cutoff_fraction: f64) -> Self {
        Self {
            steps: Vec::new(),
            required_fraction: 1.0 - cutoff_fraction,
            result: None,
        }
    }

    pub fn steps(&self) -> &[StepSummary] {
        &self.steps
    }

    pub fn result(&self) -> Option<f64> {
        self.result
    }

    /// `(magnitude, fraction, recovered)` of every step that was measured.
    pub fn points(&self) -> Vec<(f64, f64, bool)> {
        self.steps
            .iter()
            .filter_map(|s| s.recovered.map(|r| (s.magnitude, s.fraction, r)))
            .collect()
    }

    pub fn save(&self, path: &Path) -> Result<(), PlotError> {
        let points = self.points();
        let (x_min, x_max) =
            padded_range(points.iter().map(|p| p.0), 0.1).ok_or(PlotError::Empty)?;

        let root = BitMapBackend::new(path, (1200, 800)).into_drawing_area();
        root.fill(&WHITE).map_err(drawing)?;

        let mut chart = ChartBuilder::on(&root)
            .caption("Recovered fraction per step", ("sans-serif", 28))
            .margin(15)
            .x_label_area_size(50)
            .y_label_area_size(60)
            .build_cartesian_2d(x_min..x_max, 0.0..1.05)
            .map_err(drawing)?;

        chart
            .configure_mesh()
            .x_desc("Injected magnitude")
            .y_desc("Detected fraction")
            .draw()
            .map_err(drawing)?;

        chart
            .draw_series(LineSeries::new(
                points.iter().map(|&(m, f, _)| (m, f)),
                BLACK.mix(0.3).stroke_width(1),
            ))
            .map_err(drawing)?;

        chart
            .draw_series(points.iter().map(|&(m, f, recovered)| {
                let color = if recovered { GREEN } else { RED };
                Circle::new((m, f), 5, color.filled())
            }))
            .map_err(drawing)?;

        chart
            .draw_series(std::iter::once(PathElement::new(
                vec![
                    (x_min, self.required_fraction),
                    (x_max, self.required_fraction),
                ],
                BLUE,
            )))
            .map_err(drawing)?;

        if let Some(result) = self.result {
            chart
                .draw_series(std::iter::once(PathElement::new(
                    vec![(result, 0.0), (result, 1.05)],
                    MAGENTA.stroke_width(2),
                )))
                .map_err(drawing)?;
        }

        root.present().map_err(drawing)?;
        Ok(())
    }
}

impl SearchObserver for ConvergencePlot {
    fn on_step(&mut self, summary: &StepSummary, _rows: &[RecoveryRow]) {
        self.steps.push(*summary);
    }

    fn on_finish(&mut self, status: &SearchStatus, magnitude: f64) {
        if *status == SearchStatus::Converged && magnitude.is_finite() {
            self.result = Some(magnitude);
        }
    }
}

/// Histogram of fake aperture sums with the fitted Gaussian overlaid.
pub fn plot_single_sample(estimate: &SingleSampleEstimate, path: &Path) -> Result<(), PlotError> {
    if estimate.bin_centers.len() < 2 {
        return Err(PlotError::Empty);
    }
    let width = estimate.bin_centers[1] - estimate.bin_centers[0];
    let (x_min, x_max) = padded_range(estimate.bin_centers.iter().copied(), width)
        .ok_or(PlotError::Empty)?;
    let y_max = estimate
        .density
        .iter()
        .copied()
        .chain(std::iter::once(estimate.amplitude))
        .filter(|v| v.is_finite())
        .fold(0.0, f64::max)
        * 1.1;

    let root = BitMapBackend::new(path, (1000, 700)).into_drawing_area();
    root.fill(&WHITE).map_err(drawing)?;

    let mut chart = ChartBuilder::on(&root)
        .caption("Fake aperture sums", ("sans-serif", 28))
        .margin(15)
        .x_label_area_size(50)
        .y_label_area_size(70)
        .build_cartesian_2d(x_min..x_max, 0.0..y_max.max(f64::EPSILON))
        .map_err(drawing)?;

    chart
        .configure_mesh()
        .x_desc("Aperture sum (counts)")
        .y_desc("Density")
        .draw()
        .map_err(drawing)?;

    chart
        .draw_series(
            estimate
                .bin_centers
                .iter()
                .zip(&estimate.density)
                .map(|(&c, &d)| {
                    Rectangle::new(
                        [(c - width / 2.0, 0.0), (c + width / 2.0, d)],
                        BLUE.mix(0.4).filled(),
                    )
                }),
        )
        .map_err(drawing)?;

    let samples = 200;
    chart
        .draw_series(LineSeries::new(
            (0..=samples).map(|i| {
                let x = x_min + (x_max - x_min) * i as f64 / samples as f64;
                let d = x - estimate.mean;
                let y = estimate.amplitude * (-d * d / (2.0 * estimate.sigma.powi(2))).exp();
                (x, y)
            }),
            RED.stroke_width(2),
        ))
        .map_err(drawing)?;

    root.present().map_err(drawing)?;
    Ok(())
}
