//! Limiting magnitude of a synthetic field by source injection
//!
//! Builds a Gaussian-noise sky with optional bright field stars, runs the
//! injection/recovery search on it and, optionally, the single-sample
//! estimator for comparison. Writes the per-injection recovery table as CSV
//! and convergence / histogram plots into the output directory.

use chrono::Local;
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use limit::injection::{
    minimum_distance_sample, CsvRecorder, RecoveryRow, SearchObserver, SearchStatus, SourceModel,
    StepSummary,
};
use limit::plot::{plot_single_sample, ConvergencePlot};
use limit::shared_args::{FieldArgs, InjectionArgs};
use limit::{estimate_single_sample, InjectionConfig, LimitingMagnitudeSearch};
use ndarray::Array2;
use rand::rngs::StdRng;
use rand::SeedableRng;
use shared::image_proc::simple_normal_array;
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

#[derive(Parser, Debug)]
#[command(
    name = "Injection Limiting Magnitude",
    about = "Estimates the limiting magnitude of a synthetic field by injecting and recovering sources",
    long_about = None
)]
struct Args {
    #[command(flatten)]
    injection: InjectionArgs,

    #[command(flatten)]
    field: FieldArgs,

    /// Directory for the CSV table and plots
    #[arg(long, default_value = ".")]
    output_dir: PathBuf,

    /// Write the effective configuration as JSON to this path
    #[arg(long)]
    dump_config: Option<PathBuf>,

    /// Also run the single-sample estimator
    #[arg(long, default_value_t = false)]
    single_sample: bool,

    /// Skip writing plots
    #[arg(long, default_value_t = false)]
    no_plots: bool,
}

/// Spinner that reports each step as it completes.
struct ProgressObserver {
    bar: ProgressBar,
}

impl ProgressObserver {
    fn new() -> Self {
        let bar = ProgressBar::new_spinner();
        bar.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner} [{elapsed_precise}] {pos} steps {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        Self { bar }
    }
}

impl SearchObserver for ProgressObserver {
    fn on_step(&mut self, summary: &StepSummary, _rows: &[RecoveryRow]) {
        self.bar.inc(1);
        self.bar.set_message(format!(
            "mag {:.2}: {}/{} detected",
            summary.magnitude, summary.detected, summary.total
        ));
    }

    fn on_finish(&mut self, status: &SearchStatus, magnitude: f64) {
        self.bar
            .finish_with_message(format!("{status}, magnitude {magnitude:.3}"));
    }
}

/// Sky noise plus `field.stars` Gaussian stars kept apart by a few FWHM.
fn synthetic_field(
    field: &FieldArgs,
    config: &InjectionConfig,
) -> Result<Array2<f64>, Box<dyn std::error::Error>> {
    let shape = (field.size, field.size);
    let mut image = simple_normal_array(shape, field.sky, field.sky_noise, field.field_seed)?;
    if field.stars == 0 {
        return Ok(image);
    }

    let margin = (2.0 * field.fwhm).ceil() as i64;
    let spacing = (3.0 * field.fwhm).ceil() as i64;
    let mut rng = StdRng::seed_from_u64(field.field_seed);
    let positions = minimum_distance_sample(
        (margin, field.size as i64 - margin),
        field.stars,
        spacing,
        &mut rng,
    )?;

    let model = SourceModel::gaussian_from_fwhm(field.fwhm, config.exposure_time)?;
    let amplitude = model.amplitude_for_magnitude(field.star_magnitude - config.zeropoint);
    for star in &positions {
        model
            .render_source(star.x, star.y, amplitude, shape, None)
            .add_to(&mut image);
    }
    log::info!(
        "placed {} stars of magnitude {:.1}",
        positions.len(),
        field.star_magnitude
    );
    Ok(image)
}

fn save_plot(result: Result<(), limit::plot::PlotError>, path: &Path) {
    match result {
        Ok(()) => println!("Plot: {}", path.display()),
        Err(e) => log::warn!("could not write {}: {e}", path.display()),
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args = Args::parse();

    let config = args.injection.to_config()?;
    if let Some(path) = &args.dump_config {
        config.save_to_file(path)?;
        println!("Configuration written to {}", path.display());
    }

    let image = synthetic_field(&args.field, &config)?;
    std::fs::create_dir_all(&args.output_dir)?;
    let timestamp = Local::now().format("%Y%m%d_%H%M%S").to_string();

    let csv_path = args.output_dir.join(format!("recovery_{timestamp}.csv"));
    let mut recorder = CsvRecorder::new(BufWriter::new(File::create(&csv_path)?));
    let mut plot = ConvergencePlot::new(config.cutoff_fraction);
    let mut progress = ProgressObserver::new();

    let outcome = LimitingMagnitudeSearch::new(args.field.fwhm, config.clone())?
        .with_observer(&mut recorder)
        .with_observer(&mut plot)
        .with_observer(&mut progress)
        .run(&image.view())?;

    recorder.finish()?;
    println!("Recovery table: {}", csv_path.display());
    println!(
        "Search {} after {} steps ({:?} criterion, {} of {} sites)",
        outcome.status,
        outcome.steps.len(),
        outcome.mode,
        outcome.active_sites.len(),
        outcome.sites.len()
    );
    println!("Limiting magnitude: {:.3}", outcome.magnitude);

    if !args.no_plots {
        let path = args.output_dir.join(format!("convergence_{timestamp}.png"));
        save_plot(plot.save(&path), &path);
    }

    if args.single_sample {
        let background = config.background.build();
        let estimate = estimate_single_sample(
            &image.view(),
            args.field.fwhm,
            &config,
            background.as_ref(),
        )?;
        println!(
            "Single-sample estimate: sigma {:.3} counts, instrumental {:.3}, calibrated {:.3}{}",
            estimate.sigma,
            estimate.magnitude,
            estimate.magnitude + config.zeropoint,
            if estimate.used_fallback {
                " (sample moments)"
            } else {
                ""
            }
        );
        if !args.no_plots {
            let path = args.output_dir.join(format!("single_sample_{timestamp}.png"));
            save_plot(plot_single_sample(&estimate, &path), &path);
        }
    }

    Ok(())
}
