//! Recovery history and its observers.
//!
//! Every injection made during a search becomes one [`RecoveryRow`] in a flat
//! [`RecoveryTable`], keyed by `(site, step, repeat)`. Observers see each step
//! as it completes, which is how the CSV and plot outputs are produced.

use serde::Serialize;
use std::io::{self, Write};

use super::search::SearchStatus;

/// CSV header matching [`RecoveryRow`] field order.
pub const CSV_HEADER: &str = "site,step,repeat,x,y,inject_mag,recover_mag,recover_mag_err,\
inject_flux,recover_flux,recover_snr,location_noise,beta,detected";

/// One injected source and what was measured for it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RecoveryRow {
    pub site: usize,
    pub step: usize,
    pub repeat: usize,
    pub x: f64,
    pub y: f64,
    /// Calibrated magnitude that was injected
    pub inject_mag: f64,
    /// Calibrated magnitude of the measured flux
    pub recover_mag: f64,
    pub recover_mag_err: f64,
    /// Injected counts
    pub inject_flux: f64,
    /// Measured counts
    pub recover_flux: f64,
    pub recover_snr: f64,
    /// Frozen pre-injection noise at the site
    pub location_noise: f64,
    /// Probability the source would be missed at the detection threshold
    pub beta: f64,
    pub detected: bool,
}

impl RecoveryRow {
    fn write_csv<W: Write>(&self, w: &mut W) -> io::Result<()> {
        writeln!(
            w,
            "{},{},{},{:.3},{:.3},{:.4},{:.4},{:.4},{:.4},{:.4},{:.4},{:.4},{:.6},{}",
            self.site,
            self.step,
            self.repeat,
            self.x,
            self.y,
            self.inject_mag,
            self.recover_mag,
            self.recover_mag_err,
            self.inject_flux,
            self.recover_flux,
            self.recover_snr,
            self.location_noise,
            self.beta,
            self.detected
        )
    }
}

/// All injections of one search in the order they were made.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecoveryTable {
    rows: Vec<RecoveryRow>,
}

impl RecoveryTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, rows: impl IntoIterator<Item = RecoveryRow>) {
        self.rows.extend(rows);
    }

    pub fn rows(&self) -> &[RecoveryRow] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// History of one site across all steps.
    pub fn for_site(&self, site: usize) -> impl Iterator<Item = &RecoveryRow> {
        self.rows.iter().filter(move |row| row.site == site)
    }

    pub fn for_step(&self, step: usize) -> impl Iterator<Item = &RecoveryRow> {
        self.rows.iter().filter(move |row| row.step == step)
    }

    pub fn write_csv<W: Write>(&self, mut w: W) -> io::Result<()> {
        writeln!(w, "{CSV_HEADER}")?;
        for row in &self.rows {
            row.write_csv(&mut w)?;
        }
        Ok(())
    }
}

/// Aggregate outcome of one step.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct StepSummary {
    pub step: usize,
    /// Calibrated magnitude injected
    pub magnitude: f64,
    pub detected: usize,
    pub total: usize,
    pub fraction: f64,
    /// `None` when the measurement failed and the step will be retried
    pub recovered: Option<bool>,
}

/// Receives search progress. Both hooks default to doing nothing.
pub trait SearchObserver {
    fn on_step(&mut self, _summary: &StepSummary, _rows: &[RecoveryRow]) {}

    fn on_finish(&mut self, _status: &SearchStatus, _magnitude: f64) {}
}

/// Streams recovery rows to CSV as they are produced.
///
/// Observer hooks cannot fail, so the first write error is held and returned
/// by [`CsvRecorder::finish`]; later rows are dropped.
pub struct CsvRecorder<W: Write> {
    writer: W,
    header_written: bool,
    error: Option<io::Error>,
}

impl<W: Write> CsvRecorder<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            header_written: false,
            error: None,
        }
    }

    fn write_rows(&mut self, rows: &[RecoveryRow]) -> io::Result<()> {
        if !self.header_written {
            writeln!(self.writer, "{CSV_HEADER}")?;
            self.header_written = true;
        }
        for row in rows {
            row.write_csv(&mut self.writer)?;
        }
        Ok(())
    }

    /// Flush and hand back the writer, or the first error seen.
    pub fn finish(mut self) -> io::Result<W> {
        if let Some(e) = self.error.take() {
            return Err(e);
        }
        if !self.header_written {
            writeln!(self.writer, "{CSV_HEADER}")?;
        }
        self.writer.flush()?;
        Ok(self.writer)
    }
}

impl<W: Write> SearchObserver for CsvRecorder<W> {
    fn on_step(&mut self, _summary: &StepSummary, rows: &[RecoveryRow]) {
        if self.error.is_some() {
            return;
        }
        if let Err(e) = self.write_rows(rows) {
            log::error!("failed to write recovery rows: {e}");
            self.error = Some(e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(site: usize, step: usize, detected: bool) -> RecoveryRow {
        RecoveryRow {
            site,
            step,
            repeat: 0,
            x: 10.0,
            y: 12.5,
            inject_mag: 19.0,
            recover_mag: 19.05,
            recover_mag_err: 0.1,
            inject_flux: 250.0,
            recover_flux: 238.0,
            recover_snr: 4.2,
            location_noise: 5.0,
            beta: 0.12,
            detected,
        }
    }

    fn summary(step: usize) -> StepSummary {
        StepSummary {
            step,
            magnitude: 19.0,
            detected: 1,
            total: 2,
            fraction: 0.5,
            recovered: Some(true),
        }
    }

    #[test]
    fn test_table_filters() {
        let mut table = RecoveryTable::new();
        table.extend([row(0, 0, true), row(1, 0, false), row(0, 1, true)]);
        assert_eq!(table.len(), 3);
        assert_eq!(table.for_site(0).count(), 2);
        assert_eq!(table.for_step(0).count(), 2);
        assert!(table.for_site(1).all(|r| !r.detected));
    }

    #[test]
    fn test_csv_layout() {
        let mut table = RecoveryTable::new();
        table.extend([row(3, 2, true)]);
        let mut out = Vec::new();
        table.write_csv(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();

        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], CSV_HEADER);
        let fields: Vec<&str> = lines[1].split(',').collect();
        assert_eq!(fields.len(), CSV_HEADER.split(',').count());
        assert_eq!(fields[0], "3");
        assert_eq!(fields[1], "2");
        assert_eq!(fields[13], "true");
    }

    #[test]
    fn test_recorder_streams_steps() {
        let mut recorder = CsvRecorder::new(Vec::new());
        recorder.on_step(&summary(0), &[row(0, 0, true), row(1, 0, false)]);
        recorder.on_step(&summary(1), &[row(0, 1, true)]);
        let text = String::from_utf8(recorder.finish().unwrap()).unwrap();
        assert_eq!(text.lines().count(), 4);
        assert_eq!(text.matches(CSV_HEADER).count(), 1);
    }

    #[test]
    fn test_recorder_writes_header_when_empty() {
        let recorder = CsvRecorder::new(Vec::new());
        let text = String::from_utf8(recorder.finish().unwrap()).unwrap();
        assert_eq!(text.trim_end(), CSV_HEADER);
    }
}
