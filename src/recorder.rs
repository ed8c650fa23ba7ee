// src/recorder.rs
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use csv::{ReaderBuilder, WriterBuilder};
use log::{debug, info};
use serde::Serialize;

use crate::analysis::peak::{Peak, PeakReading};
use crate::drivers::source::{CalibrationCurve, SweepSample};
use crate::series::{Channel, GrowthRow, ResultSeries};

pub const SWEEP_HEADER: [&str; 2] = ["Frequency (MHz)", "Signal Strength"];
pub const RESULTS_HEADER: [&str; 5] = [
    "Filename",
    "Time (hours)",
    "Timestamp",
    "Growth Index",
    "Frequency (MHz)",
];
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

fn write_pairs(path: &Path, pairs: impl Iterator<Item = (f64, f64)>) -> Result<()> {
    let mut writer = WriterBuilder::new()
        .has_headers(false)
        .from_path(path)
        .with_context(|| format!("creating {}", path.display()))?;
    writer.write_record(SWEEP_HEADER)?;
    for pair in pairs {
        writer.serialize(pair)?;
    }
    writer.flush()?;
    Ok(())
}

fn read_pairs(path: &Path) -> Result<(Vec<f64>, Vec<f64>)> {
    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_path(path)
        .with_context(|| format!("opening {}", path.display()))?;
    let mut frequencies = Vec::new();
    let mut magnitudes = Vec::new();
    for (line, row) in reader.deserialize::<(f64, f64)>().enumerate() {
        let (f, m) = row.with_context(|| format!("{} row {}", path.display(), line + 2))?;
        frequencies.push(f);
        magnitudes.push(m);
    }
    Ok((frequencies, magnitudes))
}

pub fn write_sweep_csv(path: &Path, sweep: &SweepSample) -> Result<()> {
    write_pairs(path, sweep.pairs())
}

pub fn read_sweep_csv(path: &Path) -> Result<SweepSample> {
    let (frequencies, magnitudes) = read_pairs(path)?;
    Ok(SweepSample::new(frequencies, magnitudes)?)
}

pub fn write_calibration_csv(path: &Path, curve: &CalibrationCurve) -> Result<()> {
    write_pairs(
        path,
        curve
            .frequencies()
            .iter()
            .copied()
            .zip(curve.magnitudes().iter().copied()),
    )
}

pub fn read_calibration_csv(path: &Path) -> Result<CalibrationCurve> {
    let (frequencies, magnitudes) = read_pairs(path)?;
    Ok(CalibrationCurve::new(frequencies, magnitudes)?)
}

/// Recorded peak readings for fixture replay, one row per scan:
/// raw frequency, raw magnitude, smoothed frequency, smoothed magnitude.
pub fn read_peak_csv(path: &Path) -> Result<Vec<PeakReading>> {
    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_path(path)
        .with_context(|| format!("opening {}", path.display()))?;
    let mut readings = Vec::new();
    for (line, row) in reader.deserialize::<(f64, f64, f64, f64)>().enumerate() {
        let (raw_f, raw_m, smooth_f, smooth_m) =
            row.with_context(|| format!("{} row {}", path.display(), line + 2))?;
        readings.push(PeakReading {
            raw: Peak {
                amplitude: raw_m,
                frequency_mhz: raw_f,
            },
            smooth: Peak {
                amplitude: smooth_m,
                frequency_mhz: smooth_f,
            },
        });
    }
    Ok(readings)
}

#[derive(Serialize)]
struct ResultRecord<'a> {
    filename: &'a str,
    time_hours: f64,
    timestamp: String,
    growth_index: Option<f64>,
    frequency: f64,
}

pub fn write_results_csv(path: &Path, rows: &[GrowthRow]) -> Result<()> {
    let mut writer = WriterBuilder::new()
        .has_headers(false)
        .from_path(path)
        .with_context(|| format!("creating {}", path.display()))?;
    writer.write_record(RESULTS_HEADER)?;
    for row in rows {
        writer.serialize(ResultRecord {
            filename: &row.filename,
            time_hours: row.time_hours,
            timestamp: row.timestamp.format(TIMESTAMP_FORMAT).to_string(),
            growth_index: row.growth_index,
            frequency: row.frequency,
        })?;
    }
    writer.flush()?;
    Ok(())
}

/// Per-reader file layout: raw sweeps under `scans/`, the calibration
/// baseline under `calibration/`, and the two results tables at the top.
pub struct ScanRecorder {
    root: PathBuf,
    reader: String,
    scans_written: usize,
}

impl ScanRecorder {
    pub fn new(root: impl Into<PathBuf>, reader: &str) -> Result<Self> {
        let root = root.into();
        for dir in [root.join("scans"), root.join("calibration")] {
            fs::create_dir_all(&dir).with_context(|| format!("creating {}", dir.display()))?;
        }
        info!("recording {reader} to {}", root.display());
        Ok(Self {
            root,
            reader: reader.to_owned(),
            scans_written: 0,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn calibration_path(&self) -> PathBuf {
        self.root.join("calibration").join("calibration.csv")
    }

    pub fn results_path(&self, channel: Channel) -> PathBuf {
        match channel {
            Channel::Raw => self.root.join("results_raw.csv"),
            Channel::Smooth => self.root.join("results_smooth.csv"),
        }
    }

    /// Store one sweep and return the file name used for its result point.
    pub fn record_sweep(&mut self, sweep: &SweepSample, timestamp: DateTime<Local>) -> Result<String> {
        self.scans_written += 1;
        let filename = format!(
            "{}_{}_{:05}.csv",
            self.reader,
            timestamp.format("%Y%m%d_%H%M%S"),
            self.scans_written
        );
        let path = self.root.join("scans").join(&filename);
        write_sweep_csv(&path, sweep)?;
        debug!("wrote {}", path.display());
        Ok(filename)
    }

    pub fn save_calibration(&self, curve: &CalibrationCurve) -> Result<()> {
        write_calibration_csv(&self.calibration_path(), curve)
    }

    /// Stored calibration, if one has been taken for this reader.
    pub fn load_calibration(&self) -> Result<Option<CalibrationCurve>> {
        let path = self.calibration_path();
        if !path.exists() {
            return Ok(None);
        }
        read_calibration_csv(&path).map(Some)
    }

    /// Rewrite both results tables from the current denoised views.
    pub fn write_results(&self, series: &ResultSeries) -> Result<()> {
        for channel in [Channel::Raw, Channel::Smooth] {
            write_results_csv(&self.results_path(channel), &series.growth_view(channel))?;
        }
        Ok(())
    }
}
