use chrono::{DateTime, Local};

use crate::analysis::denoise::denoise;
use crate::analysis::peak::PeakReading;
use crate::analysis::smoothing::SavitzkyGolay;
use crate::analysis::stats::WindowBuffer;
use crate::config::SeriesConfig;
use crate::drivers::error::SeriesError;

/// One analyzed scan. Missing-data points carry `NaN` peak values.
#[derive(Clone, Debug, PartialEq)]
pub struct ResultPoint {
    pub time_hours: f64,
    pub raw_frequency: f64,
    pub raw_magnitude: f64,
    pub smooth_frequency: f64,
    pub smooth_magnitude: f64,
    pub filename: String,
    pub timestamp: DateTime<Local>,
}

impl ResultPoint {
    pub fn from_reading(
        time_hours: f64,
        reading: &PeakReading,
        filename: impl Into<String>,
        timestamp: DateTime<Local>,
    ) -> Self {
        Self {
            time_hours,
            raw_frequency: reading.raw.frequency_mhz,
            raw_magnitude: reading.raw.amplitude,
            smooth_frequency: reading.smooth.frequency_mhz,
            smooth_magnitude: reading.smooth.amplitude,
            filename: filename.into(),
            timestamp,
        }
    }

    /// Placeholder for a failed scan so the series keeps its time alignment.
    pub fn missing(time_hours: f64, timestamp: DateTime<Local>) -> Self {
        Self {
            time_hours,
            raw_frequency: f64::NAN,
            raw_magnitude: f64::NAN,
            smooth_frequency: f64::NAN,
            smooth_magnitude: f64::NAN,
            filename: String::new(),
            timestamp,
        }
    }

    pub fn is_missing(&self) -> bool {
        !self.raw_frequency.is_finite()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Channel {
    Raw,
    Smooth,
}

/// One denoised point as exported to the results CSV.
#[derive(Clone, Debug, PartialEq)]
pub struct GrowthRow {
    pub filename: String,
    pub time_hours: f64,
    pub timestamp: DateTime<Local>,
    pub growth_index: Option<f64>,
    pub frequency: f64,
}

/// Per-reader time series of analyzed scans.
pub struct ResultSeries {
    config: SeriesConfig,
    time: Vec<f64>,
    raw_frequency: Vec<f64>,
    raw_magnitude: Vec<f64>,
    smooth_frequency: Vec<f64>,
    smooth_magnitude: Vec<f64>,
    filenames: Vec<String>,
    timestamps: Vec<DateTime<Local>>,
    raw_denoised: Vec<usize>,
    smooth_denoised: Vec<usize>,
    zero_point: Option<f64>,
    // Last finite (time, raw frequency), the left end of the next derivative.
    last_finite: Option<(f64, f64)>,
    derivative: Vec<f64>,
    derivative_window: WindowBuffer,
    derivative_time: Vec<f64>,
    derivative_mean_raw: Vec<f64>,
    derivative_mean: Vec<f64>,
    derivative_smoother: SavitzkyGolay,
}

impl ResultSeries {
    pub fn new(config: SeriesConfig) -> Self {
        Self {
            derivative_window: WindowBuffer::new(config.derivative_window),
            derivative_smoother: SavitzkyGolay::new(
                config.derivative_smoothing_window,
                config.derivative_smoothing_order,
            ),
            config,
            time: Vec::new(),
            raw_frequency: Vec::new(),
            raw_magnitude: Vec::new(),
            smooth_frequency: Vec::new(),
            smooth_magnitude: Vec::new(),
            filenames: Vec::new(),
            timestamps: Vec::new(),
            raw_denoised: Vec::new(),
            smooth_denoised: Vec::new(),
            zero_point: None,
            last_finite: None,
            derivative: Vec::new(),
            derivative_time: Vec::new(),
            derivative_mean_raw: Vec::new(),
            derivative_mean: Vec::new(),
        }
    }

    pub fn append(&mut self, point: ResultPoint) -> Result<(), SeriesError> {
        if let Some(&last) = self.time.last() {
            if !(point.time_hours > last) {
                return Err(SeriesError::NonMonotonicTime {
                    last,
                    got: point.time_hours,
                });
            }
        }
        if !point.time_hours.is_finite() {
            return Err(SeriesError::NonMonotonicTime {
                last: self.time.last().copied().unwrap_or(f64::NAN),
                got: point.time_hours,
            });
        }
        self.time.push(point.time_hours);
        self.raw_frequency.push(point.raw_frequency);
        self.raw_magnitude.push(point.raw_magnitude);
        self.smooth_frequency.push(point.smooth_frequency);
        self.smooth_magnitude.push(point.smooth_magnitude);
        self.filenames.push(point.filename);
        self.timestamps.push(point.timestamp);
        self.refresh_denoised();
        if point.raw_frequency.is_finite() {
            self.update_derivative(point.time_hours, point.raw_frequency);
        }
        Ok(())
    }

    fn refresh_denoised(&mut self) {
        self.raw_denoised = denoise(&self.time, &self.raw_frequency);
        self.smooth_denoised = denoise(&self.time, &self.smooth_frequency);
    }

    fn update_derivative(&mut self, time: f64, frequency: f64) {
        let previous = self.last_finite.replace((time, frequency));
        let (Some(zero_point), Some((t0, f0))) = (self.zero_point, previous) else {
            return;
        };
        let g0 = growth_index(zero_point, f0);
        let g1 = growth_index(zero_point, frequency);
        let slope = (g1 - g0) / (time - t0);
        self.derivative.push(slope);
        self.derivative_window.push(slope);
        if self.derivative.len() <= self.config.derivative_window {
            return;
        }
        if let Some(mean) = self.derivative_window.mean() {
            self.derivative_time.push(time);
            self.derivative_mean_raw.push(mean);
            self.derivative_mean = if self.derivative_mean_raw.len() > self.derivative_smoother.window() {
                self.derivative_smoother.apply(&self.derivative_mean_raw)
            } else {
                self.derivative_mean_raw.clone()
            };
        }
    }

    /// Fix the reference frequency for growth-index views. Only the first call succeeds.
    pub fn set_zero_point(&mut self, frequency: f64) -> Result<(), SeriesError> {
        if let Some(existing) = self.zero_point {
            return Err(SeriesError::ZeroPointAlreadySet(existing));
        }
        if !frequency.is_finite() || frequency == 0.0 {
            return Err(SeriesError::InvalidZeroPoint(frequency));
        }
        self.zero_point = Some(frequency);
        Ok(())
    }

    /// Drop everything but the most recent point and restart the derivative history.
    pub fn reset_run(&mut self) {
        keep_last(&mut self.time);
        keep_last(&mut self.raw_frequency);
        keep_last(&mut self.raw_magnitude);
        keep_last(&mut self.smooth_frequency);
        keep_last(&mut self.smooth_magnitude);
        keep_last(&mut self.filenames);
        keep_last(&mut self.timestamps);
        self.last_finite = match (self.time.last(), self.raw_frequency.last()) {
            (Some(&t), Some(&f)) if f.is_finite() => Some((t, f)),
            _ => None,
        };
        self.refresh_denoised();
        self.derivative.clear();
        self.derivative_window.clear();
        self.derivative_time.clear();
        self.derivative_mean_raw.clear();
        self.derivative_mean.clear();
    }

    pub fn len(&self) -> usize {
        self.time.len()
    }

    pub fn is_empty(&self) -> bool {
        self.time.is_empty()
    }

    pub fn time(&self) -> &[f64] {
        &self.time
    }

    pub fn raw_frequency(&self) -> &[f64] {
        &self.raw_frequency
    }

    pub fn raw_magnitude(&self) -> &[f64] {
        &self.raw_magnitude
    }

    pub fn smooth_frequency(&self) -> &[f64] {
        &self.smooth_frequency
    }

    pub fn smooth_magnitude(&self) -> &[f64] {
        &self.smooth_magnitude
    }

    pub fn filenames(&self) -> &[String] {
        &self.filenames
    }

    pub fn denoised(&self, channel: Channel) -> &[usize] {
        match channel {
            Channel::Raw => &self.raw_denoised,
            Channel::Smooth => &self.smooth_denoised,
        }
    }

    pub fn zero_point(&self) -> Option<f64> {
        self.zero_point
    }

    pub fn derivative(&self) -> &[f64] {
        &self.derivative
    }

    pub fn derivative_time(&self) -> &[f64] {
        &self.derivative_time
    }

    pub fn derivative_mean(&self) -> &[f64] {
        &self.derivative_mean
    }

    pub fn failed_points(&self) -> usize {
        self.raw_frequency.iter().filter(|f| !f.is_finite()).count()
    }

    pub fn point(&self, idx: usize) -> Option<ResultPoint> {
        Some(ResultPoint {
            time_hours: *self.time.get(idx)?,
            raw_frequency: self.raw_frequency[idx],
            raw_magnitude: self.raw_magnitude[idx],
            smooth_frequency: self.smooth_frequency[idx],
            smooth_magnitude: self.smooth_magnitude[idx],
            filename: self.filenames[idx].clone(),
            timestamp: self.timestamps[idx],
        })
    }

    pub fn latest(&self) -> Option<ResultPoint> {
        self.len().checked_sub(1).and_then(|i| self.point(i))
    }

    /// Most recent point with a finite raw frequency.
    pub fn latest_valid(&self) -> Option<ResultPoint> {
        (0..self.len())
            .rev()
            .find(|&i| self.raw_frequency[i].is_finite())
            .and_then(|i| self.point(i))
    }

    pub fn growth_index(&self, frequency: f64) -> Option<f64> {
        self.zero_point.map(|zp| growth_index(zp, frequency))
    }

    /// Denoised points of one channel, with growth index when a zero point exists.
    pub fn growth_view(&self, channel: Channel) -> Vec<GrowthRow> {
        let frequencies = match channel {
            Channel::Raw => &self.raw_frequency,
            Channel::Smooth => &self.smooth_frequency,
        };
        self.denoised(channel)
            .iter()
            .map(|&i| GrowthRow {
                filename: self.filenames[i].clone(),
                time_hours: self.time[i],
                timestamp: self.timestamps[i],
                growth_index: self.growth_index(frequencies[i]),
                frequency: frequencies[i],
            })
            .collect()
    }
}

pub fn growth_index(zero_point: f64, frequency: f64) -> f64 {
    100.0 * (1.0 - frequency / zero_point)
}

fn keep_last<T>(values: &mut Vec<T>) {
    if values.len() > 1 {
        values.drain(..values.len() - 1);
    }
}
