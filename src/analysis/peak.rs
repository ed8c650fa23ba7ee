use std::collections::VecDeque;

use crate::analysis::fit::{fit_gaussian, Gaussian, GaussianBounds};
use crate::analysis::smoothing::SavitzkyGolay;
use crate::drivers::error::AnalysisError;
use crate::drivers::source::SweepSample;

/// Samples taken on each side of the global maximum for the peak fit.
pub const PEAK_HALF_WINDOW: usize = 500;

/// Fitted resonance peak.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Peak {
    pub amplitude: f64,
    pub frequency_mhz: f64,
}

/// Raw and smoothed peaks for one sweep.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PeakReading {
    pub raw: Peak,
    pub smooth: Peak,
}

/// Turns a sweep into a peak reading. Implemented by the fitting analyzer and
/// by fixture replay for simulation.
pub trait Analyzer: Send {
    fn analyze(&mut self, sweep: &SweepSample) -> Result<PeakReading, AnalysisError>;
}

/// Fit a Gaussian to the ±[`PEAK_HALF_WINDOW`] samples around the global maximum.
pub fn find_peak(frequencies: &[f64], magnitudes: &[f64]) -> Result<Peak, AnalysisError> {
    if frequencies.len() != magnitudes.len() {
        return Err(AnalysisError::LengthMismatch {
            frequencies: frequencies.len(),
            magnitudes: magnitudes.len(),
        });
    }
    let (peak_idx, _) = magnitudes
        .iter()
        .copied()
        .enumerate()
        .filter(|(_, m)| m.is_finite())
        .fold(None, |best: Option<(usize, f64)>, (i, m)| match best {
            Some((_, b)) if b >= m => best,
            _ => Some((i, m)),
        })
        .ok_or(AnalysisError::EmptySweep)?;

    let lo = peak_idx.saturating_sub(PEAK_HALF_WINDOW);
    let hi = (peak_idx + PEAK_HALF_WINDOW + 1).min(magnitudes.len());
    let x = &frequencies[lo..hi];
    let y = &magnitudes[lo..hi];

    let (mag_min, mag_max) = magnitudes
        .iter()
        .filter(|m| m.is_finite())
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(a, b), &m| (a.min(m), b.max(m)));
    let (f_lo, f_hi) = (x[0], x[x.len() - 1]);
    let bounds = GaussianBounds {
        amplitude: (mag_min, mag_max),
        centroid: (f_lo.min(f_hi), f_lo.max(f_hi)),
        sigma: (0.0, (f_hi - f_lo).abs().max(f64::MIN_POSITIVE)),
    };
    let sigma = half_max_sigma(x, y, peak_idx - lo)
        .or_else(|| Gaussian::moment_estimate(x, y).map(|g| g.sigma))
        .unwrap_or((f_hi - f_lo).abs() / 6.0);
    let initial = Gaussian {
        amplitude: magnitudes[peak_idx],
        centroid: frequencies[peak_idx],
        sigma,
    };
    let fit = fit_gaussian(x, y, initial, bounds)?;
    Ok(Peak {
        amplitude: fit.params.amplitude,
        frequency_mhz: fit.params.centroid,
    })
}

/// Width estimate from the first half-maximum crossing on either side of the peak.
fn half_max_sigma(x: &[f64], y: &[f64], peak: usize) -> Option<f64> {
    let floor = y
        .iter()
        .copied()
        .filter(|v| v.is_finite())
        .fold(f64::INFINITY, f64::min);
    let half = (y[peak] + floor) / 2.0;
    let left = (0..peak).rev().find(|&i| y[i] < half).map(|i| (x[peak] - x[i]).abs());
    let right = (peak + 1..y.len()).find(|&i| y[i] < half).map(|i| (x[i] - x[peak]).abs());
    let fwhm = match (left, right) {
        (Some(l), Some(r)) => l + r,
        (Some(d), None) | (None, Some(d)) => 2.0 * d,
        (None, None) => return None,
    };
    Some(fwhm / (2.0 * (2.0 * std::f64::consts::LN_2).sqrt()))
}

/// Fits both the raw sweep and its smoothed copy.
pub struct GaussianPeakAnalyzer {
    smoother: SavitzkyGolay,
}

impl GaussianPeakAnalyzer {
    pub fn new() -> Self {
        Self {
            smoother: SavitzkyGolay::for_sweeps(),
        }
    }

    pub fn smooth(&self, magnitudes: &[f64]) -> Vec<f64> {
        self.smoother.apply(magnitudes)
    }
}

impl Default for GaussianPeakAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

impl Analyzer for GaussianPeakAnalyzer {
    fn analyze(&mut self, sweep: &SweepSample) -> Result<PeakReading, AnalysisError> {
        if sweep.is_empty() {
            return Err(AnalysisError::EmptySweep);
        }
        let raw = find_peak(sweep.frequencies(), sweep.magnitudes())?;
        let smoothed = self.smooth(sweep.magnitudes());
        let smooth = find_peak(sweep.frequencies(), &smoothed)?;
        Ok(PeakReading { raw, smooth })
    }
}

/// Replays recorded peak readings, ignoring the sweep it is handed.
pub struct FixtureAnalyzer {
    readings: VecDeque<PeakReading>,
}

impl FixtureAnalyzer {
    pub fn new(readings: impl IntoIterator<Item = PeakReading>) -> Self {
        Self {
            readings: readings.into_iter().collect(),
        }
    }
}

impl Analyzer for FixtureAnalyzer {
    fn analyze(&mut self, _sweep: &SweepSample) -> Result<PeakReading, AnalysisError> {
        self.readings
            .pop_front()
            .ok_or(AnalysisError::FixtureExhausted)
    }
}
