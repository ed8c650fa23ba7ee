use std::path::Path;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::drivers::error::{AnalysisError, SweepError};

/// Step between adjacent points of a regular scan.
pub const SCAN_STEP_MHZ: f64 = 0.001;
pub const CALIBRATION_START_MHZ: f64 = 1.0;
pub const CALIBRATION_STOP_MHZ: f64 = 10.0;
pub const CALIBRATION_STEP_MHZ: f64 = 0.005;
/// Points dropped from the start of every sweep (instrument self-resonance).
pub const LEADING_ARTIFACT_POINTS: usize = 20;

/// Frequency bounds and point count for one sweep.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SweepPlan {
    pub start_mhz: f64,
    pub stop_mhz: f64,
    pub points: u32,
}

impl SweepPlan {
    pub fn new(start_mhz: f64, stop_mhz: f64, step_mhz: f64) -> Result<Self, SweepError> {
        if !start_mhz.is_finite() || !stop_mhz.is_finite() || start_mhz <= 0.0 {
            return Err(SweepError::ConfigurationInvalid(format!(
                "frequency bounds must be finite and positive ({start_mhz}..{stop_mhz} MHz)"
            )));
        }
        if stop_mhz <= start_mhz {
            return Err(SweepError::ConfigurationInvalid(format!(
                "stop frequency {stop_mhz} MHz is not above start frequency {start_mhz} MHz"
            )));
        }
        let points = ((stop_mhz - start_mhz) / step_mhz).round() as i64 + 1;
        let usable = points - LEADING_ARTIFACT_POINTS as i64;
        if usable <= 0 || points > u32::MAX as i64 {
            return Err(SweepError::ConfigurationInvalid(format!(
                "{start_mhz}..{stop_mhz} MHz yields {usable} usable points"
            )));
        }
        Ok(Self {
            start_mhz,
            stop_mhz,
            points: points as u32,
        })
    }

    pub fn scan(start_mhz: f64, stop_mhz: f64) -> Result<Self, SweepError> {
        Self::new(start_mhz, stop_mhz, SCAN_STEP_MHZ)
    }

    pub fn calibration() -> Self {
        let span = CALIBRATION_STOP_MHZ - CALIBRATION_START_MHZ;
        Self {
            start_mhz: CALIBRATION_START_MHZ,
            stop_mhz: CALIBRATION_STOP_MHZ,
            points: (span / CALIBRATION_STEP_MHZ).round() as u32 + 1,
        }
    }

    pub fn start_hz(&self) -> u32 {
        (self.start_mhz * 1e6).round() as u32
    }

    pub fn stop_hz(&self) -> u32 {
        (self.stop_mhz * 1e6).round() as u32
    }

    /// Evenly spaced frequencies, including both bounds.
    pub fn frequencies(&self) -> Vec<f64> {
        let n = self.points as usize;
        if n < 2 {
            return vec![self.start_mhz; n];
        }
        let step = (self.stop_mhz - self.start_mhz) / (n - 1) as f64;
        (0..n).map(|i| self.start_mhz + i as f64 * step).collect()
    }
}

/// One completed sweep: frequency (MHz) and magnitude per bin.
#[derive(Clone, Debug, PartialEq)]
pub struct SweepSample {
    frequencies: Vec<f64>,
    magnitudes: Vec<f64>,
}

impl SweepSample {
    pub fn new(frequencies: Vec<f64>, magnitudes: Vec<f64>) -> Result<Self, AnalysisError> {
        if frequencies.len() != magnitudes.len() {
            return Err(AnalysisError::LengthMismatch {
                frequencies: frequencies.len(),
                magnitudes: magnitudes.len(),
            });
        }
        Ok(Self {
            frequencies,
            magnitudes,
        })
    }

    pub fn frequencies(&self) -> &[f64] {
        &self.frequencies
    }

    pub fn magnitudes(&self) -> &[f64] {
        &self.magnitudes
    }

    pub fn len(&self) -> usize {
        self.frequencies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frequencies.is_empty()
    }

    pub fn pairs(&self) -> impl Iterator<Item = (f64, f64)> + '_ {
        self.frequencies
            .iter()
            .copied()
            .zip(self.magnitudes.iter().copied())
    }
}

/// Reference magnitudes from a calibration sweep, ordered by frequency.
#[derive(Clone, Debug, PartialEq)]
pub struct CalibrationCurve {
    frequencies: Vec<f64>,
    magnitudes: Vec<f64>,
}

impl CalibrationCurve {
    pub fn new(frequencies: Vec<f64>, magnitudes: Vec<f64>) -> Result<Self, AnalysisError> {
        if frequencies.is_empty() {
            return Err(AnalysisError::EmptySweep);
        }
        if frequencies.len() != magnitudes.len() {
            return Err(AnalysisError::LengthMismatch {
                frequencies: frequencies.len(),
                magnitudes: magnitudes.len(),
            });
        }
        Ok(Self {
            frequencies,
            magnitudes,
        })
    }

    /// A flat baseline of 1.0 over the calibration range.
    pub fn unity() -> Self {
        let frequencies = SweepPlan::calibration().frequencies();
        let magnitudes = vec![1.0; frequencies.len()];
        Self {
            frequencies,
            magnitudes,
        }
    }

    pub fn frequencies(&self) -> &[f64] {
        &self.frequencies
    }

    pub fn magnitudes(&self) -> &[f64] {
        &self.magnitudes
    }

    pub fn len(&self) -> usize {
        self.frequencies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frequencies.is_empty()
    }

    /// Reference magnitude at the calibration bin nearest to `freq_mhz`,
    /// clamped to the first/last bin outside the calibrated range.
    pub fn magnitude_at(&self, freq_mhz: f64) -> f64 {
        let idx = self.frequencies.partition_point(|&f| f < freq_mhz);
        if idx == 0 {
            return self.magnitudes[0];
        }
        if idx >= self.frequencies.len() {
            return self.magnitudes[self.magnitudes.len() - 1];
        }
        let below = freq_mhz - self.frequencies[idx - 1];
        let above = self.frequencies[idx] - freq_mhz;
        if below <= above {
            self.magnitudes[idx - 1]
        } else {
            self.magnitudes[idx]
        }
    }

    /// Measured magnitude relative to the baseline. A zero baseline leaves the value unscaled.
    pub fn ratio(&self, freq_mhz: f64, measured: f64) -> f64 {
        let baseline = self.magnitude_at(freq_mhz);
        if baseline.abs() < f64::EPSILON {
            measured
        } else {
            measured / baseline
        }
    }

    pub fn normalize(&self, frequencies: &[f64], magnitudes: &[f64]) -> Vec<f64> {
        frequencies
            .iter()
            .zip(magnitudes)
            .map(|(&f, &m)| self.ratio(f, m))
            .collect()
    }
}

/// Operations every sweep backend provides, hardware or simulated.
pub trait SweepDevice: Send {
    fn configure(&mut self, start_mhz: f64, stop_mhz: f64) -> Result<(), SweepError>;
    fn take_scan(&mut self) -> Result<SweepSample, SweepError>;
    fn take_calibration_scan(&mut self) -> Result<CalibrationCurve, SweepError>;
    fn perform_handshake(&mut self) -> Result<bool, SweepError>;
    /// Install a previously stored calibration baseline.
    fn load_calibration(&mut self, curve: CalibrationCurve);
    fn close(&mut self);
}

/// Replays recorded sweeps in order, wrapping around at the end.
pub struct ReplayDevice {
    sweeps: Vec<SweepSample>,
    cursor: usize,
    calibration: Option<CalibrationCurve>,
    plan: Option<SweepPlan>,
    closed: bool,
}

impl ReplayDevice {
    pub fn new(sweeps: impl IntoIterator<Item = SweepSample>) -> Result<Self, SweepError> {
        let sweeps: Vec<SweepSample> = sweeps.into_iter().collect();
        if sweeps.is_empty() {
            return Err(SweepError::Fixture("no recorded sweeps to replay".into()));
        }
        Ok(Self {
            sweeps,
            cursor: 0,
            calibration: None,
            plan: None,
            closed: false,
        })
    }

    /// Load every sweep CSV in `dir`, ordered by file name.
    pub fn from_dir(dir: &Path) -> Result<Self, SweepError> {
        let mut paths: Vec<_> = std::fs::read_dir(dir)
            .map_err(|e| SweepError::Fixture(format!("{}: {e}", dir.display())))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("csv"))
            .collect();
        paths.sort();
        let mut sweeps = Vec::with_capacity(paths.len());
        for path in &paths {
            let sweep = crate::recorder::read_sweep_csv(path)
                .map_err(|e| SweepError::Fixture(format!("{}: {e:#}", path.display())))?;
            sweeps.push(sweep);
        }
        log::info!("loaded {} fixture sweeps from {}", sweeps.len(), dir.display());
        Self::new(sweeps)
    }
}

impl SweepDevice for ReplayDevice {
    fn configure(&mut self, start_mhz: f64, stop_mhz: f64) -> Result<(), SweepError> {
        self.plan = Some(SweepPlan::scan(start_mhz, stop_mhz)?);
        Ok(())
    }

    fn take_scan(&mut self) -> Result<SweepSample, SweepError> {
        if self.closed {
            return Err(SweepError::Closed);
        }
        let sweep = self.sweeps[self.cursor % self.sweeps.len()].clone();
        self.cursor += 1;
        Ok(sweep)
    }

    fn take_calibration_scan(&mut self) -> Result<CalibrationCurve, SweepError> {
        if self.closed {
            return Err(SweepError::Closed);
        }
        let curve = self.calibration.clone().unwrap_or_else(CalibrationCurve::unity);
        self.calibration = Some(curve.clone());
        Ok(curve)
    }

    fn perform_handshake(&mut self) -> Result<bool, SweepError> {
        Ok(!self.closed)
    }

    fn load_calibration(&mut self, curve: CalibrationCurve) {
        self.calibration = Some(curve);
    }

    fn close(&mut self) {
        self.closed = true;
    }
}

/// Gaussian resonance that drifts downward a little every scan, with bounded noise.
pub struct SyntheticDevice {
    plan: SweepPlan,
    centroid_mhz: f64,
    drift_mhz_per_scan: f64,
    amplitude: f64,
    width_mhz: f64,
    noise: f64,
    rng: StdRng,
    closed: bool,
}

impl SyntheticDevice {
    pub fn new(plan: SweepPlan, seed: u64) -> Self {
        Self {
            plan,
            centroid_mhz: (plan.start_mhz + plan.stop_mhz) / 2.0,
            drift_mhz_per_scan: 1e-4,
            amplitude: 1.0,
            width_mhz: (plan.stop_mhz - plan.start_mhz) / 20.0,
            noise: 0.02,
            rng: StdRng::seed_from_u64(seed),
            closed: false,
        }
    }

    pub fn with_drift(mut self, drift_mhz_per_scan: f64) -> Self {
        self.drift_mhz_per_scan = drift_mhz_per_scan;
        self
    }

    pub fn centroid_mhz(&self) -> f64 {
        self.centroid_mhz
    }
}

impl SweepDevice for SyntheticDevice {
    fn configure(&mut self, start_mhz: f64, stop_mhz: f64) -> Result<(), SweepError> {
        self.plan = SweepPlan::scan(start_mhz, stop_mhz)?;
        self.centroid_mhz = (start_mhz + stop_mhz) / 2.0;
        Ok(())
    }

    fn take_scan(&mut self) -> Result<SweepSample, SweepError> {
        if self.closed {
            return Err(SweepError::Closed);
        }
        let frequencies: Vec<f64> = self
            .plan
            .frequencies()
            .into_iter()
            .skip(LEADING_ARTIFACT_POINTS)
            .collect();
        let sweep = synthetic_sweep(
            &frequencies,
            self.centroid_mhz,
            self.amplitude,
            self.width_mhz,
            self.noise,
            &mut self.rng,
        );
        self.centroid_mhz -= self.drift_mhz_per_scan;
        Ok(sweep)
    }

    fn take_calibration_scan(&mut self) -> Result<CalibrationCurve, SweepError> {
        if self.closed {
            return Err(SweepError::Closed);
        }
        Ok(CalibrationCurve::unity())
    }

    fn perform_handshake(&mut self) -> Result<bool, SweepError> {
        Ok(!self.closed)
    }

    fn load_calibration(&mut self, _curve: CalibrationCurve) {}

    fn close(&mut self) {
        self.closed = true;
    }
}

/// Gaussian line shape plus uniform noise bounded by `noise * amplitude`.
pub fn synthetic_sweep(
    frequencies: &[f64],
    centroid: f64,
    amplitude: f64,
    sigma: f64,
    noise: f64,
    rng: &mut impl Rng,
) -> SweepSample {
    let magnitudes = frequencies
        .iter()
        .map(|&f| {
            let d = f - centroid;
            let jitter = if noise > 0.0 {
                rng.gen_range(-noise..noise) * amplitude
            } else {
                0.0
            };
            amplitude * (-d * d / (2.0 * sigma * sigma)).exp() + jitter
        })
        .collect();
    SweepSample {
        frequencies: frequencies.to_vec(),
        magnitudes,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plan_rejects_inverted_bounds() {
        assert!(matches!(
            SweepPlan::scan(6.0, 5.0),
            Err(SweepError::ConfigurationInvalid(_))
        ));
        assert!(matches!(
            SweepPlan::scan(5.0, 5.0),
            Err(SweepError::ConfigurationInvalid(_))
        ));
    }

    #[test]
    fn plan_rejects_ranges_consumed_by_artifact_strip() {
        assert!(SweepPlan::scan(5.0, 5.01).is_err());
        let plan = SweepPlan::scan(5.0, 6.5).unwrap();
        assert_eq!(plan.points, 1501);
        let freqs = plan.frequencies();
        assert!((freqs[0] - 5.0).abs() < 1e-12);
        assert!((freqs[1500] - 6.5).abs() < 1e-9);
    }

    #[test]
    fn calibration_lookup_is_nearest_and_clamped() {
        let curve = CalibrationCurve::new(vec![1.0, 2.0, 3.0], vec![10.0, 20.0, 30.0]).unwrap();
        assert_eq!(curve.magnitude_at(0.2), 10.0);
        assert_eq!(curve.magnitude_at(1.4), 10.0);
        assert_eq!(curve.magnitude_at(1.6), 20.0);
        assert_eq!(curve.magnitude_at(2.9), 30.0);
        assert_eq!(curve.magnitude_at(99.0), 30.0);
    }

    #[test]
    fn identical_sweep_has_unit_ratio() {
        let freqs: Vec<f64> = (0..50).map(|i| 5.0 + i as f64 * 0.01).collect();
        let mags: Vec<f64> = (0..50).map(|i| 0.5 + (i as f64 * 0.3).sin().abs()).collect();
        let curve = CalibrationCurve::new(freqs.clone(), mags.clone()).unwrap();
        for ratio in curve.normalize(&freqs, &mags) {
            assert!((ratio - 1.0).abs() < 1e-12);
        }
    }

    #[test]
    fn replay_device_wraps_around() {
        let a = SweepSample::new(vec![1.0], vec![1.0]).unwrap();
        let b = SweepSample::new(vec![2.0], vec![2.0]).unwrap();
        let mut dev = ReplayDevice::new(vec![a.clone(), b.clone()]).unwrap();
        assert_eq!(dev.take_scan().unwrap(), a);
        assert_eq!(dev.take_scan().unwrap(), b);
        assert_eq!(dev.take_scan().unwrap(), a);
        dev.close();
        assert!(matches!(dev.take_scan(), Err(SweepError::Closed)));
    }

    #[test]
    fn synthetic_device_drifts_down() {
        let plan = SweepPlan::scan(5.0, 6.0).unwrap();
        let mut dev = SyntheticDevice::new(plan, 7).with_drift(0.01);
        let before = dev.centroid_mhz();
        let sweep = dev.take_scan().unwrap();
        assert_eq!(sweep.len(), plan.points as usize - LEADING_ARTIFACT_POINTS);
        assert!(dev.centroid_mhz() < before);
    }
}
