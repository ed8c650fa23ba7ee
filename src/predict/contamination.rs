use log::warn;

use crate::analysis::stats::linear_slope;
use crate::config::ContaminationConfig;

/// Debounced slope-change detector over the raw frequency series.
pub struct ContaminationDetector {
    config: ContaminationConfig,
    consecutive: usize,
    contaminated: bool,
    // Time of the newest finite scan already counted.
    last_counted: Option<f64>,
}

impl ContaminationDetector {
    pub fn new(config: ContaminationConfig) -> Self {
        Self {
            config,
            consecutive: 0,
            contaminated: false,
            last_counted: None,
        }
    }

    pub fn is_contaminated(&self) -> bool {
        self.contaminated
    }

    pub fn consecutive(&self) -> usize {
        self.consecutive
    }

    /// Evaluate the newest scan. Missing points are skipped, and a series whose
    /// newest finite scan was already counted does not count again.
    pub fn evaluate(&mut self, time: &[f64], frequency: &[f64]) -> bool {
        if self.contaminated {
            return true;
        }
        let (t, f): (Vec<f64>, Vec<f64>) = time
            .iter()
            .zip(frequency)
            .filter(|(t, f)| t.is_finite() && f.is_finite())
            .map(|(t, f)| (*t, *f))
            .unzip();
        let n = self.config.window.max(2);
        if t.len() < self.config.min_points.max(2 * n) {
            return false;
        }
        let latest = t.last().copied();
        if latest == self.last_counted {
            return self.contaminated;
        }
        self.last_counted = latest;
        let cur = t.len() - n;
        let prev = cur - n;
        match (
            linear_slope(&t[cur..], &f[cur..]),
            linear_slope(&t[prev..cur], &f[prev..cur]),
        ) {
            (Some(current), Some(previous)) => self.record_slopes(current, previous),
            _ => self.contaminated,
        }
    }

    /// Count one scan with the given window slopes.
    pub fn record_slopes(&mut self, current: f64, previous: f64) -> bool {
        if self.contaminated {
            return true;
        }
        let suspicious = current.abs() > self.config.slope_ratio * previous.abs()
            && previous.abs() > self.config.slope_floor;
        if suspicious {
            self.consecutive += 1;
        } else {
            self.consecutive = 0;
        }
        if self.consecutive > self.config.consecutive_limit {
            warn!(
                "contamination flagged after {} suspicious scans (slope {current:.3e} vs {previous:.3e})",
                self.consecutive
            );
            self.contaminated = true;
        }
        self.contaminated
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STABLE: f64 = -0.001;
    const JUMP: f64 = -0.05;

    #[test]
    fn five_suspicious_scans_flag_contamination() {
        let mut detector = ContaminationDetector::new(ContaminationConfig::default());
        for _ in 0..4 {
            assert!(!detector.record_slopes(JUMP, STABLE));
        }
        assert!(detector.record_slopes(JUMP, STABLE));
        // Sticky.
        assert!(detector.record_slopes(STABLE, STABLE));
        assert!(detector.is_contaminated());
    }

    #[test]
    fn one_normal_scan_resets_the_count() {
        for gap in 1..5 {
            let mut detector = ContaminationDetector::new(ContaminationConfig::default());
            for i in 0..6 {
                if i == gap {
                    detector.record_slopes(STABLE, STABLE);
                } else {
                    detector.record_slopes(JUMP, STABLE);
                }
            }
            assert!(!detector.is_contaminated(), "normal scan at {gap}");
        }
    }

    #[test]
    fn noise_floor_suppresses_flat_baselines() {
        let mut detector = ContaminationDetector::new(ContaminationConfig::default());
        for _ in 0..10 {
            detector.record_slopes(JUMP, 1e-6);
        }
        assert!(!detector.is_contaminated());
    }

    #[test]
    fn series_needs_minimum_points_and_ignores_missing() {
        let mut detector = ContaminationDetector::new(ContaminationConfig::default());
        let t: Vec<f64> = (0..9).map(|i| i as f64).collect();
        let f: Vec<f64> = t.iter().map(|t| 5.6 + STABLE * t).collect();
        assert!(!detector.evaluate(&t, &f));
        assert_eq!(detector.consecutive(), 0);

        let mut t: Vec<f64> = (0..20).map(|i| i as f64).collect();
        let mut f: Vec<f64> = t.iter().map(|t| 5.6 + STABLE * t).collect();
        t.push(20.0);
        f.push(f64::NAN);
        assert!(!detector.evaluate(&t, &f));
        assert_eq!(detector.consecutive(), 0);
    }

    #[test]
    fn failed_scans_do_not_recount_the_last_window() {
        let mut detector = ContaminationDetector::new(ContaminationConfig::default());
        let mut t: Vec<f64> = (0..20).map(|i| i as f64).collect();
        let mut f: Vec<f64> = t.iter().map(|t| 5.6 + STABLE * t).collect();
        assert!(!detector.evaluate(&t, &f));
        t.push(20.0);
        f.push(f[19] - 0.5);
        detector.evaluate(&t, &f);
        assert_eq!(detector.consecutive(), 1);
        for i in 21..25 {
            t.push(i as f64);
            f.push(f64::NAN);
            assert!(!detector.evaluate(&t, &f));
        }
        assert_eq!(detector.consecutive(), 1);
    }

    #[test]
    fn sustained_slope_change_in_series_is_flagged() {
        let mut detector = ContaminationDetector::new(ContaminationConfig::default());
        let mut t = Vec::new();
        let mut f = Vec::new();
        let mut value = 5.6;
        for i in 0..40 {
            let slope = if i < 20 { STABLE } else { JUMP };
            value += slope;
            t.push(i as f64);
            f.push(value);
            detector.evaluate(&t, &f);
        }
        assert!(detector.is_contaminated());
    }
}
