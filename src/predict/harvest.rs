//! Harvest-time prediction from the smoothed growth-rate series.
//!
//! The growth-rate (derivative mean) curve of a culture rises to a peak and
//! decays. Each evaluation fits a Gaussian to that curve, proposes
//! `centroid + k * sigma` as the harvest time and, when the fit passes the
//! stability and timing gates, averages it into the reported prediction.
use log::debug;

use crate::analysis::fit::{fit_gaussian, Gaussian, GaussianBounds};
use crate::config::HarvestConfig;

/// Refined fits need at least this many points inside the coarse half-width.
pub const MIN_REFINED_POINTS: usize = 5;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HarvestPhase {
    NotTracking,
    Tracking,
    Trackable,
    Harvested,
}

/// Result of the two-pass fit.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PeakFit {
    pub centroid: f64,
    pub sigma: f64,
    pub r_squared: f64,
}

/// One logged evaluation.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FitRecord {
    pub time_hours: f64,
    pub fit: PeakFit,
    pub estimate: f64,
    pub accepted: bool,
}

/// Coarse fit over the whole history, then a refit over the points within
/// half the coarse FWHM of the coarse centroid. `None` on any fit failure or
/// when the refined window is too small.
pub fn two_pass_fit(time: &[f64], rate: &[f64]) -> Option<PeakFit> {
    let (coarse, _) = fit_rate(time, rate, None)?;
    let half_width = coarse.fwhm() / 2.0;
    let (t, r): (Vec<f64>, Vec<f64>) = time
        .iter()
        .zip(rate)
        .filter(|(t, _)| (**t - coarse.centroid).abs() <= half_width)
        .map(|(t, r)| (*t, *r))
        .unzip();
    if t.len() < MIN_REFINED_POINTS {
        debug!("harvest refit skipped: {} points in window", t.len());
        return None;
    }
    let (refined, r_squared) = fit_rate(&t, &r, Some(coarse))?;
    Some(PeakFit {
        centroid: refined.centroid,
        sigma: refined.sigma,
        r_squared,
    })
}

fn fit_rate(time: &[f64], rate: &[f64], initial: Option<Gaussian>) -> Option<(Gaussian, f64)> {
    let (first, last) = (*time.first()?, *time.last()?);
    let span = (last - first).abs();
    let peak = rate.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if !(span > 0.0) || !(peak > 0.0) {
        return None;
    }
    let initial = initial
        .or_else(|| Gaussian::moment_estimate(time, rate))
        .map(|g| Gaussian {
            sigma: if g.sigma > 0.0 { g.sigma } else { span / 4.0 },
            ..g
        })?;
    // The peak may still lie ahead of the newest point.
    let bounds = GaussianBounds {
        amplitude: (0.0, 2.0 * peak),
        centroid: (first - span, last + span),
        sigma: (0.0, 2.0 * span),
    };
    match fit_gaussian(time, rate, initial, bounds) {
        Ok(fit) => Some((fit.params, fit.r_squared)),
        Err(e) => {
            debug!("harvest fit failed: {e}");
            None
        }
    }
}

/// Per-reader harvest state: fit log, trackable estimates and the sticky
/// harvested flag.
pub struct HarvestPredictor {
    config: HarvestConfig,
    phase: HarvestPhase,
    log: Vec<FitRecord>,
    trackable: Vec<f64>,
    // Newest rate sample already fitted; unchanged input is not fitted twice.
    last_fitted: Option<f64>,
}

impl HarvestPredictor {
    pub fn new(config: HarvestConfig) -> Self {
        Self {
            config,
            phase: HarvestPhase::NotTracking,
            log: Vec::new(),
            trackable: Vec::new(),
            last_fitted: None,
        }
    }

    pub fn phase(&self) -> HarvestPhase {
        self.phase
    }

    pub fn is_harvested(&self) -> bool {
        self.phase == HarvestPhase::Harvested
    }

    /// Mean of the accepted estimates, in elapsed hours.
    pub fn prediction(&self) -> Option<f64> {
        if self.trackable.is_empty() {
            None
        } else {
            Some(self.trackable.iter().sum::<f64>() / self.trackable.len() as f64)
        }
    }

    pub fn log(&self) -> &[FitRecord] {
        &self.log
    }

    pub fn trackable(&self) -> &[f64] {
        &self.trackable
    }

    /// Evaluate against the derivative-mean series at `now_hours`.
    pub fn evaluate(&mut self, time: &[f64], rate: &[f64], now_hours: f64) -> HarvestPhase {
        if self.phase == HarvestPhase::Harvested {
            return self.phase;
        }
        let (t, r): (Vec<f64>, Vec<f64>) = time
            .iter()
            .zip(rate)
            .filter(|(t, r)| t.is_finite() && r.is_finite())
            .map(|(t, r)| (*t, *r))
            .unzip();
        if t.len() < self.config.min_points.max(MIN_REFINED_POINTS) {
            return self.phase;
        }
        if self.phase == HarvestPhase::NotTracking {
            self.phase = HarvestPhase::Tracking;
        }

        let latest = t.last().copied();
        if latest != self.last_fitted {
            self.last_fitted = latest;
            self.fit_latest(&t, &r, now_hours);
        }

        if let Some(mean) = self.prediction() {
            if now_hours >= mean {
                self.phase = HarvestPhase::Harvested;
            }
        }
        self.phase
    }

    fn fit_latest(&mut self, t: &[f64], r: &[f64], now_hours: f64) {
        if let Some(fit) = two_pass_fit(t, r) {
            let current_rate = r[r.len() - 1];
            let estimate = fit.centroid + self.config.k * fit.sigma;
            let accepted = self.accepts(&fit, estimate, now_hours, current_rate);
            self.log.push(FitRecord {
                time_hours: now_hours,
                fit,
                estimate,
                accepted,
            });
            if accepted {
                self.trackable.push(estimate);
                self.phase = HarvestPhase::Trackable;
            }
        }
    }

    fn accepts(&self, fit: &PeakFit, estimate: f64, now: f64, current_rate: f64) -> bool {
        let c = &self.config;
        let stable = fit.r_squared > c.r_squared_threshold;
        // Distance of (now, rate) from the line y = x.
        let distance = (now - current_rate).abs() / std::f64::consts::SQRT_2;
        let past_peak = distance > c.distance_threshold;
        let in_window =
            estimate >= now + c.min_lead_hours && estimate <= now + c.max_lead_hours;
        let timing = in_window
            || now > c.early_exclusion_hours
            || current_rate > c.fast_growth_override;
        stable && past_peak && timing
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MU: f64 = 30.0;
    const SIGMA: f64 = 5.0;

    fn rate_curve(until: f64) -> (Vec<f64>, Vec<f64>) {
        let time: Vec<f64> = (0..)
            .map(|i| i as f64 * 0.25)
            .take_while(|t| *t <= until)
            .collect();
        let rate = time
            .iter()
            .map(|t| 2.0 * (-(t - MU) * (t - MU) / (2.0 * SIGMA * SIGMA)).exp())
            .collect();
        (time, rate)
    }

    #[test]
    fn two_pass_fit_recovers_peak_shape() {
        let (t, r) = rate_curve(45.0);
        let fit = two_pass_fit(&t, &r).unwrap();
        assert!((fit.centroid - MU).abs() < 0.05);
        assert!((fit.sigma - SIGMA).abs() < 0.05);
        assert!(fit.r_squared > 0.99);
    }

    #[test]
    fn too_few_points_gives_no_estimate() {
        let t = [0.0, 1.0, 2.0, 3.0];
        let r = [0.1, 1.0, 0.9, 0.1];
        assert_eq!(two_pass_fit(&t, &r), None);
        let mut predictor = HarvestPredictor::new(HarvestConfig::default());
        assert_eq!(predictor.evaluate(&t, &r, 3.0), HarvestPhase::NotTracking);
    }

    #[test]
    fn predicts_peak_plus_k_sigma_then_harvests() {
        let config = HarvestConfig::default();
        let expected = MU + config.k * SIGMA;
        let mut predictor = HarvestPredictor::new(config);

        let (t, r) = rate_curve(35.0);
        assert_eq!(predictor.evaluate(&t, &r, 35.0), HarvestPhase::Trackable);
        let prediction = predictor.prediction().unwrap();
        assert!((prediction - expected).abs() < 0.5, "{prediction}");

        let (t, r) = rate_curve(45.0);
        assert_eq!(predictor.evaluate(&t, &r, 45.0), HarvestPhase::Harvested);
        assert!(predictor.is_harvested());
        assert_eq!(predictor.trackable().len(), 2);
    }

    #[test]
    fn unchanged_rates_are_fitted_once() {
        let mut predictor = HarvestPredictor::new(HarvestConfig::default());
        let (t, r) = rate_curve(35.0);
        for now in [35.0, 35.1, 35.2] {
            assert_eq!(predictor.evaluate(&t, &r, now), HarvestPhase::Trackable);
        }
        assert_eq!(predictor.trackable().len(), 1);
        assert_eq!(predictor.log().len(), 1);

        // The clock still moves on without new rates.
        let mean = predictor.prediction().unwrap();
        assert_eq!(predictor.evaluate(&t, &r, mean + 0.1), HarvestPhase::Harvested);
        assert_eq!(predictor.trackable().len(), 1);
    }

    #[test]
    fn harvested_is_sticky() {
        let mut predictor = HarvestPredictor::new(HarvestConfig::default());
        let (t, r) = rate_curve(45.0);
        predictor.evaluate(&t, &r, 45.0);
        assert!(predictor.is_harvested());
        let flat = vec![0.0; t.len()];
        assert_eq!(predictor.evaluate(&t, &flat, 46.0), HarvestPhase::Harvested);
        assert_eq!(predictor.evaluate(&[], &[], 0.0), HarvestPhase::Harvested);
    }

    #[test]
    fn rejected_fit_is_logged_but_not_averaged() {
        let config = HarvestConfig {
            r_squared_threshold: 1.1,
            ..Default::default()
        };
        let mut predictor = HarvestPredictor::new(config);
        let (t, r) = rate_curve(35.0);
        assert_eq!(predictor.evaluate(&t, &r, 35.0), HarvestPhase::Tracking);
        assert_eq!(predictor.log().len(), 1);
        assert!(!predictor.log()[0].accepted);
        assert_eq!(predictor.prediction(), None);
    }
}
