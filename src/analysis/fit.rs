//! Bounded nonlinear least-squares fit of a single Gaussian
//! `a * exp(-(x - mu)^2 / (2 sigma^2))`.
//!
//! Levenberg-Marquardt with Marquardt diagonal scaling. Parameters held at a
//! bound by a gradient pointing out of the box are frozen for the step, the
//! remaining ones are solved for, and the trial point is projected back into
//! the box before it is evaluated.
use ndarray::{Array1, Array2};

use crate::analysis::linalg::solve;
use crate::drivers::error::FitError;

pub const MAX_ITERATIONS: usize = 200;
const MAX_DAMPING_TRIES: usize = 30;
const COST_TOLERANCE: f64 = 1e-12;
const STEP_TOLERANCE: f64 = 1e-10;
/// Cosine between the residual and any free Jacobian column below which the
/// fit is stationary.
const GRADIENT_TOLERANCE: f64 = 1e-10;
/// Smallest width allowed, relative to the x span of the data.
const MIN_RELATIVE_SIGMA: f64 = 1e-9;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Gaussian {
    pub amplitude: f64,
    pub centroid: f64,
    pub sigma: f64,
}

impl Gaussian {
    pub fn eval(&self, x: f64) -> f64 {
        let d = x - self.centroid;
        self.amplitude * (-d * d / (2.0 * self.sigma * self.sigma)).exp()
    }

    /// Full width at half maximum.
    pub fn fwhm(&self) -> f64 {
        2.0 * (2.0 * std::f64::consts::LN_2).sqrt() * self.sigma
    }

    fn to_array(self) -> [f64; 3] {
        [self.amplitude, self.centroid, self.sigma]
    }

    fn from_array(p: [f64; 3]) -> Self {
        Self {
            amplitude: p[0],
            centroid: p[1],
            sigma: p[2],
        }
    }

    /// Amplitude, centroid and width from the weighted first/second moments of
    /// `y - min(y)`. Used as a starting point for the fit.
    pub fn moment_estimate(x: &[f64], y: &[f64]) -> Option<Self> {
        let floor = y.iter().copied().fold(f64::INFINITY, f64::min);
        let (peak_idx, peak) = y
            .iter()
            .copied()
            .enumerate()
            .fold(None, |best: Option<(usize, f64)>, (i, v)| match best {
                Some((_, b)) if b >= v => best,
                _ => Some((i, v)),
            })?;
        let weights: Vec<f64> = y.iter().map(|v| (v - floor).max(0.0)).collect();
        let total: f64 = weights.iter().sum();
        if total <= 0.0 || !total.is_finite() {
            return None;
        }
        let mean = x.iter().zip(&weights).map(|(x, w)| x * w).sum::<f64>() / total;
        let var = x
            .iter()
            .zip(&weights)
            .map(|(x, w)| w * (x - mean) * (x - mean))
            .sum::<f64>()
            / total;
        Some(Self {
            amplitude: peak,
            centroid: x[peak_idx],
            sigma: var.sqrt(),
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct GaussianBounds {
    pub amplitude: (f64, f64),
    pub centroid: (f64, f64),
    pub sigma: (f64, f64),
}

impl GaussianBounds {
    fn lower(&self) -> [f64; 3] {
        [self.amplitude.0, self.centroid.0, self.sigma.0]
    }

    fn upper(&self) -> [f64; 3] {
        [self.amplitude.1, self.centroid.1, self.sigma.1]
    }
}

#[derive(Clone, Copy, Debug)]
pub struct GaussianFit {
    pub params: Gaussian,
    pub r_squared: f64,
    pub iterations: usize,
}

pub fn r_squared(x: &[f64], y: &[f64], model: &Gaussian) -> f64 {
    let n = y.len() as f64;
    let mean = y.iter().sum::<f64>() / n;
    let ss_tot: f64 = y.iter().map(|v| (v - mean) * (v - mean)).sum();
    let ss_res: f64 = x
        .iter()
        .zip(y)
        .map(|(&xi, &yi)| {
            let r = yi - model.eval(xi);
            r * r
        })
        .sum();
    if ss_tot <= 0.0 {
        if ss_res <= f64::EPSILON {
            1.0
        } else {
            0.0
        }
    } else {
        1.0 - ss_res / ss_tot
    }
}

struct Problem<'a> {
    x: Vec<f64>,
    y: &'a [f64],
    lower: [f64; 3],
    upper: [f64; 3],
}

impl Problem<'_> {
    fn project(&self, p: [f64; 3]) -> [f64; 3] {
        let mut out = p;
        for k in 0..3 {
            out[k] = p[k].max(self.lower[k]).min(self.upper[k]);
        }
        out
    }

    /// Parameters not pinned at a bound. `descent` is `J^T r`, the direction
    /// that lowers the cost.
    fn free_parameters(&self, p: [f64; 3], descent: &Array1<f64>) -> [bool; 3] {
        let mut free = [true; 3];
        for k in 0..3 {
            let pinned_low = p[k] <= self.lower[k] && descent[k] < 0.0;
            let pinned_high = p[k] >= self.upper[k] && descent[k] > 0.0;
            free[k] = !(pinned_low || pinned_high);
        }
        free
    }

    fn cost(&self, p: [f64; 3]) -> f64 {
        let g = Gaussian::from_array(p);
        self.x
            .iter()
            .zip(self.y)
            .map(|(&xi, &yi)| {
                let r = yi - g.eval(xi);
                r * r
            })
            .sum()
    }

    fn linearize(&self, p: [f64; 3]) -> (Array2<f64>, Array1<f64>) {
        let [a, mu, s] = p;
        let n = self.x.len();
        let mut jac = Array2::<f64>::zeros((n, 3));
        let mut resid = Array1::<f64>::zeros(n);
        for (i, (&xi, &yi)) in self.x.iter().zip(self.y).enumerate() {
            let d = xi - mu;
            let e = (-d * d / (2.0 * s * s)).exp();
            jac[[i, 0]] = e;
            jac[[i, 1]] = a * e * d / (s * s);
            jac[[i, 2]] = a * e * d * d / (s * s * s);
            resid[i] = yi - a * e;
        }
        (jac, resid)
    }
}

pub fn fit_gaussian(
    x: &[f64],
    y: &[f64],
    initial: Gaussian,
    bounds: GaussianBounds,
) -> Result<GaussianFit, FitError> {
    if x.len() != y.len() || x.len() < 3 {
        return Err(FitError::TooFewPoints {
            needed: 3,
            actual: x.len().min(y.len()),
        });
    }
    if x.iter().chain(y).any(|v| !v.is_finite()) {
        return Err(FitError::NonFinite);
    }
    // Work around the x mean so large absolute offsets (MHz, hours) don't hurt conditioning.
    let shift = x.iter().sum::<f64>() / x.len() as f64;
    let (xmin, xmax) = x
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)));
    let min_sigma = (MIN_RELATIVE_SIGMA * (xmax - xmin)).max(f64::MIN_POSITIVE);
    let mut lower = bounds.lower();
    let mut upper = bounds.upper();
    lower[1] -= shift;
    upper[1] -= shift;
    lower[2] = lower[2].max(min_sigma);
    upper[2] = upper[2].max(lower[2]);
    let problem = Problem {
        x: x.iter().map(|v| v - shift).collect(),
        y,
        lower,
        upper,
    };

    let mut start = initial.to_array();
    start[1] -= shift;
    let mut p = problem.project(start);
    let mut cost = problem.cost(p);
    if !cost.is_finite() {
        return Err(FitError::NonFinite);
    }
    let mut lambda = 1e-3;

    for iteration in 1..=MAX_ITERATIONS {
        let (jac, resid) = problem.linearize(p);
        let jtj = jac.t().dot(&jac);
        let jtr = jac.t().dot(&resid);
        let free = problem.free_parameters(p, &jtr);

        let resid_norm = resid.dot(&resid).sqrt();
        let stationary = (0..3)
            .filter(|&k| free[k])
            .all(|k| jtr[k].abs() <= GRADIENT_TOLERANCE * jtj[[k, k]].sqrt() * resid_norm);
        if stationary {
            return Ok(finish(p, shift, x, y, iteration));
        }

        let mut accepted = None;
        for _ in 0..MAX_DAMPING_TRIES {
            let mut damped = jtj.clone();
            let mut rhs = jtr.clone();
            for k in 0..3 {
                if free[k] {
                    damped[[k, k]] += lambda * jtj[[k, k]].max(1e-12);
                } else {
                    damped.row_mut(k).fill(0.0);
                    damped.column_mut(k).fill(0.0);
                    damped[[k, k]] = 1.0;
                    rhs[k] = 0.0;
                }
            }
            let Some(delta) = solve(damped, rhs) else {
                lambda *= 10.0;
                continue;
            };
            let trial = problem.project([p[0] + delta[0], p[1] + delta[1], p[2] + delta[2]]);
            let trial_cost = problem.cost(trial);
            if trial_cost.is_finite() && trial_cost <= cost {
                lambda = (lambda / 10.0).max(1e-12);
                accepted = Some((trial, trial_cost));
                break;
            }
            lambda *= 10.0;
        }

        // No downhill step exists even with heavy damping: we are at a (bounded) minimum.
        let Some((trial, trial_cost)) = accepted else {
            return Ok(finish(p, shift, x, y, iteration));
        };
        let cost_drop = cost - trial_cost;
        let small_step = (0..3)
            .all(|k| (trial[k] - p[k]).abs() <= STEP_TOLERANCE * (p[k].abs() + STEP_TOLERANCE));
        p = trial;
        cost = trial_cost;
        if cost_drop <= COST_TOLERANCE * cost.max(f64::MIN_POSITIVE) || small_step {
            return Ok(finish(p, shift, x, y, iteration));
        }
    }
    Err(FitError::NoConvergence(MAX_ITERATIONS))
}

fn finish(
    p: [f64; 3],
    shift: f64,
    x: &[f64],
    y: &[f64],
    iterations: usize,
) -> GaussianFit {
    let params = Gaussian::from_array([p[0], p[1] + shift, p[2]]);
    GaussianFit {
        params,
        r_squared: r_squared(x, y, &params),
        iterations,
    }
}
