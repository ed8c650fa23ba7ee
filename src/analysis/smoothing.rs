use ndarray::{Array1, Array2};

use crate::analysis::linalg::solve;

/// Window and order used on sweep magnitudes before the smoothed peak fit.
pub const SWEEP_WINDOW: usize = 101;
pub const SWEEP_ORDER: usize = 3;

/// Savitzky-Golay local polynomial smoother.
///
/// Interior points use the centered window; the first and last half-window
/// are taken from the polynomial fitted to the first/last full window.
#[derive(Clone, Debug)]
pub struct SavitzkyGolay {
    half_window: usize,
    // Row `r` evaluates the fitted window polynomial at window position `r`.
    projection: Array2<f64>,
}

impl SavitzkyGolay {
    /// `window` is rounded up to an odd length larger than `order + 1`.
    pub fn new(window: usize, order: usize) -> Self {
        let min_window = order + 2;
        let mut window = window.max(min_window);
        if window % 2 == 0 {
            window += 1;
        }
        let half_window = window / 2;
        Self {
            half_window,
            projection: projection_matrix(half_window, order),
        }
    }

    pub fn for_sweeps() -> Self {
        Self::new(SWEEP_WINDOW, SWEEP_ORDER)
    }

    pub fn window(&self) -> usize {
        2 * self.half_window + 1
    }

    /// Smoothed copy of `data`, or `data` unchanged when it is shorter than the window.
    pub fn apply(&self, data: &[f64]) -> Vec<f64> {
        let w = self.window();
        let n = data.len();
        if n < w {
            return data.to_vec();
        }
        let m = self.half_window;
        let weights = |row: usize, start: usize| -> f64 {
            self.projection
                .row(row)
                .iter()
                .zip(&data[start..start + w])
                .map(|(h, v)| h * v)
                .sum()
        };
        let mut out = Vec::with_capacity(n);
        for i in 0..n {
            let value = if i < m {
                weights(i, 0)
            } else if i >= n - m {
                weights(i - (n - w), n - w)
            } else {
                weights(m, i - m)
            };
            out.push(value);
        }
        out
    }
}

fn projection_matrix(half_window: usize, order: usize) -> Array2<f64> {
    let w = 2 * half_window + 1;
    let terms = order + 1;
    let scale = half_window.max(1) as f64;
    let vander = Array2::from_shape_fn((w, terms), |(r, k)| {
        let z = (r as f64 - half_window as f64) / scale;
        z.powi(k as i32)
    });
    let normal = vander.t().dot(&vander);
    // coeffs = (A^T A)^-1 A^T, one column per window position.
    let mut coeffs = Array2::<f64>::zeros((terms, w));
    for col in 0..w {
        let rhs: Array1<f64> = vander.row(col).to_owned();
        if let Some(c) = solve(normal.clone(), rhs) {
            coeffs.column_mut(col).assign(&c);
        }
    }
    vander.dot(&coeffs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_input_is_returned_unchanged() {
        let sg = SavitzkyGolay::for_sweeps();
        let data: Vec<f64> = (0..50).map(|i| (i as f64).sin()).collect();
        assert_eq!(sg.apply(&data), data);
    }

    #[test]
    fn preserves_polynomials_up_to_order() {
        let sg = SavitzkyGolay::new(11, 3);
        let data: Vec<f64> = (0..40)
            .map(|i| {
                let x = i as f64 * 0.1;
                1.0 - 2.0 * x + 0.5 * x * x - 0.1 * x * x * x
            })
            .collect();
        for (a, b) in sg.apply(&data).iter().zip(&data) {
            assert!((a - b).abs() < 1e-9, "{a} vs {b}");
        }
    }

    #[test]
    fn reduces_alternating_noise() {
        let sg = SavitzkyGolay::new(21, 2);
        let data: Vec<f64> = (0..200)
            .map(|i| 5.0 + if i % 2 == 0 { 0.5 } else { -0.5 })
            .collect();
        let smoothed = sg.apply(&data);
        let worst = smoothed[20..180]
            .iter()
            .map(|v| (v - 5.0).abs())
            .fold(0.0, f64::max);
        assert!(worst < 0.1);
    }

    #[test]
    fn even_window_is_made_odd() {
        assert_eq!(SavitzkyGolay::new(100, 3).window(), 101);
        assert_eq!(SavitzkyGolay::new(2, 3).window(), 5);
    }
}
