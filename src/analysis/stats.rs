// src/analysis/stats.rs
use std::collections::VecDeque;

/// Fixed-size sliding window with a running mean.
pub struct WindowBuffer {
    buffer: VecDeque<f64>,
    capacity: usize,
}

impl WindowBuffer {
    pub fn new(size: usize) -> Self {
        Self {
            buffer: VecDeque::with_capacity(size),
            capacity: size.max(1),
        }
    }

    /// Push a value, evicting the oldest once the window is full.
    pub fn push(&mut self, val: f64) {
        if self.buffer.len() == self.capacity {
            self.buffer.pop_front();
        }
        self.buffer.push_back(val);
    }

    pub fn is_full(&self) -> bool {
        self.buffer.len() == self.capacity
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    pub fn mean(&self) -> Option<f64> {
        if self.buffer.is_empty() {
            return None;
        }
        Some(self.buffer.iter().sum::<f64>() / self.buffer.len() as f64)
    }
}

/// Least-squares slope of `y` against `x`. `None` for fewer than two points
/// or when every `x` is identical.
pub fn linear_slope(x: &[f64], y: &[f64]) -> Option<f64> {
    let n = x.len().min(y.len());
    if n < 2 {
        return None;
    }
    let mx = x[..n].iter().sum::<f64>() / n as f64;
    let my = y[..n].iter().sum::<f64>() / n as f64;
    let (sxy, sxx) = x[..n]
        .iter()
        .zip(&y[..n])
        .fold((0.0, 0.0), |(sxy, sxx), (xi, yi)| {
            (sxy + (xi - mx) * (yi - my), sxx + (xi - mx) * (xi - mx))
        });
    if sxx <= 0.0 {
        None
    } else {
        Some(sxy / sxx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_keeps_latest_values() {
        let mut w = WindowBuffer::new(3);
        for v in [1.0, 2.0, 3.0, 4.0] {
            w.push(v);
        }
        assert!(w.is_full());
        assert_eq!(w.mean(), Some(3.0));
    }

    #[test]
    fn slope_of_line() {
        let x = [0.0, 1.0, 2.0, 3.0];
        let y = [1.0, 3.0, 5.0, 7.0];
        assert!((linear_slope(&x, &y).unwrap() - 2.0).abs() < 1e-12);
        assert_eq!(linear_slope(&[1.0, 1.0], &[0.0, 2.0]), None);
        assert_eq!(linear_slope(&[1.0], &[0.0]), None);
    }
}
