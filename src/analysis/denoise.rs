//! Online outlier rejection for a `(time, value)` series.
//!
//! Both axes are standardized and a density-based clustering pass keeps only
//! "core" points: points with at least `min_neighbors` others (itself
//! included) within `radius`. Passes repeat on the survivors until nothing
//! else is dropped, so running the filter on its own output keeps every point.

/// Clustering thresholds for a series of a given length.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DensityParams {
    pub radius: f64,
    pub min_neighbors: usize,
}

/// Looser thresholds while the series is short, tighter once it is long.
pub fn params_for_len(len: usize) -> DensityParams {
    let (radius, min_neighbors) = match len {
        0..=9 => (3.0, 1),
        10..=49 => (1.0, 3),
        50..=199 => (0.5, 4),
        200..=999 => (0.25, 5),
        _ => (0.1, 5),
    };
    DensityParams {
        radius,
        min_neighbors,
    }
}

fn standardize(values: &[f64]) -> Vec<f64> {
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let var = values.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / n;
    let std = var.sqrt();
    values
        .iter()
        .map(|v| {
            let z = (v - mean) / std;
            if z.is_finite() {
                z
            } else {
                0.0
            }
        })
        .collect()
}

/// One clustering pass; returns positions (into `time`/`value`) of core points.
/// `time` must be non-decreasing.
fn core_points(time: &[f64], value: &[f64], params: DensityParams) -> Vec<usize> {
    let t = standardize(time);
    let v = standardize(value);
    let r2 = params.radius * params.radius;
    let mut cores = Vec::new();
    let mut lo = 0;
    for i in 0..t.len() {
        // Standardization preserves order, so neighbours lie in a contiguous time band.
        while t[i] - t[lo] > params.radius {
            lo += 1;
        }
        let mut count = 0;
        for j in lo..t.len() {
            let dt = t[j] - t[i];
            if dt > params.radius {
                break;
            }
            let dv = v[j] - v[i];
            if dt * dt + dv * dv <= r2 {
                count += 1;
            }
        }
        if count >= params.min_neighbors {
            cores.push(i);
        }
    }
    cores
}

/// Indices of retained points. Non-finite values are never retained.
pub fn denoise(time: &[f64], value: &[f64]) -> Vec<usize> {
    let mut kept: Vec<usize> = (0..time.len().min(value.len()))
        .filter(|&i| time[i].is_finite() && value[i].is_finite())
        .collect();
    while !kept.is_empty() {
        let t: Vec<f64> = kept.iter().map(|&i| time[i]).collect();
        let v: Vec<f64> = kept.iter().map(|&i| value[i]).collect();
        let survivors = core_points(&t, &v, params_for_len(kept.len()));
        if survivors.len() == kept.len() {
            break;
        }
        kept = survivors.into_iter().map(|pos| kept[pos]).collect();
    }
    kept
}
