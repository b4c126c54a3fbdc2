//! Shared helpers for unit tests.

use ndarray::Array2;
use statrs::distribution::{ContinuousCDF, Normal};

/// Deterministic Gaussian sample via inverse-CDF quantile sampling.
/// Exactly reproducible across runs, no RNG involved.
pub(crate) fn gaussian_sample(mean: f64, sd: f64, n: usize) -> Vec<f64> {
    let normal = Normal::new(mean, sd).unwrap();
    (0..n)
        .map(|i| normal.inverse_cdf((i as f64 + 0.5) / n as f64))
        .collect()
}

/// A noise column safe to pair with block-ordered signal columns: the
/// quantiles are dealt alternately to the two halves of the event order,
/// so the column restricted to either half still spans the whole
/// distribution instead of degenerating into a half-normal.
pub(crate) fn interleaved_noise(mean: f64, sd: f64, n: usize) -> Vec<f64> {
    let q = gaussian_sample(mean, sd, n);
    let half = n / 2;
    let mut out = vec![0.0; n];
    for i in 0..half {
        out[i] = q[2 * i];
    }
    for i in half..n {
        out[i] = q[2 * (i - half) + 1];
    }
    out
}

/// Assembles an event matrix (rows = events) from per-marker columns.
pub(crate) fn matrix_from_columns(columns: &[Vec<f64>]) -> Array2<f64> {
    let n = columns[0].len();
    Array2::from_shape_fn((n, columns.len()), |(i, j)| columns[j][i])
}
