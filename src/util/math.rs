//! Mathematical helpers shared by the initializer and the optimizer.

use std::f64::consts::PI;

/// Wraps an angle in radians to the range [-pi, pi).
pub(crate) fn wrap_rad(angle: f64) -> f64 {
    let mut wrapped = angle % (2.0 * PI);
    if wrapped < -PI {
        wrapped += 2.0 * PI;
    }
    if wrapped >= PI {
        wrapped -= 2.0 * PI;
    }
    wrapped
}

/// Wraps an angle in degrees to the range [-180, 180).
pub(crate) fn wrap_deg(angle_deg: f64) -> f64 {
    let mut wrapped = angle_deg % 360.0;
    if wrapped < -180.0 {
        wrapped += 360.0;
    }
    if wrapped >= 180.0 {
        wrapped -= 360.0;
    }
    wrapped
}

/// Estimates the sub-sample peak offset for a quadratic fit.
///
/// Given samples at `x = -1, 0, +1` (`fm`, `f0`, `fp`), this returns the peak
/// offset `dx` in `[-1, 1]` when the fitted parabola is concave and stable.
pub(crate) fn quad_peak_offset_1d(fm: f64, f0: f64, fp: f64) -> Option<f64> {
    if !fm.is_finite() || !f0.is_finite() || !fp.is_finite() {
        return None;
    }

    let denom = fm - 2.0 * f0 + fp;
    if denom.abs() < 1e-12 || denom >= 0.0 {
        return None;
    }

    let dx = 0.5 * (fm - fp) / denom;
    if dx.is_finite() && dx.abs() <= 1.0 {
        Some(dx)
    } else {
        None
    }
}

/// Power-of-ten magnitude that brings the mean spacing near unit size.
pub(crate) fn spacing_magnitude(spacing: &[f64]) -> f64 {
    if spacing.is_empty() {
        return 1.0;
    }
    let mean = spacing.iter().sum::<f64>() / spacing.len() as f64;
    if !(mean.is_finite() && mean > 0.0) {
        return 1.0;
    }
    10f64.powf(mean.log10().round())
}

/// Population mean and variance of a slice.
pub(crate) fn mean_variance(values: &[f32]) -> (f64, f64) {
    if values.is_empty() {
        return (0.0, 0.0);
    }
    let mut sum = 0.0f64;
    let mut sum_sq = 0.0f64;
    for &v in values {
        let v = v as f64;
        sum += v;
        sum_sq += v * v;
    }
    let n = values.len() as f64;
    let mean = sum / n;
    (mean, (sum_sq / n - mean * mean).max(0.0))
}
