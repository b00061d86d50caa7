//! Scalar reference moment kernel.

use super::{MomentKernel, Moments};

/// Accumulates moments in `f64`, one pair at a time.
pub struct ScalarMoments;

impl MomentKernel for ScalarMoments {
    fn moments(fixed: &[f32], moving: &[f32]) -> Moments {
        let mut out = Moments::default();
        for (&f, &m) in fixed.iter().zip(moving.iter()) {
            let (f, m) = (f as f64, m as f64);
            out.n += 1;
            out.sum_f += f;
            out.sum_m += m;
            out.sum_ff += f * f;
            out.sum_mm += m * m;
            out.sum_fm += f * m;
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::ScalarMoments;
    use crate::metric::MomentKernel;

    #[test]
    fn sums_pairs() {
        let m = ScalarMoments::moments(&[1.0, 2.0, 3.0], &[2.0, 0.0, 1.0]);
        assert_eq!(m.n, 3);
        assert_eq!(m.sum_f, 6.0);
        assert_eq!(m.sum_m, 3.0);
        assert_eq!(m.sum_ff, 14.0);
        assert_eq!(m.sum_mm, 5.0);
        assert_eq!(m.sum_fm, 5.0);
    }
}
