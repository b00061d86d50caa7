//! SIMD moment kernel using the `wide` crate.
//!
//! Pairs are processed eight at a time in `f32x8` lanes. Lane sums are
//! flushed to `f64` every block so long buffers keep their precision.

use super::{MomentKernel, Moments};
use wide::f32x8;

const LANES: usize = 8;
const BLOCK: usize = 1024;

#[inline]
fn load_f32x8(slice: &[f32]) -> f32x8 {
    f32x8::from([
        slice[0], slice[1], slice[2], slice[3], slice[4], slice[5], slice[6], slice[7],
    ])
}

#[inline]
fn hsum(v: f32x8) -> f64 {
    v.to_array().iter().map(|&x| x as f64).sum()
}

/// Vectorized counterpart of [`super::scalar::ScalarMoments`].
pub struct SimdMoments;

impl MomentKernel for SimdMoments {
    fn moments(fixed: &[f32], moving: &[f32]) -> Moments {
        let len = fixed.len().min(moving.len());
        let mut out = Moments {
            n: len,
            ..Moments::default()
        };
        let mut start = 0;
        while start < len {
            let end = (start + BLOCK).min(len);
            let simd_end = start + (end - start) / LANES * LANES;

            let mut f_vec = f32x8::ZERO;
            let mut m_vec = f32x8::ZERO;
            let mut ff_vec = f32x8::ZERO;
            let mut mm_vec = f32x8::ZERO;
            let mut fm_vec = f32x8::ZERO;
            let mut i = start;
            while i < simd_end {
                let f = load_f32x8(&fixed[i..]);
                let m = load_f32x8(&moving[i..]);
                f_vec += f;
                m_vec += m;
                ff_vec += f * f;
                mm_vec += m * m;
                fm_vec += f * m;
                i += LANES;
            }
            out.sum_f += hsum(f_vec);
            out.sum_m += hsum(m_vec);
            out.sum_ff += hsum(ff_vec);
            out.sum_mm += hsum(mm_vec);
            out.sum_fm += hsum(fm_vec);

            // scalar remainder
            while i < end {
                let (f, m) = (fixed[i] as f64, moving[i] as f64);
                out.sum_f += f;
                out.sum_m += m;
                out.sum_ff += f * f;
                out.sum_mm += m * m;
                out.sum_fm += f * m;
                i += 1;
            }
            start = end;
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::SimdMoments;
    use crate::metric::scalar::ScalarMoments;
    use crate::metric::MomentKernel;

    #[test]
    fn matches_scalar_kernel() {
        let fixed: Vec<f32> = (0..3001).map(|i| ((i * 37) % 101) as f32 / 100.0).collect();
        let moving: Vec<f32> = (0..3001).map(|i| ((i * 53) % 89) as f32 / 88.0).collect();
        let a = ScalarMoments::moments(&fixed, &moving);
        let b = SimdMoments::moments(&fixed, &moving);
        assert_eq!(a.n, b.n);
        assert!((a.sum_f - b.sum_f).abs() < 1e-2);
        assert!((a.sum_fm - b.sum_fm).abs() < 1e-2);
        assert!((a.ncc() - b.ncc()).abs() < 1e-5);
    }
}
