//! N-dimensional phase correlation.
//!
//! The correlation surface is the inverse FFT of the normalized cross-power
//! spectrum `M · conj(F) / |M · conj(F)|`. When `moving(x) = fixed(x − d)`
//! the surface peaks at `+d`.

use crate::util::math::quad_peak_offset_1d;
use rustfft::num_complex::Complex;
use rustfft::FftPlanner;
use std::f64::consts::PI;

/// Peak of a phase-correlation surface.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) struct PhasePeak {
    /// Sub-sample shift in index units per axis (`+d`).
    pub shift: [f64; 3],
    /// Height of the primary peak.
    pub peak: f64,
    /// Largest value outside the primary neighbourhood.
    pub second: f64,
}

impl PhasePeak {
    /// `min(peak / second, 10) / 10`.
    pub(crate) fn confidence(&self) -> f64 {
        if !(self.peak.is_finite() && self.peak > 0.0) {
            return 0.0;
        }
        let ratio = if self.second > 0.0 {
            self.peak / self.second
        } else {
            10.0
        };
        ratio.min(10.0) / 10.0
    }
}

/// Zero-padded complex volume with power-of-two extents.
struct Spectrum {
    dims: [usize; 3],
    data: Vec<Complex<f64>>,
}

impl Spectrum {
    fn from_real(values: &[f32], size: [usize; 3], dims: [usize; 3], window: &[Vec<f64>; 3]) -> Self {
        let mut data = vec![Complex::new(0.0, 0.0); dims[0] * dims[1] * dims[2]];
        for z in 0..size[2] {
            for y in 0..size[1] {
                for x in 0..size[0] {
                    let v = values[(z * size[1] + y) * size[0] + x] as f64;
                    let w = window[0][x] * window[1][y] * window[2][z];
                    data[(z * dims[1] + y) * dims[0] + x] = Complex::new(v * w, 0.0);
                }
            }
        }
        Self { dims, data }
    }

    fn transform(&mut self, planner: &mut FftPlanner<f64>, inverse: bool) {
        let [nx, ny, nz] = self.dims;
        for axis in 0..3 {
            let n = self.dims[axis];
            if n < 2 {
                continue;
            }
            let fft = if inverse {
                planner.plan_fft_inverse(n)
            } else {
                planner.plan_fft_forward(n)
            };
            let stride = match axis {
                0 => 1,
                1 => nx,
                _ => nx * ny,
            };
            let lines: Vec<usize> = match axis {
                0 => (0..ny * nz).map(|r| r * nx).collect(),
                1 => (0..nz)
                    .flat_map(|z| (0..nx).map(move |x| z * nx * ny + x))
                    .collect(),
                _ => (0..nx * ny).collect(),
            };
            let mut line = vec![Complex::new(0.0, 0.0); n];
            for start in lines {
                for (k, slot) in line.iter_mut().enumerate() {
                    *slot = self.data[start + k * stride];
                }
                fft.process(&mut line);
                for (k, value) in line.iter().enumerate() {
                    self.data[start + k * stride] = *value;
                }
            }
        }
    }
}

/// Separable Hann window over `n` samples.
fn hann(n: usize, enabled: bool) -> Vec<f64> {
    if !enabled || n < 2 {
        return vec![1.0; n];
    }
    (0..n)
        .map(|i| 0.5 - 0.5 * (2.0 * PI * i as f64 / (n - 1) as f64).cos())
        .collect()
}

/// Phase-correlates two equally sized buffers laid out x-fastest.
///
/// Returns `None` when the spectrum carries no energy.
pub(crate) fn phase_correlate(
    fixed: &[f32],
    moving: &[f32],
    size: [usize; 3],
    windowing: bool,
) -> Option<PhasePeak> {
    let dims = size.map(|n| n.max(1).next_power_of_two());
    let window = [
        hann(size[0], windowing),
        hann(size[1], windowing),
        hann(size[2], windowing),
    ];
    let mut planner = FftPlanner::new();
    let mut f = Spectrum::from_real(fixed, size, dims, &window);
    let mut m = Spectrum::from_real(moving, size, dims, &window);
    f.transform(&mut planner, false);
    m.transform(&mut planner, false);

    let products: Vec<Complex<f64>> = m
        .data
        .iter()
        .zip(f.data.iter())
        .map(|(mv, fv)| *mv * fv.conj())
        .collect();
    let max_magnitude = products.iter().map(|c| c.norm()).fold(0.0f64, f64::max);
    if !(max_magnitude.is_finite() && max_magnitude > 1e-20) {
        return None;
    }
    // bins far below the strongest one carry rounding noise only
    let floor = max_magnitude * 1e-6;
    for (slot, product) in m.data.iter_mut().zip(products.iter()) {
        *slot = *product / (product.norm() + floor);
    }
    m.transform(&mut planner, true);
    let total = (dims[0] * dims[1] * dims[2]) as f64;
    let surface: Vec<f64> = m.data.iter().map(|c| c.re / total).collect();
    locate_peak(&surface, dims)
}

fn locate_peak(surface: &[f64], dims: [usize; 3]) -> Option<PhasePeak> {
    let (best, &peak) = surface
        .iter()
        .enumerate()
        .max_by(|a, b| a.1.total_cmp(b.1).then_with(|| b.0.cmp(&a.0)))?;
    if !peak.is_finite() {
        return None;
    }
    let [nx, ny, _] = dims;
    let pos = [best % nx, (best / nx) % ny, best / (nx * ny)];

    let radius = dims.map(|n| (n / 8).max(1));
    let mut second = f64::NEG_INFINITY;
    for (i, &v) in surface.iter().enumerate() {
        let p = [i % nx, (i / nx) % ny, i / (nx * ny)];
        let outside = (0..3).any(|a| {
            dims[a] > 1 && cyclic_distance(p[a], pos[a], dims[a]) > radius[a]
        });
        if outside && v > second {
            second = v;
        }
    }

    let at = |offset: [isize; 3]| {
        let mut idx = [0usize; 3];
        for a in 0..3 {
            let n = dims[a] as isize;
            idx[a] = (pos[a] as isize + offset[a]).rem_euclid(n) as usize;
        }
        surface[(idx[2] * ny + idx[1]) * nx + idx[0]]
    };
    let mut shift = [0.0f64; 3];
    for a in 0..3 {
        let n = dims[a];
        if n < 2 {
            continue;
        }
        let mut minus = [0isize; 3];
        let mut plus = [0isize; 3];
        minus[a] = -1;
        plus[a] = 1;
        let sub = if n >= 3 {
            quad_peak_offset_1d(at(minus), peak, at(plus)).unwrap_or(0.0)
        } else {
            0.0
        };
        let unwrapped = if pos[a] > n / 2 {
            pos[a] as f64 - n as f64
        } else {
            pos[a] as f64
        };
        shift[a] = unwrapped + sub;
    }
    Some(PhasePeak {
        shift,
        peak,
        second: second.max(0.0),
    })
}

fn cyclic_distance(a: usize, b: usize, n: usize) -> usize {
    let d = a.abs_diff(b);
    d.min(n - d)
}
