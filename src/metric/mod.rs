//! Masked normalized cross-correlation between a fixed and a moving level.
//!
//! Fixed samples are drawn once per level on a regular grid with a seeded
//! offset. Each evaluation maps the sample points through the transform,
//! interpolates the moving image linearly and skips samples that land
//! outside the moving image or its mask.

use crate::image::interp::LinearStencil;
use crate::image::{Geometry, Image};
use crate::mask::Mask;
use crate::transform::Transform;
use crate::util::{PanelRegError, PanelRegResult};
use nalgebra::{Matrix3, Vector3};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

pub mod scalar;
#[cfg(feature = "simd")]
pub mod simd;

/// Samples accumulated per reduction chunk; fixed so results do not depend
/// on the thread count.
const CHUNK: usize = 2048;

/// First and second order sums of paired samples.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Moments {
    /// Number of pairs.
    pub n: usize,
    /// Sum of fixed values.
    pub sum_f: f64,
    /// Sum of moving values.
    pub sum_m: f64,
    /// Sum of squared fixed values.
    pub sum_ff: f64,
    /// Sum of squared moving values.
    pub sum_mm: f64,
    /// Sum of products.
    pub sum_fm: f64,
}

impl Moments {
    /// Adds another set of sums.
    pub fn merge(&mut self, other: &Moments) {
        self.n += other.n;
        self.sum_f += other.sum_f;
        self.sum_m += other.sum_m;
        self.sum_ff += other.sum_ff;
        self.sum_mm += other.sum_mm;
        self.sum_fm += other.sum_fm;
    }

    /// Centered `(s_ff, s_mm, s_fm)`.
    pub fn centered(&self) -> (f64, f64, f64) {
        if self.n == 0 {
            return (0.0, 0.0, 0.0);
        }
        let n = self.n as f64;
        let sff = (self.sum_ff - self.sum_f * self.sum_f / n).max(0.0);
        let smm = (self.sum_mm - self.sum_m * self.sum_m / n).max(0.0);
        let sfm = self.sum_fm - self.sum_f * self.sum_m / n;
        (sff, smm, sfm)
    }

    /// Normalized correlation, or 0 when either side has no variance.
    pub fn ncc(&self) -> f64 {
        let (sff, smm, sfm) = self.centered();
        if sff <= VAR_EPS || smm <= VAR_EPS {
            return 0.0;
        }
        (sfm / (sff * smm).sqrt()).clamp(-1.0, 1.0)
    }
}

const VAR_EPS: f64 = 1e-12;

/// Sum kernel over paired sample buffers.
pub trait MomentKernel {
    /// Accumulates the moments of equally long buffers.
    fn moments(fixed: &[f32], moving: &[f32]) -> Moments;
}

#[inline]
fn kernel_moments(fixed: &[f32], moving: &[f32]) -> Moments {
    #[cfg(feature = "simd")]
    {
        <simd::SimdMoments as MomentKernel>::moments(fixed, moving)
    }
    #[cfg(not(feature = "simd"))]
    {
        <scalar::ScalarMoments as MomentKernel>::moments(fixed, moving)
    }
}

/// Metric value with its parameter gradient.
#[derive(Clone, Debug, PartialEq)]
pub struct MetricEvaluation {
    /// Normalized correlation in `[-1, 1]` (0 when undefined).
    pub value: f64,
    /// Derivative of `value` with respect to each transform parameter.
    pub gradient: Vec<f64>,
    /// Number of samples that contributed.
    pub valid: usize,
}

/// Per-chunk sums for the value and gradient.
#[derive(Clone, Debug)]
struct GradientSums {
    moments: Moments,
    /// `[Σ dm_k, Σ f dm_k, Σ m dm_k]` interleaved per parameter.
    terms: Vec<f64>,
}

impl GradientSums {
    fn new(n_params: usize) -> Self {
        Self {
            moments: Moments::default(),
            terms: vec![0.0; 3 * n_params],
        }
    }

    fn merge(&mut self, other: &GradientSums) {
        self.moments.merge(&other.moments);
        for (a, b) in self.terms.iter_mut().zip(other.terms.iter()) {
            *a += b;
        }
    }
}

/// Metric bound to one pyramid level.
#[derive(Clone, Debug)]
pub struct LevelMetric {
    points: Vec<Vector3<f64>>,
    fixed_values: Vec<f32>,
    fixed_geometry: Geometry,
    moving: Image,
    grad_to_physical: Matrix3<f64>,
    moving_mask: Option<Mask>,
    min_valid_fraction: f64,
}

impl LevelMetric {
    /// Draws fixed samples on a seeded regular stride over the included voxels.
    ///
    /// `sample_count` is clamped to the number of included fixed samples.
    /// An empty fixed mask yields `DegenerateImage`.
    pub fn new(
        fixed: &Image,
        fixed_mask: Option<&Mask>,
        moving: &Image,
        moving_mask: Option<&Mask>,
        sample_count: usize,
        seed: u64,
        min_valid_fraction: f64,
    ) -> PanelRegResult<Self> {
        let geometry = fixed.geometry();
        let [nx, ny, nz] = geometry.size3();
        let included = |x: usize, y: usize, z: usize| -> Option<Vector3<f64>> {
            let p = geometry.index_to_physical(&Vector3::new(x as f64, y as f64, z as f64));
            fixed_mask.map_or(true, |m| m.contains_point(&p)).then_some(p)
        };
        let total = match fixed_mask {
            None => nx * ny * nz,
            Some(_) => grid(geometry)
                .filter(|&(x, y, z)| included(x, y, z).is_some())
                .count(),
        };
        if total == 0 || sample_count == 0 {
            return Err(PanelRegError::DegenerateImage { stage: "metric" });
        }

        let count = sample_count.min(total);
        let stride = total as f64 / count as f64;
        let mut rng = StdRng::seed_from_u64(seed);
        let start: f64 = rng.random_range(0.0..stride);
        let target = |k: usize| ((start + k as f64 * stride) as usize).min(total - 1);

        let mut points = Vec::with_capacity(count);
        let mut fixed_values = Vec::with_capacity(count);
        let mut rank = 0usize;
        for (x, y, z) in grid(geometry) {
            if points.len() == count {
                break;
            }
            let Some(p) = included(x, y, z) else {
                continue;
            };
            if rank == target(points.len()) {
                points.push(p);
                fixed_values.push(fixed.data()[geometry.offset(x, y, z)]);
            }
            rank += 1;
        }

        let mg = moving.geometry();
        let spacing = mg.spacing3();
        let inv_spacing = Matrix3::from_diagonal(&Vector3::new(
            1.0 / spacing[0],
            1.0 / spacing[1],
            1.0 / spacing[2],
        ));
        Ok(Self {
            points,
            fixed_values,
            fixed_geometry: geometry.clone(),
            moving: moving.clone(),
            grad_to_physical: mg.direction() * inv_spacing,
            moving_mask: moving_mask.cloned(),
            min_valid_fraction,
        })
    }

    /// Number of fixed samples.
    pub fn sample_count(&self) -> usize {
        self.points.len()
    }

    /// Geometry of the fixed level.
    pub fn fixed_geometry(&self) -> &Geometry {
        &self.fixed_geometry
    }

    #[inline]
    fn lookup(&self, q: &Vector3<f64>) -> Option<LinearStencil> {
        if let Some(mask) = &self.moving_mask {
            if !mask.contains_point(q) {
                return None;
            }
        }
        let idx = self.moving.geometry().physical_to_index(q);
        LinearStencil::at(self.moving.geometry(), &idx)
    }

    /// Linearly interpolated moving gradient in index units.
    #[inline]
    fn moving_gradient(&self, stencil: &LinearStencil) -> Vector3<f64> {
        let geometry = self.moving.geometry();
        let data = self.moving.data();
        let mut acc = [0.0f32; 3];
        for (offset, w) in stencil.corners() {
            for (a, g) in acc.iter_mut().zip(voxel_gradient(geometry, data, offset)) {
                *a += w * g;
            }
        }
        Vector3::new(acc[0] as f64, acc[1] as f64, acc[2] as f64)
    }

    fn enough_valid(&self, valid: usize) -> bool {
        let needed = (self.min_valid_fraction * self.points.len() as f64).ceil() as usize;
        valid >= needed.max(2)
    }

    /// Normalized correlation only.
    pub fn value(&self, transform: &Transform) -> f64 {
        let (m, o) = transform.homogeneous();
        let mut fixed = Vec::with_capacity(self.points.len());
        let mut moving = Vec::with_capacity(self.points.len());
        for (p, &f) in self.points.iter().zip(self.fixed_values.iter()) {
            let q = m * p + o;
            if let Some(stencil) = self.lookup(&q) {
                fixed.push(f);
                moving.push(stencil.apply(self.moving.data()));
            }
        }
        if !self.enough_valid(fixed.len()) {
            return 0.0;
        }
        kernel_moments(&fixed, &moving).ncc()
    }

    /// Normalized correlation and its analytic gradient.
    pub fn evaluate(&self, transform: &Transform) -> MetricEvaluation {
        let n_params = transform.parameters().len();
        let derivatives = transform.linear_derivatives();
        let chunk_sums = |chunk: usize| -> GradientSums {
            let start = chunk * CHUNK;
            let end = (start + CHUNK).min(self.points.len());
            self.accumulate(transform, &derivatives, start..end, n_params)
        };
        let n_chunks = self.points.len().div_ceil(CHUNK);

        #[cfg(feature = "rayon")]
        let partials: Vec<GradientSums> = {
            use rayon::prelude::*;
            (0..n_chunks).into_par_iter().map(chunk_sums).collect()
        };
        #[cfg(not(feature = "rayon"))]
        let partials: Vec<GradientSums> = (0..n_chunks).map(chunk_sums).collect();

        let mut sums = GradientSums::new(n_params);
        for part in &partials {
            sums.merge(part);
        }
        self.finish(&sums, n_params)
    }

    fn accumulate(
        &self,
        transform: &Transform,
        derivatives: &[Matrix3<f64>],
        range: std::ops::Range<usize>,
        n_params: usize,
    ) -> GradientSums {
        let (m, o) = transform.homogeneous();
        let mut sums = GradientSums::new(n_params);
        let mut jac = vec![Vector3::zeros(); n_params];
        let data = self.moving.data();
        for i in range {
            let p = &self.points[i];
            let q = m * p + o;
            let Some(stencil) = self.lookup(&q) else {
                continue;
            };
            let f = self.fixed_values[i] as f64;
            let mv = stencil.apply(data) as f64;
            let g = self.grad_to_physical * self.moving_gradient(&stencil);
            transform.jacobian_into(derivatives, p, &mut jac);

            let mo = &mut sums.moments;
            mo.n += 1;
            mo.sum_f += f;
            mo.sum_m += mv;
            mo.sum_ff += f * f;
            mo.sum_mm += mv * mv;
            mo.sum_fm += f * mv;
            for (k, j) in jac.iter().enumerate() {
                let dm = g.dot(j);
                sums.terms[3 * k] += dm;
                sums.terms[3 * k + 1] += f * dm;
                sums.terms[3 * k + 2] += mv * dm;
            }
        }
        sums
    }

    fn finish(&self, sums: &GradientSums, n_params: usize) -> MetricEvaluation {
        let mo = &sums.moments;
        let mut out = MetricEvaluation {
            value: 0.0,
            gradient: vec![0.0; n_params],
            valid: mo.n,
        };
        if !self.enough_valid(mo.n) {
            return out;
        }
        let (sff, smm, sfm) = mo.centered();
        if sff <= VAR_EPS || smm <= VAR_EPS {
            return out;
        }
        let n = mo.n as f64;
        let root = (sff * smm).sqrt();
        out.value = (sfm / root).clamp(-1.0, 1.0);
        for k in 0..n_params {
            let s_dm = sums.terms[3 * k];
            let s_fdm = sums.terms[3 * k + 1];
            let s_mdm = sums.terms[3 * k + 2];
            let d_sfm = s_fdm - mo.sum_f * s_dm / n;
            let d_smm = 2.0 * (s_mdm - mo.sum_m * s_dm / n);
            out.gradient[k] = d_sfm / root - sfm * d_smm / (2.0 * sff.sqrt() * smm.powf(1.5));
        }
        out
    }

    /// Mean squared voxel shift per unit change of each parameter.
    pub fn parameter_scales(&self, transform: &Transform) -> Vec<f64> {
        let n_params = transform.parameters().len();
        let derivatives = transform.linear_derivatives();
        let spacing = self.fixed_geometry.spacing3();
        let mut jac = vec![Vector3::zeros(); n_params];
        let mut scales = vec![0.0f64; n_params];
        for p in &self.points {
            transform.jacobian_into(&derivatives, p, &mut jac);
            for (scale, j) in scales.iter_mut().zip(jac.iter()) {
                *scale += (0..3).map(|d| (j[d] / spacing[d]).powi(2)).sum::<f64>();
            }
        }
        let n = self.points.len().max(1) as f64;
        scales
            .into_iter()
            .map(|s| if s / n > 1e-12 { s / n } else { 1.0 })
            .collect()
    }

    /// Largest displacement, in fixed-level voxels, of any sample point under
    /// the linearized parameter change `delta`.
    pub fn max_voxel_shift(&self, transform: &Transform, delta: &[f64]) -> f64 {
        let derivatives = transform.linear_derivatives();
        let spacing = self.fixed_geometry.spacing3();
        let mut jac = vec![Vector3::zeros(); delta.len()];
        let mut max = 0.0f64;
        for p in &self.points {
            transform.jacobian_into(&derivatives, p, &mut jac);
            let mut shift: Vector3<f64> = Vector3::zeros();
            for (j, &d) in jac.iter().zip(delta.iter()) {
                shift += j * d;
            }
            let voxels = Vector3::new(
                shift[0] / spacing[0],
                shift[1] / spacing[1],
                shift[2] / spacing[2],
            );
            max = max.max(voxels.norm());
        }
        max
    }
}

/// Voxel indices in buffer order.
fn grid(geometry: &Geometry) -> impl Iterator<Item = (usize, usize, usize)> {
    let [nx, ny, nz] = geometry.size3();
    (0..nz).flat_map(move |z| (0..ny).flat_map(move |y| (0..nx).map(move |x| (x, y, z))))
}

/// Central-difference gradient in index units at one voxel (one-sided at
/// borders).
fn voxel_gradient(geometry: &Geometry, data: &[f32], offset: usize) -> [f32; 3] {
    let size = geometry.size3();
    let [nx, ny, _] = size;
    let pos = [offset % nx, (offset / nx) % ny, offset / (nx * ny)];
    let strides = [1, nx, nx * ny];
    let mut out = [0.0f32; 3];
    for axis in 0..geometry.dim() {
        let n = size[axis];
        if n < 2 {
            continue;
        }
        let stride = strides[axis];
        out[axis] = if pos[axis] == 0 {
            data[offset + stride] - data[offset]
        } else if pos[axis] + 1 == n {
            data[offset] - data[offset - stride]
        } else {
            0.5 * (data[offset + stride] - data[offset - stride])
        };
    }
    out
}

#[cfg(test)]
mod tests {
    use super::{voxel_gradient, LevelMetric, Moments};
    use crate::image::{Geometry, Image};
    use crate::mask::Mask;
    use crate::transform::Transform;

    fn blob_image(geom: &Geometry, cx: f64, cy: f64) -> Image {
        Image::from_fn(geom.clone(), |x, y, _| {
            let dx = x as f64 - cx;
            let dy = y as f64 - cy;
            ((-(dx * dx + dy * dy) / 50.0).exp()
                + 0.5 * (-((dx - 8.0).powi(2) + (dy + 4.0).powi(2)) / 30.0).exp()) as f32
        })
    }

    #[test]
    fn moments_ncc_of_affine_related_samples() {
        let mut m = Moments::default();
        for i in 0..10 {
            let f = i as f64;
            let v = 3.0 * f + 2.0;
            m.merge(&Moments {
                n: 1,
                sum_f: f,
                sum_m: v,
                sum_ff: f * f,
                sum_mm: v * v,
                sum_fm: f * v,
            });
        }
        assert!((m.ncc() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn self_correlation_is_one_and_gradient_vanishes() {
        let geom = Geometry::unit(&[48, 48]).unwrap();
        let img = blob_image(&geom, 24.0, 24.0);
        let metric = LevelMetric::new(&img, None, &img, None, 2000, 7, 0.1).unwrap();
        let t = Transform::translation(&[0.0, 0.0]).unwrap();
        let eval = metric.evaluate(&t);
        assert!((eval.value - 1.0).abs() < 1e-6);
        assert!(eval.gradient.iter().all(|g| g.abs() < 1e-3));
        assert!((metric.value(&t) - eval.value).abs() < 1e-5);
    }

    #[test]
    fn gradient_matches_finite_differences() {
        let geom = Geometry::unit(&[48, 48]).unwrap();
        let fixed = blob_image(&geom, 24.0, 24.0);
        let moving = blob_image(&geom, 26.0, 23.0);
        let metric = LevelMetric::new(&fixed, None, &moving, None, 2304, 1, 0.1).unwrap();
        let t = Transform::rigid_2d(0.02, [0.5, -0.3], [24.0, 24.0]).unwrap();
        let eval = metric.evaluate(&t);
        let h = [1e-4, 1e-3, 1e-3];
        for k in 0..3 {
            let mut plus = t.parameters().to_vec();
            let mut minus = plus.clone();
            plus[k] += h[k];
            minus[k] -= h[k];
            let fd = (metric.value(&t.with_parameters(&plus).unwrap())
                - metric.value(&t.with_parameters(&minus).unwrap()))
                / (2.0 * h[k]);
            let tol = 0.05 * fd.abs().max(eval.gradient[k].abs()) + 1e-3;
            assert!((fd - eval.gradient[k]).abs() < tol, "param {k}: {fd} vs {}", eval.gradient[k]);
        }
    }

    #[test]
    fn no_overlap_scores_zero() {
        let geom = Geometry::unit(&[32, 32]).unwrap();
        let img = blob_image(&geom, 16.0, 16.0);
        let metric = LevelMetric::new(&img, None, &img, None, 500, 3, 0.1).unwrap();
        let far = Transform::translation(&[100.0, 0.0]).unwrap();
        let eval = metric.evaluate(&far);
        assert_eq!(eval.value, 0.0);
        assert_eq!(eval.valid, 0);
        assert!(eval.gradient.iter().all(|&g| g == 0.0));
    }

    #[test]
    fn empty_fixed_mask_is_degenerate() {
        let geom = Geometry::unit(&[16, 16]).unwrap();
        let img = blob_image(&geom, 8.0, 8.0);
        let mask = Mask::new(vec![0; 256], geom).unwrap();
        assert!(LevelMetric::new(&img, Some(&mask), &img, None, 100, 0, 0.1).is_err());
    }

    #[test]
    fn masked_samples_stay_inside_the_mask() {
        let geom = Geometry::unit(&[16, 16]).unwrap();
        let img = blob_image(&geom, 8.0, 8.0);
        let bits = (0..256).map(|i| u8::from(i % 16 < 8)).collect();
        let mask = Mask::new(bits, geom).unwrap();
        let metric = LevelMetric::new(&img, Some(&mask), &img, None, 50, 11, 0.1).unwrap();
        assert_eq!(metric.sample_count(), 50);
        assert!(metric.points.iter().all(|p| p[0] < 7.5));
        assert!(metric.points.windows(2).all(|w| w[0] != w[1]));

        let all = LevelMetric::new(&img, Some(&mask), &img, None, 1000, 11, 0.1).unwrap();
        assert_eq!(all.sample_count(), 128);
    }

    #[test]
    fn gradients_of_ramp() {
        let geom = Geometry::unit(&[5, 4]).unwrap();
        let img = Image::from_fn(geom.clone(), |x, y, _| (2 * x + y) as f32);
        for offset in 0..img.data().len() {
            let g = voxel_gradient(&geom, img.data(), offset);
            assert!((g[0] - 2.0).abs() < 1e-6);
            assert!((g[1] - 1.0).abs() < 1e-6);
            assert_eq!(g[2], 0.0);
        }
    }

    #[test]
    fn scales_reflect_lever_arm() {
        let geom = Geometry::unit(&[32, 32]).unwrap();
        let img = blob_image(&geom, 16.0, 16.0);
        let metric = LevelMetric::new(&img, None, &img, None, 1024, 0, 0.1).unwrap();
        let t = Transform::rigid_2d(0.0, [0.0, 0.0], [15.5, 15.5]).unwrap();
        let scales = metric.parameter_scales(&t);
        assert!((scales[1] - 1.0).abs() < 1e-9);
        assert!(scales[0] > 50.0);
        let shift = metric.max_voxel_shift(&t, &[0.0, 3.0, 4.0]);
        assert!((shift - 5.0).abs() < 1e-9);
    }
}
