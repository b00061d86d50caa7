//! Continuous-index sampling of images.

use crate::image::Geometry;
use nalgebra::Vector3;

/// Tolerance for points that fall a hair outside the sample grid.
pub(crate) const BOUNDS_EPS: f64 = 1e-6;

/// Precomputed linear interpolation corners for one continuous index.
///
/// A stencil can be applied to several buffers sharing the same geometry,
/// which lets the metric sample an image and its gradients in one pass.
#[derive(Clone, Copy, Debug)]
pub(crate) struct LinearStencil {
    offsets: [usize; 8],
    weights: [f32; 8],
}

impl LinearStencil {
    /// Builds the stencil, or returns `None` when `index` lies outside the grid.
    pub(crate) fn at(geometry: &Geometry, index: &Vector3<f64>) -> Option<Self> {
        let size = geometry.size3();
        let dim = geometry.dim();
        let mut lo = [0usize; 3];
        let mut hi = [0usize; 3];
        let mut frac = [0.0f64; 3];
        for axis in 0..dim {
            let (i0, i1, f) = axis_bracket(index[axis], size[axis])?;
            lo[axis] = i0;
            hi[axis] = i1;
            frac[axis] = f;
        }

        let mut offsets = [0usize; 8];
        let mut weights = [0.0f32; 8];
        for corner in 0..8usize {
            let pick = |axis: usize| (corner >> axis) & 1 == 1;
            let mut w = 1.0f64;
            let mut idx = [0usize; 3];
            for axis in 0..3 {
                if pick(axis) {
                    idx[axis] = hi[axis];
                    w *= frac[axis];
                } else {
                    idx[axis] = lo[axis];
                    w *= 1.0 - frac[axis];
                }
            }
            offsets[corner] = geometry.offset(idx[0], idx[1], idx[2]);
            weights[corner] = w as f32;
        }
        Some(Self { offsets, weights })
    }

    /// Interpolates `data` at the stencil position.
    #[inline]
    pub(crate) fn apply(&self, data: &[f32]) -> f32 {
        let mut acc = 0.0f32;
        for (&offset, &w) in self.offsets.iter().zip(self.weights.iter()) {
            if w != 0.0 {
                acc += w * data[offset];
            }
        }
        acc
    }

    /// Corner offsets with non-zero weight.
    #[inline]
    pub(crate) fn corners(&self) -> impl Iterator<Item = (usize, f32)> + '_ {
        self.offsets
            .iter()
            .zip(self.weights.iter())
            .filter(|&(_, &w)| w != 0.0)
            .map(|(&offset, &w)| (offset, w))
    }
}

fn axis_bracket(c: f64, n: usize) -> Option<(usize, usize, f64)> {
    let max = (n - 1) as f64;
    if !c.is_finite() || c < -BOUNDS_EPS || c > max + BOUNDS_EPS {
        return None;
    }
    let c = c.clamp(0.0, max);
    let i0 = (c.floor() as usize).min(n - 1);
    let i1 = (i0 + 1).min(n - 1);
    Some((i0, i1, c - i0 as f64))
}

/// Nearest-neighbour lookup at a continuous index.
pub(crate) fn sample_nearest(
    geometry: &Geometry,
    data: &[f32],
    index: &Vector3<f64>,
) -> Option<f32> {
    nearest_offset(geometry, index).map(|offset| data[offset])
}

/// Buffer offset of the sample nearest to `index`.
pub(crate) fn nearest_offset(geometry: &Geometry, index: &Vector3<f64>) -> Option<usize> {
    let size = geometry.size3();
    let mut idx = [0usize; 3];
    for axis in 0..geometry.dim() {
        let c = index[axis];
        let max = (size[axis] - 1) as f64;
        if !c.is_finite() || c < -0.5 - BOUNDS_EPS || c > max + 0.5 + BOUNDS_EPS {
            return None;
        }
        idx[axis] = c.round().clamp(0.0, max) as usize;
    }
    Some(geometry.offset(idx[0], idx[1], idx[2]))
}

#[cfg(test)]
mod tests {
    use super::{nearest_offset, sample_nearest, LinearStencil};
    use crate::image::{Geometry, Image};
    use nalgebra::Vector3;

    fn sample_linear(geom: &Geometry, data: &[f32], index: &Vector3<f64>) -> Option<f32> {
        LinearStencil::at(geom, index).map(|s| s.apply(data))
    }

    #[test]
    fn linear_matches_plane() {
        let geom = Geometry::unit(&[6, 5, 4]).unwrap();
        let img = Image::from_fn(geom.clone(), |x, y, z| {
            (2 * x + 3 * y) as f32 - z as f32
        });
        let v = sample_linear(&geom, img.data(), &Vector3::new(1.5, 2.25, 0.5)).unwrap();
        assert!((v - (3.0 + 6.75 - 0.5)).abs() < 1e-5);
        assert!(sample_linear(&geom, img.data(), &Vector3::new(5.5, 0.0, 0.0)).is_none());
        assert!(sample_linear(&geom, img.data(), &Vector3::new(5.0, 4.0, 3.0)).is_some());
    }

    #[test]
    fn linear_2d_ignores_z() {
        let geom = Geometry::unit(&[4, 4]).unwrap();
        let img = Image::from_fn(geom.clone(), |x, _, _| x as f32);
        let v = sample_linear(&geom, img.data(), &Vector3::new(2.5, 1.0, 0.0)).unwrap();
        assert!((v - 2.5).abs() < 1e-6);
    }

    #[test]
    fn nearest_rounds_and_rejects_far_points() {
        let geom = Geometry::unit(&[4, 4]).unwrap();
        let img = Image::from_fn(geom.clone(), |x, y, _| (x + 10 * y) as f32);
        let v = sample_nearest(&geom, img.data(), &Vector3::new(1.6, 2.4, 0.0)).unwrap();
        assert_eq!(v, 22.0);
        assert!(nearest_offset(&geom, &Vector3::new(-0.7, 0.0, 0.0)).is_none());
        assert_eq!(nearest_offset(&geom, &Vector3::new(-0.4, 0.0, 0.0)), Some(0));
    }
}
