//! Separable smoothing, block shrinking, projection and expansion.

use crate::image::interp::LinearStencil;
use crate::image::{Geometry, Image};
use crate::util::par::for_each_row;
use crate::util::{PanelRegError, PanelRegResult};
use nalgebra::{Matrix3, Vector3};

/// Reduction applied along the projection axis.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum ProjectionReduction {
    /// Maximum intensity projection.
    #[default]
    Max,
    /// Mean intensity projection.
    Mean,
}

/// Smooths with a Gaussian of standard deviation `sigma` in physical units.
///
/// Axes where the kernel would be narrower than a hundredth of a sample are
/// left untouched. Borders replicate the edge sample.
pub fn gaussian_smooth(image: &Image, sigma: f64) -> Image {
    if !(sigma.is_finite() && sigma > 0.0) {
        return image.clone();
    }
    let geometry = image.geometry();
    let mut data = image.data().to_vec();
    for axis in 0..geometry.dim() {
        let sigma_px = sigma / geometry.spacing3()[axis];
        if sigma_px < 0.01 || geometry.size3()[axis] < 2 {
            continue;
        }
        let kernel = gaussian_kernel(sigma_px);
        data = convolve_axis(&data, geometry.size3(), axis, &kernel);
    }
    Image::from_parts(data, geometry.clone())
}

fn gaussian_kernel(sigma_px: f64) -> Vec<f32> {
    let radius = (3.0 * sigma_px).ceil().max(1.0) as isize;
    let denom = 2.0 * sigma_px * sigma_px;
    let mut kernel: Vec<f64> = (-radius..=radius)
        .map(|k| (-((k * k) as f64) / denom).exp())
        .collect();
    let sum: f64 = kernel.iter().sum();
    for w in kernel.iter_mut() {
        *w /= sum;
    }
    kernel.into_iter().map(|w| w as f32).collect()
}

fn convolve_axis(src: &[f32], size: [usize; 3], axis: usize, kernel: &[f32]) -> Vec<f32> {
    let [nx, ny, _] = size;
    let n = size[axis] as isize;
    let radius = (kernel.len() / 2) as isize;
    let stride = match axis {
        0 => 1,
        1 => nx,
        _ => nx * ny,
    };
    let mut out = vec![0.0f32; src.len()];
    for_each_row(&mut out, nx, |row, dst| {
        let y = row % ny;
        let z = row / ny;
        for (x, value) in dst.iter_mut().enumerate() {
            let pos = [x, y, z][axis];
            let base = (z * ny + y) * nx + x - pos * stride;
            let mut acc = 0.0f32;
            for (k, &w) in kernel.iter().enumerate() {
                let p = (pos as isize + k as isize - radius).clamp(0, n - 1) as usize;
                acc += w * src[base + p * stride];
            }
            *value = acc;
        }
    });
    out
}

/// Averages non-overlapping blocks of `factors` samples.
///
/// Each factor is clamped to the axis length. The output geometry keeps the
/// physical position of every block center.
pub fn bin_shrink(image: &Image, factors: [usize; 3]) -> Image {
    let geometry = image.geometry();
    let (out_geom, f) = shrink_geometry(geometry, factors);
    if f == [1, 1, 1] {
        return image.clone();
    }
    let out_size = out_geom.size3();

    let src = image.data();
    let [onx, ony, _] = out_size;
    let norm = 1.0 / (f[0] * f[1] * f[2]) as f32;
    let mut data = vec![0.0f32; out_geom.num_samples()];
    for_each_row(&mut data, onx, |row, dst| {
        let oy = row % ony;
        let oz = row / ony;
        for (ox, value) in dst.iter_mut().enumerate() {
            let mut acc = 0.0f32;
            for dz in 0..f[2] {
                for dy in 0..f[1] {
                    let start = geometry.offset(ox * f[0], oy * f[1] + dy, oz * f[2] + dz);
                    acc += src[start..start + f[0]].iter().sum::<f32>();
                }
            }
            *value = acc * norm;
        }
    });
    Image::from_parts(data, out_geom)
}

/// Geometry of a block-shrunk grid together with the clamped factors.
pub(crate) fn shrink_geometry(geometry: &Geometry, factors: [usize; 3]) -> (Geometry, [usize; 3]) {
    let size = geometry.size3();
    let mut f = [1usize; 3];
    let mut out_size = size;
    for axis in 0..geometry.dim() {
        f[axis] = factors[axis].clamp(1, size[axis]);
        out_size[axis] = size[axis] / f[axis];
    }
    let mut spacing = geometry.spacing3();
    let mut first_center = Vector3::zeros();
    for axis in 0..3 {
        spacing[axis] *= f[axis] as f64;
        first_center[axis] = (f[axis] as f64 - 1.0) * 0.5;
    }
    let origin = geometry.index_to_physical(&first_center);
    let out_geom = Geometry::from_parts(
        geometry.dim(),
        out_size,
        spacing,
        [origin[0], origin[1], origin[2]],
        *geometry.direction(),
    );
    (out_geom, f)
}

/// Collapses a 3D image along `axis` into a 2D image.
///
/// The remaining axes keep their order, spacing and origin components; the
/// output direction is the identity.
pub fn project(image: &Image, axis: usize, reduction: ProjectionReduction) -> PanelRegResult<Image> {
    let geometry = image.geometry();
    if geometry.dim() != 3 {
        return Err(PanelRegError::InvalidDimension { dim: geometry.dim() });
    }
    if axis > 2 {
        return Err(PanelRegError::InvalidConfig {
            reason: "projection axis must be 0, 1 or 2",
        });
    }
    let keep: Vec<usize> = (0..3).filter(|&a| a != axis).collect();
    let size = geometry.size3();
    let spacing = geometry.spacing3();
    let origin = geometry.origin3();
    let out_geom = Geometry::from_parts(
        2,
        [size[keep[0]], size[keep[1]], 1],
        [spacing[keep[0]], spacing[keep[1]], 1.0],
        [origin[keep[0]], origin[keep[1]], 0.0],
        Matrix3::identity(),
    );

    let src = image.data();
    let depth = size[axis];
    let na = size[keep[0]];
    let mut data = vec![0.0f32; out_geom.num_samples()];
    for_each_row(&mut data, na, |b, dst| {
        for (a, value) in dst.iter_mut().enumerate() {
            let mut idx = [0usize; 3];
            idx[keep[0]] = a;
            idx[keep[1]] = b;
            let mut acc = match reduction {
                ProjectionReduction::Max => f32::NEG_INFINITY,
                ProjectionReduction::Mean => 0.0,
            };
            for k in 0..depth {
                idx[axis] = k;
                let v = src[geometry.offset(idx[0], idx[1], idx[2])];
                match reduction {
                    ProjectionReduction::Max => acc = acc.max(v),
                    ProjectionReduction::Mean => acc += v,
                }
            }
            *value = match reduction {
                ProjectionReduction::Max => acc,
                ProjectionReduction::Mean => acc / depth as f32,
            };
        }
    });
    Ok(Image::from_parts(data, out_geom))
}

/// Upsamples by integer `factors` using linear interpolation.
///
/// The expanded grid covers the same physical extent as the input.
pub fn expand(image: &Image, factors: [usize; 3]) -> Image {
    let geometry = image.geometry();
    let dim = geometry.dim();
    let size = geometry.size3();
    let mut f = [1usize; 3];
    f[..dim].copy_from_slice(&factors[..dim]);
    for v in f.iter_mut() {
        *v = (*v).max(1);
    }
    if f == [1, 1, 1] {
        return image.clone();
    }

    let mut out_size = size;
    let mut spacing = geometry.spacing3();
    let mut shift = Vector3::zeros();
    for axis in 0..dim {
        out_size[axis] = size[axis] * f[axis];
        spacing[axis] /= f[axis] as f64;
        shift[axis] = -(f[axis] as f64 - 1.0) / (2.0 * f[axis] as f64);
    }
    let origin = geometry.index_to_physical(&shift);
    let out_geom = Geometry::from_parts(
        dim,
        out_size,
        spacing,
        [origin[0], origin[1], origin[2]],
        *geometry.direction(),
    );

    let src = image.data();
    let [onx, ony, _] = out_size;
    let mut data = vec![0.0f32; out_geom.num_samples()];
    for_each_row(&mut data, onx, |row, dst| {
        let oy = row % ony;
        let oz = row / ony;
        for (ox, value) in dst.iter_mut().enumerate() {
            let out_idx = [ox, oy, oz];
            let mut idx = Vector3::zeros();
            for axis in 0..dim {
                let c = (out_idx[axis] as f64 + 0.5) / f[axis] as f64 - 0.5;
                idx[axis] = c.clamp(0.0, (size[axis] - 1) as f64);
            }
            *value = LinearStencil::at(geometry, &idx)
                .map(|s| s.apply(src))
                .unwrap_or(0.0);
        }
    });
    Image::from_parts(data, out_geom)
}

/// Linearly rescales values to `[0, 1]`; a constant input maps to zeros.
pub fn rescale_unit(values: &[f32]) -> Vec<f32> {
    let (min, max) = values
        .iter()
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| {
            (lo.min(v), hi.max(v))
        });
    let range = max - min;
    if !(range.is_finite() && range > 0.0) {
        return vec![0.0; values.len()];
    }
    values.iter().map(|&v| (v - min) / range).collect()
}
