//! Foreground masks and automatic mask estimation.
//!
//! Masks only restrict where the metric samples; they never alter
//! intensities.

use crate::image::interp::nearest_offset;
use crate::image::{Geometry, Image};
use crate::util::{PanelRegError, PanelRegResult};
use nalgebra::Vector3;
use std::collections::VecDeque;

/// Binary mask aligned with an image geometry (0 excluded, non-zero included).
#[derive(Clone, Debug, PartialEq)]
pub struct Mask {
    data: Vec<u8>,
    geometry: Geometry,
}

impl Mask {
    /// Wraps a mask buffer; its length must match the geometry.
    pub fn new(data: Vec<u8>, geometry: Geometry) -> PanelRegResult<Self> {
        let needed = geometry.num_samples();
        if data.len() != needed {
            return Err(PanelRegError::BufferSizeMismatch {
                needed,
                got: data.len(),
            });
        }
        Ok(Self { data, geometry })
    }

    /// Mask including every sample.
    pub fn full(geometry: Geometry) -> Self {
        let data = vec![1u8; geometry.num_samples()];
        Self { data, geometry }
    }

    /// Returns the mask buffer.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Returns the mask geometry.
    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    /// Fraction of included samples.
    pub fn coverage(&self) -> f64 {
        if self.data.is_empty() {
            return 0.0;
        }
        let included = self.data.iter().filter(|&&v| v != 0).count();
        included as f64 / self.data.len() as f64
    }

    /// Returns true when every sample is included.
    pub fn is_full(&self) -> bool {
        self.data.iter().all(|&v| v != 0)
    }

    /// Tests the sample nearest to a physical point; outside the grid is excluded.
    #[inline]
    pub fn contains_point(&self, point: &Vector3<f64>) -> bool {
        let idx = self.geometry.physical_to_index(point);
        nearest_offset(&self.geometry, &idx).is_some_and(|offset| self.data[offset] != 0)
    }
}

/// Foreground classification rule.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum MaskMethod {
    /// Otsu threshold on a 256-bin histogram.
    #[default]
    Otsu,
    /// Every non-zero sample is foreground.
    NonZero,
}

/// Automask parameters.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct AutomaskConfig {
    /// When false, masks include every sample.
    pub enabled: bool,
    /// Foreground rule.
    pub method: MaskMethod,
    /// Box radius of the speckle-removing opening.
    pub opening_radius: usize,
    /// Box radius of the final dilation.
    pub dilation_radius: usize,
}

impl Default for AutomaskConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            method: MaskMethod::Otsu,
            opening_radius: 1,
            dilation_radius: 2,
        }
    }
}

/// Derives masks that suppress background and border-connected empty space.
#[derive(Clone, Debug, Default)]
pub struct Automasker {
    config: AutomaskConfig,
}

impl Automasker {
    /// Creates an automasker.
    pub fn new(config: AutomaskConfig) -> Self {
        Self { config }
    }

    /// Computes the mask for `image`.
    ///
    /// Never fails: a disabled masker, a flat image or an empty foreground all
    /// yield a full mask.
    pub fn compute(&self, image: &Image) -> Mask {
        let geometry = image.geometry().clone();
        if !self.config.enabled || image.is_uniform() {
            return Mask::full(geometry);
        }

        let mut fg: Vec<u8> = match self.config.method {
            MaskMethod::Otsu => {
                let threshold = otsu_threshold(image.data());
                image.data().iter().map(|&v| (v > threshold) as u8).collect()
            }
            MaskMethod::NonZero => image.data().iter().map(|&v| (v != 0.0) as u8).collect(),
        };
        fill_holes(&mut fg, &geometry);
        let size = geometry.size3();
        let dim = geometry.dim();
        let r = self.config.opening_radius;
        if r > 0 {
            fg = box_filter(&fg, size, dim, r, Morph::Erode);
            fg = box_filter(&fg, size, dim, r, Morph::Dilate);
        }
        if self.config.dilation_radius > 0 {
            fg = box_filter(&fg, size, dim, self.config.dilation_radius, Morph::Dilate);
        }

        if fg.iter().all(|&v| v == 0) {
            return Mask::full(geometry);
        }
        Mask { data: fg, geometry }
    }
}

/// Otsu threshold over a 256-bin histogram spanning the value range.
///
/// Returns the upper edge of the last background bin.
pub(crate) fn otsu_threshold(values: &[f32]) -> f32 {
    const BINS: usize = 256;
    let (min, max) = values
        .iter()
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| {
            (lo.min(v), hi.max(v))
        });
    let range = max - min;
    if !(range.is_finite() && range > 0.0) {
        return min;
    }
    let scale = BINS as f32 / range;
    let mut hist = [0u64; BINS];
    for &v in values {
        let b = (((v - min) * scale) as usize).min(BINS - 1);
        hist[b] += 1;
    }

    let total = values.len() as f64;
    let sum_all: f64 = hist.iter().enumerate().map(|(i, &h)| i as f64 * h as f64).sum();
    let mut w_bg = 0.0f64;
    let mut sum_bg = 0.0f64;
    let mut best = (f64::NEG_INFINITY, 0usize);
    for (k, &h) in hist.iter().enumerate().take(BINS - 1) {
        w_bg += h as f64;
        sum_bg += k as f64 * h as f64;
        let w_fg = total - w_bg;
        if w_bg == 0.0 || w_fg == 0.0 {
            continue;
        }
        let mean_bg = sum_bg / w_bg;
        let mean_fg = (sum_all - sum_bg) / w_fg;
        let between = w_bg * w_fg * (mean_bg - mean_fg).powi(2);
        if between > best.0 {
            best = (between, k);
        }
    }
    min + (best.1 + 1) as f32 / scale
}

/// Includes excluded regions that do not touch the grid border.
fn fill_holes(mask: &mut [u8], geometry: &Geometry) {
    let [nx, ny, nz] = geometry.size3();
    let dim = geometry.dim();
    let mut reached = vec![false; mask.len()];
    let mut queue = VecDeque::new();

    let on_border = |x: usize, y: usize, z: usize| {
        x == 0 || y == 0 || x + 1 == nx || y + 1 == ny || (dim == 3 && (z == 0 || z + 1 == nz))
    };
    for z in 0..nz {
        for y in 0..ny {
            for x in 0..nx {
                let i = geometry.offset(x, y, z);
                if mask[i] == 0 && on_border(x, y, z) {
                    reached[i] = true;
                    queue.push_back((x, y, z));
                }
            }
        }
    }

    while let Some((x, y, z)) = queue.pop_front() {
        let mut visit = |x: usize, y: usize, z: usize| {
            let i = geometry.offset(x, y, z);
            if mask[i] == 0 && !reached[i] {
                reached[i] = true;
                queue.push_back((x, y, z));
            }
        };
        if x > 0 {
            visit(x - 1, y, z);
        }
        if x + 1 < nx {
            visit(x + 1, y, z);
        }
        if y > 0 {
            visit(x, y - 1, z);
        }
        if y + 1 < ny {
            visit(x, y + 1, z);
        }
        if dim == 3 {
            if z > 0 {
                visit(x, y, z - 1);
            }
            if z + 1 < nz {
                visit(x, y, z + 1);
            }
        }
    }

    for (value, &outside) in mask.iter_mut().zip(reached.iter()) {
        if *value == 0 && !outside {
            *value = 1;
        }
    }
}

#[derive(Clone, Copy)]
enum Morph {
    Erode,
    Dilate,
}

/// Separable box erosion or dilation with replicated borders.
fn box_filter(src: &[u8], size: [usize; 3], dim: usize, radius: usize, op: Morph) -> Vec<u8> {
    let [nx, ny, _] = size;
    let mut data = src.to_vec();
    for axis in 0..dim {
        let n = size[axis];
        let stride = match axis {
            0 => 1,
            1 => nx,
            _ => nx * ny,
        };
        let prev = data.clone();
        for (i, out) in data.iter_mut().enumerate() {
            let pos = match axis {
                0 => i % nx,
                1 => (i / nx) % ny,
                _ => i / (nx * ny),
            };
            let base = i - pos * stride;
            let lo = pos.saturating_sub(radius);
            let hi = (pos + radius).min(n - 1);
            let mut acc = match op {
                Morph::Erode => 1u8,
                Morph::Dilate => 0u8,
            };
            for k in lo..=hi {
                let v = (prev[base + k * stride] != 0) as u8;
                acc = match op {
                    Morph::Erode => acc.min(v),
                    Morph::Dilate => acc.max(v),
                };
            }
            *out = acc;
        }
    }
    data
}

#[cfg(test)]
mod tests {
    use super::{otsu_threshold, AutomaskConfig, Automasker, Mask, MaskMethod};
    use crate::image::{Geometry, Image};
    use nalgebra::Vector3;

    fn enabled(method: MaskMethod) -> Automasker {
        Automasker::new(AutomaskConfig {
            enabled: true,
            method,
            ..AutomaskConfig::default()
        })
    }

    #[test]
    fn otsu_splits_bimodal_values() {
        let mut values = vec![10.0f32; 50];
        values.extend(vec![200.0f32; 50]);
        let t = otsu_threshold(&values);
        assert!(t > 10.0 && t < 200.0);
    }

    #[test]
    fn disabled_or_flat_gives_full_mask() {
        let geom = Geometry::unit(&[8, 8]).unwrap();
        let img = Image::from_fn(geom.clone(), |x, _, _| x as f32);
        assert!(Automasker::default().compute(&img).is_full());
        let flat = Image::filled(geom, 5.0);
        assert!(enabled(MaskMethod::Otsu).compute(&flat).is_full());
    }

    #[test]
    fn fills_interior_holes_but_not_border_background() {
        let geom = Geometry::unit(&[20, 20]).unwrap();
        let img = Image::from_fn(geom, |x, y, _| {
            let inside = (4..16).contains(&x) && (4..16).contains(&y);
            let hole = (9..11).contains(&x) && (9..11).contains(&y);
            if inside && !hole {
                100.0
            } else {
                0.0
            }
        });
        let masker = Automasker::new(AutomaskConfig {
            enabled: true,
            method: MaskMethod::NonZero,
            opening_radius: 0,
            dilation_radius: 0,
        });
        let mask = masker.compute(&img);
        let at = |x: usize, y: usize| mask.data()[y * 20 + x];
        assert_eq!(at(10, 10), 1);
        assert_eq!(at(1, 1), 0);
        assert_eq!(at(4, 4), 1);
    }

    #[test]
    fn opening_removes_speckle_and_dilation_grows() {
        let geom = Geometry::unit(&[24, 24]).unwrap();
        let img = Image::from_fn(geom, |x, y, _| {
            if (8..16).contains(&x) && (8..16).contains(&y) {
                50.0
            } else if x == 2 && y == 2 {
                50.0
            } else {
                0.0
            }
        });
        let mask = enabled(MaskMethod::NonZero).compute(&img);
        let at = |x: usize, y: usize| mask.data()[y * 24 + x];
        assert_eq!(at(2, 2), 0);
        assert_eq!(at(6, 6), 1);
        assert_eq!(at(5, 12), 0);
        assert!(mask.coverage() > 0.2);
    }

    #[test]
    fn contains_point_uses_physical_coordinates() {
        let geom = Geometry::unit(&[4, 4])
            .unwrap()
            .with_spacing(&[2.0, 2.0])
            .unwrap();
        let mut data = vec![0u8; 16];
        data[5] = 1;
        let mask = Mask::new(data, geom).unwrap();
        assert!(mask.contains_point(&Vector3::new(2.4, 1.8, 0.0)));
        assert!(!mask.contains_point(&Vector3::new(0.0, 0.0, 0.0)));
        assert!(!mask.contains_point(&Vector3::new(-5.0, 0.0, 0.0)));
    }
}
