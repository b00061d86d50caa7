//! Images, physical geometry and channel sets.
//!
//! Every image is stored as a contiguous `f32` buffer with x varying fastest,
//! then y, then z. 2D images use the same layout with a single z slice, and
//! their geometry is embedded in 3D math with a unit z axis so transforms and
//! interpolation share one code path.

use crate::util::{PanelRegError, PanelRegResult};
use nalgebra::{Matrix3, Vector3};

pub mod filter;
pub(crate) mod interp;
#[cfg(feature = "image-io")]
pub mod io;
pub mod pyramid;

const GEOMETRY_TOL: f64 = 1e-6;

/// Physical layout of a sample grid.
#[derive(Clone, Debug, PartialEq)]
pub struct Geometry {
    dim: usize,
    size: [usize; 3],
    spacing: [f64; 3],
    origin: [f64; 3],
    direction: Matrix3<f64>,
    to_physical: Matrix3<f64>,
    to_index: Matrix3<f64>,
}

impl Geometry {
    /// Creates a geometry with unit spacing, zero origin and identity direction.
    pub fn unit(size: &[usize]) -> PanelRegResult<Self> {
        let dim = size.len();
        if dim != 2 && dim != 3 {
            return Err(PanelRegError::InvalidDimension { dim });
        }
        let mut full = [1usize; 3];
        for (axis, &len) in size.iter().enumerate() {
            if len == 0 {
                return Err(PanelRegError::InvalidConfig {
                    reason: "image size must be non-zero along every axis",
                });
            }
            full[axis] = len;
        }
        Ok(Self::from_parts(
            dim,
            full,
            [1.0; 3],
            [0.0; 3],
            Matrix3::identity(),
        ))
    }

    /// Returns a copy with the given per-axis spacing.
    pub fn with_spacing(&self, spacing: &[f64]) -> PanelRegResult<Self> {
        self.check_len(spacing.len())?;
        let mut full = [1.0f64; 3];
        for (axis, &s) in spacing.iter().enumerate() {
            if !(s.is_finite() && s > 0.0) {
                return Err(PanelRegError::InvalidSpacing { axis, spacing: s });
            }
            full[axis] = s;
        }
        Ok(Self::from_parts(
            self.dim,
            self.size,
            full,
            self.origin,
            self.direction,
        ))
    }

    /// Returns a copy with the given origin.
    pub fn with_origin(&self, origin: &[f64]) -> PanelRegResult<Self> {
        self.check_len(origin.len())?;
        if origin.iter().any(|v| !v.is_finite()) {
            return Err(PanelRegError::InvalidConfig {
                reason: "origin must be finite",
            });
        }
        let mut full = [0.0f64; 3];
        full[..origin.len()].copy_from_slice(origin);
        Ok(Self::from_parts(
            self.dim,
            self.size,
            self.spacing,
            full,
            self.direction,
        ))
    }

    /// Returns a copy with the given row-major `dim x dim` direction matrix.
    pub fn with_direction(&self, direction: &[f64]) -> PanelRegResult<Self> {
        let d = self.dim;
        if direction.len() != d * d {
            return Err(PanelRegError::InvalidDirection);
        }
        let mut m = Matrix3::identity();
        for r in 0..d {
            for c in 0..d {
                m[(r, c)] = direction[r * d + c];
            }
        }
        let gram = m.transpose() * m;
        if (gram - Matrix3::identity()).abs().max() > GEOMETRY_TOL {
            return Err(PanelRegError::InvalidDirection);
        }
        Ok(Self::from_parts(
            self.dim,
            self.size,
            self.spacing,
            self.origin,
            m,
        ))
    }

    pub(crate) fn from_parts(
        dim: usize,
        size: [usize; 3],
        spacing: [f64; 3],
        origin: [f64; 3],
        direction: Matrix3<f64>,
    ) -> Self {
        let scale = Matrix3::from_diagonal(&Vector3::from(spacing));
        let inv_scale = Matrix3::from_diagonal(&Vector3::new(
            1.0 / spacing[0],
            1.0 / spacing[1],
            1.0 / spacing[2],
        ));
        Self {
            dim,
            size,
            spacing,
            origin,
            direction,
            to_physical: direction * scale,
            to_index: inv_scale * direction.transpose(),
        }
    }

    fn check_len(&self, len: usize) -> PanelRegResult<()> {
        if len != self.dim {
            return Err(PanelRegError::InvalidDimension { dim: len });
        }
        Ok(())
    }

    /// Returns the dimension (2 or 3).
    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Returns the per-axis sample count.
    pub fn size(&self) -> &[usize] {
        &self.size[..self.dim]
    }

    /// Returns the per-axis sample distance.
    pub fn spacing(&self) -> &[f64] {
        &self.spacing[..self.dim]
    }

    /// Returns the physical position of the first sample.
    pub fn origin(&self) -> &[f64] {
        &self.origin[..self.dim]
    }

    /// Returns the direction cosines embedded in a 3x3 matrix.
    pub fn direction(&self) -> &Matrix3<f64> {
        &self.direction
    }

    pub(crate) fn size3(&self) -> [usize; 3] {
        self.size
    }

    pub(crate) fn spacing3(&self) -> [f64; 3] {
        self.spacing
    }

    pub(crate) fn origin3(&self) -> [f64; 3] {
        self.origin
    }

    /// Returns the total number of samples.
    pub fn num_samples(&self) -> usize {
        self.size[0] * self.size[1] * self.size[2]
    }

    /// Returns the smallest spacing component.
    pub fn min_spacing(&self) -> f64 {
        self.spacing().iter().copied().fold(f64::INFINITY, f64::min)
    }

    /// Physical length covered by `axis`.
    pub fn extent(&self, axis: usize) -> f64 {
        self.size[axis] as f64 * self.spacing[axis]
    }

    /// Maps a continuous index to a physical point.
    pub fn index_to_physical(&self, index: &Vector3<f64>) -> Vector3<f64> {
        Vector3::from(self.origin) + self.to_physical * index
    }

    /// Maps a physical point to a continuous index.
    pub fn physical_to_index(&self, point: &Vector3<f64>) -> Vector3<f64> {
        self.to_index * (point - Vector3::from(self.origin))
    }

    /// Maps an index-space offset to a physical vector.
    pub fn index_vector_to_physical(&self, offset: &Vector3<f64>) -> Vector3<f64> {
        self.to_physical * offset
    }

    /// Physical center of the sample grid.
    pub fn center(&self) -> Vector3<f64> {
        let mut idx = Vector3::zeros();
        for axis in 0..self.dim {
            idx[axis] = (self.size[axis] as f64 - 1.0) * 0.5;
        }
        self.index_to_physical(&idx)
    }

    /// Linear buffer offset of an integer index.
    #[inline]
    pub fn offset(&self, x: usize, y: usize, z: usize) -> usize {
        (z * self.size[1] + y) * self.size[0] + x
    }

    /// Returns true when both geometries describe the same grid.
    pub fn approx_eq(&self, other: &Geometry) -> bool {
        self.dim == other.dim
            && self.size == other.size
            && close_slices(&self.spacing, &other.spacing)
            && close_slices(&self.origin, &other.origin)
            && (self.direction - other.direction).abs().max() <= GEOMETRY_TOL
    }

    /// Returns a copy whose spacing and origin are divided by `magnitude`.
    pub(crate) fn normalized(&self, magnitude: f64) -> Self {
        let spacing = self.spacing.map(|s| s / magnitude);
        let origin = self.origin.map(|o| o / magnitude);
        let mut spacing = spacing;
        if self.dim == 2 {
            spacing[2] = 1.0;
        }
        Self::from_parts(self.dim, self.size, spacing, origin, self.direction)
    }
}

fn close_slices(a: &[f64; 3], b: &[f64; 3]) -> bool {
    a.iter().zip(b.iter()).all(|(x, y)| {
        let scale = x.abs().max(y.abs()).max(1.0);
        (x - y).abs() <= GEOMETRY_TOL * scale
    })
}

/// Owned scalar image with physical geometry.
#[derive(Clone, Debug, PartialEq)]
pub struct Image {
    data: Vec<f32>,
    geometry: Geometry,
}

impl Image {
    /// Wraps a sample buffer; its length must match the geometry.
    pub fn new(data: Vec<f32>, geometry: Geometry) -> PanelRegResult<Self> {
        let needed = geometry.num_samples();
        if data.len() != needed {
            return Err(PanelRegError::BufferSizeMismatch {
                needed,
                got: data.len(),
            });
        }
        Ok(Self { data, geometry })
    }

    /// Creates an image filled with `value`.
    pub fn filled(geometry: Geometry, value: f32) -> Self {
        let data = vec![value; geometry.num_samples()];
        Self { data, geometry }
    }

    /// Creates an image by evaluating `f(x, y, z)` at every integer index.
    pub fn from_fn<F>(geometry: Geometry, mut f: F) -> Self
    where
        F: FnMut(usize, usize, usize) -> f32,
    {
        let [nx, ny, nz] = geometry.size3();
        let mut data = Vec::with_capacity(geometry.num_samples());
        for z in 0..nz {
            for y in 0..ny {
                for x in 0..nx {
                    data.push(f(x, y, z));
                }
            }
        }
        Self { data, geometry }
    }

    pub(crate) fn from_parts(data: Vec<f32>, geometry: Geometry) -> Self {
        debug_assert_eq!(data.len(), geometry.num_samples());
        Self { data, geometry }
    }

    /// Returns the sample buffer.
    pub fn data(&self) -> &[f32] {
        &self.data
    }

    /// Consumes the image and returns its sample buffer.
    pub fn into_data(self) -> Vec<f32> {
        self.data
    }

    /// Returns the image geometry.
    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    /// Returns the dimension (2 or 3).
    pub fn dim(&self) -> usize {
        self.geometry.dim()
    }

    /// Returns the sample at an integer index, if in bounds.
    pub fn get(&self, x: usize, y: usize, z: usize) -> Option<f32> {
        let [nx, ny, nz] = self.geometry.size3();
        if x >= nx || y >= ny || z >= nz {
            return None;
        }
        self.data.get(self.geometry.offset(x, y, z)).copied()
    }

    /// Returns a copy carrying a different geometry over the same grid shape.
    pub(crate) fn with_geometry(&self, geometry: Geometry) -> Self {
        debug_assert_eq!(geometry.num_samples(), self.data.len());
        Self {
            data: self.data.clone(),
            geometry,
        }
    }

    /// Returns true when the image has no intensity variation.
    pub fn is_uniform(&self) -> bool {
        let (_, var) = crate::util::math::mean_variance(&self.data);
        var <= 1e-12
    }
}

/// Numeric range the samples were decoded from.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum Encoding {
    /// 8-bit unsigned samples.
    U8,
    /// 16-bit unsigned samples.
    U16,
    /// Floating-point samples already in working units.
    #[default]
    Float,
}

impl Encoding {
    /// Largest representable value, used for normalization.
    pub fn max_value(self) -> f32 {
        match self {
            Encoding::U8 => 255.0,
            Encoding::U16 => 65535.0,
            Encoding::Float => 1.0,
        }
    }
}

/// Channels of one imaging cycle sharing a single geometry.
#[derive(Clone, Debug, PartialEq)]
pub struct ChannelSet {
    channels: Vec<Image>,
    encoding: Encoding,
}

impl ChannelSet {
    /// Validates and wraps a set of channels.
    pub fn new(channels: Vec<Image>, encoding: Encoding) -> PanelRegResult<Self> {
        let first = channels.first().ok_or(PanelRegError::EmptyChannelSet)?;
        let geometry = first.geometry();
        for (index, channel) in channels.iter().enumerate().skip(1) {
            let other = channel.geometry();
            if other.dim() != geometry.dim() || other.size() != geometry.size() {
                return Err(PanelRegError::ChannelMismatch {
                    index,
                    reason: "shape differs",
                });
            }
            if !other.approx_eq(geometry) {
                return Err(PanelRegError::ChannelMismatch {
                    index,
                    reason: "spacing, origin or direction differs",
                });
            }
        }
        Ok(Self { channels, encoding })
    }

    /// Wraps a single floating-point image.
    pub fn single(image: Image) -> Self {
        Self {
            channels: vec![image],
            encoding: Encoding::Float,
        }
    }

    /// Returns the channels in acquisition order.
    pub fn channels(&self) -> &[Image] {
        &self.channels
    }

    /// Returns the shared geometry.
    pub fn geometry(&self) -> &Geometry {
        self.channels[0].geometry()
    }

    /// Returns the sample encoding.
    pub fn encoding(&self) -> Encoding {
        self.encoding
    }

    /// Returns the number of channels.
    pub fn len(&self) -> usize {
        self.channels.len()
    }

    /// Always false; a channel set holds at least one channel.
    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::{ChannelSet, Encoding, Geometry, Image};
    use crate::util::PanelRegError;
    use nalgebra::Vector3;

    #[test]
    fn index_physical_round_trip() {
        let geom = Geometry::unit(&[10, 8, 4])
            .unwrap()
            .with_spacing(&[0.5, 0.25, 2.0])
            .unwrap()
            .with_origin(&[1.0, -2.0, 3.0])
            .unwrap()
            .with_direction(&[0.0, -1.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 1.0])
            .unwrap();
        let idx = Vector3::new(3.5, 2.0, 1.0);
        let p = geom.index_to_physical(&idx);
        let back = geom.physical_to_index(&p);
        assert!((back - idx).norm() < 1e-12);
        assert!((p - Vector3::new(1.0 - 0.5, -2.0 + 1.75, 5.0)).norm() < 1e-12);
    }

    #[test]
    fn geometry_rejects_bad_metadata() {
        let geom = Geometry::unit(&[4, 4]).unwrap();
        assert_eq!(
            geom.with_spacing(&[1.0, 0.0]).err().unwrap(),
            PanelRegError::InvalidSpacing {
                axis: 1,
                spacing: 0.0
            }
        );
        assert_eq!(
            geom.with_direction(&[1.0, 1.0, 0.0, 1.0]).err().unwrap(),
            PanelRegError::InvalidDirection
        );
        assert_eq!(
            Geometry::unit(&[4]).err().unwrap(),
            PanelRegError::InvalidDimension { dim: 1 }
        );
    }

    #[test]
    fn center_of_2d_grid() {
        let geom = Geometry::unit(&[5, 3])
            .unwrap()
            .with_spacing(&[2.0, 1.0])
            .unwrap();
        let c = geom.center();
        assert!((c - Vector3::new(4.0, 1.0, 0.0)).norm() < 1e-12);
    }

    #[test]
    fn channel_set_rejects_mismatched_channels() {
        let a = Image::filled(Geometry::unit(&[4, 4]).unwrap(), 0.0);
        let b = Image::filled(Geometry::unit(&[4, 5]).unwrap(), 0.0);
        let err = ChannelSet::new(vec![a.clone(), b], Encoding::U8)
            .err()
            .unwrap();
        assert_eq!(
            err,
            PanelRegError::ChannelMismatch {
                index: 1,
                reason: "shape differs"
            }
        );

        let shifted = Image::filled(
            Geometry::unit(&[4, 4])
                .unwrap()
                .with_origin(&[1.0, 0.0])
                .unwrap(),
            0.0,
        );
        assert!(ChannelSet::new(vec![a, shifted], Encoding::U8).is_err());
        assert_eq!(
            ChannelSet::new(Vec::new(), Encoding::U8).err().unwrap(),
            PanelRegError::EmptyChannelSet
        );
    }

    #[test]
    fn image_rejects_wrong_buffer() {
        let geom = Geometry::unit(&[3, 3]).unwrap();
        assert_eq!(
            Image::new(vec![0.0; 8], geom).err().unwrap(),
            PanelRegError::BufferSizeMismatch { needed: 9, got: 8 }
        );
    }
}
