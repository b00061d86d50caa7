//! Rigid, affine and translation transforms between physical spaces.
//!
//! A transform maps a point of the fixed space into the moving space:
//! `T(p) = M(θ) · (p − c) + c + t(θ)`. 2D transforms use the same 3D math
//! with the z row and column of `M` fixed to the identity.
//!
//! Parameter layouts (linear part first, translation last):
//! - `Translation`: `[tx, ty(, tz)]`
//! - `Rigid` 2D: `[angle, tx, ty]`
//! - `Rigid` 3D: `[ax, ay, az, tx, ty, tz]` with `R = Rz · Ry · Rx`
//! - `Affine`: row-major `d × d` matrix followed by `d` translations

use crate::util::math::wrap_rad;
use crate::util::{PanelRegError, PanelRegResult};
use nalgebra::{Matrix3, Vector3};

mod composite;

pub use composite::CompositeTransform;

/// Closed set of supported transform families.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum TransformFamily {
    /// Pure translation.
    Translation,
    /// Rotation about the center plus translation.
    #[default]
    Rigid,
    /// General linear map about the center plus translation.
    Affine,
}

impl TransformFamily {
    /// Number of parameters for a given dimension.
    pub fn parameter_count(self, dim: usize) -> usize {
        self.linear_parameter_count(dim) + dim
    }

    /// Number of leading parameters that drive the linear part.
    pub fn linear_parameter_count(self, dim: usize) -> usize {
        match self {
            TransformFamily::Translation => 0,
            TransformFamily::Rigid => {
                if dim == 2 {
                    1
                } else {
                    3
                }
            }
            TransformFamily::Affine => dim * dim,
        }
    }

    /// Lower-case family name.
    pub fn name(self) -> &'static str {
        match self {
            TransformFamily::Translation => "translation",
            TransformFamily::Rigid => "rigid",
            TransformFamily::Affine => "affine",
        }
    }

    fn rank(self) -> u8 {
        match self {
            TransformFamily::Translation => 0,
            TransformFamily::Rigid => 1,
            TransformFamily::Affine => 2,
        }
    }
}

/// A parameterized transform with a fixed center.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(
    feature = "serde",
    serde(try_from = "TransformRecord", into = "TransformRecord")
)]
pub struct Transform {
    family: TransformFamily,
    dim: usize,
    parameters: Vec<f64>,
    center: Vector3<f64>,
}

impl Transform {
    /// Validates and creates a transform.
    pub fn new(
        family: TransformFamily,
        dim: usize,
        parameters: Vec<f64>,
        center: &[f64],
    ) -> PanelRegResult<Self> {
        if dim != 2 && dim != 3 {
            return Err(PanelRegError::InvalidDimension { dim });
        }
        let expected = family.parameter_count(dim);
        if parameters.len() != expected {
            return Err(PanelRegError::InvalidParameters {
                family: family.name(),
                dim,
                expected,
                got: parameters.len(),
            });
        }
        if center.len() != dim {
            return Err(PanelRegError::InvalidDimension { dim: center.len() });
        }
        if parameters.iter().chain(center.iter()).any(|v| !v.is_finite()) {
            return Err(PanelRegError::InvalidConfig {
                reason: "transform parameters and center must be finite",
            });
        }
        let mut c = Vector3::zeros();
        for (axis, &v) in center.iter().enumerate() {
            c[axis] = v;
        }
        Ok(Self {
            family,
            dim,
            parameters,
            center: c,
        })
    }

    /// Identity of the given family, centered at the origin.
    pub fn identity(family: TransformFamily, dim: usize) -> Self {
        let mut parameters = vec![0.0; family.parameter_count(dim)];
        if family == TransformFamily::Affine {
            for i in 0..dim {
                parameters[i * dim + i] = 1.0;
            }
        }
        Self {
            family,
            dim,
            parameters,
            center: Vector3::zeros(),
        }
    }

    /// Pure translation by `offset`.
    pub fn translation(offset: &[f64]) -> PanelRegResult<Self> {
        let dim = offset.len();
        Self::new(
            TransformFamily::Translation,
            dim,
            offset.to_vec(),
            &vec![0.0; dim],
        )
    }

    /// 2D rotation by `angle` radians about `center` followed by `offset`.
    pub fn rigid_2d(angle: f64, offset: [f64; 2], center: [f64; 2]) -> PanelRegResult<Self> {
        Self::new(
            TransformFamily::Rigid,
            2,
            vec![angle, offset[0], offset[1]],
            &center,
        )
    }

    /// 3D rotation `Rz · Ry · Rx` about `center` followed by `offset`.
    pub fn rigid_3d(angles: [f64; 3], offset: [f64; 3], center: [f64; 3]) -> PanelRegResult<Self> {
        let mut parameters = angles.to_vec();
        parameters.extend_from_slice(&offset);
        Self::new(TransformFamily::Rigid, 3, parameters, &center)
    }

    /// Affine map from a row-major `dim × dim` matrix.
    pub fn affine(matrix: &[f64], offset: &[f64], center: &[f64]) -> PanelRegResult<Self> {
        let dim = offset.len();
        let mut parameters = matrix.to_vec();
        parameters.extend_from_slice(offset);
        Self::new(TransformFamily::Affine, dim, parameters, center)
    }

    /// Expresses `p ↦ matrix · p + offset` in `family` about `center`.
    ///
    /// Fails with `InvalidConfig` when `matrix` is not a member of the family:
    /// anything but the identity for translations, anything but a proper
    /// rotation for rigid transforms.
    pub fn from_homogeneous(
        family: TransformFamily,
        dim: usize,
        matrix: &Matrix3<f64>,
        offset: &Vector3<f64>,
        center: &[f64],
    ) -> PanelRegResult<Self> {
        if center.len() != dim {
            return Err(PanelRegError::InvalidDimension { dim: center.len() });
        }
        let mut c = Vector3::zeros();
        for (axis, &v) in center.iter().enumerate() {
            c[axis] = v;
        }
        let t = matrix * c + offset - c;
        let mut params = match family {
            TransformFamily::Translation => {
                if (matrix - Matrix3::identity()).abs().max() > FAMILY_TOL {
                    return Err(PanelRegError::InvalidConfig {
                        reason: "linear part is not the identity",
                    });
                }
                Vec::new()
            }
            TransformFamily::Rigid => {
                let gram = matrix.transpose() * matrix;
                let orthonormal = (gram - Matrix3::identity()).abs().max() <= FAMILY_TOL;
                if !orthonormal || matrix.determinant() <= 0.0 {
                    return Err(PanelRegError::InvalidConfig {
                        reason: "linear part is not a proper rotation",
                    });
                }
                if dim == 2 {
                    vec![matrix[(1, 0)].atan2(matrix[(0, 0)])]
                } else {
                    euler_zyx(matrix).to_vec()
                }
            }
            TransformFamily::Affine => {
                let mut out = Vec::with_capacity(dim * dim);
                for r in 0..dim {
                    for col in 0..dim {
                        out.push(matrix[(r, col)]);
                    }
                }
                out
            }
        };
        params.extend((0..dim).map(|a| t[a]));
        Self::new(family, dim, params, center)
    }

    /// Returns the family.
    pub fn family(&self) -> TransformFamily {
        self.family
    }

    /// Returns the dimension (2 or 3).
    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Returns the parameter vector.
    pub fn parameters(&self) -> &[f64] {
        &self.parameters
    }

    /// Returns the fixed center.
    pub fn center(&self) -> &[f64] {
        &self.center.as_slice()[..self.dim]
    }

    /// Returns the same transform with new parameters.
    pub fn with_parameters(&self, parameters: &[f64]) -> PanelRegResult<Self> {
        Self::new(self.family, self.dim, parameters.to_vec(), self.center())
    }

    /// Translation component `t`.
    pub fn offset(&self) -> Vector3<f64> {
        let start = self.family.linear_parameter_count(self.dim);
        let mut t = Vector3::zeros();
        for axis in 0..self.dim {
            t[axis] = self.parameters[start + axis];
        }
        t
    }

    /// Linear part `M`, embedded in 3x3 for 2D.
    pub fn matrix(&self) -> Matrix3<f64> {
        let p = &self.parameters;
        match (self.family, self.dim) {
            (TransformFamily::Translation, _) => Matrix3::identity(),
            (TransformFamily::Rigid, 2) => rot_z(p[0]),
            (TransformFamily::Rigid, _) => rot_z(p[2]) * rot_y(p[1]) * rot_x(p[0]),
            (TransformFamily::Affine, d) => {
                let mut m = Matrix3::identity();
                for r in 0..d {
                    for c in 0..d {
                        m[(r, c)] = p[r * d + c];
                    }
                }
                m
            }
        }
    }

    /// Returns `(M, o)` with `T(p) = M · p + o`.
    pub fn homogeneous(&self) -> (Matrix3<f64>, Vector3<f64>) {
        let m = self.matrix();
        let o = self.center + self.offset() - m * self.center;
        (m, o)
    }

    /// Maps a fixed-space point into moving space.
    #[inline]
    pub fn apply(&self, point: &Vector3<f64>) -> Vector3<f64> {
        self.matrix() * (point - self.center) + self.center + self.offset()
    }

    /// Derivatives of `M` with respect to each linear parameter.
    pub(crate) fn linear_derivatives(&self) -> Vec<Matrix3<f64>> {
        let p = &self.parameters;
        match (self.family, self.dim) {
            (TransformFamily::Translation, _) => Vec::new(),
            (TransformFamily::Rigid, 2) => vec![d_rot_z(p[0])],
            (TransformFamily::Rigid, _) => {
                let (rx, ry, rz) = (rot_x(p[0]), rot_y(p[1]), rot_z(p[2]));
                vec![
                    rz * ry * d_rot_x(p[0]),
                    rz * d_rot_y(p[1]) * rx,
                    d_rot_z(p[2]) * ry * rx,
                ]
            }
            (TransformFamily::Affine, d) => {
                let mut out = Vec::with_capacity(d * d);
                for r in 0..d {
                    for c in 0..d {
                        let mut e = Matrix3::zeros();
                        e[(r, c)] = 1.0;
                        out.push(e);
                    }
                }
                out
            }
        }
    }

    /// Writes `∂T(p)/∂θ_k` for every parameter into `out`.
    pub(crate) fn jacobian_into(
        &self,
        derivatives: &[Matrix3<f64>],
        point: &Vector3<f64>,
        out: &mut [Vector3<f64>],
    ) {
        let rel = point - self.center;
        let n_lin = derivatives.len();
        for (slot, dm) in out.iter_mut().zip(derivatives.iter()) {
            *slot = dm * rel;
        }
        for axis in 0..self.dim {
            let mut e = Vector3::zeros();
            e[axis] = 1.0;
            out[n_lin + axis] = e;
        }
    }

    /// Returns the inverse mapping (moving space to fixed space).
    pub fn inverse(&self) -> PanelRegResult<Self> {
        let t = self.offset();
        let new_center = self.center + t;
        let neg_t: Vec<f64> = (0..self.dim).map(|a| -t[a]).collect();
        let center: Vec<f64> = (0..self.dim).map(|a| new_center[a]).collect();
        match (self.family, self.dim) {
            (TransformFamily::Translation, _) => {
                Self::new(self.family, self.dim, neg_t, self.center())
            }
            (TransformFamily::Rigid, 2) => {
                let mut params = vec![wrap_rad(-self.parameters[0])];
                params.extend(neg_t);
                Self::new(self.family, 2, params, &center)
            }
            (TransformFamily::Rigid, _) => {
                let angles = euler_zyx(&self.matrix().transpose());
                let mut params = angles.to_vec();
                params.extend(neg_t);
                Self::new(self.family, 3, params, &center)
            }
            (TransformFamily::Affine, d) => {
                let inv = self
                    .matrix()
                    .try_inverse()
                    .ok_or(PanelRegError::NonInvertibleTransform)?;
                if !inv.iter().all(|v| v.is_finite()) {
                    return Err(PanelRegError::NonInvertibleTransform);
                }
                let mut params = Vec::with_capacity(d * d + d);
                for r in 0..d {
                    for c in 0..d {
                        params.push(inv[(r, c)]);
                    }
                }
                params.extend(neg_t);
                Self::new(self.family, d, params, &center)
            }
        }
    }

    /// Re-expresses the same mapping in a richer family.
    ///
    /// Demotion is rejected with `InvalidParameters`.
    pub fn promote(&self, family: TransformFamily) -> PanelRegResult<Self> {
        if family == self.family {
            return Ok(self.clone());
        }
        if family.rank() < self.family.rank() {
            return Err(PanelRegError::InvalidParameters {
                family: family.name(),
                dim: self.dim,
                expected: family.parameter_count(self.dim),
                got: self.parameters.len(),
            });
        }
        let d = self.dim;
        let t = self.offset();
        let mut params = match family {
            TransformFamily::Rigid => vec![0.0; family.linear_parameter_count(d)],
            _ => {
                let m = self.matrix();
                let mut out = Vec::with_capacity(d * d);
                for r in 0..d {
                    for c in 0..d {
                        out.push(m[(r, c)]);
                    }
                }
                out
            }
        };
        params.extend((0..d).map(|a| t[a]));
        Self::new(family, d, params, self.center())
    }

    /// Same mapping expressed about a different center.
    pub fn recentered(&self, center: &[f64]) -> PanelRegResult<Self> {
        if center.len() != self.dim {
            return Err(PanelRegError::InvalidDimension { dim: center.len() });
        }
        let mut c = Vector3::zeros();
        for (axis, &v) in center.iter().enumerate() {
            c[axis] = v;
        }
        let m = self.matrix();
        let t = (m - Matrix3::identity()) * (c - self.center) + self.offset();
        let mut params = self.parameters.clone();
        let start = self.family.linear_parameter_count(self.dim);
        for axis in 0..self.dim {
            params[start + axis] = t[axis];
        }
        Self::new(self.family, self.dim, params, center)
    }

    /// Conjugates by a uniform scaling of space: `p ↦ factor · T(p / factor)`.
    pub(crate) fn scale_space(&self, factor: f64) -> Self {
        let mut out = self.clone();
        let start = self.family.linear_parameter_count(self.dim);
        for axis in 0..self.dim {
            out.parameters[start + axis] *= factor;
        }
        out.center *= factor;
        out
    }

    /// Embeds a 2D transform in 3D.
    ///
    /// The linear part acts in the xy-plane, `center_z` becomes the center's z
    /// component and `offset_z` the z translation.
    pub fn lift_to_3d(&self, center_z: f64, offset_z: f64) -> PanelRegResult<Self> {
        if self.dim != 2 {
            return Err(PanelRegError::InvalidDimension { dim: self.dim });
        }
        let t = self.offset();
        let center = [self.center[0], self.center[1], center_z];
        let offset = [t[0], t[1], offset_z];
        match self.family {
            TransformFamily::Translation => Self::new(
                TransformFamily::Translation,
                3,
                offset.to_vec(),
                &center,
            ),
            TransformFamily::Rigid => {
                Self::rigid_3d([0.0, 0.0, self.parameters[0]], offset, center)
            }
            TransformFamily::Affine => {
                let p = &self.parameters;
                let matrix = [p[0], p[1], 0.0, p[2], p[3], 0.0, 0.0, 0.0, 1.0];
                Self::affine(&matrix, &offset, &center)
            }
        }
    }

    /// Returns true when the mapping is the identity within `tol`.
    pub fn is_identity(&self, tol: f64) -> bool {
        let (m, o) = self.homogeneous();
        (m - Matrix3::identity()).abs().max() <= tol && o.abs().max() <= tol
    }
}

const FAMILY_TOL: f64 = 1e-6;

fn rot_x(a: f64) -> Matrix3<f64> {
    let (s, c) = a.sin_cos();
    Matrix3::new(1.0, 0.0, 0.0, 0.0, c, -s, 0.0, s, c)
}

fn rot_y(a: f64) -> Matrix3<f64> {
    let (s, c) = a.sin_cos();
    Matrix3::new(c, 0.0, s, 0.0, 1.0, 0.0, -s, 0.0, c)
}

fn rot_z(a: f64) -> Matrix3<f64> {
    let (s, c) = a.sin_cos();
    Matrix3::new(c, -s, 0.0, s, c, 0.0, 0.0, 0.0, 1.0)
}

fn d_rot_x(a: f64) -> Matrix3<f64> {
    let (s, c) = a.sin_cos();
    Matrix3::new(0.0, 0.0, 0.0, 0.0, -s, -c, 0.0, c, -s)
}

fn d_rot_y(a: f64) -> Matrix3<f64> {
    let (s, c) = a.sin_cos();
    Matrix3::new(-s, 0.0, c, 0.0, 0.0, 0.0, -c, 0.0, -s)
}

fn d_rot_z(a: f64) -> Matrix3<f64> {
    let (s, c) = a.sin_cos();
    Matrix3::new(-s, -c, 0.0, c, -s, 0.0, 0.0, 0.0, 0.0)
}

/// Recovers `[ax, ay, az]` with `R = Rz(az) · Ry(ay) · Rx(ax)`.
fn euler_zyx(r: &Matrix3<f64>) -> [f64; 3] {
    let sy = (-r[(2, 0)]).clamp(-1.0, 1.0);
    let ay = sy.asin();
    if ay.cos().abs() > 1e-9 {
        let ax = r[(2, 1)].atan2(r[(2, 2)]);
        let az = r[(1, 0)].atan2(r[(0, 0)]);
        [ax, ay, az]
    } else {
        // gimbal lock: fold the whole rotation into ax
        let ax = (-r[(1, 2)]).atan2(r[(1, 1)]);
        [ax, ay, 0.0]
    }
}

#[cfg(feature = "serde")]
#[derive(serde::Serialize, serde::Deserialize)]
struct TransformRecord {
    family: TransformFamily,
    dim: usize,
    parameters: Vec<f64>,
    center: Vec<f64>,
}

#[cfg(feature = "serde")]
impl TryFrom<TransformRecord> for Transform {
    type Error = PanelRegError;

    fn try_from(record: TransformRecord) -> PanelRegResult<Self> {
        Transform::new(record.family, record.dim, record.parameters, &record.center)
    }
}

#[cfg(feature = "serde")]
impl From<Transform> for TransformRecord {
    fn from(t: Transform) -> Self {
        let center = t.center().to_vec();
        Self {
            family: t.family,
            dim: t.dim,
            parameters: t.parameters,
            center,
        }
    }
}
