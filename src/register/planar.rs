//! In-plane pre-alignment of volumes on their z-projections.

use super::PreparedPair;
use crate::image::filter::{project, ProjectionReduction};
use crate::image::{Geometry, Image};
use crate::init::CoarseEstimate;
use crate::mask::Mask;
use crate::transform::{CompositeTransform, Transform};
use crate::util::PanelRegResult;
use nalgebra::Matrix3;

/// Mean-projects both volumes and their masks along z.
///
/// A projected mask keeps the samples included in at least half of the
/// slices.
pub(crate) fn project_pair(pair: &PreparedPair) -> PanelRegResult<PreparedPair> {
    Ok(PreparedPair {
        fixed: project(&pair.fixed, 2, ProjectionReduction::Mean)?,
        moving: project(&pair.moving, 2, ProjectionReduction::Mean)?,
        fixed_mask: pair.fixed_mask.as_ref().map(project_mask).transpose()?,
        moving_mask: pair.moving_mask.as_ref().map(project_mask).transpose()?,
    })
}

fn project_mask(mask: &Mask) -> PanelRegResult<Mask> {
    let weights: Vec<f32> = mask.data().iter().map(|&v| (v != 0) as u8 as f32).collect();
    let image = Image::from_parts(weights, mask.geometry().clone());
    let flat = project(&image, 2, ProjectionReduction::Mean)?;
    let data = flat.data().iter().map(|&v| (v >= 0.5) as u8).collect();
    Mask::new(data, flat.geometry().clone())
}

/// `p ↦ Dᵀ (p - o) + o`: physical space to the axis-aligned frame a
/// z-projection works in, which keeps spacing and origin but drops the
/// direction.
fn to_projected(geometry: &Geometry) -> PanelRegResult<Transform> {
    frame_map(&geometry.direction().transpose(), geometry)
}

/// Inverse of [`to_projected`].
fn from_projected(geometry: &Geometry) -> PanelRegResult<Transform> {
    frame_map(geometry.direction(), geometry)
}

fn frame_map(matrix: &Matrix3<f64>, geometry: &Geometry) -> PanelRegResult<Transform> {
    let rows: Vec<f64> = (0..3)
        .flat_map(|r| (0..3).map(move |c| matrix[(r, c)]))
        .collect();
    Transform::affine(&rows, &[0.0; 3], &geometry.origin3())
}

/// Planar part of a 3D coarse estimate, in projected coordinates.
pub(crate) fn planar_estimate(
    coarse: &CoarseEstimate,
    fixed: &Geometry,
    moving: &Geometry,
) -> PanelRegResult<CoarseEstimate> {
    let c = fixed.center();
    let shift = to_projected(moving)?.apply(&coarse.transform.apply(&c))
        - to_projected(fixed)?.apply(&c);
    Ok(CoarseEstimate {
        transform: Transform::translation(&[shift[0], shift[1]])?,
        confidence: coarse.confidence,
        bin_factor: coarse.bin_factor,
        rotation_candidates: Vec::new(),
        warnings: Vec::new(),
    })
}

/// Lifts an in-plane result back to the volume.
///
/// The planar transform acts in projected coordinates; it is embedded in 3D
/// about the middle of the fixed volume, takes its z translation from the
/// volumetric coarse estimate and is conjugated back to physical space.
/// Fails when the result leaves the planar family, which happens for rigid
/// results when exactly one of the two volumes is mirrored.
pub(crate) fn lift_estimate(
    planar: &Transform,
    coarse: &CoarseEstimate,
    fixed: &Geometry,
    moving: &Geometry,
) -> PanelRegResult<CoarseEstimate> {
    let c = fixed.center();
    let center = to_projected(fixed)?.apply(&c);
    let offset_z = to_projected(moving)?.apply(&coarse.transform.apply(&c))[2] - center[2];

    let mut chain = CompositeTransform::new();
    chain.push(to_projected(fixed)?)?;
    chain.push(planar.lift_to_3d(center[2], offset_z)?)?;
    chain.push(from_projected(moving)?)?;
    let (matrix, offset) = chain.flatten()?.homogeneous();
    Ok(CoarseEstimate {
        transform: Transform::from_homogeneous(planar.family(), 3, &matrix, &offset, c.as_slice())?,
        confidence: coarse.confidence,
        bin_factor: coarse.bin_factor,
        rotation_candidates: Vec::new(),
        warnings: Vec::new(),
    })
}

#[cfg(test)]
mod tests {
    use super::{lift_estimate, planar_estimate, project_mask};
    use crate::image::Geometry;
    use crate::init::CoarseEstimate;
    use crate::mask::Mask;
    use crate::transform::{Transform, TransformFamily};
    use nalgebra::Vector3;

    #[test]
    fn mask_projection_uses_majority() {
        let geom = Geometry::unit(&[2, 1, 4]).unwrap();
        // x = 0 included in 3 of 4 slices, x = 1 in 1 of 4
        let mask = Mask::new(vec![1, 1, 1, 0, 1, 0, 0, 0], geom).unwrap();
        let flat = project_mask(&mask).unwrap();
        assert_eq!(flat.data(), &[1, 0]);
        assert_eq!(flat.geometry().dim(), 2);
    }

    #[test]
    fn lift_keeps_z_translation() {
        let fixed = Geometry::unit(&[16, 16, 8]).unwrap();
        let coarse = CoarseEstimate {
            transform: Transform::translation(&[1.0, 2.0, -1.5]).unwrap(),
            ..CoarseEstimate::identity(3)
        };
        let planar = planar_estimate(&coarse, &fixed, &fixed).unwrap();
        assert_eq!(planar.transform.parameters(), &[1.0, 2.0]);

        let rigid = Transform::rigid_2d(0.1, [1.0, 2.0], [7.5, 7.5]).unwrap();
        let lifted = lift_estimate(&rigid, &coarse, &fixed, &fixed).unwrap();
        assert_eq!(lifted.transform.family(), TransformFamily::Rigid);
        assert_eq!(lifted.transform.dim(), 3);
        assert_eq!(lifted.transform.center()[2], 3.5);
        assert!((lifted.transform.offset()[2] + 1.5).abs() < 1e-12);
    }

    #[test]
    fn flipped_volume_round_trips_through_projected_frame() {
        let fixed = Geometry::unit(&[16, 16, 8])
            .unwrap()
            .with_direction(&[-1.0, 0.0, 0.0, 0.0, -1.0, 0.0, 0.0, 0.0, 1.0])
            .unwrap();
        let coarse = CoarseEstimate {
            transform: Transform::translation(&[-3.0, 2.0, 1.0]).unwrap(),
            ..CoarseEstimate::identity(3)
        };
        // physical (-3, 2) is index-axis (3, -2) under the flipped direction
        let planar = planar_estimate(&coarse, &fixed, &fixed).unwrap();
        assert!((planar.transform.parameters()[0] - 3.0).abs() < 1e-12);
        assert!((planar.transform.parameters()[1] + 2.0).abs() < 1e-12);

        let lifted = lift_estimate(&planar.transform, &coarse, &fixed, &fixed).unwrap();
        let offset = lifted.transform.offset();
        assert!((offset - Vector3::new(-3.0, 2.0, 1.0)).norm() < 1e-9, "{offset:?}");

        let rigid = Transform::rigid_2d(0.2, [3.0, -2.0], [7.5, 7.5]).unwrap();
        let lifted = lift_estimate(&rigid, &coarse, &fixed, &fixed).unwrap();
        let p = Vector3::new(-2.0, -5.0, 3.0);
        let q = lifted.transform.apply(&p);
        let flip = |v: Vector3<f64>| Vector3::new(-v[0], -v[1], v[2]);
        let expected = flip(rigid.apply(&Vector3::new(2.0, 5.0, 0.0)));
        assert!((q[0] - expected[0]).abs() < 1e-9 && (q[1] - expected[1]).abs() < 1e-9);
        assert!((q[2] - 4.0).abs() < 1e-9);
    }
}
