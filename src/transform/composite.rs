//! Ordered chains of transforms.

use super::{Transform, TransformFamily};
use crate::util::{PanelRegError, PanelRegResult};
use nalgebra::{Matrix3, Vector3};

/// Stages applied first to last: `p ↦ Tₙ(…T₂(T₁(p)))`.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CompositeTransform {
    stages: Vec<Transform>,
}

impl CompositeTransform {
    /// Creates an empty chain.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a stage; every stage must share the first stage's dimension.
    pub fn push(&mut self, stage: Transform) -> PanelRegResult<()> {
        if let Some(first) = self.stages.first() {
            if first.dim() != stage.dim() {
                return Err(PanelRegError::ResampleGeometryMismatch {
                    transform_dim: stage.dim(),
                    grid_dim: first.dim(),
                });
            }
        }
        self.stages.push(stage);
        Ok(())
    }

    /// Returns the stages in application order.
    pub fn stages(&self) -> &[Transform] {
        &self.stages
    }

    /// Applies every stage in order.
    pub fn apply(&self, point: &Vector3<f64>) -> Vector3<f64> {
        self.stages.iter().fold(*point, |p, t| t.apply(&p))
    }

    /// Collapses the chain to one transform.
    ///
    /// A chain of translations flattens to a translation; anything else to an
    /// affine centered where the first stage is centered. An empty chain is
    /// rejected.
    pub fn flatten(&self) -> PanelRegResult<Transform> {
        let first = self.stages.first().ok_or(PanelRegError::InvalidConfig {
            reason: "cannot flatten an empty transform chain",
        })?;
        if self.stages.len() == 1 {
            return Ok(first.clone());
        }
        let dim = first.dim();
        let mut m = Matrix3::identity();
        let mut o = Vector3::zeros();
        for stage in &self.stages {
            let (sm, so) = stage.homogeneous();
            o = sm * o + so;
            m = sm * m;
        }

        if self
            .stages
            .iter()
            .all(|s| s.family() == TransformFamily::Translation)
        {
            return Transform::translation(&o.as_slice()[..dim]);
        }

        let center = first.center().to_vec();
        let mut c = Vector3::zeros();
        for (axis, &v) in center.iter().enumerate() {
            c[axis] = v;
        }
        // T(p) = M (p - c) + c + t, so t = o + M c - c
        let t = o + m * c - c;
        let mut matrix = Vec::with_capacity(dim * dim);
        for r in 0..dim {
            for col in 0..dim {
                matrix.push(m[(r, col)]);
            }
        }
        Transform::affine(&matrix, &t.as_slice()[..dim], &center)
    }
}

impl FromIterator<Transform> for CompositeTransform {
    fn from_iter<I: IntoIterator<Item = Transform>>(iter: I) -> Self {
        Self {
            stages: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::CompositeTransform;
    use crate::transform::{Transform, TransformFamily};
    use nalgebra::Vector3;

    #[test]
    fn flatten_matches_chain() {
        let mut chain = CompositeTransform::new();
        chain
            .push(Transform::rigid_2d(0.3, [1.0, 2.0], [5.0, 5.0]).unwrap())
            .unwrap();
        chain
            .push(
                Transform::affine(&[1.1, 0.05, 0.0, 0.95], &[-1.0, 0.5], &[2.0, 3.0]).unwrap(),
            )
            .unwrap();
        let flat = chain.flatten().unwrap();
        assert_eq!(flat.family(), TransformFamily::Affine);
        let p = Vector3::new(3.0, 7.0, 0.0);
        assert!((flat.apply(&p) - chain.apply(&p)).norm() < 1e-9);
    }

    #[test]
    fn translations_flatten_to_translation() {
        let chain: CompositeTransform = [
            Transform::translation(&[1.0, 2.0]).unwrap(),
            Transform::translation(&[0.5, -1.0]).unwrap(),
        ]
        .into_iter()
        .collect();
        let flat = chain.flatten().unwrap();
        assert_eq!(flat.family(), TransformFamily::Translation);
        assert_eq!(flat.parameters(), &[1.5, 1.0]);
    }

    #[test]
    fn rejects_mixed_dimensions() {
        let mut chain = CompositeTransform::new();
        chain.push(Transform::translation(&[1.0, 2.0]).unwrap()).unwrap();
        assert!(chain
            .push(Transform::translation(&[1.0, 2.0, 3.0]).unwrap())
            .is_err());
        assert!(CompositeTransform::new().flatten().is_err());
    }
}
