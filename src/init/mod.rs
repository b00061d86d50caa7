//! Coarse translation (and optional in-plane rotation) initialization.
//!
//! Both proxies are binned in-plane and smoothed, the moving proxy is pulled
//! onto the fixed binned grid, and the translation is read off the phase
//! correlation peak.

use crate::image::filter::{bin_shrink, gaussian_smooth};
use crate::image::{Geometry, Image};
use crate::mask::Mask;
use crate::observer::Warning;
use crate::resample::{warp_image, Interpolation};
use crate::trace::{trace_event, trace_span};
use crate::transform::{Transform, TransformFamily};
use crate::util::topk::{Ranked, TopK};
use crate::util::{PanelRegError, PanelRegResult};
use nalgebra::Vector3;

pub mod angles;
pub(crate) mod phase;

use angles::AngleGrid;
use phase::{phase_correlate, PhasePeak};

const STAGE: &str = "coarse_init";

/// Grid of in-plane rotations tried during coarse initialization.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct RotationSearch {
    /// Smallest angle in degrees.
    pub min_deg: f64,
    /// Largest angle in degrees (inclusive when on the grid).
    pub max_deg: f64,
    /// Angle step in degrees.
    pub step_deg: f64,
    /// Number of best angles kept as candidates.
    pub keep: usize,
}

impl Default for RotationSearch {
    fn default() -> Self {
        Self {
            min_deg: -10.0,
            max_deg: 10.0,
            step_deg: 2.0,
            keep: 2,
        }
    }
}

/// Coarse initializer parameters.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct CoarseConfig {
    /// Requested in-plane bin factor.
    pub bin_shrink: usize,
    /// Minimum in-plane samples kept after binning.
    pub min_binned_size: usize,
    /// Gaussian width in binned samples.
    pub smoothing_sigma: f64,
    /// Apply a Hann window before the FFT.
    pub windowing: bool,
    /// Confidence below which the peak is reported as ambiguous.
    pub ambiguity_threshold: f64,
    /// Optional rotation search.
    pub rotation: Option<RotationSearch>,
}

impl Default for CoarseConfig {
    fn default() -> Self {
        Self {
            bin_shrink: 8,
            min_binned_size: 32,
            smoothing_sigma: 1.0,
            windowing: true,
            ambiguity_threshold: 0.2,
            rotation: None,
        }
    }
}

impl CoarseConfig {
    /// Checks parameter ranges.
    pub fn validate(&self) -> PanelRegResult<()> {
        if self.bin_shrink == 0 || self.min_binned_size == 0 {
            return Err(PanelRegError::InvalidConfig {
                reason: "coarse bin factor and minimum size must be >= 1",
            });
        }
        if !(self.smoothing_sigma.is_finite() && self.smoothing_sigma >= 0.0) {
            return Err(PanelRegError::InvalidConfig {
                reason: "coarse smoothing sigma must be finite and non-negative",
            });
        }
        if !(0.0..=1.0).contains(&self.ambiguity_threshold) {
            return Err(PanelRegError::InvalidConfig {
                reason: "ambiguity threshold must lie in [0, 1]",
            });
        }
        if let Some(search) = &self.rotation {
            AngleGrid::new(search.min_deg, search.max_deg, search.step_deg)?;
        }
        Ok(())
    }
}

/// Rigid candidate produced by the rotation search.
#[derive(Clone, Debug, PartialEq)]
pub struct RotationCandidate {
    /// Rotation about the fixed center combined with the correlated shift.
    pub transform: Transform,
    /// Rotation angle in degrees.
    pub angle_deg: f64,
    /// Correlation peak height.
    pub peak: f64,
}

/// Result of coarse initialization.
#[derive(Clone, Debug, PartialEq)]
pub struct CoarseEstimate {
    /// Initial transform from fixed to moving space.
    pub transform: Transform,
    /// Peak confidence in `[0, 1]`.
    pub confidence: f64,
    /// In-plane bin factor actually used.
    pub bin_factor: usize,
    /// Best rotation candidates, best first.
    pub rotation_candidates: Vec<RotationCandidate>,
    /// Recoverable conditions met while estimating.
    pub warnings: Vec<Warning>,
}

impl CoarseEstimate {
    /// Identity estimate with zero confidence.
    pub fn identity(dim: usize) -> Self {
        Self {
            transform: Transform::identity(TransformFamily::Translation, dim),
            confidence: 0.0,
            bin_factor: 1,
            rotation_candidates: Vec::new(),
            warnings: Vec::new(),
        }
    }
}

struct RankedRotation {
    order: usize,
    candidate: RotationCandidate,
}

impl Ranked for RankedRotation {
    fn score(&self) -> f64 {
        self.candidate.peak
    }

    fn order(&self) -> usize {
        self.order
    }
}

/// Phase-correlation initializer.
#[derive(Clone, Debug, Default)]
pub struct CoarseInitializer {
    config: CoarseConfig,
}

impl CoarseInitializer {
    /// Creates an initializer.
    pub fn new(config: CoarseConfig) -> Self {
        Self { config }
    }

    /// Estimates the translation mapping fixed space onto moving space.
    ///
    /// Flat proxies yield `DegenerateImage`.
    pub fn estimate(
        &self,
        fixed: &Image,
        moving: &Image,
        fixed_mask: Option<&Mask>,
        moving_mask: Option<&Mask>,
    ) -> PanelRegResult<CoarseEstimate> {
        let _span = trace_span!(STAGE).entered();
        self.config.validate()?;
        let dim = fixed.dim();
        if moving.dim() != dim {
            return Err(PanelRegError::InvalidDimension { dim: moving.dim() });
        }
        if fixed.is_uniform() || moving.is_uniform() {
            return Err(PanelRegError::DegenerateImage { stage: STAGE });
        }

        let b = self.bin_factor(&[fixed.geometry(), moving.geometry()]);
        let fixed_b = self.prepare(fixed, b);
        let moving_b = self.prepare(moving, b);
        let grid = fixed_b.geometry().clone();

        let fixed_values = masked_centered(&grid, fixed_b.data(), |p, v| {
            v.is_finite() && fixed_mask.map_or(true, |m| m.contains_point(p))
        })?;
        let identity = Transform::identity(TransformFamily::Translation, dim);
        let peak = self.correlate(&fixed_values, &moving_b, &grid, &identity, moving_mask)?;
        let shift = grid.index_vector_to_physical(&Vector3::from(peak.shift));
        let transform = Transform::translation(&shift.as_slice()[..dim])?;
        let confidence = peak.confidence();
        trace_event!("coarse_peak", confidence = confidence, bin = b);

        let mut warnings = Vec::new();
        if confidence < self.config.ambiguity_threshold {
            warnings.push(Warning::AmbiguousPeak { confidence });
        }

        let rotation_candidates = match &self.config.rotation {
            Some(search) => self.search_rotations(
                search,
                &fixed_values,
                &moving_b,
                &grid,
                fixed.geometry().center(),
                moving_mask,
            )?,
            None => Vec::new(),
        };

        Ok(CoarseEstimate {
            transform,
            confidence,
            bin_factor: b,
            rotation_candidates,
            warnings,
        })
    }

    fn bin_factor(&self, geometries: &[&Geometry]) -> usize {
        let mut b = self.config.bin_shrink;
        for geometry in geometries {
            for &n in geometry.size().iter().take(2) {
                b = b.min((n / self.config.min_binned_size).max(1));
            }
        }
        b.max(1)
    }

    fn prepare(&self, image: &Image, b: usize) -> Image {
        let binned = bin_shrink(image, [b, b, 1]);
        let spacing = binned.geometry().spacing();
        let in_plane = spacing[0].min(spacing[1]);
        gaussian_smooth(&binned, self.config.smoothing_sigma * in_plane)
    }

    fn correlate(
        &self,
        fixed_values: &[f32],
        moving: &Image,
        grid: &Geometry,
        transform: &Transform,
        moving_mask: Option<&Mask>,
    ) -> PanelRegResult<PhasePeak> {
        let warped = warp_image(moving, grid, transform, Interpolation::Linear, f32::NAN);
        let moving_values = masked_centered(grid, warped.data(), |p, v| {
            v.is_finite() && moving_mask.map_or(true, |m| m.contains_point(&transform.apply(p)))
        })?;
        phase_correlate(
            fixed_values,
            &moving_values,
            grid.size3(),
            self.config.windowing,
        )
        .ok_or(PanelRegError::DegenerateImage { stage: STAGE })
    }

    fn search_rotations(
        &self,
        search: &RotationSearch,
        fixed_values: &[f32],
        moving: &Image,
        grid: &Geometry,
        center: Vector3<f64>,
        moving_mask: Option<&Mask>,
    ) -> PanelRegResult<Vec<RotationCandidate>> {
        let angles = AngleGrid::new(search.min_deg, search.max_deg, search.step_deg)?;
        let dim = grid.dim();
        let mut best = TopK::new(search.keep);
        for (order, angle_deg) in angles.iter().enumerate() {
            let rotation = rotation_about(dim, angle_deg.to_radians(), &center, &Vector3::zeros())?;
            let Ok(peak) = self.correlate(fixed_values, moving, grid, &rotation, moving_mask) else {
                continue;
            };
            let shift = grid.index_vector_to_physical(&Vector3::from(peak.shift));
            let offset = rotation.matrix() * shift;
            let transform = rotation_about(dim, angle_deg.to_radians(), &center, &offset)?;
            best.push(RankedRotation {
                order,
                candidate: RotationCandidate {
                    transform,
                    angle_deg,
                    peak: peak.peak,
                },
            });
        }
        Ok(best
            .into_sorted_desc()
            .into_iter()
            .map(|r| r.candidate)
            .collect())
    }
}

fn rotation_about(
    dim: usize,
    angle: f64,
    center: &Vector3<f64>,
    offset: &Vector3<f64>,
) -> PanelRegResult<Transform> {
    if dim == 2 {
        Transform::rigid_2d(angle, [offset[0], offset[1]], [center[0], center[1]])
    } else {
        Transform::rigid_3d(
            [0.0, 0.0, angle],
            [offset[0], offset[1], offset[2]],
            [center[0], center[1], center[2]],
        )
    }
}

/// Subtracts the mean of the accepted samples and zeroes the rest.
fn masked_centered<F>(grid: &Geometry, values: &[f32], accept: F) -> PanelRegResult<Vec<f32>>
where
    F: Fn(&Vector3<f64>, f32) -> bool,
{
    let [nx, ny, nz] = grid.size3();
    let mut keep = vec![false; values.len()];
    let mut sum = 0.0f64;
    let mut count = 0usize;
    for z in 0..nz {
        for y in 0..ny {
            for x in 0..nx {
                let i = grid.offset(x, y, z);
                let p = grid.index_to_physical(&Vector3::new(x as f64, y as f64, z as f64));
                if accept(&p, values[i]) {
                    keep[i] = true;
                    sum += values[i] as f64;
                    count += 1;
                }
            }
        }
    }
    if count == 0 {
        return Err(PanelRegError::DegenerateImage { stage: STAGE });
    }
    let mean = (sum / count as f64) as f32;
    Ok(values
        .iter()
        .zip(keep.iter())
        .map(|(&v, &k)| if k { v - mean } else { 0.0 })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::{CoarseConfig, CoarseInitializer, RotationSearch};
    use crate::image::{Geometry, Image};
    use crate::transform::TransformFamily;
    use crate::util::PanelRegError;
    use nalgebra::Vector3;

    fn blobs(geom: &Geometry, shift: [f64; 2]) -> Image {
        let centers = [(40.0, 50.0, 6.0), (80.0, 70.0, 8.0), (60.0, 100.0, 5.0)];
        Image::from_fn(geom.clone(), |x, y, _| {
            centers
                .iter()
                .map(|&(cx, cy, s)| {
                    let dx = x as f64 - cx - shift[0];
                    let dy = y as f64 - cy - shift[1];
                    (-(dx * dx + dy * dy) / (2.0 * s * s)).exp()
                })
                .sum::<f64>() as f32
        })
    }

    #[test]
    fn recovers_translation_in_physical_units() {
        let geom = Geometry::unit(&[128, 144])
            .unwrap()
            .with_spacing(&[0.5, 0.5])
            .unwrap();
        let fixed = blobs(&geom, [0.0, 0.0]);
        let moving = blobs(&geom, [8.0, -6.0]);
        let init = CoarseInitializer::new(CoarseConfig {
            bin_shrink: 2,
            ..CoarseConfig::default()
        });
        let est = init.estimate(&fixed, &moving, None, None).unwrap();
        assert_eq!(est.bin_factor, 2);
        assert_eq!(est.transform.family(), TransformFamily::Translation);
        let t = est.transform.parameters();
        assert!((t[0] - 4.0).abs() < 0.5, "{t:?}");
        assert!((t[1] + 3.0).abs() < 0.5, "{t:?}");
        assert!(est.confidence > 0.0);
    }

    #[test]
    fn flat_proxy_is_degenerate() {
        let geom = Geometry::unit(&[64, 64]).unwrap();
        let flat = Image::filled(geom.clone(), 1.0);
        let other = blobs(&geom, [0.0, 0.0]);
        let err = CoarseInitializer::default()
            .estimate(&flat, &other, None, None)
            .unwrap_err();
        assert_eq!(err, PanelRegError::DegenerateImage { stage: "coarse_init" });
    }

    #[test]
    fn rotation_search_finds_small_rotation() {
        let geom = Geometry::unit(&[128, 144]).unwrap();
        let fixed = blobs(&geom, [0.0, 0.0]);
        let angle = 6f64.to_radians();
        let center = geom.center();
        let rot = crate::transform::Transform::rigid_2d(angle, [0.0, 0.0], [center[0], center[1]])
            .unwrap();
        let inv = rot.inverse().unwrap();
        let moving = crate::resample::warp_image(
            &fixed,
            &geom,
            &inv,
            crate::resample::Interpolation::Linear,
            0.0,
        );
        let init = CoarseInitializer::new(CoarseConfig {
            bin_shrink: 2,
            rotation: Some(RotationSearch {
                min_deg: -10.0,
                max_deg: 10.0,
                step_deg: 2.0,
                keep: 1,
            }),
            ..CoarseConfig::default()
        });
        let est = init.estimate(&fixed, &moving, None, None).unwrap();
        assert_eq!(est.rotation_candidates.len(), 1);
        let best = &est.rotation_candidates[0];
        assert!((best.angle_deg - 6.0).abs() < 2.5, "{}", best.angle_deg);
        let p = Vector3::new(60.0, 70.0, 0.0);
        assert!((best.transform.apply(&p) - rot.apply(&p)).norm() < 3.0);
    }
}
