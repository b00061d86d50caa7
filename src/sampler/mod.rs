//! Seeded multi-start candidate generation around the coarse estimate.
//!
//! Candidates are scored once on the coarsest metric level and the best one
//! seeds the optimizer.

use crate::image::Geometry;
use crate::init::CoarseEstimate;
use crate::metric::LevelMetric;
use crate::trace::{trace_event, trace_span};
use crate::transform::{Transform, TransformFamily};
use crate::util::topk::{Ranked, TopK};
use crate::util::{PanelRegError, PanelRegResult};
use nalgebra::Vector3;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Multi-start sampling parameters.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct MultiStartConfig {
    /// Random perturbations drawn per free parameter.
    pub samples_per_parameter: usize,
    /// Perturb rotation parameters of rigid transforms as well.
    pub explore_rotation: bool,
    /// Translation half-width as a fraction of the physical extent.
    pub translation_fraction: f64,
    /// Rotation half-width in radians.
    pub max_rotation_rad: f64,
    /// Half-width for each affine matrix entry.
    pub max_affine_delta: f64,
    /// Number of best candidates reported.
    pub keep: usize,
}

impl Default for MultiStartConfig {
    fn default() -> Self {
        Self {
            samples_per_parameter: 4,
            explore_rotation: false,
            translation_fraction: 0.05,
            max_rotation_rad: 0.1,
            max_affine_delta: 0.05,
            keep: 3,
        }
    }
}

impl MultiStartConfig {
    /// Checks value ranges.
    pub fn validate(&self) -> PanelRegResult<()> {
        let widths = [
            self.translation_fraction,
            self.max_rotation_rad,
            self.max_affine_delta,
        ];
        if widths.iter().any(|w| !(w.is_finite() && *w >= 0.0)) {
            return Err(PanelRegError::InvalidConfig {
                reason: "multi-start half-widths must be finite and non-negative",
            });
        }
        if self.keep == 0 {
            return Err(PanelRegError::InvalidConfig {
                reason: "multi-start keep must be at least 1",
            });
        }
        Ok(())
    }
}

/// Physical layout of the pair being registered.
#[derive(Clone, Debug, PartialEq)]
pub struct ExtentHint {
    /// Physical extent of the fixed image per axis.
    pub extent: [f64; 3],
    /// Physical center of the fixed image.
    pub fixed_center: Vector3<f64>,
    /// Physical center of the moving image.
    pub moving_center: Vector3<f64>,
}

impl ExtentHint {
    /// Reads extents and centers from both geometries.
    pub fn from_geometries(fixed: &Geometry, moving: &Geometry) -> Self {
        let mut extent = [0.0; 3];
        for (axis, e) in extent.iter_mut().enumerate().take(fixed.dim()) {
            *e = fixed.extent(axis);
        }
        Self {
            extent,
            fixed_center: fixed.center(),
            moving_center: moving.center(),
        }
    }
}

/// Scored candidate.
#[derive(Clone, Debug, PartialEq)]
pub struct ScoredCandidate {
    /// Position in the candidate list.
    pub index: usize,
    /// Candidate transform.
    pub transform: Transform,
    /// Coarsest-level normalized correlation.
    pub score: f64,
}

impl Ranked for ScoredCandidate {
    fn score(&self) -> f64 {
        self.score
    }

    fn order(&self) -> usize {
        self.index
    }
}

/// Outcome of candidate selection.
#[derive(Clone, Debug, PartialEq)]
pub struct MultiStartOutcome {
    /// Promoted starting transform.
    pub best: Transform,
    /// Its coarsest-level score.
    pub best_score: f64,
    /// Up to `keep` best candidates, best first.
    pub ranked: Vec<ScoredCandidate>,
    /// Number of candidates scored.
    pub evaluated: usize,
}

/// Deterministic multi-start sampler.
#[derive(Clone, Debug)]
pub struct MultiStartSampler {
    seed: u64,
    config: MultiStartConfig,
}

impl MultiStartSampler {
    /// Creates a sampler drawing from `seed`.
    pub fn new(seed: u64, config: MultiStartConfig) -> Self {
        Self { seed, config }
    }

    /// Sampler configuration.
    pub fn config(&self) -> &MultiStartConfig {
        &self.config
    }

    /// Builds the ordered candidate list for `family`.
    ///
    /// Every candidate is centered on the fixed image center.
    pub fn candidates(
        &self,
        coarse: &CoarseEstimate,
        family: TransformFamily,
        hint: &ExtentHint,
    ) -> Vec<Transform> {
        let dim = coarse.transform.dim();
        let center: Vec<f64> = hint.fixed_center.as_slice()[..dim].to_vec();
        let lift = |t: &Transform| -> Option<Transform> {
            t.promote(family).and_then(|t| t.recentered(&center)).ok()
        };

        let mut out = Vec::new();
        let Some(base) = lift(&coarse.transform) else {
            return out;
        };
        out.push(base.clone());

        let identity = Transform::identity(family, dim);
        if let Some(t) = lift(&identity) {
            out.push(t);
        }

        let shift = hint.moving_center - hint.fixed_center;
        if shift.norm() > 0.0 {
            if let Ok(t) = Transform::translation(&shift.as_slice()[..dim]) {
                if let Some(t) = lift(&t) {
                    out.push(t);
                }
            }
        }

        for rotation in &coarse.rotation_candidates {
            if let Some(t) = lift(&rotation.transform) {
                out.push(t);
            }
        }

        let widths = self.half_widths(family, dim, hint);
        let free: Vec<usize> = widths
            .iter()
            .enumerate()
            .filter_map(|(k, w)| w.map(|_| k))
            .collect();
        if free.is_empty() {
            return out;
        }
        let spread = (1.0 - coarse.confidence).clamp(0.1, 1.0);
        let draws = self.config.samples_per_parameter * free.len();
        let mut rng = StdRng::seed_from_u64(self.seed);
        for _ in 0..draws {
            let mut params = base.parameters().to_vec();
            for &k in &free {
                let noise: f64 = rng.random_range(-1.0..=1.0);
                params[k] += noise * widths[k].unwrap_or(0.0) * spread;
            }
            if let Ok(t) = base.with_parameters(&params) {
                out.push(t);
            }
        }
        out
    }

    /// Half-width per parameter, `None` for parameters held fixed.
    fn half_widths(
        &self,
        family: TransformFamily,
        dim: usize,
        hint: &ExtentHint,
    ) -> Vec<Option<f64>> {
        let linear = family.linear_parameter_count(dim);
        let mut out = Vec::with_capacity(family.parameter_count(dim));
        for _ in 0..linear {
            out.push(match family {
                TransformFamily::Affine => Some(self.config.max_affine_delta),
                _ if self.config.explore_rotation => Some(self.config.max_rotation_rad),
                _ => None,
            });
        }
        for e in hint.extent.iter().take(dim) {
            out.push(Some(self.config.translation_fraction * e));
        }
        out
    }

    /// Scores every candidate on `metric` and promotes the best.
    ///
    /// Ties keep the earlier candidate. An empty list is a configuration
    /// error.
    pub fn select(
        &self,
        candidates: Vec<Transform>,
        metric: &LevelMetric,
    ) -> PanelRegResult<MultiStartOutcome> {
        let _span = trace_span!("multistart").entered();
        if candidates.is_empty() {
            return Err(PanelRegError::InvalidConfig {
                reason: "multi-start needs at least one candidate",
            });
        }
        let evaluated = candidates.len();
        let scores = score_all(&candidates, metric);

        let mut topk = TopK::new(self.config.keep);
        for (index, (transform, score)) in candidates.into_iter().zip(scores).enumerate() {
            topk.push(ScoredCandidate {
                index,
                transform,
                score,
            });
        }
        let ranked = topk.into_sorted_desc();
        let first = ranked.first().ok_or(PanelRegError::InvalidConfig {
            reason: "multi-start keep must be at least 1",
        })?;
        trace_event!(
            "multistart_selected",
            index = first.index,
            score = first.score,
            evaluated = evaluated
        );
        Ok(MultiStartOutcome {
            best: first.transform.clone(),
            best_score: first.score,
            ranked,
            evaluated,
        })
    }
}

fn score_all(candidates: &[Transform], metric: &LevelMetric) -> Vec<f64> {
    #[cfg(feature = "rayon")]
    {
        use rayon::prelude::*;
        candidates.par_iter().map(|t| metric.value(t)).collect()
    }
    #[cfg(not(feature = "rayon"))]
    {
        candidates.iter().map(|t| metric.value(t)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::{ExtentHint, MultiStartConfig, MultiStartSampler};
    use crate::image::{Geometry, Image};
    use crate::init::CoarseEstimate;
    use crate::metric::LevelMetric;
    use crate::transform::{Transform, TransformFamily};

    fn hint() -> ExtentHint {
        let geom = Geometry::unit(&[40, 40]).unwrap();
        ExtentHint::from_geometries(&geom, &geom)
    }

    #[test]
    fn larger_budget_extends_smaller_one() {
        let coarse = CoarseEstimate::identity(2);
        let few = MultiStartSampler::new(5, MultiStartConfig {
            samples_per_parameter: 1,
            ..MultiStartConfig::default()
        })
        .candidates(&coarse, TransformFamily::Rigid, &hint());
        let many = MultiStartSampler::new(5, MultiStartConfig {
            samples_per_parameter: 6,
            ..MultiStartConfig::default()
        })
        .candidates(&coarse, TransformFamily::Rigid, &hint());
        // coarse + identity + 2 free translations per sample
        assert_eq!(few.len(), 2 + 2);
        assert_eq!(many.len(), 2 + 12);
        assert_eq!(&many[..few.len()], &few[..]);
    }

    #[test]
    fn rotation_stays_fixed_unless_explored() {
        let coarse = CoarseEstimate::identity(2);
        let sampler = MultiStartSampler::new(1, MultiStartConfig::default());
        for t in sampler.candidates(&coarse, TransformFamily::Rigid, &hint()) {
            assert_eq!(t.parameters()[0], 0.0);
            assert!(t.parameters()[1].abs() <= 0.05 * 40.0 + 1e-12);
        }
        let explore = MultiStartSampler::new(1, MultiStartConfig {
            explore_rotation: true,
            ..MultiStartConfig::default()
        });
        let list = explore.candidates(&coarse, TransformFamily::Rigid, &hint());
        assert!(list.iter().any(|t| t.parameters()[0] != 0.0));
        assert_eq!(list.len(), 2 + 4 * 3);
    }

    #[test]
    fn geometry_centering_candidate() {
        let fixed = Geometry::unit(&[40, 40]).unwrap();
        let moving = fixed.with_origin(&[3.0, -2.0]).unwrap();
        let hint = ExtentHint::from_geometries(&fixed, &moving);
        let sampler = MultiStartSampler::new(0, MultiStartConfig {
            samples_per_parameter: 0,
            ..MultiStartConfig::default()
        });
        let list = sampler.candidates(&CoarseEstimate::identity(2), TransformFamily::Translation, &hint);
        assert_eq!(list.len(), 3);
        assert_eq!(list[2].parameters(), &[3.0, -2.0]);
    }

    #[test]
    fn select_prefers_best_and_earliest() {
        let geom = Geometry::unit(&[40, 40]).unwrap();
        let fixed = Image::from_fn(geom.clone(), |x, y, _| {
            let dx = x as f64 - 20.0;
            let dy = y as f64 - 18.0;
            (-(dx * dx + dy * dy) / 40.0).exp() as f32
        });
        let moving = Image::from_fn(geom, |x, y, _| {
            let dx = x as f64 - 23.0;
            let dy = y as f64 - 18.0;
            (-(dx * dx + dy * dy) / 40.0).exp() as f32
        });
        let metric = LevelMetric::new(&fixed, None, &moving, None, 1600, 0, 0.1).unwrap();
        let candidates = vec![
            Transform::translation(&[0.0, 0.0]).unwrap(),
            Transform::translation(&[3.0, 0.0]).unwrap(),
            Transform::translation(&[3.0, 0.0]).unwrap(),
            Transform::translation(&[-4.0, 0.0]).unwrap(),
        ];
        let sampler = MultiStartSampler::new(0, MultiStartConfig::default());
        let outcome = sampler.select(candidates, &metric).unwrap();
        assert_eq!(outcome.evaluated, 4);
        assert_eq!(outcome.ranked.len(), 3);
        assert_eq!(outcome.ranked[0].index, 1);
        assert_eq!(outcome.ranked[1].index, 2);
        assert_eq!(outcome.best.parameters(), &[3.0, 0.0]);
        assert!(sampler.select(Vec::new(), &metric).is_err());
    }
}
