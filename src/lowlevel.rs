//! Building blocks for custom registration pipelines.
//!
//! These expose the pieces the [`Registrar`](crate::Registrar) composes:
//! filters, pyramids, the per-level metric and its moment kernels. Most users
//! should prefer `Registrar` and `Resampler`.

pub use crate::image::filter::{
    bin_shrink, expand, gaussian_smooth, project, rescale_unit, ProjectionReduction,
};
pub use crate::image::pyramid::{ImagePyramid, PyramidLevel, MIN_LEVEL_SAMPLES};
pub use crate::init::angles::AngleGrid;
pub use crate::metric::scalar::ScalarMoments;
#[cfg(feature = "simd")]
pub use crate::metric::simd::SimdMoments;
pub use crate::metric::{LevelMetric, MetricEvaluation, MomentKernel, Moments};
pub use crate::optimize::StackLevel;
pub use crate::resample::{smallest_extent_axis, warp_image};
pub use crate::sampler::ScoredCandidate;
