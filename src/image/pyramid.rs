//! Multi-resolution image pyramids.
//!
//! Each level is smoothed with a Gaussian whose physical width grows with the
//! shrink factor, then block-averaged. Factors are clamped per axis so that
//! every level keeps enough samples to be registered.

use crate::image::filter::{bin_shrink, gaussian_smooth};
use crate::image::Image;
use crate::util::{PanelRegError, PanelRegResult};

/// Smallest sample count an axis may be shrunk to.
pub const MIN_LEVEL_SAMPLES: usize = 4;

/// One resolution level.
#[derive(Clone, Debug)]
pub struct PyramidLevel {
    /// Requested shrink factor for this level.
    pub factor: usize,
    /// Shrunk image.
    pub image: Image,
}

/// Owned image pyramid ordered as the shrink schedule (coarsest first).
#[derive(Clone, Debug)]
pub struct ImagePyramid {
    levels: Vec<PyramidLevel>,
}

impl ImagePyramid {
    /// Builds one level per entry of `schedule`.
    ///
    /// `sigma` is the smoothing width in units of the shrink factor times the
    /// smallest spacing; zero disables smoothing.
    pub fn build(base: &Image, schedule: &[usize], sigma: f64) -> PanelRegResult<Self> {
        if schedule.is_empty() || schedule.iter().any(|&f| f == 0) {
            return Err(PanelRegError::InvalidConfig {
                reason: "shrink schedule must be non-empty with positive factors",
            });
        }
        if !(sigma.is_finite() && sigma >= 0.0) {
            return Err(PanelRegError::InvalidConfig {
                reason: "smoothing sigma must be finite and non-negative",
            });
        }
        let min_spacing = base.geometry().min_spacing();
        let levels = schedule
            .iter()
            .map(|&factor| {
                let factors = level_factors(base, factor);
                let image = if factor == 1 && sigma == 0.0 {
                    base.clone()
                } else {
                    let smoothed = gaussian_smooth(base, sigma * factor as f64 * min_spacing);
                    bin_shrink(&smoothed, factors)
                };
                PyramidLevel { factor, image }
            })
            .collect();
        Ok(Self { levels })
    }

    /// Returns the levels in schedule order.
    pub fn levels(&self) -> &[PyramidLevel] {
        &self.levels
    }

    /// Returns a level by index.
    pub fn level(&self, idx: usize) -> Option<&PyramidLevel> {
        self.levels.get(idx)
    }

    /// Number of levels.
    pub fn len(&self) -> usize {
        self.levels.len()
    }

    /// Returns true when the pyramid has no levels.
    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }
}

/// Per-axis shrink factors for a requested level factor.
pub(crate) fn level_factors(image: &Image, factor: usize) -> [usize; 3] {
    let geometry = image.geometry();
    let size = geometry.size3();
    let mut out = [1usize; 3];
    for axis in 0..geometry.dim() {
        let limit = (size[axis] / MIN_LEVEL_SAMPLES).max(1);
        out[axis] = factor.min(limit).max(1);
    }
    out
}
