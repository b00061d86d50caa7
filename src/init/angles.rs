//! Discrete in-plane rotation grid for the coarse rotation search.

use crate::util::math::wrap_deg;
use crate::util::{PanelRegError, PanelRegResult};

/// Angles `min_deg + k · step_deg` in `[min_deg, max_deg]`, wrapped to
/// `[-180, 180)`.
#[derive(Clone, Debug, PartialEq)]
pub struct AngleGrid {
    min_deg: f64,
    max_deg: f64,
    step_deg: f64,
    len: usize,
}

impl AngleGrid {
    /// Creates a grid over `[min_deg, max_deg]` with a positive step.
    ///
    /// The upper bound is included when it falls on the grid, so a symmetric
    /// range such as `[-10, 10]` with step 5 yields five angles including 0.
    pub fn new(min_deg: f64, max_deg: f64, step_deg: f64) -> PanelRegResult<Self> {
        if !min_deg.is_finite() || !max_deg.is_finite() || !step_deg.is_finite() {
            return Err(PanelRegError::InvalidConfig {
                reason: "non-finite angle grid parameters",
            });
        }
        if step_deg <= 0.0 {
            return Err(PanelRegError::InvalidConfig {
                reason: "rotation step must be > 0",
            });
        }
        if max_deg < min_deg {
            return Err(PanelRegError::InvalidConfig {
                reason: "rotation max must not be below min",
            });
        }
        if max_deg - min_deg >= 360.0 {
            return Err(PanelRegError::InvalidConfig {
                reason: "rotation range must span less than a full turn",
            });
        }
        let len = ((max_deg - min_deg) / step_deg + 1e-9).floor() as usize + 1;
        Ok(Self {
            min_deg,
            max_deg,
            step_deg,
            len,
        })
    }

    /// Number of angles in the grid.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Always false; a valid grid holds at least one angle.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Lower bound in degrees.
    pub fn min_deg(&self) -> f64 {
        self.min_deg
    }

    /// Upper bound in degrees.
    pub fn max_deg(&self) -> f64 {
        self.max_deg
    }

    /// Wrapped angle in degrees for an index.
    pub fn angle_at(&self, idx: usize) -> f64 {
        debug_assert!(idx < self.len);
        wrap_deg(self.min_deg + idx as f64 * self.step_deg)
    }

    /// Iterates over all angles in degrees.
    pub fn iter(&self) -> impl Iterator<Item = f64> + '_ {
        (0..self.len).map(|idx| self.angle_at(idx))
    }
}

#[cfg(test)]
mod tests {
    use super::AngleGrid;

    #[test]
    fn symmetric_grid_contains_zero() {
        let grid = AngleGrid::new(-10.0, 10.0, 5.0).unwrap();
        let angles: Vec<f64> = grid.iter().collect();
        assert_eq!(angles, vec![-10.0, -5.0, 0.0, 5.0, 10.0]);
    }

    #[test]
    fn angles_wrap_into_half_open_range() {
        let grid = AngleGrid::new(170.0, 190.0, 10.0).unwrap();
        assert_eq!(grid.len(), 3);
        assert!((grid.angle_at(1) + 180.0).abs() < 1e-9);
    }

    #[test]
    fn rejects_invalid_grids() {
        assert!(AngleGrid::new(0.0, 10.0, 0.0).is_err());
        assert!(AngleGrid::new(10.0, 0.0, 1.0).is_err());
        assert!(AngleGrid::new(-180.0, 180.0, 1.0).is_err());
        assert!(AngleGrid::new(f64::NAN, 1.0, 1.0).is_err());
    }
}
