//! Coarse-to-fine optimization of the masked correlation metric.
//!
//! Levels run in shrink-schedule order, each seeded with the previous
//! level's result. The start and every level result are scored on the
//! finest level and the best of them is returned, so the outcome never
//! scores worse than the start.

use crate::image::pyramid::ImagePyramid;
use crate::image::Image;
use crate::mask::Mask;
use crate::metric::LevelMetric;
use crate::observer::{LevelReport, RegistrationObserver, StopReason, Warning};
use crate::trace::{trace_event, trace_span};
use crate::transform::Transform;
use crate::util::{PanelRegError, PanelRegResult};
use std::time::{Duration, Instant};

mod step;

/// Optimizer and pyramid parameters.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct OptimizerConfig {
    /// Shrink factor per level, coarsest first.
    pub shrink_factors: Vec<usize>,
    /// Smoothing width in units of factor times smallest spacing.
    pub sigma: f64,
    /// Metric samples drawn per transform parameter.
    pub samples_per_parameter: usize,
    /// Iteration limit per level.
    pub max_iterations: usize,
    /// Initial step length in level voxels.
    pub max_step: f64,
    /// Step length below which a level stops.
    pub min_step: f64,
    /// Step length multiplier after a rejected step.
    pub relaxation: f64,
    /// Accepted steps compared by the convergence test.
    pub convergence_window: usize,
    /// Relative improvement below which a level has converged.
    pub convergence_tolerance: f64,
    /// Fraction of fixed samples that must map inside the moving image.
    pub min_valid_fraction: f64,
    /// Wall-clock limit for the whole optimization.
    pub time_budget: Option<Duration>,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            shrink_factors: vec![4, 2, 1],
            sigma: 1.0,
            samples_per_parameter: 5000,
            max_iterations: 200,
            max_step: 1.0,
            min_step: 0.01,
            relaxation: 0.5,
            convergence_window: 10,
            convergence_tolerance: 1e-6,
            min_valid_fraction: 0.1,
            time_budget: None,
        }
    }
}

impl OptimizerConfig {
    /// Checks value ranges.
    pub fn validate(&self) -> PanelRegResult<()> {
        let invalid = |reason: &'static str| -> PanelRegResult<()> {
            Err(PanelRegError::InvalidConfig { reason })
        };
        if self.shrink_factors.is_empty() || self.shrink_factors.contains(&0) {
            return invalid("shrink schedule must be non-empty with positive factors");
        }
        if !(self.sigma.is_finite() && self.sigma >= 0.0) {
            return invalid("smoothing sigma must be finite and non-negative");
        }
        if self.samples_per_parameter == 0 {
            return invalid("samples per parameter must be positive");
        }
        if self.max_iterations == 0 {
            return invalid("max iterations must be positive");
        }
        if !(self.max_step > 0.0 && self.min_step > 0.0 && self.min_step <= self.max_step) {
            return invalid("step lengths must satisfy 0 < min_step <= max_step");
        }
        if !(self.relaxation > 0.0 && self.relaxation < 1.0) {
            return invalid("relaxation must lie in (0, 1)");
        }
        if !(self.convergence_tolerance >= 0.0) {
            return invalid("convergence tolerance must be non-negative");
        }
        if !(0.0..=1.0).contains(&self.min_valid_fraction) {
            return invalid("min valid fraction must lie in [0, 1]");
        }
        Ok(())
    }
}

/// One level of a [`LevelStack`].
#[derive(Clone, Debug)]
pub struct StackLevel {
    /// Requested shrink factor.
    pub factor: usize,
    /// Metric bound to the shrunk pair.
    pub metric: LevelMetric,
}

/// Per-level metrics for one fixed/moving pair, coarsest first.
#[derive(Clone, Debug)]
pub struct LevelStack {
    dim: usize,
    levels: Vec<StackLevel>,
}

impl LevelStack {
    /// Builds pyramids for both images and a metric per level.
    ///
    /// Each level draws `n_params × samples_per_parameter` fixed samples
    /// (clamped to the masked level size) with seed `seed + level`.
    #[allow(clippy::too_many_arguments)]
    pub fn build(
        fixed: &Image,
        fixed_mask: Option<&Mask>,
        moving: &Image,
        moving_mask: Option<&Mask>,
        config: &OptimizerConfig,
        n_params: usize,
        seed: u64,
    ) -> PanelRegResult<Self> {
        config.validate()?;
        if fixed.dim() != moving.dim() {
            return Err(PanelRegError::InvalidDimension { dim: moving.dim() });
        }
        let fixed_pyramid = ImagePyramid::build(fixed, &config.shrink_factors, config.sigma)?;
        let moving_pyramid = ImagePyramid::build(moving, &config.shrink_factors, config.sigma)?;
        let count = n_params.max(1).saturating_mul(config.samples_per_parameter);
        let levels = fixed_pyramid
            .levels()
            .iter()
            .zip(moving_pyramid.levels())
            .enumerate()
            .map(|(i, (f, m))| {
                let metric = LevelMetric::new(
                    &f.image,
                    fixed_mask,
                    &m.image,
                    moving_mask,
                    count,
                    seed.wrapping_add(i as u64),
                    config.min_valid_fraction,
                )?;
                Ok(StackLevel {
                    factor: f.factor,
                    metric,
                })
            })
            .collect::<PanelRegResult<Vec<_>>>()?;
        Ok(Self {
            dim: fixed.dim(),
            levels,
        })
    }

    /// Spatial dimension of the pair.
    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Levels, coarsest first.
    pub fn levels(&self) -> &[StackLevel] {
        &self.levels
    }

    /// Coarsest level metric.
    pub fn coarsest(&self) -> &LevelMetric {
        &self.levels[0].metric
    }

    /// Finest level metric.
    pub fn finest(&self) -> &LevelMetric {
        &self.levels[self.levels.len() - 1].metric
    }
}

/// Result of a multi-resolution run.
#[derive(Clone, Debug, PartialEq)]
pub struct OptimizationOutcome {
    /// Best transform found.
    pub transform: Transform,
    /// Its finest-level normalized correlation.
    pub metric: f64,
    /// Finest-level normalized correlation of the start.
    pub start_metric: f64,
    /// One report per level run.
    pub levels: Vec<LevelReport>,
    /// Warnings raised while optimizing.
    pub warnings: Vec<Warning>,
}

/// Coarse-to-fine regular-step optimizer.
#[derive(Clone, Debug, Default)]
pub struct MultiResolutionOptimizer {
    config: OptimizerConfig,
}

impl MultiResolutionOptimizer {
    /// Creates an optimizer.
    pub fn new(config: OptimizerConfig) -> Self {
        Self { config }
    }

    /// Optimizer configuration.
    pub fn config(&self) -> &OptimizerConfig {
        &self.config
    }

    /// Refines `start` level by level within `time_budget` from now.
    pub fn optimize(
        &self,
        stack: &LevelStack,
        start: &Transform,
        observer: &dyn RegistrationObserver,
    ) -> PanelRegResult<OptimizationOutcome> {
        let deadline = self.config.time_budget.map(|b| Instant::now() + b);
        self.optimize_until(stack, start, observer, deadline)
    }

    /// Refines `start` level by level, stopping at `deadline`.
    ///
    /// Callers running several optimizations against one budget pass the
    /// same deadline to each.
    pub fn optimize_until(
        &self,
        stack: &LevelStack,
        start: &Transform,
        observer: &dyn RegistrationObserver,
        deadline: Option<Instant>,
    ) -> PanelRegResult<OptimizationOutcome> {
        self.config.validate()?;
        if start.dim() != stack.dim() {
            return Err(PanelRegError::InvalidDimension { dim: start.dim() });
        }
        let finest = stack.finest();

        let start_metric = finest.value(start);
        let mut best = start.clone();
        let mut best_metric = start_metric;
        let mut seed = start.clone();
        let mut seed_metric = start_metric;
        let mut levels = Vec::with_capacity(stack.levels().len());
        let mut warnings = Vec::new();

        for level in stack.levels() {
            let _span = trace_span!("optimize_level", factor = level.factor).entered();
            let run = step::ascend(&level.metric, &seed, &self.config, deadline);
            let report = LevelReport {
                factor: level.factor,
                iterations: run.iterations,
                start_metric: run.start_metric,
                end_metric: run.end_metric,
                stop: run.stop,
            };
            trace_event!(
                "level_done",
                factor = level.factor,
                iterations = run.iterations,
                metric = run.end_metric
            );
            observer.level_finished(&report);
            levels.push(report);

            let score = finest.value(&run.transform);
            if run.stop == StopReason::NoOverlap || score < seed_metric - 1e-9 {
                let warning = Warning::ConvergenceFailure {
                    factor: level.factor,
                    start_metric: seed_metric,
                    end_metric: score,
                };
                observer.warning(&warning);
                warnings.push(warning);
            }
            if score >= best_metric {
                best = run.transform.clone();
                best_metric = score;
            }
            seed = run.transform;
            seed_metric = score;
            if run.stop == StopReason::TimeBudget {
                break;
            }
        }

        Ok(OptimizationOutcome {
            transform: best,
            metric: best_metric,
            start_metric,
            levels,
            warnings,
        })
    }
}
