//! Regular-step gradient ascent on one pyramid level.

use super::OptimizerConfig;
use crate::metric::LevelMetric;
use crate::observer::StopReason;
use crate::transform::Transform;
use std::time::Instant;

/// Result of one level run.
#[derive(Clone, Debug)]
pub(crate) struct LevelRun {
    pub transform: Transform,
    pub iterations: usize,
    pub start_metric: f64,
    pub end_metric: f64,
    pub stop: StopReason,
}

/// Climbs the normalized correlation from `start`.
///
/// The step direction is the gradient divided by the index-shift scales and
/// the step is sized so no sample point moves by more than the current step
/// length in level voxels. Rejected steps shrink the step length by the
/// relaxation factor.
pub(crate) fn ascend(
    metric: &LevelMetric,
    start: &Transform,
    config: &OptimizerConfig,
    deadline: Option<Instant>,
) -> LevelRun {
    let mut current = start.clone();
    let mut eval = metric.evaluate(&current);
    let start_metric = eval.value;
    let mut run = LevelRun {
        transform: current.clone(),
        iterations: 0,
        start_metric,
        end_metric: start_metric,
        stop: StopReason::MaxIterations,
    };
    if eval.value == 0.0 && eval.gradient.iter().all(|&g| g == 0.0) {
        run.stop = StopReason::NoOverlap;
        return run;
    }

    let scales = metric.parameter_scales(&current);
    let mut step = config.max_step;
    let mut history = vec![eval.value];
    while run.iterations < config.max_iterations {
        if deadline.is_some_and(|d| Instant::now() >= d) {
            run.stop = StopReason::TimeBudget;
            break;
        }
        run.iterations += 1;

        let direction: Vec<f64> = eval
            .gradient
            .iter()
            .zip(scales.iter())
            .map(|(g, s)| g / s)
            .collect();
        let shift = metric.max_voxel_shift(&current, &direction);
        if !(shift.is_finite() && shift > 0.0) {
            run.stop = StopReason::Converged;
            break;
        }
        let factor = step / shift;
        let params: Vec<f64> = current
            .parameters()
            .iter()
            .zip(direction.iter())
            .map(|(p, d)| p + factor * d)
            .collect();
        let Ok(candidate) = current.with_parameters(&params) else {
            run.stop = StopReason::Converged;
            break;
        };
        let next = metric.evaluate(&candidate);
        if next.value > eval.value {
            current = candidate;
            eval = next;
            history.push(eval.value);
            if stalled(&history, config) {
                run.stop = StopReason::Converged;
                break;
            }
        } else {
            step *= config.relaxation;
            if step < config.min_step {
                run.stop = StopReason::MinStep;
                break;
            }
        }
    }
    run.transform = current;
    run.end_metric = eval.value;
    run
}

/// Relative improvement over the last `convergence_window` accepted steps.
fn stalled(history: &[f64], config: &OptimizerConfig) -> bool {
    let window = config.convergence_window;
    if window == 0 || history.len() <= window {
        return false;
    }
    let last = history[history.len() - 1];
    let before = history[history.len() - 1 - window];
    (last - before) / before.abs().max(1e-12) < config.convergence_tolerance
}
