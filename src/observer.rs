//! Warning reporting for registration runs.
//!
//! Numerical degeneracies never abort a registration. They are reported to a
//! [`RegistrationObserver`] and collected into the result instead.

use crate::trace::trace_warn;
use std::fmt;

/// Recoverable conditions met during registration.
#[derive(Clone, Debug, PartialEq)]
pub enum Warning {
    /// An image had no usable signal; the stage fell back to a default.
    DegenerateImage {
        /// Stage that hit the degenerate input.
        stage: &'static str,
    },
    /// Phase correlation found no dominant peak.
    AmbiguousPeak {
        /// Peak confidence in `[0, 1]`.
        confidence: f64,
    },
    /// An optimizer level did not improve over its starting point.
    ConvergenceFailure {
        /// Shrink factor of the level.
        factor: usize,
        /// Metric at the level start.
        start_metric: f64,
        /// Metric at the level end.
        end_metric: f64,
    },
    /// An image was too small along some axis and got expanded.
    UndersizedImage {
        /// Which input was expanded (`"fixed"` or `"moving"`).
        role: &'static str,
        /// Per-axis expansion factors.
        factors: Vec<usize>,
    },
}

impl Warning {
    /// Stable short name of the warning kind.
    pub fn name(&self) -> &'static str {
        match self {
            Warning::DegenerateImage { .. } => "degenerate_image",
            Warning::AmbiguousPeak { .. } => "ambiguous_peak",
            Warning::ConvergenceFailure { .. } => "convergence_failure",
            Warning::UndersizedImage { .. } => "undersized_image",
        }
    }
}

impl fmt::Display for Warning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Warning::DegenerateImage { stage } => {
                write!(f, "degenerate image in {stage}, using fallback")
            }
            Warning::AmbiguousPeak { confidence } => {
                write!(f, "ambiguous correlation peak (confidence {confidence:.3})")
            }
            Warning::ConvergenceFailure {
                factor,
                start_metric,
                end_metric,
            } => write!(
                f,
                "level x{factor} did not improve ({start_metric:.5} -> {end_metric:.5})"
            ),
            Warning::UndersizedImage { role, factors } => {
                write!(f, "{role} image expanded by {factors:?}")
            }
        }
    }
}

/// Progress summary of one optimizer level.
#[derive(Clone, Debug, PartialEq)]
pub struct LevelReport {
    /// Shrink factor of the level.
    pub factor: usize,
    /// Iterations run.
    pub iterations: usize,
    /// Metric (normalized correlation) at the level start.
    pub start_metric: f64,
    /// Metric (normalized correlation) at the level end.
    pub end_metric: f64,
    /// Reason the level stopped.
    pub stop: StopReason,
}

/// Why an optimizer level terminated.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopReason {
    /// Step length fell below the minimum.
    MinStep,
    /// Iteration limit reached.
    MaxIterations,
    /// Improvement stalled over the convergence window.
    Converged,
    /// Time budget exhausted.
    TimeBudget,
    /// Too few valid samples to evaluate the metric.
    NoOverlap,
}

/// Sink for registration warnings and progress.
pub trait RegistrationObserver: Sync {
    /// Receives a recoverable warning.
    fn warning(&self, warning: &Warning);

    /// Receives a finished optimizer level.
    fn level_finished(&self, _report: &LevelReport) {}
}

/// Forwards warnings to `tracing` when the feature is enabled.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingObserver;

impl RegistrationObserver for TracingObserver {
    fn warning(&self, warning: &Warning) {
        trace_warn!("registration_warning", warning);
    }
}

/// Discards everything.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopObserver;

impl RegistrationObserver for NoopObserver {
    fn warning(&self, _warning: &Warning) {}
}

#[cfg(test)]
mod tests {
    use super::Warning;

    #[test]
    fn warnings_render_readably() {
        let w = Warning::AmbiguousPeak { confidence: 0.125 };
        assert_eq!(w.to_string(), "ambiguous correlation peak (confidence 0.125)");
        assert_eq!(w.name(), "ambiguous_peak");
        let u = Warning::UndersizedImage {
            role: "moving",
            factors: vec![1, 2],
        };
        assert_eq!(u.to_string(), "moving image expanded by [1, 2]");
    }
}
