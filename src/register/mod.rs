//! End-to-end registration of a moving channel set onto a fixed one.
//!
//! Stages run in order: proxy construction, binning, expansion of undersized
//! proxies, optional spacing normalization, automasking, coarse phase
//! correlation (optionally followed by planar pre-alignment of volumes),
//! multi-start selection and multi-resolution refinement. Numerical
//! degeneracies degrade to fallbacks and are reported as warnings; structural
//! problems are returned as errors.

use crate::image::filter::{bin_shrink, expand};
use crate::image::{ChannelSet, Image};
use crate::init::{CoarseConfig, CoarseEstimate, CoarseInitializer};
use crate::mask::{AutomaskConfig, Automasker, Mask};
use crate::observer::{LevelReport, RegistrationObserver, TracingObserver, Warning};
use crate::optimize::{LevelStack, MultiResolutionOptimizer, OptimizerConfig};
use crate::proxy::{build_proxy, ProxyConfig};
use crate::sampler::{ExtentHint, MultiStartConfig, MultiStartSampler};
use crate::trace::{trace_event, trace_span, trace_warn};
use crate::transform::{Transform, TransformFamily};
use crate::util::math::spacing_magnitude;
use crate::util::{PanelRegError, PanelRegResult};
use std::time::Instant;

mod planar;

/// Seed used when the caller does not pick one.
pub const DEFAULT_SEED: u64 = 100;

/// Smallest sample count per axis accepted without expansion.
const MIN_AXIS_SAMPLES: usize = 5;

/// Top-level registration parameters.
///
/// `sigma` and `samples_per_parameter` override the fields of the same name
/// in `optimizer`.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct RegistrationConfig {
    /// Transform family of the result.
    pub family: TransformFamily,
    /// Background masking of both proxies.
    pub automask: AutomaskConfig,
    /// In-plane bin factor applied to the proxies.
    pub bin: usize,
    /// Pyramid smoothing scale.
    pub sigma: f64,
    /// Metric samples per transform parameter.
    pub samples_per_parameter: usize,
    /// Seed for multi-start draws and metric sampling.
    pub seed: u64,
    /// Optimize with spacing and origin scaled near unit magnitude.
    pub ignore_spacing: bool,
    /// Estimate the initial translation by phase correlation.
    pub fft_initialization: bool,
    /// Pre-align volumes in-plane on their z-projections.
    pub planar_prealign: bool,
    /// Refine rigidly before refining an affine result.
    pub staged_affine: bool,
    /// Proxy construction.
    pub proxy: ProxyConfig,
    /// Coarse initialization.
    pub coarse: CoarseConfig,
    /// Multi-start sampling.
    pub multistart: MultiStartConfig,
    /// Multi-resolution optimization.
    pub optimizer: OptimizerConfig,
}

impl Default for RegistrationConfig {
    fn default() -> Self {
        Self {
            family: TransformFamily::Rigid,
            automask: AutomaskConfig::default(),
            bin: 1,
            sigma: 1.0,
            samples_per_parameter: 5000,
            seed: DEFAULT_SEED,
            ignore_spacing: false,
            fft_initialization: true,
            planar_prealign: false,
            staged_affine: true,
            proxy: ProxyConfig::default(),
            coarse: CoarseConfig::default(),
            multistart: MultiStartConfig::default(),
            optimizer: OptimizerConfig::default(),
        }
    }
}

impl RegistrationConfig {
    /// Checks this config and every nested one.
    pub fn validate(&self) -> PanelRegResult<()> {
        if self.bin == 0 {
            return Err(PanelRegError::InvalidConfig {
                reason: "bin factor must be >= 1",
            });
        }
        self.proxy.validate()?;
        self.coarse.validate()?;
        self.multistart.validate()?;
        self.optimizer_config().validate()
    }

    /// Optimizer config with the top-level overrides applied.
    pub fn optimizer_config(&self) -> OptimizerConfig {
        OptimizerConfig {
            sigma: self.sigma,
            samples_per_parameter: self.samples_per_parameter,
            ..self.optimizer.clone()
        }
    }
}

/// Outcome of one registration.
#[derive(Clone, Debug, PartialEq)]
pub struct RegistrationResult {
    /// Mapping from fixed physical space to moving physical space.
    pub transform: Transform,
    /// Finest-level normalized correlation of `transform`.
    pub metric: f64,
    /// Transform promoted by the multi-start sampler.
    pub start: Transform,
    /// Coarse estimate the sampler started from.
    pub coarse: CoarseEstimate,
    /// Per-level optimizer reports, in run order.
    pub levels: Vec<LevelReport>,
    /// Every warning raised along the way.
    pub warnings: Vec<Warning>,
}

/// Proxies and masks ready for alignment.
#[derive(Clone, Debug)]
pub(crate) struct PreparedPair {
    pub fixed: Image,
    pub moving: Image,
    pub fixed_mask: Option<Mask>,
    pub moving_mask: Option<Mask>,
}

/// Result of aligning a prepared pair.
struct Aligned {
    transform: Transform,
    metric: f64,
    start: Transform,
    levels: Vec<LevelReport>,
}

/// Per-registration state: warnings forwarded to the observer and the
/// optimizer deadline shared by every multi-resolution run.
struct RunLog<'a> {
    observer: &'a dyn RegistrationObserver,
    warnings: Vec<Warning>,
    deadline: Option<Instant>,
}

impl RunLog<'_> {
    fn push(&mut self, warning: Warning) {
        self.observer.warning(&warning);
        self.warnings.push(warning);
    }

    /// Records warnings the observer already received.
    fn extend_seen(&mut self, warnings: Vec<Warning>) {
        self.warnings.extend(warnings);
    }
}

/// Registration pipeline.
#[derive(Clone, Debug, Default)]
pub struct Registrar {
    config: RegistrationConfig,
}

impl Registrar {
    /// Creates a registrar.
    pub fn new(config: RegistrationConfig) -> Self {
        Self { config }
    }

    /// Registrar configuration.
    pub fn config(&self) -> &RegistrationConfig {
        &self.config
    }

    /// Registers `moving` onto `fixed`, reporting warnings through `tracing`.
    pub fn register(
        &self,
        fixed: &ChannelSet,
        moving: &ChannelSet,
    ) -> PanelRegResult<RegistrationResult> {
        self.register_with_observer(fixed, moving, &TracingObserver)
    }

    /// Registers independent pairs; pair `i` uses seed `seed + i`.
    ///
    /// Results are in input order and equal those of sequential calls.
    pub fn register_batch(
        &self,
        pairs: &[(ChannelSet, ChannelSet)],
    ) -> Vec<PanelRegResult<RegistrationResult>> {
        let run = |(i, (fixed, moving)): (usize, &(ChannelSet, ChannelSet))| {
            let config = RegistrationConfig {
                seed: self.config.seed.wrapping_add(i as u64),
                ..self.config.clone()
            };
            Registrar::new(config).register(fixed, moving)
        };
        #[cfg(feature = "rayon")]
        {
            use rayon::prelude::*;
            pairs.par_iter().enumerate().map(run).collect()
        }
        #[cfg(not(feature = "rayon"))]
        {
            pairs.iter().enumerate().map(run).collect()
        }
    }

    /// Registers `moving` onto `fixed`, reporting to `observer`.
    pub fn register_with_observer(
        &self,
        fixed: &ChannelSet,
        moving: &ChannelSet,
        observer: &dyn RegistrationObserver,
    ) -> PanelRegResult<RegistrationResult> {
        let _span = trace_span!("register").entered();
        let cfg = &self.config;
        cfg.validate()?;
        let dim = fixed.geometry().dim();
        if moving.geometry().dim() != dim {
            return Err(PanelRegError::InvalidDimension {
                dim: moving.geometry().dim(),
            });
        }
        let mut log = RunLog {
            observer,
            warnings: Vec::new(),
            deadline: cfg.optimizer.time_budget.map(|b| Instant::now() + b),
        };

        let fixed_proxy = self.proxy(fixed, "fixed", &mut log)?;
        let moving_proxy = self.proxy(moving, "moving", &mut log)?;

        let magnitude = if cfg.ignore_spacing {
            spacing_magnitude(fixed_proxy.geometry().spacing())
        } else {
            1.0
        };
        let (fixed_proxy, moving_proxy) = if magnitude != 1.0 {
            trace_event!("spacing_normalized", magnitude = magnitude);
            (
                fixed_proxy.with_geometry(fixed_proxy.geometry().normalized(magnitude)),
                moving_proxy.with_geometry(moving_proxy.geometry().normalized(magnitude)),
            )
        } else {
            (fixed_proxy, moving_proxy)
        };

        let (fixed_mask, moving_mask) = if cfg.automask.enabled {
            let masker = Automasker::new(cfg.automask.clone());
            (
                Some(masker.compute(&fixed_proxy)),
                Some(masker.compute(&moving_proxy)),
            )
        } else {
            (None, None)
        };
        let pair = PreparedPair {
            fixed: fixed_proxy,
            moving: moving_proxy,
            fixed_mask,
            moving_mask,
        };

        let mut coarse = self.coarse(&pair, &mut log)?;
        if cfg.planar_prealign && dim == 3 {
            let flat = planar::project_pair(&pair)?;
            let (fixed_geom, moving_geom) = (pair.fixed.geometry(), pair.moving.geometry());
            let flat_coarse = planar::planar_estimate(&coarse, fixed_geom, moving_geom)?;
            let flat_family = match cfg.family {
                TransformFamily::Translation => TransformFamily::Translation,
                _ => TransformFamily::Rigid,
            };
            let planar_result = self.align(&flat, &flat_coarse, flat_family, &mut log)?;
            trace_event!("planar_prealign", metric = planar_result.metric);
            let planar_t = &planar_result.transform;
            match planar::lift_estimate(planar_t, &coarse, fixed_geom, moving_geom) {
                Ok(lifted) => coarse = lifted,
                Err(err) => {
                    trace_warn!("planar_prealign_skipped", err);
                }
            }
        }

        let aligned = if cfg.family == TransformFamily::Affine && cfg.staged_affine {
            let rigid = self.align(&pair, &coarse, TransformFamily::Rigid, &mut log)?;
            let promoted = rigid.transform.promote(TransformFamily::Affine)?;
            let affine = self.refine(&pair, &promoted, &mut log)?;
            Aligned {
                start: rigid.start,
                levels: [rigid.levels, affine.levels].concat(),
                ..affine
            }
        } else {
            self.align(&pair, &coarse, cfg.family, &mut log)?
        };

        let restore = |t: &Transform| t.scale_space(magnitude);
        let coarse = CoarseEstimate {
            transform: restore(&coarse.transform),
            rotation_candidates: coarse
                .rotation_candidates
                .into_iter()
                .map(|mut c| {
                    c.transform = restore(&c.transform);
                    c
                })
                .collect(),
            ..coarse
        };
        trace_event!("registered", metric = aligned.metric);
        Ok(RegistrationResult {
            transform: restore(&aligned.transform),
            metric: aligned.metric,
            start: restore(&aligned.start),
            coarse,
            levels: aligned.levels,
            warnings: log.warnings,
        })
    }

    /// Proxy of one channel set, binned and expanded as configured.
    fn proxy(
        &self,
        set: &ChannelSet,
        role: &'static str,
        log: &mut RunLog<'_>,
    ) -> PanelRegResult<Image> {
        let mut proxy = build_proxy(set, &self.config.proxy)?;
        if self.config.bin > 1 {
            proxy = bin_shrink(&proxy, [self.config.bin, self.config.bin, 1]);
        }
        let geometry = proxy.geometry();
        let factors: Vec<usize> = geometry
            .size()
            .iter()
            .map(|&n| MIN_AXIS_SAMPLES.div_ceil(n.max(1)))
            .collect();
        if factors.iter().any(|&f| f > 1) {
            let mut f3 = [1usize; 3];
            f3[..factors.len()].copy_from_slice(&factors);
            proxy = expand(&proxy, f3);
            log.push(Warning::UndersizedImage { role, factors });
        }
        Ok(proxy)
    }

    /// Coarse estimate, or identity when disabled or degenerate.
    fn coarse(
        &self,
        pair: &PreparedPair,
        log: &mut RunLog<'_>,
    ) -> PanelRegResult<CoarseEstimate> {
        let dim = pair.fixed.dim();
        if !self.config.fft_initialization {
            return Ok(CoarseEstimate::identity(dim));
        }
        let initializer = CoarseInitializer::new(self.config.coarse.clone());
        match initializer.estimate(
            &pair.fixed,
            &pair.moving,
            pair.fixed_mask.as_ref(),
            pair.moving_mask.as_ref(),
        ) {
            Ok(mut estimate) => {
                for warning in std::mem::take(&mut estimate.warnings) {
                    log.push(warning);
                }
                Ok(estimate)
            }
            Err(PanelRegError::DegenerateImage { stage }) => {
                log.push(Warning::DegenerateImage { stage });
                Ok(CoarseEstimate::identity(dim))
            }
            Err(err) => Err(err),
        }
    }

    /// Multi-start selection followed by one multi-resolution run.
    fn align(
        &self,
        pair: &PreparedPair,
        coarse: &CoarseEstimate,
        family: TransformFamily,
        log: &mut RunLog<'_>,
    ) -> PanelRegResult<Aligned> {
        let stack = self.stack(pair, family)?;
        let hint = ExtentHint::from_geometries(pair.fixed.geometry(), pair.moving.geometry());
        let sampler = MultiStartSampler::new(self.config.seed, self.config.multistart.clone());
        let candidates = sampler.candidates(coarse, family, &hint);
        let selected = sampler.select(candidates, stack.coarsest())?;
        let mut aligned = self.optimize(&stack, &selected.best, log)?;
        aligned.start = selected.best;
        Ok(aligned)
    }

    /// Multi-resolution run from a known start.
    fn refine(
        &self,
        pair: &PreparedPair,
        start: &Transform,
        log: &mut RunLog<'_>,
    ) -> PanelRegResult<Aligned> {
        let stack = self.stack(pair, start.family())?;
        self.optimize(&stack, start, log)
    }

    fn stack(&self, pair: &PreparedPair, family: TransformFamily) -> PanelRegResult<LevelStack> {
        LevelStack::build(
            &pair.fixed,
            pair.fixed_mask.as_ref(),
            &pair.moving,
            pair.moving_mask.as_ref(),
            &self.config.optimizer_config(),
            family.parameter_count(pair.fixed.dim()),
            self.config.seed,
        )
    }

    fn optimize(
        &self,
        stack: &LevelStack,
        start: &Transform,
        log: &mut RunLog<'_>,
    ) -> PanelRegResult<Aligned> {
        let optimizer = MultiResolutionOptimizer::new(self.config.optimizer_config());
        let outcome = optimizer.optimize_until(stack, start, log.observer, log.deadline)?;
        log.extend_seen(outcome.warnings);
        Ok(Aligned {
            transform: outcome.transform,
            metric: outcome.metric,
            start: start.clone(),
            levels: outcome.levels,
        })
    }
}
