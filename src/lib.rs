//! panelreg registers multi-channel microscopy panels across imaging cycles.
//!
//! A moving channel set is reduced to a scalar proxy, coarsely aligned to the
//! fixed proxy by phase correlation, seeded through a deterministic
//! multi-start search and refined coarse-to-fine on a masked normalized
//! correlation. The resulting [`Transform`] maps fixed physical points into
//! moving physical space and drives the [`Resampler`].
//!
//! Optional features: `rayon` for parallel loops and batch registration,
//! `simd` for the `wide` moment kernel, `serde` for transforms and configs,
//! `tracing` for spans and events, `image-io` for PNG/TIFF helpers.

pub mod image;
pub mod init;
pub mod lowlevel;
pub mod mask;
pub mod metric;
pub mod observer;
pub mod optimize;
pub mod proxy;
pub mod register;
pub mod resample;
pub mod sampler;
mod trace;
pub mod transform;
pub mod util;

pub use image::filter::ProjectionReduction;
pub use image::{ChannelSet, Encoding, Geometry, Image};
pub use init::{CoarseConfig, CoarseEstimate, CoarseInitializer, RotationSearch};
pub use mask::{AutomaskConfig, Automasker, Mask, MaskMethod};
pub use observer::{
    LevelReport, NoopObserver, RegistrationObserver, StopReason, TracingObserver, Warning,
};
pub use optimize::{LevelStack, MultiResolutionOptimizer, OptimizationOutcome, OptimizerConfig};
pub use proxy::{build_proxy, ProxyConfig, Reduction};
pub use register::{Registrar, RegistrationConfig, RegistrationResult, DEFAULT_SEED};
pub use resample::{
    Blend, Interpolation, OutputMode, Projection, ResampleConfig, Resampled, Resampler,
};
pub use sampler::{ExtentHint, MultiStartConfig, MultiStartOutcome, MultiStartSampler};
pub use transform::{CompositeTransform, Transform, TransformFamily};
pub use util::{ErrorKind, PanelRegError, PanelRegResult};
