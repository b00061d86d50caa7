//! Error types for panelreg.

use thiserror::Error;

/// Result alias for panelreg operations.
pub type PanelRegResult<T> = std::result::Result<T, PanelRegError>;

/// Coarse classification of [`PanelRegError`] values.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// Structural problem with caller-supplied data or configuration.
    InvalidInput,
    /// An image carries no usable signal for the requested stage.
    DegenerateImage,
    /// A transform cannot be applied to the requested grid.
    ResampleGeometryMismatch,
    /// Transform parameters are malformed or cannot be inverted.
    InvalidTransform,
}

/// Errors that can occur when registering or resampling panels.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum PanelRegError {
    /// A channel set was constructed without channels.
    #[error("channel set is empty")]
    EmptyChannelSet,
    /// A channel disagrees with the first channel of its set.
    #[error("channel {index} does not match the channel set: {reason}")]
    ChannelMismatch { index: usize, reason: &'static str },
    /// Only 2D and 3D images are supported.
    #[error("unsupported dimension {dim}, expected 2 or 3")]
    InvalidDimension { dim: usize },
    /// Spacing must be finite and strictly positive.
    #[error("invalid spacing {spacing} on axis {axis}")]
    InvalidSpacing { axis: usize, spacing: f64 },
    /// Direction cosines must form an orthonormal matrix.
    #[error("direction matrix is not orthonormal")]
    InvalidDirection,
    /// Sample buffer length disagrees with the geometry.
    #[error("sample buffer has {got} elements, geometry needs {needed}")]
    BufferSizeMismatch { needed: usize, got: usize },
    /// A configuration value is out of range.
    #[error("invalid configuration: {reason}")]
    InvalidConfig { reason: &'static str },
    /// An image has no usable signal for the given stage.
    #[error("degenerate image in {stage}")]
    DegenerateImage { stage: &'static str },
    /// The transform dimension disagrees with the target grid.
    #[error("transform is {transform_dim}D but the target grid is {grid_dim}D")]
    ResampleGeometryMismatch {
        transform_dim: usize,
        grid_dim: usize,
    },
    /// Parameter vector length does not fit the transform family.
    #[error("{family} {dim}D transform needs {expected} parameters, got {got}")]
    InvalidParameters {
        family: &'static str,
        dim: usize,
        expected: usize,
        got: usize,
    },
    /// The linear part of the transform is singular.
    #[error("transform is not invertible")]
    NonInvertibleTransform,
    /// Image decoding or encoding failed.
    #[cfg(feature = "image-io")]
    #[error("image io failed: {reason}")]
    ImageIo { reason: String },
}

impl PanelRegError {
    /// Returns the error class used by the propagation policy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            PanelRegError::EmptyChannelSet
            | PanelRegError::ChannelMismatch { .. }
            | PanelRegError::InvalidDimension { .. }
            | PanelRegError::InvalidSpacing { .. }
            | PanelRegError::InvalidDirection
            | PanelRegError::BufferSizeMismatch { .. }
            | PanelRegError::InvalidConfig { .. } => ErrorKind::InvalidInput,
            #[cfg(feature = "image-io")]
            PanelRegError::ImageIo { .. } => ErrorKind::InvalidInput,
            PanelRegError::DegenerateImage { .. } => ErrorKind::DegenerateImage,
            PanelRegError::ResampleGeometryMismatch { .. } => ErrorKind::ResampleGeometryMismatch,
            PanelRegError::InvalidParameters { .. } | PanelRegError::NonInvertibleTransform => {
                ErrorKind::InvalidTransform
            }
        }
    }
}
