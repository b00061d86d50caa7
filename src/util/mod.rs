//! Shared utility helpers.

pub mod error;
pub(crate) mod math;
pub(crate) mod par;
pub(crate) mod topk;

pub use error::{ErrorKind, PanelRegError, PanelRegResult};
