//! Error taxonomy shared by the layer, the descriptors and the primitive wrappers.
//!
//! Every variant is terminal for the caller: a failed primitive call or a shape
//! disagreement signals a configuration defect, not a condition worth retrying.

use std::fmt;

use thiserror::Error;

use crate::layout::LayoutConversionError;
use crate::library::Status;

/// Logical (n, c, h, w) extents reported in shape mismatch errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dims4(pub [usize; 4]);

impl fmt::Display for Dims4 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [n, c, h, w] = self.0;
        write!(f, "[n={n}, c={c}, h={h}, w={w}]")
    }
}

#[derive(Debug, Error)]
pub enum ConvError {
    #[error("incompatible shape of {tensor} with layer: expected {expected}, got {actual}")]
    ShapeMismatch {
        tensor: &'static str,
        expected: Dims4,
        actual: Dims4,
    },
    #[error("{op} failed with status {status}")]
    Primitive { op: &'static str, status: Status },
    #[error("{op} is not implemented")]
    NotImplemented { op: &'static str },
    #[error("convolution primitives are not initialized; call setup before forward/backward")]
    NotInitialized,
    #[error("layout error: {0}")]
    Layout(String),
    #[error("invalid convolution configuration: {0}")]
    InvalidConfig(String),
    #[error("unknown primitive library '{0}'")]
    UnknownLibrary(String),
}

impl ConvError {
    pub fn primitive(op: &'static str, status: Status) -> Self {
        ConvError::Primitive { op, status }
    }

    pub fn layout(message: impl Into<String>) -> Self {
        ConvError::Layout(message.into())
    }

    pub fn invalid_config(message: impl Into<String>) -> Self {
        ConvError::InvalidConfig(message.into())
    }

    /// Numeric library status for `Primitive` errors.
    pub fn status(&self) -> Option<Status> {
        match self {
            ConvError::Primitive { status, .. } => Some(*status),
            _ => None,
        }
    }
}

impl From<LayoutConversionError> for ConvError {
    fn from(err: LayoutConversionError) -> Self {
        ConvError::Layout(err.to_string())
    }
}

pub type ConvResult<T> = Result<T, ConvError>;
