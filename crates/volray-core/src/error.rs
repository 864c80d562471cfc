//! Error types for volray.

use thiserror::Error;

/// The main error type for volray data-model operations.
#[derive(Error, Debug)]
pub enum VolrayError {
    /// Brick partition counts must all be positive.
    #[error("invalid partitions {0:?}: every axis needs at least one partition")]
    InvalidPartitions([u16; 3]),

    /// The volume has no scalar array to render.
    #[error("volume has no scalar array")]
    MissingScalars,

    /// Unsupported number of scalar components.
    #[error("unsupported number of scalar components: {0} (expected 1 to 4)")]
    UnsupportedComponents(usize),

    /// Dependent components with a component count the ray caster cannot interpret.
    #[error("dependent components require 2 or 4 components, got {0}")]
    InvalidComponentMode(usize),

    /// Data size mismatch.
    #[error("data size mismatch: expected {expected}, got {actual}")]
    SizeMismatch { expected: usize, actual: usize },

    /// A 2D transfer function needs a non-empty image.
    #[error("invalid 2D transfer function dimensions {width}x{height}")]
    InvalidTransferFunction2D { width: usize, height: usize },

    /// An image extent with max < min on some axis.
    #[error("invalid extent {0:?}")]
    InvalidExtent([i32; 6]),

    /// Cropping enabled with min >= max on some axis.
    #[error("invalid cropping planes {0:?}")]
    InvalidCroppingPlanes([f64; 6]),

    /// An option value outside its accepted range.
    #[error("invalid option '{name}': {reason}")]
    InvalidOption { name: &'static str, reason: String },

    /// I/O error.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// JSON serialization error.
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
}

/// A specialized Result type for volray data-model operations.
pub type Result<T> = std::result::Result<T, VolrayError>;
