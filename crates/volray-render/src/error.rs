//! Rendering error types.

use thiserror::Error;
use volray_core::VolrayError;

/// Errors that can occur during rendering operations.
#[derive(Error, Debug)]
pub enum RenderError {
    /// Failed to create wgpu adapter.
    #[error("failed to create graphics adapter")]
    AdapterCreationFailed,

    /// Failed to create wgpu device.
    #[error("failed to create graphics device: {0}")]
    DeviceCreationFailed(#[from] wgpu::RequestDeviceError),

    /// A brick does not fit the device texture limits or the memory budget.
    #[error(
        "brick of {dims:?} voxels ({bytes} bytes) exceeds the device limit \
         ({max_dimension} per axis) or the memory budget ({budget} bytes)"
    )]
    TextureTooLarge {
        dims: [usize; 3],
        bytes: u64,
        max_dimension: u32,
        budget: u64,
    },

    /// The device refused an allocation.
    #[error("out of GPU memory while allocating {0}")]
    OutOfMemory(String),

    /// A texture write that does not fit the texture.
    #[error("invalid upload: {0}")]
    InvalidUpload(String),

    /// Shader compilation failed.
    #[error("shader compilation failed for [{features}]: {message}")]
    ShaderCompilationFailed { features: String, message: String },

    /// More textures requested than the device exposes.
    #[error("all {0} texture units are in use")]
    TextureUnitsExhausted(u32),

    /// A handle that was never created or was already released.
    #[error("unknown {kind} handle {id}")]
    UnknownHandle { kind: &'static str, id: u64 },

    /// A draw or state call issued outside of a render pass.
    #[error("no render pass is active")]
    NoActivePass,

    /// Reading a render target back failed.
    #[error("readback failed: {0}")]
    ReadbackFailed(String),

    /// Invalid input data or configuration.
    #[error(transparent)]
    Core(#[from] VolrayError),
}

/// A specialized Result type for rendering operations.
pub type RenderResult<T> = std::result::Result<T, RenderError>;
