//! volray: GPU volume ray casting.
//!
//! Renders regular scalar volumes by casting rays through bricked 3D textures,
//! classifying samples with cached transfer-function tables and compositing
//! them with one of several blend modes.
//!
//! # Quick Start
//!
//! ```no_run
//! use volray::*;
//!
//! fn main() -> Result<()> {
//!     let mut image = ImageData::new([32, 32, 32]);
//!     let values = (0..32 * 32 * 32).map(|i| (i % 32) as f32).collect();
//!     image.set_point_scalars(ScalarArray::new("ramp", 1, ScalarData::F32(values))?)?;
//!
//!     let mut mapper = VolumeMapper::default();
//!     mapper.add_input(Volume::new(image, VolumeProperty::new()));
//!
//!     let camera = fit_camera(&mapper, 4.0 / 3.0);
//!     render_to_file("volume.png", &mut mapper, &camera, 800, 600)?;
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! - [`volray_core`] holds the data model and every decision that does not
//!   need a device: partitioning, proxy geometry, adaptive sampling, options.
//! - [`volray_render`] holds the GPU side: brick upload, lookup tables,
//!   shader variants and the per-frame [`VolumeMapper`].
//! - Device work goes through [`GpuBackend`]; [`WgpuBackend`] draws with wgpu
//!   and [`RecordingBackend`] records calls without a device.

pub mod headless;

use thiserror::Error;

// Re-export core types
pub use volray_core::{
    geometry, Association, BlendMode, Camera, ColorTransferFunction, ComponentMode,
    ComponentProperty, Cropping, DepthImageFormat, ImageData, Interpolation, Light,
    LightComplexity, LightKind, MapperOptions, MaskType, PickingState, PiecewiseFunction, Plane,
    ProjectionMode, ScalarArray, ScalarData, SelectionPass, Selector, TimeStamp,
    TransferFunction2D, TransferFunctionMode, VolrayError, VolumeProperty,
};
pub use volray_core::{DMat4, DVec3, DVec4, Mat4, Vec3, Vec4};

// Re-export render types
pub use volray_render::{
    FrameStats, GpuBackend, InputId, PassTarget, RecordingBackend, RenderContext, RenderError,
    SceneView, ShaderReplacement, SnapshotError, TexelFormat, Viewport, Volume, VolumeMapper,
    VolumePass, WgpuBackend,
};

pub use headless::{fit_camera, render_to_file, render_to_image, HeadlessRenderer};

/// Errors surfaced by the facade.
#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Core(#[from] VolrayError),

    #[error(transparent)]
    Render(#[from] RenderError),

    #[error(transparent)]
    Snapshot(#[from] SnapshotError),
}

/// A specialized Result type for volray operations.
pub type Result<T> = std::result::Result<T, Error>;
