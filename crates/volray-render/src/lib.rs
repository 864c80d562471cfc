//! GPU volume ray casting for volray.
//!
//! This crate turns the data model of `volray-core` into draws:
//! - [`BrickStore`] partitions and uploads volumes as 3D textures
//! - [`LookupTable`] caches transfer-function tables keyed on what built them
//! - [`shader`] assembles and caches ray-casting program variants
//! - [`VolumeMapper`] orchestrates one frame
//!
//! All device work goes through the [`GpuBackend`] trait, implemented on wgpu
//! by [`WgpuBackend`] and without a device by [`RecordingBackend`].

// Documentation lints - internal functions don't need exhaustive panic/error docs
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::module_name_repetitions)]
// GPU data is f32 and u32; the data model is f64 and usize
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_possible_wrap)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::struct_excessive_bools)]

pub mod brick;
pub mod context;
pub mod engine;
pub mod error;
pub mod gpu;
pub mod input;
pub mod lookup_table;
pub mod mapper;
pub mod recording;
pub mod shader;
pub mod snapshot;
pub mod units;

pub use brick::{BrickStore, VolumeBlock};
pub use context::{RenderContext, SceneView, VolumePass};
pub use engine::WgpuBackend;
pub use error::{RenderError, RenderResult};
pub use gpu::{
    BlendState, DeviceLimits, FilterMode, GpuBackend, PassTarget, PipelineState, RenderTarget,
    TexelFormat, TextureDimension, TextureHandle, Viewport,
};
pub use input::{InputId, Volume, VolumeInput};
pub use lookup_table::{LookupTable, TableKind};
pub use mapper::{FrameStats, VolumeMapper};
pub use recording::{DrawRecord, RecordingBackend, RecordingStats};
pub use shader::{ProgramCache, ShaderKey, ShaderReplacement};
pub use snapshot::{save_rgba, save_texture, SnapshotError};
pub use units::{TextureUnits, UnitGuard};
