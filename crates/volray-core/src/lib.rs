//! Core data model for volray.
//!
//! This crate holds everything the GPU ray caster decides on without touching
//! the GPU:
//! - [`ImageData`], [`VolumeProperty`] and the transfer functions that describe a volume
//! - [`MapperOptions`], the serializable mapper configuration
//! - brick partitioning ([`partition`]), proxy geometry ([`geometry`]) and the
//!   adaptive sampling heuristic ([`reduction`])
//! - modification timestamps that drive every cache in the render crate

// Documentation lints - internal functions don't need exhaustive panic/error docs
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::missing_errors_doc)]
// Options structs legitimately have many boolean flags
#![allow(clippy::struct_excessive_bools)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::module_name_repetitions)]

pub mod camera;
pub mod cropping;
pub mod error;
pub mod geometry;
pub mod image_data;
pub mod light;
pub mod marching_cubes;
pub mod options;
pub mod partition;
pub mod pick;
pub mod plane;
pub mod property;
pub mod reduction;
pub mod timestamp;
pub mod transfer_function;

pub use camera::{Camera, ProjectionMode};
pub use cropping::Cropping;
pub use error::{Result, VolrayError};
pub use geometry::ProxyMesh;
pub use image_data::{Association, ImageData, ScalarArray, ScalarData};
pub use light::{Light, LightComplexity, LightKind, MAX_LIGHTS};
pub use marching_cubes::ContourMesh;
pub use options::{BlendMode, DepthImageFormat, Interpolation, MapperOptions, MaskType};
pub use partition::BrickExtent;
pub use pick::{PickingState, SelectionPass, Selector};
pub use plane::{Plane, MAX_CLIPPING_PLANES};
pub use property::{
    ComponentMode, ComponentProperty, TransferFunctionMode, VolumeProperty, MAX_COMPONENTS,
};
pub use reduction::ReductionController;
pub use timestamp::TimeStamp;
pub use transfer_function::{ColorTransferFunction, PiecewiseFunction, TransferFunction2D};

// Re-export glam types for convenience
pub use glam::{DMat4, DVec3, DVec4, Mat4, Vec3, Vec4};
