//! The seam between the ray caster and the graphics device.
//!
//! Everything the mapper does on the GPU goes through [`GpuBackend`]: texture
//! upload, program compilation, proxy geometry, passes and draws. The wgpu
//! implementation lives in [`crate::engine`]; [`crate::recording`] provides a
//! device-free implementation that records calls.

use half::f16;
use volray_core::Interpolation;

use crate::error::RenderResult;

macro_rules! gpu_handle {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(u64);

        impl $name {
            /// Wraps a backend-assigned id.
            #[must_use]
            pub const fn new(id: u64) -> Self {
                Self(id)
            }

            /// The backend-assigned id.
            #[must_use]
            pub const fn id(self) -> u64 {
                self.0
            }
        }
    };
}

gpu_handle!(
    /// A texture owned by the backend.
    TextureHandle
);
gpu_handle!(
    /// A compiled shader program.
    ProgramHandle
);
gpu_handle!(
    /// An indexed triangle mesh.
    GeometryHandle
);
gpu_handle!(
    /// An offscreen framebuffer.
    TargetHandle
);

/// Texture dimensionality; 1D tables are stored as `width x 1` 2D textures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TextureDimension {
    D2,
    D3,
}

/// Texel formats used by the ray caster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TexelFormat {
    R8Unorm,
    Rgba8Unorm,
    R16Float,
    Rg16Float,
    Rgba16Float,
    R32Float,
    Depth32Float,
}

impl TexelFormat {
    /// Size of one texel in bytes.
    pub fn bytes_per_texel(self) -> u32 {
        match self {
            TexelFormat::R8Unorm => 1,
            TexelFormat::R16Float => 2,
            TexelFormat::Rgba8Unorm
            | TexelFormat::Rg16Float
            | TexelFormat::R32Float
            | TexelFormat::Depth32Float => 4,
            TexelFormat::Rgba16Float => 8,
        }
    }

    /// Number of channels.
    pub fn channels(self) -> u32 {
        match self {
            TexelFormat::R8Unorm
            | TexelFormat::R16Float
            | TexelFormat::R32Float
            | TexelFormat::Depth32Float => 1,
            TexelFormat::Rg16Float => 2,
            TexelFormat::Rgba8Unorm | TexelFormat::Rgba16Float => 4,
        }
    }

    /// Half-float format holding `components` scalar components.
    ///
    /// Three components are padded to four; no 3-channel format is renderable.
    pub fn half_float_for(components: usize) -> Self {
        match components {
            1 => TexelFormat::R16Float,
            2 => TexelFormat::Rg16Float,
            _ => TexelFormat::Rgba16Float,
        }
    }

    /// True for depth attachments.
    pub fn is_depth(self) -> bool {
        matches!(self, TexelFormat::Depth32Float)
    }
}

/// Texture sampling filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum FilterMode {
    Nearest,
    #[default]
    Linear,
}

impl From<Interpolation> for FilterMode {
    fn from(value: Interpolation) -> Self {
        match value {
            Interpolation::Nearest => FilterMode::Nearest,
            Interpolation::Linear => FilterMode::Linear,
        }
    }
}

/// Description of a texture to allocate.
#[derive(Debug, Clone, Copy)]
pub struct TextureDesc<'a> {
    pub label: &'a str,
    pub dimension: TextureDimension,
    /// Width, height and depth; depth is 1 for 2D textures.
    pub size: [u32; 3],
    pub format: TexelFormat,
    pub filter: FilterMode,
}

impl TextureDesc<'_> {
    /// Total size in bytes.
    pub fn byte_size(&self) -> u64 {
        self.size.iter().map(|&s| u64::from(s)).product::<u64>()
            * u64::from(self.format.bytes_per_texel())
    }
}

/// Texel data for an upload, already in the texture's channel layout.
#[derive(Debug, Clone, Copy)]
pub enum TexelData<'a> {
    U8(&'a [u8]),
    F16(&'a [f16]),
    F32(&'a [f32]),
}

impl TexelData<'_> {
    /// Raw bytes of the upload.
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            TexelData::U8(data) => data,
            TexelData::F16(data) => bytemuck::cast_slice(data),
            TexelData::F32(data) => bytemuck::cast_slice(data),
        }
    }
}

/// Device limits the mapper sizes its resources against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceLimits {
    pub max_texture_dimension_2d: u32,
    pub max_texture_dimension_3d: u32,
    /// Textures that can be bound to one program at once.
    pub max_texture_units: u32,
}

impl Default for DeviceLimits {
    fn default() -> Self {
        Self {
            max_texture_dimension_2d: 8192,
            max_texture_dimension_3d: 2048,
            max_texture_units: 16,
        }
    }
}

/// A value assigned to a program uniform.
#[derive(Debug, Clone, PartialEq)]
pub enum UniformValue {
    Float(f32),
    Int(i32),
    Vec2([f32; 2]),
    Vec3([f32; 3]),
    Vec4([f32; 4]),
    Mat4([[f32; 4]; 4]),
    FloatArray(Vec<f32>),
    IntArray(Vec<i32>),
    Vec4Array(Vec<[f32; 4]>),
    Mat4Array(Vec<[[f32; 4]; 4]>),
}

/// Storage class of a declared uniform; every kind occupies whole vec4 slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UniformKind {
    /// A scalar stored in the `x` lane of a vec4.
    Scalar,
    Vec4,
    Mat4,
}

impl UniformKind {
    /// Number of vec4 slots one element occupies.
    pub fn slots(self) -> usize {
        match self {
            UniformKind::Scalar | UniformKind::Vec4 => 1,
            UniformKind::Mat4 => 4,
        }
    }
}

/// A uniform declared by a program.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UniformDecl {
    pub name: String,
    pub kind: UniformKind,
    /// Array length; `None` for a single value.
    pub count: Option<usize>,
}

/// How a texture binding is read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SampleKind {
    /// Sampled through a filtering sampler.
    Filterable,
    /// Read with `textureLoad`.
    Unfilterable,
    /// A depth attachment read with `textureLoad`.
    Depth,
}

/// A texture binding declared by a program.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SamplerDecl {
    pub name: String,
    pub dimension: TextureDimension,
    pub sample: SampleKind,
}

/// A complete program ready for compilation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProgramSource {
    pub label: String,
    /// WGSL module with `vs_main` and `fs_main` entry points.
    pub source: String,
    pub uniforms: Vec<UniformDecl>,
    pub samplers: Vec<SamplerDecl>,
}

/// How fragment output is combined with the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum BlendState {
    /// Overwrite the target.
    #[default]
    Replace,
    /// Premultiplied-alpha "over".
    PremultipliedOver,
    /// Per-channel maximum.
    Maximum,
    /// Sum of source and destination.
    Additive,
}

/// Fixed-function state for subsequent draws.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PipelineState {
    pub blend: BlendState,
    pub cull_back_faces: bool,
    pub depth_test: bool,
    pub depth_write: bool,
}

impl Default for PipelineState {
    fn default() -> Self {
        Self {
            blend: BlendState::PremultipliedOver,
            cull_back_faces: true,
            depth_test: false,
            depth_write: false,
        }
    }
}

/// A rectangle of the target in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Viewport {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Viewport {
    /// A viewport covering `width` x `height` from the origin.
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            x: 0,
            y: 0,
            width,
            height,
        }
    }

    /// The viewport divided by `factor` (at least one pixel).
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss
    )]
    pub fn scaled(&self, factor: f64) -> Self {
        let scale = |v: u32| ((f64::from(v) / factor).round() as u32).max(1);
        Self {
            x: 0,
            y: 0,
            width: scale(self.width),
            height: scale(self.height),
        }
    }

    /// Width over height.
    pub fn aspect(&self) -> f64 {
        f64::from(self.width.max(1)) / f64::from(self.height.max(1))
    }
}

/// Description of an offscreen framebuffer.
#[derive(Debug, Clone, Copy)]
pub struct RenderTargetDesc<'a> {
    pub label: &'a str,
    pub size: [u32; 2],
    pub color_formats: &'a [TexelFormat],
    pub depth: bool,
}

/// An offscreen framebuffer and the textures attached to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderTarget {
    pub handle: TargetHandle,
    pub size: [u32; 2],
    pub color: Vec<TextureHandle>,
    pub depth: Option<TextureHandle>,
}

/// Where a pass draws.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PassTarget {
    /// The application's current framebuffer.
    #[default]
    Frame,
    Offscreen(TargetHandle),
}

/// Parameters of a render pass.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassDesc {
    pub target: PassTarget,
    pub clear_color: Option<[f32; 4]>,
    pub clear_depth: Option<f32>,
    /// Defaults to the whole target.
    pub viewport: Option<Viewport>,
}

/// Graphics device operations used by the ray caster.
///
/// Bindings and uniforms apply to the program bound with
/// [`GpuBackend::use_program`]. Ending a pass resets all bindings.
pub trait GpuBackend {
    /// Limits of the device.
    fn limits(&self) -> DeviceLimits;

    /// Allocates an uninitialized texture.
    fn create_texture(&mut self, desc: &TextureDesc<'_>) -> RenderResult<TextureHandle>;

    /// Uploads `data` into the region of `texture` starting at `origin`.
    fn write_texture(
        &mut self,
        texture: TextureHandle,
        origin: [u32; 3],
        size: [u32; 3],
        data: TexelData<'_>,
    ) -> RenderResult<()>;

    /// Changes the filter used when `texture` is sampled.
    fn set_texture_filter(&mut self, texture: TextureHandle, filter: FilterMode)
        -> RenderResult<()>;

    /// Frees a texture. Unknown handles are ignored.
    fn release_texture(&mut self, texture: TextureHandle);

    /// Compiles a program.
    fn compile_program(&mut self, program: &ProgramSource) -> RenderResult<ProgramHandle>;

    /// Frees a program. Unknown handles are ignored.
    fn release_program(&mut self, program: ProgramHandle);

    /// Uploads an indexed triangle mesh.
    fn create_geometry(
        &mut self,
        positions: &[[f32; 3]],
        indices: &[u32],
    ) -> RenderResult<GeometryHandle>;

    /// Frees a mesh. Unknown handles are ignored.
    fn release_geometry(&mut self, geometry: GeometryHandle);

    /// Allocates a framebuffer with its attachments.
    fn create_render_target(&mut self, desc: &RenderTargetDesc<'_>) -> RenderResult<RenderTarget>;

    /// Frees a framebuffer and its attachments.
    fn release_render_target(&mut self, target: &RenderTarget);

    /// Starts recording a pass.
    fn begin_pass(&mut self, desc: &PassDesc) -> RenderResult<()>;

    /// Submits the current pass and resets bindings.
    fn end_pass(&mut self) -> RenderResult<()>;

    /// Binds a program for subsequent uniforms and draws.
    fn use_program(&mut self, program: ProgramHandle) -> RenderResult<()>;

    /// Sets a uniform of the bound program; names it does not declare are ignored.
    fn set_uniform(&mut self, name: &str, value: UniformValue);

    /// Binds `texture` to a texture unit.
    fn bind_texture(&mut self, unit: u32, texture: TextureHandle) -> RenderResult<()>;

    /// Clears a texture unit.
    fn unbind_texture(&mut self, unit: u32);

    /// Points the program's texture binding `name` at a texture unit.
    fn set_sampler(&mut self, name: &str, unit: u32);

    /// Sets the fixed-function state for subsequent draws.
    fn set_pipeline_state(&mut self, state: PipelineState);

    /// Draws a mesh with the bound program.
    fn draw_indexed(&mut self, geometry: GeometryHandle) -> RenderResult<()>;

    /// Draws a full-screen triangle with the bound program.
    fn draw_fullscreen(&mut self) -> RenderResult<()>;

    /// Reads a color texture back, tightly packed.
    fn read_texture(&mut self, texture: TextureHandle) -> RenderResult<Vec<u8>>;
}

/// Runs `body` inside a pass, ending the pass on every path.
pub fn with_pass<T>(
    gpu: &mut dyn GpuBackend,
    desc: &PassDesc,
    body: impl FnOnce(&mut dyn GpuBackend) -> RenderResult<T>,
) -> RenderResult<T> {
    gpu.begin_pass(desc)?;
    let result = body(&mut *gpu);
    let ended = gpu.end_pass();
    let value = result?;
    ended?;
    Ok(value)
}

/// Converts a glam matrix to the column arrays uniforms expect.
#[allow(clippy::cast_possible_truncation)]
pub fn mat4_uniform(matrix: &glam::DMat4) -> UniformValue {
    UniformValue::Mat4(matrix.as_mat4().to_cols_array_2d())
}

/// Converts a double vector to a vec4 uniform with the given `w`.
#[allow(clippy::cast_possible_truncation)]
pub fn vec4_uniform(v: glam::DVec3, w: f64) -> UniformValue {
    UniformValue::Vec4([v.x as f32, v.y as f32, v.z as f32, w as f32])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_half_float_formats() {
        assert_eq!(TexelFormat::half_float_for(1), TexelFormat::R16Float);
        assert_eq!(TexelFormat::half_float_for(2), TexelFormat::Rg16Float);
        assert_eq!(TexelFormat::half_float_for(3), TexelFormat::Rgba16Float);
        assert_eq!(TexelFormat::half_float_for(4).bytes_per_texel(), 8);
    }

    #[test]
    fn test_texture_byte_size() {
        let desc = TextureDesc {
            label: "bricks",
            dimension: TextureDimension::D3,
            size: [64, 64, 64],
            format: TexelFormat::R16Float,
            filter: FilterMode::Linear,
        };
        assert_eq!(desc.byte_size(), 64 * 64 * 64 * 2);
    }

    #[test]
    fn test_viewport_scaling() {
        let v = Viewport::new(800, 600);
        assert_eq!(v.scaled(2.0), Viewport::new(400, 300));
        assert_eq!(v.scaled(10_000.0), Viewport::new(1, 1));
    }

    #[test]
    fn test_texel_data_bytes() {
        let values = [f16::from_f32(1.0), f16::from_f32(0.5)];
        assert_eq!(TexelData::F16(&values).as_bytes().len(), 4);
        assert_eq!(TexelData::F32(&[1.0, 2.0, 3.0]).as_bytes().len(), 12);
    }
}
