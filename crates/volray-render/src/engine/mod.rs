//! The wgpu implementation of [`GpuBackend`].
//!
//! Passes are recorded, not executed, while the mapper issues calls: each
//! draw snapshots the bound program's uniform block and the textures behind
//! its bindings. [`GpuBackend::end_pass`] then builds the pipelines and bind
//! groups it needs and submits one render pass.

mod pipelines;
mod textures;

use std::collections::HashMap;

use wgpu::util::DeviceExt;

use crate::error::{RenderError, RenderResult};
use crate::gpu::{
    DeviceLimits, FilterMode, GeometryHandle, GpuBackend, PassDesc, PassTarget, PipelineState,
    ProgramHandle, ProgramSource, RenderTarget, RenderTargetDesc, TargetHandle, TexelData,
    TexelFormat, TextureDesc, TextureDimension, TextureHandle, UniformValue,
};
use crate::shader::uniforms::TextureBinding;
use crate::shader::UniformLayout;

use pipelines::PipelineKey;

/// Largest number of texture units handed to the mapper.
const MAX_TEXTURE_UNITS: u32 = 32;

#[derive(Debug)]
struct GpuTexture {
    texture: wgpu::Texture,
    view: wgpu::TextureView,
    label: String,
    dimension: TextureDimension,
    size: [u32; 3],
    format: TexelFormat,
    filter: FilterMode,
}

#[derive(Debug)]
struct GpuProgram {
    label: String,
    module: wgpu::ShaderModule,
    layout: UniformLayout,
    bindings: Vec<TextureBinding>,
    bind_group_layout: wgpu::BindGroupLayout,
    pipeline_layout: wgpu::PipelineLayout,
    /// Current uniform values; they persist across passes like GL uniforms.
    block: Vec<f32>,
}

#[derive(Debug)]
struct GpuGeometry {
    vertices: wgpu::Buffer,
    indices: wgpu::Buffer,
    index_count: u32,
}

/// Textures bound to declared slots that nothing was bound to.
#[derive(Debug, Clone, Copy)]
struct Fallbacks {
    flat: TextureHandle,
    volume: TextureHandle,
    depth: TextureHandle,
}

/// The target of [`PassTarget::Frame`].
#[derive(Debug, Clone, Copy)]
struct FrameTarget {
    color: TextureHandle,
    depth: Option<TextureHandle>,
    size: [u32; 2],
}

#[derive(Debug)]
struct DrawCommand {
    program: ProgramHandle,
    state: PipelineState,
    geometry: Option<GeometryHandle>,
    uniforms: Vec<f32>,
    /// One texture per program binding, in binding order.
    textures: Vec<TextureHandle>,
}

#[derive(Debug)]
struct PassRecord {
    desc: PassDesc,
    draws: Vec<DrawCommand>,
}

/// Volume rendering device backed by wgpu.
#[derive(Debug)]
pub struct WgpuBackend {
    /// The wgpu device.
    pub device: wgpu::Device,
    /// The wgpu queue.
    pub queue: wgpu::Queue,
    limits: DeviceLimits,
    linear_sampler: wgpu::Sampler,
    nearest_sampler: wgpu::Sampler,
    next_id: u64,
    textures: HashMap<u64, GpuTexture>,
    programs: HashMap<u64, GpuProgram>,
    geometries: HashMap<u64, GpuGeometry>,
    targets: HashMap<u64, RenderTarget>,
    pipelines: HashMap<PipelineKey, wgpu::RenderPipeline>,
    frame: Option<FrameTarget>,
    fallbacks: Option<Fallbacks>,
    pass: Option<PassRecord>,
    current_program: Option<ProgramHandle>,
    units: HashMap<u32, TextureHandle>,
    samplers: HashMap<String, u32>,
    state: PipelineState,
}

impl WgpuBackend {
    /// Creates a backend without a window; the frame target is an
    /// `Rgba8Unorm` texture of `width` x `height`.
    pub async fn new_headless(width: u32, height: u32) -> RenderResult<Self> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..wgpu::InstanceDescriptor::default()
        });

        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: None,
                force_fallback_adapter: false,
            })
            .await
            .map_err(|_| RenderError::AdapterCreationFailed)?;
        let info = adapter.get_info();
        log::info!("using adapter {} ({:?})", info.name, info.backend);

        let (device, queue) = adapter
            .request_device(&wgpu::DeviceDescriptor {
                label: Some("volray device (headless)"),
                required_features: wgpu::Features::empty(),
                required_limits: wgpu::Limits::default(),
                memory_hints: wgpu::MemoryHints::default(),
                trace: wgpu::Trace::default(),
                experimental_features: wgpu::ExperimentalFeatures::default(),
            })
            .await?;

        Self::from_device(device, queue, [width, height])
    }

    /// Wraps an existing device, for applications that own their own.
    pub fn from_device(
        device: wgpu::Device,
        queue: wgpu::Queue,
        frame_size: [u32; 2],
    ) -> RenderResult<Self> {
        let device_limits = device.limits();
        let limits = DeviceLimits {
            max_texture_dimension_2d: device_limits.max_texture_dimension_2d,
            max_texture_dimension_3d: device_limits.max_texture_dimension_3d,
            max_texture_units: device_limits
                .max_sampled_textures_per_shader_stage
                .min(device_limits.max_samplers_per_shader_stage)
                .min(MAX_TEXTURE_UNITS),
        };
        let sampler = |filter: wgpu::FilterMode, label| {
            device.create_sampler(&wgpu::SamplerDescriptor {
                label: Some(label),
                address_mode_u: wgpu::AddressMode::ClampToEdge,
                address_mode_v: wgpu::AddressMode::ClampToEdge,
                address_mode_w: wgpu::AddressMode::ClampToEdge,
                mag_filter: filter,
                min_filter: filter,
                mipmap_filter: wgpu::FilterMode::Nearest,
                ..Default::default()
            })
        };
        let linear_sampler = sampler(wgpu::FilterMode::Linear, "volray linear sampler");
        let nearest_sampler = sampler(wgpu::FilterMode::Nearest, "volray nearest sampler");

        let mut backend = Self {
            device,
            queue,
            limits,
            linear_sampler,
            nearest_sampler,
            next_id: 0,
            textures: HashMap::new(),
            programs: HashMap::new(),
            geometries: HashMap::new(),
            targets: HashMap::new(),
            pipelines: HashMap::new(),
            frame: None,
            fallbacks: None,
            pass: None,
            current_program: None,
            units: HashMap::new(),
            samplers: HashMap::new(),
            state: PipelineState::default(),
        };
        backend.create_fallbacks()?;
        backend.resize_frame(frame_size[0], frame_size[1])?;
        Ok(backend)
    }

    fn allocate_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    /// Recreates the frame target at a new size; its contents are lost.
    pub fn resize_frame(&mut self, width: u32, height: u32) -> RenderResult<()> {
        let size = [width.max(1), height.max(1)];
        if self.frame.is_some_and(|f| f.size == size) {
            return Ok(());
        }
        if let Some(old) = self.frame.take() {
            self.release_texture(old.color);
            if let Some(depth) = old.depth {
                self.release_texture(depth);
            }
        }
        let desc = |format| TextureDesc {
            label: "frame",
            dimension: TextureDimension::D2,
            size: [size[0], size[1], 1],
            format,
            filter: FilterMode::Nearest,
        };
        let color = self.allocate_texture(&desc(TexelFormat::Rgba8Unorm), true)?;
        let depth = self.allocate_texture(&desc(TexelFormat::Depth32Float), true)?;
        self.frame = Some(FrameTarget {
            color,
            depth: Some(depth),
            size,
        });
        log::debug!("frame target {}x{}", size[0], size[1]);
        Ok(())
    }

    /// Color texture of the frame target.
    pub fn frame_color(&self) -> Option<TextureHandle> {
        self.frame.map(|f| f.color)
    }

    /// Depth attachment of the frame target.
    pub fn frame_depth(&self) -> Option<TextureHandle> {
        self.frame.and_then(|f| f.depth)
    }

    /// Size of the frame target.
    pub fn frame_size(&self) -> [u32; 2] {
        self.frame.map_or([0, 0], |f| f.size)
    }

    /// Clears the frame target to `color` and its depth to the far plane.
    pub fn clear_frame(&mut self, color: [f32; 4]) -> RenderResult<()> {
        self.begin_pass(&PassDesc {
            target: PassTarget::Frame,
            clear_color: Some(color),
            clear_depth: Some(1.0),
            viewport: None,
        })?;
        self.end_pass()
    }

    /// Number of cached render pipelines.
    pub fn pipeline_count(&self) -> usize {
        self.pipelines.len()
    }

    fn reset_bindings(&mut self) {
        self.current_program = None;
        self.units.clear();
        self.samplers.clear();
    }
}

impl GpuBackend for WgpuBackend {
    fn limits(&self) -> DeviceLimits {
        self.limits
    }

    fn create_texture(&mut self, desc: &TextureDesc<'_>) -> RenderResult<TextureHandle> {
        self.allocate_texture(desc, false)
    }

    fn write_texture(
        &mut self,
        texture: TextureHandle,
        origin: [u32; 3],
        size: [u32; 3],
        data: TexelData<'_>,
    ) -> RenderResult<()> {
        self.upload(texture, origin, size, data)
    }

    fn set_texture_filter(
        &mut self,
        texture: TextureHandle,
        filter: FilterMode,
    ) -> RenderResult<()> {
        let entry = self
            .textures
            .get_mut(&texture.id())
            .ok_or(RenderError::UnknownHandle {
                kind: "texture",
                id: texture.id(),
            })?;
        entry.filter = filter;
        Ok(())
    }

    fn release_texture(&mut self, texture: TextureHandle) {
        if let Some(entry) = self.textures.remove(&texture.id()) {
            entry.texture.destroy();
        }
    }

    fn compile_program(&mut self, program: &ProgramSource) -> RenderResult<ProgramHandle> {
        self.compile(program)
    }

    fn release_program(&mut self, program: ProgramHandle) {
        self.forget_program(program);
    }

    fn create_geometry(
        &mut self,
        positions: &[[f32; 3]],
        indices: &[u32],
    ) -> RenderResult<GeometryHandle> {
        if positions.is_empty() || indices.is_empty() {
            return Err(RenderError::InvalidUpload("empty geometry".into()));
        }
        let index_count = u32::try_from(indices.len())
            .map_err(|_| RenderError::InvalidUpload(format!("{} indices", indices.len())))?;
        let vertices = self
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("volray proxy vertices"),
                contents: bytemuck::cast_slice(positions),
                usage: wgpu::BufferUsages::VERTEX,
            });
        let index_buffer = self
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("volray proxy indices"),
                contents: bytemuck::cast_slice(indices),
                usage: wgpu::BufferUsages::INDEX,
            });
        let handle = GeometryHandle::new(self.allocate_id());
        self.geometries.insert(
            handle.id(),
            GpuGeometry {
                vertices,
                indices: index_buffer,
                index_count,
            },
        );
        Ok(handle)
    }

    fn release_geometry(&mut self, geometry: GeometryHandle) {
        self.geometries.remove(&geometry.id());
    }

    fn create_render_target(&mut self, desc: &RenderTargetDesc<'_>) -> RenderResult<RenderTarget> {
        let texture = |format| TextureDesc {
            label: desc.label,
            dimension: TextureDimension::D2,
            size: [desc.size[0], desc.size[1], 1],
            format,
            filter: FilterMode::Nearest,
        };
        let mut color = Vec::with_capacity(desc.color_formats.len());
        for &format in desc.color_formats {
            match self.allocate_texture(&texture(format), true) {
                Ok(handle) => color.push(handle),
                Err(err) => {
                    for handle in color {
                        self.release_texture(handle);
                    }
                    return Err(err);
                }
            }
        }
        let depth = if desc.depth {
            match self.allocate_texture(&texture(TexelFormat::Depth32Float), true) {
                Ok(handle) => Some(handle),
                Err(err) => {
                    for handle in color {
                        self.release_texture(handle);
                    }
                    return Err(err);
                }
            }
        } else {
            None
        };
        let target = RenderTarget {
            handle: TargetHandle::new(self.allocate_id()),
            size: desc.size,
            color,
            depth,
        };
        self.targets.insert(target.handle.id(), target.clone());
        Ok(target)
    }

    fn release_render_target(&mut self, target: &RenderTarget) {
        if let Some(target) = self.targets.remove(&target.handle.id()) {
            for texture in target.color.iter().chain(target.depth.iter()) {
                self.release_texture(*texture);
            }
        }
    }

    fn begin_pass(&mut self, desc: &PassDesc) -> RenderResult<()> {
        if let PassTarget::Offscreen(handle) = desc.target {
            if !self.targets.contains_key(&handle.id()) {
                return Err(RenderError::UnknownHandle {
                    kind: "render target",
                    id: handle.id(),
                });
            }
        }
        if self.pass.is_some() {
            log::warn!("pass started while another was open; the open pass is dropped");
        }
        self.pass = Some(PassRecord {
            desc: *desc,
            draws: Vec::new(),
        });
        Ok(())
    }

    fn end_pass(&mut self) -> RenderResult<()> {
        let pass = self.pass.take().ok_or(RenderError::NoActivePass)?;
        self.reset_bindings();
        self.submit_pass(pass)
    }

    fn use_program(&mut self, program: ProgramHandle) -> RenderResult<()> {
        if self.pass.is_none() {
            return Err(RenderError::NoActivePass);
        }
        if !self.programs.contains_key(&program.id()) {
            return Err(RenderError::UnknownHandle {
                kind: "program",
                id: program.id(),
            });
        }
        self.current_program = Some(program);
        self.samplers.clear();
        Ok(())
    }

    fn set_uniform(&mut self, name: &str, value: UniformValue) {
        let Some(handle) = self.current_program else {
            return;
        };
        if let Some(program) = self.programs.get_mut(&handle.id()) {
            program.layout.write(&mut program.block, name, &value);
        }
    }

    fn bind_texture(&mut self, unit: u32, texture: TextureHandle) -> RenderResult<()> {
        if !self.textures.contains_key(&texture.id()) {
            return Err(RenderError::UnknownHandle {
                kind: "texture",
                id: texture.id(),
            });
        }
        if unit >= self.limits.max_texture_units {
            return Err(RenderError::TextureUnitsExhausted(self.limits.max_texture_units));
        }
        self.units.insert(unit, texture);
        Ok(())
    }

    fn unbind_texture(&mut self, unit: u32) {
        self.units.remove(&unit);
    }

    fn set_sampler(&mut self, name: &str, unit: u32) {
        self.samplers.insert(name.to_string(), unit);
    }

    fn set_pipeline_state(&mut self, state: PipelineState) {
        self.state = state;
    }

    fn draw_indexed(&mut self, geometry: GeometryHandle) -> RenderResult<()> {
        if !self.geometries.contains_key(&geometry.id()) {
            return Err(RenderError::UnknownHandle {
                kind: "geometry",
                id: geometry.id(),
            });
        }
        self.record_draw(Some(geometry))
    }

    fn draw_fullscreen(&mut self) -> RenderResult<()> {
        self.record_draw(None)
    }

    fn read_texture(&mut self, texture: TextureHandle) -> RenderResult<Vec<u8>> {
        self.read_back(texture)
    }
}
