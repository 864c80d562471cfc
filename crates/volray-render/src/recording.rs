//! A device-free backend that records what the mapper asks of the GPU.
//!
//! Used by the tests and by tools that want to inspect the work a frame
//! generates (uploads, compilations, draws) without a graphics adapter.

use std::collections::HashMap;

use volray_core::VolrayError;

use crate::error::{RenderError, RenderResult};
use crate::gpu::{
    DeviceLimits, FilterMode, GeometryHandle, GpuBackend, PassDesc, PassTarget, PipelineState,
    ProgramHandle, ProgramSource, RenderTarget, RenderTargetDesc, TargetHandle, TexelData,
    TexelFormat, TextureDesc, TextureDimension, TextureHandle, UniformValue,
};

/// A texture as seen by the recording backend.
#[derive(Debug, Clone)]
pub struct RecordedTexture {
    pub label: String,
    pub dimension: TextureDimension,
    pub size: [u32; 3],
    pub format: TexelFormat,
    pub filter: FilterMode,
    pub uploads: u32,
    /// Bytes of the most recent upload.
    pub last_upload: Vec<u8>,
}

/// One recorded draw call.
#[derive(Debug, Clone)]
pub struct DrawRecord {
    pub program: ProgramHandle,
    /// `None` for full-screen draws.
    pub geometry: Option<GeometryHandle>,
    pub target: PassTarget,
    pub state: PipelineState,
    /// Sampler name and the texture bound to its unit.
    pub textures: Vec<(String, TextureHandle)>,
}

/// Counters accumulated since creation or the last [`RecordingBackend::reset_stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecordingStats {
    pub textures_created: u32,
    pub texture_uploads: u32,
    pub textures_released: u32,
    pub programs_compiled: u32,
    pub geometries_created: u32,
    pub passes: u32,
    pub draws: u32,
}

/// Backend that keeps resources in memory and records every call.
#[derive(Debug, Default)]
pub struct RecordingBackend {
    limits: DeviceLimits,
    next_id: u64,
    textures: HashMap<u64, RecordedTexture>,
    programs: HashMap<u64, ProgramSource>,
    geometries: HashMap<u64, (Vec<[f32; 3]>, Vec<u32>)>,
    targets: HashMap<u64, RenderTarget>,
    pass: Option<PassTarget>,
    program: Option<ProgramHandle>,
    units: HashMap<u32, TextureHandle>,
    samplers: HashMap<String, u32>,
    uniforms: HashMap<String, UniformValue>,
    state: PipelineState,
    draws: Vec<DrawRecord>,
    stats: RecordingStats,
    texture_budget: Option<u64>,
    allocated_bytes: u64,
    failing_programs: Option<String>,
}

impl RecordingBackend {
    /// Creates a backend with default limits.
    pub fn new() -> Self {
        Self::default()
    }

    /// Overrides the reported device limits.
    #[must_use]
    pub fn with_limits(mut self, limits: DeviceLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Fails texture allocations once `bytes` are in use.
    #[must_use]
    pub fn with_texture_budget(mut self, bytes: u64) -> Self {
        self.texture_budget = Some(bytes);
        self
    }

    /// Fails compilation of any program whose source contains `needle`.
    pub fn fail_programs_containing(&mut self, needle: Option<&str>) {
        self.failing_programs = needle.map(str::to_string);
    }

    /// Counters so far.
    pub fn stats(&self) -> RecordingStats {
        self.stats
    }

    /// Resets the counters and the draw log.
    pub fn reset_stats(&mut self) {
        self.stats = RecordingStats::default();
        self.draws.clear();
    }

    /// Draws recorded since the last reset.
    pub fn draws(&self) -> &[DrawRecord] {
        &self.draws
    }

    /// A live texture.
    pub fn texture(&self, handle: TextureHandle) -> Option<&RecordedTexture> {
        self.textures.get(&handle.id())
    }

    /// Number of live textures.
    pub fn live_textures(&self) -> usize {
        self.textures.len()
    }

    /// Bytes held by live textures.
    pub fn allocated_bytes(&self) -> u64 {
        self.allocated_bytes
    }

    /// Number of live programs.
    pub fn live_programs(&self) -> usize {
        self.programs.len()
    }

    /// Number of live meshes.
    pub fn live_geometries(&self) -> usize {
        self.geometries.len()
    }

    /// Source of a live program.
    pub fn program_source(&self, handle: ProgramHandle) -> Option<&ProgramSource> {
        self.programs.get(&handle.id())
    }

    /// Vertices and indices of a live mesh.
    pub fn geometry(&self, handle: GeometryHandle) -> Option<(&[[f32; 3]], &[u32])> {
        self.geometries
            .get(&handle.id())
            .map(|(v, i)| (v.as_slice(), i.as_slice()))
    }

    /// The last value assigned to a uniform, across programs.
    pub fn uniform(&self, name: &str) -> Option<&UniformValue> {
        self.uniforms.get(name)
    }

    fn allocate_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn require_pass(&self) -> RenderResult<PassTarget> {
        self.pass.ok_or(RenderError::NoActivePass)
    }

    fn unknown(kind: &'static str, id: u64) -> RenderError {
        RenderError::UnknownHandle { kind, id }
    }

    fn record_draw(&mut self, geometry: Option<GeometryHandle>) -> RenderResult<()> {
        let target = self.require_pass()?;
        let program = self
            .program
            .ok_or_else(|| Self::unknown("program", 0))?;
        let mut textures: Vec<(String, TextureHandle)> = self
            .samplers
            .iter()
            .filter_map(|(name, unit)| self.units.get(unit).map(|t| (name.clone(), *t)))
            .collect();
        textures.sort_by(|a, b| a.0.cmp(&b.0));
        self.draws.push(DrawRecord {
            program,
            geometry,
            target,
            state: self.state,
            textures,
        });
        self.stats.draws += 1;
        Ok(())
    }
}

impl GpuBackend for RecordingBackend {
    fn limits(&self) -> DeviceLimits {
        self.limits
    }

    fn create_texture(&mut self, desc: &TextureDesc<'_>) -> RenderResult<TextureHandle> {
        let bytes = desc.byte_size();
        if let Some(budget) = self.texture_budget {
            if self.allocated_bytes + bytes > budget {
                return Err(RenderError::OutOfMemory(desc.label.to_string()));
            }
        }
        self.allocated_bytes += bytes;
        let id = self.allocate_id();
        self.textures.insert(
            id,
            RecordedTexture {
                label: desc.label.to_string(),
                dimension: desc.dimension,
                size: desc.size,
                format: desc.format,
                filter: desc.filter,
                uploads: 0,
                last_upload: Vec::new(),
            },
        );
        self.stats.textures_created += 1;
        Ok(TextureHandle::new(id))
    }

    fn write_texture(
        &mut self,
        texture: TextureHandle,
        origin: [u32; 3],
        size: [u32; 3],
        data: TexelData<'_>,
    ) -> RenderResult<()> {
        let record = self
            .textures
            .get_mut(&texture.id())
            .ok_or_else(|| Self::unknown("texture", texture.id()))?;
        let fits = (0..3).all(|a| origin[a] + size[a] <= record.size[a]);
        let expected = size.iter().map(|&s| s as usize).product::<usize>()
            * record.format.bytes_per_texel() as usize;
        if !fits {
            return Err(RenderError::InvalidUpload(format!(
                "{size:?} at {origin:?} outside texture '{}'",
                record.label
            )));
        }
        if data.as_bytes().len() != expected {
            return Err(VolrayError::SizeMismatch {
                expected,
                actual: data.as_bytes().len(),
            }
            .into());
        }
        record.uploads += 1;
        record.last_upload = data.as_bytes().to_vec();
        self.stats.texture_uploads += 1;
        Ok(())
    }

    fn set_texture_filter(
        &mut self,
        texture: TextureHandle,
        filter: FilterMode,
    ) -> RenderResult<()> {
        let record = self
            .textures
            .get_mut(&texture.id())
            .ok_or_else(|| Self::unknown("texture", texture.id()))?;
        record.filter = filter;
        Ok(())
    }

    fn release_texture(&mut self, texture: TextureHandle) {
        if let Some(record) = self.textures.remove(&texture.id()) {
            let bytes = TextureDesc {
                label: &record.label,
                dimension: record.dimension,
                size: record.size,
                format: record.format,
                filter: record.filter,
            }
            .byte_size();
            self.allocated_bytes = self.allocated_bytes.saturating_sub(bytes);
            self.stats.textures_released += 1;
        }
    }

    fn compile_program(&mut self, program: &ProgramSource) -> RenderResult<ProgramHandle> {
        if let Some(needle) = &self.failing_programs {
            if program.source.contains(needle.as_str()) {
                return Err(RenderError::ShaderCompilationFailed {
                    features: program.label.clone(),
                    message: format!("rejected source containing '{needle}'"),
                });
            }
        }
        let id = self.allocate_id();
        self.programs.insert(id, program.clone());
        self.stats.programs_compiled += 1;
        Ok(ProgramHandle::new(id))
    }

    fn release_program(&mut self, program: ProgramHandle) {
        self.programs.remove(&program.id());
        if self.program == Some(program) {
            self.program = None;
        }
    }

    fn create_geometry(
        &mut self,
        positions: &[[f32; 3]],
        indices: &[u32],
    ) -> RenderResult<GeometryHandle> {
        let id = self.allocate_id();
        self.geometries
            .insert(id, (positions.to_vec(), indices.to_vec()));
        self.stats.geometries_created += 1;
        Ok(GeometryHandle::new(id))
    }

    fn release_geometry(&mut self, geometry: GeometryHandle) {
        self.geometries.remove(&geometry.id());
    }

    fn create_render_target(&mut self, desc: &RenderTargetDesc<'_>) -> RenderResult<RenderTarget> {
        let color = desc
            .color_formats
            .iter()
            .map(|&format| {
                self.create_texture(&TextureDesc {
                    label: desc.label,
                    dimension: TextureDimension::D2,
                    size: [desc.size[0], desc.size[1], 1],
                    format,
                    filter: FilterMode::Nearest,
                })
            })
            .collect::<RenderResult<Vec<_>>>()?;
        let depth = if desc.depth {
            Some(self.create_texture(&TextureDesc {
                label: desc.label,
                dimension: TextureDimension::D2,
                size: [desc.size[0], desc.size[1], 1],
                format: TexelFormat::Depth32Float,
                filter: FilterMode::Nearest,
            })?)
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
        if self.targets.remove(&target.handle.id()).is_some() {
            for texture in target.color.iter().chain(target.depth.iter()) {
                self.release_texture(*texture);
            }
        }
    }

    fn begin_pass(&mut self, desc: &PassDesc) -> RenderResult<()> {
        if let PassTarget::Offscreen(handle) = desc.target {
            if !self.targets.contains_key(&handle.id()) {
                return Err(Self::unknown("render target", handle.id()));
            }
        }
        self.pass = Some(desc.target);
        self.stats.passes += 1;
        Ok(())
    }

    fn end_pass(&mut self) -> RenderResult<()> {
        self.require_pass()?;
        self.pass = None;
        self.program = None;
        self.units.clear();
        self.samplers.clear();
        Ok(())
    }

    fn use_program(&mut self, program: ProgramHandle) -> RenderResult<()> {
        self.require_pass()?;
        if !self.programs.contains_key(&program.id()) {
            return Err(Self::unknown("program", program.id()));
        }
        self.program = Some(program);
        self.samplers.clear();
        Ok(())
    }

    fn set_uniform(&mut self, name: &str, value: UniformValue) {
        self.uniforms.insert(name.to_string(), value);
    }

    fn bind_texture(&mut self, unit: u32, texture: TextureHandle) -> RenderResult<()> {
        if !self.textures.contains_key(&texture.id()) {
            return Err(Self::unknown("texture", texture.id()));
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
            return Err(Self::unknown("geometry", geometry.id()));
        }
        self.record_draw(Some(geometry))
    }

    fn draw_fullscreen(&mut self) -> RenderResult<()> {
        self.record_draw(None)
    }

    fn read_texture(&mut self, texture: TextureHandle) -> RenderResult<Vec<u8>> {
        let record = self
            .textures
            .get(&texture.id())
            .ok_or_else(|| Self::unknown("texture", texture.id()))?;
        let len = record.size.iter().map(|&s| s as usize).product::<usize>()
            * record.format.bytes_per_texel() as usize;
        Ok(vec![0; len])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::with_pass;

    fn table_desc() -> TextureDesc<'static> {
        TextureDesc {
            label: "table",
            dimension: TextureDimension::D2,
            size: [4, 1, 1],
            format: TexelFormat::Rgba8Unorm,
            filter: FilterMode::Linear,
        }
    }

    #[test]
    fn test_upload_size_checked() {
        let mut gpu = RecordingBackend::new();
        let tex = gpu.create_texture(&table_desc()).unwrap();
        assert!(gpu
            .write_texture(tex, [0, 0, 0], [4, 1, 1], TexelData::U8(&[0; 16]))
            .is_ok());
        assert!(gpu
            .write_texture(tex, [1, 0, 0], [4, 1, 1], TexelData::U8(&[0; 16]))
            .is_err());
        assert_eq!(gpu.texture(tex).unwrap().uploads, 1);
    }

    #[test]
    fn test_texture_budget() {
        let mut gpu = RecordingBackend::new().with_texture_budget(20);
        let a = gpu.create_texture(&table_desc()).unwrap();
        assert!(matches!(
            gpu.create_texture(&table_desc()),
            Err(RenderError::OutOfMemory(_))
        ));
        gpu.release_texture(a);
        assert!(gpu.create_texture(&table_desc()).is_ok());
    }

    #[test]
    fn test_draw_requires_pass_and_pass_resets_bindings() {
        let mut gpu = RecordingBackend::new();
        let program = gpu
            .compile_program(&ProgramSource {
                label: "p".into(),
                source: "fn main() {}".into(),
                uniforms: Vec::new(),
                samplers: Vec::new(),
            })
            .unwrap();
        assert!(matches!(gpu.draw_fullscreen(), Err(RenderError::NoActivePass)));

        let tex = gpu.create_texture(&table_desc()).unwrap();
        with_pass(&mut gpu, &PassDesc::default(), |gpu| {
            gpu.use_program(program)?;
            gpu.bind_texture(0, tex)?;
            gpu.set_sampler("lut", 0);
            gpu.draw_fullscreen()
        })
        .unwrap();
        assert_eq!(gpu.draws().len(), 1);
        assert_eq!(gpu.draws()[0].textures, vec![("lut".to_string(), tex)]);
        assert!(gpu.units.is_empty());
    }

    #[test]
    fn test_failing_program() {
        let mut gpu = RecordingBackend::new();
        gpu.fail_programs_containing(Some("broken"));
        let result = gpu.compile_program(&ProgramSource {
            label: "bad".into(),
            source: "broken".into(),
            uniforms: Vec::new(),
            samplers: Vec::new(),
        });
        assert!(matches!(
            result,
            Err(RenderError::ShaderCompilationFailed { .. })
        ));
    }
}
