//! Program compilation, the pipeline cache and pass submission.

use std::num::NonZeroU64;

use wgpu::util::DeviceExt;

use super::textures::texture_format;
use super::{DrawCommand, GpuProgram, PassRecord, WgpuBackend};
use crate::error::{RenderError, RenderResult};
use crate::gpu::{
    BlendState, FilterMode, GeometryHandle, PassTarget, PipelineState, ProgramHandle,
    ProgramSource, SampleKind, TextureDimension, TextureHandle,
};
use crate::shader::uniforms::texture_bindings;
use crate::shader::UniformLayout;

/// Proxy and contour meshes: one `vec3<f32>` position per vertex.
const POSITION_ATTRIBUTES: [wgpu::VertexAttribute; 1] = wgpu::vertex_attr_array![0 => Float32x3];

/// Everything a render pipeline is specialized on.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(super) struct PipelineKey {
    program: ProgramHandle,
    state: PipelineState,
    color_formats: Vec<wgpu::TextureFormat>,
    depth: bool,
    indexed: bool,
}

fn blend_state(blend: BlendState) -> wgpu::BlendState {
    match blend {
        BlendState::Replace => wgpu::BlendState::REPLACE,
        BlendState::PremultipliedOver => wgpu::BlendState::PREMULTIPLIED_ALPHA_BLENDING,
        BlendState::Maximum => {
            let max = wgpu::BlendComponent {
                src_factor: wgpu::BlendFactor::One,
                dst_factor: wgpu::BlendFactor::One,
                operation: wgpu::BlendOperation::Max,
            };
            wgpu::BlendState {
                color: max,
                alpha: max,
            }
        }
        BlendState::Additive => {
            let add = wgpu::BlendComponent {
                src_factor: wgpu::BlendFactor::One,
                dst_factor: wgpu::BlendFactor::One,
                operation: wgpu::BlendOperation::Add,
            };
            wgpu::BlendState {
                color: add,
                alpha: add,
            }
        }
    }
}

/// 32-bit float targets cannot blend without an optional feature.
fn blendable(format: wgpu::TextureFormat) -> bool {
    !matches!(format, wgpu::TextureFormat::R32Float)
}

fn sample_type(sample: SampleKind) -> wgpu::TextureSampleType {
    match sample {
        SampleKind::Filterable => wgpu::TextureSampleType::Float { filterable: true },
        SampleKind::Unfilterable => wgpu::TextureSampleType::Float { filterable: false },
        SampleKind::Depth => wgpu::TextureSampleType::Depth,
    }
}

fn view_dimension(dimension: TextureDimension) -> wgpu::TextureViewDimension {
    match dimension {
        TextureDimension::D2 => wgpu::TextureViewDimension::D2,
        TextureDimension::D3 => wgpu::TextureViewDimension::D3,
    }
}

impl WgpuBackend {
    /// Compiles `program` and builds its bind group layout.
    ///
    /// WGSL errors are caught in a validation error scope and reported with
    /// the program's label.
    pub(super) fn compile(&mut self, program: &ProgramSource) -> RenderResult<ProgramHandle> {
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let module = self
            .device
            .create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some(&program.label),
                source: wgpu::ShaderSource::Wgsl(program.source.as_str().into()),
            });
        if let Some(error) = pollster::block_on(self.device.pop_error_scope()) {
            return Err(RenderError::ShaderCompilationFailed {
                features: program.label.clone(),
                message: error.to_string(),
            });
        }

        let layout = UniformLayout::new(&program.uniforms);
        let bindings = texture_bindings(&program.samplers);
        let mut entries = vec![wgpu::BindGroupLayoutEntry {
            binding: 0,
            visibility: wgpu::ShaderStages::VERTEX | wgpu::ShaderStages::FRAGMENT,
            ty: wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Uniform,
                has_dynamic_offset: false,
                min_binding_size: NonZeroU64::new(layout.byte_size() as u64),
            },
            count: None,
        }];
        for binding in &bindings {
            entries.push(wgpu::BindGroupLayoutEntry {
                binding: binding.texture,
                visibility: wgpu::ShaderStages::FRAGMENT,
                ty: wgpu::BindingType::Texture {
                    sample_type: sample_type(binding.sample),
                    view_dimension: view_dimension(binding.dimension),
                    multisampled: false,
                },
                count: None,
            });
            if let Some(sampler) = binding.sampler {
                entries.push(wgpu::BindGroupLayoutEntry {
                    binding: sampler,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
                    count: None,
                });
            }
        }

        let bind_group_layout =
            self.device
                .create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                    label: Some(&program.label),
                    entries: &entries,
                });
        let pipeline_layout = self
            .device
            .create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some(&program.label),
                bind_group_layouts: &[&bind_group_layout],
                push_constant_ranges: &[],
            });

        let handle = ProgramHandle::new(self.allocate_id());
        let block = vec![0.0; layout.byte_size() / 4];
        self.programs.insert(
            handle.id(),
            GpuProgram {
                label: program.label.clone(),
                module,
                layout,
                bindings,
                bind_group_layout,
                pipeline_layout,
                block,
            },
        );
        log::debug!("compiled program '{}'", program.label);
        Ok(handle)
    }

    /// Drops a program and every pipeline built from it.
    pub(super) fn forget_program(&mut self, program: ProgramHandle) {
        if self.programs.remove(&program.id()).is_some() {
            self.pipelines.retain(|key, _| key.program != program);
        }
        if self.current_program == Some(program) {
            self.current_program = None;
        }
    }

    /// Snapshots the bound program, uniforms and textures into a draw.
    pub(super) fn record_draw(&mut self, geometry: Option<GeometryHandle>) -> RenderResult<()> {
        if self.pass.is_none() {
            return Err(RenderError::NoActivePass);
        }
        let handle = self.current_program.ok_or(RenderError::UnknownHandle {
            kind: "program",
            id: 0,
        })?;
        let program = self.programs.get(&handle.id()).ok_or(RenderError::UnknownHandle {
            kind: "program",
            id: handle.id(),
        })?;
        let mut textures = Vec::with_capacity(program.bindings.len());
        for binding in &program.bindings {
            let bound = self
                .samplers
                .get(&binding.name)
                .and_then(|unit| self.units.get(unit))
                .copied();
            textures.push(match bound {
                Some(texture) => texture,
                None => self.fallback(binding.dimension, binding.sample)?,
            });
        }
        let command = DrawCommand {
            program: handle,
            state: self.state,
            geometry,
            uniforms: program.block.clone(),
            textures,
        };
        if let Some(pass) = self.pass.as_mut() {
            pass.draws.push(command);
        }
        Ok(())
    }

    fn ensure_pipeline(&mut self, key: &PipelineKey) -> RenderResult<()> {
        if self.pipelines.contains_key(key) {
            return Ok(());
        }
        let program = self
            .programs
            .get(&key.program.id())
            .ok_or(RenderError::UnknownHandle {
                kind: "program",
                id: key.program.id(),
            })?;

        let positions = [wgpu::VertexBufferLayout {
            array_stride: std::mem::size_of::<[f32; 3]>() as wgpu::BufferAddress,
            step_mode: wgpu::VertexStepMode::Vertex,
            attributes: &POSITION_ATTRIBUTES,
        }];
        let vertex_buffers: &[wgpu::VertexBufferLayout<'_>] =
            if key.indexed { &positions } else { &[] };
        let targets: Vec<Option<wgpu::ColorTargetState>> = key
            .color_formats
            .iter()
            .map(|&format| {
                Some(wgpu::ColorTargetState {
                    format,
                    blend: blendable(format).then(|| blend_state(key.state.blend)),
                    write_mask: wgpu::ColorWrites::ALL,
                })
            })
            .collect();

        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let pipeline = self
            .device
            .create_render_pipeline(&wgpu::RenderPipelineDescriptor {
                label: Some(&program.label),
                layout: Some(&program.pipeline_layout),
                vertex: wgpu::VertexState {
                    module: &program.module,
                    entry_point: Some("vs_main"),
                    buffers: vertex_buffers,
                    compilation_options: wgpu::PipelineCompilationOptions::default(),
                },
                fragment: Some(wgpu::FragmentState {
                    module: &program.module,
                    entry_point: Some("fs_main"),
                    targets: &targets,
                    compilation_options: wgpu::PipelineCompilationOptions::default(),
                }),
                primitive: wgpu::PrimitiveState {
                    topology: wgpu::PrimitiveTopology::TriangleList,
                    strip_index_format: None,
                    front_face: wgpu::FrontFace::Ccw,
                    cull_mode: key.state.cull_back_faces.then_some(wgpu::Face::Back),
                    polygon_mode: wgpu::PolygonMode::Fill,
                    unclipped_depth: false,
                    conservative: false,
                },
                depth_stencil: key.depth.then(|| wgpu::DepthStencilState {
                    format: wgpu::TextureFormat::Depth32Float,
                    depth_write_enabled: key.state.depth_write,
                    depth_compare: if key.state.depth_test {
                        wgpu::CompareFunction::LessEqual
                    } else {
                        wgpu::CompareFunction::Always
                    },
                    stencil: wgpu::StencilState::default(),
                    bias: wgpu::DepthBiasState::default(),
                }),
                multisample: wgpu::MultisampleState::default(),
                multiview: None,
                cache: None,
            });
        if let Some(error) = pollster::block_on(self.device.pop_error_scope()) {
            return Err(RenderError::ShaderCompilationFailed {
                features: program.label.clone(),
                message: error.to_string(),
            });
        }
        self.pipelines.insert(key.clone(), pipeline);
        Ok(())
    }

    fn bind_group(&self, draw: &DrawCommand) -> RenderResult<wgpu::BindGroup> {
        let program = self
            .programs
            .get(&draw.program.id())
            .ok_or(RenderError::UnknownHandle {
                kind: "program",
                id: draw.program.id(),
            })?;
        let uniforms = self
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("volray uniforms"),
                contents: bytemuck::cast_slice(&draw.uniforms),
                usage: wgpu::BufferUsages::UNIFORM,
            });

        let mut entries = vec![wgpu::BindGroupEntry {
            binding: 0,
            resource: uniforms.as_entire_binding(),
        }];
        for (binding, &handle) in program.bindings.iter().zip(&draw.textures) {
            let texture = self.texture_entry(handle)?;
            entries.push(wgpu::BindGroupEntry {
                binding: binding.texture,
                resource: wgpu::BindingResource::TextureView(&texture.view),
            });
            if let Some(slot) = binding.sampler {
                let sampler = match texture.filter {
                    FilterMode::Linear => &self.linear_sampler,
                    FilterMode::Nearest => &self.nearest_sampler,
                };
                entries.push(wgpu::BindGroupEntry {
                    binding: slot,
                    resource: wgpu::BindingResource::Sampler(sampler),
                });
            }
        }
        Ok(self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(&program.label),
            layout: &program.bind_group_layout,
            entries: &entries,
        }))
    }

    /// Color and depth attachments of a pass target.
    fn attachments(
        &self,
        target: PassTarget,
    ) -> RenderResult<(Vec<TextureHandle>, Option<TextureHandle>, [u32; 2])> {
        match target {
            PassTarget::Frame => {
                let frame = self.frame.as_ref().ok_or(RenderError::UnknownHandle {
                    kind: "frame target",
                    id: 0,
                })?;
                Ok((vec![frame.color], frame.depth, frame.size))
            }
            PassTarget::Offscreen(handle) => {
                let target = self
                    .targets
                    .get(&handle.id())
                    .ok_or(RenderError::UnknownHandle {
                        kind: "render target",
                        id: handle.id(),
                    })?;
                Ok((target.color.clone(), target.depth, target.size))
            }
        }
    }

    /// Encodes and submits a recorded pass.
    pub(super) fn submit_pass(&mut self, pass: PassRecord) -> RenderResult<()> {
        let (color, depth, size) = self.attachments(pass.desc.target)?;
        let color_formats = color
            .iter()
            .map(|&h| self.texture_entry(h).map(|t| texture_format(t.format)))
            .collect::<RenderResult<Vec<_>>>()?;

        let mut keys = Vec::with_capacity(pass.draws.len());
        for draw in &pass.draws {
            let key = PipelineKey {
                program: draw.program,
                state: draw.state,
                color_formats: color_formats.clone(),
                depth: depth.is_some(),
                indexed: draw.geometry.is_some(),
            };
            self.ensure_pipeline(&key)?;
            keys.push(key);
        }
        let bind_groups = pass
            .draws
            .iter()
            .map(|draw| self.bind_group(draw))
            .collect::<RenderResult<Vec<_>>>()?;

        let color_views = color
            .iter()
            .map(|&h| self.texture_entry(h).map(|t| &t.view))
            .collect::<RenderResult<Vec<_>>>()?;
        let depth_view = depth
            .map(|h| self.texture_entry(h).map(|t| &t.view))
            .transpose()?;
        let clear = pass.desc.clear_color.map(|[r, g, b, a]| wgpu::Color {
            r: f64::from(r),
            g: f64::from(g),
            b: f64::from(b),
            a: f64::from(a),
        });
        let color_attachments: Vec<Option<wgpu::RenderPassColorAttachment<'_>>> = color_views
            .iter()
            .map(|view| {
                Some(wgpu::RenderPassColorAttachment {
                    view,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: clear.map_or(wgpu::LoadOp::Load, wgpu::LoadOp::Clear),
                        store: wgpu::StoreOp::Store,
                    },
                    depth_slice: None,
                })
            })
            .collect();

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("volray pass encoder"),
            });
        {
            let mut render_pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("volray pass"),
                color_attachments: &color_attachments,
                depth_stencil_attachment: depth_view.map(|view| {
                    wgpu::RenderPassDepthStencilAttachment {
                        view,
                        depth_ops: Some(wgpu::Operations {
                            load: pass
                                .desc
                                .clear_depth
                                .map_or(wgpu::LoadOp::Load, wgpu::LoadOp::Clear),
                            store: wgpu::StoreOp::Store,
                        }),
                        stencil_ops: None,
                    }
                }),
                ..Default::default()
            });

            if let Some(viewport) = pass.desc.viewport {
                let x = viewport.x.min(size[0].saturating_sub(1));
                let y = viewport.y.min(size[1].saturating_sub(1));
                let width = viewport.width.min(size[0] - x).max(1);
                let height = viewport.height.min(size[1] - y).max(1);
                #[allow(clippy::cast_precision_loss)]
                render_pass.set_viewport(x as f32, y as f32, width as f32, height as f32, 0.0, 1.0);
            }

            for ((draw, key), bind_group) in pass.draws.iter().zip(&keys).zip(&bind_groups) {
                let Some(pipeline) = self.pipelines.get(key) else {
                    continue;
                };
                render_pass.set_pipeline(pipeline);
                render_pass.set_bind_group(0, bind_group, &[]);
                let Some(handle) = draw.geometry else {
                    render_pass.draw(0..3, 0..1);
                    continue;
                };
                // Released between the draw call and submission.
                let Some(geometry) = self.geometries.get(&handle.id()) else {
                    continue;
                };
                render_pass.set_vertex_buffer(0, geometry.vertices.slice(..));
                render_pass.set_index_buffer(geometry.indices.slice(..), wgpu::IndexFormat::Uint32);
                render_pass.draw_indexed(0..geometry.index_count, 0, 0..1);
            }
        }
        self.queue.submit(std::iter::once(encoder.finish()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_float_targets_do_not_blend() {
        assert!(blendable(wgpu::TextureFormat::Rgba8Unorm));
        assert!(!blendable(wgpu::TextureFormat::R32Float));
    }

    #[test]
    fn test_maximum_blend_uses_max() {
        let state = blend_state(BlendState::Maximum);
        assert_eq!(state.color.operation, wgpu::BlendOperation::Max);
        assert_eq!(blend_state(BlendState::Replace), wgpu::BlendState::REPLACE);
    }
}
