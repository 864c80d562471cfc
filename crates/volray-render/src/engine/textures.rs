//! Texture allocation, upload and readback for the wgpu backend.

use super::{GpuTexture, WgpuBackend};
use crate::error::{RenderError, RenderResult};
use crate::gpu::{
    FilterMode, SampleKind, TexelData, TexelFormat, TextureDesc, TextureDimension, TextureHandle,
};

/// Row pitch required by buffer copies.
const COPY_ROW_ALIGNMENT: u32 = wgpu::COPY_BYTES_PER_ROW_ALIGNMENT;

pub(super) fn texture_format(format: TexelFormat) -> wgpu::TextureFormat {
    match format {
        TexelFormat::R8Unorm => wgpu::TextureFormat::R8Unorm,
        TexelFormat::Rgba8Unorm => wgpu::TextureFormat::Rgba8Unorm,
        TexelFormat::R16Float => wgpu::TextureFormat::R16Float,
        TexelFormat::Rg16Float => wgpu::TextureFormat::Rg16Float,
        TexelFormat::Rgba16Float => wgpu::TextureFormat::Rgba16Float,
        TexelFormat::R32Float => wgpu::TextureFormat::R32Float,
        TexelFormat::Depth32Float => wgpu::TextureFormat::Depth32Float,
    }
}

fn texture_dimension(dimension: TextureDimension) -> wgpu::TextureDimension {
    match dimension {
        TextureDimension::D2 => wgpu::TextureDimension::D2,
        TextureDimension::D3 => wgpu::TextureDimension::D3,
    }
}

/// Bytes per row padded for a buffer copy.
pub(super) fn aligned_bytes_per_row(width: u32, bytes_per_texel: u32) -> u32 {
    let unpadded = width * bytes_per_texel;
    unpadded.div_ceil(COPY_ROW_ALIGNMENT) * COPY_ROW_ALIGNMENT
}

impl WgpuBackend {
    /// Allocates a texture; render attachments are also created through here.
    pub(super) fn allocate_texture(
        &mut self,
        desc: &TextureDesc<'_>,
        attachment: bool,
    ) -> RenderResult<TextureHandle> {
        let limits = self.device.limits();
        let max = match desc.dimension {
            TextureDimension::D2 => limits.max_texture_dimension_2d,
            TextureDimension::D3 => limits.max_texture_dimension_3d,
        };
        if desc.size.iter().any(|&s| s == 0 || s > max) {
            return Err(RenderError::TextureTooLarge {
                dims: desc.size.map(|s| s as usize),
                bytes: desc.byte_size(),
                max_dimension: max,
                budget: u64::MAX,
            });
        }

        let mut usage = wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_SRC;
        if attachment {
            usage |= wgpu::TextureUsages::RENDER_ATTACHMENT;
        }
        if !desc.format.is_depth() {
            usage |= wgpu::TextureUsages::COPY_DST;
        }

        self.device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        let texture = self.device.create_texture(&wgpu::TextureDescriptor {
            label: Some(desc.label),
            size: wgpu::Extent3d {
                width: desc.size[0],
                height: desc.size[1],
                depth_or_array_layers: desc.size[2],
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: texture_dimension(desc.dimension),
            format: texture_format(desc.format),
            usage,
            view_formats: &[],
        });
        if let Some(error) = pollster::block_on(self.device.pop_error_scope()) {
            log::warn!("texture '{}' allocation failed: {error}", desc.label);
            return Err(RenderError::OutOfMemory(desc.label.to_string()));
        }

        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        let handle = TextureHandle::new(self.allocate_id());
        self.textures.insert(
            handle.id(),
            GpuTexture {
                texture,
                view,
                label: desc.label.to_string(),
                dimension: desc.dimension,
                size: desc.size,
                format: desc.format,
                filter: desc.filter,
            },
        );
        Ok(handle)
    }

    pub(super) fn texture_entry(&self, handle: TextureHandle) -> RenderResult<&GpuTexture> {
        self.textures
            .get(&handle.id())
            .ok_or(RenderError::UnknownHandle {
                kind: "texture",
                id: handle.id(),
            })
    }

    pub(super) fn upload(
        &mut self,
        handle: TextureHandle,
        origin: [u32; 3],
        size: [u32; 3],
        data: TexelData<'_>,
    ) -> RenderResult<()> {
        let entry = self.texture_entry(handle)?;
        if !(0..3).all(|a| origin[a] + size[a] <= entry.size[a]) || entry.format.is_depth() {
            return Err(RenderError::InvalidUpload(format!(
                "{size:?} at {origin:?} outside texture '{}'",
                entry.label
            )));
        }
        let bytes = data.as_bytes();
        let bytes_per_texel = entry.format.bytes_per_texel();
        let expected =
            size.iter().map(|&s| s as usize).product::<usize>() * bytes_per_texel as usize;
        if bytes.len() != expected {
            return Err(volray_core::VolrayError::SizeMismatch {
                expected,
                actual: bytes.len(),
            }
            .into());
        }

        self.queue.write_texture(
            wgpu::TexelCopyTextureInfo {
                texture: &entry.texture,
                mip_level: 0,
                origin: wgpu::Origin3d {
                    x: origin[0],
                    y: origin[1],
                    z: origin[2],
                },
                aspect: wgpu::TextureAspect::All,
            },
            bytes,
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(size[0] * bytes_per_texel),
                rows_per_image: Some(size[1]),
            },
            wgpu::Extent3d {
                width: size[0],
                height: size[1],
                depth_or_array_layers: size[2],
            },
        );
        Ok(())
    }

    /// One-texel textures bound to declared slots nothing was bound to.
    pub(super) fn create_fallbacks(&mut self) -> RenderResult<()> {
        let desc = |dimension, format| TextureDesc {
            label: "fallback",
            dimension,
            size: [1, 1, 1],
            format,
            filter: FilterMode::Nearest,
        };
        let flat = desc(TextureDimension::D2, TexelFormat::Rgba8Unorm);
        let flat = self.allocate_texture(&flat, false)?;
        self.upload(flat, [0; 3], [1, 1, 1], TexelData::U8(&[0; 4]))?;
        let volume = desc(TextureDimension::D3, TexelFormat::Rgba8Unorm);
        let volume = self.allocate_texture(&volume, false)?;
        self.upload(volume, [0; 3], [1, 1, 1], TexelData::U8(&[0; 4]))?;
        let depth = desc(TextureDimension::D2, TexelFormat::Depth32Float);
        let depth = self.allocate_texture(&depth, true)?;

        // Depth textures cannot be written by copies; clear to the far plane.
        let entry = self.texture_entry(depth)?;
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("fallback depth clear"),
            });
        {
            let _pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("fallback depth clear"),
                color_attachments: &[],
                depth_stencil_attachment: Some(wgpu::RenderPassDepthStencilAttachment {
                    view: &entry.view,
                    depth_ops: Some(wgpu::Operations {
                        load: wgpu::LoadOp::Clear(1.0),
                        store: wgpu::StoreOp::Store,
                    }),
                    stencil_ops: None,
                }),
                ..Default::default()
            });
        }
        self.queue.submit(std::iter::once(encoder.finish()));

        self.fallbacks = Some(super::Fallbacks {
            flat,
            volume,
            depth,
        });
        Ok(())
    }

    /// Texture bound to a slot of `sample` kind and `dimension` when the
    /// program's binding has nothing assigned.
    pub(super) fn fallback(
        &self,
        dimension: TextureDimension,
        sample: SampleKind,
    ) -> RenderResult<TextureHandle> {
        let fallbacks = self.fallbacks.as_ref().ok_or(RenderError::UnknownHandle {
            kind: "fallback texture",
            id: 0,
        })?;
        Ok(match (sample, dimension) {
            (SampleKind::Depth, _) => fallbacks.depth,
            (_, TextureDimension::D2) => fallbacks.flat,
            (_, TextureDimension::D3) => fallbacks.volume,
        })
    }

    /// Copies a 2D texture into host memory, rows tightly packed.
    pub(super) fn read_back(&mut self, handle: TextureHandle) -> RenderResult<Vec<u8>> {
        let entry = self.texture_entry(handle)?;
        if entry.dimension != TextureDimension::D2 {
            return Err(RenderError::ReadbackFailed(format!(
                "'{}' is not a 2D texture",
                entry.label
            )));
        }
        let [width, height, _] = entry.size;
        let bytes_per_texel = entry.format.bytes_per_texel();
        let bytes_per_row = aligned_bytes_per_row(width, bytes_per_texel);
        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("readback buffer"),
            size: u64::from(bytes_per_row) * u64::from(height),
            usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
            mapped_at_creation: false,
        });

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("readback copy encoder"),
            });
        encoder.copy_texture_to_buffer(
            wgpu::TexelCopyTextureInfo {
                texture: &entry.texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: if entry.format.is_depth() {
                    wgpu::TextureAspect::DepthOnly
                } else {
                    wgpu::TextureAspect::All
                },
            },
            wgpu::TexelCopyBufferInfo {
                buffer: &buffer,
                layout: wgpu::TexelCopyBufferLayout {
                    offset: 0,
                    bytes_per_row: Some(bytes_per_row),
                    rows_per_image: Some(height),
                },
            },
            wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
        );
        self.queue.submit(std::iter::once(encoder.finish()));

        let slice = buffer.slice(..);
        let (tx, rx) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        let _ = self.device.poll(wgpu::PollType::wait_indefinitely());
        rx.recv()
            .map_err(|e| RenderError::ReadbackFailed(e.to_string()))?
            .map_err(|e| RenderError::ReadbackFailed(e.to_string()))?;

        let row_bytes = (width * bytes_per_texel) as usize;
        let mut pixels = Vec::with_capacity(row_bytes * height as usize);
        {
            let data = slice.get_mapped_range();
            for row in data.chunks(bytes_per_row as usize).take(height as usize) {
                pixels.extend_from_slice(&row[..row_bytes]);
            }
        }
        buffer.unmap();
        Ok(pixels)
    }
}
