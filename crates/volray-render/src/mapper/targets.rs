//! Offscreen targets: the reduced-resolution image target and the owned
//! render-to-image outputs.

use volray_core::DepthImageFormat;

use crate::error::RenderResult;
use crate::gpu::{
    BlendState, GpuBackend, PassDesc, PassTarget, PipelineState, ProgramHandle, RenderTarget,
    RenderTargetDesc, TexelFormat, TextureHandle, UniformValue, Viewport,
};
use crate::shader::{build_composite_program, ProgramCache};
use crate::units::{self, TextureUnits};

/// Texel format of the normalized-depth output.
pub fn depth_image_format(format: DepthImageFormat) -> TexelFormat {
    match format {
        // Neither narrow format is a render target on every device.
        DepthImageFormat::Unorm8 | DepthImageFormat::Unorm16 | DepthImageFormat::Float32 => {
            TexelFormat::R32Float
        }
    }
}

/// Color formats of a target with `draw_buffers` outputs.
fn color_formats(draw_buffers: usize, depth: TexelFormat) -> Vec<TexelFormat> {
    let mut formats = vec![TexelFormat::Rgba8Unorm];
    if draw_buffers > 1 {
        formats.push(depth);
    }
    formats
}

/// A target that is reused while it is large enough.
#[derive(Debug, Default)]
pub struct SampleTarget {
    target: Option<RenderTarget>,
    draw_buffers: usize,
    used: [u32; 2],
}

impl SampleTarget {
    /// Makes the target hold at least `size` pixels and `draw_buffers` outputs.
    ///
    /// The target grows but never shrinks; [`Self::used_size`] is the part
    /// drawn this frame.
    pub fn ensure(
        &mut self,
        gpu: &mut dyn GpuBackend,
        size: [u32; 2],
        draw_buffers: usize,
        depth_format: TexelFormat,
    ) -> RenderResult<&RenderTarget> {
        self.used = size;
        let target = match self.target.take() {
            Some(t)
                if t.size[0] >= size[0]
                    && t.size[1] >= size[1]
                    && self.draw_buffers >= draw_buffers =>
            {
                t
            }
            old => {
                let grown = old.as_ref().map_or(size, |t| {
                    [t.size[0].max(size[0]), t.size[1].max(size[1])]
                });
                if let Some(old) = old {
                    gpu.release_render_target(&old);
                }
                let formats = color_formats(draw_buffers, depth_format);
                let target = gpu.create_render_target(&RenderTargetDesc {
                    label: "image sample target",
                    size: grown,
                    color_formats: &formats,
                    depth: draw_buffers > 1,
                })?;
                log::debug!("image sample target {}x{}", grown[0], grown[1]);
                self.draw_buffers = draw_buffers;
                target
            }
        };
        Ok(&*self.target.insert(target))
    }

    /// Pixels drawn this frame.
    pub fn used_size(&self) -> [u32; 2] {
        self.used
    }

    pub fn target(&self) -> Option<&RenderTarget> {
        self.target.as_ref()
    }

    pub fn release(&mut self, gpu: &mut dyn GpuBackend) {
        if let Some(target) = self.target.take() {
            gpu.release_render_target(&target);
        }
        self.draw_buffers = 0;
    }
}

/// Owned color, normalized-depth and depth outputs at window size.
#[derive(Debug, Default)]
pub struct ImageTarget {
    target: Option<RenderTarget>,
    format: Option<DepthImageFormat>,
}

impl ImageTarget {
    /// Recreates the outputs on a size or depth-format change.
    pub fn ensure(
        &mut self,
        gpu: &mut dyn GpuBackend,
        size: [u32; 2],
        format: DepthImageFormat,
    ) -> RenderResult<&RenderTarget> {
        let target = match self.target.take() {
            Some(t) if t.size == size && self.format == Some(format) => t,
            old => {
                if let Some(old) = old {
                    gpu.release_render_target(&old);
                }
                let formats = color_formats(2, depth_image_format(format));
                let target = gpu.create_render_target(&RenderTargetDesc {
                    label: "render to image",
                    size,
                    color_formats: &formats,
                    depth: true,
                })?;
                log::debug!("render-to-image target {}x{}", size[0], size[1]);
                self.format = Some(format);
                target
            }
        };
        Ok(&*self.target.insert(target))
    }

    pub fn target(&self) -> Option<&RenderTarget> {
        self.target.as_ref()
    }

    /// The color output.
    pub fn color(&self) -> Option<TextureHandle> {
        self.target.as_ref().and_then(|t| t.color.first().copied())
    }

    /// The normalized-depth output.
    pub fn depth_image(&self) -> Option<TextureHandle> {
        self.target.as_ref().and_then(|t| t.color.get(1).copied())
    }

    /// The depth attachment.
    pub fn depth(&self) -> Option<TextureHandle> {
        self.target.as_ref().and_then(|t| t.depth)
    }

    pub fn release(&mut self, gpu: &mut dyn GpuBackend) {
        if let Some(target) = self.target.take() {
            gpu.release_render_target(&target);
        }
        self.format = None;
    }
}

/// Draws the used part of `source` over `target` with a full-screen triangle.
#[allow(clippy::too_many_arguments)]
pub fn composite(
    gpu: &mut dyn GpuBackend,
    programs: &mut ProgramCache,
    units: &TextureUnits,
    source: TextureHandle,
    source_region: [f32; 2],
    target: PassTarget,
    viewport: Viewport,
) -> RenderResult<ProgramHandle> {
    let (program, _) = programs.get_or_compile(gpu, &build_composite_program())?;
    let desc = PassDesc {
        target,
        clear_color: None,
        clear_depth: None,
        viewport: Some(viewport),
    };
    crate::gpu::with_pass(gpu, &desc, |gpu| {
        gpu.use_program(program)?;
        gpu.set_pipeline_state(PipelineState {
            blend: BlendState::PremultipliedOver,
            cull_back_faces: false,
            depth_test: false,
            depth_write: false,
        });
        gpu.set_uniform(
            "source_region",
            UniformValue::Vec4([source_region[0], source_region[1], 0.0, 0.0]),
        );
        let guard = units::activate(gpu, units, "source", source)?;
        let drawn = gpu.draw_fullscreen();
        units::deactivate(gpu, guard);
        drawn
    })?;
    Ok(program)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recording::RecordingBackend;

    #[test]
    fn test_sample_target_grows_only() {
        let mut gpu = RecordingBackend::new();
        let mut target = SampleTarget::default();
        let first = target
            .ensure(&mut gpu, [100, 50], 1, TexelFormat::R32Float)
            .unwrap()
            .handle;
        let same = target
            .ensure(&mut gpu, [80, 40], 1, TexelFormat::R32Float)
            .unwrap()
            .handle;
        assert_eq!(first, same);
        assert_eq!(target.used_size(), [80, 40]);

        let grown = target
            .ensure(&mut gpu, [120, 40], 1, TexelFormat::R32Float)
            .unwrap();
        assert_eq!(grown.size, [120, 50]);

        let more_buffers = target
            .ensure(&mut gpu, [10, 10], 2, TexelFormat::R32Float)
            .unwrap();
        assert_eq!(more_buffers.color.len(), 2);
        assert!(more_buffers.depth.is_some());

        target.release(&mut gpu);
        assert_eq!(gpu.live_textures(), 0);
    }

    #[test]
    fn test_image_target_recreated_on_change() {
        let mut gpu = RecordingBackend::new();
        let mut image = ImageTarget::default();
        let a = image
            .ensure(&mut gpu, [64, 64], DepthImageFormat::Float32)
            .unwrap()
            .handle;
        let b = image
            .ensure(&mut gpu, [64, 64], DepthImageFormat::Float32)
            .unwrap()
            .handle;
        assert_eq!(a, b);
        let c = image
            .ensure(&mut gpu, [32, 64], DepthImageFormat::Float32)
            .unwrap()
            .handle;
        assert_ne!(a, c);
        assert!(image.color().is_some());
        assert!(image.depth_image().is_some());
        assert!(image.depth().is_some());
        // color, normalized depth and depth attachment
        assert_eq!(gpu.live_textures(), 3);
    }

    #[test]
    fn test_composite_draws_fullscreen() {
        let mut gpu = RecordingBackend::new();
        let mut programs = ProgramCache::default();
        let units = TextureUnits::new(4);
        let mut target = SampleTarget::default();
        let source = target
            .ensure(&mut gpu, [10, 10], 1, TexelFormat::R32Float)
            .unwrap()
            .color[0];
        composite(
            &mut gpu,
            &mut programs,
            &units,
            source,
            [1.0, 1.0],
            PassTarget::Frame,
            Viewport::new(20, 20),
        )
        .unwrap();
        let draws = gpu.draws();
        assert_eq!(draws.len(), 1);
        assert!(draws[0].geometry.is_none());
        assert_eq!(draws[0].textures, vec![("source".to_string(), source)]);
        assert_eq!(units.in_use(), 0);
    }
}
