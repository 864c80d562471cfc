//! Headless rendering.
//!
//! Renders a mapper into an offscreen frame without opening a window. Useful
//! for batch rendering, regression images and the demos.

use glam::DVec3;
use pollster::FutureExt;
use volray_core::geometry::box_corners;
use volray_core::{Camera, Light};
use volray_render::{
    FrameStats, RenderContext, SceneView, TexelFormat, Viewport, VolumeMapper, WgpuBackend,
};

use crate::Result;

/// A wgpu device with an offscreen frame, reused across renders.
#[derive(Debug)]
pub struct HeadlessRenderer {
    ctx: RenderContext<WgpuBackend>,
    /// Color the frame is cleared to before each render.
    pub background: [f32; 4],
}

impl HeadlessRenderer {
    /// Creates a device and a `width` x `height` frame.
    pub fn new(width: u32, height: u32) -> Result<Self> {
        let gpu = WgpuBackend::new_headless(width, height).block_on()?;
        Ok(Self {
            ctx: RenderContext::new(gpu),
            background: [0.0, 0.0, 0.0, 1.0],
        })
    }

    /// The render context, for callers that drive the mapper themselves.
    pub fn context(&mut self) -> &mut RenderContext<WgpuBackend> {
        &mut self.ctx
    }

    /// Frame size in pixels.
    pub fn size(&self) -> [u32; 2] {
        self.ctx.gpu.frame_size()
    }

    /// Resizes the frame.
    pub fn resize(&mut self, width: u32, height: u32) -> Result<()> {
        self.ctx.gpu.resize_frame(width, height)?;
        Ok(())
    }

    /// Clears the frame and renders one frame of `mapper`.
    pub fn render(
        &mut self,
        mapper: &mut VolumeMapper,
        camera: &Camera,
        lights: &[Light],
    ) -> Result<FrameStats> {
        self.ctx.gpu.clear_frame(self.background)?;
        let [width, height] = self.size();
        let view = SceneView::new(camera, Viewport::new(width, height)).with_lights(lights);
        let stats = mapper.render(&mut self.ctx, &view)?;
        log::debug!(
            "headless frame: {} draws, rebuilt {}",
            stats.draw_calls,
            stats.shader_rebuilt
        );
        Ok(stats)
    }

    /// RGBA8 pixels of the frame, row by row from the top left.
    pub fn pixels(&mut self) -> Result<Vec<u8>> {
        let color = self
            .ctx
            .gpu
            .frame_color()
            .ok_or(volray_render::RenderError::UnknownHandle {
                kind: "frame target",
                id: 0,
            })?;
        Ok(volray_render::GpuBackend::read_texture(&mut self.ctx.gpu, color)?)
    }

    /// Saves the frame as PNG or JPEG.
    pub fn save(&mut self, path: impl AsRef<std::path::Path>) -> Result<()> {
        let [width, height] = self.size();
        let pixels = self.pixels()?;
        volray_render::save_rgba(path, &pixels, width, height)?;
        Ok(())
    }

    /// Saves the mapper's render-to-image color or normalized depth output.
    pub fn save_image_output(
        &mut self,
        mapper: &VolumeMapper,
        path: impl AsRef<std::path::Path>,
        depth: bool,
    ) -> Result<bool> {
        let Some((color, normalized, _)) = mapper.image_outputs() else {
            return Ok(false);
        };
        let (texture, format) = match (depth, normalized) {
            (false, _) => (color, TexelFormat::Rgba8Unorm),
            (true, Some(normalized)) => (normalized, TexelFormat::R32Float),
            (true, None) => return Ok(false),
        };
        let size = self.size();
        volray_render::save_texture(&mut self.ctx.gpu, texture, format, size, path)?;
        Ok(true)
    }

    /// Frees the mapper's device resources and every cached program.
    pub fn release(&mut self, mapper: &mut VolumeMapper) {
        mapper.release_graphics_resources(&mut self.ctx.gpu);
        self.ctx.release_programs();
    }
}

/// A perspective camera framing the world bounds of every visible input.
pub fn fit_camera(mapper: &VolumeMapper, aspect_ratio: f64) -> Camera {
    let mut min = DVec3::splat(f64::INFINITY);
    let mut max = DVec3::splat(f64::NEG_INFINITY);
    for id in mapper.input_ids() {
        let Some(input) = mapper.input(*id) else {
            continue;
        };
        if !input.volume.visible {
            continue;
        }
        for corner in box_corners(input.volume.image.bounds()) {
            let world = input.volume.matrix.transform_point3(corner);
            min = min.min(world);
            max = max.max(world);
        }
    }
    let mut camera = Camera::new(aspect_ratio);
    if min.cmple(max).all() {
        camera.look_at_box(min, max);
    }
    camera
}

/// Renders `mapper` once on a fresh device and returns RGBA8 pixels.
pub fn render_to_image(
    mapper: &mut VolumeMapper,
    camera: &Camera,
    width: u32,
    height: u32,
) -> Result<Vec<u8>> {
    let mut renderer = HeadlessRenderer::new(width, height)?;
    let result = renderer
        .render(mapper, camera, &[])
        .and_then(|_| renderer.pixels());
    // Handles of this device are meaningless to the next one.
    renderer.release(mapper);
    result
}

/// Renders `mapper` once on a fresh device and saves the image.
pub fn render_to_file(
    path: impl AsRef<std::path::Path>,
    mapper: &mut VolumeMapper,
    camera: &Camera,
    width: u32,
    height: u32,
) -> Result<()> {
    let pixels = render_to_image(mapper, camera, width, height)?;
    volray_render::save_rgba(path, &pixels, width, height)?;
    Ok(())
}
