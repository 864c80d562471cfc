//! Depth pre-pass: rasterizes contour surfaces of the first input so rays
//! start at the first surface instead of the bounding box.

use glam::DMat4;
use volray_core::marching_cubes::contour_image;
use volray_core::{Camera, ImageData, TimeStamp};

use crate::error::RenderResult;
use crate::gpu::{
    mat4_uniform, BlendState, GeometryHandle, GpuBackend, PassDesc, PassTarget, PipelineState,
    RenderTarget, RenderTargetDesc, TexelFormat, TextureHandle, Viewport,
};
use crate::shader::{build_depth_contour_program, ProgramCache};

/// What the contour mesh was extracted from.
#[derive(Debug, Clone, PartialEq)]
struct MeshKey {
    image_mtime: TimeStamp,
    scalars: Option<(u64, TimeStamp)>,
    values: Vec<f64>,
}

/// What the last depth image was drawn with.
#[derive(Debug, Clone, PartialEq)]
struct DrawKey {
    camera: Camera,
    matrix: DMat4,
    viewport: Viewport,
    mesh_time: TimeStamp,
}

/// Contour mesh, depth target and the state they were built for.
#[derive(Debug, Default)]
pub struct DepthPass {
    target: Option<RenderTarget>,
    mesh: Option<GeometryHandle>,
    triangles: usize,
    mesh_key: Option<MeshKey>,
    mesh_time: TimeStamp,
    drawn: Option<DrawKey>,
}

impl DepthPass {
    pub fn new() -> Self {
        Self::default()
    }

    /// Brings the depth image up to date and returns its depth texture.
    ///
    /// The mesh is re-extracted when the data or contour values change or
    /// when `stamp` is newer than the last extraction; the image is redrawn
    /// only when the camera, the transform, the viewport or the mesh changed.
    /// The target covers the viewport including its offset, so fragment
    /// coordinates of the ray-casting pass address it directly.
    #[allow(clippy::too_many_arguments)]
    pub fn update(
        &mut self,
        gpu: &mut dyn GpuBackend,
        programs: &mut ProgramCache,
        image: &ImageData,
        matrix: &DMat4,
        values: &[f64],
        camera: &Camera,
        viewport: Viewport,
        stamp: TimeStamp,
    ) -> RenderResult<Option<TextureHandle>> {
        let size = [viewport.x + viewport.width, viewport.y + viewport.height];
        let mesh_key = MeshKey {
            image_mtime: image.mtime(),
            scalars: image.scalars().map(|s| (s.id(), s.mtime())),
            values: values.to_vec(),
        };
        if self.mesh_key.as_ref() != Some(&mesh_key) || stamp > self.mesh_time {
            self.rebuild_mesh(gpu, image, values)?;
            self.mesh_key = Some(mesh_key);
        }

        if self.target.as_ref().is_none_or(|t| t.size != size) {
            if let Some(old) = self.target.take() {
                gpu.release_render_target(&old);
            }
            self.target = Some(gpu.create_render_target(&RenderTargetDesc {
                label: "depth pass",
                size,
                color_formats: &[TexelFormat::Rgba8Unorm],
                depth: true,
            })?);
            self.drawn = None;
        }
        let Some(target) = self.target.as_ref() else {
            return Ok(None);
        };

        let draw_key = DrawKey {
            camera: camera.clone(),
            matrix: *matrix,
            viewport,
            mesh_time: self.mesh_time,
        };
        if self.drawn.as_ref() != Some(&draw_key) {
            let (program, _) = programs.get_or_compile(gpu, &build_depth_contour_program())?;
            let desc = PassDesc {
                target: PassTarget::Offscreen(target.handle),
                clear_color: Some([0.0; 4]),
                clear_depth: Some(1.0),
                viewport: Some(viewport),
            };
            let mesh = self.mesh;
            crate::gpu::with_pass(gpu, &desc, |gpu| {
                let Some(mesh) = mesh else {
                    return Ok(());
                };
                gpu.use_program(program)?;
                gpu.set_pipeline_state(PipelineState {
                    blend: BlendState::Replace,
                    cull_back_faces: false,
                    depth_test: true,
                    depth_write: true,
                });
                let mvp = camera.view_projection_matrix() * *matrix;
                gpu.set_uniform("model_view_projection", mat4_uniform(&mvp));
                gpu.draw_indexed(mesh)
            })?;
            log::debug!("depth pass redrawn ({} triangles)", self.triangles);
            self.drawn = Some(draw_key);
        }
        Ok(target.depth)
    }

    fn rebuild_mesh(
        &mut self,
        gpu: &mut dyn GpuBackend,
        image: &ImageData,
        values: &[f64],
    ) -> RenderResult<()> {
        if let Some(old) = self.mesh.take() {
            gpu.release_geometry(old);
        }
        let contours = contour_image(image, values)?;
        self.triangles = contours.num_triangles();
        if !contours.is_empty() {
            let positions: Vec<[f32; 3]> = contours.vertices.iter().map(|v| v.to_array()).collect();
            self.mesh = Some(gpu.create_geometry(&positions, &contours.indices)?);
        }
        self.mesh_time.modified();
        log::info!(
            "depth pass: {} contour triangles at {:?}",
            self.triangles,
            values
        );
        Ok(())
    }

    /// Number of contour triangles.
    pub fn triangles(&self) -> usize {
        self.triangles
    }

    /// Releases the mesh and the target.
    pub fn release(&mut self, gpu: &mut dyn GpuBackend) {
        if let Some(mesh) = self.mesh.take() {
            gpu.release_geometry(mesh);
        }
        if let Some(target) = self.target.take() {
            gpu.release_render_target(&target);
        }
        self.mesh_key = None;
        self.drawn = None;
        self.triangles = 0;
    }
}
