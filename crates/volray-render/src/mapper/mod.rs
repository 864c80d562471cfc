//! Per-frame orchestration of the ray caster.
//!
//! [`VolumeMapper::render`] brings every input's bricks and tables up to
//! date, decides whether the program has to be rebuilt, draws the proxy
//! geometry of every brick back to front and composites reduced-resolution
//! images back onto the frame.

pub mod depth_pass;
pub mod proxy;
pub mod targets;
pub mod uniforms;

use std::time::Instant;

use glam::{DMat4, DVec3};
use rand::Rng;
use volray_core::geometry::box_corners;
use volray_core::reduction::effective_sample_distance;
use volray_core::{
    BlendMode, ComponentMode, ImageData, LightComplexity, MapperOptions, MaskType, PickingState,
    Plane, ReductionController, SelectionPass, TimeStamp, MAX_LIGHTS,
};

use crate::brick::{BrickStore, VolumeBlock};
use crate::context::{RenderContext, SceneView};
use crate::error::RenderResult;
use crate::gpu::{
    BlendState, FilterMode, GpuBackend, PassDesc, PassTarget, PipelineState, ProgramHandle,
    TexelData, TexelFormat, TextureDesc, TextureDimension, TextureHandle, Viewport,
};
use crate::input::{InputId, InputSet, InputUpdate, Volume, VolumeInput};
use crate::lookup_table::{LookupTable, TableKind, TableRequest, TableSource};
use crate::shader::fragments::label_table_name;
use crate::shader::{InputFeatures, ProgramCache, ShaderBuilder, ShaderKey};
use crate::units::{self, TextureUnits, UnitGuard};

use depth_pass::DepthPass;
use proxy::ProxyCache;
use targets::{ImageTarget, SampleTarget};

/// Side of the square jitter noise texture.
const NOISE_SIZE: u32 = 32;

/// Label color tables sampled in label-map mode.
const MAX_LABEL_TABLES: usize = 3;

/// What a frame did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FrameStats {
    /// Proxy draws of the ray-casting program.
    pub draw_calls: usize,
    /// The program source was regenerated this frame.
    pub shader_rebuilt: bool,
    /// The regenerated source was not in the program cache.
    pub program_compiled: bool,
    /// Inputs that contributed nothing, with the reason.
    pub skipped_inputs: Vec<(InputId, String)>,
    /// Some brick was drawn with near-plane clipped geometry.
    pub clipped_geometry: bool,
    /// Reduction factor in force (1 renders every pixel).
    pub reduction_factor: f64,
    /// Largest voxel id that cell picking can report.
    pub max_cell_id: u64,
}

/// Program bound by the last rebuild and what it was built from.
#[derive(Debug)]
struct ActiveProgram {
    handle: ProgramHandle,
    key: ShaderKey,
    build_time: TimeStamp,
    passes: Vec<(u64, TimeStamp)>,
}

/// The optional mask volume and its label color tables.
#[derive(Debug)]
struct Mask {
    image: ImageData,
    bricks: BrickStore,
    labels: Vec<LookupTable>,
}

impl Mask {
    fn new(image: ImageData) -> Self {
        Self {
            image,
            bricks: BrickStore::new("mask"),
            labels: Vec::new(),
        }
    }

    fn release(&mut self, gpu: &mut dyn GpuBackend) {
        self.bricks.release(gpu);
        for table in &mut self.labels {
            table.release(gpu);
        }
        self.labels.clear();
    }
}

/// Where the ray-casting pass draws this frame.
#[derive(Debug, Clone, Copy)]
struct DrawTarget {
    target: PassTarget,
    viewport: Viewport,
    clear: bool,
    /// Color texture to composite back, for reduced-resolution images.
    composite: Option<(TextureHandle, [f32; 2])>,
}

/// Ray-casting volume mapper.
///
/// Owns the GPU state of its inputs; programs and texture units belong to
/// the [`RenderContext`] passed to [`VolumeMapper::render`].
#[derive(Debug)]
pub struct VolumeMapper {
    options: MapperOptions,
    config_mtime: TimeStamp,
    inputs: InputSet,
    clipping_planes: Vec<Plane>,
    mask: Option<Mask>,
    reduction: ReductionController,
    picking: PickingState,
    program: Option<ActiveProgram>,
    proxies: ProxyCache,
    sample_target: SampleTarget,
    image_target: ImageTarget,
    depth_pass: DepthPass,
    noise: Option<TextureHandle>,
    sample_distance: f64,
    release_time: TimeStamp,
}

impl Default for VolumeMapper {
    fn default() -> Self {
        Self::new(MapperOptions::default())
    }
}

impl VolumeMapper {
    /// Creates a mapper with no inputs.
    pub fn new(options: MapperOptions) -> Self {
        let sample_distance = options.sample_distance;
        Self {
            options,
            config_mtime: TimeStamp::now(),
            inputs: InputSet::new(),
            clipping_planes: Vec::new(),
            mask: None,
            reduction: ReductionController::default(),
            picking: PickingState::default(),
            program: None,
            proxies: ProxyCache::new(),
            sample_target: SampleTarget::default(),
            image_target: ImageTarget::default(),
            depth_pass: DepthPass::new(),
            noise: None,
            sample_distance,
            release_time: TimeStamp::default(),
        }
    }

    /// Adds a volume; it is drawn after every input added before it.
    pub fn add_input(&mut self, volume: Volume) -> InputId {
        self.inputs.add(volume)
    }

    /// Removes a volume. Its GPU resources are released at the next frame.
    pub fn remove_input(&mut self, id: InputId) -> bool {
        self.inputs.remove(id)
    }

    pub fn input(&self, id: InputId) -> Option<&VolumeInput> {
        self.inputs.get(id)
    }

    pub fn input_mut(&mut self, id: InputId) -> Option<&mut VolumeInput> {
        self.inputs.get_mut(id)
    }

    /// Ids of every input in draw order.
    pub fn input_ids(&self) -> &[InputId] {
        self.inputs.ids()
    }

    pub fn options(&self) -> &MapperOptions {
        &self.options
    }

    /// Replaces the configuration after validating it.
    pub fn set_options(&mut self, options: MapperOptions) -> volray_core::Result<()> {
        options.validate()?;
        if options != self.options {
            self.options = options;
            self.config_mtime.modified();
        }
        Ok(())
    }

    /// World-space clipping planes; the kept side is along each normal.
    pub fn set_clipping_planes(&mut self, planes: Vec<Plane>) {
        if planes != self.clipping_planes {
            self.clipping_planes = planes;
            self.config_mtime.modified();
        }
    }

    pub fn clipping_planes(&self) -> &[Plane] {
        &self.clipping_planes
    }

    /// Sets or clears the mask volume. It shares the first input's grid and
    /// transform; the old mask is released right away.
    pub fn set_mask(&mut self, gpu: &mut dyn GpuBackend, mask: Option<ImageData>) {
        if let Some(mut old) = self.mask.take() {
            old.release(gpu);
        }
        self.mask = mask.map(Mask::new);
        self.config_mtime.modified();
    }

    /// Ray step used by the last frame.
    pub fn sample_distance(&self) -> f64 {
        self.sample_distance
    }

    /// Color, normalized depth and depth of the last render-to-image frame.
    pub fn image_outputs(
        &self,
    ) -> Option<(TextureHandle, Option<TextureHandle>, Option<TextureHandle>)> {
        self.image_target
            .color()
            .map(|color| (color, self.image_target.depth_image(), self.image_target.depth()))
    }

    /// Renders one frame of every visible input.
    ///
    /// Inputs that cannot be uploaded are skipped and listed in the returned
    /// stats; a program that fails to compile or a target that cannot be
    /// allocated fails the frame.
    pub fn render<B: GpuBackend>(
        &mut self,
        ctx: &mut RenderContext<B>,
        view: &SceneView<'_>,
    ) -> RenderResult<FrameStats> {
        let (gpu, programs, units) = ctx.parts();
        self.render_with(gpu, programs, units, view)
    }

    #[allow(clippy::too_many_lines)]
    fn render_with(
        &mut self,
        gpu: &mut dyn GpuBackend,
        programs: &mut ProgramCache,
        units: &TextureUnits,
        view: &SceneView<'_>,
    ) -> RenderResult<FrameStats> {
        let start = Instant::now();
        let mut stats = FrameStats {
            reduction_factor: self.reduction.factor(),
            ..FrameStats::default()
        };
        let released = self.inputs.release_removed(gpu);
        if released > 0 {
            log::debug!("released {released} removed inputs");
        }

        if self.options.cropping.enabled && self.options.cropping.validate().is_err() {
            log::debug!("degenerate cropping planes, nothing to render");
            return Ok(stats);
        }

        self.picking.update(view.selector);

        // Resolve the inputs that have something to draw
        let candidates: Vec<InputId> = self
            .inputs
            .iter()
            .filter(|input| input.volume.visible)
            .map(VolumeInput::id)
            .collect();
        if candidates.is_empty() {
            return Ok(stats);
        }

        let picking = self.picking.is_picking();
        let render_to_image = self.options.render_to_image;
        // Picking and render-to-image frames sample at full resolution
        let (image_sample_distance, reduction_factor) = if picking || render_to_image {
            (1.0, 1.0)
        } else {
            let distance = self.reduction.update(&self.options, view.allocated_time);
            (distance, self.reduction.factor())
        };
        stats.reduction_factor = reduction_factor;

        let spacings: Vec<(DVec3, DMat4)> = candidates
            .iter()
            .filter_map(|&id| self.inputs.get(id))
            .map(|input| (input.volume.image.spacing(), input.volume.matrix))
            .collect();
        self.sample_distance =
            effective_sample_distance(&self.options, &spacings, reduction_factor);

        let partitions = if candidates.len() > 1 {
            [1, 1, 1]
        } else {
            self.options.partitions
        };
        let frame = InputUpdate {
            options: &self.options,
            partitions,
            sample_distance: self.sample_distance,
            memory_budget: self.options.volume_memory_budget(),
        };
        let mut active = Vec::with_capacity(candidates.len());
        for id in candidates {
            let Some(input) = self.inputs.get_mut(id) else {
                continue;
            };
            match input.update(gpu, &frame) {
                Ok(uploads) => {
                    if uploads > 0 {
                        log::debug!("{id}: {uploads} lookup tables uploaded");
                    }
                    active.push(id);
                }
                Err(err) => {
                    log::warn!("{id} skipped: {err}");
                    stats.skipped_inputs.push((id, err.to_string()));
                }
            }
        }
        let Some(&first_id) = active.first() else {
            return Ok(stats);
        };

        let blend_mode = self.options.blend_mode;
        let iso_contours = self
            .inputs
            .get(first_id)
            .map_or(0, |i| i.volume.property.iso_surface_values().len());
        if blend_mode == BlendMode::Isosurface && iso_contours == 0 {
            log::debug!("isosurface blending without contour values, nothing to render");
            return Ok(stats);
        }

        let mask_type = self.update_mask(gpu, first_id, active.len())?;
        let key = self.shader_key(&active, view, mask_type, iso_contours);
        stats.max_cell_id = active
            .iter()
            .filter_map(|&id| self.inputs.get(id))
            .map(|i| i.bricks().dims().iter().map(|&d| d as u64).product::<u64>())
            .max()
            .unwrap_or(0);

        // Program
        let passes: Vec<(u64, TimeStamp)> = view.passes.iter().map(|p| (p.id(), p.mtime())).collect();
        let newest = self.newest_stamp(&active, &passes);
        let rebuild = self.program.as_ref().is_none_or(|p| {
            p.key != key || p.passes != passes || newest > p.build_time
        });
        if rebuild {
            let replacements: Vec<_> = active
                .iter()
                .filter_map(|&id| self.inputs.get(id))
                .flat_map(|i| i.volume.shader_replacements.iter().cloned())
                .chain(view.passes.iter().flat_map(|p| p.replacements()))
                .collect();
            let source = ShaderBuilder::new(&key).with_replacements(replacements).build();
            log::debug!("rebuilding ray-casting program [{}]", key.describe());
            // Forget the program first so a failed compile retries next frame
            self.program = None;
            let (handle, compiled) = programs.get_or_compile(gpu, &source)?;
            stats.shader_rebuilt = true;
            stats.program_compiled = compiled;
            self.program = Some(ActiveProgram {
                handle,
                key: key.clone(),
                build_time: TimeStamp::now(),
                passes,
            });
        }
        let Some(program) = self.program.as_ref().map(|p| p.handle) else {
            return Ok(stats);
        };

        // Draw target
        let target = self.draw_target(gpu, view, image_sample_distance)?;
        let depth_scale = if target.composite.is_some() {
            f64::from(view.viewport.width) / f64::from(target.viewport.width.max(1))
        } else {
            1.0
        };

        // Auxiliary textures
        let depth_pass = if key.depth_pass {
            let stamp = newest.max(self.config_mtime);
            match self.inputs.get(first_id) {
                Some(first) => self.depth_pass.update(
                    gpu,
                    programs,
                    &first.volume.image,
                    &first.volume.matrix,
                    &self.options.depth_pass_contour_values,
                    view.camera,
                    target.viewport,
                    stamp,
                )?,
                None => None,
            }
        } else {
            None
        };
        if key.jittering && self.noise.is_none() {
            self.noise = Some(create_noise(gpu)?);
        }
        let mut globals: Vec<(String, TextureHandle)> = Vec::new();
        if let Some(depth) = view.scene_depth.filter(|_| key.scene_depth) {
            globals.push(("scene_depth".into(), depth));
        }
        if let Some(depth) = depth_pass {
            globals.push(("depth_pass_depth".into(), depth));
        }
        if let Some(noise) = self.noise.filter(|_| key.jittering) {
            globals.push(("noise".into(), noise));
        }
        if let Some(mask) = self.mask.as_ref().filter(|_| key.mask.is_some()) {
            if let Some(texture) = mask.bricks.blocks().first().and_then(|b| b.texture) {
                globals.push(("mask_volume".into(), texture));
            }
            for (i, table) in mask.labels.iter().take(key.label_map_tables).enumerate() {
                if let Some(texture) = table.texture() {
                    globals.push((label_table_name(i + 1), texture));
                }
            }
        }

        // Ray-casting pass
        let desc = PassDesc {
            target: target.target,
            clear_color: target.clear.then_some([0.0; 4]),
            clear_depth: (target.clear && render_to_image).then_some(1.0),
            viewport: Some(target.viewport),
        };
        let state = PipelineState {
            blend: match blend_mode {
                BlendMode::MaximumIntensity => BlendState::Maximum,
                BlendMode::Additive => BlendState::Additive,
                _ => BlendState::PremultipliedOver,
            },
            cull_back_faces: true,
            depth_test: render_to_image,
            depth_write: render_to_image,
        };
        let mask_uniforms = self.mask_uniforms(first_id);
        let inputs = &mut self.inputs;
        let proxies = &mut self.proxies;
        let options = &self.options;
        let clipping_planes = &self.clipping_planes;
        let sample_distance = self.sample_distance;
        crate::gpu::with_pass(gpu, &desc, |gpu| {
            gpu.use_program(program)?;
            gpu.set_pipeline_state(state);
            uniforms::set_sampling(gpu, options, sample_distance);
            if key.light_complexity != LightComplexity::None {
                uniforms::set_lights(gpu, view.camera, view.lights, key.light_complexity);
            }
            if key.clipping {
                let intensity = inputs
                    .get(first_id)
                    .and_then(|i| i.volume.property.clipped_voxel_intensity());
                uniforms::set_clipping(gpu, clipping_planes, intensity);
            }
            if let Some(first) = inputs.get(first_id) {
                if key.cropping {
                    uniforms::set_cropping(gpu, &options.cropping, first.bricks().bounds());
                }
                uniforms::set_blend(gpu, options, &first.volume.property, &first.volume.matrix);
            }
            if let Some((world_to_tex, scale_bias)) = mask_uniforms {
                uniforms::set_mask(gpu, &world_to_tex, scale_bias, options.mask_blend_factor);
            }
            if key.picking == SelectionPass::ActorId {
                if let Some(selector) = view.selector {
                    uniforms::set_pick_color(gpu, selector.prop_id());
                }
            }
            if key.render_to_image {
                uniforms::set_render_to_image(gpu, options.clamp_depth_to_backface);
            }

            let mut guards = Vec::with_capacity(globals.len());
            for (name, texture) in &globals {
                guards.push(units::activate(gpu, units, name, *texture)?);
            }
            let drawn = if active.len() == 1 {
                draw_bricks(gpu, units, inputs, proxies, first_id, view, target.viewport, depth_scale, &mut stats)
            } else {
                draw_union(gpu, units, inputs, proxies, &active, view, target.viewport, depth_scale, &mut stats)
            };
            for guard in guards {
                units::deactivate(gpu, guard);
            }
            drawn
        })?;

        if let Some((color, region)) = target.composite {
            targets::composite(gpu, programs, units, color, region, view.target, view.viewport)?;
        }

        self.proxies.collect_unused(gpu);
        self.reduction
            .record_time_to_draw(start.elapsed().as_secs_f64(), view.allocated_time);
        Ok(stats)
    }

    /// Uploads the mask and its label tables; returns the mask mode in force.
    fn update_mask(
        &mut self,
        gpu: &mut dyn GpuBackend,
        first_id: InputId,
        active: usize,
    ) -> RenderResult<Option<MaskType>> {
        let Some(mask) = self.mask.as_mut() else {
            return Ok(None);
        };
        if active > 1 {
            log::debug!("mask ignored with {active} inputs");
            return Ok(None);
        }
        mask.bricks.set_partitions(gpu, [1, 1, 1])?;
        if let Err(err) = mask.bricks.load_volume(
            gpu,
            &mask.image,
            FilterMode::Nearest,
            self.options.volume_memory_budget(),
        ) {
            log::warn!("mask skipped: {err}");
            return Ok(None);
        }

        let mask_type = self.options.mask_type;
        if mask_type == MaskType::LabelMap {
            let Some(first) = self.inputs.get_mut(first_id) else {
                return Ok(Some(mask_type));
            };
            let color_range = first
                .table_ranges()
                .first()
                .map_or([0.0, 1.0], |r| r.color);
            let request = TableRequest {
                range: color_range,
                blend_mode: self.options.blend_mode,
                sample_distance: self.sample_distance,
                unit_distance: 1.0,
                filter: FilterMode::Linear,
            };
            let colors = first.volume.property.label_colors_mut();
            let wanted = colors.len().min(MAX_LABEL_TABLES);
            while mask.labels.len() > wanted {
                if let Some(mut table) = mask.labels.pop() {
                    table.release(gpu);
                }
            }
            while mask.labels.len() < wanted {
                let name = label_table_name(mask.labels.len() + 1);
                mask.labels.push(LookupTable::new(name, TableKind::LabelColor));
            }
            for (table, function) in mask.labels.iter_mut().zip(colors.iter_mut()) {
                if let Err(err) = table.update(gpu, TableSource::Color(function), &request) {
                    log::warn!("mask skipped: {err}");
                    return Ok(None);
                }
            }
        }
        Ok(Some(mask_type))
    }

    fn mask_uniforms(&self, first_id: InputId) -> Option<(DMat4, (f32, f32))> {
        let mask = self.mask.as_ref()?;
        let block = mask.bricks.blocks().first()?;
        let matrix = self.inputs.get(first_id)?.volume.matrix;
        let (scale, bias) = mask.bricks.scale_bias();
        Some((block.dataset_to_texture * matrix.inverse(), (scale[0], bias[0])))
    }

    /// Everything the program source depends on for this frame.
    fn shader_key(
        &self,
        active: &[InputId],
        view: &SceneView<'_>,
        mask_type: Option<MaskType>,
        iso_contours: usize,
    ) -> ShaderKey {
        let blend_mode = self.options.blend_mode;
        let inputs: Vec<InputFeatures> = active
            .iter()
            .filter_map(|&id| self.inputs.get(id))
            .map(|input| InputFeatures {
                tag: input.id().tag(),
                components: input.bricks().components(),
                mode: input.component_mode(),
                transfer_2d: input.usage().iter().map(|u| u.transfer_2d).collect(),
                gradient_opacity: input.usage().iter().map(|u| u.gradient_opacity).collect(),
                gradients: input.needs_gradient(blend_mode),
                shade: input.volume.property.shade(),
            })
            .collect();
        let shade = inputs.iter().any(|i| i.shade);
        let light_complexity = LightComplexity::from_lights(shade, view.lights);

        let label_map_tables = match (mask_type, active.first().and_then(|&id| self.inputs.get(id))) {
            (Some(MaskType::LabelMap), Some(first))
                if first.bricks().components() == 1
                    && first.component_mode() != ComponentMode::Invalid
                    && blend_mode != BlendMode::Additive =>
            {
                self.mask
                    .as_ref()
                    .map_or(0, |m| m.labels.len().min(MAX_LABEL_TABLES))
            }
            _ => 0,
        };
        let picking = if self.picking.is_picking() {
            self.picking.pass()
        } else {
            SelectionPass::None
        };

        ShaderKey {
            blend_mode,
            parallel_projection: view.camera.is_parallel(),
            inputs,
            light_complexity,
            num_lights: if light_complexity >= LightComplexity::Directional {
                view.lights.iter().filter(|l| l.switch).count().min(MAX_LIGHTS)
            } else {
                0
            },
            cropping: self.options.cropping.enabled,
            clipping: !self.clipping_planes.is_empty(),
            clipped_voxel_intensity: !self.clipping_planes.is_empty()
                && active
                    .first()
                    .and_then(|&id| self.inputs.get(id))
                    .is_some_and(|i| i.volume.property.clipped_voxel_intensity().is_some()),
            mask: mask_type,
            label_map_tables,
            picking,
            render_to_image: self.options.render_to_image,
            depth_pass: self.options.use_depth_pass
                && blend_mode == BlendMode::Composite
                && !self.options.depth_pass_contour_values.is_empty(),
            scene_depth: view.scene_depth.is_some(),
            jittering: self.options.use_jittering,
            iso_contours: if blend_mode == BlendMode::Isosurface {
                iso_contours
            } else {
                0
            },
        }
    }

    /// Newest stamp that invalidates the program.
    fn newest_stamp(&self, active: &[InputId], passes: &[(u64, TimeStamp)]) -> TimeStamp {
        active
            .iter()
            .filter_map(|&id| self.inputs.get(id))
            .flat_map(|i| [i.volume.property.mtime(), i.volume.shader_mtime()])
            .chain(passes.iter().map(|&(_, stamp)| stamp))
            .chain([
                self.config_mtime,
                self.picking.mtime(),
                self.inputs.membership_time(),
                self.release_time,
            ])
            .max()
            .unwrap_or_default()
    }

    fn draw_target(
        &mut self,
        gpu: &mut dyn GpuBackend,
        view: &SceneView<'_>,
        image_sample_distance: f64,
    ) -> RenderResult<DrawTarget> {
        let window = view.viewport;
        if self.options.render_to_image {
            let target = self.image_target.ensure(
                gpu,
                [window.width.max(1), window.height.max(1)],
                self.options.depth_image_format,
            )?;
            return Ok(DrawTarget {
                target: PassTarget::Offscreen(target.handle),
                viewport: Viewport::new(target.size[0], target.size[1]),
                clear: true,
                composite: None,
            });
        }
        if (image_sample_distance - 1.0).abs() > 1e-3 {
            let reduced = window.scaled(image_sample_distance);
            let target = self.sample_target.ensure(
                gpu,
                [reduced.width, reduced.height],
                1,
                TexelFormat::R32Float,
            )?;
            #[allow(clippy::cast_precision_loss)]
            let region = [
                reduced.width as f32 / target.size[0] as f32,
                reduced.height as f32 / target.size[1] as f32,
            ];
            return Ok(DrawTarget {
                target: PassTarget::Offscreen(target.handle),
                viewport: reduced,
                clear: true,
                composite: target.color.first().map(|&color| (color, region)),
            });
        }
        Ok(DrawTarget {
            target: view.target,
            viewport: window,
            clear: false,
            composite: None,
        })
    }

    /// Number of inputs, including hidden ones.
    pub fn len(&self) -> usize {
        self.inputs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inputs.is_empty()
    }

    /// Releases every device resource the mapper owns, each exactly once.
    ///
    /// The next frame re-uploads and rebuilds everything it needs.
    pub fn release_graphics_resources(&mut self, gpu: &mut dyn GpuBackend) {
        self.inputs.release_all(gpu);
        if let Some(mask) = self.mask.as_mut() {
            mask.release(gpu);
        }
        self.depth_pass.release(gpu);
        self.sample_target.release(gpu);
        self.image_target.release(gpu);
        self.proxies.release(gpu);
        if let Some(noise) = self.noise.take() {
            gpu.release_texture(noise);
        }
        self.program = None;
        self.release_time.modified();
        log::debug!("released graphics resources");
    }
}

/// Random ray offsets in `[0, 1)`.
fn create_noise(gpu: &mut dyn GpuBackend) -> RenderResult<TextureHandle> {
    let mut rng = rand::thread_rng();
    let texels: Vec<f32> = (0..NOISE_SIZE * NOISE_SIZE).map(|_| rng.gen::<f32>()).collect();
    let texture = gpu.create_texture(&TextureDesc {
        label: "jitter noise",
        dimension: TextureDimension::D2,
        size: [NOISE_SIZE, NOISE_SIZE, 1],
        format: TexelFormat::R32Float,
        filter: FilterMode::Nearest,
    })?;
    gpu.write_texture(texture, [0; 3], [NOISE_SIZE, NOISE_SIZE, 1], TexelData::F32(&texels))?;
    Ok(texture)
}

/// Binds the volume and lookup tables of `input` drawn through `block`.
fn bind_input(
    gpu: &mut dyn GpuBackend,
    units: &TextureUnits,
    input: &VolumeInput,
    block: &VolumeBlock,
) -> RenderResult<Vec<UnitGuard>> {
    let mut guards = Vec::new();
    if let Some(texture) = block.texture {
        guards.push(units::activate(gpu, units, &input.name("volume"), texture)?);
    }
    let rgba = input.component_mode() == ComponentMode::Rgba;
    for (set, (tables, usage)) in input.tables().iter().zip(input.usage()).enumerate() {
        if usage.transfer_2d {
            guards.extend(tables.transfer_2d.activate(gpu, units, &input.name(&format!("tf2d_{set}")))?);
            continue;
        }
        if !rgba {
            guards.extend(tables.color.activate(gpu, units, &input.name(&format!("color_{set}")))?);
        }
        guards.extend(tables.opacity.activate(gpu, units, &input.name(&format!("opacity_{set}")))?);
        if usage.gradient_opacity {
            guards.extend(tables.gradient.activate(gpu, units, &input.name(&format!("gradient_{set}")))?);
        }
    }
    Ok(guards)
}

fn release_units(gpu: &mut dyn GpuBackend, guards: Vec<UnitGuard>) {
    for guard in guards {
        units::deactivate(gpu, guard);
    }
}

/// Draws the bricks of a single input back to front, each through its own
/// proxy geometry.
#[allow(clippy::too_many_arguments)]
fn draw_bricks(
    gpu: &mut dyn GpuBackend,
    units: &TextureUnits,
    inputs: &mut InputSet,
    proxies: &mut ProxyCache,
    id: InputId,
    view: &SceneView<'_>,
    viewport: Viewport,
    depth_scale: f64,
    stats: &mut FrameStats,
) -> RenderResult<()> {
    let Some(input) = inputs.get_mut(id) else {
        return Ok(());
    };
    let matrix = input.volume.matrix;
    let tag = id.tag();
    uniforms::set_view(gpu, view.camera, viewport, depth_scale, &matrix);
    input.bricks_mut().sort_blocks_back_to_front(view.camera, &matrix);

    let mut visited = 0;
    let result = loop {
        let Some(block) = input.bricks_mut().next_block().cloned() else {
            break Ok(());
        };
        let index = input.bricks().order()[visited];
        visited += 1;
        let proxy = match proxies.geometry(gpu, &tag, index, &block.corners, &matrix, view.camera) {
            Ok(proxy) => proxy,
            Err(err) => break Err(err),
        };
        stats.clipped_geometry |= proxy.clipped;
        let Some(geometry) = proxy.geometry else {
            continue;
        };
        uniforms::set_input(gpu, input, &block);
        let guards = match bind_input(gpu, units, input, &block) {
            Ok(guards) => guards,
            Err(err) => break Err(err),
        };
        let drawn = gpu.draw_indexed(geometry);
        release_units(gpu, guards);
        if let Err(err) = drawn {
            break Err(err);
        }
        stats.draw_calls += 1;
    };
    input.bricks_mut().reset();
    result
}

/// Draws every input in one pass through the union of their bounds.
#[allow(clippy::too_many_arguments)]
fn draw_union(
    gpu: &mut dyn GpuBackend,
    units: &TextureUnits,
    inputs: &mut InputSet,
    proxies: &mut ProxyCache,
    active: &[InputId],
    view: &SceneView<'_>,
    viewport: Viewport,
    depth_scale: f64,
    stats: &mut FrameStats,
) -> RenderResult<()> {
    let mut lo = DVec3::splat(f64::INFINITY);
    let mut hi = DVec3::splat(f64::NEG_INFINITY);
    let mut drawn: Vec<(InputId, VolumeBlock)> = Vec::with_capacity(active.len());
    for &id in active {
        let Some(input) = inputs.get(id) else {
            continue;
        };
        let Some(block) = input.bricks().blocks().first() else {
            continue;
        };
        for corner in block.world_corners(&input.volume.matrix) {
            lo = lo.min(corner);
            hi = hi.max(corner);
        }
        drawn.push((id, block.clone()));
    }
    if drawn.is_empty() {
        return Ok(());
    }

    let corners = box_corners([lo.x, hi.x, lo.y, hi.y, lo.z, hi.z]);
    let proxy = proxies.geometry(gpu, "union", 0, &corners, &DMat4::IDENTITY, view.camera)?;
    stats.clipped_geometry |= proxy.clipped;
    let Some(geometry) = proxy.geometry else {
        return Ok(());
    };
    uniforms::set_view(gpu, view.camera, viewport, depth_scale, &DMat4::IDENTITY);

    let mut guards = Vec::new();
    let mut bound = Ok(());
    for (id, block) in &drawn {
        let Some(input) = inputs.get(*id) else {
            continue;
        };
        uniforms::set_input(gpu, input, block);
        match bind_input(gpu, units, input, block) {
            Ok(more) => guards.extend(more),
            Err(err) => {
                bound = Err(err);
                break;
            }
        }
    }
    let result = bound.and_then(|()| gpu.draw_indexed(geometry));
    release_units(gpu, guards);
    result?;
    stats.draw_calls += 1;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recording::RecordingBackend;
    use volray_core::{Camera, ColorTransferFunction, ScalarArray, ScalarData, VolumeProperty};

    fn volume(n: usize) -> Volume {
        let mut image = ImageData::new([n, n, n]);
        let data = (0..n * n * n).map(|i| (i % 256) as f32).collect();
        image
            .set_point_scalars(ScalarArray::new("s", 1, ScalarData::F32(data)).unwrap())
            .unwrap();
        Volume::new(image, VolumeProperty::new())
    }

    fn outside_camera() -> Camera {
        let mut camera = Camera::new(1.0);
        camera.position = DVec3::new(8.0, 8.0, 60.0);
        camera.focal_point = DVec3::new(8.0, 8.0, 8.0);
        camera
    }

    #[test]
    fn test_single_input_single_draw() {
        let mut ctx = RenderContext::new(RecordingBackend::new());
        let mut mapper = VolumeMapper::default();
        mapper.add_input(volume(16));
        let camera = outside_camera();
        let view = SceneView::new(&camera, Viewport::new(64, 64));
        let stats = mapper.render(&mut ctx, &view).unwrap();
        assert_eq!(stats.draw_calls, 1);
        assert!(stats.shader_rebuilt);
        assert!(!stats.clipped_geometry);
        assert!(stats.skipped_inputs.is_empty());
        assert_eq!(stats.max_cell_id, 16 * 16 * 16);
        assert_eq!(ctx.units.in_use(), 0);

        let again = mapper.render(&mut ctx, &view).unwrap();
        assert!(!again.shader_rebuilt);
        assert_eq!(again.draw_calls, 1);
    }

    #[test]
    fn test_input_without_scalars_is_skipped() {
        let mut ctx = RenderContext::new(RecordingBackend::new());
        let mut mapper = VolumeMapper::default();
        let empty = mapper.add_input(Volume::new(ImageData::new([4, 4, 4]), VolumeProperty::new()));
        let camera = outside_camera();
        let stats = mapper
            .render(&mut ctx, &SceneView::new(&camera, Viewport::new(32, 32)))
            .unwrap();
        assert_eq!(stats.draw_calls, 0);
        assert_eq!(stats.skipped_inputs.len(), 1);
        assert_eq!(stats.skipped_inputs[0].0, empty);
    }

    #[test]
    fn test_degenerate_cropping_skips_frame() {
        let mut ctx = RenderContext::new(RecordingBackend::new());
        let mut options = MapperOptions::default();
        options.cropping.enabled = true;
        options.cropping.planes = [5.0, 1.0, 0.0, 1.0, 0.0, 1.0];
        let mut mapper = VolumeMapper::new(options);
        mapper.add_input(volume(8));
        let camera = outside_camera();
        let stats = mapper
            .render(&mut ctx, &SceneView::new(&camera, Viewport::new(32, 32)))
            .unwrap();
        assert_eq!(stats.draw_calls, 0);
        assert_eq!(ctx.gpu.stats().textures_created, 0);
    }

    #[test]
    fn test_isosurface_without_contours_skips_frame() {
        let mut ctx = RenderContext::new(RecordingBackend::new());
        let options = MapperOptions {
            blend_mode: BlendMode::Isosurface,
            ..MapperOptions::default()
        };
        let mut mapper = VolumeMapper::new(options);
        mapper.add_input(volume(8));
        let camera = outside_camera();
        let stats = mapper
            .render(&mut ctx, &SceneView::new(&camera, Viewport::new(32, 32)))
            .unwrap();
        assert_eq!(stats.draw_calls, 0);
        assert!(!stats.shader_rebuilt);
    }

    #[test]
    fn test_compile_failure_fails_frame_and_retries() {
        let mut ctx = RenderContext::new(RecordingBackend::new());
        ctx.gpu.fail_programs_containing(Some("fn ray_direction"));
        let mut mapper = VolumeMapper::default();
        mapper.add_input(volume(8));
        let camera = outside_camera();
        let view = SceneView::new(&camera, Viewport::new(32, 32));
        assert!(mapper.render(&mut ctx, &view).is_err());
        assert!(ctx.gpu.draws().is_empty());

        ctx.gpu.fail_programs_containing(None);
        let stats = mapper.render(&mut ctx, &view).unwrap();
        assert!(stats.shader_rebuilt);
        assert_eq!(stats.draw_calls, 1);
    }

    #[test]
    fn test_reduced_image_is_composited() {
        let mut ctx = RenderContext::new(RecordingBackend::new());
        let options = MapperOptions {
            auto_adjust_sample_distances: false,
            image_sample_distance: 2.0,
            ..MapperOptions::default()
        };
        let mut mapper = VolumeMapper::new(options);
        mapper.add_input(volume(8));
        let camera = outside_camera();
        let stats = mapper
            .render(&mut ctx, &SceneView::new(&camera, Viewport::new(64, 64)))
            .unwrap();
        assert_eq!(stats.draw_calls, 1);
        assert!((stats.reduction_factor - 0.5).abs() < 1e-12);
        let draws = ctx.gpu.draws();
        assert_eq!(draws.len(), 2);
        assert!(matches!(draws[0].target, PassTarget::Offscreen(_)));
        assert_eq!(draws[1].target, PassTarget::Frame);
        assert!(draws[1].geometry.is_none());
    }

    #[test]
    fn test_render_to_image_outputs() {
        let mut ctx = RenderContext::new(RecordingBackend::new());
        let options = MapperOptions {
            render_to_image: true,
            ..MapperOptions::default()
        };
        let mut mapper = VolumeMapper::new(options);
        mapper.add_input(volume(8));
        let camera = outside_camera();
        mapper
            .render(&mut ctx, &SceneView::new(&camera, Viewport::new(40, 30)))
            .unwrap();
        let (color, depth_image, depth) = mapper.image_outputs().unwrap();
        assert!(depth_image.is_some() && depth.is_some());
        let texture = ctx.gpu.texture(color).unwrap();
        assert_eq!(texture.size, [40, 30, 1]);
    }

    fn mask_image(n: usize) -> ImageData {
        let mut image = ImageData::new([n, n, n]);
        #[allow(clippy::cast_possible_truncation)]
        let labels = (0..n * n * n).map(|i| (i % 3) as u8).collect();
        image
            .set_point_scalars(ScalarArray::new("labels", 1, ScalarData::U8(labels)).unwrap())
            .unwrap();
        image
    }

    fn bound(ctx: &RenderContext<RecordingBackend>, name: &str) -> bool {
        ctx.gpu.draws()[0].textures.iter().any(|(n, _)| n == name)
    }

    #[test]
    fn test_binary_mask_is_bound() {
        let mut ctx = RenderContext::new(RecordingBackend::new());
        let mut mapper = VolumeMapper::default();
        mapper.add_input(volume(16));
        mapper.set_mask(&mut ctx.gpu, Some(mask_image(16)));
        let camera = outside_camera();
        let stats = mapper
            .render(&mut ctx, &SceneView::new(&camera, Viewport::new(32, 32)))
            .unwrap();
        assert_eq!(stats.draw_calls, 1);
        assert!(bound(&ctx, "mask_volume"));
        assert!(!bound(&ctx, "mask_label_1"));
        assert!(ctx.gpu.uniform("mask_world_to_tex").is_some());

        let live = ctx.gpu.live_textures();
        mapper.set_mask(&mut ctx.gpu, None);
        assert_eq!(ctx.gpu.live_textures(), live - 1);
    }

    #[test]
    fn test_label_map_mask_binds_label_tables() {
        let mut ctx = RenderContext::new(RecordingBackend::new());
        let options = MapperOptions {
            mask_type: MaskType::LabelMap,
            ..MapperOptions::default()
        };
        let mut mapper = VolumeMapper::new(options);
        let mut input = volume(16);
        input
            .property
            .set_label_colors(vec![ColorTransferFunction::default(); 2]);
        mapper.add_input(input);
        mapper.set_mask(&mut ctx.gpu, Some(mask_image(16)));
        let camera = outside_camera();
        mapper
            .render(&mut ctx, &SceneView::new(&camera, Viewport::new(32, 32)))
            .unwrap();
        assert!(bound(&ctx, "mask_volume"));
        assert!(bound(&ctx, "mask_label_1"));
        assert!(bound(&ctx, "mask_label_2"));
        assert!(!bound(&ctx, "mask_label_3"));
    }

    #[test]
    fn test_label_table_failure_drops_mask_only() {
        let camera = outside_camera();
        let label_map = MapperOptions {
            mask_type: MaskType::LabelMap,
            ..MapperOptions::default()
        };
        let labelled = || {
            let mut input = volume(16);
            input
                .property
                .set_label_colors(vec![ColorTransferFunction::default(); 2]);
            input
        };

        // Everything but the label tables
        let mut ctx = RenderContext::new(RecordingBackend::new());
        let mut mapper = VolumeMapper::default();
        mapper.add_input(labelled());
        mapper.set_mask(&mut ctx.gpu, Some(mask_image(16)));
        mapper
            .render(&mut ctx, &SceneView::new(&camera, Viewport::new(32, 32)))
            .unwrap();
        let budget = ctx.gpu.allocated_bytes();

        let mut ctx = RenderContext::new(RecordingBackend::new().with_texture_budget(budget));
        let mut mapper = VolumeMapper::new(label_map);
        mapper.add_input(labelled());
        mapper.set_mask(&mut ctx.gpu, Some(mask_image(16)));
        let stats = mapper
            .render(&mut ctx, &SceneView::new(&camera, Viewport::new(32, 32)))
            .unwrap();
        assert_eq!(stats.draw_calls, 1);
        assert!(stats.skipped_inputs.is_empty());
        assert!(!bound(&ctx, "mask_volume"));
        assert!(!bound(&ctx, "mask_label_1"));
    }

    #[test]
    fn test_full_resolution_frames_ignore_reduction() {
        let mut ctx = RenderContext::new(RecordingBackend::new());
        let mut mapper = VolumeMapper::default();
        mapper.add_input(volume(8));
        let camera = outside_camera();

        // No measured frame yet and almost no time: coarsen
        let view = SceneView::new(&camera, Viewport::new(32, 32)).with_allocated_time(1e-6);
        let coarse = mapper.render(&mut ctx, &view).unwrap();
        assert!(coarse.reduction_factor < 1.0);
        assert!(mapper.sample_distance() > 1.0);

        let mut options = mapper.options().clone();
        options.render_to_image = true;
        mapper.set_options(options).unwrap();
        let full = mapper.render(&mut ctx, &view).unwrap();
        assert!((full.reduction_factor - 1.0).abs() < 1e-12);
        assert!((mapper.sample_distance() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_mask_ignored_with_multiple_inputs() {
        let mut ctx = RenderContext::new(RecordingBackend::new());
        let mut mapper = VolumeMapper::default();
        mapper.add_input(volume(16));
        mapper.add_input(volume(16).with_matrix(DMat4::from_translation(DVec3::X * 20.0)));
        mapper.set_mask(&mut ctx.gpu, Some(mask_image(16)));
        let camera = outside_camera();
        let stats = mapper
            .render(&mut ctx, &SceneView::new(&camera, Viewport::new(32, 32)))
            .unwrap();
        assert_eq!(stats.draw_calls, 1);
        assert!(!bound(&ctx, "mask_volume"));
    }

    #[test]
    fn test_release_frees_everything() {
        let mut ctx = RenderContext::new(RecordingBackend::new());
        let options = MapperOptions {
            use_jittering: true,
            ..MapperOptions::default()
        };
        let mut mapper = VolumeMapper::new(options);
        mapper.add_input(volume(8));
        let camera = outside_camera();
        let view = SceneView::new(&camera, Viewport::new(32, 32));
        mapper.render(&mut ctx, &view).unwrap();
        assert!(ctx.gpu.live_textures() > 0);

        mapper.release_graphics_resources(&mut ctx.gpu);
        assert_eq!(ctx.gpu.live_textures(), 0);
        assert_eq!(ctx.gpu.live_geometries(), 0);
        mapper.release_graphics_resources(&mut ctx.gpu);

        let stats = mapper.render(&mut ctx, &view).unwrap();
        assert!(stats.shader_rebuilt);
        assert_eq!(stats.draw_calls, 1);
    }
}
