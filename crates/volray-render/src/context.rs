//! State shared by every mapper drawing with one device, and the per-frame
//! view of the scene.

use volray_core::{Camera, Light, Selector, TimeStamp};

use crate::gpu::{GpuBackend, PassTarget, TextureHandle, Viewport};
use crate::shader::{ProgramCache, ShaderReplacement};
use crate::units::TextureUnits;

/// A device plus the program cache and texture units drawn against it.
///
/// Passed explicitly through every render call; nothing here is global.
#[derive(Debug)]
pub struct RenderContext<B: GpuBackend> {
    pub gpu: B,
    pub programs: ProgramCache,
    pub units: TextureUnits,
}

impl<B: GpuBackend> RenderContext<B> {
    /// Wraps `gpu`, sizing the unit pool from its limits.
    pub fn new(gpu: B) -> Self {
        let units = TextureUnits::new(gpu.limits().max_texture_units);
        Self {
            gpu,
            programs: ProgramCache::default(),
            units,
        }
    }

    /// Borrows the parts a mapper needs at once.
    pub fn parts(&mut self) -> (&mut dyn GpuBackend, &mut ProgramCache, &TextureUnits) {
        (&mut self.gpu, &mut self.programs, &self.units)
    }

    /// Releases every cached program.
    pub fn release_programs(&mut self) {
        self.programs.release_all(&mut self.gpu);
    }
}

/// An external post-processing pass that edits the ray-casting program.
pub trait VolumePass {
    /// Identity of the pass; a different set of ids forces a rebuild.
    fn id(&self) -> u64;

    /// Last change of the pass's shader edits.
    fn mtime(&self) -> TimeStamp;

    /// Edits applied to the ray-casting program.
    fn replacements(&self) -> Vec<ShaderReplacement> {
        Vec::new()
    }
}

/// What the scene supplies for one frame.
#[derive(Clone, Copy)]
pub struct SceneView<'a> {
    pub camera: &'a Camera,
    pub lights: &'a [Light],
    /// Region of the frame target to draw into.
    pub viewport: Viewport,
    /// Depth of the opaque geometry already drawn, sized like the frame.
    pub scene_depth: Option<TextureHandle>,
    pub selector: Option<&'a dyn Selector>,
    pub passes: &'a [&'a dyn VolumePass],
    /// Seconds the renderer grants this volume per frame.
    pub allocated_time: f64,
    /// Target of the final image unless rendering to an owned image.
    pub target: PassTarget,
}

impl<'a> SceneView<'a> {
    /// A view of the frame target with no lights, no scene depth and no picking.
    pub fn new(camera: &'a Camera, viewport: Viewport) -> Self {
        Self {
            camera,
            lights: &[],
            viewport,
            scene_depth: None,
            selector: None,
            passes: &[],
            allocated_time: 10.0,
            target: PassTarget::Frame,
        }
    }

    #[must_use]
    pub fn with_lights(mut self, lights: &'a [Light]) -> Self {
        self.lights = lights;
        self
    }

    #[must_use]
    pub fn with_scene_depth(mut self, depth: TextureHandle) -> Self {
        self.scene_depth = Some(depth);
        self
    }

    #[must_use]
    pub fn with_selector(mut self, selector: &'a dyn Selector) -> Self {
        self.selector = Some(selector);
        self
    }

    #[must_use]
    pub fn with_passes(mut self, passes: &'a [&'a dyn VolumePass]) -> Self {
        self.passes = passes;
        self
    }

    #[must_use]
    pub fn with_allocated_time(mut self, seconds: f64) -> Self {
        self.allocated_time = seconds;
        self
    }

    #[must_use]
    pub fn with_target(mut self, target: PassTarget) -> Self {
        self.target = target;
        self
    }
}

impl std::fmt::Debug for SceneView<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SceneView")
            .field("camera", self.camera)
            .field("lights", &self.lights.len())
            .field("viewport", &self.viewport)
            .field("scene_depth", &self.scene_depth)
            .field("picking", &self.selector.is_some())
            .field("passes", &self.passes.len())
            .field("allocated_time", &self.allocated_time)
            .field("target", &self.target)
            .finish()
    }
}
