//! Volumes being rendered and their GPU-side state.
//!
//! Inputs are addressed by [`InputId`], a slot index plus a generation. Uniform
//! and table names derive from the id, so an input added after another was
//! removed never inherits the removed input's names or tables.

use std::fmt;

use glam::DMat4;
use volray_core::{
    BlendMode, ComponentMode, ImageData, MapperOptions, TimeStamp, VolrayError, VolumeProperty,
};

use crate::brick::BrickStore;
use crate::error::RenderResult;
use crate::gpu::{FilterMode, GpuBackend};
use crate::lookup_table::{TableRanges, TableRequest, TableSet, TableUsage};
use crate::shader::ShaderReplacement;

/// Stable identity of an input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InputId {
    index: u32,
    generation: u32,
}

impl InputId {
    /// Prefix of every uniform and texture name that belongs to this input.
    pub fn tag(self) -> String {
        format!("v{}g{}", self.index, self.generation)
    }
}

impl fmt::Display for InputId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "volume {}#{}", self.index, self.generation)
    }
}

/// A volume as supplied by the application.
#[derive(Debug, Clone)]
pub struct Volume {
    pub image: ImageData,
    pub property: VolumeProperty,
    /// Dataset to world transform.
    pub matrix: DMat4,
    pub visible: bool,
    /// Edits applied to the generated shader source.
    pub shader_replacements: Vec<ShaderReplacement>,
    shader_mtime: TimeStamp,
}

impl Volume {
    /// A visible volume with an identity transform.
    pub fn new(image: ImageData, property: VolumeProperty) -> Self {
        Self {
            image,
            property,
            matrix: DMat4::IDENTITY,
            visible: true,
            shader_replacements: Vec::new(),
            shader_mtime: TimeStamp::now(),
        }
    }

    /// Sets the dataset to world transform.
    #[must_use]
    pub fn with_matrix(mut self, matrix: DMat4) -> Self {
        self.matrix = matrix;
        self
    }

    /// Replaces the shader customizations.
    pub fn set_shader_replacements(&mut self, replacements: Vec<ShaderReplacement>) {
        self.shader_replacements = replacements;
        self.shader_mtime.modified();
    }

    /// Last change of the shader customizations.
    pub fn shader_mtime(&self) -> TimeStamp {
        self.shader_mtime
    }
}

/// Per-frame parameters for [`VolumeInput::update`].
#[derive(Debug, Clone, Copy)]
pub struct InputUpdate<'a> {
    pub options: &'a MapperOptions,
    pub partitions: [u16; 3],
    pub sample_distance: f64,
    pub memory_budget: u64,
}

/// A volume plus its bricks and lookup tables.
#[derive(Debug)]
pub struct VolumeInput {
    id: InputId,
    pub volume: Volume,
    bricks: BrickStore,
    tables: Vec<TableSet>,
    usage: Vec<TableUsage>,
    component_mode: ComponentMode,
    table_ranges: Vec<TableRanges>,
    mtime: TimeStamp,
}

impl VolumeInput {
    fn new(id: InputId, volume: Volume) -> Self {
        Self {
            id,
            volume,
            bricks: BrickStore::new(format!("{}_volume", id.tag())),
            tables: Vec::new(),
            usage: Vec::new(),
            component_mode: ComponentMode::Invalid,
            table_ranges: Vec::new(),
            mtime: TimeStamp::now(),
        }
    }

    pub fn id(&self) -> InputId {
        self.id
    }

    /// Name of a uniform or sampler owned by this input.
    pub fn name(&self, suffix: &str) -> String {
        format!("{}_{suffix}", self.id.tag())
    }

    pub fn bricks(&self) -> &BrickStore {
        &self.bricks
    }

    pub fn bricks_mut(&mut self) -> &mut BrickStore {
        &mut self.bricks
    }

    /// Table sets, one per independent component.
    pub fn tables(&self) -> &[TableSet] {
        &self.tables
    }

    /// Which tables each set samples.
    pub fn usage(&self) -> &[TableUsage] {
        &self.usage
    }

    pub fn component_mode(&self) -> ComponentMode {
        self.component_mode
    }

    /// Spans the table sets were built over.
    pub fn table_ranges(&self) -> &[TableRanges] {
        &self.table_ranges
    }

    /// Last change to the input's GPU state.
    pub fn mtime(&self) -> TimeStamp {
        self.mtime
    }

    /// True if the input has scalars to render.
    pub fn has_scalars(&self) -> bool {
        self.volume.image.scalars().is_some()
    }

    /// Brings bricks and tables up to date.
    ///
    /// Returns the number of table uploads. A volume without scalars is an
    /// error the caller treats as "nothing to render".
    pub fn update(&mut self, gpu: &mut dyn GpuBackend, frame: &InputUpdate<'_>) -> RenderResult<usize> {
        let scalars = self
            .volume
            .image
            .scalars()
            .ok_or(VolrayError::MissingScalars)?;
        let components = scalars.components();
        let mode = ComponentMode::for_array(&self.volume.property, scalars);
        if mode == ComponentMode::Invalid {
            return Err(VolrayError::InvalidComponentMode(components).into());
        }

        let filter = FilterMode::from(self.volume.property.interpolation());
        self.bricks.set_partitions(gpu, frame.partitions)?;
        if self.bricks.needs_upload(&self.volume.image) {
            self.mtime.modified();
        }
        self.bricks
            .load_volume(gpu, &self.volume.image, filter, frame.memory_budget)?;

        if mode != self.component_mode {
            self.release_tables(gpu);
            self.component_mode = mode;
            self.mtime.modified();
        }

        let ranges = self.bricks.scalar_ranges().to_vec();
        let sets = mode.table_sets(components);
        self.table_ranges = (0..sets)
            .map(|c| match mode {
                ComponentMode::Independent => TableRanges::uniform(ranges[c]),
                _ => TableRanges {
                    color: ranges[0],
                    opacity: ranges[components - 1],
                    gradient: [0.0, ranges[components - 1][1] - ranges[components - 1][0]],
                },
            })
            .collect();
        while self.tables.len() < sets {
            let prefix = self.name(&format!("c{}", self.tables.len()));
            self.tables.push(TableSet::new(&prefix));
        }
        while self.tables.len() > sets {
            if let Some(mut set) = self.tables.pop() {
                set.release(gpu);
            }
        }

        let mode_2d = self.volume.property.transfer_function_mode();
        let request = TableRequest {
            range: [0.0, 1.0],
            blend_mode: frame.options.blend_mode,
            sample_distance: frame.sample_distance,
            unit_distance: 1.0,
            filter: FilterMode::Linear,
        };
        let mut uploads = 0;
        self.usage.clear();
        for (c, set) in self.tables.iter_mut().enumerate() {
            let component = self.volume.property.component_mut(c);
            let usage = TableUsage::for_component(component, mode_2d);
            self.usage.push(usage);
            uploads += set.update(gpu, component, usage, &request, &self.table_ranges[c])?;
        }
        Ok(uploads)
    }

    /// True if shading needs gradients for this input.
    pub fn needs_gradient(&self, blend_mode: BlendMode) -> bool {
        (self.volume.property.shade() && blend_mode == BlendMode::Composite)
            || blend_mode == BlendMode::Isosurface
            || self.usage.iter().any(|u| u.gradient_opacity || u.transfer_2d)
    }

    fn release_tables(&mut self, gpu: &mut dyn GpuBackend) {
        for set in &mut self.tables {
            set.release(gpu);
        }
        self.tables.clear();
        self.usage.clear();
    }

    /// Releases every GPU resource of the input exactly once.
    pub fn release(&mut self, gpu: &mut dyn GpuBackend) {
        self.bricks.release(gpu);
        self.release_tables(gpu);
        self.component_mode = ComponentMode::Invalid;
        self.mtime.modified();
    }
}

#[derive(Debug)]
struct Slot {
    generation: u32,
    input: Option<VolumeInput>,
}

/// The inputs of a mapper in render order.
#[derive(Debug, Default)]
pub struct InputSet {
    slots: Vec<Slot>,
    order: Vec<InputId>,
    removed: Vec<VolumeInput>,
    membership_time: TimeStamp,
}

impl InputSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a volume at the end of the render order.
    pub fn add(&mut self, volume: Volume) -> InputId {
        let free = self.slots.iter().position(|s| s.input.is_none());
        #[allow(clippy::cast_possible_truncation)]
        let id = match free {
            Some(index) => {
                let slot = &mut self.slots[index];
                slot.generation += 1;
                InputId {
                    index: index as u32,
                    generation: slot.generation,
                }
            }
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    input: None,
                });
                InputId {
                    index: (self.slots.len() - 1) as u32,
                    generation: 0,
                }
            }
        };
        self.slots[id.index as usize].input = Some(VolumeInput::new(id, volume));
        self.order.push(id);
        self.membership_time.modified();
        log::debug!("added {id}");
        id
    }

    /// Withdraws an input; its GPU resources are released by [`Self::release_removed`].
    pub fn remove(&mut self, id: InputId) -> bool {
        let Some(slot) = self
            .slots
            .get_mut(id.index as usize)
            .filter(|s| s.generation == id.generation)
        else {
            return false;
        };
        let Some(input) = slot.input.take() else {
            return false;
        };
        self.order.retain(|&o| o != id);
        self.membership_time.modified();
        log::debug!("removed {id}");
        self.removed.push(input);
        true
    }

    /// Releases the GPU resources of withdrawn inputs; returns how many were released.
    pub fn release_removed(&mut self, gpu: &mut dyn GpuBackend) -> usize {
        let count = self.removed.len();
        for mut input in self.removed.drain(..) {
            input.release(gpu);
        }
        count
    }

    pub fn get(&self, id: InputId) -> Option<&VolumeInput> {
        self.slots
            .get(id.index as usize)
            .filter(|s| s.generation == id.generation)
            .and_then(|s| s.input.as_ref())
    }

    pub fn get_mut(&mut self, id: InputId) -> Option<&mut VolumeInput> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|s| s.generation == id.generation)
            .and_then(|s| s.input.as_mut())
    }

    /// Ids in render order.
    pub fn ids(&self) -> &[InputId] {
        &self.order
    }

    /// Inputs in render order.
    pub fn iter(&self) -> impl Iterator<Item = &VolumeInput> {
        self.order.iter().filter_map(|&id| self.get(id))
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Last time an input was added or removed.
    pub fn membership_time(&self) -> TimeStamp {
        self.membership_time
    }

    /// Releases the GPU resources of every input, live or withdrawn.
    pub fn release_all(&mut self, gpu: &mut dyn GpuBackend) {
        self.release_removed(gpu);
        for slot in &mut self.slots {
            if let Some(input) = slot.input.as_mut() {
                input.release(gpu);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recording::RecordingBackend;
    use volray_core::{ScalarArray, ScalarData};

    fn volume(components: usize) -> Volume {
        let mut image = ImageData::new([4, 4, 4]);
        let data = (0..64 * components).map(|i| (i % 200) as f32).collect();
        image
            .set_point_scalars(ScalarArray::new("s", components, ScalarData::F32(data)).unwrap())
            .unwrap();
        Volume::new(image, VolumeProperty::new())
    }

    fn frame(options: &MapperOptions) -> InputUpdate<'_> {
        InputUpdate {
            options,
            partitions: [1, 1, 1],
            sample_distance: 1.0,
            memory_budget: 1 << 30,
        }
    }

    #[test]
    fn test_ids_are_generation_counted() {
        let mut set = InputSet::new();
        let a = set.add(volume(1));
        let b = set.add(volume(1));
        assert!(set.remove(a));
        let c = set.add(volume(1));
        assert_ne!(a, c);
        assert_ne!(a.tag(), c.tag());
        assert!(set.get(a).is_none());
        assert!(set.get(c).is_some());
        assert_eq!(set.ids(), &[b, c]);
        assert!(!set.remove(a));
    }

    #[test]
    fn test_update_builds_tables_per_component() {
        let mut gpu = RecordingBackend::new();
        let options = MapperOptions::default();
        let mut set = InputSet::new();
        let id = set.add(volume(2));
        let input = set.get_mut(id).unwrap();
        input.update(&mut gpu, &frame(&options)).unwrap();
        assert_eq!(input.component_mode(), ComponentMode::Independent);
        assert_eq!(input.tables().len(), 2);
        assert!(input.name("scale").starts_with(&id.tag()));
        assert_eq!(input.update(&mut gpu, &frame(&options)).unwrap(), 0);
    }

    #[test]
    fn test_dependent_components() {
        let mut gpu = RecordingBackend::new();
        let options = MapperOptions::default();
        let mut v = volume(3);
        v.property.set_independent_components(false);
        let mut set = InputSet::new();
        let id = set.add(v);
        let input = set.get_mut(id).unwrap();
        assert!(input.update(&mut gpu, &frame(&options)).is_err());

        let mut v = volume(4);
        v.property.set_independent_components(false);
        let id = set.add(v);
        let input = set.get_mut(id).unwrap();
        input.update(&mut gpu, &frame(&options)).unwrap();
        assert_eq!(input.component_mode(), ComponentMode::Rgba);
        assert_eq!(input.tables().len(), 1);
    }

    #[test]
    fn test_removed_input_released_once() {
        let mut gpu = RecordingBackend::new();
        let options = MapperOptions::default();
        let mut set = InputSet::new();
        let id = set.add(volume(1));
        set.get_mut(id).unwrap().update(&mut gpu, &frame(&options)).unwrap();
        assert!(gpu.live_textures() > 0);
        set.remove(id);
        assert_eq!(set.release_removed(&mut gpu), 1);
        assert_eq!(set.release_removed(&mut gpu), 0);
        assert_eq!(gpu.live_textures(), 0);
    }

    #[test]
    fn test_missing_scalars_is_an_error() {
        let mut gpu = RecordingBackend::new();
        let options = MapperOptions::default();
        let mut set = InputSet::new();
        let id = set.add(Volume::new(ImageData::new([2, 2, 2]), VolumeProperty::new()));
        let input = set.get_mut(id).unwrap();
        assert!(!input.has_scalars());
        assert!(input.update(&mut gpu, &frame(&options)).is_err());
    }
}
