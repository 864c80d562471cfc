//! GPU-resident bricks of a volume.
//!
//! A [`BrickStore`] splits a scalar field into the configured grid of bricks,
//! uploads each brick as a 3D half-float texture and hands them out in
//! back-to-front order for the current camera.

use glam::{DMat4, DVec3};
use half::f16;
use volray_core::geometry::box_corners;
use volray_core::partition::{split_extent, BrickExtent};
use volray_core::transfer_function::sanitize_range;
use volray_core::{Camera, ImageData, ScalarArray, TimeStamp, VolrayError, MAX_COMPONENTS};

use crate::error::{RenderError, RenderResult};
use crate::gpu::{
    FilterMode, GpuBackend, TexelData, TexelFormat, TextureDesc, TextureDimension, TextureHandle,
};

/// One brick of a partitioned volume.
#[derive(Debug, Clone)]
pub struct VolumeBlock {
    pub extent: BrickExtent,
    pub texture: Option<TextureHandle>,
    /// Normalized texture coordinates to dataset coordinates.
    pub texture_to_dataset: DMat4,
    pub dataset_to_texture: DMat4,
    /// Texture-space distance between neighbouring voxels.
    pub cell_step: DVec3,
    /// Rendered region in texture coordinates, lower and upper corner.
    pub texture_bounds: [DVec3; 2],
    /// Corners of the rendered region in dataset coordinates.
    pub corners: [DVec3; 8],
}

impl VolumeBlock {
    /// Corners transformed by the volume's model matrix.
    pub fn world_corners(&self, matrix: &DMat4) -> [DVec3; 8] {
        self.corners.map(|c| matrix.transform_point3(c))
    }

    /// Center of the rendered region in world coordinates.
    pub fn world_center(&self, matrix: &DMat4) -> DVec3 {
        self.world_corners(matrix).iter().copied().sum::<DVec3>() / 8.0
    }
}

/// Signature of the data a store was built from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SourceKey {
    array_id: u64,
    array_mtime: TimeStamp,
    image_mtime: TimeStamp,
}

/// Partitions, uploads and orders the bricks of one volume.
#[derive(Debug)]
pub struct BrickStore {
    label: String,
    partitions: [u16; 3],
    blocks: Vec<VolumeBlock>,
    order: Vec<usize>,
    cursor: Option<usize>,
    source: Option<SourceKey>,
    format: TexelFormat,
    components: usize,
    scale: [f32; 4],
    bias: [f32; 4],
    ranges: Vec<[f64; 2]>,
    filter: FilterMode,
    dims: [usize; 3],
    cell_data: bool,
    bounds: [f64; 6],
    upload_time: TimeStamp,
}

impl BrickStore {
    /// Creates an empty store; `label` names its textures.
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            partitions: [1, 1, 1],
            blocks: Vec::new(),
            order: Vec::new(),
            cursor: None,
            source: None,
            format: TexelFormat::R16Float,
            components: 0,
            scale: [1.0; 4],
            bias: [0.0; 4],
            ranges: Vec::new(),
            filter: FilterMode::Linear,
            dims: [0; 3],
            cell_data: false,
            bounds: [0.0; 6],
            upload_time: TimeStamp::default(),
        }
    }

    /// Declares the brick grid; a change releases every brick.
    pub fn set_partitions(
        &mut self,
        gpu: &mut dyn GpuBackend,
        partitions: [u16; 3],
    ) -> RenderResult<()> {
        if partitions.contains(&0) {
            return Err(VolrayError::InvalidPartitions(partitions).into());
        }
        if partitions != self.partitions {
            log::info!(
                "{}: repartitioning {:?} -> {:?}",
                self.label,
                self.partitions,
                partitions
            );
            self.partitions = partitions;
            self.release(gpu);
        }
        Ok(())
    }

    /// Current brick grid.
    pub fn partitions(&self) -> [u16; 3] {
        self.partitions
    }

    /// True if `image` differs from what is on the GPU.
    pub fn needs_upload(&self, image: &ImageData) -> bool {
        match (image.scalars(), self.source) {
            (Some(scalars), Some(source)) => {
                source != Self::source_key(image, scalars) || self.blocks.is_empty()
            }
            _ => true,
        }
    }

    fn source_key(image: &ImageData, scalars: &ScalarArray) -> SourceKey {
        SourceKey {
            array_id: scalars.id(),
            array_mtime: scalars.mtime(),
            image_mtime: image.mtime(),
        }
    }

    /// Makes the GPU bricks match `image`.
    ///
    /// Bricks are rebuilt when the partitions, the grid or the scalars changed;
    /// a filter change alone only updates the samplers. On failure every brick
    /// is released, so the next call retries from scratch.
    pub fn load_volume(
        &mut self,
        gpu: &mut dyn GpuBackend,
        image: &ImageData,
        filter: FilterMode,
        memory_budget: u64,
    ) -> RenderResult<()> {
        let scalars = image.scalars().ok_or(VolrayError::MissingScalars)?;
        let components = scalars.components();
        if !(1..=MAX_COMPONENTS).contains(&components) {
            return Err(VolrayError::UnsupportedComponents(components).into());
        }

        if !self.needs_upload(image) {
            if filter != self.filter {
                for texture in self.blocks.iter().filter_map(|b| b.texture) {
                    gpu.set_texture_filter(texture, filter)?;
                }
                self.filter = filter;
            }
            return Ok(());
        }

        let cell_data = image.is_cell_data();
        let dims = image.scalar_dimensions();
        let extents = split_extent(dims, self.partitions, cell_data)?;
        let format = TexelFormat::half_float_for(components);
        self.check_limits(gpu, &extents, format, memory_budget)?;

        let reuse = self.source.is_some()
            && self.dims == dims
            && self.format == format
            && self.cell_data == cell_data
            && self.blocks.len() == extents.len()
            && self.blocks.iter().all(|b| b.texture.is_some());
        if !reuse {
            self.release(gpu);
        }

        let ranges: Vec<[f64; 2]> = (0..components)
            .map(|c| sanitize_range(scalars.component_range(c)))
            .collect();
        let index_to_dataset = image.index_to_physical_matrix();

        let result = self.upload_bricks(
            gpu,
            scalars,
            &extents,
            &ranges,
            &index_to_dataset,
            UploadLayout {
                dims,
                format,
                filter,
                cell_data,
                reuse,
            },
        );
        if let Err(err) = result {
            self.release(gpu);
            return Err(err);
        }

        self.components = components;
        self.ranges = ranges;
        for c in 0..MAX_COMPONENTS {
            #[allow(clippy::cast_possible_truncation)]
            if let Some(range) = self.ranges.get(c) {
                self.scale[c] = (range[1] - range[0]) as f32;
                self.bias[c] = range[0] as f32;
            } else {
                self.scale[c] = 1.0;
                self.bias[c] = 0.0;
            }
        }
        self.format = format;
        self.filter = filter;
        self.dims = dims;
        self.cell_data = cell_data;
        self.bounds = image.bounds();
        self.source = Some(Self::source_key(image, scalars));
        self.order = (0..self.blocks.len()).collect();
        self.cursor = None;
        self.upload_time.modified();
        log::debug!(
            "{}: uploaded {} brick(s) of {dims:?} {} voxels",
            self.label,
            self.blocks.len(),
            scalars.data().type_name()
        );
        Ok(())
    }

    fn check_limits(
        &self,
        gpu: &dyn GpuBackend,
        extents: &[BrickExtent],
        format: TexelFormat,
        budget: u64,
    ) -> RenderResult<()> {
        let max_dimension = gpu.limits().max_texture_dimension_3d;
        for extent in extents {
            let dims = extent.texture_dims();
            let bytes = extent.texture_voxels() as u64 * u64::from(format.bytes_per_texel());
            let too_wide = dims.iter().any(|&d| d > max_dimension as usize);
            if too_wide || bytes > budget {
                return Err(RenderError::TextureTooLarge {
                    dims,
                    bytes,
                    max_dimension,
                    budget,
                });
            }
        }
        Ok(())
    }

    fn upload_bricks(
        &mut self,
        gpu: &mut dyn GpuBackend,
        scalars: &ScalarArray,
        extents: &[BrickExtent],
        ranges: &[[f64; 2]],
        index_to_dataset: &DMat4,
        layout: UploadLayout,
    ) -> RenderResult<()> {
        let mut blocks = Vec::with_capacity(extents.len());
        for (i, extent) in extents.iter().enumerate() {
            let tex_dims = extent.texture_dims();
            #[allow(clippy::cast_possible_truncation)]
            let size = tex_dims.map(|d| d as u32);
            let texture = if layout.reuse {
                self.blocks[i].texture
            } else {
                None
            };
            let texture = match texture {
                Some(texture) => texture,
                None => {
                    let texture = gpu.create_texture(&TextureDesc {
                        label: &self.label,
                        dimension: TextureDimension::D3,
                        size,
                        format: layout.format,
                        filter: layout.filter,
                    })?;
                    // Track immediately so a later failure releases it.
                    self.blocks.push(placeholder_block(extent.clone(), texture));
                    texture
                }
            };
            let texels = brick_texels(scalars, layout.dims, extent, ranges, layout.format);
            gpu.write_texture(texture, [0; 3], size, TexelData::F16(&texels))?;
            if layout.reuse && layout.filter != self.filter {
                gpu.set_texture_filter(texture, layout.filter)?;
            }
            blocks.push(build_block(
                extent.clone(),
                texture,
                index_to_dataset,
                layout.cell_data,
            ));
        }
        self.blocks = blocks;
        Ok(())
    }

    /// Orders bricks from farthest to nearest along the view direction.
    ///
    /// The sort is stable, so equidistant bricks keep their grid order. Resets
    /// the block cursor.
    pub fn sort_blocks_back_to_front(&mut self, camera: &Camera, volume_matrix: &DMat4) {
        self.order = (0..self.blocks.len()).collect();
        self.cursor = None;
        if self.blocks.len() <= 1 {
            return;
        }
        let eye = camera.position;
        let direction = camera.direction_of_projection();
        let depth: Vec<f64> = self
            .blocks
            .iter()
            .map(|b| (b.world_center(volume_matrix) - eye).dot(direction))
            .collect();
        self.order.sort_by(|&a, &b| depth[b].total_cmp(&depth[a]));
    }

    /// Visitation order produced by the last sort.
    pub fn order(&self) -> &[usize] {
        &self.order
    }

    /// The block at the cursor, or the first block before iteration starts.
    pub fn current_block(&self) -> Option<&VolumeBlock> {
        let slot = self.cursor.unwrap_or(0);
        self.order.get(slot).map(|&i| &self.blocks[i])
    }

    /// Advances to the next block; `None` once every block was visited.
    pub fn next_block(&mut self) -> Option<&VolumeBlock> {
        let slot = self.cursor.map_or(0, |c| c + 1).min(self.order.len());
        self.cursor = Some(slot);
        self.order.get(slot).map(|&i| &self.blocks[i])
    }

    /// Rewinds the cursor to before the first block.
    pub fn reset(&mut self) {
        self.cursor = None;
    }

    /// Bricks in grid order.
    pub fn blocks(&self) -> &[VolumeBlock] {
        &self.blocks
    }

    /// Number of bricks on the GPU.
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    /// True if nothing is loaded.
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Maps normalized texel values back to data values, per component.
    pub fn scale_bias(&self) -> ([f32; 4], [f32; 4]) {
        (self.scale, self.bias)
    }

    /// Scalar range of each loaded component.
    pub fn scalar_ranges(&self) -> &[[f64; 2]] {
        &self.ranges
    }

    /// Components per voxel of the loaded data.
    pub fn components(&self) -> usize {
        self.components
    }

    /// Voxels per axis of the loaded data.
    pub fn dims(&self) -> [usize; 3] {
        self.dims
    }

    /// True if the loaded data is cell-centered.
    pub fn is_cell_data(&self) -> bool {
        self.cell_data
    }

    /// Dataset bounds of the loaded grid.
    pub fn bounds(&self) -> [f64; 6] {
        self.bounds
    }

    /// When the bricks were last uploaded.
    pub fn upload_time(&self) -> TimeStamp {
        self.upload_time
    }

    /// Releases every brick texture exactly once and forgets the source.
    pub fn release(&mut self, gpu: &mut dyn GpuBackend) {
        for block in &mut self.blocks {
            if let Some(texture) = block.texture.take() {
                gpu.release_texture(texture);
            }
        }
        self.blocks.clear();
        self.order.clear();
        self.cursor = None;
        self.source = None;
    }
}

#[derive(Debug, Clone, Copy)]
struct UploadLayout {
    dims: [usize; 3],
    format: TexelFormat,
    filter: FilterMode,
    cell_data: bool,
    reuse: bool,
}

fn placeholder_block(extent: BrickExtent, texture: TextureHandle) -> VolumeBlock {
    VolumeBlock {
        extent,
        texture: Some(texture),
        texture_to_dataset: DMat4::IDENTITY,
        dataset_to_texture: DMat4::IDENTITY,
        cell_step: DVec3::ZERO,
        texture_bounds: [DVec3::ZERO, DVec3::ONE],
        corners: [DVec3::ZERO; 8],
    }
}

fn build_block(
    extent: BrickExtent,
    texture: TextureHandle,
    index_to_dataset: &DMat4,
    cell_data: bool,
) -> VolumeBlock {
    let texture_to_index = extent.texture_to_index(cell_data);
    let index_to_texture = texture_to_index.inverse();
    let texture_to_dataset = *index_to_dataset * texture_to_index;
    let g = extent.geometry;
    let lo = index_to_texture.transform_point3(DVec3::new(g[0], g[2], g[4]));
    let hi = index_to_texture.transform_point3(DVec3::new(g[1], g[3], g[5]));
    let corners = box_corners(g).map(|c| index_to_dataset.transform_point3(c));
    VolumeBlock {
        cell_step: extent.cell_step(),
        extent,
        texture: Some(texture),
        texture_to_dataset,
        dataset_to_texture: texture_to_dataset.inverse(),
        texture_bounds: [lo.min(hi), lo.max(hi)],
        corners,
    }
}

/// Texels of one brick, normalized per component into `[0, 1]`.
fn brick_texels(
    scalars: &ScalarArray,
    dims: [usize; 3],
    extent: &BrickExtent,
    ranges: &[[f64; 2]],
    format: TexelFormat,
) -> Vec<f16> {
    let channels = format.channels() as usize;
    let components = scalars.components();
    let t = extent.texture;
    let mut texels = Vec::with_capacity(extent.texture_voxels() * channels);
    for z in t[4]..=t[5] {
        for y in t[2]..=t[3] {
            for x in t[0]..=t[1] {
                let tuple = x + dims[0] * (y + dims[1] * z);
                for c in 0..channels {
                    if c < components {
                        let [lo, hi] = ranges[c];
                        let v = (scalars.value(tuple, c) - lo) / (hi - lo);
                        texels.push(f16::from_f64(v.clamp(0.0, 1.0)));
                    } else {
                        texels.push(f16::ZERO);
                    }
                }
            }
        }
    }
    texels
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::DeviceLimits;
    use crate::recording::RecordingBackend;
    use proptest::prelude::*;
    use volray_core::ScalarData;

    fn volume(n: usize) -> ImageData {
        let mut image = ImageData::new([n, n, n]);
        #[allow(clippy::cast_possible_truncation)]
        let values: Vec<u16> = (0..n * n * n).map(|i| (i % 1000) as u16).collect();
        image
            .set_point_scalars(ScalarArray::new("s", 1, ScalarData::U16(values)).unwrap())
            .unwrap();
        image
    }

    const BUDGET: u64 = 1 << 30;

    #[test]
    fn test_single_brick_upload() {
        let mut gpu = RecordingBackend::new();
        let mut store = BrickStore::new("vol");
        store
            .load_volume(&mut gpu, &volume(16), FilterMode::Linear, BUDGET)
            .unwrap();
        assert_eq!(store.len(), 1);
        let texture = store.blocks()[0].texture.unwrap();
        let recorded = gpu.texture(texture).unwrap();
        assert_eq!(recorded.size, [16, 16, 16]);
        assert_eq!(recorded.format, TexelFormat::R16Float);
        assert_eq!(store.scale_bias().0[0], 999.0);
    }

    #[test]
    fn test_unchanged_volume_not_reuploaded() {
        let mut gpu = RecordingBackend::new();
        let mut store = BrickStore::new("vol");
        let image = volume(8);
        store.load_volume(&mut gpu, &image, FilterMode::Linear, BUDGET).unwrap();
        let uploads = gpu.stats().texture_uploads;
        store.load_volume(&mut gpu, &image, FilterMode::Nearest, BUDGET).unwrap();
        assert_eq!(gpu.stats().texture_uploads, uploads);
        let texture = store.blocks()[0].texture.unwrap();
        assert_eq!(gpu.texture(texture).unwrap().filter, FilterMode::Nearest);
    }

    #[test]
    fn test_modified_values_reuse_textures() {
        let mut gpu = RecordingBackend::new();
        let mut store = BrickStore::new("vol");
        let mut image = volume(8);
        store.load_volume(&mut gpu, &image, FilterMode::Linear, BUDGET).unwrap();
        let created = gpu.stats().textures_created;
        if let Some(scalars) = image.scalars_mut() {
            if let ScalarData::U16(v) = scalars.data_mut() {
                v[0] = 7;
            }
        }
        store.load_volume(&mut gpu, &image, FilterMode::Linear, BUDGET).unwrap();
        assert_eq!(gpu.stats().textures_created, created);
        assert_eq!(gpu.stats().texture_uploads, 2);
    }

    #[test]
    fn test_repartition_releases_and_resplits() {
        let mut gpu = RecordingBackend::new();
        let mut store = BrickStore::new("vol");
        let image = volume(8);
        store.load_volume(&mut gpu, &image, FilterMode::Linear, BUDGET).unwrap();
        store.set_partitions(&mut gpu, [2, 2, 2]).unwrap();
        assert!(store.is_empty());
        assert_eq!(gpu.live_textures(), 0);
        store.load_volume(&mut gpu, &image, FilterMode::Linear, BUDGET).unwrap();
        assert_eq!(store.len(), 8);
        assert_eq!(gpu.live_textures(), 8);
        assert!(store.set_partitions(&mut gpu, [0, 1, 1]).is_err());
    }

    #[test]
    fn test_texture_too_large_is_reported() {
        let mut gpu = RecordingBackend::new().with_limits(DeviceLimits {
            max_texture_dimension_3d: 8,
            ..DeviceLimits::default()
        });
        let mut store = BrickStore::new("vol");
        let image = volume(16);
        let err = store
            .load_volume(&mut gpu, &image, FilterMode::Linear, BUDGET)
            .unwrap_err();
        assert!(matches!(err, RenderError::TextureTooLarge { .. }));
        assert!(store.needs_upload(&image));

        store.set_partitions(&mut gpu, [2, 2, 2]).unwrap();
        assert!(store
            .load_volume(&mut gpu, &image, FilterMode::Linear, BUDGET)
            .is_err());
        store.set_partitions(&mut gpu, [3, 3, 3]).unwrap();
        store.load_volume(&mut gpu, &image, FilterMode::Linear, BUDGET).unwrap();
        assert_eq!(store.len(), 27);
    }

    #[test]
    fn test_failed_allocation_releases_partial_upload() {
        let brick_bytes = 9 * 9 * 9 * 2;
        let mut gpu = RecordingBackend::new().with_texture_budget(brick_bytes * 3);
        let mut store = BrickStore::new("vol");
        store.set_partitions(&mut gpu, [2, 2, 2]).unwrap();
        let image = volume(16);
        let err = store
            .load_volume(&mut gpu, &image, FilterMode::Linear, BUDGET)
            .unwrap_err();
        assert!(matches!(err, RenderError::OutOfMemory(_)));
        assert_eq!(gpu.live_textures(), 0);
        assert!(store.is_empty());
    }

    #[test]
    fn test_missing_scalars() {
        let mut gpu = RecordingBackend::new();
        let mut store = BrickStore::new("vol");
        let err = store
            .load_volume(&mut gpu, &ImageData::new([4, 4, 4]), FilterMode::Linear, BUDGET)
            .unwrap_err();
        assert!(matches!(err, RenderError::Core(VolrayError::MissingScalars)));
    }

    #[test]
    fn test_block_iteration() {
        let mut gpu = RecordingBackend::new();
        let mut store = BrickStore::new("vol");
        store.set_partitions(&mut gpu, [2, 1, 1]).unwrap();
        store.load_volume(&mut gpu, &volume(8), FilterMode::Linear, BUDGET).unwrap();
        assert!(store.current_block().is_some());
        assert!(store.next_block().is_some());
        assert!(store.next_block().is_some());
        assert!(store.next_block().is_none());
        assert!(store.next_block().is_none());
        store.reset();
        assert!(store.next_block().is_some());
    }

    #[test]
    fn test_sort_back_to_front_along_view() {
        let mut gpu = RecordingBackend::new();
        let mut store = BrickStore::new("vol");
        store.set_partitions(&mut gpu, [1, 1, 4]).unwrap();
        store.load_volume(&mut gpu, &volume(16), FilterMode::Linear, BUDGET).unwrap();

        let mut camera = Camera::new(1.0);
        camera.position = DVec3::new(7.5, 7.5, 100.0);
        camera.focal_point = DVec3::new(7.5, 7.5, 7.5);
        store.sort_blocks_back_to_front(&camera, &DMat4::IDENTITY);
        assert_eq!(store.order(), &[0, 1, 2, 3]);

        camera.position.z = -100.0;
        store.sort_blocks_back_to_front(&camera, &DMat4::IDENTITY);
        assert_eq!(store.order(), &[3, 2, 1, 0]);

        let mirror = DMat4::from_scale(DVec3::new(1.0, 1.0, -1.0));
        store.sort_blocks_back_to_front(&camera, &mirror);
        assert_eq!(store.order(), &[0, 1, 2, 3]);
    }

    proptest! {
        #[test]
        fn prop_sort_is_stable_permutation(
            px in 1_u16..=3, py in 1_u16..=3, pz in 1_u16..=3,
            x in -40_i32..40, y in -40_i32..40, z in -40_i32..40,
        ) {
            let mut gpu = RecordingBackend::new();
            let mut store = BrickStore::new("vol");
            store.set_partitions(&mut gpu, [px, py, pz]).unwrap();
            store.load_volume(&mut gpu, &volume(12), FilterMode::Linear, BUDGET).unwrap();

            // Integer positions on the grid axes give many equidistant bricks
            let mut camera = Camera::new(1.0);
            camera.position = DVec3::new(f64::from(x), f64::from(y), f64::from(z));
            camera.focal_point = DVec3::splat(5.5);
            store.sort_blocks_back_to_front(&camera, &DMat4::IDENTITY);
            let first = store.order().to_vec();
            store.sort_blocks_back_to_front(&camera, &DMat4::IDENTITY);
            prop_assert_eq!(store.order(), first.as_slice());

            let mut sorted = first;
            sorted.sort_unstable();
            prop_assert_eq!(sorted, (0..store.len()).collect::<Vec<_>>());
        }
    }

    #[test]
    fn test_cell_data_block_transform() {
        let mut gpu = RecordingBackend::new();
        let mut image = ImageData::new([5, 5, 5]);
        image
            .set_cell_scalars(ScalarArray::new("c", 1, ScalarData::F32(vec![1.0; 64])).unwrap())
            .unwrap();
        let mut store = BrickStore::new("cells");
        store.load_volume(&mut gpu, &image, FilterMode::Linear, BUDGET).unwrap();
        let block = &store.blocks()[0];
        // First texel center maps to the first cell center.
        let p = block.texture_to_dataset.transform_point3(DVec3::splat(0.125));
        assert!((p - DVec3::splat(0.5)).length() < 1e-12);
        assert!((block.texture_bounds[0] - DVec3::ZERO).length() < 1e-12);
        assert!((block.texture_bounds[1] - DVec3::ONE).length() < 1e-12);
    }
}
