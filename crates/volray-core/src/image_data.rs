//! Regular-grid volume data.

use std::sync::atomic::{AtomicU64, Ordering};

use glam::{DMat3, DMat4, DVec3};

use crate::error::{Result, VolrayError};
use crate::timestamp::TimeStamp;

static NEXT_ARRAY_ID: AtomicU64 = AtomicU64::new(1);

/// Typed storage of a scalar array.
#[derive(Debug, Clone, PartialEq)]
pub enum ScalarData {
    U8(Vec<u8>),
    I8(Vec<i8>),
    U16(Vec<u16>),
    I16(Vec<i16>),
    U32(Vec<u32>),
    I32(Vec<i32>),
    F32(Vec<f32>),
    F64(Vec<f64>),
}

impl ScalarData {
    /// Number of values (tuples times components).
    pub fn len(&self) -> usize {
        match self {
            ScalarData::U8(v) => v.len(),
            ScalarData::I8(v) => v.len(),
            ScalarData::U16(v) => v.len(),
            ScalarData::I16(v) => v.len(),
            ScalarData::U32(v) => v.len(),
            ScalarData::I32(v) => v.len(),
            ScalarData::F32(v) => v.len(),
            ScalarData::F64(v) => v.len(),
        }
    }

    /// True if there are no values.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Value at flat index `i`, widened to f64.
    pub fn get(&self, i: usize) -> f64 {
        match self {
            ScalarData::U8(v) => f64::from(v[i]),
            ScalarData::I8(v) => f64::from(v[i]),
            ScalarData::U16(v) => f64::from(v[i]),
            ScalarData::I16(v) => f64::from(v[i]),
            ScalarData::U32(v) => f64::from(v[i]),
            ScalarData::I32(v) => f64::from(v[i]),
            ScalarData::F32(v) => f64::from(v[i]),
            ScalarData::F64(v) => v[i],
        }
    }

    /// Name of the element type.
    pub fn type_name(&self) -> &'static str {
        match self {
            ScalarData::U8(_) => "u8",
            ScalarData::I8(_) => "i8",
            ScalarData::U16(_) => "u16",
            ScalarData::I16(_) => "i16",
            ScalarData::U32(_) => "u32",
            ScalarData::I32(_) => "i32",
            ScalarData::F32(_) => "f32",
            ScalarData::F64(_) => "f64",
        }
    }
}

/// A named array of scalar tuples with 1..=4 components.
#[derive(Debug, Clone)]
pub struct ScalarArray {
    name: String,
    components: usize,
    data: ScalarData,
    id: u64,
    mtime: TimeStamp,
}

impl ScalarArray {
    /// Creates an array; `data.len()` must be a multiple of `components`.
    pub fn new(name: impl Into<String>, components: usize, data: ScalarData) -> Result<Self> {
        if components == 0 {
            return Err(VolrayError::UnsupportedComponents(0));
        }
        if data.len() % components != 0 {
            return Err(VolrayError::SizeMismatch {
                expected: data.len().next_multiple_of(components),
                actual: data.len(),
            });
        }
        Ok(Self {
            name: name.into(),
            components,
            data,
            id: NEXT_ARRAY_ID.fetch_add(1, Ordering::Relaxed),
            mtime: TimeStamp::now(),
        })
    }

    /// Array name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Components per tuple.
    pub fn components(&self) -> usize {
        self.components
    }

    /// Number of tuples.
    pub fn tuples(&self) -> usize {
        self.data.len() / self.components
    }

    /// Raw storage.
    pub fn data(&self) -> &ScalarData {
        &self.data
    }

    /// Mutable storage; marks the array modified.
    pub fn data_mut(&mut self) -> &mut ScalarData {
        self.mtime.modified();
        &mut self.data
    }

    /// Identity of this array, distinct for every constructed array.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Last modification.
    pub fn mtime(&self) -> TimeStamp {
        self.mtime
    }

    /// Component `c` of tuple `t`.
    pub fn value(&self, tuple: usize, component: usize) -> f64 {
        self.data.get(tuple * self.components + component)
    }

    /// `[min, max]` of one component; `[0, 0]` for an empty array.
    pub fn component_range(&self, component: usize) -> [f64; 2] {
        let mut range = [f64::INFINITY, f64::NEG_INFINITY];
        for t in 0..self.tuples() {
            let v = self.value(t, component);
            if v.is_finite() {
                range[0] = range[0].min(v);
                range[1] = range[1].max(v);
            }
        }
        if range[0] > range[1] {
            [0.0, 0.0]
        } else {
            range
        }
    }
}

/// Whether scalars live on grid points or cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Association {
    #[default]
    Points,
    Cells,
}

/// A volume on a regular grid, optionally oriented by a direction matrix.
#[derive(Debug, Clone)]
pub struct ImageData {
    extent: [i32; 6],
    origin: DVec3,
    spacing: DVec3,
    direction: DMat3,
    scalars: Option<ScalarArray>,
    association: Association,
    mtime: TimeStamp,
}

impl ImageData {
    /// Creates a grid of `dims` points with unit spacing at the origin.
    #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
    pub fn new(dims: [usize; 3]) -> Self {
        let last = |n: usize| n.max(1) as i32 - 1;
        Self {
            extent: [0, last(dims[0]), 0, last(dims[1]), 0, last(dims[2])],
            origin: DVec3::ZERO,
            spacing: DVec3::ONE,
            direction: DMat3::IDENTITY,
            scalars: None,
            association: Association::Points,
            mtime: TimeStamp::now(),
        }
    }

    /// Creates a grid from an explicit point extent.
    pub fn with_extent(extent: [i32; 6]) -> Result<Self> {
        if (0..3).any(|a| extent[2 * a + 1] < extent[2 * a]) {
            return Err(VolrayError::InvalidExtent(extent));
        }
        Ok(Self {
            extent,
            ..Self::new([1, 1, 1])
        })
    }

    /// Sets the grid spacing.
    #[must_use]
    pub fn with_spacing(mut self, spacing: DVec3) -> Self {
        self.spacing = spacing;
        self.mtime.modified();
        self
    }

    /// Sets the grid origin.
    #[must_use]
    pub fn with_origin(mut self, origin: DVec3) -> Self {
        self.origin = origin;
        self.mtime.modified();
        self
    }

    /// Sets the direction matrix.
    #[must_use]
    pub fn with_direction(mut self, direction: DMat3) -> Self {
        self.direction = direction;
        self.mtime.modified();
        self
    }

    /// Attaches point scalars; one tuple per grid point.
    pub fn set_point_scalars(&mut self, scalars: ScalarArray) -> Result<()> {
        self.check_tuples(scalars.tuples(), self.num_points())?;
        self.scalars = Some(scalars);
        self.association = Association::Points;
        self.mtime.modified();
        Ok(())
    }

    /// Attaches cell scalars; one tuple per grid cell.
    pub fn set_cell_scalars(&mut self, scalars: ScalarArray) -> Result<()> {
        self.check_tuples(scalars.tuples(), self.num_cells())?;
        self.scalars = Some(scalars);
        self.association = Association::Cells;
        self.mtime.modified();
        Ok(())
    }

    /// Detaches the scalars.
    pub fn clear_scalars(&mut self) {
        self.scalars = None;
        self.mtime.modified();
    }

    fn check_tuples(&self, actual: usize, expected: usize) -> Result<()> {
        if actual == expected {
            Ok(())
        } else {
            Err(VolrayError::SizeMismatch { expected, actual })
        }
    }

    /// Point extent `[x0, x1, y0, y1, z0, z1]`, inclusive.
    pub fn extent(&self) -> [i32; 6] {
        self.extent
    }

    /// Grid origin.
    pub fn origin(&self) -> DVec3 {
        self.origin
    }

    /// Grid spacing.
    pub fn spacing(&self) -> DVec3 {
        self.spacing
    }

    /// Direction matrix.
    pub fn direction(&self) -> DMat3 {
        self.direction
    }

    /// Points per axis.
    #[allow(clippy::cast_sign_loss)]
    pub fn dimensions(&self) -> [usize; 3] {
        [0, 1, 2].map(|a| (self.extent[2 * a + 1] - self.extent[2 * a] + 1) as usize)
    }

    /// Cells per axis; flat axes count as one cell.
    pub fn cell_dimensions(&self) -> [usize; 3] {
        self.dimensions().map(|d| d.saturating_sub(1).max(1))
    }

    /// Voxels per axis of the attached scalars.
    pub fn scalar_dimensions(&self) -> [usize; 3] {
        match self.association {
            Association::Points => self.dimensions(),
            Association::Cells => self.cell_dimensions(),
        }
    }

    /// Total number of points.
    pub fn num_points(&self) -> usize {
        self.dimensions().iter().product()
    }

    /// Total number of cells.
    pub fn num_cells(&self) -> usize {
        self.cell_dimensions().iter().product()
    }

    /// Attached scalars, if any.
    pub fn scalars(&self) -> Option<&ScalarArray> {
        self.scalars.as_ref()
    }

    /// Mutable scalars; marks the array (not the grid) modified on write.
    pub fn scalars_mut(&mut self) -> Option<&mut ScalarArray> {
        self.scalars.as_mut()
    }

    /// Point or cell association of the scalars.
    pub fn association(&self) -> Association {
        self.association
    }

    /// True if the scalars are cell-centered.
    pub fn is_cell_data(&self) -> bool {
        self.association == Association::Cells
    }

    /// Last modification of the grid geometry or scalar attachment.
    pub fn mtime(&self) -> TimeStamp {
        self.mtime
    }

    /// Maps a continuous point index (relative to extent minimum 0) to dataset coordinates.
    pub fn index_to_physical(&self, ijk: DVec3) -> DVec3 {
        let base = DVec3::new(
            f64::from(self.extent[0]),
            f64::from(self.extent[2]),
            f64::from(self.extent[4]),
        );
        self.origin + self.direction * ((base + ijk) * self.spacing)
    }

    /// Affine map from point index space to dataset coordinates.
    pub fn index_to_physical_matrix(&self) -> DMat4 {
        let base = DVec3::new(
            f64::from(self.extent[0]),
            f64::from(self.extent[2]),
            f64::from(self.extent[4]),
        );
        DMat4::from_translation(self.origin)
            * DMat4::from_mat3(self.direction)
            * DMat4::from_scale(self.spacing)
            * DMat4::from_translation(base)
    }

    /// Axis-aligned bounds of the grid in dataset coordinates.
    #[allow(clippy::cast_precision_loss)]
    pub fn bounds(&self) -> [f64; 6] {
        let dims = self.dimensions();
        let hi = DVec3::new(
            (dims[0] - 1) as f64,
            (dims[1] - 1) as f64,
            (dims[2] - 1) as f64,
        );
        let mut lo_pt = DVec3::splat(f64::INFINITY);
        let mut hi_pt = DVec3::splat(f64::NEG_INFINITY);
        for corner in 0..8 {
            let ijk = DVec3::new(
                if corner & 1 == 0 { 0.0 } else { hi.x },
                if corner & 2 == 0 { 0.0 } else { hi.y },
                if corner & 4 == 0 { 0.0 } else { hi.z },
            );
            let p = self.index_to_physical(ijk);
            lo_pt = lo_pt.min(p);
            hi_pt = hi_pt.max(p);
        }
        [lo_pt.x, hi_pt.x, lo_pt.y, hi_pt.y, lo_pt.z, hi_pt.z]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp_volume(n: usize) -> ImageData {
        let mut image = ImageData::new([n, n, n]);
        let values: Vec<u8> = (0..n * n * n).map(|i| (i % 256) as u8).collect();
        image
            .set_point_scalars(ScalarArray::new("ramp", 1, ScalarData::U8(values)).unwrap())
            .unwrap();
        image
    }

    #[test]
    fn test_dimensions_and_bounds() {
        let image = ImageData::new([4, 5, 6]).with_spacing(DVec3::new(0.5, 1.0, 2.0));
        assert_eq!(image.dimensions(), [4, 5, 6]);
        assert_eq!(image.cell_dimensions(), [3, 4, 5]);
        assert_eq!(image.bounds(), [0.0, 1.5, 0.0, 4.0, 0.0, 10.0]);
    }

    #[test]
    fn test_scalar_size_checked() {
        let mut image = ImageData::new([2, 2, 2]);
        let wrong = ScalarArray::new("s", 1, ScalarData::F32(vec![0.0; 7])).unwrap();
        assert!(image.set_point_scalars(wrong).is_err());
        let cells = ScalarArray::new("s", 1, ScalarData::F32(vec![0.0; 1])).unwrap();
        assert!(image.set_cell_scalars(cells).is_ok());
        assert!(image.is_cell_data());
        assert_eq!(image.scalar_dimensions(), [1, 1, 1]);
    }

    #[test]
    fn test_component_range() {
        let image = ramp_volume(4);
        assert_eq!(image.scalars().unwrap().component_range(0), [0.0, 63.0]);
    }

    #[test]
    fn test_array_ids_are_distinct() {
        let a = ScalarArray::new("a", 1, ScalarData::U8(vec![1])).unwrap();
        let b = a.clone();
        let c = ScalarArray::new("a", 1, ScalarData::U8(vec![1])).unwrap();
        assert_eq!(a.id(), b.id());
        assert_ne!(a.id(), c.id());
    }

    #[test]
    fn test_index_to_physical_matrix_matches_pointwise() {
        let image = ImageData::with_extent([2, 5, 0, 3, 1, 4])
            .unwrap()
            .with_origin(DVec3::new(1.0, -2.0, 0.5))
            .with_spacing(DVec3::new(0.5, 2.0, 1.0));
        let ijk = DVec3::new(1.0, 2.0, 3.0);
        let a = image.index_to_physical(ijk);
        let b = image.index_to_physical_matrix().transform_point3(ijk);
        assert!((a - b).length() < 1e-12);
    }
}
