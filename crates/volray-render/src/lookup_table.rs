//! Transfer-function lookup tables on the GPU.
//!
//! Sampling a transfer function and uploading it is cheap per call but not per
//! frame, so every table remembers what it was built from and only rebuilds
//! when that changes. Scalar-opacity tables used for compositing carry the
//! sample-distance correction, which is recomputed whenever the sampling
//! distances change even if the function itself did not.

use half::f16;
use volray_core::transfer_function::sanitize_range;
use volray_core::{
    BlendMode, ColorTransferFunction, ComponentProperty, PiecewiseFunction, TimeStamp,
    TransferFunction2D, TransferFunctionMode,
};

use crate::error::RenderResult;
use crate::gpu::{
    FilterMode, GpuBackend, TexelData, TexelFormat, TextureDesc, TextureDimension, TextureHandle,
};
use crate::units::{self, TextureUnits, UnitGuard};

/// Smallest width of a 1D table.
pub const MIN_TABLE_WIDTH: usize = 1024;

/// What a table maps to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TableKind {
    Color,
    ScalarOpacity,
    GradientOpacity,
    Transfer2D,
    LabelColor,
}

impl TableKind {
    fn format(self) -> TexelFormat {
        match self {
            TableKind::ScalarOpacity | TableKind::GradientOpacity => TexelFormat::R16Float,
            TableKind::Color | TableKind::Transfer2D | TableKind::LabelColor => {
                TexelFormat::Rgba16Float
            }
        }
    }
}

/// The function a table is sampled from.
///
/// Empty 1D functions are seeded with a default ramp, hence the mutable borrow.
#[derive(Debug)]
pub enum TableSource<'a> {
    Color(&'a mut ColorTransferFunction),
    Opacity(&'a mut PiecewiseFunction),
    Transfer2D(&'a TransferFunction2D),
}

impl TableSource<'_> {
    fn mtime(&self) -> TimeStamp {
        match self {
            TableSource::Color(f) => f.mtime(),
            TableSource::Opacity(f) => f.mtime(),
            TableSource::Transfer2D(f) => f.mtime(),
        }
    }

    fn seed(&mut self, range: [f64; 2]) {
        match self {
            TableSource::Color(f) => {
                f.ensure_default_ramp(range);
            }
            TableSource::Opacity(f) => {
                f.ensure_default_ramp(range);
            }
            TableSource::Transfer2D(_) => {}
        }
    }

    /// Ideal `(width, height)` before device clamping.
    fn ideal_size(&self, range: [f64; 2]) -> (usize, usize) {
        match self {
            TableSource::Color(f) => (
                f.estimate_min_number_of_samples(range)
                    .max(MIN_TABLE_WIDTH)
                    .next_power_of_two(),
                1,
            ),
            TableSource::Opacity(f) => (
                f.estimate_min_number_of_samples(range)
                    .max(MIN_TABLE_WIDTH)
                    .next_power_of_two(),
                1,
            ),
            TableSource::Transfer2D(f) => f.dimensions(),
        }
    }
}

/// Everything besides the function that a table's contents depend on.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TableRequest {
    pub range: [f64; 2],
    pub blend_mode: BlendMode,
    pub sample_distance: f64,
    pub unit_distance: f64,
    pub filter: FilterMode,
}

/// Inputs of the last build; a difference means the table is stale.
#[derive(Debug, Clone, Copy, PartialEq)]
struct BuildKey {
    function_mtime: TimeStamp,
    range: [f64; 2],
    /// Opacity correction in force, or `None` when none applies.
    correction: Option<(f64, f64)>,
}

/// One transfer function sampled into a texture.
#[derive(Debug)]
pub struct LookupTable {
    label: String,
    kind: TableKind,
    texture: Option<TextureHandle>,
    size: [u32; 2],
    filter: FilterMode,
    key: Option<BuildKey>,
    build_time: TimeStamp,
}

impl LookupTable {
    /// Creates an empty table; nothing is allocated until the first update.
    pub fn new(label: impl Into<String>, kind: TableKind) -> Self {
        Self {
            label: label.into(),
            kind,
            texture: None,
            size: [0, 0],
            filter: FilterMode::Linear,
            key: None,
            build_time: TimeStamp::default(),
        }
    }

    fn correction(&self, request: &TableRequest) -> Option<(f64, f64)> {
        let corrects = matches!(self.kind, TableKind::ScalarOpacity | TableKind::Transfer2D);
        (corrects && request.blend_mode.is_compositing())
            .then_some((request.sample_distance, request.unit_distance))
    }

    /// Brings the table up to date with `source`.
    ///
    /// Returns true if texels were uploaded. The texture is reallocated only
    /// when its size changes.
    pub fn update(
        &mut self,
        gpu: &mut dyn GpuBackend,
        mut source: TableSource<'_>,
        request: &TableRequest,
    ) -> RenderResult<bool> {
        let range = sanitize_range(request.range);
        source.seed(range);

        let key = BuildKey {
            function_mtime: source.mtime(),
            range,
            correction: self.correction(request),
        };
        if self.texture.is_some() && self.key == Some(key) {
            if let Some(texture) = self.texture.filter(|_| self.filter != request.filter) {
                gpu.set_texture_filter(texture, request.filter)?;
                self.filter = request.filter;
            }
            return Ok(false);
        }

        let limit = gpu.limits().max_texture_dimension_2d as usize;
        let (width, height) = source.ideal_size(range);
        #[allow(clippy::cast_possible_truncation)]
        let size = [width.clamp(1, limit) as u32, height.clamp(1, limit) as u32];
        let texels = self.sample(&source, range, size, key.correction);

        if self.texture.is_none() || self.size != size {
            self.release(gpu);
            let texture = gpu.create_texture(&TextureDesc {
                label: &self.label,
                dimension: TextureDimension::D2,
                size: [size[0], size[1], 1],
                format: self.kind.format(),
                filter: request.filter,
            })?;
            self.texture = Some(texture);
            self.size = size;
            self.filter = request.filter;
            log::debug!("{}: allocated {}x{} table", self.label, size[0], size[1]);
        } else if self.filter != request.filter {
            if let Some(texture) = self.texture {
                gpu.set_texture_filter(texture, request.filter)?;
            }
            self.filter = request.filter;
        }

        if let Some(texture) = self.texture {
            let result = gpu.write_texture(
                texture,
                [0; 3],
                [size[0], size[1], 1],
                TexelData::F16(&texels),
            );
            if let Err(err) = result {
                self.key = None;
                return Err(err);
            }
        }
        self.key = Some(key);
        self.build_time.modified();
        Ok(true)
    }

    #[allow(clippy::cast_possible_truncation)]
    fn sample(
        &self,
        source: &TableSource<'_>,
        range: [f64; 2],
        size: [u32; 2],
        correction: Option<(f64, f64)>,
    ) -> Vec<f16> {
        let width = size[0] as usize;
        let height = size[1] as usize;
        let correct = |a: f32| match correction {
            Some((sample, unit)) => opacity_correction(f64::from(a), sample, unit) as f32,
            None => a,
        };
        match source {
            TableSource::Color(f) => f
                .sample_table(range, width)
                .chunks_exact(3)
                .flat_map(|rgb| [rgb[0], rgb[1], rgb[2], 1.0])
                .map(f16::from_f32)
                .collect(),
            TableSource::Opacity(f) => f
                .sample_table(range, width)
                .into_iter()
                .map(|a| f16::from_f32(correct(a)))
                .collect(),
            TableSource::Transfer2D(f) => f
                .resample(width, height)
                .chunks_exact(4)
                .flat_map(|t| [t[0], t[1], t[2], correct(t[3])])
                .map(f16::from_f32)
                .collect(),
        }
    }

    /// Binds the table to a texture unit under sampler `name`.
    pub fn activate(
        &self,
        gpu: &mut dyn GpuBackend,
        units: &TextureUnits,
        name: &str,
    ) -> RenderResult<Option<UnitGuard>> {
        self.texture
            .map(|texture| units::activate(gpu, units, name, texture))
            .transpose()
    }

    /// The table's kind.
    pub fn kind(&self) -> TableKind {
        self.kind
    }

    /// Texture, once built.
    pub fn texture(&self) -> Option<TextureHandle> {
        self.texture
    }

    /// Current texture width and height.
    pub fn size(&self) -> [u32; 2] {
        self.size
    }

    /// When the contents were last uploaded.
    pub fn build_time(&self) -> TimeStamp {
        self.build_time
    }

    /// Frees the texture; the next update rebuilds it.
    pub fn release(&mut self, gpu: &mut dyn GpuBackend) {
        if let Some(texture) = self.texture.take() {
            gpu.release_texture(texture);
        }
        self.key = None;
        self.size = [0, 0];
    }
}

/// Opacity of one sample when sampling every `sample_distance` instead of
/// every `unit_distance`.
pub fn opacity_correction(alpha: f64, sample_distance: f64, unit_distance: f64) -> f64 {
    if unit_distance <= 0.0 {
        return alpha;
    }
    let alpha = alpha.clamp(0.0, 1.0);
    1.0 - (1.0 - alpha).powf(sample_distance / unit_distance)
}

/// Scalar spans the tables of one set are sampled over.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TableRanges {
    pub color: [f64; 2],
    pub opacity: [f64; 2],
    /// Gradient magnitude span.
    pub gradient: [f64; 2],
}

impl TableRanges {
    /// Color and opacity over `range`, gradient magnitude up to its width.
    pub fn uniform(range: [f64; 2]) -> Self {
        Self {
            color: range,
            opacity: range,
            gradient: [0.0, range[1] - range[0]],
        }
    }
}

/// Tables of one component.
#[derive(Debug)]
pub struct TableSet {
    pub color: LookupTable,
    pub opacity: LookupTable,
    pub gradient: LookupTable,
    pub transfer_2d: LookupTable,
}

/// Which tables of a set the shader samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct TableUsage {
    pub transfer_2d: bool,
    pub gradient_opacity: bool,
}

impl TableUsage {
    /// Tables a component needs under `mode`.
    pub fn for_component(component: &ComponentProperty, mode: TransferFunctionMode) -> Self {
        let transfer_2d = mode == TransferFunctionMode::TwoD && component.transfer_2d.is_some();
        Self {
            transfer_2d,
            gradient_opacity: !transfer_2d && component.gradient_opacity.is_some(),
        }
    }
}

impl TableSet {
    /// Empty tables labelled after `prefix`.
    pub fn new(prefix: &str) -> Self {
        Self {
            color: LookupTable::new(format!("{prefix}_color"), TableKind::Color),
            opacity: LookupTable::new(format!("{prefix}_opacity"), TableKind::ScalarOpacity),
            gradient: LookupTable::new(format!("{prefix}_gradient"), TableKind::GradientOpacity),
            transfer_2d: LookupTable::new(format!("{prefix}_tf2d"), TableKind::Transfer2D),
        }
    }

    /// Updates the tables `usage` selects; returns how many were uploaded.
    ///
    /// The range in `request` is replaced by the matching entry of `ranges`.
    pub fn update(
        &mut self,
        gpu: &mut dyn GpuBackend,
        component: &mut ComponentProperty,
        usage: TableUsage,
        request: &TableRequest,
        ranges: &TableRanges,
    ) -> RenderResult<usize> {
        let request = TableRequest {
            unit_distance: component.scalar_opacity_unit_distance,
            range: ranges.opacity,
            ..*request
        };
        let mut uploads = 0;
        if usage.transfer_2d {
            if let Some(tf) = component.transfer_2d.as_ref() {
                uploads += usize::from(self.transfer_2d.update(
                    gpu,
                    TableSource::Transfer2D(tf),
                    &request,
                )?);
            }
            return Ok(uploads);
        }

        let color_request = TableRequest {
            range: ranges.color,
            ..request
        };
        uploads += usize::from(self.color.update(
            gpu,
            TableSource::Color(&mut component.color),
            &color_request,
        )?);
        uploads += usize::from(self.opacity.update(
            gpu,
            TableSource::Opacity(&mut component.scalar_opacity),
            &request,
        )?);
        if usage.gradient_opacity {
            if let Some(gradient) = component.gradient_opacity.as_mut() {
                let gradient_request = TableRequest {
                    range: ranges.gradient,
                    ..request
                };
                uploads += usize::from(self.gradient.update(
                    gpu,
                    TableSource::Opacity(gradient),
                    &gradient_request,
                )?);
            }
        }
        Ok(uploads)
    }

    /// Frees every table.
    pub fn release(&mut self, gpu: &mut dyn GpuBackend) {
        self.color.release(gpu);
        self.opacity.release(gpu);
        self.gradient.release(gpu);
        self.transfer_2d.release(gpu);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::DeviceLimits;
    use crate::recording::RecordingBackend;
    use proptest::prelude::*;

    fn request(sample_distance: f64) -> TableRequest {
        TableRequest {
            range: [0.0, 255.0],
            blend_mode: BlendMode::Composite,
            sample_distance,
            unit_distance: 1.0,
            filter: FilterMode::Linear,
        }
    }

    fn ramp() -> PiecewiseFunction {
        PiecewiseFunction::ramp([0.0, 255.0], 0.0, 0.5)
    }

    #[test]
    fn test_second_update_is_a_no_op() {
        let mut gpu = RecordingBackend::new();
        let mut table = LookupTable::new("opacity", TableKind::ScalarOpacity);
        let mut f = ramp();
        assert!(table
            .update(&mut gpu, TableSource::Opacity(&mut f), &request(1.0))
            .unwrap());
        let uploads = gpu.stats().texture_uploads;
        assert!(!table
            .update(&mut gpu, TableSource::Opacity(&mut f), &request(1.0))
            .unwrap());
        assert_eq!(gpu.stats().texture_uploads, uploads);
    }

    #[test]
    fn test_sample_distance_changes_contents_not_size() {
        let mut gpu = RecordingBackend::new();
        let mut table = LookupTable::new("opacity", TableKind::ScalarOpacity);
        let mut f = ramp();
        table
            .update(&mut gpu, TableSource::Opacity(&mut f), &request(1.0))
            .unwrap();
        let texture = table.texture().unwrap();
        let before = gpu.texture(texture).unwrap().last_upload.clone();
        let size = table.size();

        table
            .update(&mut gpu, TableSource::Opacity(&mut f), &request(0.25))
            .unwrap();
        assert_eq!(table.texture(), Some(texture));
        assert_eq!(table.size(), size);
        assert_ne!(gpu.texture(texture).unwrap().last_upload, before);
        assert_eq!(gpu.stats().textures_created, 1);
    }

    #[test]
    fn test_non_compositing_ignores_sample_distance() {
        let mut gpu = RecordingBackend::new();
        let mut table = LookupTable::new("opacity", TableKind::ScalarOpacity);
        let mut f = ramp();
        let mip = |sd| TableRequest {
            blend_mode: BlendMode::MaximumIntensity,
            ..request(sd)
        };
        table.update(&mut gpu, TableSource::Opacity(&mut f), &mip(1.0)).unwrap();
        assert!(!table
            .update(&mut gpu, TableSource::Opacity(&mut f), &mip(0.5))
            .unwrap());
    }

    #[test]
    fn test_function_edit_and_range_change_rebuild() {
        let mut gpu = RecordingBackend::new();
        let mut table = LookupTable::new("color", TableKind::Color);
        let mut f = ColorTransferFunction::grayscale([0.0, 1.0]);
        table.update(&mut gpu, TableSource::Color(&mut f), &request(1.0)).unwrap();
        f.add_rgb_point(0.5, [1.0, 0.0, 0.0]);
        assert!(table.update(&mut gpu, TableSource::Color(&mut f), &request(1.0)).unwrap());
        let wider = TableRequest {
            range: [0.0, 512.0],
            ..request(1.0)
        };
        assert!(table.update(&mut gpu, TableSource::Color(&mut f), &wider).unwrap());
    }

    #[test]
    fn test_empty_function_seeded() {
        let mut gpu = RecordingBackend::new();
        let mut table = LookupTable::new("opacity", TableKind::ScalarOpacity);
        let mut f = PiecewiseFunction::new();
        table.update(&mut gpu, TableSource::Opacity(&mut f), &request(1.0)).unwrap();
        assert_eq!(f.len(), 2);
        assert_eq!(f.range(), Some([0.0, 255.0]));
    }

    #[test]
    fn test_dense_function_grows_table() {
        let mut gpu = RecordingBackend::new();
        let mut table = LookupTable::new("opacity", TableKind::ScalarOpacity);
        let mut f = PiecewiseFunction::new();
        f.add_point(0.0, 0.0);
        f.add_point(0.05, 1.0);
        f.add_point(255.0, 1.0);
        table.update(&mut gpu, TableSource::Opacity(&mut f), &request(1.0)).unwrap();
        assert_eq!(table.size(), [8192, 1]);

        let mut small = RecordingBackend::new().with_limits(DeviceLimits {
            max_texture_dimension_2d: 2048,
            ..DeviceLimits::default()
        });
        let mut clamped = LookupTable::new("opacity", TableKind::ScalarOpacity);
        clamped
            .update(&mut small, TableSource::Opacity(&mut f), &request(1.0))
            .unwrap();
        assert_eq!(clamped.size(), [2048, 1]);
    }

    #[test]
    fn test_table_set_2d_mode_uses_only_2d_table() {
        let mut gpu = RecordingBackend::new();
        let mut set = TableSet::new("v0");
        let mut component = ComponentProperty {
            transfer_2d: Some(TransferFunction2D::new(2, 2, vec![[1.0; 4]; 4]).unwrap()),
            ..ComponentProperty::default()
        };
        let usage = TableUsage::for_component(&component, TransferFunctionMode::TwoD);
        assert!(usage.transfer_2d);
        let uploads = set
            .update(
                &mut gpu,
                &mut component,
                usage,
                &request(1.0),
                &TableRanges::uniform([0.0, 1.0]),
            )
            .unwrap();
        assert_eq!(uploads, 1);
        assert_eq!(set.transfer_2d.size(), [2, 2]);
        assert!(set.color.texture().is_none());
    }

    #[test]
    fn test_release_frees_once() {
        let mut gpu = RecordingBackend::new();
        let mut table = LookupTable::new("opacity", TableKind::ScalarOpacity);
        let mut f = ramp();
        table.update(&mut gpu, TableSource::Opacity(&mut f), &request(1.0)).unwrap();
        table.release(&mut gpu);
        table.release(&mut gpu);
        assert_eq!(gpu.stats().textures_released, 1);
        assert!(table.update(&mut gpu, TableSource::Opacity(&mut f), &request(1.0)).unwrap());
    }

    proptest! {
        #[test]
        fn prop_correction_is_monotone_in_distance(
            alpha in 0.0_f64..1.0, d0 in 0.01_f64..4.0, d1 in 0.01_f64..4.0,
        ) {
            let (near, far) = if d0 < d1 { (d0, d1) } else { (d1, d0) };
            prop_assert!(opacity_correction(alpha, near, 1.0) <= opacity_correction(alpha, far, 1.0) + 1e-12);
            prop_assert!((opacity_correction(alpha, 1.0, 1.0) - alpha).abs() < 1e-12);
        }

        #[test]
        fn prop_table_width_is_power_of_two_with_floor(nodes in 2_usize..200) {
            let mut gpu = RecordingBackend::new();
            let mut f = PiecewiseFunction::new();
            for i in 0..nodes {
                #[allow(clippy::cast_precision_loss)]
                f.add_point(i as f64, 0.5);
            }
            let mut table = LookupTable::new("opacity", TableKind::ScalarOpacity);
            let req = TableRequest { range: [0.0, 1000.0], ..request(1.0) };
            table.update(&mut gpu, TableSource::Opacity(&mut f), &req).unwrap();
            let width = table.size()[0] as usize;
            prop_assert!(width.is_power_of_two());
            prop_assert!(width >= MIN_TABLE_WIDTH);
        }
    }
}
